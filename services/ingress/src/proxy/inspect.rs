//! Inspection delay: bounding how long admission waits for request bytes.
//!
//! A frontend may allow admission to wait for more data before its rules
//! are forced to a decision. The scheduler is a small state machine driven
//! by two events (bytes arrived, deadline fired), and the async driver
//! feeds it from a stream under tokio deadline control. Rule conditions are
//! pure functions of the buffered state, so every re-evaluation runs from
//! the start of the rule list.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::rules::{evaluate, ConnContext, Decision, TcpRule};

/// Default cap on bytes buffered for inspection.
pub const DEFAULT_MAX_INSPECT_BYTES: usize = 8192;

/// Read chunk size for the inspection loop.
const READ_CHUNK: usize = 4096;

/// Per-frontend inspection settings.
#[derive(Debug, Clone)]
pub struct InspectionConfig {
    /// Maximum time to wait for more request bytes. `None` means rules are
    /// evaluated once with whatever is available at accept time, no wait.
    pub delay: Option<Duration>,
    /// Maximum bytes buffered before the decision is forced.
    pub max_buffer: usize,
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            delay: None,
            max_buffer: DEFAULT_MAX_INSPECT_BYTES,
        }
    }
}

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectState {
    /// No terminal decision yet; delay budget not exhausted.
    Waiting,
    /// Rules produced a terminal decision.
    Decided(Decision),
    /// Delay elapsed while still undecided; the default decision applies.
    TimedOut,
}

/// Drives rule evaluation to a terminal decision, at most once.
///
/// Events arriving after the terminal transition are no-ops: late data
/// cannot produce a second decision, and a late deadline cannot override an
/// earlier match.
#[derive(Debug)]
pub struct InspectionScheduler {
    state: InspectState,
}

impl InspectionScheduler {
    pub fn new() -> Self {
        Self {
            state: InspectState::Waiting,
        }
    }

    pub fn state(&self) -> InspectState {
        self.state
    }

    /// The terminal decision, once one exists. A timeout folds to the same
    /// implicit accept as an exhausted rule list.
    pub fn decision(&self) -> Option<Decision> {
        match self.state {
            InspectState::Waiting => None,
            InspectState::Decided(d) => Some(d),
            InspectState::TimedOut => Some(Decision::Accept),
        }
    }

    /// New bytes were observed: re-evaluate the rule list from the start.
    /// Returns the decision exactly when this call produced it.
    pub fn on_data(&mut self, rules: &[TcpRule], ctx: &ConnContext) -> Option<Decision> {
        if self.state != InspectState::Waiting {
            return None;
        }
        match evaluate(rules, ctx) {
            Decision::Undecided => None,
            decision => {
                self.state = InspectState::Decided(decision);
                Some(decision)
            }
        }
    }

    /// The delay budget is exhausted: force the default decision. Returns
    /// it exactly when this call produced the transition.
    pub fn on_deadline(&mut self) -> Option<Decision> {
        if self.state != InspectState::Waiting {
            return None;
        }
        self.state = InspectState::TimedOut;
        Some(Decision::Accept)
    }
}

impl Default for InspectionScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Run admission inspection over a freshly accepted stream.
///
/// Reads request bytes into `ctx` and re-evaluates `rules` per arrival
/// until a terminal decision, the inspection delay, end of input, or the
/// buffer cap, whichever comes first. Bytes consumed here stay in `ctx`
/// for the caller to forward.
pub async fn inspect_stream<R: AsyncRead + Unpin>(
    stream: &mut R,
    rules: &[TcpRule],
    config: &InspectionConfig,
    ctx: &mut ConnContext,
) -> io::Result<Decision> {
    let mut sched = InspectionScheduler::new();

    let deadline = match config.delay {
        Some(delay) => Instant::now() + delay,
        None => {
            // No waiting allowed: decide on whatever is already there.
            if let Some(decision) = sched.on_data(rules, ctx) {
                return Ok(decision);
            }
            let forced = sched.on_deadline().unwrap_or(Decision::Accept);
            return Ok(forced);
        }
    };

    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if let Some(decision) = sched.on_data(rules, ctx) {
            return Ok(decision);
        }

        let room = config.max_buffer.saturating_sub(ctx.buffered().len());
        if room == 0 {
            // Buffer full: nothing further can be observed.
            ctx.freeze();
            let decision = sched
                .on_data(rules, ctx)
                .or_else(|| sched.on_deadline())
                .unwrap_or(Decision::Accept);
            return Ok(decision);
        }

        let want = room.min(chunk.len());
        match timeout_at(deadline, stream.read(&mut chunk[..want])).await {
            Err(_) => {
                debug!(
                    buffered = ctx.buffered().len(),
                    "Inspection delay elapsed, forcing decision"
                );
                let forced = sched.on_deadline().unwrap_or(Decision::Accept);
                return Ok(forced);
            }
            Ok(Ok(0)) => {
                ctx.freeze();
                let decision = sched
                    .on_data(rules, ctx)
                    .or_else(|| sched.on_deadline())
                    .unwrap_or(Decision::Accept);
                return Ok(decision);
            }
            Ok(Ok(n)) => {
                ctx.push_bytes(&chunk[..n]);
            }
            Ok(Err(e)) => return Err(e),
        }
    }
}
