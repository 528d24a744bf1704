//! Content admission rules.
//!
//! A frontend declares an ordered list of accept/reject rules, each
//! optionally guarded by a condition over the connection's buffered request
//! bytes. Evaluation is first-match-wins in declaration order. A guard that
//! cannot be decided yet (not enough bytes observed) defers the whole list:
//! the caller retries once more data arrives instead of skipping the rule.
//! A list exhausted with nothing pending accepts: absence of a matching
//! rule and absence of any rule are the same posture.

use std::net::SocketAddr;
use std::sync::Arc;

/// What a matched rule does with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Reject,
}

/// How a guard condition gates its rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Rule applies when the condition holds.
    If,
    /// Rule applies when the condition does not hold.
    Unless,
}

/// Three-valued result of evaluating a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    True,
    False,
    /// The required data is not available yet; the answer may still change.
    Indeterminate,
}

/// Outcome of evaluating a rule list against a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
    /// Some guard could not be decided; retry after more bytes arrive.
    Undecided,
}

/// A compiled guard condition, evaluated against a connection context.
///
/// Implementations live outside this module (the condition compiler is a
/// separate subsystem); the engine only relies on the three-valued verdict.
pub trait Condition: Send + Sync {
    fn eval(&self, ctx: &ConnContext) -> Verdict;
}

/// Guard attached to a rule.
#[derive(Clone)]
pub struct Guard {
    pub cond: Arc<dyn Condition>,
    pub polarity: Polarity,
}

/// One admission rule. Immutable once declared; owned by the frontend that
/// declared it.
#[derive(Clone)]
pub struct TcpRule {
    pub action: Action,
    pub guard: Option<Guard>,
}

impl TcpRule {
    /// A rule that always applies.
    pub fn unconditional(action: Action) -> Self {
        Self {
            action,
            guard: None,
        }
    }

    /// A rule gated by `cond` under the given polarity.
    pub fn guarded(action: Action, cond: Arc<dyn Condition>, polarity: Polarity) -> Self {
        Self {
            action,
            guard: Some(Guard { cond, polarity }),
        }
    }
}

/// Per-connection evaluation context: the bytes observed so far and whether
/// more may still arrive. Owned by its connection; discarded once a
/// terminal decision is reached.
pub struct ConnContext {
    peer: SocketAddr,
    buf: Vec<u8>,
    eof: bool,
}

impl ConnContext {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            buf: Vec::new(),
            eof: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Append freshly observed request bytes.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Mark that no more bytes will arrive (peer shutdown or buffer full);
    /// conditions become definitive from here on.
    pub fn freeze(&mut self) {
        self.eof = true;
    }

    /// Bytes buffered so far.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// True while the buffered request may still grow.
    pub fn may_grow(&self) -> bool {
        !self.eof
    }
}

/// A fetched attribute value with its caching contract.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub value: u64,
    /// Must be re-fetched on every evaluation.
    pub volatile: bool,
    /// The value may still change as more data arrives.
    pub may_change: bool,
}

/// Number of request bytes currently buffered for the connection.
///
/// Volatile, and flagged may-change while the connection is still reading:
/// callers must not cache it across reads.
pub fn fetch_req_len(ctx: &ConnContext) -> Sample {
    Sample {
        value: ctx.buffered().len() as u64,
        volatile: true,
        may_change: ctx.may_grow(),
    }
}

/// Comparison operator for [`ReqLenCmp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// Buffered length at least `n`.
    Ge,
    /// Buffered length below `n`.
    Lt,
}

/// Condition over the buffered request length.
///
/// While the buffer may still grow, a comparison that could flip once more
/// bytes arrive reports [`Verdict::Indeterminate`] rather than guessing.
#[derive(Debug, Clone, Copy)]
pub struct ReqLenCmp {
    pub op: CmpOp,
    pub n: u64,
}

impl Condition for ReqLenCmp {
    fn eval(&self, ctx: &ConnContext) -> Verdict {
        let sample = fetch_req_len(ctx);
        match self.op {
            CmpOp::Ge => {
                if sample.value >= self.n {
                    Verdict::True
                } else if sample.may_change {
                    Verdict::Indeterminate
                } else {
                    Verdict::False
                }
            }
            CmpOp::Lt => {
                if sample.value >= self.n {
                    Verdict::False
                } else if sample.may_change {
                    Verdict::Indeterminate
                } else {
                    Verdict::True
                }
            }
        }
    }
}

/// Evaluate a rule list against the current connection state.
///
/// First match wins; a guard the evaluator cannot decide yet makes the
/// whole list [`Decision::Undecided`]. An exhausted list accepts.
pub fn evaluate(rules: &[TcpRule], ctx: &ConnContext) -> Decision {
    for rule in rules {
        let applies = match &rule.guard {
            None => true,
            Some(guard) => match (guard.cond.eval(ctx), guard.polarity) {
                (Verdict::Indeterminate, _) => return Decision::Undecided,
                (Verdict::True, Polarity::If) | (Verdict::False, Polarity::Unless) => true,
                _ => false,
            },
        };
        if applies {
            return match rule.action {
                Action::Accept => Decision::Accept,
                Action::Reject => Decision::Reject,
            };
        }
    }
    Decision::Accept
}
