//! Listener lifecycle and the bind state machine.
//!
//! A [`Listener`] is one configured bind point. It is parsed into `Init`
//! state, claimed by exactly one family registry (`Assigned`), and driven to
//! `Listen` by [`bind_listener`], which owns the whole socket setup
//! sequence: create, capacity check, non-blocking + nodelay, best-effort
//! reuse options, optional transparent toggle, bind, listen, event-layer
//! registration. Every step has its own failure classification; every
//! failure path after socket creation releases the descriptor before
//! returning.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use edge_report::{DiagBuf, ErrorCode};

use super::events::EventRegistry;
use super::protocol::Family;
use super::sock::{SockApi, SysSock};

/// Default process-wide socket-table capacity.
pub const DEFAULT_MAX_SOCKETS: i32 = 4096;

/// Identifies a listener to the event layer as the owner of its handle,
/// distinct from ordinary per-connection handles owned by connection tasks.
pub type ListenerId = u64;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Callback invoked by the event layer for each accepted connection.
pub type AcceptCallback = Arc<dyn Fn(tokio::net::TcpStream, SocketAddr) + Send + Sync>;

/// Process-wide resource ceilings consulted during binding.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Highest admissible descriptor slot; a listening socket at or above
    /// this is a configuration-sizing problem, not a transient one.
    pub max_sockets: i32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_sockets: DEFAULT_MAX_SOCKETS,
        }
    }
}

/// Lifecycle state of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Parsed, not yet claimed by a protocol family.
    Init,
    /// Claimed by a family registry, queued for binding.
    Assigned,
    /// Socket open and accepting.
    Listen,
}

/// Per-listener option toggles.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerOptions {
    /// Disable lingering on close for accepted traffic.
    pub nolinger: bool,
    /// Listener may receive traffic for addresses the host does not own;
    /// ask for the transparent capability at bind time.
    pub foreign: bool,
}

/// One configured bind point.
pub struct Listener {
    id: ListenerId,
    name: String,
    addr: SocketAddr,
    options: ListenerOptions,
    backlog: Option<i32>,
    maxconn: u32,
    accept: AcceptCallback,
    state: ListenerState,
    sock: Option<StdTcpListener>,
}

impl Listener {
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        options: ListenerOptions,
        maxconn: u32,
        accept: AcceptCallback,
    ) -> Self {
        Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            addr,
            options,
            backlog: None,
            maxconn,
            accept,
            state: ListenerState::Init,
            sock: None,
        }
    }

    /// Explicit accept backlog; without one, `maxconn` is used.
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Actual bound address once listening (resolves an ephemeral port).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Claim the listener for a registry. Only an `Init` listener moves to
    /// `Assigned`; any other state is left untouched.
    pub(crate) fn assign(&mut self) -> bool {
        if self.state != ListenerState::Init {
            return false;
        }
        self.state = ListenerState::Assigned;
        true
    }

    /// Release the bound socket and fall back to `Assigned`.
    pub(crate) fn release(&mut self) {
        if self.state == ListenerState::Listen {
            self.sock = None;
            self.state = ListenerState::Assigned;
        }
    }
}

/// Drive one listener from `Assigned` to `Listen`.
///
/// Writes at most one message into `diag`; a sink buffer suppresses
/// messages without affecting the returned code. A listener not in
/// `Assigned` state (already bound, or never claimed) returns `NONE` with
/// no side effect.
pub fn bind_listener(
    listener: &mut Listener,
    limits: &Limits,
    events: &dyn EventRegistry,
    diag: &mut DiagBuf,
) -> ErrorCode {
    bind_listener_with(&SysSock, listener, limits, events, diag)
}

pub(crate) fn bind_listener_with(
    api: &dyn SockApi,
    listener: &mut Listener,
    limits: &Limits,
    events: &dyn EventRegistry,
    diag: &mut DiagBuf,
) -> ErrorCode {
    // Never report a stale message from an earlier operation.
    diag.clear();

    if listener.state != ListenerState::Assigned {
        return ErrorCode::NONE;
    }

    let mut err = ErrorCode::NONE;

    let sock = match api.open_stream(listener.family()) {
        Ok(sock) => sock,
        Err(e) => {
            diag.set(&format!("cannot create listening socket: {e}"));
            return err | ErrorCode::RETRYABLE | ErrorCode::ALERT;
        }
    };

    // From here on `sock` is dropped (closed) on every early return.

    if sock.slot() >= limits.max_sockets {
        diag.set("not enough free sockets (raise EDGE_MAX_SOCKETS)");
        return err | ErrorCode::FATAL | ErrorCode::ABORT | ErrorCode::ALERT;
    }

    if sock.set_nonblocking().is_err() || sock.set_nodelay().is_err() {
        diag.set("cannot make socket non-blocking");
        return err | ErrorCode::FATAL | ErrorCode::ALERT;
    }

    if sock.set_reuse_addr().is_err() {
        diag.set("cannot do so_reuseaddr");
        err |= ErrorCode::ALERT;
    }

    if sock.set_reuse_port().is_err() {
        diag.set("cannot do so_reuseport");
        err |= ErrorCode::ALERT;
    }

    if listener.options.nolinger && sock.disable_linger().is_err() {
        diag.set("cannot disable linger");
        err |= ErrorCode::ALERT;
    }

    if listener.options.foreign && sock.set_transparent().is_err() {
        diag.set("cannot make listening socket transparent");
        err |= ErrorCode::ALERT;
    }

    if let Err(e) = sock.bind(listener.addr) {
        diag.set(&format!("cannot bind socket: {e}"));
        return err | ErrorCode::RETRYABLE | ErrorCode::ALERT;
    }

    let backlog = listener.backlog.unwrap_or(listener.maxconn as i32);
    if let Err(e) = sock.listen(backlog) {
        diag.set(&format!("cannot listen to socket: {e}"));
        return err | ErrorCode::RETRYABLE | ErrorCode::ALERT;
    }

    let std_listener = match sock.into_listener() {
        Ok(l) => l,
        Err(e) => {
            diag.set(&format!("cannot take over listening socket: {e}"));
            return err | ErrorCode::RETRYABLE | ErrorCode::ALERT;
        }
    };

    // Register a duplicate handle for readability; the listener keeps the
    // original. Only the read side is ever registered for listening sockets.
    let registered = std_listener
        .try_clone()
        .and_then(|dup| events.register_readable(dup, listener.id, listener.accept.clone()));
    if let Err(e) = registered {
        diag.set(&format!("cannot register listening socket: {e}"));
        return err | ErrorCode::RETRYABLE | ErrorCode::ALERT;
    }

    listener.sock = Some(std_listener);
    listener.state = ListenerState::Listen;
    err
}
