//! TCP listener binding and connection admission.
//!
//! This module owns the life of a listening socket from configuration-time
//! assignment to an accepting, registered handle, plus the admission
//! decision taken over each connection's first bytes:
//!
//! ```text
//! Config -> Listener(Init) -> Protocol registry (Assigned)
//!                                   |  bind_all
//!                                   v
//!                             bound socket (Listen) -> event layer
//!                                   |  accept
//!                                   v
//!                        InspectionScheduler + rules -> Accept / Reject
//! ```
//!
//! Byte forwarding after admission, condition compilation and session
//! construction are collaborating subsystems reached through the seams
//! exposed here ([`EventRegistry`], [`Condition`], [`AcceptCallback`]).

mod events;
mod foreign;
mod inspect;
mod listener;
mod protocol;
mod rules;
mod sock;

pub use events::{EventRegistry, TokioEvents};
pub use foreign::{bind_with_source, ForeignMode, SourceBindError};
pub use inspect::{
    inspect_stream, InspectState, InspectionConfig, InspectionScheduler,
    DEFAULT_MAX_INSPECT_BYTES,
};
pub use listener::{
    bind_listener, AcceptCallback, Limits, Listener, ListenerId, ListenerOptions, ListenerState,
    DEFAULT_MAX_SOCKETS,
};
pub use protocol::{Family, Protocol, TcpV4, TcpV6};
pub use rules::{
    evaluate, fetch_req_len, Action, CmpOp, Condition, ConnContext, Decision, Guard, Polarity,
    ReqLenCmp, Sample, TcpRule, Verdict,
};
