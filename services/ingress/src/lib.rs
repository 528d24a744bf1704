//! edgegate ingress: TCP listener binding and connection admission.
//!
//! This crate owns listening sockets from configuration through to an
//! accepting, event-registered handle (including transparent binding to
//! foreign addresses), plus the `tcp-request content` admission rules that
//! decide each connection's fate over its first bytes.

pub mod config;
pub mod frontend;
pub mod proxy;

pub use frontend::{
    parse_tcp_request, parse_time, CondError, CondParser, ParseOutcome, ProxyCaps, ProxySection,
    ReqLenConds, TimeParseError,
};
pub use proxy::{
    bind_listener, bind_with_source, evaluate, fetch_req_len, inspect_stream, AcceptCallback,
    Action, CmpOp, Condition, ConnContext, Decision, EventRegistry, Family, ForeignMode, Guard,
    InspectState, InspectionConfig, InspectionScheduler, Limits, Listener, ListenerId,
    ListenerOptions, ListenerState, Polarity, Protocol, ReqLenCmp, Sample, SourceBindError,
    TcpRule, TcpV4, TcpV6, TokioEvents, Verdict,
};
