//! Per-address-family listener registries.
//!
//! The set of stream protocol families is closed: TCP over IPv4 and TCP
//! over IPv6. Each family owns an insertion-ordered collection of the
//! listeners it has claimed and drives batch operations over them. Binding
//! honors configuration order and stops the batch the moment an abort-class
//! failure is accumulated; listeners already bound stay bound (partial
//! success is a valid terminal state, there is no rollback).

use std::net::SocketAddr;

use edge_report::{DiagBuf, ErrorCode, Severity};
use tracing::{debug, error, info, warn};

use super::events::EventRegistry;
use super::listener::{bind_listener_with, Limits, Listener, ListenerState};
use super::sock::{SockApi, SysSock};

/// Address family of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Family {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V4 => f.write_str("ipv4"),
            Family::V6 => f.write_str("ipv6"),
        }
    }
}

/// Capability surface of one protocol family.
pub trait Protocol: Send {
    /// Protocol name for diagnostics ("tcpv4"/"tcpv6").
    fn name(&self) -> &'static str;

    fn family(&self) -> Family;

    /// Number of listeners this family has claimed.
    fn listener_count(&self) -> usize;

    /// Claim a listener. Only an `Init` listener is admitted (and advanced
    /// to `Assigned`); anything else is handed back untouched, so repeated
    /// or misdirected adds cannot re-transition a listener.
    fn add_listener(&mut self, listener: Listener) -> Result<(), Listener>;

    /// Bind every claimed listener in insertion order, combining the
    /// returned codes. Stops early once the accumulated code carries
    /// `ABORT`; later listeners are intentionally left unbound.
    fn bind_all(&mut self, limits: &Limits, events: &dyn EventRegistry) -> ErrorCode;

    /// Close every listening socket and return those listeners to
    /// `Assigned`, revoking their event registrations.
    fn unbind_all(&mut self, events: &dyn EventRegistry) -> ErrorCode;

    /// Bound addresses of the listeners currently in `Listen` state.
    fn bound_addrs(&self) -> Vec<SocketAddr>;
}

/// Shared state and behavior behind both family implementations.
struct FamilyListeners {
    family: Family,
    proto_name: &'static str,
    listeners: Vec<Listener>,
}

impl FamilyListeners {
    fn new(family: Family, proto_name: &'static str) -> Self {
        Self {
            family,
            proto_name,
            listeners: Vec::new(),
        }
    }

    fn add(&mut self, mut listener: Listener) -> Result<(), Listener> {
        debug_assert_eq!(listener.family(), self.family);
        if !listener.assign() {
            return Err(listener);
        }
        debug!(
            proto = self.proto_name,
            listener = %listener.name(),
            addr = %listener.addr(),
            "Listener assigned"
        );
        self.listeners.push(listener);
        Ok(())
    }

    fn bind_all(&mut self, api: &dyn SockApi, limits: &Limits, events: &dyn EventRegistry) -> ErrorCode {
        let mut err = ErrorCode::NONE;

        for listener in &mut self.listeners {
            let mut diag = DiagBuf::with_capacity(256);
            let code = bind_listener_with(api, listener, limits, events, &mut diag);

            if let Some(msg) = diag.message() {
                match code.severity() {
                    Severity::Alert => error!(
                        proto = self.proto_name,
                        listener = %listener.name(),
                        addr = %listener.addr(),
                        detail = msg,
                        "Listener bind problem"
                    ),
                    Severity::Warning => warn!(
                        proto = self.proto_name,
                        listener = %listener.name(),
                        addr = %listener.addr(),
                        detail = msg,
                        "Listener bind warning"
                    ),
                    Severity::Quiet => debug!(
                        proto = self.proto_name,
                        listener = %listener.name(),
                        detail = msg,
                        "Listener bind note"
                    ),
                }
            } else if code.is_none() && listener.state() == ListenerState::Listen {
                info!(
                    proto = self.proto_name,
                    listener = %listener.name(),
                    addr = %listener.addr(),
                    "Listener bound"
                );
            }

            err |= code;
            if err.contains(ErrorCode::ABORT) {
                break;
            }
        }

        err
    }

    fn unbind_all(&mut self, events: &dyn EventRegistry) -> ErrorCode {
        for listener in &mut self.listeners {
            if listener.state() == ListenerState::Listen {
                events.unregister(listener.id());
                listener.release();
                info!(
                    proto = self.proto_name,
                    listener = %listener.name(),
                    addr = %listener.addr(),
                    "Listener unbound"
                );
            }
        }
        ErrorCode::NONE
    }

    fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter(|l| l.state() == ListenerState::Listen)
            .filter_map(|l| l.local_addr())
            .collect()
    }
}

macro_rules! family_protocol {
    ($name:ident, $family:expr, $proto_name:literal) => {
        pub struct $name {
            inner: FamilyListeners,
        }

        impl $name {
            pub fn new() -> Self {
                Self {
                    inner: FamilyListeners::new($family, $proto_name),
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Protocol for $name {
            fn name(&self) -> &'static str {
                self.inner.proto_name
            }

            fn family(&self) -> Family {
                self.inner.family
            }

            fn listener_count(&self) -> usize {
                self.inner.listeners.len()
            }

            fn add_listener(&mut self, listener: Listener) -> Result<(), Listener> {
                self.inner.add(listener)
            }

            fn bind_all(&mut self, limits: &Limits, events: &dyn EventRegistry) -> ErrorCode {
                self.inner.bind_all(&SysSock, limits, events)
            }

            fn unbind_all(&mut self, events: &dyn EventRegistry) -> ErrorCode {
                self.inner.unbind_all(events)
            }

            fn bound_addrs(&self) -> Vec<SocketAddr> {
                self.inner.bound_addrs()
            }
        }
    };
}

family_protocol!(TcpV4, Family::V4, "tcpv4");
family_protocol!(TcpV6, Family::V6, "tcpv6");

#[cfg(test)]
impl TcpV4 {
    pub(crate) fn bind_all_with(
        &mut self,
        api: &dyn SockApi,
        limits: &Limits,
        events: &dyn EventRegistry,
    ) -> ErrorCode {
        self.inner.bind_all(api, limits, events)
    }

    pub(crate) fn listener_states(&self) -> Vec<ListenerState> {
        self.inner.listeners.iter().map(|l| l.state()).collect()
    }
}
