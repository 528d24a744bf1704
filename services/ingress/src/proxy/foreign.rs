//! Foreign (transparent) source binding.
//!
//! Transparent proxying needs sockets bound to addresses the host does not
//! own, so the peer sees traffic to/from the original client or server
//! address. The kernel offers more than one way to get there; this module
//! tries them in a fixed priority order with fallback:
//!
//! 1. Direct transparent bind (`IP_TRANSPARENT`, then `IP_FREEBIND`): ask
//!    the kernel to treat an arbitrary address as bindable. Gated by a
//!    process-wide capability flag that is cleared permanently the first
//!    time the kernel refuses, so later binds skip the doomed syscall.
//! 2. Bind the plain local address, then mark the socket (`SO_MARK`) so a
//!    TPROXY policy-routing rule captures traffic for the foreign address.
//!
//! Callers must be able to tell a plain local-bind failure from a missing
//! foreign capability: the former usually kills the listener, the latter is
//! a configuration problem worth a different message. Hence the two-valued
//! [`SourceBindError`].

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use socket2::{SockAddr, Socket};
use thiserror::Error;

/// Mark applied by the capture fallback; the companion TPROXY routing rule
/// matches on it.
#[cfg(target_os = "linux")]
const CAPTURE_MARK: u32 = 0x1;

/// One-shot capability flag for the direct transparent bind strategy.
/// Default enabled, cleared at most once, never reset. A race between two
/// binds only costs one redundant failing syscall.
static TRANSPARENT_USABLE: AtomicBool = AtomicBool::new(true);

/// Which parts of the remote address to bind in place of the local one.
///
/// `NONE` requests a plain local bind; the remote address (if any) is
/// ignored entirely. `ADDR` and `PORT` combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForeignMode(u8);

impl ForeignMode {
    /// Plain local bind; no foreign binding requested.
    pub const NONE: ForeignMode = ForeignMode(0);
    /// Use the remote address's host part.
    pub const ADDR: ForeignMode = ForeignMode(1);
    /// Use the remote address's port part.
    pub const PORT: ForeignMode = ForeignMode(2);

    /// True when any foreign part was requested.
    pub fn any(self) -> bool {
        self.0 != 0
    }

    fn wants_addr(self) -> bool {
        self.0 & Self::ADDR.0 != 0
    }

    fn wants_port(self) -> bool {
        self.0 & Self::PORT.0 != 0
    }
}

impl std::ops::BitOr for ForeignMode {
    type Output = ForeignMode;

    fn bitor(self, rhs: ForeignMode) -> ForeignMode {
        ForeignMode(self.0 | rhs.0)
    }
}

/// Why a source bind failed. Local and foreign failures carry different
/// remediation, so they are distinct variants rather than a boolean.
#[derive(Debug, Error)]
pub enum SourceBindError {
    /// The plain local address could not be bound.
    #[error("cannot bind to local address: {0}")]
    Local(#[source] io::Error),

    /// The foreign address could not be bound, or no foreign-bind
    /// mechanism is available.
    #[error("cannot bind to foreign address: {0}")]
    Foreign(#[source] io::Error),
}

/// Bind `sock` to `local`, or to the parts of `remote` selected by `mode`.
///
/// With `mode == NONE` this is exactly a local bind with `SO_REUSEADDR`,
/// whatever `remote` holds. Otherwise the strategy chain above runs; if no
/// strategy can make the foreign address stick, the error is
/// [`SourceBindError::Foreign`].
pub fn bind_with_source(
    sock: &Socket,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    mode: ForeignMode,
) -> Result<(), SourceBindError> {
    bind_with_source_inner(
        sock,
        local,
        remote,
        mode,
        try_transparent,
        try_capture_mark,
        &TRANSPARENT_USABLE,
    )
}

/// Strategy-injectable core of [`bind_with_source`].
fn bind_with_source_inner(
    sock: &Socket,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    mode: ForeignMode,
    transparent: impl FnOnce(&Socket) -> bool,
    capture: impl FnOnce(&Socket) -> bool,
    usable: &AtomicBool,
) -> Result<(), SourceBindError> {
    let mut foreign_ok = false;

    if mode.any() && usable.load(Ordering::Relaxed) {
        if transparent(sock) {
            foreign_ok = true;
        } else {
            usable.store(false, Ordering::Relaxed);
        }
    }

    let _ = sock.set_reuse_address(true);

    if foreign_ok {
        let merged = merge_source(local, remote, mode);
        sock.bind(&SockAddr::from(merged))
            .map_err(SourceBindError::Foreign)?;
    } else {
        sock.bind(&SockAddr::from(local))
            .map_err(SourceBindError::Local)?;
    }

    if !mode.any() {
        return Ok(());
    }

    if !foreign_ok && capture(sock) {
        foreign_ok = true;
    }

    if !foreign_ok {
        return Err(SourceBindError::Foreign(io::Error::new(
            io::ErrorKind::Unsupported,
            "no foreign bind mechanism available",
        )));
    }

    Ok(())
}

/// Merge the requested remote parts onto a zeroed base address of the
/// local family. Parts not requested (or with no remote supplied) stay
/// zeroed, which the transparent bind accepts as a wildcard.
fn merge_source(local: SocketAddr, remote: Option<SocketAddr>, mode: ForeignMode) -> SocketAddr {
    let mut ip: IpAddr = match local {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let mut port = 0u16;

    if let Some(remote) = remote {
        if mode.wants_addr() {
            ip = remote.ip();
        }
        if mode.wants_port() {
            port = remote.port();
        }
    }

    SocketAddr::new(ip, port)
}

#[cfg(target_os = "linux")]
fn try_transparent(sock: &Socket) -> bool {
    sock.set_ip_transparent(true).is_ok() || sock.set_freebind(true).is_ok()
}

#[cfg(not(target_os = "linux"))]
fn try_transparent(_sock: &Socket) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn try_capture_mark(sock: &Socket) -> bool {
    use std::os::fd::AsRawFd;

    let mark: libc::c_int = CAPTURE_MARK as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &mark as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    ret == 0
}

#[cfg(not(target_os = "linux"))]
fn try_capture_mark(_sock: &Socket) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Type};

    fn stream_socket() -> Socket {
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap()
    }

    fn loopback_any() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_mode_none_is_plain_local_bind() {
        // Strategies must never run; remote value must be irrelevant.
        for remote in [None, Some("192.0.2.9:7777".parse().unwrap())] {
            let sock = stream_socket();
            let flag = AtomicBool::new(true);
            let result = bind_with_source_inner(
                &sock,
                loopback_any(),
                remote,
                ForeignMode::NONE,
                |_| panic!("transparent strategy consulted for mode NONE"),
                |_| panic!("capture strategy consulted for mode NONE"),
                &flag,
            );
            assert!(result.is_ok());
            assert!(flag.load(Ordering::Relaxed));
            let bound = sock.local_addr().unwrap().as_socket().unwrap();
            assert!(bound.ip().is_loopback());
        }
    }

    #[test]
    fn test_local_bind_failure_is_local_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let sock = stream_socket();
        let flag = AtomicBool::new(true);
        let result = bind_with_source_inner(
            &sock,
            addr,
            None,
            ForeignMode::NONE,
            |_| false,
            |_| false,
            &flag,
        );
        match result {
            Err(SourceBindError::Local(_)) => {}
            other => panic!("Expected Local error, got {:?}", other),
        }
    }

    #[test]
    fn test_transparent_strategy_binds_merged_address() {
        // Loopback /8 is locally bindable, so a faked "transparent works"
        // verdict lets the merged address bind for real.
        let sock = stream_socket();
        let flag = AtomicBool::new(true);
        let remote: SocketAddr = "127.0.0.3:4567".parse().unwrap();
        let result = bind_with_source_inner(
            &sock,
            loopback_any(),
            Some(remote),
            ForeignMode::ADDR | ForeignMode::PORT,
            |_| true,
            |_| panic!("capture strategy must not run when transparent works"),
            &flag,
        );
        assert!(result.is_ok());
        let bound = sock.local_addr().unwrap().as_socket().unwrap();
        assert_eq!(bound, remote);
    }

    #[test]
    fn test_port_only_merge_keeps_wildcard_host() {
        let sock = stream_socket();
        let flag = AtomicBool::new(true);
        let remote: SocketAddr = "127.0.0.3:4567".parse().unwrap();
        let result = bind_with_source_inner(
            &sock,
            loopback_any(),
            Some(remote),
            ForeignMode::PORT,
            |_| true,
            |_| false,
            &flag,
        );
        assert!(result.is_ok());
        let bound = sock.local_addr().unwrap().as_socket().unwrap();
        assert!(bound.ip().is_unspecified());
        assert_eq!(bound.port(), 4567);
    }

    #[test]
    fn test_refused_transparent_clears_flag_and_falls_back() {
        let sock = stream_socket();
        let flag = AtomicBool::new(true);
        let result = bind_with_source_inner(
            &sock,
            loopback_any(),
            Some("192.0.2.9:7777".parse().unwrap()),
            ForeignMode::ADDR | ForeignMode::PORT,
            |_| false,
            |_| true,
            &flag,
        );
        // Capture fallback accepted the socket: bound locally, annotated.
        assert!(result.is_ok());
        assert!(!flag.load(Ordering::Relaxed), "capability flag must clear");
        let bound = sock.local_addr().unwrap().as_socket().unwrap();
        assert!(bound.ip().is_loopback());
    }

    #[test]
    fn test_cleared_flag_skips_transparent_strategy() {
        let sock = stream_socket();
        let flag = AtomicBool::new(false);
        let result = bind_with_source_inner(
            &sock,
            loopback_any(),
            Some("192.0.2.9:7777".parse().unwrap()),
            ForeignMode::ADDR,
            |_| panic!("transparent strategy must be skipped once disabled"),
            |_| true,
            &flag,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_no_mechanism_is_foreign_error() {
        let sock = stream_socket();
        let flag = AtomicBool::new(true);
        let result = bind_with_source_inner(
            &sock,
            loopback_any(),
            Some("192.0.2.9:7777".parse().unwrap()),
            ForeignMode::ADDR | ForeignMode::PORT,
            |_| false,
            |_| false,
            &flag,
        );
        match result {
            Err(SourceBindError::Foreign(_)) => {}
            other => panic!("Expected Foreign error, got {:?}", other),
        }
        // The local bind itself succeeded; only the foreign capability is
        // missing, and the error class says so.
    }
}
