//! Syscall surface used by the listener bind path.
//!
//! The binder drives a socket through creation, option configuration, bind
//! and listen via the [`SockApi`]/[`SockHandle`] pair so tests can account
//! for every descriptor on every failure path. The production implementation
//! wraps [`socket2::Socket`]; dropping a handle closes the descriptor, which
//! is what makes the no-leak guarantee hold on early returns.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::protocol::Family;

/// Opens stream sockets for a given address family.
pub(crate) trait SockApi {
    fn open_stream(&self, family: Family) -> io::Result<Box<dyn SockHandle>>;
}

/// One not-yet-listening stream socket. Dropping the handle closes it.
pub(crate) trait SockHandle {
    /// Descriptor slot, compared against the process socket-table capacity.
    fn slot(&self) -> i32;

    fn set_nonblocking(&self) -> io::Result<()>;
    fn set_nodelay(&self) -> io::Result<()>;
    fn set_reuse_addr(&self) -> io::Result<()>;
    fn set_reuse_port(&self) -> io::Result<()>;
    fn disable_linger(&self) -> io::Result<()>;
    fn set_transparent(&self) -> io::Result<()>;
    fn bind(&self, addr: SocketAddr) -> io::Result<()>;
    fn listen(&self, backlog: i32) -> io::Result<()>;

    /// Hand the configured, listening socket over as a standard listener.
    fn into_listener(self: Box<Self>) -> io::Result<StdTcpListener>;
}

/// Production implementation over real sockets.
pub(crate) struct SysSock;

impl SockApi for SysSock {
    fn open_stream(&self, family: Family) -> io::Result<Box<dyn SockHandle>> {
        let domain = match family {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        };
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        Ok(Box::new(SysHandle { sock }))
    }
}

struct SysHandle {
    sock: Socket,
}

impl SockHandle for SysHandle {
    fn slot(&self) -> i32 {
        self.sock.as_raw_fd()
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        self.sock.set_nonblocking(true)
    }

    fn set_nodelay(&self) -> io::Result<()> {
        self.sock.set_nodelay(true)
    }

    fn set_reuse_addr(&self) -> io::Result<()> {
        self.sock.set_reuse_address(true)
    }

    #[cfg(unix)]
    fn set_reuse_port(&self) -> io::Result<()> {
        self.sock.set_reuse_port(true)
    }

    #[cfg(not(unix))]
    fn set_reuse_port(&self) -> io::Result<()> {
        Ok(())
    }

    fn disable_linger(&self) -> io::Result<()> {
        // linger {on, 0s}: close drops the connection immediately instead of
        // lingering in TIME_WAIT.
        self.sock.set_linger(Some(std::time::Duration::ZERO))
    }

    #[cfg(target_os = "linux")]
    fn set_transparent(&self) -> io::Result<()> {
        self.sock
            .set_ip_transparent(true)
            .or_else(|_| self.sock.set_freebind(true))
    }

    #[cfg(not(target_os = "linux"))]
    fn set_transparent(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transparent bind is not available on this platform",
        ))
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.sock.bind(&SockAddr::from(addr))
    }

    fn listen(&self, backlog: i32) -> io::Result<()> {
        self.sock.listen(backlog)
    }

    fn into_listener(self: Box<Self>) -> io::Result<StdTcpListener> {
        Ok(self.sock.into())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable socket fake with descriptor accounting.

    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    fn fail() -> io::Error {
        io::Error::other("scripted failure")
    }

    /// Failure script for one fake socket.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeScript {
        pub fail_open: bool,
        pub slot: i32,
        pub fail_nonblocking: bool,
        pub fail_nodelay: bool,
        pub fail_reuse_addr: bool,
        pub fail_reuse_port: bool,
        pub fail_linger: bool,
        pub fail_transparent: bool,
        pub fail_bind: bool,
        pub fail_listen: bool,
    }

    /// Counts of fake descriptors opened and closed.
    #[derive(Debug, Default)]
    pub(crate) struct Accounting {
        pub opened: RefCell<u32>,
        pub closed: RefCell<u32>,
    }

    impl Accounting {
        pub fn balanced(&self) -> bool {
            *self.opened.borrow() == *self.closed.borrow()
        }
    }

    /// [`SockApi`] fake: hands out one scripted socket per `open_stream`.
    pub(crate) struct FakeApi {
        scripts: RefCell<VecDeque<FakeScript>>,
        pub acct: Rc<Accounting>,
    }

    impl FakeApi {
        pub fn with_scripts(scripts: Vec<FakeScript>) -> Self {
            Self {
                scripts: RefCell::new(scripts.into()),
                acct: Rc::new(Accounting::default()),
            }
        }

        pub fn single(script: FakeScript) -> Self {
            Self::with_scripts(vec![script])
        }
    }

    impl SockApi for FakeApi {
        fn open_stream(&self, _family: Family) -> io::Result<Box<dyn SockHandle>> {
            let script = self.scripts.borrow_mut().pop_front().unwrap_or_default();
            if script.fail_open {
                return Err(fail());
            }
            *self.acct.opened.borrow_mut() += 1;
            Ok(Box::new(FakeSock {
                script,
                acct: Rc::clone(&self.acct),
            }))
        }
    }

    struct FakeSock {
        script: FakeScript,
        acct: Rc<Accounting>,
    }

    impl Drop for FakeSock {
        fn drop(&mut self) {
            *self.acct.closed.borrow_mut() += 1;
        }
    }

    fn check(failed: bool) -> io::Result<()> {
        if failed {
            Err(fail())
        } else {
            Ok(())
        }
    }

    impl SockHandle for FakeSock {
        fn slot(&self) -> i32 {
            self.script.slot
        }

        fn set_nonblocking(&self) -> io::Result<()> {
            check(self.script.fail_nonblocking)
        }

        fn set_nodelay(&self) -> io::Result<()> {
            check(self.script.fail_nodelay)
        }

        fn set_reuse_addr(&self) -> io::Result<()> {
            check(self.script.fail_reuse_addr)
        }

        fn set_reuse_port(&self) -> io::Result<()> {
            check(self.script.fail_reuse_port)
        }

        fn disable_linger(&self) -> io::Result<()> {
            check(self.script.fail_linger)
        }

        fn set_transparent(&self) -> io::Result<()> {
            check(self.script.fail_transparent)
        }

        fn bind(&self, _addr: SocketAddr) -> io::Result<()> {
            check(self.script.fail_bind)
        }

        fn listen(&self, _backlog: i32) -> io::Result<()> {
            check(self.script.fail_listen)
        }

        fn into_listener(self: Box<Self>) -> io::Result<StdTcpListener> {
            // A real ephemeral listener keeps the success path honest; the
            // fake descriptor itself is retired by Drop.
            let listener = StdTcpListener::bind("127.0.0.1:0")?;
            listener.set_nonblocking(true)?;
            Ok(listener)
        }
    }
}
