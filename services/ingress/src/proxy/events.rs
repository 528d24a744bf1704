//! Readiness-notification seam.
//!
//! The bind path registers each listening socket for readability exactly
//! once, tagging the listener as the handle's owner. The production
//! implementation hands the socket to tokio and runs an accept loop that
//! invokes the listener's accept callback per connection; the
//! write-readiness variant is never used for listening sockets.

use std::collections::HashMap;
use std::io;
use std::net::TcpListener as StdTcpListener;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, error};

use super::listener::{AcceptCallback, ListenerId};

/// Event-layer registration consumed by the bind path.
pub trait EventRegistry: Send + Sync {
    /// Register `socket` (already non-blocking) for readability. `owner`
    /// identifies the listener so the registration can later be revoked.
    fn register_readable(
        &self,
        socket: StdTcpListener,
        owner: ListenerId,
        on_accept: AcceptCallback,
    ) -> io::Result<()>;

    /// Drop the registration made for `owner`, if any. Idempotent.
    fn unregister(&self, owner: ListenerId);
}

/// Tokio-backed event layer: one accept task per registered listener.
#[derive(Default)]
pub struct TokioEvents {
    tasks: Mutex<HashMap<ListenerId, tokio::task::JoinHandle<()>>>,
}

impl TokioEvents {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventRegistry for TokioEvents {
    fn register_readable(
        &self,
        socket: StdTcpListener,
        owner: ListenerId,
        on_accept: AcceptCallback,
    ) -> io::Result<()> {
        let listener = tokio::net::TcpListener::from_std(socket)?;
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!(peer_addr = %peer_addr, "Connection accepted");
                        on_accept(stream, peer_addr);
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid a tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().expect("event task table poisoned");
        if let Some(previous) = tasks.insert(owner, task) {
            previous.abort();
        }
        Ok(())
    }

    fn unregister(&self, owner: ListenerId) {
        let mut tasks = self.tasks.lock().expect("event task table poisoned");
        if let Some(task) = tasks.remove(&owner) {
            task.abort();
        }
    }
}

impl Drop for TokioEvents {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, task) in tasks.drain() {
                task.abort();
            }
        }
    }
}
