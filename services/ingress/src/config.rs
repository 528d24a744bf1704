//! Ingress configuration (env-driven).

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Addresses to listen on (comma separated in `EDGE_LISTEN`).
    pub listen: Vec<SocketAddr>,

    /// Per-listener connection ceiling; also the accept backlog when no
    /// explicit backlog is configured.
    pub maxconn: u32,

    /// Explicit accept backlog.
    pub backlog: Option<i32>,

    /// Process socket-table capacity.
    pub max_sockets: i32,

    /// Disable lingering close on listeners.
    pub nolinger: bool,

    /// Request the transparent capability on listeners (accepting traffic
    /// for foreign addresses).
    pub transparent: bool,

    /// Optional file of frontend directives (`tcp-request ...`).
    pub frontend_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_spec =
            std::env::var("EDGE_LISTEN").unwrap_or_else(|_| "0.0.0.0:9440".to_string());
        let mut listen = Vec::new();
        for part in listen_spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let addr: SocketAddr = part
                .parse()
                .with_context(|| format!("EDGE_LISTEN entry '{part}' is not a socket address."))?;
            listen.push(addr);
        }
        if listen.is_empty() {
            anyhow::bail!("EDGE_LISTEN resolved to no listen addresses.");
        }

        let maxconn: u32 = std::env::var("EDGE_MAXCONN")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("EDGE_MAXCONN must be an integer.")?
            .unwrap_or(2000)
            .clamp(1, 1_000_000);

        let backlog: Option<i32> = std::env::var("EDGE_BACKLOG")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("EDGE_BACKLOG must be an integer.")?;

        let max_sockets: i32 = std::env::var("EDGE_MAX_SOCKETS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("EDGE_MAX_SOCKETS must be an integer.")?
            .unwrap_or(crate::proxy::DEFAULT_MAX_SOCKETS)
            .max(8);

        let nolinger = flag("EDGE_NOLINGER");
        let transparent = flag("EDGE_TRANSPARENT");

        let frontend_file = std::env::var("EDGE_FRONTEND_FILE").ok().map(PathBuf::from);

        let log_level = std::env::var("EDGE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen,
            maxconn,
            backlog,
            max_sockets,
            nolinger,
            transparent,
            frontend_file,
            log_level,
        })
    }
}

fn flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}
