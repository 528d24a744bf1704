//! edgegate ingress
//!
//! Listener binding and connection admission front door.
//!
//! This binary:
//! - Loads process configuration from the environment
//! - Parses `tcp-request` frontend directives
//! - Binds listeners per address family, honoring batch-abort semantics
//! - Runs content inspection over each accepted connection and admits or
//!   rejects it
//!
//! Byte forwarding after admission belongs to a session layer attached via
//! the accept callback; none ships here.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edge_ingress::config::Config;
use edge_ingress::{
    parse_tcp_request, AcceptCallback, ConnContext, Decision, Family, InspectionConfig, Limits,
    Listener, ListenerOptions, ParseOutcome, Protocol, ProxySection, ReqLenConds, TcpRule, TcpV4,
    TcpV6, TokioEvents,
};
use edge_report::{DiagBuf, ErrorCode};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to EDGE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting edgegate ingress");
    info!(
        listener_count = config.listen.len(),
        maxconn = config.maxconn,
        max_sockets = config.max_sockets,
        transparent = config.transparent,
        "Configuration loaded"
    );

    // Build the frontend section from directives, if any.
    let mut section = ProxySection::frontend("main");
    if let Some(path) = &config.frontend_file {
        load_frontend_file(path, &mut section)?;
    }
    let inspection = Arc::new(section.inspection());
    let rules: Arc<Vec<TcpRule>> = Arc::new(section.rules);

    info!(
        rule_count = rules.len(),
        inspect_delay = ?inspection.delay,
        "Frontend configured"
    );

    let limits = Limits {
        max_sockets: config.max_sockets,
    };
    let events = Arc::new(TokioEvents::new());

    let accept: AcceptCallback = {
        let rules = Arc::clone(&rules);
        let inspection = Arc::clone(&inspection);
        Arc::new(move |stream, peer_addr| {
            let rules = Arc::clone(&rules);
            let inspection = Arc::clone(&inspection);
            tokio::spawn(
                handle_connection(stream, rules, inspection)
                    .instrument(tracing::info_span!("connection", peer = %peer_addr)),
            );
        })
    };

    // One registry per address family; listeners bind in declaration order.
    let mut v4 = TcpV4::new();
    let mut v6 = TcpV6::new();
    let options = ListenerOptions {
        nolinger: config.nolinger,
        foreign: config.transparent,
    };
    for (idx, addr) in config.listen.iter().enumerate() {
        let mut listener = Listener::new(
            format!("listener-{idx}"),
            *addr,
            options,
            config.maxconn,
            accept.clone(),
        );
        if let Some(backlog) = config.backlog {
            listener = listener.with_backlog(backlog);
        }
        let registry: &mut dyn Protocol = match Family::of(addr) {
            Family::V4 => &mut v4,
            Family::V6 => &mut v6,
        };
        if registry.add_listener(listener).is_err() {
            warn!(addr = %addr, "Listener was not accepted by its family registry");
        }
    }

    let mut err = v4.bind_all(&limits, events.as_ref());
    if !err.contains(ErrorCode::ABORT) {
        err |= v6.bind_all(&limits, events.as_ref());
    }

    if err.contains(ErrorCode::FATAL) || err.contains(ErrorCode::ABORT) {
        anyhow::bail!("fatal problem while binding listeners ({err})");
    }
    if err.contains(ErrorCode::RETRYABLE) {
        anyhow::bail!("could not bind all listeners ({err})");
    }
    if !err.is_none() {
        warn!(code = %err, "Listeners bound in degraded mode");
    }

    let mut bound = v4.bound_addrs();
    bound.extend(v6.bound_addrs());
    info!(addrs = ?bound, "Ingress accepting connections");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;

    info!("Shutting down");
    v4.unbind_all(events.as_ref());
    v6.unbind_all(events.as_ref());
    Ok(())
}

/// Feed `tcp-request` directives from a file through the keyword surface.
///
/// Lines are pre-tokenized on whitespace; `#` starts a comment. An invalid
/// directive rejects the whole configuration, while ignorable problems are
/// logged and skipped.
fn load_frontend_file(path: &Path, section: &mut ProxySection) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read frontend file {}", path.display()))?;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"tcp-request") {
            warn!(line = idx + 1, "Ignoring unknown directive");
            continue;
        }

        let mut diag = DiagBuf::with_capacity(256);
        match parse_tcp_request(&tokens, section, &ReqLenConds, &mut diag) {
            ParseOutcome::Applied => {
                debug!(line = idx + 1, directive = line, "Directive applied");
            }
            ParseOutcome::Ignored => {
                warn!(
                    line = idx + 1,
                    detail = diag.message().unwrap_or(""),
                    "Directive ignored"
                );
            }
            ParseOutcome::Invalid => {
                anyhow::bail!(
                    "invalid directive at {}:{}: {}",
                    path.display(),
                    idx + 1,
                    diag.message().unwrap_or("unparseable directive")
                );
            }
        }
    }
    Ok(())
}

/// Admission for one accepted connection.
async fn handle_connection(
    mut stream: TcpStream,
    rules: Arc<Vec<TcpRule>>,
    inspection: Arc<InspectionConfig>,
) {
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!(error = %e, "Connection vanished before inspection");
            return;
        }
    };

    let mut ctx = ConnContext::new(peer_addr);
    match edge_ingress::inspect_stream(&mut stream, &rules, &inspection, &mut ctx).await {
        Ok(Decision::Accept) | Ok(Decision::Undecided) => {
            debug!(
                buffered = ctx.buffered().len(),
                "Connection admitted"
            );
            // Session construction attaches here; admission is done.
        }
        Ok(Decision::Reject) => {
            debug!(
                buffered = ctx.buffered().len(),
                "Connection rejected by content rules"
            );
        }
        Err(e) => {
            error!(error = %e, "Inspection failed");
        }
    }
}
