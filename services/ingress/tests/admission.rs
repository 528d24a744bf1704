//! End-to-end admission tests: directives parsed through the keyword
//! surface, listeners bound through a family registry, real connections
//! driven through inspection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use edge_ingress::{
    inspect_stream, parse_tcp_request, AcceptCallback, ConnContext, Decision, Limits, Listener,
    ListenerOptions, ParseOutcome, Protocol, ProxySection, ReqLenConds, TcpV4, TokioEvents,
};
use edge_report::{DiagBuf, ErrorCode};

fn build_frontend(directives: &[&str]) -> ProxySection {
    let mut section = ProxySection::frontend("test");
    for directive in directives {
        let tokens: Vec<&str> = directive.split_whitespace().collect();
        let mut diag = DiagBuf::with_capacity(256);
        let outcome = parse_tcp_request(&tokens, &mut section, &ReqLenConds, &mut diag);
        assert_eq!(
            outcome,
            ParseOutcome::Applied,
            "directive '{}' failed: {:?}",
            directive,
            diag.message()
        );
    }
    section
}

struct Gate {
    registry: TcpV4,
    events: Arc<TokioEvents>,
    decisions: mpsc::UnboundedReceiver<(Decision, usize)>,
    addr: SocketAddr,
}

async fn spawn_gate(directives: &[&str]) -> Gate {
    let section = build_frontend(directives);
    let inspection = Arc::new(section.inspection());
    let rules = Arc::new(section.rules);

    let (tx, decisions) = mpsc::unbounded_channel();
    let accept: AcceptCallback = Arc::new(move |stream, peer_addr| {
        let rules = Arc::clone(&rules);
        let inspection = Arc::clone(&inspection);
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            let mut ctx = ConnContext::new(peer_addr);
            let decision = inspect_stream(&mut stream, &rules, &inspection, &mut ctx)
                .await
                .expect("inspection failed");
            tx.send((decision, ctx.buffered().len())).ok();
        });
    });

    let listener = Listener::new(
        "gate",
        "127.0.0.1:0".parse().unwrap(),
        ListenerOptions::default(),
        100,
        accept,
    );

    let mut registry = TcpV4::new();
    assert!(registry.add_listener(listener).is_ok());

    let events = Arc::new(TokioEvents::new());
    let code = registry.bind_all(&Limits::default(), events.as_ref());
    assert!(code.is_none(), "bind_all returned {code}");

    let addr = registry.bound_addrs()[0];
    Gate {
        registry,
        events,
        decisions,
        addr,
    }
}

#[tokio::test]
async fn rejects_long_request_by_content_rule() {
    let mut gate = spawn_gate(&[
        "tcp-request inspect-delay 2s",
        "tcp-request content reject if req_len ge 6",
        "tcp-request content accept",
    ])
    .await;

    let mut client = TcpStream::connect(gate.addr).await.unwrap();
    client.write_all(b"0123456789").await.unwrap();

    let (decision, buffered) = gate.decisions.recv().await.unwrap();
    assert_eq!(decision, Decision::Reject);
    assert!(buffered >= 6);
}

#[tokio::test]
async fn accepts_short_request_after_inspect_delay() {
    let mut gate = spawn_gate(&[
        "tcp-request inspect-delay 100ms",
        "tcp-request content reject if req_len ge 100",
    ])
    .await;

    let mut client = TcpStream::connect(gate.addr).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    // Keep the connection open and quiet: only the delay can settle this.
    let started = std::time::Instant::now();
    let (decision, buffered) = gate.decisions.recv().await.unwrap();
    assert_eq!(decision, Decision::Accept);
    assert_eq!(buffered, 2);
    assert!(started.elapsed() >= Duration::from_millis(100));
    drop(client);
}

#[tokio::test]
async fn accepts_immediately_without_rules() {
    let mut gate = spawn_gate(&[]).await;

    let _client = TcpStream::connect(gate.addr).await.unwrap();
    let (decision, _) = gate.decisions.recv().await.unwrap();
    assert_eq!(decision, Decision::Accept);
}

#[tokio::test]
async fn accept_rule_fires_before_later_reject() {
    let mut gate = spawn_gate(&[
        "tcp-request inspect-delay 2s",
        "tcp-request content accept if req_len ge 4",
        "tcp-request content reject",
    ])
    .await;

    let mut client = TcpStream::connect(gate.addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let (decision, _) = gate.decisions.recv().await.unwrap();
    assert_eq!(decision, Decision::Accept);
}

#[tokio::test]
async fn rebinding_a_bound_registry_is_idempotent() {
    let mut gate = spawn_gate(&[]).await;

    let again = gate
        .registry
        .bind_all(&Limits::default(), gate.events.as_ref());
    assert!(again.is_none());
    assert_eq!(gate.registry.bound_addrs().len(), 1);

    // Still serving after the no-op rebind.
    let _client = TcpStream::connect(gate.addr).await.unwrap();
    let (decision, _) = gate.decisions.recv().await.unwrap();
    assert_eq!(decision, Decision::Accept);
}

#[tokio::test]
async fn socket_table_exhaustion_aborts_the_batch() {
    let accept: AcceptCallback = Arc::new(|_, _| {});
    let mut registry = TcpV4::new();
    for name in ["a", "b"] {
        let listener = Listener::new(
            name,
            "127.0.0.1:0".parse().unwrap(),
            ListenerOptions::default(),
            100,
            accept.clone(),
        );
        assert!(registry.add_listener(listener).is_ok());
    }

    // Every real descriptor slot exceeds a capacity of 1.
    let limits = Limits { max_sockets: 1 };
    let events = Arc::new(TokioEvents::new());
    let code = registry.bind_all(&limits, events.as_ref());

    assert!(code.contains(ErrorCode::FATAL));
    assert!(code.contains(ErrorCode::ABORT));
    assert!(code.contains(ErrorCode::ALERT));
    assert!(registry.bound_addrs().is_empty());
}

#[tokio::test]
async fn unbind_all_stops_accepting_and_allows_rebind() {
    let mut gate = spawn_gate(&[]).await;

    gate.registry.unbind_all(gate.events.as_ref());
    assert!(gate.registry.bound_addrs().is_empty());

    // The old port is gone.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(gate.addr).await.is_err());

    // A fresh bind brings the listener back (on a new ephemeral port).
    let code = gate
        .registry
        .bind_all(&Limits::default(), gate.events.as_ref());
    assert!(code.is_none());
    let addr = gate.registry.bound_addrs()[0];
    let _client = TcpStream::connect(addr).await.unwrap();
    let (decision, _) = gate.decisions.recv().await.unwrap();
    assert_eq!(decision, Decision::Accept);
}
