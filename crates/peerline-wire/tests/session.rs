//! End-to-end tests for the session layer.
//!
//! Every test starts real hosts on 127.0.0.1 with OS-assigned ports and
//! drives them through the public API: resolve, register, open, pump.
//! Nothing leaves the loopback interface.

use peerline_wire::{
    open_stream, register_handler, resolve_peer, run_pump, DialError, Direction, Host,
    HostConfig, Identity, LoopExit, PeerAddressInfo, PeerId, Session, StreamProtocol, WireError,
    CHAT_PROTOCOL,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_host(seed: u64) -> Host {
    let identity = Identity::generate(&mut StdRng::seed_from_u64(seed)).unwrap();
    let config = HostConfig {
        listen_ip: "127.0.0.1".parse().unwrap(),
        listen_port: 0,
        dial_timeout_secs: 5,
        ..HostConfig::default()
    };
    Host::start(config, identity).await.unwrap()
}

fn dial_addr(host: &Host) -> String {
    host.p2p_addrs()[0].to_string()
}

/// Register a chat handler that forwards each accepted session to the test.
fn accept_sessions(host: &Host) -> mpsc::UnboundedReceiver<Session> {
    let (tx, rx) = mpsc::unbounded_channel();
    register_handler(host, CHAT_PROTOCOL, move |session: Session| {
        let _ = tx.send(session);
    })
    .unwrap();
    rx
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting")
        .expect("channel closed")
}

// ---------------------------------------------------------------------------
// Connectivity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_open_stream_reaches_registered_handler() {
    let host1 = start_host(101).await;
    let host2 = start_host(102).await;
    let mut sessions = accept_sessions(&host1);

    let target = resolve_peer(&host2, &dial_addr(&host1)).unwrap();
    assert_eq!(target.peer_id, host1.peer_id());
    assert!(host2.address_book().contains(&host1.peer_id()));

    let outbound = open_stream(&host2, &target, CHAT_PROTOCOL).await.unwrap();
    assert_eq!(outbound.peer(), host1.peer_id());
    assert_eq!(outbound.direction(), Direction::Outbound);
    assert_eq!(outbound.protocol(), &CHAT_PROTOCOL);

    let inbound = next(&mut sessions).await;
    assert_eq!(inbound.peer(), host2.peer_id());
    assert_eq!(inbound.direction(), Direction::Inbound);

    let connected = host2.connected_peers().await.unwrap();
    assert!(connected.contains(&host1.peer_id()));

    drop((inbound, outbound));
    host2.close().await;
    host1.close().await;
}

#[tokio::test]
async fn test_printed_address_resolves_back_to_host() {
    let host = start_host(103).await;

    let info: PeerAddressInfo = dial_addr(&host).parse().unwrap();
    assert_eq!(info.peer_id, host.peer_id());
    assert_eq!(info.addrs, host.listen_addrs());
    assert_eq!(info.to_string(), dial_addr(&host));
    host.close().await;
}

#[tokio::test]
async fn test_ping_after_connect() {
    let host1 = start_host(104).await;
    let host2 = start_host(105).await;

    resolve_peer(&host2, &dial_addr(&host1)).unwrap();
    assert_ok!(host2.connect(host1.peer_id()).await);
    let rtt = host2.ping(host1.peer_id()).await.unwrap();
    assert!(rtt < WAIT);

    host2.close().await;
    host1.close().await;
}

// ---------------------------------------------------------------------------
// Line delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_lines_flow_both_ways() {
    let host1 = start_host(106).await;
    let host2 = start_host(107).await;
    let mut sessions = accept_sessions(&host1);

    let target = resolve_peer(&host2, &dial_addr(&host1)).unwrap();
    let mut dialer = open_stream(&host2, &target, CHAT_PROTOCOL)
        .await
        .unwrap()
        .into_channel();

    // Listener side runs the real pump against an in-memory console.
    let inbound = next(&mut sessions).await;
    let (mut console_in, local_input) = tokio::io::duplex(256);
    let (sink, mut printed) = mpsc::unbounded_channel();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let pump = run_pump(
        inbound.into_channel(),
        tokio::io::BufReader::new(local_input),
        sink,
        shutdown_rx,
    );

    dialer.write_line("Hello from host2!").await.unwrap();
    dialer.write_line("").await.unwrap();
    dialer.write_line("second").await.unwrap();
    assert_eq!(next(&mut printed).await, "Hello from host2!");
    assert_eq!(next(&mut printed).await, "second");

    console_in.write_all(b"Hello from host1!\n").await.unwrap();
    let reply = tokio::time::timeout(WAIT, dialer.read_line()).await.unwrap();
    assert_eq!(reply.unwrap().as_deref(), Some("Hello from host1!\n"));

    // Peer hangs up: the listener's pump winds down on its own.
    drop(dialer);
    let report = tokio::time::timeout(WAIT, pump.join()).await.unwrap().unwrap();
    assert_eq!(report.receive, LoopExit::Finished);
    assert_eq!(report.send, LoopExit::Stopped);
    assert!(printed.try_recv().is_err());

    host2.close().await;
    host1.close().await;
}

#[tokio::test]
async fn test_shutdown_stops_local_pump_and_closes_stream() {
    let host1 = start_host(108).await;
    let host2 = start_host(109).await;
    let mut sessions = accept_sessions(&host1);

    let target = resolve_peer(&host2, &dial_addr(&host1)).unwrap();
    let outbound = open_stream(&host2, &target, CHAT_PROTOCOL).await.unwrap();
    let mut listener = next(&mut sessions).await.into_channel();

    let (_console_in, local_input) = tokio::io::duplex(64);
    let (sink, _printed) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pump = run_pump(
        outbound.into_channel(),
        tokio::io::BufReader::new(local_input),
        sink,
        shutdown_rx,
    );

    shutdown_tx.send(true).unwrap();
    let report = tokio::time::timeout(WAIT, pump.join()).await.unwrap().unwrap();
    assert_eq!(report.receive, LoopExit::Stopped);
    assert_eq!(report.send, LoopExit::Stopped);

    // The dialer closed its write side, so the listener sees end of stream.
    let eof = tokio::time::timeout(WAIT, listener.read_line()).await.unwrap();
    assert!(matches!(eof, Ok(None) | Err(_)));

    host2.close().await;
    host1.close().await;
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dial_to_closed_port_is_unreachable() {
    let host = start_host(110).await;
    let port = {
        let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        scratch.local_addr().unwrap().port()
    };

    let addr = format!("/ip4/127.0.0.1/tcp/{port}/p2p/{}", PeerId::random());
    let target = resolve_peer(&host, &addr).unwrap();
    let result = open_stream(&host, &target, CHAT_PROTOCOL).await;
    assert!(matches!(result, Err(DialError::Unreachable { .. })));

    host.close().await;
}

#[tokio::test]
async fn test_silent_listener_times_out() {
    let identity = Identity::generate(&mut StdRng::seed_from_u64(115)).unwrap();
    let config = HostConfig {
        listen_ip: "127.0.0.1".parse().unwrap(),
        dial_timeout_secs: 1,
        ..HostConfig::default()
    };
    let host = Host::start(config, identity).await.unwrap();

    // Accepts TCP connections but never answers the security handshake.
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = silent.accept().await {
            held.push(socket);
        }
    });

    let addr = format!("/ip4/127.0.0.1/tcp/{port}/p2p/{}", PeerId::random());
    let target = resolve_peer(&host, &addr).unwrap();
    let started = std::time::Instant::now();
    let result = open_stream(&host, &target, CHAT_PROTOCOL).await;

    assert!(matches!(result, Err(DialError::Timeout { secs: 1, .. })), "{result:?}");
    assert!(started.elapsed() < WAIT);

    holder.abort();
    host.close().await;
}

#[tokio::test]
async fn test_unregistered_protocol_is_refused() {
    let host1 = start_host(111).await;
    let host2 = start_host(112).await;
    let _sessions = accept_sessions(&host1);

    let target = resolve_peer(&host2, &dial_addr(&host1)).unwrap();
    let other = StreamProtocol::new("/chat/2.0.0");
    let result = open_stream(&host2, &target, other).await;
    assert!(matches!(result, Err(DialError::ProtocolRefused { .. })));

    host2.close().await;
    host1.close().await;
}

#[tokio::test]
async fn test_second_handler_for_protocol_rejected() {
    let host = start_host(113).await;
    let _sessions = accept_sessions(&host);

    let result = register_handler(&host, CHAT_PROTOCOL, |_session: Session| {});
    assert!(matches!(result, Err(WireError::HandlerAlreadyRegistered(_))));

    host.close().await;
}

#[tokio::test]
async fn test_malformed_destination_rejected_before_dial() {
    let host = start_host(114).await;

    let result = resolve_peer(&host, "/ip4/127.0.0.1/tcp/4001");
    assert!(result.is_err());
    assert!(host.address_book().is_empty());

    host.close().await;
}
