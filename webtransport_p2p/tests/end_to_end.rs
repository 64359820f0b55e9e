//! Dial/listen tests over the in-memory native runtime.

use std::{convert::Infallible, net::SocketAddr, sync::OnceLock, time::Duration};

use bytes::Bytes;
use futures::StreamExt;
use testresult::{TestError, TestResult};
use webtransport_p2p::{
    address::WebTransportAddr,
    config::{ListenerOptions, TransportConfig},
    connection::{Connection, WebTransportConnection},
    crypto::{signed::Signed, signer::LocalSigner},
    error::{AuthenticateError, DialError, StreamError},
    fingerprint::CertificateFingerprint,
    handshake::{Handshake, HandshakeMessage, RejectionReason, Response, StreamHandshake},
    listener::{ListenerEvent, ListenerState, WebTransportListener},
    memory::{MemoryNetwork, MemoryRuntime, MemorySession},
    native::{NativeError, NativeRuntime, NativeServer, NativeSession},
    peer::id::PeerId,
    stream::MuxedStream,
    timeout::FuturesTimerTimeout,
    timestamp::TimestampSeconds,
    transport::WebTransport,
    upgrader::MuxUpgrader,
    ADMISSION_REJECTED_CODE, AUTHENTICATION_FAILED_CODE, SESSION_TIMEOUT_CODE,
};

type Conn = WebTransportConnection<MemorySession>;
type Listener = WebTransportListener<MemoryRuntime, LocalSigner, MuxUpgrader, FuturesTimerTimeout>;
type Events = async_channel::Receiver<ListenerEvent<Conn>>;

static TRACING: OnceLock<()> = OnceLock::new();

fn init_tracing() {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

const LISTENER_SEED: u8 = 0;
const DIALER_SEED: u8 = 1;

fn served_fingerprint() -> CertificateFingerprint {
    CertificateFingerprint::sha256(b"listener certificate")
}

fn transport(runtime: MemoryRuntime, seed: u8) -> WebTransport<MemoryRuntime, LocalSigner> {
    WebTransport::new(runtime, LocalSigner::from_bytes(&[seed; 32]), TransportConfig::default())
}

async fn start_listener(
    network: &MemoryNetwork,
    options: ListenerOptions,
) -> TestResult<(Listener, Events, WebTransportAddr)> {
    let listening = transport(network.runtime(vec![served_fingerprint()]), LISTENER_SEED);
    let (listener, events) = listening.create_listener(options);
    let addrs = listener.listen(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = addrs.into_iter().next().ok_or("listener advertised no address")?;
    Ok((listener, events, addr))
}

async fn next_connection(events: &Events) -> TestResult<Conn> {
    loop {
        match events.recv().await? {
            ListenerEvent::Connection(conn) => return Ok(conn),
            ListenerEvent::Listening(_) => {}
            other => return Err(format!("unexpected listener event: {other:?}").into()),
        }
    }
}

async fn read_all(stream: &MuxedStream<MemorySession>) -> TestResult<Vec<u8>> {
    let source = stream.source();
    futures::pin_mut!(source);
    let mut received = Vec::new();
    while let Some(chunk) = source.next().await {
        received.extend_from_slice(&chunk?);
    }
    Ok(received)
}

fn single_bytes(data: &[u8]) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send {
    futures::stream::iter(
        data.iter()
            .map(|b| Ok(Bytes::copy_from_slice(&[*b])))
            .collect::<Vec<_>>(),
    )
}

#[tokio::test]
async fn echo_round_trip() -> TestResult {
    init_tracing();
    let network = MemoryNetwork::new();
    let (_listener, events, addr) = start_listener(&network, ListenerOptions::default()).await?;

    let echo = tokio::spawn(async move {
        let conn = next_connection(&events).await?;
        let stream = conn.accept_stream().await?;
        let data = read_all(&stream).await?;
        stream.sink(single_bytes(&data)).await?;
        Ok::<_, TestError>(conn)
    });

    let dialer = transport(network.runtime(Vec::new()), DIALER_SEED);
    let conn = dialer.dial(&addr).await?;
    assert_eq!(conn.peer_id(), LocalSigner::from_bytes(&[LISTENER_SEED; 32]).peer_id());
    assert_eq!(conn.remote_fingerprints(), &[served_fingerprint()]);

    let stream = conn.new_stream().await?;
    let sent: Vec<u8> = (0u8..16).collect();
    stream.sink(single_bytes(&sent)).await?;
    let echoed = read_all(&stream).await?;
    assert_eq!(echoed, sent);

    stream.close_read().await;
    let timeline = stream.timeline().await;
    let closed_at = timeline.close.ok_or("stream close time not set")?;
    assert!(closed_at > timeline.open);
    assert!(stream.is_finalized());
    assert!(conn.streams().await.is_empty());

    let remote = echo.await??;
    assert_eq!(remote.peer_id(), LocalSigner::from_bytes(&[DIALER_SEED; 32]).peer_id());
    assert_eq!(remote.remote_addr(), None);
    Ok(())
}

#[tokio::test]
async fn discovery_dial_learns_the_listener_identity() -> TestResult {
    init_tracing();
    let network = MemoryNetwork::new();
    let (_listener, _events, addr) = start_listener(&network, ListenerOptions::default()).await?;
    let anonymous = WebTransportAddr::new(addr.socket_addr(), addr.fingerprints().to_vec(), None);

    let conn = transport(network.runtime(Vec::new()), DIALER_SEED)
        .dial(&anonymous)
        .await?;

    assert_eq!(Some(conn.peer_id()), addr.peer_id());
    Ok(())
}

#[tokio::test]
async fn fingerprint_mismatch_fails_and_closes_the_session() -> TestResult {
    init_tracing();
    let network = MemoryNetwork::new();
    let (_listener, events, addr) = start_listener(&network, ListenerOptions::default()).await?;
    let wrong = WebTransportAddr::new(
        addr.socket_addr(),
        vec![CertificateFingerprint::sha256(b"some other certificate")],
        addr.peer_id(),
    );

    let runtime = network.runtime(Vec::new());
    let result = transport(runtime.clone(), DIALER_SEED).dial(&wrong).await;

    match result {
        Err(DialError::Authentication(e)) => assert!(matches!(
            *e,
            AuthenticateError::Rejected(RejectionReason::FingerprintMismatch)
        )),
        other => return Err(format!("expected authentication failure, got {other:?}").into()),
    }

    let sessions = runtime.connected_sessions().await;
    let session = sessions.first().ok_or("no session was opened")?;
    assert_eq!(session.closed().await.code, AUTHENTICATION_FAILED_CODE);
    assert!(events.try_recv().is_ok_and(|e| matches!(e, ListenerEvent::Listening(_))));
    assert!(events.is_empty());
    Ok(())
}

#[tokio::test]
async fn dialer_refuses_a_listener_reporting_other_certificates() -> TestResult {
    init_tracing();
    let network = MemoryNetwork::new();
    let server = network
        .runtime(vec![served_fingerprint()])
        .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await?;
    let listener_signer = LocalSigner::from_bytes(&[LISTENER_SEED; 32]);
    let addr = WebTransportAddr::new(
        server.local_addr(),
        vec![served_fingerprint()],
        Some(listener_signer.peer_id()),
    );

    // Answers the challenge with a valid signature, but for another certificate.
    let misreporting = tokio::spawn(async move {
        let session = server.accept().await.ok_or("server closed")?;
        let (send, recv) = session.accept_bi().await?;
        let mut handshake = StreamHandshake::<MemorySession>::new(send, recv);
        let bytes = handshake.recv().await?;
        let HandshakeMessage::Challenge(challenge) = minicbor::decode::<HandshakeMessage>(&bytes)? else {
            return Err("expected a challenge".into());
        };
        let response = Response {
            challenge_digest: *blake3::hash(challenge.payload_bytes()).as_bytes(),
            server_timestamp: TimestampSeconds::now(),
            fingerprints: vec![CertificateFingerprint::sha256(b"some other certificate")],
        };
        let signed = Signed::seal(&listener_signer, &response).await;
        handshake
            .send(minicbor::to_vec(HandshakeMessage::Response(signed))?)
            .await?;
        Ok::<_, TestError>(session.closed().await)
    });

    let result = transport(network.runtime(Vec::new()), DIALER_SEED)
        .dial(&addr)
        .await;

    match result {
        Err(DialError::Authentication(e)) => {
            assert!(matches!(*e, AuthenticateError::FingerprintMismatch));
        }
        other => return Err(format!("expected authentication failure, got {other:?}").into()),
    }
    let info = tokio::time::timeout(Duration::from_secs(5), misreporting).await???;
    assert_eq!(info.code, AUTHENTICATION_FAILED_CODE);
    Ok(())
}

#[tokio::test]
async fn wrong_expected_peer_is_refused() -> TestResult {
    init_tracing();
    let network = MemoryNetwork::new();
    let (_listener, _events, addr) = start_listener(&network, ListenerOptions::default()).await?;
    let impostor_target = addr.clone().with_peer_id(PeerId::new([0xAB; 32]));

    let result = transport(network.runtime(Vec::new()), DIALER_SEED)
        .dial(&impostor_target)
        .await;

    match result {
        Err(DialError::Authentication(e)) => assert!(matches!(
            *e,
            AuthenticateError::Rejected(RejectionReason::InvalidAudience)
        )),
        other => return Err(format!("expected authentication failure, got {other:?}").into()),
    }
    Ok(())
}

#[tokio::test]
async fn streams_beyond_the_ceiling_are_refused() -> TestResult {
    const LIMIT: usize = 2;
    init_tracing();
    let network = MemoryNetwork::new();
    let (_listener, events, addr) = start_listener(
        &network,
        ListenerOptions::default().with_max_inbound_streams(LIMIT),
    )
    .await?;

    let conn = transport(network.runtime(Vec::new()), DIALER_SEED)
        .dial(&addr)
        .await?;
    let remote = next_connection(&events).await?;

    let mut opened = Vec::new();
    for _ in 0..=LIMIT {
        opened.push(conn.new_stream().await?);
    }
    for _ in 0..LIMIT {
        remote.accept_stream().await?;
    }
    assert_eq!(remote.streams().await.len(), LIMIT);

    let refused = opened.last().ok_or("no streams opened")?;
    let source = refused.source();
    futures::pin_mut!(source);
    assert_eq!(
        source.next().await,
        Some(Err(StreamError::Native(NativeError::Reset(ADMISSION_REJECTED_CODE))))
    );
    assert_eq!(remote.streams().await.len(), LIMIT);
    Ok(())
}

#[tokio::test]
async fn stalled_session_times_out_silently() -> TestResult {
    init_tracing();
    let network = MemoryNetwork::new();
    let (_listener, events, addr) = start_listener(
        &network,
        ListenerOptions::default().with_session_ready_timeout(Duration::from_millis(50)),
    )
    .await?;

    let stalled = network.runtime(Vec::new()).with_stalled_ready();
    let session = stalled.connect(addr.socket_addr(), addr.fingerprints()).await?;

    let info = tokio::time::timeout(Duration::from_secs(5), session.closed()).await?;
    assert_eq!(info.code, SESSION_TIMEOUT_CODE);

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ListenerEvent::Connection(_)));
    }
    Ok(())
}

#[tokio::test]
async fn closing_the_listener_closes_its_connections() -> TestResult {
    init_tracing();
    let network = MemoryNetwork::new();
    let (listener, events, addr) = start_listener(&network, ListenerOptions::default()).await?;

    let conn = transport(network.runtime(Vec::new()), DIALER_SEED)
        .dial(&addr)
        .await?;
    let _remote = next_connection(&events).await?;
    assert_eq!(listener.connections().await.len(), 1);

    listener.close().await;

    tokio::time::timeout(Duration::from_secs(5), conn.closed()).await?;
    assert!(conn.is_closed());
    assert_eq!(listener.state().await, ListenerState::Closed);
    assert!(matches!(events.recv().await?, ListenerEvent::Closed));

    let redial = transport(network.runtime(Vec::new()), DIALER_SEED)
        .dial(&addr)
        .await;
    assert!(matches!(redial, Err(DialError::Connect(NativeError::Unreachable))));
    Ok(())
}

#[tokio::test]
async fn sink_is_single_use() -> TestResult {
    init_tracing();
    let network = MemoryNetwork::new();
    let (_listener, _events, addr) = start_listener(&network, ListenerOptions::default()).await?;
    let conn = transport(network.runtime(Vec::new()), DIALER_SEED)
        .dial(&addr)
        .await?;

    let stream = conn.new_stream().await?;
    stream.sink(single_bytes(b"once")).await?;
    assert_eq!(
        stream.sink(single_bytes(b"twice")).await,
        Err(StreamError::SinkAlreadyUsed)
    );
    assert!(stream.is_write_closed().await);
    Ok(())
}

#[tokio::test]
async fn close_order_does_not_matter() -> TestResult {
    init_tracing();
    let network = MemoryNetwork::new();
    let (_listener, events, addr) = start_listener(&network, ListenerOptions::default()).await?;
    let conn = transport(network.runtime(Vec::new()), DIALER_SEED)
        .dial(&addr)
        .await?;
    let remote = next_connection(&events).await?;

    let write_first = conn.new_stream().await?;
    let read_first = conn.new_stream().await?;
    for _ in 0..2 {
        remote.accept_stream().await?;
    }

    write_first.close_write().await;
    assert!(!write_first.is_finalized());
    write_first.close_read().await;
    write_first.close_read().await;

    read_first.close_read().await;
    assert!(!read_first.is_finalized());
    read_first.close_write().await;
    read_first.close_write().await;

    for stream in [&write_first, &read_first] {
        assert!(stream.is_finalized());
        assert!(stream.timeline().await.close.is_some());
    }
    assert!(conn.streams().await.is_empty());
    Ok(())
}
