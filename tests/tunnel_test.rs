//! End-to-end tunnel tests: two connections over an in-memory link, with
//! the embedded control channel managing sessions across them.

use async_trait::async_trait;
use mirage_tunnel::config::TunnelConfig;
use mirage_tunnel::conn::{Conn, Role};
use mirage_tunnel::crypto::{CryptoError, PresharedSecret, TunnelKey};
use mirage_tunnel::disguise::{TcpHeader, SEGMENT_FLAGS, SEGMENT_WINDOW, TCP_HEADER_LEN};
use mirage_tunnel::handshake::{HandshakeError, State};
use mirage_tunnel::session::{FlowTuple, Forward, ForwardFactory, Proto, SessionError};
use mirage_tunnel::stack::MemStack;
use mirage_tunnel::transport::{MemLink, RawTransport};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Honor RUST_LOG when debugging a failing test.
fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Forward endpoint that echoes: whatever the tunnel delivers comes
/// straight back up the downlink pump.
struct EchoForward {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: CancellationToken,
}

#[async_trait]
impl Forward for EchoForward {
    async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        self.tx
            .send(payload.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
    }

    async fn recv(&self) -> std::io::Result<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed"))
            }
            msg = rx.recv() => {
                msg.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed"))
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

struct EchoFactory;

#[async_trait]
impl ForwardFactory for EchoFactory {
    async fn open(&self, _tuple: &FlowTuple) -> Result<Arc<dyn Forward>, SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Arc::new(EchoForward {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }))
    }
}

/// Client-side endpoint the test can drive: `feed` plays the captured
/// application traffic (goes up the tunnel), `delivered` receives what the
/// tunnel brings back.
struct TestForward {
    delivered: mpsc::UnboundedSender<Vec<u8>>,
    feed: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: CancellationToken,
}

#[async_trait]
impl Forward for TestForward {
    async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        self.delivered
            .send(payload.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
    }

    async fn recv(&self) -> std::io::Result<Vec<u8>> {
        let mut feed = self.feed.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed"))
            }
            msg = feed.recv() => {
                msg.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed"))
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

type Endpoint = (
    mpsc::UnboundedSender<Vec<u8>>,
    mpsc::UnboundedReceiver<Vec<u8>>,
);

struct TestFactory {
    endpoints: Mutex<Vec<Endpoint>>,
}

impl TestFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(Vec::new()),
        })
    }

    fn take_endpoint(&self, index: usize) -> Endpoint {
        let mut endpoints = self.endpoints.lock().unwrap();
        let (feed_tx, delivered_rx) = endpoints.remove(index);
        (feed_tx, delivered_rx)
    }
}

#[async_trait]
impl ForwardFactory for TestFactory {
    async fn open(&self, _tuple: &FlowTuple) -> Result<Arc<dyn Forward>, SessionError> {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        self.endpoints
            .lock()
            .unwrap()
            .push((feed_tx, delivered_rx));
        Ok(Arc::new(TestForward {
            delivered: delivered_tx,
            feed: tokio::sync::Mutex::new(feed_rx),
            closed: CancellationToken::new(),
        }))
    }
}

fn decoy() -> Vec<Vec<u8>> {
    vec![b"hello".to_vec(), b"world".to_vec()]
}

fn config(decoy: Vec<Vec<u8>>) -> TunnelConfig {
    TunnelConfig {
        decoy,
        handshake_timeout: Duration::from_secs(5),
        // Keep the keepalive machinery quiet during short tests.
        keepalive: Duration::from_secs(60),
        session_keepalive: Duration::from_secs(60),
        ..TunnelConfig::default()
    }
}

fn preshared(cfg: TunnelConfig, key: TunnelKey) -> TunnelConfig {
    TunnelConfig {
        negotiator: Arc::new(PresharedSecret::new(key)),
        ..cfg
    }
}

fn stacks() -> (Arc<MemStack>, Arc<MemStack>) {
    let c = Ipv4Addr::new(10, 82, 0, 1);
    let s = Ipv4Addr::new(10, 82, 0, 2);
    (Arc::new(MemStack::new(c, s)), Arc::new(MemStack::new(s, c)))
}

/// Bring up a connected client/server pair with dispatch loops running.
async fn connect(
    client_cfg: TunnelConfig,
    server_cfg: TunnelConfig,
) -> (Conn, Conn, Arc<TestFactory>) {
    init_tracing();
    let (c_link, s_link) = MemLink::test_pair();
    let (c_stack, s_stack) = stacks();
    let client_factory = TestFactory::new();

    let server_task = tokio::spawn(async move {
        Conn::accept(Arc::new(s_link), s_stack, Arc::new(EchoFactory), server_cfg).await
    });
    let client = Conn::dial(
        Arc::new(c_link),
        c_stack,
        client_factory.clone(),
        client_cfg,
    )
    .await
    .unwrap();
    let server = server_task.await.unwrap().unwrap();

    client.spawn_dispatch();
    server.spawn_dispatch();
    (client, server, client_factory)
}

fn flow(port: u16) -> FlowTuple {
    FlowTuple {
        src: format!("10.0.0.7:{port}").parse().unwrap(),
        proto: Proto::Tcp,
        dst: "93.184.216.34:443".parse().unwrap(),
    }
}

#[tokio::test]
async fn test_echo_roundtrip_encrypted() {
    let key = TunnelKey::generate();
    let (client, server, factory) =
        connect(preshared(config(decoy()), key), preshared(config(decoy()), key)).await;
    assert_eq!(client.state(), State::Transmitting);
    assert_eq!(server.state(), State::Transmitting);
    assert_eq!(client.role(), Role::Client);

    let id = client.open_session(flow(50000)).await.unwrap();
    assert_ne!(id, 0);
    let (feed, mut delivered) = factory.take_endpoint(0);

    feed.send(b"through the looking glass".to_vec()).unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), delivered.recv())
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, b"through the looking glass");
}

#[tokio::test]
async fn test_echo_roundtrip_plaintext() {
    let (client, _server, factory) = connect(config(decoy()), config(decoy())).await;

    let id = client.open_session(flow(50001)).await.unwrap();
    let (feed, mut delivered) = factory.take_endpoint(0);

    for round in 0..5u8 {
        feed.send(vec![round; 100]).unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), delivered.recv())
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(echoed, vec![round; 100]);
    }
    assert_ne!(id, 0);
}

#[tokio::test]
async fn test_dial_fails_on_decoy_mismatch() {
    init_tracing();
    let key = TunnelKey::generate();
    let bad = vec![b"hello".to_vec(), b"WORLD".to_vec()];

    let (c_link, s_link) = MemLink::test_pair();
    let (c_stack, s_stack) = stacks();

    let server_task = tokio::spawn(async move {
        Conn::accept(
            Arc::new(s_link),
            s_stack,
            Arc::new(EchoFactory),
            preshared(config(bad), key),
        )
        .await
    });
    let err = Conn::dial(
        Arc::new(c_link),
        c_stack,
        TestFactory::new(),
        preshared(config(decoy()), key),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        mirage_tunnel::Error::Handshake(HandshakeError::PrevPacketInvalid(1))
    ));
    // The server aborts too, within its handshake timeout.
    let server_res = tokio::time::timeout(Duration::from_secs(10), server_task)
        .await
        .unwrap()
        .unwrap();
    assert!(server_res.is_err());
}

#[tokio::test]
async fn test_session_lifecycle_via_control_channel() {
    let (client, server, _factory) = connect(config(decoy()), config(decoy())).await;

    let id = client.open_session(flow(50002)).await.unwrap();
    assert_eq!(client.sessions().len(), 1);
    assert_eq!(server.sessions().len(), 1);

    // Reopening the same flow must land on the same session.
    let again = client.open_session(flow(50002)).await.unwrap();
    assert_eq!(again, id);
    assert_eq!(server.sessions().len(), 1);

    client.close_session(id).await.unwrap();
    assert_eq!(client.sessions().len(), 0);
    // The server removes its side when the DelSession RPC lands.
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.sessions().len() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server kept the session");
}

#[tokio::test]
async fn test_distinct_flows_get_distinct_sessions() {
    let (client, _server, factory) = connect(config(decoy()), config(decoy())).await;

    let a = client.open_session(flow(50003)).await.unwrap();
    let b = client.open_session(flow(50004)).await.unwrap();
    assert_ne!(a, b);

    let (feed_a, mut delivered_a) = factory.take_endpoint(0);
    let (feed_b, mut delivered_b) = factory.take_endpoint(0);

    feed_a.send(b"first flow".to_vec()).unwrap();
    feed_b.send(b"second flow".to_vec()).unwrap();

    let got_a = tokio::time::timeout(Duration::from_secs(5), delivered_a.recv())
        .await
        .unwrap()
        .unwrap();
    let got_b = tokio::time::timeout(Duration::from_secs(5), delivered_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got_a, b"first flow");
    assert_eq!(got_b, b"second flow");
}

#[tokio::test]
async fn test_peer_loss_reported_over_control() {
    let (client, _server, _factory) = connect(config(decoy()), config(decoy())).await;
    let loss = client.peer_loss().await.unwrap();
    assert_eq!(loss, 0.0);
}

#[tokio::test]
async fn test_close_cascades_and_is_idempotent() {
    let (client, server, _factory) = connect(config(decoy()), config(decoy())).await;
    client.open_session(flow(50005)).await.unwrap();

    client.close().await.unwrap();
    client.close().await.unwrap();
    assert_eq!(client.state(), State::Closed);
    assert_eq!(client.sessions().len(), 0);

    let err = client.send(1, b"after close").await.unwrap_err();
    assert!(matches!(err, mirage_tunnel::Error::Closed(_)));

    // The server notices the dead transport the next time it touches it.
    let res = tokio::time::timeout(Duration::from_secs(5), server.recv()).await;
    assert!(matches!(res, Ok(Err(_))));
}

#[tokio::test]
async fn test_control_desync_closes_the_connection() {
    let (client, server, _factory) = connect(config(decoy()), config(decoy())).await;

    // A malformed frame on the control session: the length prefix claims
    // far more than the frame cap allows.
    client.send(0, &[0xFF, 0xFF, 1, 2, 3]).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while server.state() != State::Closed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server survived a control desync");

    let err = server.send(1, b"x").await.unwrap_err();
    assert!(
        matches!(err, mirage_tunnel::Error::Closed(ref cause) if cause.contains("desync")),
        "unexpected cause: {err}"
    );
}

#[tokio::test]
async fn test_unflushed_close_surfaces_as_error() {
    init_tracing();
    let client_cfg = TunnelConfig {
        close_timeout: Duration::from_millis(50),
        ..config(decoy())
    };
    let server_cfg = config(decoy());

    let (c_link, s_link) = MemLink::test_pair();
    let (c_stack, s_stack) = stacks();
    let server_task = tokio::spawn(async move {
        Conn::accept(Arc::new(s_link), s_stack, Arc::new(EchoFactory), server_cfg).await
    });
    let client = Conn::dial(Arc::new(c_link), c_stack, TestFactory::new(), client_cfg)
        .await
        .unwrap();
    let _server = server_task.await.unwrap().unwrap();

    // Neither end runs a dispatch loop, so the client's initial config RPC
    // never gets its reply and sits on the control stream for good. The
    // shutdown FIN cannot be flushed behind it.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client.close().await.unwrap_err();
    assert!(
        matches!(err, mirage_tunnel::Error::Closed(ref cause) if cause.contains("timed out")),
        "unexpected cause: {err}"
    );
    assert_eq!(client.state(), State::Closed);
    // Repeated close keeps returning the stored unclean cause.
    assert!(client.close().await.is_err());
}

#[tokio::test]
async fn test_decrypt_failures_tolerated_only_inside_grace_window() {
    init_tracing();
    let key = TunnelKey::generate();
    let client_cfg = TunnelConfig {
        grace: Duration::from_secs(2),
        ..preshared(config(decoy()), key)
    };
    let server_cfg = preshared(config(decoy()), key);

    let (c_link, s_link) = MemLink::test_pair();
    let s_link = Arc::new(s_link);
    let (c_stack, s_stack) = stacks();

    let accept_link = s_link.clone();
    let server_task = tokio::spawn(async move {
        Conn::accept(accept_link, s_stack, Arc::new(EchoFactory), server_cfg).await
    });
    let client = Conn::dial(Arc::new(c_link), c_stack, TestFactory::new(), client_cfg)
        .await
        .unwrap();
    let server = server_task.await.unwrap().unwrap();

    // A marked segment whose payload never went through the cipher.
    let forged = |seq: u32| {
        let mut seg = vec![0u8; TCP_HEADER_LEN + 32];
        TcpHeader {
            src_port: s_link.local_addr().port(),
            dst_port: s_link.remote_addr().port(),
            seq,
            ack: 1,
            flags: SEGMENT_FLAGS,
            window: SEGMENT_WINDOW,
            marked: true,
        }
        .encode(&mut seg);
        seg
    };

    // Inside the window the forgery is counted and skipped; the next
    // genuine frame still comes through.
    s_link.send(&forged(1)).await.unwrap();
    server.send(5, b"genuine").await.unwrap();
    let (id, payload) = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("recv timed out")
        .unwrap();
    assert_eq!((id, payload.as_slice()), (5, b"genuine".as_slice()));
    assert!(client.stats().auth_failures >= 1);

    // Past the window the same forgery is fatal.
    tokio::time::sleep(Duration::from_millis(2200)).await;
    s_link.send(&forged(2)).await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("recv timed out")
        .unwrap_err();
    assert!(matches!(
        err,
        mirage_tunnel::Error::Crypto(CryptoError::Authentication)
    ));
    assert_eq!(client.state(), State::Closed);
}

#[tokio::test]
async fn test_oversized_payload_is_rejected_not_fatal() {
    let (client, _server, _factory) = connect(config(decoy()), config(decoy())).await;

    let huge = vec![0u8; 64 * 1024];
    let err = client.send(9, &huge).await.unwrap_err();
    assert!(matches!(err, mirage_tunnel::Error::TooLarge { .. }));
    assert!(err.is_temporary());

    // The connection is still healthy.
    client.send(9, b"small enough").await.unwrap();
    assert_eq!(client.state(), State::Transmitting);
}
