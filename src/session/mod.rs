//! Session multiplexing
//!
//! Every proxied flow becomes a [`Session`] identified by a 16-bit ID that
//! prefixes its payloads on the tunnel. The [`SessionMgr`] owns all live
//! sessions for one tunnel connection, keeps the ID index and the
//! flow-tuple dedup index consistent under one read-write lock, and runs a
//! per-session downlink pump plus an idle watchdog.
//!
//! Sessions never hold a reference back to the tunnel connection; they send
//! through the narrow [`TunnelOutbound`] capability instead.

mod id;
mod idle;

pub use id::{IdMgr, INVALID_ID};
pub use idle::IdleGauge;

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Session layer errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session ID: {0}")]
    InvalidId(u16),

    #[error("Session ID space exhausted")]
    SessionExceeded,

    #[error("Session keepalive exceeded")]
    KeepaliveExceeded,

    #[error("Forwarding endpoint error: {0}")]
    Forward(#[from] std::io::Error),

    #[error("Session closed: {0}")]
    Closed(String),
}

impl SessionError {
    /// Recoverable for the tunnel: the offending frame is dropped, the
    /// tunnel keeps running.
    pub fn is_temporary(&self) -> bool {
        !matches!(self, SessionError::Closed(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::KeepaliveExceeded)
    }
}

/// Transport protocol of a proxied flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Proto {
    Tcp = 6,
    Udp = 17,
}

impl Proto {
    pub fn number(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Proto {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            6 => Ok(Proto::Tcp),
            17 => Ok(Proto::Udp),
            other => Err(other),
        }
    }
}

/// The 5-tuple (collapsed to 3 fields) identifying one proxied flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub src: SocketAddr,
    pub proto: Proto,
    pub dst: SocketAddr,
}

impl std::fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:?}/{}", self.src, self.proto, self.dst)
    }
}

/// A session's local forwarding endpoint (the socket relaying to the real
/// destination on the server, or back to the captured application on the
/// client). Owned by exactly one session.
#[async_trait]
pub trait Forward: Send + Sync {
    /// Push one tunnel payload out the local endpoint.
    async fn send(&self, payload: &[u8]) -> std::io::Result<()>;

    /// Pull one payload arriving at the local endpoint.
    async fn recv(&self) -> std::io::Result<Vec<u8>>;

    /// Release the endpoint. Idempotent; unblocks a pending `recv`.
    fn close(&self);
}

/// Opens forwarding endpoints for new sessions.
#[async_trait]
pub trait ForwardFactory: Send + Sync {
    async fn open(&self, tuple: &FlowTuple) -> Result<Arc<dyn Forward>, SessionError>;
}

/// The one capability a session needs from the tunnel: send a payload under
/// its ID. Breaks the Session → Conn ownership cycle.
#[async_trait]
pub trait TunnelOutbound: Send + Sync {
    async fn send_session(&self, id: u16, payload: &[u8]) -> crate::Result<()>;
}

/// One multiplexed proxied flow.
pub struct Session {
    id: u16,
    tuple: FlowTuple,
    forward: Arc<dyn Forward>,
    idle: IdleGauge,
    cancel: CancellationToken,
    cause: OnceLock<String>,
    /// Whether the ID came from our own allocator (server side) and must be
    /// returned to it on removal.
    owned_id: bool,
}

impl Session {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn tuple(&self) -> &FlowTuple {
        &self.tuple
    }

    /// Deliver one inbound tunnel payload to the local endpoint.
    pub async fn inject(&self, payload: &[u8]) -> std::io::Result<()> {
        self.forward.send(payload).await?;
        self.idle.touch();
        Ok(())
    }

    /// Terminal cause, once closed.
    pub fn close_cause(&self) -> Option<&str> {
        self.cause.get().map(String::as_str)
    }

    fn close(&self, cause: &SessionError) {
        // Set-once: the first close wins, later causes are dropped.
        let _ = self.cause.set(cause.to_string());
        self.cancel.cancel();
        self.forward.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tuple", &self.tuple)
            .finish()
    }
}

#[derive(Default)]
struct Indexes {
    by_id: HashMap<u16, Arc<Session>>,
    by_tuple: HashMap<FlowTuple, u16>,
}

/// Owns every live session of one tunnel connection.
pub struct SessionMgr {
    inner: RwLock<Indexes>,
    ids: Mutex<IdMgr>,
    factory: Arc<dyn ForwardFactory>,
    outbound: Arc<dyn TunnelOutbound>,
    keepalive: Duration,
    cancel: CancellationToken,
}

impl SessionMgr {
    /// `cancel` is the owning connection's token; closing the connection
    /// stops every pump spawned here.
    pub fn new(
        factory: Arc<dyn ForwardFactory>,
        outbound: Arc<dyn TunnelOutbound>,
        keepalive: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Indexes::default()),
            ids: Mutex::new(IdMgr::new()),
            factory,
            outbound,
            keepalive,
            cancel,
        })
    }

    /// Server-side add: allocate an ID for `tuple`, open its forwarding
    /// endpoint and start its pumps. Idempotent per tuple, so a retried
    /// add RPC lands on the existing session.
    pub async fn add(self: &Arc<Self>, tuple: FlowTuple) -> Result<u16, SessionError> {
        if let Some(id) = self.lookup_tuple(&tuple) {
            trace!(%tuple, id, "add deduplicated");
            return Ok(id);
        }
        let id = self.ids.lock().unwrap_or_else(|e| e.into_inner()).get()?;
        match self.install(id, tuple, true).await {
            Ok(id) => Ok(id),
            Err(e) => {
                self.ids.lock().unwrap_or_else(|e| e.into_inner()).put(id);
                Err(e)
            }
        }
    }

    /// Client-side add: adopt the server-assigned ID for `tuple`.
    pub async fn adopt(self: &Arc<Self>, id: u16, tuple: FlowTuple) -> Result<u16, SessionError> {
        if let Some(existing) = self.lookup_tuple(&tuple) {
            return Ok(existing);
        }
        self.install(id, tuple, false).await
    }

    async fn install(
        self: &Arc<Self>,
        id: u16,
        tuple: FlowTuple,
        owned_id: bool,
    ) -> Result<u16, SessionError> {
        let forward = self.factory.open(&tuple).await?;
        let session = Arc::new(Session {
            id,
            tuple,
            forward,
            idle: IdleGauge::new(),
            cancel: self.cancel.child_token(),
            cause: OnceLock::new(),
            owned_id,
        });

        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            // Lost a race against a concurrent add of the same tuple. The
            // allocated ID goes back on the free list or it leaks.
            if let Some(existing) = inner.by_tuple.get(&tuple) {
                let existing = *existing;
                drop(inner);
                session.forward.close();
                if owned_id {
                    self.ids.lock().unwrap_or_else(|e| e.into_inner()).put(id);
                }
                return Ok(existing);
            }
            inner.by_id.insert(id, session.clone());
            inner.by_tuple.insert(tuple, id);
        }

        self.spawn_downlink(session.clone());
        self.spawn_watchdog(session.clone());
        debug!(id, %tuple, "session added");
        Ok(id)
    }

    /// Route one inbound tunnel frame to its session. Unknown IDs are
    /// temporary errors; the frame is dropped and the tunnel keeps going.
    pub async fn dispatch(&self, id: u16, payload: &[u8]) -> Result<(), SessionError> {
        let session = self.get(id)?;
        if let Err(e) = session.inject(payload).await {
            warn!(id, error = %e, "forwarding endpoint failed, removing session");
            let cause = SessionError::Forward(e);
            self.del(id, &cause);
            return Err(cause);
        }
        Ok(())
    }

    pub fn get(&self, id: u16) -> Result<Arc<Session>, SessionError> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_id
            .get(&id)
            .cloned()
            .ok_or(SessionError::InvalidId(id))
    }

    /// Remove a session from both indices, release its endpoint, record
    /// `cause` as its terminal error.
    pub fn del(&self, id: u16, cause: &SessionError) -> Option<Arc<Session>> {
        let session = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let session = inner.by_id.remove(&id)?;
            inner.by_tuple.remove(&session.tuple);
            session
        };
        if session.owned_id {
            self.ids.lock().unwrap_or_else(|e| e.into_inner()).put(id);
        }
        session.close(cause);
        debug!(id, %cause, "session removed");
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session with the same cause. Used by connection teardown.
    pub fn close_all(&self, cause: &SessionError) {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.by_tuple.clear();
            inner.by_id.drain().map(|(_, s)| s).collect()
        };
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        for session in sessions {
            if session.owned_id {
                ids.put(session.id);
            }
            session.close(cause);
        }
    }

    fn lookup_tuple(&self, tuple: &FlowTuple) -> Option<u16> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_tuple
            .get(tuple)
            .copied()
    }

    /// Pump payloads arriving at the forwarding endpoint back through the
    /// tunnel under this session's ID.
    fn spawn_downlink(self: &Arc<Self>, session: Arc<Session>) {
        let mgr = Arc::downgrade(self);
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = session.cancel.cancelled() => return,
                    res = session.forward.recv() => match res {
                        Ok(p) => p,
                        Err(e) => {
                            remove(&mgr, session.id, &SessionError::Forward(e));
                            return;
                        }
                    },
                };
                session.idle.touch();
                if let Err(e) = outbound.send_session(session.id, &payload).await {
                    trace!(id = session.id, error = %e, "downlink send failed");
                    remove(&mgr, session.id, &SessionError::Closed(e.to_string()));
                    return;
                }
            }
        });
    }

    fn spawn_watchdog(self: &Arc<Self>, session: Arc<Session>) {
        let mgr = Arc::downgrade(self);
        let keepalive = self.keepalive;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; it arms the sentinel.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if session.idle.tick() {
                            remove(&mgr, session.id, &SessionError::KeepaliveExceeded);
                            return;
                        }
                    }
                }
            }
        });
    }
}

fn remove(mgr: &Weak<SessionMgr>, id: u16, cause: &SessionError) {
    if let Some(mgr) = mgr.upgrade() {
        mgr.del(id, cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Forward endpoint backed by channels: `send` lands in `delivered`,
    /// `recv` drains `feed`.
    struct MemForward {
        delivered: mpsc::UnboundedSender<Vec<u8>>,
        feed: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        closed: CancellationToken,
    }

    #[async_trait]
    impl Forward for MemForward {
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
                msg = feed.recv() => msg.ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed")
                }),
            }
        }

        fn close(&self) {
            self.closed.cancel();
        }
    }

    struct MemFactory {
        opened: std::sync::atomic::AtomicUsize,
        /// Handles to feed/observe each opened endpoint, keyed by order.
        endpoints: Mutex<Vec<(mpsc::UnboundedSender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>)>>,
    }

    impl MemFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                opened: Default::default(),
                endpoints: Mutex::new(Vec::new()),
            })
        }

        fn opened(&self) -> usize {
            self.opened.load(std::sync::atomic::Ordering::Acquire)
        }
    }

    #[async_trait]
    impl ForwardFactory for MemFactory {
        async fn open(&self, _tuple: &FlowTuple) -> Result<Arc<dyn Forward>, SessionError> {
            self.opened.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            let (feed_tx, feed_rx) = mpsc::unbounded_channel();
            let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
            self.endpoints.lock().unwrap().push((feed_tx, deliver_rx));
            Ok(Arc::new(MemForward {
                delivered: deliver_tx,
                feed: tokio::sync::Mutex::new(feed_rx),
                closed: CancellationToken::new(),
            }))
        }
    }

    struct RecordingOutbound {
        sent: mpsc::UnboundedSender<(u16, Vec<u8>)>,
    }

    #[async_trait]
    impl TunnelOutbound for RecordingOutbound {
        async fn send_session(&self, id: u16, payload: &[u8]) -> crate::Result<()> {
            self.sent
                .send((id, payload.to_vec()))
                .map_err(|_| crate::Error::Closed("test sink gone".to_string()))
        }
    }

    fn tuple(port: u16) -> FlowTuple {
        FlowTuple {
            src: format!("10.0.0.1:{port}").parse().unwrap(),
            proto: Proto::Tcp,
            dst: "93.184.216.34:80".parse().unwrap(),
        }
    }

    fn mgr_with(
        keepalive: Duration,
    ) -> (
        Arc<SessionMgr>,
        Arc<MemFactory>,
        mpsc::UnboundedReceiver<(u16, Vec<u8>)>,
    ) {
        let factory = MemFactory::new();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let mgr = SessionMgr::new(
            factory.clone(),
            Arc::new(RecordingOutbound { sent: sent_tx }),
            keepalive,
            CancellationToken::new(),
        );
        (mgr, factory, sent_rx)
    }

    #[tokio::test]
    async fn test_add_is_idempotent_per_tuple() {
        let (mgr, factory, _rx) = mgr_with(Duration::from_secs(60));
        let a = mgr.add(tuple(1000)).await.unwrap();
        let b = mgr.add(tuple(1000)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(factory.opened(), 1);
        assert_eq!(mgr.len(), 1);
    }

    /// Factory whose first two opens rendezvous before returning, so two
    /// concurrent adds of the same tuple both pass the dedup check and
    /// allocate an ID before either installs.
    struct GatedFactory {
        barrier: tokio::sync::Barrier,
        opened: std::sync::atomic::AtomicUsize,
        endpoints: Mutex<Vec<(mpsc::UnboundedSender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>)>>,
    }

    #[async_trait]
    impl ForwardFactory for GatedFactory {
        async fn open(&self, _tuple: &FlowTuple) -> Result<Arc<dyn Forward>, SessionError> {
            let n = self.opened.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            if n < 2 {
                self.barrier.wait().await;
            }
            let (feed_tx, feed_rx) = mpsc::unbounded_channel();
            let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
            self.endpoints.lock().unwrap().push((feed_tx, deliver_rx));
            Ok(Arc::new(MemForward {
                delivered: deliver_tx,
                feed: tokio::sync::Mutex::new(feed_rx),
                closed: CancellationToken::new(),
            }))
        }
    }

    #[tokio::test]
    async fn test_racing_adds_do_not_leak_ids() {
        let factory = Arc::new(GatedFactory {
            barrier: tokio::sync::Barrier::new(2),
            opened: Default::default(),
            endpoints: Mutex::new(Vec::new()),
        });
        let (sent_tx, _sent_rx) = mpsc::unbounded_channel();
        let mgr = SessionMgr::new(
            factory,
            Arc::new(RecordingOutbound { sent: sent_tx }),
            Duration::from_secs(60),
            CancellationToken::new(),
        );

        let (a, b) = tokio::join!(mgr.add(tuple(1)), mgr.add(tuple(1)));
        let winner = a.unwrap();
        assert_eq!(winner, b.unwrap());
        assert_eq!(mgr.len(), 1);

        // The loser's ID went back on the free list, so a fresh tuple
        // reuses it instead of growing the ID space.
        let next = mgr.add(tuple(2)).await.unwrap();
        assert_ne!(next, winner);
        assert!(next <= 2, "racing add leaked an id: got {next}");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_id_is_temporary() {
        let (mgr, _factory, _rx) = mgr_with(Duration::from_secs(60));
        let err = mgr.dispatch(42, b"payload").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidId(42)));
        assert!(err.is_temporary());
    }

    #[tokio::test]
    async fn test_del_releases_id_for_reuse() {
        let (mgr, _factory, _rx) = mgr_with(Duration::from_secs(60));
        let a = mgr.add(tuple(1)).await.unwrap();
        mgr.del(a, &SessionError::Closed("test".to_string()));
        assert_eq!(mgr.len(), 0);
        let b = mgr.add(tuple(2)).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_dispatch_reaches_forward_endpoint() {
        let (mgr, factory, _rx) = mgr_with(Duration::from_secs(60));
        let id = mgr.add(tuple(1)).await.unwrap();
        mgr.dispatch(id, b"inbound bytes").await.unwrap();

        let mut endpoints = factory.endpoints.lock().unwrap();
        let delivered = endpoints[0].1.try_recv().unwrap();
        assert_eq!(delivered, b"inbound bytes");
    }

    #[tokio::test]
    async fn test_downlink_pump_sends_under_session_id() {
        let (mgr, factory, mut rx) = mgr_with(Duration::from_secs(60));
        let id = mgr.add(tuple(1)).await.unwrap();

        let feed = factory.endpoints.lock().unwrap()[0].0.clone();
        feed.send(b"reply bytes".to_vec()).unwrap();

        let (got_id, payload) = rx.recv().await.unwrap();
        assert_eq!(got_id, id);
        assert_eq!(payload, b"reply bytes");
    }

    #[tokio::test]
    async fn test_idle_session_closed_by_watchdog() {
        let (mgr, _factory, _rx) = mgr_with(Duration::from_millis(20));
        let id = mgr.add(tuple(1)).await.unwrap();
        let session = mgr.get(id).unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(mgr.len(), 0);
        assert_eq!(
            session.close_cause(),
            Some(SessionError::KeepaliveExceeded.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_active_session_survives_watchdog() {
        let (mgr, _factory, _rx) = mgr_with(Duration::from_millis(40));
        let id = mgr.add(tuple(1)).await.unwrap();
        for _ in 0..10 {
            mgr.dispatch(id, b"keep me alive").await.unwrap();
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_records_cause() {
        let (mgr, _factory, _rx) = mgr_with(Duration::from_secs(60));
        let a = mgr.get(mgr.add(tuple(1)).await.unwrap()).unwrap();
        let b = mgr.get(mgr.add(tuple(2)).await.unwrap()).unwrap();
        mgr.close_all(&SessionError::Closed("tunnel down".to_string()));
        assert!(mgr.is_empty());
        assert!(a.close_cause().unwrap().contains("tunnel down"));
        assert!(b.close_cause().unwrap().contains("tunnel down"));
    }

    #[tokio::test]
    async fn test_adopted_ids_are_not_recycled() {
        let (mgr, _factory, _rx) = mgr_with(Duration::from_secs(60));
        mgr.adopt(500, tuple(1)).await.unwrap();
        mgr.del(500, &SessionError::Closed("test".to_string()));
        // A fresh server-side allocation must not hand back the adopted ID.
        let next = mgr.add(tuple(2)).await.unwrap();
        assert_ne!(next, 500);
    }
}
