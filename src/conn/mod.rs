//! Tunnel connection
//!
//! [`Conn`] composes the whole stack: raw transport at the bottom, FakeTCP
//! disguise and AEAD framing in the middle, session multiplexing and the
//! embedded control channel on top. It exposes send/recv of
//! (session ID, payload) pairs plus an idempotent close.
//!
//! The handshake runs exactly once per connection: `dial`/`accept` drive it
//! eagerly, and a send or recv on a not-yet-established connection awaits
//! the same single run instead of starting another.
//!
//! Ownership is strictly downward. Sessions and the control bridge reach
//! back into the connection only through the narrow [`TunnelOutbound`]
//! capability holding a weak reference, so dropping the last [`Conn`] clone
//! tears everything down.

use crate::config::TunnelConfig;
use crate::control::{
    AddOutcome, ControlClient, ControlHandler, ControlServer, StackBridge,
};
use crate::crypto::{SegmentCipher, TAG_LEN};
use crate::disguise::{PseudoSum, Tracker, TCP_HEADER_LEN};
use crate::handshake::{self, State};
use crate::session::{
    FlowTuple, ForwardFactory, SessionError, SessionMgr, TunnelOutbound,
};
use crate::stack::NetStack;
use crate::transport::{RawTransport, TransportError};
use crate::{CONTROL_SESSION, SESSION_ID_LEN};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Which end of the tunnel this connection is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Virtual addresses of the embedded control network, fixed by role.
const CONTROL_IP_CLIENT: Ipv4Addr = Ipv4Addr::new(10, 82, 0, 1);
const CONTROL_IP_SERVER: Ipv4Addr = Ipv4Addr::new(10, 82, 0, 2);

fn control_ips(role: Role) -> (Ipv4Addr, Ipv4Addr) {
    match role {
        Role::Client => (CONTROL_IP_CLIENT, CONTROL_IP_SERVER),
        Role::Server => (CONTROL_IP_SERVER, CONTROL_IP_CLIENT),
    }
}

/// Receive-path counters, exported via [`Conn::stats`] and the PackLoss
/// control RPC.
#[derive(Default)]
struct Stats {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    auth_failures: AtomicU64,
    foreign: AtomicU64,
    drops: AtomicU64,
}

impl Stats {
    fn loss(&self) -> f32 {
        let bad = self.auth_failures.load(Ordering::Acquire) + self.drops.load(Ordering::Acquire);
        let total = self.frames_in.load(Ordering::Acquire) + bad;
        if total == 0 {
            0.0
        } else {
            bad as f32 / total as f32
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StatsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub auth_failures: u64,
    pub foreign: u64,
    pub drops: u64,
    pub loss: f32,
}

/// Everything that only exists after the handshake.
struct Established {
    cipher: Option<SegmentCipher>,
    bridge: StackBridge,
    /// Client side only; the server answers RPCs instead of issuing them.
    control: Option<Arc<ControlClient>>,
    /// Decrypt failures before this instant are retried, not fatal: the
    /// final handshake segment and the first data segment may race.
    grace_until: tokio::time::Instant,
}

struct RecvState {
    buf: Vec<u8>,
    /// Segments that arrived during the handshake's final race window.
    parked: VecDeque<Vec<u8>>,
}

struct Shared {
    role: Role,
    cfg: TunnelConfig,
    transport: Arc<dyn RawTransport>,
    stack: Arc<dyn NetStack>,
    tracker: Tracker,
    established: OnceCell<Established>,
    sessions: OnceLock<Arc<SessionMgr>>,
    /// Serializes attach+seal+write so wire order matches seq order.
    send_lock: Mutex<()>,
    recv_state: Mutex<RecvState>,
    cancel: CancellationToken,
    /// Terminal cause and whether the close was user-initiated.
    close_state: OnceLock<(String, bool)>,
    handshaking: AtomicBool,
    stats: Stats,
    /// Tunnel MTU, possibly lowered by the peer's InitConfig.
    effective_mtu: AtomicUsize,
}

impl Shared {
    fn closed_error(&self) -> crate::Error {
        let cause = self
            .close_state
            .get()
            .map(|(c, _)| c.clone())
            .unwrap_or_else(|| "connection closed".to_string());
        crate::Error::Closed(cause)
    }

    /// Record the terminal cause and tear down everything owned. The first
    /// caller wins; later causes are dropped, not merged over.
    fn record_close(&self, cause: String, clean: bool) -> bool {
        if self.close_state.set((cause.clone(), clean)).is_err() {
            return false;
        }
        debug!(role = ?self.role, %cause, "connection closing");
        if let Some(mgr) = self.sessions.get() {
            mgr.close_all(&SessionError::Closed(cause));
        }
        self.cancel.cancel();
        self.stack.close();
        self.transport.close();
        true
    }

    fn fatal(&self, err: crate::Error) -> crate::Error {
        self.record_close(err.to_string(), false);
        err
    }

    /// The raw transport reported closed. If we did not close it ourselves
    /// the peer went away; cascade the teardown.
    fn transport_gone(&self) -> crate::Error {
        if self.close_state.get().is_some() {
            self.closed_error()
        } else {
            self.fatal(crate::Error::Closed("raw transport closed".to_string()))
        }
    }

    async fn established(self: &Arc<Self>) -> crate::Result<&Established> {
        if self.close_state.get().is_some() {
            return Err(self.closed_error());
        }
        self.established
            .get_or_try_init(|| self.run_handshake())
            .await
    }

    async fn run_handshake(self: &Arc<Self>) -> crate::Result<Established> {
        self.handshaking.store(true, Ordering::Release);
        let outcome = handshake::run(
            self.role,
            self.transport.as_ref(),
            &self.tracker,
            &self.cfg.decoy,
            self.cfg.negotiator.as_ref(),
            self.cfg.handshake_timeout,
            &self.cancel,
        )
        .await
        .map_err(|e| self.fatal(e.into()))?;

        let cipher = if outcome.key.is_zero() {
            None
        } else {
            let pseudo = self.tracker.pseudo();
            let cipher = match self.role {
                Role::Client => SegmentCipher::client(&outcome.key, &outcome.transcript, pseudo),
                Role::Server => SegmentCipher::server(&outcome.key, &outcome.transcript, pseudo),
            }
            .map_err(|e| self.fatal(e.into()))?;
            Some(cipher)
        };

        let (local_ip, peer_ip) = control_ips(self.role);
        let bridge = StackBridge::new(self.stack.clone(), local_ip, peer_ip);
        bridge.spawn_outbound(
            Arc::new(SegmentSender {
                shared: Arc::downgrade(self),
            }),
            self.cancel.child_token(),
        );

        let control = match self.role {
            Role::Client => {
                let stream = self
                    .stack
                    .dial_control()
                    .await
                    .map_err(|e| self.fatal(e.into()))?;
                Some(Arc::new(ControlClient::new(stream)))
            }
            Role::Server => {
                let stream = self
                    .stack
                    .accept_control()
                    .await
                    .map_err(|e| self.fatal(e.into()))?;
                let handler = Arc::new(SessionControl {
                    shared: Arc::downgrade(self),
                });
                let cancel = self.cancel.child_token();
                let weak = Arc::downgrade(self);
                tokio::spawn(async move {
                    if let Err(e) = ControlServer::serve(stream, handler, cancel).await {
                        warn!(error = %e, "control server stopped");
                        if let Some(shared) = weak.upgrade() {
                            shared.record_close(format!("control channel failed: {e}"), false);
                        }
                    }
                });
                None
            }
        };

        if !outcome.parked.is_empty() {
            self.recv_state.lock().await.parked.extend(outcome.parked);
        }

        Ok(Established {
            cipher,
            bridge,
            control,
            grace_until: tokio::time::Instant::now() + self.cfg.grace,
        })
    }

    async fn send_frame(self: &Arc<Self>, id: u16, payload: &[u8]) -> crate::Result<()> {
        let est = self.established().await?;
        let trailer = if est.cipher.is_some() { TAG_LEN } else { 0 };
        let max = self
            .effective_mtu
            .load(Ordering::Acquire)
            .saturating_sub(TCP_HEADER_LEN + SESSION_ID_LEN + trailer);
        if payload.len() > max {
            return Err(crate::Error::TooLarge {
                len: payload.len(),
                max,
            });
        }

        let mut seg = Vec::with_capacity(TCP_HEADER_LEN + SESSION_ID_LEN + payload.len() + trailer);
        seg.resize(TCP_HEADER_LEN, 0);
        seg.extend_from_slice(&id.to_be_bytes());
        seg.extend_from_slice(payload);

        let _guard = self.send_lock.lock().await;
        if self.close_state.get().is_some() {
            return Err(self.closed_error());
        }
        self.tracker.attach(&mut seg, trailer)?;
        if let Some(cipher) = &est.cipher {
            cipher.seal(&mut seg).map_err(|e| self.fatal(e.into()))?;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.closed_error()),
            res = self.transport.send(&seg) => match res {
                Ok(()) => {}
                Err(TransportError::Closed) => return Err(self.transport_gone()),
                Err(e) => return Err(self.fatal(e.into())),
            },
        }
        self.stats.frames_out.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn recv_frame(self: &Arc<Self>) -> crate::Result<(u16, Vec<u8>)> {
        let est = self.established().await?;
        let mut state = self.recv_state.lock().await;
        loop {
            if self.close_state.get().is_some() {
                return Err(self.closed_error());
            }
            let mut seg = if let Some(parked) = state.parked.pop_front() {
                parked
            } else {
                let n = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(self.closed_error()),
                    res = self.transport.recv(&mut state.buf) => match res {
                        Ok(n) => n,
                        Err(TransportError::Closed) => return Err(self.transport_gone()),
                        Err(e) => return Err(self.fatal(e.into())),
                    },
                };
                state.buf[..n].to_vec()
            };

            if self.tracker.detach(&seg).is_err() {
                // Genuine TCP traffic or probe on our port pair.
                self.stats.foreign.fetch_add(1, Ordering::AcqRel);
                trace!(len = seg.len(), "dropping foreign segment");
                continue;
            }

            if let Some(cipher) = &est.cipher {
                if let Err(e) = cipher.open(&mut seg) {
                    if tokio::time::Instant::now() < est.grace_until {
                        self.stats.auth_failures.fetch_add(1, Ordering::AcqRel);
                        trace!("decrypt failed inside grace window, retrying");
                        continue;
                    }
                    return Err(self.fatal(e.into()));
                }
            }

            if seg.len() < TCP_HEADER_LEN + SESSION_ID_LEN {
                self.stats.drops.fetch_add(1, Ordering::AcqRel);
                continue;
            }
            let id = u16::from_be_bytes([seg[TCP_HEADER_LEN], seg[TCP_HEADER_LEN + 1]]);
            let payload = &seg[TCP_HEADER_LEN + SESSION_ID_LEN..];
            self.stats.frames_in.fetch_add(1, Ordering::AcqRel);

            if id == CONTROL_SESSION {
                est.bridge
                    .inject(payload)
                    .await
                    .map_err(|e| self.fatal(e.into()))?;
                continue;
            }
            return Ok((id, payload.to_vec()));
        }
    }
}

/// One disguised tunnel connection. Cheap to clone; all clones share the
/// same state.
#[derive(Clone)]
pub struct Conn {
    shared: Arc<Shared>,
}

impl Conn {
    fn new(
        role: Role,
        transport: Arc<dyn RawTransport>,
        stack: Arc<dyn NetStack>,
        factory: Arc<dyn ForwardFactory>,
        cfg: TunnelConfig,
    ) -> Conn {
        let local = transport.local_addr();
        let remote = transport.remote_addr();
        let pseudo = PseudoSum::new(&local, &remote);
        let tracker = Tracker::new(local.port(), remote.port(), pseudo);
        let cancel = CancellationToken::new();
        let mtu = cfg.mtu;
        let session_keepalive = cfg.session_keepalive;

        let shared = Arc::new(Shared {
            role,
            cfg,
            transport,
            stack,
            tracker,
            established: OnceCell::new(),
            sessions: OnceLock::new(),
            send_lock: Mutex::new(()),
            recv_state: Mutex::new(RecvState {
                buf: vec![0u8; 64 * 1024],
                parked: VecDeque::new(),
            }),
            cancel: cancel.clone(),
            close_state: OnceLock::new(),
            handshaking: AtomicBool::new(false),
            stats: Stats::default(),
            effective_mtu: AtomicUsize::new(mtu),
        });

        let mgr = SessionMgr::new(
            factory,
            Arc::new(SegmentSender {
                shared: Arc::downgrade(&shared),
            }),
            session_keepalive,
            cancel.child_token(),
        );
        let _ = shared.sessions.set(mgr);
        Conn { shared }
    }

    /// Client connection without an eager handshake; the first send or
    /// recv triggers it.
    pub fn client(
        transport: Arc<dyn RawTransport>,
        stack: Arc<dyn NetStack>,
        factory: Arc<dyn ForwardFactory>,
        cfg: TunnelConfig,
    ) -> Conn {
        Self::new(Role::Client, transport, stack, factory, cfg)
    }

    /// Server counterpart of [`Conn::client`].
    pub fn server(
        transport: Arc<dyn RawTransport>,
        stack: Arc<dyn NetStack>,
        factory: Arc<dyn ForwardFactory>,
        cfg: TunnelConfig,
    ) -> Conn {
        Self::new(Role::Server, transport, stack, factory, cfg)
    }

    /// Connect as client: runs the handshake now, so decoy and negotiation
    /// failures surface here rather than on the first send.
    pub async fn dial(
        transport: Arc<dyn RawTransport>,
        stack: Arc<dyn NetStack>,
        factory: Arc<dyn ForwardFactory>,
        cfg: TunnelConfig,
    ) -> crate::Result<Conn> {
        let conn = Self::client(transport, stack, factory, cfg);
        conn.shared.established().await?;
        conn.spawn_maintenance();
        Ok(conn)
    }

    /// Accept as server: runs the handshake now.
    pub async fn accept(
        transport: Arc<dyn RawTransport>,
        stack: Arc<dyn NetStack>,
        factory: Arc<dyn ForwardFactory>,
        cfg: TunnelConfig,
    ) -> crate::Result<Conn> {
        let conn = Self::server(transport, stack, factory, cfg);
        conn.shared.established().await?;
        Ok(conn)
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn state(&self) -> State {
        if self.shared.close_state.get().is_some() {
            State::Closed
        } else if self.shared.established.get().is_some() {
            State::Transmitting
        } else if self.shared.handshaking.load(Ordering::Acquire) {
            State::Handshaking
        } else {
            State::Initial
        }
    }

    /// Send one payload under a session ID. Blocks until the handshake has
    /// completed; after close, returns the stored terminal error.
    pub async fn send(&self, id: u16, payload: &[u8]) -> crate::Result<()> {
        self.shared.send_frame(id, payload).await
    }

    /// Receive the next data-plane payload and its session ID. Control
    /// segments are consumed internally (fed to the embedded stack) and
    /// never surface here.
    pub async fn recv(&self) -> crate::Result<(u16, Vec<u8>)> {
        self.shared.recv_frame().await
    }

    /// Run the demux loop: inbound frames are routed to their sessions.
    /// Temporary errors (unknown ID, one bad frame) are counted and
    /// skipped; the loop ends on the first fatal error.
    pub fn spawn_dispatch(&self) -> JoinHandle<()> {
        let conn = self.clone();
        tokio::spawn(async move {
            loop {
                match conn.recv().await {
                    Ok((id, payload)) => {
                        let mgr = match conn.shared.sessions.get() {
                            Some(mgr) => mgr,
                            None => return,
                        };
                        if let Err(e) = mgr.dispatch(id, &payload).await {
                            if e.is_temporary() {
                                conn.shared.stats.drops.fetch_add(1, Ordering::AcqRel);
                                trace!(id, error = %e, "frame dropped");
                            } else {
                                return;
                            }
                        }
                    }
                    Err(e) if e.is_temporary() => continue,
                    Err(e) => {
                        trace!(error = %e, "dispatch loop ending");
                        return;
                    }
                }
            }
        })
    }

    /// Open a proxied flow (client side): asks the server via the control
    /// channel, adopts the ID it assigned.
    pub async fn open_session(&self, tuple: FlowTuple) -> crate::Result<u16> {
        let est = self.shared.established().await?;
        let control = est
            .control
            .as_ref()
            .ok_or_else(|| crate::Error::Closed("open_session is client-only".to_string()))?;
        match control.add_session(tuple).await? {
            AddOutcome::Granted(id) => {
                self.sessions().adopt(id, tuple).await?;
                Ok(id)
            }
            AddOutcome::Exhausted => Err(SessionError::SessionExceeded.into()),
            AddOutcome::Denied => {
                Err(SessionError::Closed("flow denied by peer".to_string()).into())
            }
        }
    }

    /// Close a proxied flow on both ends (client side).
    pub async fn close_session(&self, id: u16) -> crate::Result<()> {
        let est = self.shared.established().await?;
        if let Some(control) = est.control.as_ref() {
            control.del_session(id).await?;
        }
        self.sessions()
            .del(id, &SessionError::Closed("closed locally".to_string()));
        Ok(())
    }

    pub fn sessions(&self) -> Arc<SessionMgr> {
        self.shared
            .sessions
            .get()
            .cloned()
            .unwrap_or_else(|| unreachable!("sessions set in constructor"))
    }

    pub fn stats(&self) -> StatsSnapshot {
        let s = &self.shared.stats;
        StatsSnapshot {
            frames_in: s.frames_in.load(Ordering::Acquire),
            frames_out: s.frames_out.load(Ordering::Acquire),
            auth_failures: s.auth_failures.load(Ordering::Acquire),
            foreign: s.foreign.load(Ordering::Acquire),
            drops: s.drops.load(Ordering::Acquire),
            loss: s.loss(),
        }
    }

    /// Observed inbound loss ratio of the *peer*, via the PackLoss RPC
    /// (client side).
    pub async fn peer_loss(&self) -> crate::Result<f32> {
        let est = self.shared.established().await?;
        let control = est
            .control
            .as_ref()
            .ok_or_else(|| crate::Error::Closed("peer_loss is client-only".to_string()))?;
        Ok(control.pack_loss().await?)
    }

    /// Idempotent close. The first call tears everything down (control
    /// stream first, then the stack, then the raw transport). A control
    /// stream that fails to flush its FIN within `close_timeout` makes the
    /// close unclean: the fault is recorded as the terminal cause and
    /// returned. Repeated calls return the stored cause: `Ok` for a clean
    /// close, the terminal error otherwise.
    pub async fn close(&self) -> crate::Result<()> {
        if let Some((cause, clean)) = self.shared.close_state.get() {
            return if *clean {
                Ok(())
            } else {
                Err(crate::Error::Closed(cause.clone()))
            };
        }
        let mut fault = None;
        if let Some(est) = self.shared.established.get() {
            if let Some(control) = &est.control {
                let flush = tokio::time::timeout(self.shared.cfg.close_timeout, control.shutdown());
                match flush.await {
                    Ok(Ok(())) => {
                        // Let the outbound pump carry the FIN before the stack dies.
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    }
                    Ok(Err(e)) => fault = Some(format!("control stream shutdown failed: {e}")),
                    Err(_) => fault = Some("control stream shutdown timed out".to_string()),
                }
            }
        }
        match fault {
            None => {
                self.shared.record_close("closed".to_string(), true);
                Ok(())
            }
            Some(cause) => {
                warn!(%cause, "unclean close");
                self.shared.record_close(cause.clone(), false);
                Err(crate::Error::Closed(cause))
            }
        }
    }

    /// Client housekeeping: push our parameters to the server, then ping
    /// on the keepalive interval. A failed ping closes the connection.
    fn spawn_maintenance(&self) {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let (control, cancel, keepalive, mtu, session_keepalive) = {
                let Some(shared) = weak.upgrade() else { return };
                let Some(est) = shared.established.get() else {
                    return;
                };
                let Some(control) = est.control.clone() else {
                    return;
                };
                (
                    control,
                    shared.cancel.clone(),
                    shared.cfg.keepalive,
                    shared.cfg.mtu as u16,
                    shared.cfg.session_keepalive.as_secs() as u16,
                )
            };

            let init = tokio::select! {
                _ = cancel.cancelled() => return,
                res = control.init_config(mtu, session_keepalive) => res,
            };
            if let Err(e) = init {
                if let Some(shared) = weak.upgrade() {
                    shared.record_close(format!("init config failed: {e}"), false);
                }
                return;
            }

            let mut ticker = tokio::time::interval(keepalive);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut token = 0u32;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        token = token.wrapping_add(1);
                        let ping = tokio::time::timeout(keepalive, control.ping(token));
                        match ping.await {
                            Ok(Ok(())) => {}
                            _ => {
                                if let Some(shared) = weak.upgrade() {
                                    shared.record_close(
                                        "connection keepalive exceeded".to_string(),
                                        false,
                                    );
                                }
                                return;
                            }
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish()
    }
}

/// Narrow outbound capability handed to sessions and the control bridge.
struct SegmentSender {
    shared: Weak<Shared>,
}

#[async_trait]
impl TunnelOutbound for SegmentSender {
    async fn send_session(&self, id: u16, payload: &[u8]) -> crate::Result<()> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| crate::Error::Closed("connection dropped".to_string()))?;
        shared.send_frame(id, payload).await
    }
}

/// Server-side RPC handler backed by the connection's session manager.
struct SessionControl {
    shared: Weak<Shared>,
}

#[async_trait]
impl ControlHandler for SessionControl {
    async fn init_config(&self, mtu: u16, keepalive_secs: u16) {
        if let Some(shared) = self.shared.upgrade() {
            let effective = shared.cfg.mtu.min(usize::from(mtu));
            shared.effective_mtu.store(effective, Ordering::Release);
            debug!(mtu = effective, keepalive_secs, "peer parameters applied");
        }
    }

    async fn add_session(&self, tuple: FlowTuple) -> AddOutcome {
        let Some(shared) = self.shared.upgrade() else {
            return AddOutcome::Denied;
        };
        let Some(mgr) = shared.sessions.get() else {
            return AddOutcome::Denied;
        };
        match mgr.add(tuple).await {
            Ok(id) => AddOutcome::Granted(id),
            Err(SessionError::SessionExceeded) => AddOutcome::Exhausted,
            Err(e) => {
                warn!(%tuple, error = %e, "add session refused");
                AddOutcome::Denied
            }
        }
    }

    async fn del_session(&self, id: u16) {
        if let Some(shared) = self.shared.upgrade() {
            if let Some(mgr) = shared.sessions.get() {
                mgr.del(id, &SessionError::Closed("removed by peer".to_string()));
            }
        }
    }

    async fn pack_loss(&self) -> f32 {
        self.shared
            .upgrade()
            .map(|shared| shared.stats.loss())
            .unwrap_or(0.0)
    }
}
