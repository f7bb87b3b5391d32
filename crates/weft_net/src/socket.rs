//! Secure socket — mutually-authenticated encrypted sessions over a bus.
//!
//! The handshake is a 5-message challenge/response protocol expressed with
//! the [`Handshake`] framework, asymmetric by role:
//!
//! ```text
//! client                                server
//!   | handshake {keyword, info}           |  START→C1        START→S1
//!   |<-- {info, server_noise} ------------|
//!   |--- {proof, client_noise} ---------->|  C1→C2           S1→S2
//!   |<-- {server_proof} ------------------|  C2→C3
//!   |<== {ready} ==> both directions      |  ready→END (shared)
//! ```
//!
//! Proofs hash a peer's noise with a protocol salt and the pre-shared
//! secret; the session key is derived once both noises are known. All
//! session material is constructed fresh per connection attempt; nothing is
//! shared between sessions. Post-handshake traffic is sealed by
//! [`SessionCipher`] and supervised by a keepalive ping/pong loop.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::bus::{Bus, BusMessage, BusPayload, ControlMsg};
use crate::cipher::{self, FrameKind, SessionCipher};
use crate::config::SocketConfig;
use crate::error::NetError;
use crate::fsm::{END, Flow, FsmError, START};
use crate::handshake::{Handshake, HandshakeStatus};
use crate::packet::{DeviceInfo, DeviceKind};

/// Greeting keyword; the server rejects hellos that do not carry it.
const KEYWORD: &str = "ahoy";

/// Protocol salt for the client's proof of the server's noise.
const PROOF_SALT_ONE: &str = "weft/proof/one";

/// Protocol salt for the server's proof of the client's noise.
const PROOF_SALT_TWO: &str = "weft/proof/two";

/// Why a socket disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A handshake step made no progress within its window.
    Timeout,
    /// Handshake verification failed.
    Handshake,
    /// Too many consecutive missed pongs.
    Ping,
    /// Explicit close, local or remote.
    Closed,
    /// Transport-level failure.
    Error,
    /// Anything else.
    Unknown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Handshake => "handshake",
            Self::Ping => "ping",
            Self::Closed => "closed",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Events emitted to the socket's owner.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The handshake completed; carries the peer's descriptor.
    Ready(DeviceInfo),
    /// A decrypted application message arrived.
    Data(Value),
    /// The session ended.
    Disconnected(DisconnectReason),
}

#[derive(Clone, Copy)]
enum SocketRole {
    Client,
    Server,
}

// ── Handshake wire messages ─────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct Hello {
    keyword: String,
    info: DeviceInfo,
}

#[derive(Serialize, Deserialize)]
struct ServerHello {
    info: DeviceInfo,
    server_noise: String,
}

#[derive(Serialize, Deserialize)]
struct ClientProof {
    proof: String,
    client_noise: String,
}

#[derive(Serialize, Deserialize)]
struct ServerProof {
    server_proof: String,
}

#[derive(Serialize, Deserialize)]
struct ReadyAck {
    ready: bool,
}

// ── Session state ───────────────────────────────────────────────────────

/// Per-connection session material. Reset to defaults on every new
/// connection attempt; the derived key never outlives the connection.
#[derive(Default)]
struct Session {
    server_noise: String,
    client_noise: String,
    cipher: Option<SessionCipher>,
    peer: Option<DeviceInfo>,
    handshaked: bool,
    closed: Option<DisconnectReason>,
}

struct HsFeed {
    tx: Option<mpsc::UnboundedSender<Value>>,
    /// Frames that arrived before a handshake attempt was listening.
    pending: Vec<Value>,
}

struct SocketShared {
    info: DeviceInfo,
    cfg: SocketConfig,
    wire: Bus,
    session: Mutex<Session>,
    events: mpsc::UnboundedSender<SocketEvent>,
    hs_feed: Mutex<HsFeed>,
    pong: Notify,
    shutdown: broadcast::Sender<()>,
}

impl SocketShared {
    fn send_sealed(&self, kind: FrameKind, value: &Value) -> Result<(), NetError> {
        let cipher = {
            let s = self.session.lock();
            if !s.handshaked {
                return Err(NetError::NotConnected);
            }
            s.cipher.clone()
        };
        let cipher = cipher.ok_or(NetError::NotConnected)?;
        let frame = cipher.seal(kind, value)?;
        self.wire.output(BusMessage::text(frame));
        Ok(())
    }

    fn disconnect(&self, reason: DisconnectReason) {
        {
            let mut s = self.session.lock();
            if s.closed.is_some() {
                return;
            }
            s.closed = Some(reason);
            s.handshaked = false;
            s.cipher = None;
        }
        let _ = self.shutdown.send(());
        let _ = self.events.send(SocketEvent::Disconnected(reason));
        info!("{}: socket disconnected ({reason})", self.info.name);
    }
}

/// A socket establishing encrypted, authenticated sessions over its wire
/// bus. Connect the wire to a transport link (or directly to a peer
/// socket's wire for in-memory use).
#[derive(Clone)]
pub struct SecureSocket {
    shared: Arc<SocketShared>,
}

impl SecureSocket {
    /// Create a socket plus its event stream.
    pub fn new(
        name: impl Into<String>,
        cfg: SocketConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let info = DeviceInfo::new(name, DeviceKind::Node);
        let wire = Bus::new(format!("{}:socket", info.name));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(4);

        let shared = Arc::new(SocketShared {
            info,
            cfg,
            wire: wire.clone(),
            session: Mutex::new(Session::default()),
            events: events_tx,
            hs_feed: Mutex::new(HsFeed {
                tx: None,
                pending: Vec::new(),
            }),
            pong: Notify::new(),
            shutdown,
        });

        let weak = Arc::downgrade(&shared);
        wire.on_input(move |msg| {
            if let Some(shared) = weak.upgrade() {
                handle_wire(&shared, msg);
            }
        });

        let weak = Arc::downgrade(&shared);
        wire.on_disconnect(move || {
            if let Some(shared) = weak.upgrade() {
                shared.disconnect(DisconnectReason::Closed);
            }
        });

        (Self { shared }, events_rx)
    }

    /// The wire-side bus carrying this socket's frames.
    pub fn wire(&self) -> Bus {
        self.shared.wire.clone()
    }

    /// This socket's descriptor.
    pub fn info(&self) -> DeviceInfo {
        self.shared.info.clone()
    }

    /// Whether a handshake has completed and the session is live.
    pub fn is_connected(&self) -> bool {
        self.shared.session.lock().handshaked
    }

    /// The peer's descriptor, once known.
    pub fn peer(&self) -> Option<DeviceInfo> {
        self.shared.session.lock().peer.clone()
    }

    /// Run the client side of the handshake. Resolves with the peer's
    /// descriptor once the session is live.
    pub async fn connect(&self) -> Result<DeviceInfo, NetError> {
        self.run_handshake(SocketRole::Client).await
    }

    /// Run the server side of the handshake.
    pub async fn accept(&self) -> Result<DeviceInfo, NetError> {
        self.run_handshake(SocketRole::Server).await
    }

    /// Send an application message over the established session.
    pub fn send(&self, value: Value) -> Result<(), NetError> {
        self.shared.send_sealed(FrameKind::Data, &value)
    }

    /// Close the session and tear down the wire.
    pub fn close(&self) {
        self.shared.disconnect(DisconnectReason::Closed);
        self.shared.wire.destroy();
    }

    async fn run_handshake(&self, role: SocketRole) -> Result<DeviceInfo, NetError> {
        // Fresh session material for every attempt; no defaults shared
        // between sessions.
        *self.shared.session.lock() = Session::default();

        let mut hs = Handshake::new(self.shared.cfg.step_timeout);
        {
            let mut feed = self.shared.hs_feed.lock();
            let tx = hs.sender();
            for v in feed.pending.drain(..) {
                let _ = tx.send(v);
            }
            feed.tx = Some(tx);
        }

        let initial = match role {
            SocketRole::Client => {
                install_client_edges(&mut hs, &self.shared);
                "C1"
            }
            SocketRole::Server => {
                install_server_edges(&mut hs, &self.shared);
                "S1"
            }
        };
        install_ready_edge(&mut hs, &self.shared);

        let status = hs.run(initial).await;
        self.shared.hs_feed.lock().tx = None;

        match status {
            HandshakeStatus::Ok => {
                let peer = self
                    .shared
                    .session
                    .lock()
                    .peer
                    .clone()
                    .ok_or_else(|| NetError::Handshake("peer descriptor missing".into()))?;
                info!(
                    "{}: session established with '{}'",
                    self.shared.info.name, peer.name
                );
                let _ = self.shared.events.send(SocketEvent::Ready(peer.clone()));
                spawn_keepalive(Arc::clone(&self.shared));
                Ok(peer)
            }
            HandshakeStatus::Error(reason) => {
                self.shared.disconnect(DisconnectReason::Handshake);
                Err(NetError::Handshake(reason))
            }
            HandshakeStatus::Timeout => {
                self.shared.disconnect(DisconnectReason::Timeout);
                Err(NetError::HandshakeTimeout(self.shared.cfg.step_timeout))
            }
        }
    }
}

// ── Wire input ──────────────────────────────────────────────────────────

fn handle_wire(shared: &Arc<SocketShared>, msg: &BusMessage) {
    match &msg.payload {
        BusPayload::Text(frame) => handle_frame(shared, frame),
        BusPayload::Control(ControlMsg::LinkDown { reason }) => {
            warn!("{}: link down: {reason}", shared.info.name);
            shared.disconnect(DisconnectReason::Error);
        }
        BusPayload::Packet(_) => {
            trace!("{}: ignoring packet on socket wire", shared.info.name);
        }
    }
}

fn handle_frame(shared: &Arc<SocketShared>, frame: &str) {
    let (handshaked, cipher) = {
        let s = shared.session.lock();
        (s.handshaked, s.cipher.clone())
    };

    if handshaked {
        let Some(cipher) = cipher else {
            return;
        };
        match cipher.open(frame) {
            Ok((FrameKind::Data, value)) => {
                let _ = shared.events.send(SocketEvent::Data(value));
            }
            Ok((FrameKind::Ping, _)) => {
                let ts = chrono::Utc::now().timestamp_millis();
                if let Err(e) = shared.send_sealed(FrameKind::Pong, &json!({ "ts": ts })) {
                    debug!("{}: pong send failed: {e}", shared.info.name);
                }
            }
            Ok((FrameKind::Pong, _)) => {
                shared.pong.notify_one();
            }
            Ok((FrameKind::Handshake, _)) => {
                debug!("{}: unexpected handshake frame in session", shared.info.name);
            }
            Err(e) => {
                warn!("{}: unauthentic frame: {e}", shared.info.name);
                shared.disconnect(DisconnectReason::Error);
            }
        }
        return;
    }

    // Pre-handshake: only clear handshake frames are meaningful.
    match cipher::decode_clear(frame) {
        Ok((FrameKind::Handshake, value)) => {
            let mut feed = shared.hs_feed.lock();
            match &feed.tx {
                Some(tx) => {
                    let _ = tx.send(value);
                }
                None => feed.pending.push(value),
            }
        }
        Ok((kind, _)) => {
            debug!(
                "{}: ignoring pre-handshake {} frame",
                shared.info.name,
                kind.as_str()
            );
        }
        Err(e) => {
            debug!("{}: undecodable pre-handshake frame: {e}", shared.info.name);
        }
    }
}

// ── Handshake edges ─────────────────────────────────────────────────────

fn act_err(e: impl fmt::Display) -> FsmError {
    FsmError::Action(e.to_string())
}

fn send_clear(shared: &SocketShared, value: &Value) -> Result<(), FsmError> {
    let frame = cipher::encode_clear(FrameKind::Handshake, value).map_err(act_err)?;
    shared.wire.output(BusMessage::text(frame));
    Ok(())
}

fn install_client_edges(hs: &mut Handshake, shared: &Arc<SocketShared>) {
    let inbox = hs.inbox();

    // Introduce ourselves.
    let sh = Arc::clone(shared);
    hs.add_path(
        START,
        "C1",
        Box::new(move |_| {
            let sh = Arc::clone(&sh);
            Box::pin(async move {
                send_clear(&sh, &json!({ "keyword": KEYWORD, "info": sh.info }))?;
                Ok(Flow::goto("C2"))
            })
        }),
    );

    // Receive the server's noise, answer with our proof and noise.
    let sh = Arc::clone(shared);
    let ib = inbox.clone();
    hs.add_path(
        "C1",
        "C2",
        Box::new(move |_| {
            let sh = Arc::clone(&sh);
            let ib = ib.clone();
            Box::pin(async move {
                let Some(hello) = ib.next::<ServerHello>().await else {
                    return Err(act_err("malformed server hello"));
                };
                let client_noise = cipher::random_noise();
                let proof = cipher::proof(&hello.server_noise, PROOF_SALT_ONE, &sh.cfg.secret);
                {
                    let mut s = sh.session.lock();
                    s.server_noise = hello.server_noise;
                    s.client_noise = client_noise.clone();
                    s.peer = Some(hello.info);
                }
                send_clear(&sh, &json!({ "proof": proof, "client_noise": client_noise }))?;
                Ok(Flow::goto("C3"))
            })
        }),
    );

    // Verify the server's proof of the shared secret.
    let sh = Arc::clone(shared);
    let ib = inbox.clone();
    hs.add_path(
        "C2",
        "C3",
        Box::new(move |_| {
            let sh = Arc::clone(&sh);
            let ib = ib.clone();
            Box::pin(async move {
                let Some(sp) = ib.next::<ServerProof>().await else {
                    return Err(act_err("malformed server proof"));
                };
                let client_noise = sh.session.lock().client_noise.clone();
                let expected = cipher::proof(&client_noise, PROOF_SALT_TWO, &sh.cfg.secret);
                if sp.server_proof != expected {
                    return Err(act_err("server proof mismatch"));
                }
                Ok(Flow::goto("ready"))
            })
        }),
    );

    hs.add_path(
        "C3",
        "ready",
        Box::new(|_| Box::pin(async { Ok(Flow::goto(END)) })),
    );
}

fn install_server_edges(hs: &mut Handshake, shared: &Arc<SocketShared>) {
    let inbox = hs.inbox();

    // Await the client's hello, answer with our noise.
    let sh = Arc::clone(shared);
    let ib = inbox.clone();
    hs.add_path(
        START,
        "S1",
        Box::new(move |_| {
            let sh = Arc::clone(&sh);
            let ib = ib.clone();
            Box::pin(async move {
                let Some(hello) = ib.next::<Hello>().await else {
                    return Err(act_err("malformed hello"));
                };
                if hello.keyword != KEYWORD {
                    return Err(act_err("unexpected greeting keyword"));
                }
                let server_noise = cipher::random_noise();
                {
                    let mut s = sh.session.lock();
                    s.server_noise = server_noise.clone();
                    s.peer = Some(hello.info);
                }
                send_clear(&sh, &json!({ "info": sh.info, "server_noise": server_noise }))?;
                Ok(Flow::goto("S2"))
            })
        }),
    );

    // Verify the client's proof, answer with ours.
    let sh = Arc::clone(shared);
    let ib = inbox.clone();
    hs.add_path(
        "S1",
        "S2",
        Box::new(move |_| {
            let sh = Arc::clone(&sh);
            let ib = ib.clone();
            Box::pin(async move {
                let Some(cp) = ib.next::<ClientProof>().await else {
                    return Err(act_err("malformed client proof"));
                };
                let server_noise = sh.session.lock().server_noise.clone();
                let expected = cipher::proof(&server_noise, PROOF_SALT_ONE, &sh.cfg.secret);
                if cp.proof != expected {
                    return Err(act_err("client proof mismatch"));
                }
                let server_proof = cipher::proof(&cp.client_noise, PROOF_SALT_TWO, &sh.cfg.secret);
                sh.session.lock().client_noise = cp.client_noise;
                send_clear(&sh, &json!({ "server_proof": server_proof }))?;
                Ok(Flow::goto("ready"))
            })
        }),
    );

    hs.add_path(
        "S2",
        "ready",
        Box::new(|_| Box::pin(async { Ok(Flow::goto(END)) })),
    );
}

/// Shared final edge: derive the session key and exchange ready acks.
fn install_ready_edge(hs: &mut Handshake, shared: &Arc<SocketShared>) {
    let sh = Arc::clone(shared);
    let ib = hs.inbox();
    hs.add_path(
        "ready",
        END,
        Box::new(move |_| {
            let sh = Arc::clone(&sh);
            let ib = ib.clone();
            Box::pin(async move {
                let (server_noise, client_noise) = {
                    let s = sh.session.lock();
                    (s.server_noise.clone(), s.client_noise.clone())
                };
                if server_noise.is_empty() || client_noise.is_empty() {
                    return Err(act_err("session noise missing"));
                }
                let key = cipher::derive_session_key(&sh.cfg.secret, &server_noise, &client_noise)
                    .map_err(act_err)?;

                send_clear(&sh, &json!({ "ready": true }))?;
                let Some(ack) = ib.next::<ReadyAck>().await else {
                    return Err(act_err("malformed ready ack"));
                };
                if !ack.ready {
                    return Err(act_err("peer not ready"));
                }

                let mut s = sh.session.lock();
                s.cipher = Some(SessionCipher::new(sh.cfg.mode, key));
                s.handshaked = true;
                Ok(Flow::Stay)
            })
        }),
    );
}

// ── Keepalive ───────────────────────────────────────────────────────────

fn spawn_keepalive(shared: Arc<SocketShared>) {
    let mut shutdown = shared.shutdown.subscribe();
    tokio::spawn(async move {
        let mut misses = 0u32;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(shared.cfg.ping_interval) => {
                    let ts = chrono::Utc::now().timestamp_millis();
                    if shared.send_sealed(FrameKind::Ping, &json!({ "ts": ts })).is_err() {
                        break;
                    }
                    match tokio::time::timeout(shared.cfg.pong_timeout, shared.pong.notified()).await {
                        Ok(()) => misses = 0,
                        Err(_) => {
                            misses += 1;
                            debug!(
                                "{}: missed pong {misses}/{}",
                                shared.info.name, shared.cfg.ping_max
                            );
                            if misses >= shared.cfg.ping_max {
                                shared.disconnect(DisconnectReason::Ping);
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
