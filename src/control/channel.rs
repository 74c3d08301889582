//! Control-channel multiplexer state machine.
//!
//! Negotiates data-channel keys over the tunnel socket and installs them in
//! the shared [`KeyRing`](crate::crypto::KeyRing). The client drives every
//! exchange; the server answers.
//!
//! ```text
//! client                                  server
//!   | -- ClientHello(kid, csid, e_c) ------> |  install pending(kid)
//!   | <----- ServerHello(kid, ssid, e_s) --- |
//!   |  rotate(kid)                           |
//!   | -- Ack(kid) -------------------------> |  promote(kid)
//! ```
//!
//! The channel is I/O free: packets go in through
//! [`submit_incoming`](ControlChannel::submit_incoming), are handled by
//! [`process`](ControlChannel::process), and come out through
//! [`drain_outgoing`](ControlChannel::drain_outgoing). The same type backs
//! the cooperative mode and the concurrent [`ControlWorker`](super::ControlWorker).
//!
//! Every message is stamped when it is sent, retransmissions included. A
//! received message whose stamp was already seen, or whose epoch is older
//! than the peer's current one, is dropped before it can touch any state.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::{CONTROL_REPLAY_WINDOW, ControlError, KEY_ID_MASK, PUBLIC_KEY_SIZE};
use crate::crypto::{
    CipherKind, CryptoContext, DirectionalKeys, KeyRing, PacketIdForm, PacketIdSend, ReplayGuard,
    ReplayWindow, SessionId, SharedKeyRing, StaticKeypair, derive_control_auth_key,
    derive_session_keys,
};

use super::handshake::{ControlMessage, ControlStamp};

/// Which side of the key exchange this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Initiates negotiations and renegotiations.
    Client,
    /// Answers negotiations.
    Server,
}

/// Negotiation parameters.
#[derive(Debug, Clone)]
pub struct ControlSettings {
    /// Our role.
    pub role: Role,
    /// Data-channel cipher for negotiated keys.
    pub cipher: CipherKind,
    /// Replay window for negotiated contexts, `None` to disable.
    pub replay_window: Option<usize>,
    /// Interval between client-initiated renegotiations.
    pub renegotiate: Duration,
    /// Deadline for one negotiation to complete.
    pub handshake_window: Duration,
    /// How long a replaced key still decrypts.
    pub transition_window: Duration,
    /// Retransmit interval for unanswered hellos.
    pub packet_timeout: Duration,
}

/// Something the session needs to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// A fresh control packet from this address carried a valid MAC.
    Authenticated(SocketAddr),
    /// A new key became primary.
    Rotated(u8),
    /// A negotiation failed; the session should restart.
    Failed(ControlError),
}

#[derive(Debug)]
enum ClientState {
    Idle,
    Initiating {
        key_id: u8,
        client_sid: SessionId,
        ephemeral: StaticKeypairCell,
        hello: ControlMessage,
        started: Instant,
        last_sent: Instant,
    },
}

/// Server bookkeeping for the negotiation in flight.
#[derive(Debug)]
struct ServerPending {
    key_id: u8,
    client_sid: SessionId,
    server_sid: SessionId,
    reply: ControlMessage,
    started: Instant,
}

static LAST_EPOCH: AtomicU32 = AtomicU32::new(0);

/// Wall-clock seconds, strictly increasing across calls in this process.
fn next_epoch() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let prev = LAST_EPOCH
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
            Some(now.max(prev.wrapping_add(1)))
        })
        .unwrap_or(0);
    now.max(prev.wrapping_add(1))
}

/// Send side of the control replay protection.
#[derive(Debug)]
struct StampIssuer {
    epoch: u32,
    ids: PacketIdSend,
}

impl StampIssuer {
    fn new() -> Self {
        Self {
            epoch: next_epoch(),
            ids: PacketIdSend::new(PacketIdForm::Short),
        }
    }

    fn issue(&mut self) -> ControlStamp {
        let packet_id = match self.ids.issue() {
            Ok(id) => id as u32,
            Err(_) => {
                self.epoch = next_epoch().max(self.epoch.wrapping_add(1));
                self.ids = PacketIdSend::new(PacketIdForm::Short);
                self.ids.issue().map_or(1, |id| id as u32)
            }
        };
        ControlStamp {
            epoch: self.epoch,
            packet_id,
        }
    }
}

/// Receive side: a replay window per peer epoch.
#[derive(Debug)]
struct StampWindow {
    epoch: Option<u32>,
    window: ReplayWindow,
}

impl StampWindow {
    fn new() -> Self {
        Self {
            epoch: None,
            window: ReplayWindow::new(CONTROL_REPLAY_WINDOW),
        }
    }

    fn accept(&mut self, stamp: ControlStamp) -> Result<(), ControlError> {
        let stale = ControlError::Replay {
            epoch: stamp.epoch,
            packet_id: stamp.packet_id,
        };
        match self.epoch {
            Some(epoch) if stamp.epoch < epoch => return Err(stale),
            Some(epoch) if stamp.epoch == epoch => {}
            _ => {
                // Peer restarted: its new epoch supersedes the old one
                self.epoch = Some(stamp.epoch);
                self.window = ReplayWindow::new(CONTROL_REPLAY_WINDOW);
            }
        }
        self.window
            .check_and_update(u64::from(stamp.packet_id))
            .map_err(|_| stale)
    }
}

/// Wrapper so an ephemeral keypair can sit in a `Debug` state enum.
struct StaticKeypairCell(StaticKeypair);

impl std::fmt::Debug for StaticKeypairCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticKeypair(..)")
    }
}

/// The control-channel multiplexer.
#[derive(Debug)]
pub struct ControlChannel {
    settings: ControlSettings,
    static_dh: [u8; 32],
    mac_key: [u8; 32],
    keys: SharedKeyRing,
    stamps: StampIssuer,
    seen: StampWindow,
    incoming: VecDeque<(Vec<u8>, SocketAddr)>,
    outgoing: VecDeque<Vec<u8>>,
    events: VecDeque<ControlEvent>,
    client: ClientState,
    server: Option<ServerPending>,
    /// Client: last ack sent, re-sent when a server hello is repeated.
    last_ack: Option<ControlMessage>,
    last_established: Option<Instant>,
}

impl ControlChannel {
    /// Create a channel for `local` talking to the holder of `peer_public`.
    pub fn new(
        settings: ControlSettings,
        local: StaticKeypair,
        peer_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<Self, ControlError> {
        let static_dh = local.compute_dh(peer_public);
        let mac_key = derive_control_auth_key(&static_dh)?;
        let keys = KeyRing::new(settings.transition_window).shared();
        Ok(Self {
            settings,
            static_dh,
            mac_key,
            keys,
            stamps: StampIssuer::new(),
            seen: StampWindow::new(),
            incoming: VecDeque::new(),
            outgoing: VecDeque::new(),
            events: VecDeque::new(),
            client: ClientState::Idle,
            server: None,
            last_ack: None,
            last_established: None,
        })
    }

    /// Reuse a key ring carried over from a previous session.
    ///
    /// A ring that already holds a primary key counts as established at
    /// `now`, so the client waits a full renegotiation period.
    pub fn with_key_ring(mut self, keys: SharedKeyRing, now: Instant) -> Self {
        if keys.lock().has_primary() {
            self.last_established = Some(now);
        }
        self.keys = keys;
        self
    }

    /// The key ring the pipeline encrypts and decrypts with.
    pub fn current_keys(&self) -> SharedKeyRing {
        self.keys.clone()
    }

    /// Queue a control-addressed datagram.
    pub fn submit_incoming(&mut self, packet: Vec<u8>, from: SocketAddr) {
        self.incoming.push_back((packet, from));
    }

    /// Whether received packets await processing.
    pub fn has_incoming(&self) -> bool {
        !self.incoming.is_empty()
    }

    /// Next datagram to send.
    pub fn drain_outgoing(&mut self) -> Option<Vec<u8>> {
        self.outgoing.pop_front()
    }

    /// Whether datagrams await sending.
    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Next event for the session.
    pub fn take_event(&mut self) -> Option<ControlEvent> {
        self.events.pop_front()
    }

    /// Whether a negotiation is in flight.
    pub fn is_negotiating(&self) -> bool {
        matches!(self.client, ClientState::Initiating { .. }) || self.server.is_some()
    }

    /// Handle received packets and timers.
    ///
    /// Returns the instant the channel next needs to run, if any.
    pub fn process(&mut self, now: Instant) -> Option<Instant> {
        while let Some((packet, from)) = self.incoming.pop_front() {
            let msg = ControlMessage::decode(&packet, &self.mac_key)
                .and_then(|(msg, stamp)| self.seen.accept(stamp).map(|()| msg));
            match msg {
                Ok(msg) => {
                    self.events.push_back(ControlEvent::Authenticated(from));
                    if let Err(e) = self.handle(msg, from, now) {
                        warn!(error = %e, "control message rejected");
                    }
                }
                Err(e) => debug!(error = %e, %from, "dropping control packet"),
            }
        }

        self.keys.lock().expire(now);

        match self.settings.role {
            Role::Client => self.client_timers(now),
            Role::Server => self.server_timers(now),
        }

        self.next_wakeup()
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let mut wakeup = self.keys.lock().next_expiry();
        let mut merge = |at: Instant| {
            wakeup = Some(wakeup.map_or(at, |w| w.min(at)));
        };

        match &self.client {
            ClientState::Initiating {
                started, last_sent, ..
            } => {
                merge(*last_sent + self.settings.packet_timeout);
                merge(*started + self.settings.handshake_window);
            }
            ClientState::Idle => {
                if self.settings.role == Role::Client {
                    if let Some(at) = self.last_established {
                        merge(at + self.settings.renegotiate);
                    }
                }
            }
        }
        if let Some(pending) = &self.server {
            merge(pending.started + self.settings.handshake_window);
        }
        wakeup
    }

    fn client_timers(&mut self, now: Instant) {
        match &mut self.client {
            ClientState::Idle => {
                let due = match self.last_established {
                    None => !self.keys.lock().has_primary(),
                    Some(at) => now >= at + self.settings.renegotiate,
                };
                if due {
                    let key_id = self.next_key_id();
                    if let Err(e) = self.start_negotiation(key_id, now) {
                        self.events.push_back(ControlEvent::Failed(e));
                    }
                }
            }
            ClientState::Initiating {
                key_id,
                hello,
                started,
                last_sent,
                ..
            } => {
                if now >= *started + self.settings.handshake_window {
                    warn!(key_id = *key_id, "key negotiation timed out");
                    self.client = ClientState::Idle;
                    self.events.push_back(ControlEvent::Failed(ControlError::HandshakeTimeout(
                        self.settings.handshake_window,
                    )));
                } else if now >= *last_sent + self.settings.packet_timeout {
                    debug!(key_id = *key_id, "retransmitting hello");
                    *last_sent = now;
                    let hello = hello.clone();
                    if let Err(e) = self.send(&hello) {
                        self.events.push_back(ControlEvent::Failed(e));
                    }
                }
            }
        }
    }

    fn server_timers(&mut self, now: Instant) {
        if let Some(pending) = &self.server {
            let promoted = {
                let ring = self.keys.lock();
                ring.primary_key_id() == Some(pending.key_id) && ring.pending_key_id().is_none()
            };
            if promoted {
                // Peer's first data packet confirmed the key
                self.server = None;
            } else if now >= pending.started + self.settings.handshake_window {
                warn!(key_id = pending.key_id, "key negotiation timed out");
                self.keys.lock().discard_pending();
                self.server = None;
                self.events.push_back(ControlEvent::Failed(ControlError::HandshakeTimeout(
                    self.settings.handshake_window,
                )));
            }
        }
    }

    fn next_key_id(&self) -> u8 {
        match self.keys.lock().primary_key_id() {
            None => 0,
            Some(k) if k >= KEY_ID_MASK => 1,
            Some(k) => k + 1,
        }
    }

    fn start_negotiation(&mut self, key_id: u8, now: Instant) -> Result<(), ControlError> {
        let client_sid = SessionId::generate();
        let ephemeral = StaticKeypair::generate();
        let hello = ControlMessage::ClientHello {
            key_id,
            client_sid,
            ephemeral: *ephemeral.public_key(),
        };

        debug!(key_id, "starting key negotiation");
        self.send(&hello)?;
        self.client = ClientState::Initiating {
            key_id,
            client_sid,
            ephemeral: StaticKeypairCell(ephemeral),
            hello,
            started: now,
            last_sent: now,
        };
        Ok(())
    }

    /// Stamp, MAC and queue `msg`.
    fn send(&mut self, msg: &ControlMessage) -> Result<(), ControlError> {
        let stamp = self.stamps.issue();
        self.outgoing.push_back(msg.encode(stamp, &self.mac_key)?);
        Ok(())
    }

    fn handle(&mut self, msg: ControlMessage, from: SocketAddr, now: Instant) -> Result<(), ControlError> {
        match (self.settings.role, msg) {
            (
                Role::Server,
                ControlMessage::ClientHello {
                    key_id,
                    client_sid,
                    ephemeral,
                },
            ) => self.answer_hello(key_id, client_sid, &ephemeral, now),
            (
                Role::Server,
                ControlMessage::Ack {
                    key_id,
                    client_sid,
                    server_sid,
                },
            ) => {
                let matches = self.server.as_ref().is_some_and(|p| {
                    p.key_id == key_id && p.client_sid == client_sid && p.server_sid == server_sid
                });
                if matches {
                    self.server = None;
                    self.keys.lock().promote(key_id, now);
                    info!(key_id, "data channel key confirmed");
                    self.events.push_back(ControlEvent::Rotated(key_id));
                }
                Ok(())
            }
            (
                Role::Client,
                ControlMessage::ServerHello {
                    key_id,
                    server_sid,
                    client_sid,
                    ephemeral,
                },
            ) => self.complete_negotiation(key_id, server_sid, client_sid, &ephemeral, from, now),
            (_, other) => {
                debug!(key_id = other.key_id(), "unexpected control message for role");
                Ok(())
            }
        }
    }

    fn answer_hello(
        &mut self,
        key_id: u8,
        client_sid: SessionId,
        client_ephemeral: &[u8; PUBLIC_KEY_SIZE],
        now: Instant,
    ) -> Result<(), ControlError> {
        // Retransmitted hello: repeat the cached answer
        let repeat = self
            .server
            .as_ref()
            .filter(|p| p.key_id == key_id && p.client_sid == client_sid)
            .map(|p| p.reply.clone());
        if let Some(reply) = repeat {
            return self.send(&reply);
        }
        if key_id == 0 {
            debug!("peer requested hard reset");
        }

        let server_sid = SessionId::generate();
        let ephemeral = StaticKeypair::generate();
        let eph_dh = ephemeral.compute_dh(client_ephemeral);
        let (c2s, s2c) = derive_session_keys(&eph_dh, &self.static_dh, &client_sid, &server_sid, key_id)?;
        let ctx = self.context(key_id, DirectionalKeys {
            encrypt: s2c,
            decrypt: c2s,
        });

        let reply = ControlMessage::ServerHello {
            key_id,
            server_sid,
            client_sid,
            ephemeral: *ephemeral.public_key(),
        };

        self.send(&reply)?;
        self.keys.lock().install_pending(ctx);
        self.server = Some(ServerPending {
            key_id,
            client_sid,
            server_sid,
            reply,
            started: now,
        });
        debug!(key_id, "answered key negotiation");
        Ok(())
    }

    fn complete_negotiation(
        &mut self,
        key_id: u8,
        server_sid: SessionId,
        client_sid: SessionId,
        server_ephemeral: &[u8; PUBLIC_KEY_SIZE],
        from: SocketAddr,
        now: Instant,
    ) -> Result<(), ControlError> {
        let eph_dh = match &self.client {
            ClientState::Initiating {
                key_id: expected,
                client_sid: ours,
                ephemeral,
                ..
            } if *expected == key_id && *ours == client_sid => Some(ephemeral.0.compute_dh(server_ephemeral)),
            _ => None,
        };
        let Some(eph_dh) = eph_dh else {
            // Our ack was lost and the server answered a retransmit
            let resend = self.last_ack.clone().filter(|ack| {
                matches!(ack, ControlMessage::Ack { key_id: k, client_sid: sid, .. }
                    if *k == key_id && *sid == client_sid)
            });
            if let Some(ack) = resend {
                self.send(&ack)?;
            }
            return Ok(());
        };

        let (c2s, s2c) = derive_session_keys(&eph_dh, &self.static_dh, &client_sid, &server_sid, key_id)?;
        let ctx = self.context(key_id, DirectionalKeys {
            encrypt: c2s,
            decrypt: s2c,
        });
        let ack = ControlMessage::Ack {
            key_id,
            client_sid,
            server_sid,
        };

        self.keys.lock().rotate(ctx, now);
        self.send(&ack)?;
        self.last_ack = Some(ack);
        self.client = ClientState::Idle;
        self.last_established = Some(now);

        info!(key_id, peer = %from, "data channel key established");
        self.events.push_back(ControlEvent::Rotated(key_id));
        Ok(())
    }

    fn context(&self, key_id: u8, keys: DirectionalKeys) -> CryptoContext {
        let cipher = self.settings.cipher;
        let guard = ReplayGuard::new(cipher.id_form(), self.settings.replay_window);
        CryptoContext::new(key_id, cipher, &keys, guard)
    }
}
