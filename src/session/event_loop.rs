//! Session event loop.
//!
//! One task multiplexes the virtual interface and the UDP socket. Each
//! iteration:
//!
//! 1. collects the earliest deadline from timers, shaper, fragment
//!    housekeeping and the control scheduler;
//! 2. arms readiness with backpressure: the interface is read and the
//!    socket written only while no datagram is pending, the socket is read
//!    and the interface written only while no packet is pending;
//! 3. waits for one readiness, the deadline or a signal;
//! 4. samples signals, runs timers, then services the single ready
//!    endpoint in the order socket read, control result, interface read,
//!    interface write, socket write.
//!
//! At most one buffer per direction is ever pending.

use std::fmt;
use std::future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};

use crate::control::{
    ControlChannel, ControlEvent, ControlInterval, ControlOutput, ControlWorker,
};
use crate::core::{ControlError, PACKET_ID_FLUSH_INTERVAL, TunnelError, VirtualInterface};
use crate::crypto::{CryptoContext, KeyRing, PacketIdStore, ReplayGuard, SharedKeyRing};
use crate::pipeline::{DataCrypto, DropReason, InboundOutcome, PacketPipeline};
use crate::extensions::Fragmenter;
use crate::transport::{
    PacketBuffer, PathMtuHint, PeerAddress, PingAction, ShaperAction, TimeoutSet, TimerEvent,
    TrafficShaper, TunnelSocket,
};

#[cfg(feature = "compression")]
use super::config::CompressionMode;
use super::config::{ResolvedCrypto, SessionConfig};
use super::signal::{SignalKind, SignalReceiver};
use super::stats::SessionStats;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// Terminate request.
    Terminate,
    /// Nothing written to the interface for the inactivity period.
    Inactive,
    /// Keepalive-receive timeout configured to exit.
    PingExit,
    /// Hangup request: restart with reloaded configuration.
    Hangup,
    /// User restart request.
    UserRestart,
    /// Keepalive-receive timeout configured to restart.
    PingRestart,
    /// Key negotiation failed or the control task died.
    ControlFailure,
}

impl ExitReason {
    /// Whether a new session should follow.
    pub fn is_restart(self) -> bool {
        matches!(
            self,
            Self::Hangup | Self::UserRestart | Self::PingRestart | Self::ControlFailure
        )
    }

    /// Whether configuration is re-read before the next session.
    pub fn reloads_config(self) -> bool {
        self == Self::Hangup
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Terminate => "terminate",
            Self::Inactive => "inactivity timeout",
            Self::PingExit => "keepalive timeout (exit)",
            Self::Hangup => "hangup",
            Self::UserRestart => "user restart",
            Self::PingRestart => "keepalive timeout (restart)",
            Self::ControlFailure => "control channel failure",
        })
    }
}

/// State kept from one session for the next, selected by the persist flags.
#[derive(Debug, Default)]
pub struct Carryover {
    /// Key ring with its replay state.
    pub keys: Option<SharedKeyRing>,
    /// Learned peer address.
    pub remote: Option<SocketAddr>,
    /// Bound socket.
    pub socket: Option<Arc<UdpSocket>>,
}

/// What [`Session::run`] hands back.
#[derive(Debug)]
pub struct SessionExit<I> {
    /// Why the session ended.
    pub reason: ExitReason,
    /// The virtual interface, for reuse or closing.
    pub interface: I,
    /// Persisted state.
    pub carry: Carryover,
    /// Final counters.
    pub stats: SessionStats,
}

enum ControlMode {
    Cooperative {
        channel: ControlChannel,
        interval: ControlInterval,
    },
    Concurrent(ControlWorker),
}

/// The readiness that ended a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ready {
    Signal,
    LinkRead,
    Control,
    TunRead,
    TunWrite,
    LinkWrite,
    Timer,
}

/// One tunnel activation.
pub struct Session<I> {
    config: SessionConfig,
    interface: I,
    socket: TunnelSocket,
    pipeline: PacketPipeline,
    control: Option<ControlMode>,
    /// Control datagram received from the worker while the link was busy.
    deferred_control: Option<Vec<u8>>,
    control_result: Option<Result<ControlOutput, ControlError>>,
    timers: TimeoutSet,
    shaper: Option<TrafficShaper>,
    packet_ids: Option<PacketIdStore>,
    stats: SessionStats,
    link_in: PacketBuffer,
    link_out: PacketBuffer,
    tun_in: PacketBuffer,
    tun_out: PacketBuffer,
}

impl<I: VirtualInterface> Session<I> {
    /// Validate `config`, open the socket and build the pipeline.
    ///
    /// `carry` supplies state kept from a previous session.
    pub async fn start(config: SessionConfig, interface: I, carry: Carryover) -> Result<Self, TunnelError> {
        config.validate()?;
        let now = Instant::now();

        let frame = config.frame()?;
        info!(
            tun_mtu = frame.tun_mtu(),
            link_mtu = frame.link_mtu(),
            overhead = frame.overhead(),
            max_tun_read = frame.max_tun_read(),
            "frame parameters"
        );

        let peer = PeerAddress {
            actual: carry.remote,
            ..PeerAddress::new(config.remote, config.float)
        };
        let socket = match carry.socket {
            Some(socket) => TunnelSocket::from_shared(socket, peer),
            None => TunnelSocket::bind(config.local, peer).await?,
        };

        let mut packet_ids = None;
        let (crypto, control) = match config.resolve_crypto()? {
            ResolvedCrypto::Cleartext => {
                warn!("data channel is not encrypted");
                (DataCrypto::Cleartext, None)
            }
            ResolvedCrypto::Static(key, direction) => {
                let store = config
                    .packet_id_file
                    .as_ref()
                    .map(PacketIdStore::open)
                    .transpose()?;
                let ring = match carry.keys {
                    Some(ring) => ring,
                    None => {
                        let guard = ReplayGuard::new(config.cipher.id_form(), config.replay_window());
                        let mut ctx = CryptoContext::new(0, config.cipher, &key.derive(direction)?, guard);
                        if let Some(record) = store.as_ref().and_then(PacketIdStore::loaded) {
                            ctx.guard_mut().seed(record.issued, record.seen);
                        }
                        KeyRing::with_primary(ctx).shared()
                    }
                };
                packet_ids = store;
                (DataCrypto::Static(ring), None)
            }
            ResolvedCrypto::Handshake {
                settings,
                local,
                peer_public,
                concurrent,
            } => {
                let mut channel = ControlChannel::new(settings, local, &peer_public)?;
                if let Some(ring) = carry.keys {
                    channel = channel.with_key_ring(ring, now);
                }
                let ring = channel.current_keys();
                let mode = if concurrent {
                    ControlMode::Concurrent(ControlWorker::spawn(channel))
                } else {
                    ControlMode::Cooperative {
                        channel,
                        interval: ControlInterval::new(now),
                    }
                };
                (DataCrypto::Negotiated(ring), Some(mode))
            }
        };

        let mut pipeline = PacketPipeline::new(frame, crypto);
        #[cfg(feature = "compression")]
        if let CompressionMode::Zstd { level } = config.compression {
            pipeline = pipeline.with_compression(level);
        }
        if let Some(size) = config.fragment {
            pipeline = pipeline.with_fragmentation(size, now);
        }

        let timers = TimeoutSet::new(now, config.inactive, config.ping, config.ping_receive());
        let shaper = config.shaper.map(TrafficShaper::new).transpose()?;
        if let Some(shaper) = &shaper {
            info!(bytes_per_second = shaper.rate(), "traffic shaper enabled");
        }

        Ok(Self {
            link_in: frame.alloc_buffer(),
            link_out: frame.alloc_buffer(),
            tun_in: frame.alloc_buffer(),
            tun_out: frame.alloc_buffer(),
            config,
            interface,
            socket,
            pipeline,
            control,
            deferred_control: None,
            control_result: None,
            timers,
            shaper,
            packet_ids,
            stats: SessionStats::default(),
        })
    }

    /// Local socket address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Peer addressing state.
    pub fn peer(&self) -> &PeerAddress {
        self.socket.peer()
    }

    /// Handle for reporting a path MTU from outside the session.
    ///
    /// A reported link MTU shrinks the fragment size at the next fragment
    /// housekeeping pass. It never grows past the configured size.
    pub fn path_mtu_hint(&self) -> PathMtuHint {
        self.socket.path_mtu_hint()
    }

    /// Current counters.
    pub fn stats(&self) -> SessionStats {
        let mut stats = self.stats;
        stats.drops = *self.pipeline.drops();
        stats.fragments_expired = self
            .pipeline
            .fragmenter()
            .map_or(0, Fragmenter::expired_count);
        #[cfg(feature = "compression")]
        {
            stats.compression = self.pipeline.compression_stats();
        }
        stats
    }

    /// Run until a signal or timer ends the session.
    ///
    /// # Errors
    /// Session-fatal conditions: oversized packets, packet-id exhaustion,
    /// buffer violations.
    pub async fn run(mut self, signals: &mut SignalReceiver) -> Result<SessionExit<I>, TunnelError> {
        info!(
            interface = self.interface.name(),
            local = ?self.socket.local_addr().ok(),
            remote = ?self.config.remote,
            "session started"
        );
        let result = self.event_loop(signals).await;
        self.save_packet_ids();
        let reason = result?;
        info!(%reason, "session ended");
        Ok(self.into_exit(reason))
    }

    async fn event_loop(&mut self, signals: &mut SignalReceiver) -> Result<ExitReason, TunnelError> {
        loop {
            let deadline = self.next_deadline(Instant::now());
            let ready = match self.wait(signals, deadline).await {
                Ok(ready) => ready,
                Err(e) => {
                    warn!(error = %e, "readiness wait failed");
                    Ready::Timer
                }
            };

            let now = Instant::now();
            if let Some(kind) = signals.take() {
                info!(?kind, "request received");
                match kind {
                    SignalKind::Terminate => return Ok(ExitReason::Terminate),
                    SignalKind::Hangup => return Ok(ExitReason::Hangup),
                    SignalKind::UserRestart => return Ok(ExitReason::UserRestart),
                    SignalKind::UserStats => self.stats().log(),
                }
            }
            if let Some(reason) = self.process_timers(now)? {
                return Ok(reason);
            }
            if let Some(reason) = self.dispatch(ready, now)? {
                return Ok(reason);
            }
        }
    }

    fn ping_rec_armed(&self) -> bool {
        !self.config.ping_timer_remote || self.socket.peer().outgoing().is_some()
    }

    fn next_deadline(&mut self, now: Instant) -> Option<Instant> {
        let link_pending = !self.link_out.is_empty();
        let timers = self.timers.next_deadline(self.ping_rec_armed(), !link_pending);
        let shaper = match &mut self.shaper {
            Some(shaper) if link_pending => match shaper.poll(now) {
                ShaperAction::WaitUntil(at) => Some(at),
                ShaperAction::SendNow => None,
            },
            _ => None,
        };
        let control = match &self.control {
            Some(ControlMode::Cooperative { interval, .. }) => Some(interval.schedule_wakeup()),
            _ => None,
        };
        [timers, shaper, control, self.pipeline.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    async fn wait(&mut self, signals: &mut SignalReceiver, deadline: Option<Instant>) -> io::Result<Ready> {
        let link_pending = !self.link_out.is_empty();
        let tun_pending = !self.tun_out.is_empty();
        let read_tun = !link_pending && !self.pipeline.has_pending_fragments();
        let shaper_open = match &mut self.shaper {
            Some(shaper) => shaper.poll(Instant::now()) == ShaperAction::SendNow,
            None => true,
        };
        trace!(link_pending, tun_pending, read_tun, shaper_open, "arming readiness");

        let worker = match &mut self.control {
            Some(ControlMode::Concurrent(worker)) if !link_pending && self.deferred_control.is_none() => {
                Some(worker)
            }
            _ => None,
        };
        let control = async {
            match worker {
                Some(worker) => worker.recv().await,
                None => future::pending().await,
            }
        };
        let timer = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };
        let socket = &self.socket;
        let interface = &self.interface;

        tokio::select! {
            biased;
            _ = signals.wait() => Ok(Ready::Signal),
            r = socket.readable(), if !tun_pending => r.map(|()| Ready::LinkRead),
            out = control => {
                self.control_result = Some(out);
                Ok(Ready::Control)
            }
            r = interface.readable(), if read_tun => r.map(|()| Ready::TunRead),
            r = interface.writable(), if tun_pending => r.map(|()| Ready::TunWrite),
            r = socket.writable(), if link_pending && shaper_open => r.map(|()| Ready::LinkWrite),
            _ = timer => Ok(Ready::Timer),
        }
    }

    fn process_timers(&mut self, now: Instant) -> Result<Option<ExitReason>, TunnelError> {
        match self.timers.check_expiry(now, self.ping_rec_armed()) {
            Some(TimerEvent::Inactive) => {
                info!("inactivity timeout");
                return Ok(Some(ExitReason::Inactive));
            }
            Some(TimerEvent::PingTimeout(action)) => {
                info!(?action, "no authenticated packet from peer within keepalive period");
                return Ok(Some(match action {
                    PingAction::Exit => ExitReason::PingExit,
                    PingAction::Restart => ExitReason::PingRestart,
                }));
            }
            _ => {}
        }

        self.flush_packet_ids(now);

        if let Some(reason) = self.run_control(now) {
            return Ok(Some(reason));
        }

        if let Some(mtu) = self.socket.take_path_mtu() {
            debug!(mtu, "path MTU hint");
            self.pipeline.set_path_mtu(mtu);
        }
        self.pipeline.housekeeping(now);

        if self.link_out.is_empty() {
            self.fill_link_out(now)?;
        }
        Ok(None)
    }

    /// Cooperative control channel step.
    fn run_control(&mut self, now: Instant) -> Option<ExitReason> {
        let Some(ControlMode::Cooperative { channel, interval }) = &mut self.control else {
            return None;
        };
        if interval.test(now) {
            let had_work = channel.has_incoming() || channel.is_negotiating();
            if let Some(at) = channel.process(now) {
                interval.future_trigger(at);
            }
            if had_work || channel.has_outgoing() {
                interval.action(now);
            }
        }
        let events: Vec<ControlEvent> = std::iter::from_fn(|| channel.take_event()).collect();
        events
            .into_iter()
            .find_map(|event| self.handle_control_event(event, now))
    }

    fn handle_control_event(&mut self, event: ControlEvent, now: Instant) -> Option<ExitReason> {
        match event {
            ControlEvent::Authenticated(from) => {
                self.timers.on_authenticated_packet(now);
                if self.socket.peer_mut().learn(from) {
                    info!(peer = %from, "peer address learned");
                }
                None
            }
            ControlEvent::Rotated(key_id) => {
                debug!(key_id, "data channel key rotated");
                None
            }
            ControlEvent::Failed(e) => {
                warn!(error = %e, "control channel failed");
                Some(ExitReason::ControlFailure)
            }
        }
    }

    /// Load the next datagram: control first, then fragments, then keepalive.
    fn fill_link_out(&mut self, now: Instant) -> Result<(), TunnelError> {
        let control_packet = match &mut self.control {
            Some(ControlMode::Cooperative { channel, .. }) => channel.drain_outgoing(),
            Some(ControlMode::Concurrent(_)) => self.deferred_control.take(),
            None => None,
        };
        if let Some(packet) = control_packet {
            self.load_link_out(&packet)?;
            return Ok(());
        }

        if self.pipeline.has_pending_fragments() {
            self.link_out.reset(self.pipeline.frame().headroom());
            if self.pipeline.next_fragment(&mut self.link_out)? {
                return Ok(());
            }
        }

        if self.timers.check_keepalive(now) == Some(TimerEvent::SendKeepalive)
            && self.pipeline.encode_keepalive(&mut self.link_out)?
        {
            self.stats.keepalives_sent += 1;
            trace!("keepalive queued");
        }
        Ok(())
    }

    fn load_link_out(&mut self, packet: &[u8]) -> Result<(), TunnelError> {
        self.link_out.reset(self.pipeline.frame().headroom());
        self.link_out.replace(packet)?;
        Ok(())
    }

    fn dispatch(&mut self, ready: Ready, now: Instant) -> Result<Option<ExitReason>, TunnelError> {
        match ready {
            Ready::Signal | Ready::Timer => {}
            Ready::LinkRead => {
                if self.tun_out.is_empty() {
                    return self.read_link(now);
                }
            }
            Ready::Control => {
                if let Some(result) = self.control_result.take() {
                    return self.handle_control_output(result, now);
                }
            }
            Ready::TunRead => {
                // Timers may have queued a datagram since readiness was armed
                if self.link_out.is_empty() && !self.pipeline.has_pending_fragments() {
                    self.read_tun()?;
                }
            }
            Ready::TunWrite => self.write_tun(now),
            Ready::LinkWrite => self.write_link(now),
        }
        Ok(None)
    }

    fn read_link(&mut self, now: Instant) -> Result<Option<ExitReason>, TunnelError> {
        self.link_in.reset(self.pipeline.frame().headroom());
        let (len, from) = match self.socket.try_recv_from(self.link_in.spare_mut()) {
            Ok(Some(received)) => received,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(error = %e, "link read failed");
                return Ok(None);
            }
        };
        self.link_in.commit(len)?;
        self.stats.link_read_bytes += len as u64;
        trace!(len, %from, "link read");

        if !self.socket.peer().accepts(from) {
            debug!(%from, "datagram from unexpected address");
            self.pipeline.record_drop(DropReason::WrongPeer);
            return Ok(None);
        }

        let outcome = self.pipeline.inbound(&mut self.link_in, now);
        match outcome {
            InboundOutcome::Control => return Ok(self.submit_control(from, now)),
            InboundOutcome::Dropped(_) => return Ok(None),
            InboundOutcome::Deliver | InboundOutcome::Keepalive | InboundOutcome::Pending => {}
        }

        self.timers.on_authenticated_packet(now);
        // With a control channel the handshake owns the peer address
        if self.control.is_none() && self.socket.peer_mut().learn(from) {
            info!(peer = %from, "peer address learned");
        }
        match outcome {
            InboundOutcome::Deliver => std::mem::swap(&mut self.link_in, &mut self.tun_out),
            InboundOutcome::Keepalive => {
                self.stats.keepalives_received += 1;
                trace!("keepalive received");
            }
            _ => {}
        }
        Ok(None)
    }

    fn submit_control(&mut self, from: SocketAddr, now: Instant) -> Option<ExitReason> {
        let packet = self.link_in.as_slice().to_vec();
        self.link_in.discard();
        match &mut self.control {
            Some(ControlMode::Cooperative { channel, interval }) => {
                channel.submit_incoming(packet, from);
                interval.future_trigger(now);
            }
            Some(ControlMode::Concurrent(worker)) => {
                if let Err(e) = worker.submit(packet, from) {
                    warn!(error = %e, "control task unavailable");
                    return Some(ExitReason::ControlFailure);
                }
            }
            None => self.pipeline.record_drop(DropReason::UnknownOpcode),
        }
        None
    }

    fn handle_control_output(
        &mut self,
        result: Result<ControlOutput, ControlError>,
        now: Instant,
    ) -> Result<Option<ExitReason>, TunnelError> {
        match result {
            Ok(ControlOutput::Send(packet)) => {
                if self.link_out.is_empty() {
                    self.load_link_out(&packet)?;
                } else {
                    self.deferred_control = Some(packet);
                }
                Ok(None)
            }
            Ok(ControlOutput::Event(event)) => Ok(self.handle_control_event(event, now)),
            Err(e) => {
                warn!(error = %e, "control task stopped");
                Ok(Some(ExitReason::ControlFailure))
            }
        }
    }

    fn read_tun(&mut self) -> Result<(), TunnelError> {
        let frame = *self.pipeline.frame();
        self.tun_in.reset(frame.headroom());
        let len = match self.interface.try_read(self.tun_in.spare_mut()) {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                warn!(error = %e, interface = self.interface.name(), "interface read failed");
                return Ok(());
            }
        };
        let max = frame.max_tun_read();
        if len > max {
            return Err(TunnelError::Oversized { len, max });
        }
        self.tun_in.commit(len)?;
        self.stats.tun_read_bytes += len as u64;
        trace!(len, "interface read");

        if len == 0 {
            return Ok(());
        }
        if self.socket.peer().outgoing().is_none() {
            trace!("peer address unknown, dropping packet");
            return Ok(());
        }
        if self.pipeline.outbound(&mut self.tun_in)? {
            std::mem::swap(&mut self.tun_in, &mut self.link_out);
        }
        Ok(())
    }

    fn write_tun(&mut self, now: Instant) {
        let len = self.tun_out.len();
        match self.interface.try_write(self.tun_out.as_slice()) {
            Ok(written) => {
                if written != len {
                    warn!(written, len, "short interface write");
                }
                self.stats.tun_write_bytes += written as u64;
                self.timers.on_interface_write(now);
                trace!(len = written, "interface write");
                self.tun_out.discard();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(error = %e, interface = self.interface.name(), "interface write failed");
                self.tun_out.discard();
            }
        }
    }

    fn write_link(&mut self, now: Instant) {
        let Some(dest) = self.socket.peer().outgoing() else {
            trace!("peer address unknown, dropping datagram");
            self.link_out.discard();
            return;
        };
        let len = self.link_out.len();
        match self.socket.try_send_to(self.link_out.as_slice(), dest) {
            Ok(Some(sent)) => {
                if sent != len {
                    warn!(sent, len, "short link write");
                }
                self.stats.link_write_bytes += sent as u64;
                if let Some(shaper) = &mut self.shaper {
                    shaper.record_datagram(sent, dest, now);
                }
                self.timers.on_link_write(now);
                trace!(len = sent, %dest, "link write");
                self.link_out.discard();
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, %dest, "link write failed");
                self.link_out.discard();
            }
        }
    }

    fn flush_packet_ids(&mut self, now: Instant) {
        let Some(store) = &mut self.packet_ids else {
            return;
        };
        if let Some((issued, seen)) = high_water(self.pipeline.crypto()) {
            store.update(issued, seen);
        }
        if let Err(e) = store.flush_if_due(now, PACKET_ID_FLUSH_INTERVAL) {
            warn!(error = %e, "failed to persist packet id");
        }
    }

    fn save_packet_ids(&mut self) {
        let Some(store) = &mut self.packet_ids else {
            return;
        };
        if let Some((issued, seen)) = high_water(self.pipeline.crypto()) {
            store.update(issued, seen);
        }
        if let Err(e) = store.save() {
            warn!(error = %e, path = %store.path().display(), "failed to persist packet id");
        }
    }

    fn into_exit(self, reason: ExitReason) -> SessionExit<I> {
        let stats = self.stats();
        let persist = self.config.persist;
        let carry = Carryover {
            keys: if persist.key {
                self.pipeline.crypto().key_ring().cloned()
            } else {
                None
            },
            remote: if persist.remote_ip {
                self.socket.peer().actual
            } else {
                None
            },
            socket: persist.local_ip.then(|| self.socket.socket_arc()),
        };
        SessionExit {
            reason,
            interface: self.interface,
            carry,
            stats,
        }
    }
}

fn high_water(crypto: &DataCrypto) -> Option<(u64, u64)> {
    match crypto {
        DataCrypto::Static(ring) => ring.lock().primary_high_water(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::KEEPALIVE_PATTERN;
    use crate::crypto::{KeyDirection, StaticKey};
    use crate::session::signal::signal_channel;
    use crate::transport::{InterfaceHandle, MemoryInterface};

    async fn bound() -> (Arc<UdpSocket>, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (Arc::new(socket), addr)
    }

    async fn session(config: SessionConfig, socket: Arc<UdpSocket>) -> (Session<MemoryInterface>, InterfaceHandle) {
        let (iface, handle) = MemoryInterface::new("tun-test");
        let carry = Carryover {
            socket: Some(socket),
            ..Default::default()
        };
        (Session::start(config, iface, carry).await.unwrap(), handle)
    }

    #[test]
    fn test_exit_reason_classes() {
        assert!(ExitReason::PingRestart.is_restart());
        assert!(ExitReason::ControlFailure.is_restart());
        assert!(!ExitReason::PingExit.is_restart());
        assert!(!ExitReason::Inactive.is_restart());
        assert!(ExitReason::Hangup.reloads_config());
        assert!(!ExitReason::UserRestart.reloads_config());
    }

    #[tokio::test]
    async fn test_terminate_request_ends_session() {
        let (socket, addr) = bound().await;
        let config = SessionConfig::builder().local(addr).build().unwrap();
        let (session, _handle) = session(config, socket).await;

        let (signals, mut rx) = signal_channel();
        signals.raise(SignalKind::UserStats);
        signals.raise(SignalKind::Terminate);
        let exit = session.run(&mut rx).await.unwrap();
        assert_eq!(exit.reason, ExitReason::Terminate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_exits() {
        let (socket, addr) = bound().await;
        let config = SessionConfig::builder()
            .local(addr)
            .inactive(Duration::from_secs(30))
            .build()
            .unwrap();
        let (session, _handle) = session(config, socket).await;

        let (_signals, mut rx) = signal_channel();
        let exit = session.run(&mut rx).await.unwrap();
        assert_eq!(exit.reason, ExitReason::Inactive);
    }

    #[tokio::test]
    async fn test_oversized_interface_read_is_fatal() {
        let (socket, addr) = bound().await;
        let (_, peer) = bound().await;
        let config = SessionConfig::builder()
            .local(addr)
            .remote(peer)
            .tun_mtu(1000)
            .build()
            .unwrap();
        let (session, handle) = session(config, socket).await;
        handle.inject(vec![0u8; 1001]);

        let (_signals, mut rx) = signal_channel();
        let result = session.run(&mut rx).await;
        assert!(matches!(
            result,
            Err(TunnelError::Oversized { len: 1001, max: 1000 })
        ));
    }

    #[tokio::test]
    async fn test_packets_from_strangers_dropped() {
        let (socket, addr) = bound().await;
        let (_, peer) = bound().await;
        let config = SessionConfig::builder()
            .local(addr)
            .remote(peer)
            .build()
            .unwrap();
        let (session, handle) = session(config, socket).await;

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"hello", addr).await.unwrap();

        let (signals, mut rx) = signal_channel();
        let task = tokio::spawn(async move { session.run(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        signals.raise(SignalKind::Terminate);

        let exit = task.await.unwrap().unwrap();
        assert_eq!(exit.stats.drops.wrong_peer, 1);
        assert_eq!(handle.pending_outbound(), 0);
    }

    #[tokio::test]
    async fn test_keepalive_sent_and_not_delivered() {
        let key = StaticKey::generate();
        let (sock_a, addr_a) = bound().await;
        let (sock_b, addr_b) = bound().await;

        let config_a = SessionConfig::builder()
            .local(addr_a)
            .remote(addr_b)
            .static_key(&key, KeyDirection::Normal)
            .ping(Duration::from_millis(200))
            .build()
            .unwrap();
        let config_b = SessionConfig::builder()
            .local(addr_b)
            .remote(addr_a)
            .static_key(&key, KeyDirection::Inverse)
            .build()
            .unwrap();
        let (a, _handle_a) = session(config_a, sock_a).await;
        let (b, handle_b) = session(config_b, sock_b).await;

        let (signals_a, mut rx_a) = signal_channel();
        let (signals_b, mut rx_b) = signal_channel();
        let task_a = tokio::spawn(async move { a.run(&mut rx_a).await });
        let task_b = tokio::spawn(async move { b.run(&mut rx_b).await });

        tokio::time::sleep(Duration::from_millis(700)).await;
        signals_a.raise(SignalKind::Terminate);
        signals_b.raise(SignalKind::Terminate);

        let exit_a = task_a.await.unwrap().unwrap();
        let exit_b = task_b.await.unwrap().unwrap();
        assert!(exit_a.stats.keepalives_sent >= 2);
        assert!(exit_b.stats.keepalives_received >= 2);
        assert_eq!(handle_b.pending_outbound(), 0);
        assert_ne!(handle_b.try_recv().as_deref(), Some(&KEEPALIVE_PATTERN[..]));
    }

    #[tokio::test]
    async fn test_path_mtu_hint_shrinks_fragments() {
        let (socket, addr) = bound().await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = SessionConfig::builder()
            .local(addr)
            .remote(raw.local_addr().unwrap())
            .static_key(&StaticKey::generate(), KeyDirection::Normal)
            .tun_mtu(1400)
            .fragment(1000)
            .build()
            .unwrap();
        let (session, handle) = session(config, socket).await;
        let hint = session.path_mtu_hint();

        let (signals, mut rx) = signal_channel();
        let task = tokio::spawn(async move { session.run(&mut rx).await });

        async fn datagrams(raw: &UdpSocket, count: usize) -> Vec<usize> {
            let mut buf = [0u8; 2048];
            let mut sizes = Vec::new();
            for _ in 0..count {
                let (len, _) = tokio::time::timeout(Duration::from_secs(5), raw.recv_from(&mut buf))
                    .await
                    .unwrap()
                    .unwrap();
                sizes.push(len);
            }
            sizes
        }

        handle.inject(vec![7u8; 1200]);
        let before = datagrams(&raw, 2).await;
        assert_eq!(before[0], 1000 + 4 + 20);

        hint.report(600);
        // Applied on the next housekeeping pass
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.inject(vec![8u8; 1200]);
        let after = datagrams(&raw, 3).await;
        assert!(after.iter().all(|&len| len <= 600), "{after:?}");
        assert_eq!(after[0], 600);

        signals.raise(SignalKind::Terminate);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_persist_flags_select_carryover() {
        let key = StaticKey::generate();
        let (socket, addr) = bound().await;
        let config = SessionConfig::builder()
            .local(addr)
            .static_key(&key, KeyDirection::Normal)
            .persist(crate::session::PersistFlags {
                key: true,
                local_ip: true,
                ..Default::default()
            })
            .build()
            .unwrap();
        let (session, _handle) = session(config, socket).await;

        let (signals, mut rx) = signal_channel();
        signals.raise(SignalKind::UserRestart);
        let exit = session.run(&mut rx).await.unwrap();

        assert_eq!(exit.reason, ExitReason::UserRestart);
        assert!(exit.carry.keys.is_some());
        assert!(exit.carry.remote.is_none());
        assert_eq!(exit.carry.socket.unwrap().local_addr().unwrap(), addr);
    }
}
