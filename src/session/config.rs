//! Session configuration.
//!
//! [`SessionConfig`] deserializes from any serde format with every field
//! defaulted, or is assembled with [`SessionConfigBuilder`]. Nothing is
//! opened until [`SessionConfig::validate`] has passed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::control::{ControlSettings, Role};
use crate::core::{
    ConfigError, DEFAULT_HANDSHAKE_WINDOW, DEFAULT_PACKET_TIMEOUT, DEFAULT_RENEGOTIATE,
    DEFAULT_REPLAY_WINDOW, DEFAULT_TRANSITION_WINDOW, DEFAULT_TUN_MTU_EXTRA, PUBLIC_KEY_SIZE,
};
use crate::crypto::{CipherKind, KeyDirection, StaticKey, StaticKeypair, parse_key_hex};
use crate::extensions::{FRAGMENT_HEADER_SIZE, MAX_FRAGMENT_SIZE, MIN_FRAGMENT_SIZE};
use crate::transport::{Frame, FrameBuilder, Layer, PingAction, TrafficShaper};

/// Default UDP port.
pub const DEFAULT_PORT: u16 = 1194;

/// Default zstd level for the compression layer.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Compression layer setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum CompressionMode {
    /// No compression layer.
    #[default]
    Off,
    /// zstd at the given level.
    Zstd {
        /// zstd level (1..=22).
        #[serde(default = "default_zstd_level")]
        level: i32,
    },
}

/// How the data channel is keyed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum CryptoConfig {
    /// Cleartext tunnel.
    #[default]
    None,
    /// Pre-shared 64-byte key.
    StaticKey {
        /// Key as 128 hex characters.
        key: String,
        /// Which half this side sends with.
        #[serde(default)]
        direction: KeyDirection,
    },
    /// Keys negotiated over the control channel.
    Handshake {
        /// Client initiates, server answers.
        role: Role,
        /// Our X25519 private key as hex.
        private_key: String,
        /// Peer's X25519 public key as hex.
        #[serde(default)]
        peer_public_key: String,
        /// Renegotiation period in seconds.
        #[serde(default = "default_renegotiate", with = "duration_secs")]
        renegotiate: Duration,
        /// Seconds allowed for one negotiation.
        #[serde(default = "default_handshake_window", with = "duration_secs")]
        handshake_window: Duration,
        /// Seconds a replaced key still decrypts.
        #[serde(default = "default_transition_window", with = "duration_secs")]
        transition_window: Duration,
        /// Seconds between hello retransmissions.
        #[serde(default = "default_packet_timeout", with = "duration_secs")]
        packet_timeout: Duration,
        /// Run the control channel on its own task.
        #[serde(default)]
        concurrent: bool,
    },
}

/// State that survives a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct PersistFlags {
    /// Keep the key ring, including replay state.
    pub key: bool,
    /// Keep the learned remote address.
    pub remote_ip: bool,
    /// Keep the bound local socket.
    pub local_ip: bool,
    /// Keep the virtual interface open.
    pub tun: bool,
}

/// Everything one session needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Local bind address.
    pub local: SocketAddr,
    /// Configured peer, if known in advance.
    pub remote: Option<SocketAddr>,
    /// Accept authenticated packets from a changed peer address.
    pub float: bool,
    /// Interface MTU. Exclusive with `link_mtu`.
    pub tun_mtu: Option<usize>,
    /// Datagram MTU. Exclusive with `tun_mtu`.
    pub link_mtu: Option<usize>,
    /// Bytes an interface read may exceed the interface MTU by.
    pub tun_mtu_extra: usize,
    /// Maximum fragment payload; `None` disables fragmentation.
    pub fragment: Option<usize>,
    /// Compression layer.
    pub compression: CompressionMode,
    /// Data-channel keying.
    pub crypto: CryptoConfig,
    /// Data-channel cipher.
    pub cipher: CipherKind,
    /// Replay protection on received packets.
    pub replay: bool,
    /// Replay window size in packet ids.
    pub replay_window: usize,
    /// Where the static-key packet-id record lives.
    pub packet_id_file: Option<PathBuf>,
    /// Socket write rate limit in bytes per second.
    pub shaper: Option<u32>,
    /// End the session after this many seconds without interface writes.
    #[serde(with = "option_duration_secs")]
    pub inactive: Option<Duration>,
    /// Send a keepalive after this many seconds without socket writes.
    #[serde(with = "option_duration_secs")]
    pub ping: Option<Duration>,
    /// Restart after this many seconds without authenticated packets.
    #[serde(with = "option_duration_secs")]
    pub ping_restart: Option<Duration>,
    /// Exit after this many seconds without authenticated packets.
    #[serde(with = "option_duration_secs")]
    pub ping_exit: Option<Duration>,
    /// Only run the receive timer once the peer address is known.
    pub ping_timer_remote: bool,
    /// Restart carry-over.
    pub persist: PersistFlags,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            remote: None,
            float: false,
            tun_mtu: None,
            link_mtu: None,
            tun_mtu_extra: DEFAULT_TUN_MTU_EXTRA,
            fragment: None,
            compression: CompressionMode::Off,
            crypto: CryptoConfig::None,
            cipher: CipherKind::default(),
            replay: true,
            replay_window: DEFAULT_REPLAY_WINDOW,
            packet_id_file: None,
            shaper: None,
            inactive: None,
            ping: None,
            ping_restart: None,
            ping_exit: None,
            ping_timer_remote: false,
            persist: PersistFlags::default(),
        }
    }
}

/// Data-channel keys resolved from configuration.
pub(crate) enum ResolvedCrypto {
    Cleartext,
    Static(StaticKey, KeyDirection),
    Handshake {
        settings: ControlSettings,
        local: StaticKeypair,
        peer_public: [u8; PUBLIC_KEY_SIZE],
        concurrent: bool,
    },
}

impl SessionConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Check every setting that would otherwise fail mid-session.
    ///
    /// # Errors
    /// The first offending setting as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.compression, CompressionMode::Zstd { .. }) && !cfg!(feature = "compression") {
            return Err(ConfigError::Unsupported("compression"));
        }
        self.frame()?;

        if let Some(size) = self.fragment {
            if !(MIN_FRAGMENT_SIZE..=MAX_FRAGMENT_SIZE).contains(&size) {
                return Err(ConfigError::invalid(
                    "fragment",
                    format!("{size} outside {MIN_FRAGMENT_SIZE}..={MAX_FRAGMENT_SIZE}"),
                ));
            }
        }
        if let Some(rate) = self.shaper {
            TrafficShaper::new(rate)?;
        }
        if self.remote == Some(self.local) {
            return Err(ConfigError::invalid("remote", "same as the local address"));
        }
        if self.ping_restart.is_some() && self.ping_exit.is_some() {
            return Err(ConfigError::invalid(
                "ping_restart",
                "ping_restart and ping_exit are mutually exclusive",
            ));
        }
        for (field, value) in [
            ("ping_restart", self.ping_restart),
            ("ping_exit", self.ping_exit),
            ("ping", self.ping),
            ("inactive", self.inactive),
        ] {
            if value == Some(Duration::ZERO) {
                return Err(ConfigError::invalid(field, "duration must be positive"));
            }
        }
        if self.replay && self.replay_window == 0 {
            return Err(ConfigError::invalid("replay_window", "must be positive"));
        }

        self.resolve_crypto()?;
        Ok(())
    }

    /// Compute the frame budget for these settings.
    pub fn frame(&self) -> Result<Frame, ConfigError> {
        let mut builder = FrameBuilder::new()
            .tun_mtu(self.tun_mtu)
            .link_mtu(self.link_mtu)
            .tun_mtu_extra(self.tun_mtu_extra);

        #[cfg(feature = "compression")]
        if matches!(self.compression, CompressionMode::Zstd { .. }) {
            builder.register(Layer::Compression, crate::extensions::COMPRESSION_OVERHEAD)?;
        }
        if self.fragment.is_some() {
            builder.register(Layer::Fragmentation, FRAGMENT_HEADER_SIZE)?;
        }
        match &self.crypto {
            CryptoConfig::None => {}
            CryptoConfig::StaticKey { .. } => {
                builder.register(Layer::Encryption, self.cipher.overhead())?;
            }
            CryptoConfig::Handshake { .. } => {
                // Discriminator byte in front of every datagram
                builder.register(Layer::Encryption, self.cipher.overhead() + 1)?;
            }
        }
        Ok(builder.finalize()?)
    }

    /// Keepalive-receive timer and what it does on expiry.
    pub fn ping_receive(&self) -> Option<(Duration, PingAction)> {
        self.ping_restart
            .map(|d| (d, PingAction::Restart))
            .or(self.ping_exit.map(|d| (d, PingAction::Exit)))
    }

    /// Replay window size, `None` when replay protection is off.
    pub fn replay_window(&self) -> Option<usize> {
        self.replay.then_some(self.replay_window)
    }

    pub(crate) fn resolve_crypto(&self) -> Result<ResolvedCrypto, ConfigError> {
        match &self.crypto {
            CryptoConfig::None => Ok(ResolvedCrypto::Cleartext),
            CryptoConfig::StaticKey { key, direction } => {
                Ok(ResolvedCrypto::Static(StaticKey::from_hex(key)?, *direction))
            }
            CryptoConfig::Handshake {
                role,
                private_key,
                peer_public_key,
                renegotiate,
                handshake_window,
                transition_window,
                packet_timeout,
                concurrent,
            } => {
                if peer_public_key.trim().is_empty() {
                    return Err(ConfigError::invalid(
                        "peer_public_key",
                        "handshake mode needs the peer's public key",
                    ));
                }
                if packet_timeout.is_zero() || handshake_window.is_zero() || renegotiate.is_zero() {
                    return Err(ConfigError::invalid(
                        "crypto",
                        "handshake timers must be positive",
                    ));
                }
                Ok(ResolvedCrypto::Handshake {
                    settings: ControlSettings {
                        role: *role,
                        cipher: self.cipher,
                        replay_window: self.replay_window(),
                        renegotiate: *renegotiate,
                        handshake_window: *handshake_window,
                        transition_window: *transition_window,
                        packet_timeout: *packet_timeout,
                    },
                    local: StaticKeypair::from_hex(private_key)?,
                    peer_public: parse_key_hex(peer_public_key)?,
                    concurrent: *concurrent,
                })
            }
        }
    }
}

/// Fluent construction of a [`SessionConfig`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local bind address.
    pub fn local(mut self, addr: SocketAddr) -> Self {
        self.config.local = addr;
        self
    }

    /// Set the peer address.
    pub fn remote(mut self, addr: SocketAddr) -> Self {
        self.config.remote = Some(addr);
        self
    }

    /// Allow the peer to change address.
    pub fn float(mut self, float: bool) -> Self {
        self.config.float = float;
        self
    }

    /// Set the interface MTU.
    pub fn tun_mtu(mut self, mtu: usize) -> Self {
        self.config.tun_mtu = Some(mtu);
        self
    }

    /// Set the link MTU.
    pub fn link_mtu(mut self, mtu: usize) -> Self {
        self.config.link_mtu = Some(mtu);
        self
    }

    /// Enable fragmentation at `size` payload bytes per fragment.
    pub fn fragment(mut self, size: usize) -> Self {
        self.config.fragment = Some(size);
        self
    }

    /// Enable zstd compression.
    pub fn compression(mut self, mode: CompressionMode) -> Self {
        self.config.compression = mode;
        self
    }

    /// Use a pre-shared static key.
    pub fn static_key(mut self, key: &StaticKey, direction: KeyDirection) -> Self {
        self.config.crypto = CryptoConfig::StaticKey {
            key: key.to_hex(),
            direction,
        };
        self
    }

    /// Negotiate keys over the control channel with default timers.
    pub fn handshake(mut self, role: Role, local: &StaticKeypair, peer_public: &[u8; PUBLIC_KEY_SIZE]) -> Self {
        self.config.crypto = CryptoConfig::Handshake {
            role,
            private_key: hex::encode(local.private_key()),
            peer_public_key: hex::encode(peer_public),
            renegotiate: DEFAULT_RENEGOTIATE,
            handshake_window: DEFAULT_HANDSHAKE_WINDOW,
            transition_window: DEFAULT_TRANSITION_WINDOW,
            packet_timeout: DEFAULT_PACKET_TIMEOUT,
            concurrent: false,
        };
        self
    }

    /// Set the full crypto configuration.
    pub fn crypto(mut self, crypto: CryptoConfig) -> Self {
        self.config.crypto = crypto;
        self
    }

    /// Choose the data-channel cipher.
    pub fn cipher(mut self, cipher: CipherKind) -> Self {
        self.config.cipher = cipher;
        self
    }

    /// Disable or enable replay protection.
    pub fn replay(mut self, enabled: bool) -> Self {
        self.config.replay = enabled;
        self
    }

    /// Set the replay window.
    pub fn replay_window(mut self, size: usize) -> Self {
        self.config.replay_window = size;
        self
    }

    /// Persist the packet-id record at `path`.
    pub fn packet_id_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.packet_id_file = Some(path.into());
        self
    }

    /// Limit socket writes to `bytes_per_second`.
    pub fn shaper(mut self, bytes_per_second: u32) -> Self {
        self.config.shaper = Some(bytes_per_second);
        self
    }

    /// Exit after `period` without interface writes.
    pub fn inactive(mut self, period: Duration) -> Self {
        self.config.inactive = Some(period);
        self
    }

    /// Send keepalives after `period` of socket silence.
    pub fn ping(mut self, period: Duration) -> Self {
        self.config.ping = Some(period);
        self
    }

    /// Restart after `period` without authenticated packets.
    pub fn ping_restart(mut self, period: Duration) -> Self {
        self.config.ping_restart = Some(period);
        self
    }

    /// Exit after `period` without authenticated packets.
    pub fn ping_exit(mut self, period: Duration) -> Self {
        self.config.ping_exit = Some(period);
        self
    }

    /// Hold the receive timer until the peer address is known.
    pub fn ping_timer_remote(mut self, enabled: bool) -> Self {
        self.config.ping_timer_remote = enabled;
        self
    }

    /// Set restart carry-over.
    pub fn persist(mut self, flags: PersistFlags) -> Self {
        self.config.persist = flags;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn default_zstd_level() -> i32 {
    DEFAULT_ZSTD_LEVEL
}

fn default_renegotiate() -> Duration {
    DEFAULT_RENEGOTIATE
}

fn default_handshake_window() -> Duration {
    DEFAULT_HANDSHAKE_WINDOW
}

fn default_transition_window() -> Duration {
    DEFAULT_TRANSITION_WINDOW
}

fn default_packet_timeout() -> Duration {
    DEFAULT_PACKET_TIMEOUT
}

/// Whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Optional whole seconds.
mod option_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
