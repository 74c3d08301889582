//! Session counters, logged on a user-stats request.

use tracing::info;

#[cfg(feature = "compression")]
use crate::extensions::CompressionStats;
use crate::pipeline::DropCounters;

/// Traffic totals for one session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    /// Bytes read from the interface.
    pub tun_read_bytes: u64,
    /// Bytes written to the interface.
    pub tun_write_bytes: u64,
    /// Bytes read from the socket.
    pub link_read_bytes: u64,
    /// Bytes written to the socket.
    pub link_write_bytes: u64,
    /// Keepalives sent.
    pub keepalives_sent: u64,
    /// Keepalives received.
    pub keepalives_received: u64,
    /// Inbound drops by reason.
    pub drops: DropCounters,
    /// Partial packets discarded by reassembly expiry.
    pub fragments_expired: u64,
    /// Compression totals, when the layer is enabled.
    #[cfg(feature = "compression")]
    pub compression: Option<CompressionStats>,
}

impl SessionStats {
    /// Emit the counters at info level.
    pub fn log(&self) {
        info!(
            tun_read_bytes = self.tun_read_bytes,
            tun_write_bytes = self.tun_write_bytes,
            link_read_bytes = self.link_read_bytes,
            link_write_bytes = self.link_write_bytes,
            keepalives_sent = self.keepalives_sent,
            keepalives_received = self.keepalives_received,
            "traffic statistics"
        );
        let d = &self.drops;
        info!(
            total = d.total(),
            authentication = d.authentication,
            replay = d.replay,
            truncated = d.truncated,
            unknown_opcode = d.unknown_opcode,
            unknown_key = d.unknown_key,
            fragment = d.fragment,
            decompress = d.decompress,
            oversized = d.oversized,
            wrong_peer = d.wrong_peer,
            no_key = d.no_key,
            fragments_expired = self.fragments_expired,
            "drop statistics"
        );
        #[cfg(feature = "compression")]
        if let Some(c) = &self.compression {
            info!(
                compressed = c.compressed_count,
                stored = c.skipped_count,
                bytes_in = c.total_uncompressed,
                bytes_out = c.total_compressed,
                saved = c.bytes_saved(),
                ratio = c.ratio(),
                "compression statistics"
            );
        }
    }
}
