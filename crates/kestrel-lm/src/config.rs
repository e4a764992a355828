//! Transfer configuration.
//!
//! All tunables live here so call sites carry no magic numbers. Chunk sizes
//! are derived from what is being moved; timeouts default to values that
//! cover a loaded firmware command processor with margin.

use std::time::Duration;

/// Timeouts and chunking for one VF's migration traffic.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Per-command completion deadline (ms).
    pub cmd_timeout_ms: u64,

    /// Total budget for the suspend/quiesce poll loop (ms). Quiesce has to
    /// drain in-flight descriptors, so this is much longer than a single
    /// command.
    pub suspend_timeout_ms: u64,

    /// Spacing between `LM_SUSPEND_STATUS` polls (ms).
    pub suspend_poll_ms: u64,

    /// Chunk size for state blob transfers (bytes). Zero means derive from
    /// the queried blob size via [`TransferConfig::chunk_for_blob`].
    pub blob_chunk_len: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            cmd_timeout_ms: 2_000,
            suspend_timeout_ms: 5_000,
            suspend_poll_ms: 20,
            blob_chunk_len: 0,
        }
    }
}

impl TransferConfig {
    /// Per-command deadline as a [`Duration`].
    #[must_use]
    pub const fn cmd_timeout(&self) -> Duration {
        Duration::from_millis(self.cmd_timeout_ms)
    }

    /// Suspend poll-loop budget as a [`Duration`].
    #[must_use]
    pub const fn suspend_timeout(&self) -> Duration {
        Duration::from_millis(self.suspend_timeout_ms)
    }

    /// Blob chunk size for a blob of `size` bytes.
    ///
    /// Small blobs move in one 4 KiB chunk; large session tables are cut
    /// into bigger chunks to amortize the per-command mailbox round trip.
    #[must_use]
    pub fn chunk_for_blob(&self, size: u64) -> usize {
        if self.blob_chunk_len != 0 {
            return self.blob_chunk_len;
        }
        match size {
            0..=65_536 => 4_096,
            65_537..=16_777_216 => 65_536,
            _ => 262_144,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_tiers() {
        let cfg = TransferConfig::default();
        assert_eq!(cfg.chunk_for_blob(1024), 4_096);
        assert_eq!(cfg.chunk_for_blob(1 << 20), 65_536);
        assert_eq!(cfg.chunk_for_blob(1 << 28), 262_144);
    }

    #[test]
    fn explicit_chunk_wins() {
        let cfg = TransferConfig {
            blob_chunk_len: 8_192,
            ..TransferConfig::default()
        };
        assert_eq!(cfg.chunk_for_blob(1 << 28), 8_192);
    }
}
