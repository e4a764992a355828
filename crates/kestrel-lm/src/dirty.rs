//! Dirty-memory tracking.
//!
//! Manages the enable/disable lifecycle of device-side dirty tracking and
//! drains the per-session bitmap page by page. Tracking keeps accumulating
//! new dirty bits while pages are being drained; a drain-to-empty only
//! terminates one pre-copy iteration, it is not required for correctness.
//!
//! Failures here are returned to the orchestrator directly — they never
//! touch the lifecycle state, because a lost bitmap fetch does not
//! invalidate the migration. A `Timeout` in particular is recoverable: the
//! orchestrator re-fetches the same page with `read_seq = true`.

use std::sync::Arc;

use kestrel_proto::lm::total_bitmap_len;
use kestrel_proto::{CommandBlock, DirtyRegion};

use crate::channel::CommandChannel;
use crate::error::{MigrationError, Result};
use crate::transport::DataXfer;

/// Fallback bitmap transfer granularity when firmware reports none.
const DEFAULT_CHUNK_LEN: u32 = 4_096;

/// Device-reported dirty-tracking capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyCapacity {
    /// Maximum number of regions the device can track at once.
    pub max_regions: u8,
    /// Regions currently registered.
    pub active_regions: u8,
    /// Bitmap bytes the device moves per fetch.
    pub chunk_len: u32,
}

/// One page of the logical dirty bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapPage {
    /// Session-unique, monotonically increasing sequence number.
    pub seq: u32,
    /// Byte offset of this page within the logical bitmap.
    pub offset: u32,
    /// Bitmap content, one bit per tracked page.
    pub bits: Vec<u8>,
}

#[derive(Debug)]
struct Session {
    total_len: u64,
    chunk_len: u32,
    pages_per_pass: u32,
    /// Sequence number the next fetch returns; advances only on ack.
    next_seq: u32,
    /// Highest sequence number returned by any fetch this session.
    fetched: Option<u32>,
    /// Highest sequence number acknowledged this session.
    highest_acked: Option<u32>,
}

/// Dirty-tracking driver for one VF.
#[derive(Debug)]
pub struct DirtyPageTracker {
    channel: Arc<CommandChannel>,
    session: Option<Session>,
}

impl DirtyPageTracker {
    /// Build over a shared channel. Tracking starts disabled.
    #[must_use]
    pub const fn new(channel: Arc<CommandChannel>) -> Self {
        Self {
            channel,
            session: None,
        }
    }

    /// Whether a tracking session is active.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.session.is_some()
    }

    /// Query device capacity and current registration count.
    ///
    /// # Errors
    ///
    /// Channel errors propagate unmodified.
    pub fn query_capacity(&self) -> Result<DirtyCapacity> {
        let comp = self.channel.submit(
            &CommandBlock::dirty_status(self.channel.vf_id()),
            DataXfer::None,
        )?;
        let (max_regions, active_regions, chunk_len) = comp.dirty_capacity();
        Ok(DirtyCapacity {
            max_regions,
            active_regions,
            chunk_len,
        })
    }

    /// Register `regions` and start tracking. All writes to the registered
    /// ranges from this instant on are eventually reflected in fetched
    /// bitmaps.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an empty list or one exceeding the
    ///   device-reported maximum.
    /// - `AlreadyEnabled` if a session is active; disable first.
    /// - Channel errors propagate unmodified; no session is created.
    pub fn enable(&mut self, regions: &[DirtyRegion]) -> Result<()> {
        if self.session.is_some() {
            return Err(MigrationError::AlreadyEnabled);
        }
        if regions.is_empty() {
            return Err(MigrationError::invalid_argument(
                "dirty tracking needs at least one region",
            ));
        }
        let cap = self.query_capacity()?;
        if regions.len() > usize::from(cap.max_regions) {
            return Err(MigrationError::invalid_argument(format!(
                "{} regions exceed device maximum {}",
                regions.len(),
                cap.max_regions
            )));
        }

        let mut payload = Vec::with_capacity(regions.len() * kestrel_proto::REGION_DESC_LEN);
        for region in regions {
            payload.extend_from_slice(&region.encode());
        }

        #[allow(clippy::cast_possible_truncation)]
        let num_regions = regions.len() as u8;
        self.channel.submit(
            &CommandBlock::dirty_enable(self.channel.vf_id(), num_regions),
            DataXfer::ToDevice(&payload),
        )?;

        let total_len = total_bitmap_len(regions);
        let chunk_len = if cap.chunk_len == 0 {
            DEFAULT_CHUNK_LEN
        } else {
            cap.chunk_len
        };
        #[allow(clippy::cast_possible_truncation)]
        let pages_per_pass = total_len.div_ceil(u64::from(chunk_len)).max(1) as u32;

        tracing::info!(
            vf = self.channel.vf_id(),
            regions = regions.len(),
            total_bitmap_bytes = total_len,
            chunk_len,
            "dirty tracking enabled"
        );

        self.session = Some(Session {
            total_len,
            chunk_len,
            pages_per_pass,
            next_seq: 0,
            fetched: None,
            highest_acked: None,
        });
        Ok(())
    }

    /// Stop tracking and release device-side resources.
    ///
    /// Idempotent: disabling while already disabled is a successful no-op,
    /// so abort paths can call it unconditionally.
    ///
    /// # Errors
    ///
    /// Channel errors propagate unmodified; the session is dropped
    /// regardless, since device-side state is unknown after a failed
    /// disable and a retry would start from scratch anyway.
    pub fn disable(&mut self) -> Result<()> {
        if self.session.is_none() {
            tracing::debug!(vf = self.channel.vf_id(), "dirty tracking already disabled");
            return Ok(());
        }
        self.session = None;
        self.channel.submit(
            &CommandBlock::dirty_disable(self.channel.vf_id()),
            DataXfer::None,
        )?;
        tracing::info!(vf = self.channel.vf_id(), "dirty tracking disabled");
        Ok(())
    }

    /// Fetch the next page of the logical dirty bitmap.
    ///
    /// With `read_seq = true` the page stays unacknowledged and a repeat
    /// call re-delivers the same page — the retry path after a transfer
    /// failure. With `read_seq = false` the page is acknowledged in the
    /// same call and the cursor advances.
    ///
    /// # Errors
    ///
    /// - `InvalidState` when tracking is not enabled.
    /// - `Timeout` is recoverable: no cursor movement has happened, so the
    ///   caller retries with `read_seq = true`.
    pub fn fetch_next_page(&mut self, read_seq: bool) -> Result<BitmapPage> {
        let vf = self.channel.vf_id();
        #[allow(clippy::cast_possible_truncation)]
        let (seq, offset, len) = {
            let session = self
                .session
                .as_ref()
                .ok_or_else(|| MigrationError::invalid_state("dirty tracking not enabled"))?;
            let offset = u64::from(session.next_seq % session.pages_per_pass)
                * u64::from(session.chunk_len);
            let len = u64::from(session.chunk_len).min(session.total_len - offset);
            (session.next_seq, offset as u32, len as u32)
        };

        let mut bits = vec![0u8; len as usize];
        self.channel.submit(
            &CommandBlock::dirty_read_seq(vf, seq, offset, len),
            DataXfer::FromDevice(&mut bits),
        )?;

        if let Some(session) = self.session.as_mut() {
            session.fetched = Some(seq.max(session.fetched.unwrap_or(0)));
        }
        tracing::trace!(vf, seq, offset, len, read_seq, "fetched bitmap page");

        if !read_seq {
            self.acknowledge(seq)?;
        }
        Ok(BitmapPage { seq, offset, bits })
    }

    /// Acknowledge page `seq`, advancing the device cursor so the page is
    /// never re-delivered and its bits may be cleared for the next pass.
    ///
    /// Acknowledgments must be non-decreasing; re-acknowledging the
    /// current highest is a no-op.
    ///
    /// # Errors
    ///
    /// - `InvalidState` when tracking is not enabled.
    /// - `OutOfOrder` when `seq` is below the highest acknowledged.
    /// - `InvalidArgument` when `seq` has not been fetched yet.
    pub fn acknowledge(&mut self, seq: u32) -> Result<()> {
        let vf = self.channel.vf_id();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| MigrationError::invalid_state("dirty tracking not enabled"))?;

        if let Some(acked) = session.highest_acked {
            if seq < acked {
                return Err(MigrationError::OutOfOrder { seq, acked });
            }
            if seq == acked {
                return Ok(());
            }
        }
        match session.fetched {
            Some(fetched) if seq <= fetched => {}
            _ => {
                return Err(MigrationError::invalid_argument(format!(
                    "page {seq} has not been fetched"
                )))
            }
        }

        self.channel
            .submit(&CommandBlock::dirty_ack(vf, seq), DataXfer::None)?;
        session.highest_acked = Some(seq);
        session.next_seq = seq + 1;
        tracing::trace!(vf, seq, "acknowledged bitmap page");
        Ok(())
    }
}
