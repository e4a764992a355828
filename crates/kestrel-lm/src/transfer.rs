//! State blob transfer.
//!
//! Moves the device's opaque session-state blob across the save/restore
//! boundary in bounded chunks. The blob is never interpreted here: reads
//! hand back exactly what the device produced, writes hand the device
//! exactly what the orchestrator supplies, and the device validates the
//! reassembled blob only when the terminating resume command arrives.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use kestrel_proto::CommandBlock;

use crate::channel::CommandChannel;
use crate::config::TransferConfig;
use crate::error::{MigrationError, Result};
use crate::state::{MigrationState, StateCell};
use crate::transport::DataXfer;

#[derive(Debug)]
struct Blob {
    size: u64,
    /// Highest byte position read so far; the save pass completes when
    /// this reaches `size`.
    read_watermark: u64,
    written: u64,
}

/// Save/restore driver for one VF's state blob.
#[derive(Debug)]
pub struct StateTransferBuffer {
    channel: Arc<CommandChannel>,
    state: Arc<StateCell>,
    config: TransferConfig,
    blob: Option<Blob>,
}

impl StateTransferBuffer {
    /// Build over a shared channel and state cell.
    #[must_use]
    pub const fn new(
        channel: Arc<CommandChannel>,
        state: Arc<StateCell>,
        config: TransferConfig,
    ) -> Self {
        Self {
            channel,
            state,
            config,
            blob: None,
        }
    }

    /// Query the exact byte length of the current state blob.
    ///
    /// Must precede any [`read_state`](Self::read_state). Legal from
    /// `Stopped` (enters `SavingStatus`) or as a re-query within
    /// `SavingStatus`.
    ///
    /// # Errors
    ///
    /// - `InvalidState` outside a saving-eligible state.
    /// - A channel failure latches the lifecycle `Error` state.
    pub fn query_size(&mut self) -> Result<u64> {
        self.state.require(
            &[MigrationState::Stopped, MigrationState::SavingStatus],
            "state blob size query",
        )?;
        self.state
            .ensure(MigrationState::Stopped, MigrationState::SavingStatus)?;

        let vf = self.channel.vf_id();
        let comp = match self
            .channel
            .submit(&CommandBlock::state_size(vf), DataXfer::None)
        {
            Ok(comp) => comp,
            Err(err) => {
                self.state
                    .fail(MigrationState::Stopped, MigrationState::SavingStatus);
                return Err(err);
            }
        };

        let size = comp.blob_size();
        tracing::info!(vf, size, "state blob size queried");
        self.blob = Some(Blob {
            size,
            read_watermark: 0,
            written: 0,
        });
        Ok(size)
    }

    /// Read `length` blob bytes starting at `offset`, chunked internally
    /// to the configured transfer size.
    ///
    /// The first read moves `SavingStatus → Saving`; once the read
    /// watermark reaches the queried size the machine returns to
    /// `Stopped`, closing the save pass.
    ///
    /// # Errors
    ///
    /// - `InvalidState` outside `SavingStatus`/`Saving`.
    /// - `OutOfRange` when `offset + length` exceeds the queried size.
    /// - A channel failure latches the lifecycle `Error` state.
    pub fn read_state(&mut self, offset: u64, length: usize) -> Result<Bytes> {
        self.state.require(
            &[MigrationState::SavingStatus, MigrationState::Saving],
            "state blob read",
        )?;
        let size = self
            .blob
            .as_ref()
            .ok_or_else(|| MigrationError::invalid_state("state blob size not queried"))?
            .size;
        let end = offset
            .checked_add(length as u64)
            .ok_or(MigrationError::OutOfRange {
                offset,
                length: length as u64,
                size,
            })?;
        if end > size {
            return Err(MigrationError::OutOfRange {
                offset,
                length: length as u64,
                size,
            });
        }

        self.state
            .ensure(MigrationState::SavingStatus, MigrationState::Saving)?;

        let vf = self.channel.vf_id();
        let chunk_len = self.config.chunk_for_blob(size);
        let mut out = BytesMut::zeroed(length);
        let mut done = 0usize;
        while done < length {
            let step = chunk_len.min(length - done);
            let step_offset = offset + done as u64;
            #[allow(clippy::cast_possible_truncation)]
            let cmd = CommandBlock::save_state(vf, step_offset as u32, step as u32);
            if let Err(err) = self
                .channel
                .submit(&cmd, DataXfer::FromDevice(&mut out[done..done + step]))
            {
                self.state.fail(MigrationState::Saving, MigrationState::Stopped);
                return Err(err);
            }
            done += step;
        }

        if let Some(blob) = self.blob.as_mut() {
            blob.read_watermark = blob.read_watermark.max(end);
            if blob.read_watermark == size {
                self.state
                    .advance(MigrationState::Saving, MigrationState::Stopped)?;
                tracing::info!(vf, size, "state blob fully read, save pass complete");
            }
        }
        Ok(out.freeze())
    }

    /// Write `data` at blob `offset` during restore, chunked internally.
    ///
    /// Chunks may arrive in any order; the device buffers them and
    /// validates the reassembled blob only when the terminating resume
    /// command is issued. The first write moves `Stopped → Resuming`.
    ///
    /// # Errors
    ///
    /// - `InvalidState` outside `Stopped`/`Resuming`.
    /// - A channel failure latches the lifecycle `Error` state.
    pub fn write_state(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.state.require(
            &[MigrationState::Stopped, MigrationState::Resuming],
            "state blob write",
        )?;
        self.state
            .ensure(MigrationState::Stopped, MigrationState::Resuming)?;

        let vf = self.channel.vf_id();
        let chunk_len = self.config.chunk_for_blob(data.len() as u64);
        let mut done = 0usize;
        while done < data.len() {
            let step = chunk_len.min(data.len() - done);
            let step_offset = offset + done as u64;
            #[allow(clippy::cast_possible_truncation)]
            let cmd = CommandBlock::restore_state(vf, step_offset as u32, step as u32);
            if let Err(err) = self
                .channel
                .submit(&cmd, DataXfer::ToDevice(&data[done..done + step]))
            {
                self.state
                    .fail(MigrationState::Resuming, MigrationState::Running);
                return Err(err);
            }
            done += step;
        }

        if let Some(blob) = self.blob.as_mut() {
            blob.written += data.len() as u64;
        }
        tracing::debug!(vf, offset, len = data.len(), "state blob chunk written");
        Ok(())
    }

    /// Drop blob bookkeeping. Called after resume, reset, or teardown —
    /// the blob's lifetime is bounded to one save/restore pass.
    pub fn discard(&mut self) {
        if self.blob.take().is_some() {
            tracing::debug!(vf = self.channel.vf_id(), "state blob bookkeeping discarded");
        }
    }
}
