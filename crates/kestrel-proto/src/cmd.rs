//! Command and completion block layouts.
//!
//! Every exchange with the firmware command processor is one fixed-size
//! command block answered by exactly one fixed-size completion. Bulk data
//! (region descriptor lists, bitmap chunks, state blob chunks) travels in a
//! separate host buffer the device reaches by DMA; the command block itself
//! never carries bulk payload.
//!
//! All multi-byte fields are little-endian.
//!
//! # Command block layout
//!
//! ```text
//! byte  0        opcode
//! byte  1        flags (reserved, zero)
//! bytes 2..4     VF id
//! bytes 4..8     reserved
//! bytes 8..      op-specific arguments (see constructors)
//! ```
//!
//! # Completion block layout
//!
//! ```text
//! byte  0        status (see [`crate::status::CmdStatus`])
//! bytes 1..4     reserved
//! bytes 4..8     op-specific small results
//! bytes 8..16    op-specific wide result (u32/u64)
//! ```

use crate::lm::HostStatus;

/// Command block length in bytes.
pub const CMD_LEN: usize = 64;

/// Completion block length in bytes.
pub const COMP_LEN: usize = 16;

/// Migration command opcodes.
///
/// The values are firmware-defined identifiers; orchestrators treat them as
/// opaque. Dirty-tracking opcodes live in a separate range from lifecycle
/// opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Announce a migration client for this VF.
    LmRegister = 0x10,
    /// Withdraw the migration client for this VF.
    LmUnregister = 0x11,
    /// Request the VF quiesce all in-flight work.
    LmSuspend = 0x12,
    /// Poll quiesce progress; answers `Again` until the VF is drained.
    LmSuspendStatus = 0x13,
    /// Resume a suspended VF, validating any restored state first.
    LmResume = 0x14,
    /// Query the byte length of the device state blob.
    LmStateSize = 0x15,
    /// Read one chunk of the device state blob (device → host DMA).
    LmSaveState = 0x16,
    /// Write one chunk of a previously saved state blob (host → device DMA).
    LmRestoreState = 0x17,
    /// Advisory: inform firmware of the host's migration phase.
    LmHostStatus = 0x18,
    /// Query dirty-tracking capacity and geometry.
    DirtyStatus = 0x20,
    /// Start dirty tracking over a region list (host → device DMA).
    DirtyEnable = 0x21,
    /// Stop dirty tracking and release device-side resources.
    DirtyDisable = 0x22,
    /// Non-destructive read of one bitmap page (device → host DMA).
    DirtyReadSeq = 0x23,
    /// Acknowledge a bitmap page, advancing the device cursor.
    DirtyAck = 0x24,
}

impl Opcode {
    /// Decode a raw opcode byte.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x10 => Self::LmRegister,
            0x11 => Self::LmUnregister,
            0x12 => Self::LmSuspend,
            0x13 => Self::LmSuspendStatus,
            0x14 => Self::LmResume,
            0x15 => Self::LmStateSize,
            0x16 => Self::LmSaveState,
            0x17 => Self::LmRestoreState,
            0x18 => Self::LmHostStatus,
            0x20 => Self::DirtyStatus,
            0x21 => Self::DirtyEnable,
            0x22 => Self::DirtyDisable,
            0x23 => Self::DirtyReadSeq,
            0x24 => Self::DirtyAck,
            _ => return None,
        })
    }
}

/// One 64-byte command block, ready to post to the mailbox.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandBlock {
    bytes: [u8; CMD_LEN],
}

impl std::fmt::Debug for CommandBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBlock")
            .field("opcode", &Opcode::from_raw(self.bytes[0]))
            .field("vf_id", &self.vf_id())
            .finish()
    }
}

impl CommandBlock {
    fn new(op: Opcode, vf_id: u16) -> Self {
        let mut bytes = [0u8; CMD_LEN];
        bytes[0] = op as u8;
        bytes[2..4].copy_from_slice(&vf_id.to_le_bytes());
        Self { bytes }
    }

    fn put_u8(mut self, at: usize, v: u8) -> Self {
        self.bytes[at] = v;
        self
    }

    fn put_u32(mut self, at: usize, v: u32) -> Self {
        self.bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
        self
    }

    /// Raw opcode byte.
    #[must_use]
    pub const fn opcode_raw(&self) -> u8 {
        self.bytes[0]
    }

    /// Decoded opcode, if the byte is a known value.
    #[must_use]
    pub const fn opcode(&self) -> Option<Opcode> {
        Opcode::from_raw(self.bytes[0])
    }

    /// VF id the command targets.
    #[must_use]
    pub fn vf_id(&self) -> u16 {
        u16::from_le_bytes([self.bytes[2], self.bytes[3]])
    }

    /// Argument u8 at byte offset `at`.
    #[must_use]
    pub const fn arg_u8(&self, at: usize) -> u8 {
        self.bytes[at]
    }

    /// Argument u32 at byte offset `at`.
    ///
    /// # Panics
    ///
    /// Panics if `at + 4` exceeds [`CMD_LEN`].
    #[must_use]
    pub fn arg_u32(&self, at: usize) -> u32 {
        let mut v = [0u8; 4];
        v.copy_from_slice(&self.bytes[at..at + 4]);
        u32::from_le_bytes(v)
    }

    /// Full wire representation.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CMD_LEN] {
        &self.bytes
    }

    // ── Lifecycle commands ───────────────────────────────────────────────

    /// `LM_REGISTER` — announce the migration client.
    #[must_use]
    pub fn register(vf_id: u16) -> Self {
        Self::new(Opcode::LmRegister, vf_id)
    }

    /// `LM_UNREGISTER` — withdraw the migration client.
    #[must_use]
    pub fn unregister(vf_id: u16) -> Self {
        Self::new(Opcode::LmUnregister, vf_id)
    }

    /// `LM_SUSPEND` — request quiesce.
    #[must_use]
    pub fn suspend(vf_id: u16) -> Self {
        Self::new(Opcode::LmSuspend, vf_id)
    }

    /// `LM_SUSPEND_STATUS` — poll quiesce progress.
    #[must_use]
    pub fn suspend_status(vf_id: u16) -> Self {
        Self::new(Opcode::LmSuspendStatus, vf_id)
    }

    /// `LM_RESUME` — resume the VF.
    #[must_use]
    pub fn resume(vf_id: u16) -> Self {
        Self::new(Opcode::LmResume, vf_id)
    }

    /// `LM_STATE_SIZE` — query state blob length.
    ///
    /// Completion: blob size via [`Completion::blob_size`].
    #[must_use]
    pub fn state_size(vf_id: u16) -> Self {
        Self::new(Opcode::LmStateSize, vf_id)
    }

    /// `LM_SAVE_STATE` — read blob bytes `[offset, offset + len)`.
    ///
    /// Args: `offset` u32 at byte 8, `len` u32 at byte 12. The chunk is
    /// delivered into the DMA buffer.
    #[must_use]
    pub fn save_state(vf_id: u16, offset: u32, len: u32) -> Self {
        Self::new(Opcode::LmSaveState, vf_id)
            .put_u32(8, offset)
            .put_u32(12, len)
    }

    /// `LM_RESTORE_STATE` — write blob bytes `[offset, offset + len)`.
    ///
    /// Args: `offset` u32 at byte 8, `len` u32 at byte 12. The chunk is
    /// taken from the DMA buffer.
    #[must_use]
    pub fn restore_state(vf_id: u16, offset: u32, len: u32) -> Self {
        Self::new(Opcode::LmRestoreState, vf_id)
            .put_u32(8, offset)
            .put_u32(12, len)
    }

    /// `LM_HOST_STATUS` — advisory host migration phase.
    ///
    /// Args: status byte at byte 8.
    #[must_use]
    pub fn host_status(vf_id: u16, status: HostStatus) -> Self {
        Self::new(Opcode::LmHostStatus, vf_id).put_u8(8, status as u8)
    }

    // ── Dirty-tracking commands ──────────────────────────────────────────

    /// `DIRTY_STATUS` — query capacity and bitmap geometry.
    ///
    /// Completion: capacity via [`Completion::dirty_capacity`].
    #[must_use]
    pub fn dirty_status(vf_id: u16) -> Self {
        Self::new(Opcode::DirtyStatus, vf_id)
    }

    /// `DIRTY_ENABLE` — register `num_regions` descriptors for tracking.
    ///
    /// Args: region count at byte 8. The descriptor list
    /// (`num_regions × `[`REGION_DESC_LEN`]` bytes) is taken from the DMA
    /// buffer.
    ///
    /// [`REGION_DESC_LEN`]: crate::lm::REGION_DESC_LEN
    #[must_use]
    pub fn dirty_enable(vf_id: u16, num_regions: u8) -> Self {
        Self::new(Opcode::DirtyEnable, vf_id).put_u8(8, num_regions)
    }

    /// `DIRTY_DISABLE` — stop tracking.
    #[must_use]
    pub fn dirty_disable(vf_id: u16) -> Self {
        Self::new(Opcode::DirtyDisable, vf_id)
    }

    /// `DIRTY_READ_SEQ` — non-destructive read of one bitmap page.
    ///
    /// Args: `seq` u32 at byte 8, logical bitmap `offset` u32 at byte 12,
    /// `len` u32 at byte 16. The page bits are delivered into the DMA
    /// buffer. Re-issuing with the same `seq` re-delivers the same page.
    #[must_use]
    pub fn dirty_read_seq(vf_id: u16, seq: u32, offset: u32, len: u32) -> Self {
        Self::new(Opcode::DirtyReadSeq, vf_id)
            .put_u32(8, seq)
            .put_u32(12, offset)
            .put_u32(16, len)
    }

    /// `DIRTY_ACK` — acknowledge page `seq`, allowing the device to clear
    /// its bits for the next tracking pass.
    ///
    /// Args: `seq` u32 at byte 8.
    #[must_use]
    pub fn dirty_ack(vf_id: u16, seq: u32) -> Self {
        Self::new(Opcode::DirtyAck, vf_id).put_u32(8, seq)
    }
}

/// One 16-byte completion block.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    bytes: [u8; COMP_LEN],
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("status", &self.status())
            .finish()
    }
}

impl Completion {
    /// Completion with status `Ok` and a zeroed payload.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            bytes: [0u8; COMP_LEN],
        }
    }

    /// Completion carrying a non-zero status code.
    #[must_use]
    pub fn error(status: u8) -> Self {
        let mut bytes = [0u8; COMP_LEN];
        bytes[0] = status;
        Self { bytes }
    }

    /// Completion from raw wire bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; COMP_LEN]) -> Self {
        Self { bytes }
    }

    /// Raw status byte; `0` is success.
    #[must_use]
    pub const fn status(&self) -> u8 {
        self.bytes[0]
    }

    /// State blob size (for `LM_STATE_SIZE`), bytes 8..16.
    #[must_use]
    pub fn blob_size(&self) -> u64 {
        let mut v = [0u8; 8];
        v.copy_from_slice(&self.bytes[8..16]);
        u64::from_le_bytes(v)
    }

    /// Dirty capacity `(max_regions, active_regions, chunk_len)` for
    /// `DIRTY_STATUS`: bytes 4, 5, and 8..12.
    #[must_use]
    pub fn dirty_capacity(&self) -> (u8, u8, u32) {
        let mut chunk = [0u8; 4];
        chunk.copy_from_slice(&self.bytes[8..12]);
        (self.bytes[4], self.bytes[5], u32::from_le_bytes(chunk))
    }

    /// Build a `LM_STATE_SIZE` completion (device-side model).
    #[must_use]
    pub fn with_blob_size(size: u64) -> Self {
        let mut bytes = [0u8; COMP_LEN];
        bytes[8..16].copy_from_slice(&size.to_le_bytes());
        Self { bytes }
    }

    /// Build a `DIRTY_STATUS` completion (device-side model).
    #[must_use]
    pub fn with_dirty_capacity(max_regions: u8, active_regions: u8, chunk_len: u32) -> Self {
        let mut bytes = [0u8; COMP_LEN];
        bytes[4] = max_regions;
        bytes[5] = active_regions;
        bytes[8..12].copy_from_slice(&chunk_len.to_le_bytes());
        Self { bytes }
    }

    /// Full wire representation.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; COMP_LEN] {
        &self.bytes
    }
}
