//! BAR0 mailbox register map for the migration command processor.
//!
//! The VF exposes a single mailbox in BAR0: the host writes one command
//! block into the command window, programs the DMA window if the command
//! carries bulk data, rings the doorbell, and polls the status register for
//! `COMP_VALID`. The completion window then holds the 16-byte completion
//! until the host clears `COMP_VALID` (write-1-to-clear).
//!
//! Registers are 32-bit; the command and completion windows are written and
//! read as aligned 32-bit words.

/// Command window — 64 bytes, written as sixteen u32 words.
pub const MBOX_CMD: usize = 0x0000;

/// Completion window — 16 bytes, read as four u32 words.
pub const MBOX_COMP: usize = 0x0040;

/// Doorbell — write [`doorbell::RING`] to post the command window.
pub const MBOX_DOORBELL: usize = 0x0060;

/// Mailbox status — see [`status`]. `COMP_VALID` is write-1-to-clear.
pub const MBOX_STATUS: usize = 0x0064;

/// DMA buffer address, low 32 bits (device-visible IOVA).
pub const MBOX_DATA_LO: usize = 0x0068;

/// DMA buffer address, high 32 bits.
pub const MBOX_DATA_HI: usize = 0x006C;

/// DMA buffer length in bytes; zero when the command carries no bulk data.
pub const MBOX_DATA_LEN: usize = 0x0070;

/// Number of bytes of BAR0 the mailbox occupies.
pub const MBOX_SPAN: usize = 0x0080;

/// Mailbox status register bits.
pub mod status {
    /// Command processor ready to accept a command.
    pub const READY: u32 = 1 << 0;
    /// A command is being executed.
    pub const CMD_ACTIVE: u32 = 1 << 1;
    /// Completion window holds a valid completion (write 1 to clear).
    pub const COMP_VALID: u32 = 1 << 2;
    /// Device in transient reset; commands will not be accepted.
    pub const RESET: u32 = 1 << 3;
}

/// Doorbell register bits.
pub mod doorbell {
    /// Post the command currently in the command window.
    pub const RING: u32 = 1 << 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_do_not_overlap() {
        assert!(MBOX_CMD + crate::CMD_LEN <= MBOX_COMP);
        assert!(MBOX_COMP + crate::COMP_LEN <= MBOX_DOORBELL);
        assert!(MBOX_DATA_LEN + 4 <= MBOX_SPAN);
    }
}
