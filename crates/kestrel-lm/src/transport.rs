//! Command transport abstraction.
//!
//! The hardware side of the command interface — mailbox registers, DMA
//! engine, interrupt-vs-poll completion — is injected behind
//! [`CommandTransport`] so the driver core never touches registers directly
//! and tests can substitute a scripted device.

use std::time::Duration;

use kestrel_proto::{CommandBlock, Completion};

use crate::error::Result;

/// Bulk data accompanying one command.
///
/// The transport owns how the buffer becomes device-visible (IOMMU-mapped
/// DMA for real hardware, plain memory for stubs). Direction is from the
/// host's point of view.
#[derive(Debug)]
pub enum DataXfer<'a> {
    /// No bulk data.
    None,
    /// Device writes into this buffer (bitmap pages, saved state chunks).
    FromDevice(&'a mut [u8]),
    /// Device reads from this buffer (region lists, restored state chunks).
    ToDevice(&'a [u8]),
}

impl DataXfer<'_> {
    /// Buffer length in bytes; zero for [`DataXfer::None`].
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::FromDevice(buf) => buf.len(),
            Self::ToDevice(buf) => buf.len(),
        }
    }

    /// Whether the command carries no bulk data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One VF's command submission primitive.
///
/// Contract: [`submit`](Self::submit) blocks until the device produces the
/// command's single completion, or until `timeout` elapses — the caller
/// observes exactly one of: a completion (any status), or a definitive
/// error. Implementations never deliver partial results and never retry.
///
/// Serialization is *not* the transport's job; [`CommandChannel`] holds the
/// exclusive-submission lock above it.
///
/// [`CommandChannel`]: crate::channel::CommandChannel
pub trait CommandTransport: Send {
    /// Whether the device can currently accept a command. A device in
    /// transient reset reports `false` and the channel fails fast with
    /// [`MigrationError::Busy`](crate::MigrationError::Busy) instead of
    /// burning the command timeout.
    fn ready(&self) -> bool;

    /// Post one command and block for its completion.
    ///
    /// # Errors
    ///
    /// `Timeout` if no completion arrives within `timeout`; transport
    /// errors for MMIO/DMA failures.
    fn submit(
        &mut self,
        cmd: &CommandBlock,
        data: DataXfer<'_>,
        timeout: Duration,
    ) -> Result<Completion>;
}
