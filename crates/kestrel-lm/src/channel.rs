//! Serialized command/response channel.
//!
//! One `CommandChannel` per VF. The transport mutex is the single
//! synchronization point of the whole core: the lifecycle driver and the
//! dirty-drain loop run on different threads and are serialized here, one
//! command on the wire at a time.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use kestrel_proto::{CmdStatus, CommandBlock, Completion};

use crate::error::{MigrationError, Result};
use crate::transport::{CommandTransport, DataXfer};

/// Blocking request/response channel to one VF's command processor.
pub struct CommandChannel {
    vf_id: u16,
    timeout: Duration,
    transport: Mutex<Box<dyn CommandTransport>>,
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("vf_id", &self.vf_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CommandChannel {
    /// Wrap a transport with the given per-command deadline.
    #[must_use]
    pub fn new(transport: Box<dyn CommandTransport>, vf_id: u16, timeout: Duration) -> Self {
        Self {
            vf_id,
            timeout,
            transport: Mutex::new(transport),
        }
    }

    /// VF id this channel serves.
    #[must_use]
    pub const fn vf_id(&self) -> u16 {
        self.vf_id
    }

    /// Submit one command and block for its completion.
    ///
    /// Holds the exclusive channel lock for the full exchange, so at most
    /// one command is in flight per function regardless of how many
    /// threads call in. Never retries; the caller owns retry policy.
    ///
    /// # Errors
    ///
    /// - `Busy` if the device is in a transient reset state (checked
    ///   before posting).
    /// - `Timeout` if no completion arrives within the deadline.
    /// - `Device` if firmware rejected the command; the completion status
    ///   code is preserved.
    pub fn submit(&self, cmd: &CommandBlock, data: DataXfer<'_>) -> Result<Completion> {
        let mut transport = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !transport.ready() {
            tracing::warn!(
                vf = self.vf_id,
                opcode = ?cmd.opcode(),
                "device not ready, rejecting command"
            );
            return Err(MigrationError::Busy);
        }

        match transport.submit(cmd, data, self.timeout) {
            Ok(comp) if comp.status() != CmdStatus::Ok as u8 => {
                let code = comp.status();
                // `Again` is an expected answer to status polls, not a fault.
                if code == CmdStatus::Again as u8 {
                    tracing::trace!(vf = self.vf_id, opcode = ?cmd.opcode(), "device answered again");
                } else {
                    tracing::warn!(
                        vf = self.vf_id,
                        opcode = ?cmd.opcode(),
                        status = CmdStatus::name(code),
                        "device rejected command"
                    );
                }
                Err(MigrationError::Device { code })
            }
            Ok(comp) => Ok(comp),
            Err(err) => {
                tracing::warn!(
                    vf = self.vf_id,
                    opcode = ?cmd.opcode(),
                    error = %err,
                    "command failed"
                );
                Err(err)
            }
        }
    }
}
