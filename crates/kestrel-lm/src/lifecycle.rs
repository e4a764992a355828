//! Lifecycle operations: register/unregister, suspend, resume, reset, and
//! the host-status advisory.
//!
//! Every operation maps to one or more command-channel exchanges. Retry
//! policy lives here, not in the channel: the suspend path polls
//! `LM_SUSPEND_STATUS` while firmware answers `Again`, and decides when a
//! timeout is fatal.

use std::sync::Arc;
use std::time::Instant;

use kestrel_proto::{CmdStatus, CommandBlock, HostStatus};

use crate::channel::CommandChannel;
use crate::config::TransferConfig;
use crate::error::{MigrationError, Result};
use crate::state::{MigrationState, StateCell};
use crate::transport::DataXfer;

/// Drives the migration lifecycle of one VF.
#[derive(Debug)]
pub struct MigrationStateMachine {
    channel: Arc<CommandChannel>,
    state: Arc<StateCell>,
    config: TransferConfig,
}

impl MigrationStateMachine {
    /// Build over a shared channel and state cell.
    #[must_use]
    pub fn new(
        channel: Arc<CommandChannel>,
        state: Arc<StateCell>,
        config: TransferConfig,
    ) -> Self {
        Self {
            channel,
            state,
            config,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MigrationState {
        self.state.get()
    }

    /// Announce the migration client to firmware. Issued once per handle,
    /// before any other command.
    ///
    /// # Errors
    ///
    /// Channel errors propagate unmodified; no state transition is
    /// involved.
    pub fn register(&self) -> Result<()> {
        self.channel
            .submit(&CommandBlock::register(self.channel.vf_id()), DataXfer::None)?;
        tracing::info!(vf = self.channel.vf_id(), "migration client registered");
        Ok(())
    }

    /// Withdraw the migration client. Best-effort counterpart of
    /// [`register`](Self::register), issued at teardown.
    ///
    /// # Errors
    ///
    /// Channel errors propagate unmodified.
    pub fn unregister(&self) -> Result<()> {
        self.channel.submit(
            &CommandBlock::unregister(self.channel.vf_id()),
            DataXfer::None,
        )?;
        tracing::info!(vf = self.channel.vf_id(), "migration client unregistered");
        Ok(())
    }

    /// Suspend the VF: `Running → Stopping → Stopped`.
    ///
    /// Posts the quiesce request, then polls `LM_SUSPEND_STATUS` until
    /// firmware stops answering `Again` or the suspend budget elapses.
    /// Dirty tracking, if enabled, keeps running independently.
    ///
    /// # Errors
    ///
    /// Any channel failure (or an exhausted poll budget, surfaced as
    /// `Timeout`) latches `Error`; the machine records the failed
    /// transition and makes no further progress.
    pub fn suspend(&self) -> Result<()> {
        self.state
            .advance(MigrationState::Running, MigrationState::Stopping)?;

        if let Err(err) = self.quiesce() {
            self.state
                .fail(MigrationState::Stopping, MigrationState::Stopped);
            return Err(err);
        }

        self.state
            .advance(MigrationState::Stopping, MigrationState::Stopped)?;
        self.notify_host_status(HostStatus::Stopped);
        Ok(())
    }

    fn quiesce(&self) -> Result<()> {
        let vf = self.channel.vf_id();
        self.channel
            .submit(&CommandBlock::suspend(vf), DataXfer::None)?;

        let deadline = Instant::now() + self.config.suspend_timeout();
        loop {
            match self
                .channel
                .submit(&CommandBlock::suspend_status(vf), DataXfer::None)
            {
                Ok(_) => {
                    tracing::info!(vf, "VF quiesced");
                    return Ok(());
                }
                Err(MigrationError::Device { code }) if code == CmdStatus::Again as u8 => {
                    if Instant::now() >= deadline {
                        tracing::error!(vf, "quiesce did not complete within budget");
                        return Err(MigrationError::Timeout {
                            duration_ms: self.config.suspend_timeout_ms,
                        });
                    }
                    std::thread::sleep(std::time::Duration::from_millis(
                        self.config.suspend_poll_ms,
                    ));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Resume the VF: `Stopped → Resuming → Running`.
    ///
    /// If a restore preceded this call the machine is already in
    /// `Resuming` (the first [`write_state`] chunk moved it there) and the
    /// device validates the full blob now; otherwise this is a plain
    /// unpause.
    ///
    /// # Errors
    ///
    /// A rejected resume — including blob validation failure — latches
    /// `Error`.
    ///
    /// [`write_state`]: crate::transfer::StateTransferBuffer::write_state
    pub fn resume(&self) -> Result<()> {
        self.state
            .ensure(MigrationState::Stopped, MigrationState::Resuming)?;

        let vf = self.channel.vf_id();
        if let Err(err) = self
            .channel
            .submit(&CommandBlock::resume(vf), DataXfer::None)
        {
            self.state
                .fail(MigrationState::Resuming, MigrationState::Running);
            return Err(err);
        }

        self.state
            .advance(MigrationState::Resuming, MigrationState::Running)?;
        self.notify_host_status(HostStatus::Running);
        tracing::info!(vf, "VF resumed");
        Ok(())
    }

    /// Recover from `Error` after the orchestrator has fully reset the
    /// device: `Error → Running`.
    ///
    /// The reset itself is outside this component's authority; this call
    /// only re-arms the state machine.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the machine is in `Error`.
    pub fn reset(&self) -> Result<()> {
        self.state.reset()?;
        self.notify_host_status(HostStatus::Running);
        Ok(())
    }

    /// Send the host-phase advisory to firmware.
    ///
    /// Best-effort by contract: failure is logged and swallowed, since
    /// the advisory never invalidates a completed transition.
    pub fn notify_host_status(&self, status: HostStatus) {
        let vf = self.channel.vf_id();
        match self
            .channel
            .submit(&CommandBlock::host_status(vf, status), DataXfer::None)
        {
            Ok(_) => tracing::debug!(vf, ?status, "host status advisory sent"),
            Err(err) => tracing::warn!(vf, ?status, error = %err, "host status advisory failed"),
        }
    }
}
