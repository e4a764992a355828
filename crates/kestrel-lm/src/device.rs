//! VF migration handle.
//!
//! One [`VfDevice`] per passthrough function, owning that function's
//! command channel, lifecycle machine, dirty tracker, and state transfer
//! buffer. The VFIO framework creates it at bind and drops it at unbind;
//! `Drop` is the cleanup safety net regardless of migration phase.
//!
//! The lifecycle driver and the dirty-drain loop may call in from two
//! threads concurrently; per-component locks keep each component
//! single-threaded internally while the channel lock serializes everything
//! at the wire.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use kestrel_proto::{DirtyRegion, HostStatus};

use crate::channel::CommandChannel;
use crate::config::TransferConfig;
use crate::dirty::{BitmapPage, DirtyCapacity, DirtyPageTracker};
use crate::error::{MigrationError, Result};
use crate::lifecycle::MigrationStateMachine;
use crate::state::{FailedTransition, MigrationState, StateCell};
use crate::transfer::StateTransferBuffer;
use crate::transport::CommandTransport;

/// Migration control surface for one SR-IOV virtual function.
#[derive(Debug)]
pub struct VfDevice {
    vf_id: u16,
    lifecycle: MigrationStateMachine,
    tracker: Mutex<DirtyPageTracker>,
    transfer: Mutex<StateTransferBuffer>,
    state: Arc<StateCell>,
}

impl VfDevice {
    /// Bind a migration handle over an injected transport and register
    /// the migration client with firmware.
    ///
    /// # Errors
    ///
    /// Fails if the registration command is rejected; no handle is
    /// created in that case.
    pub fn new(
        transport: Box<dyn CommandTransport>,
        vf_id: u16,
        config: TransferConfig,
    ) -> Result<Self> {
        let channel = Arc::new(CommandChannel::new(transport, vf_id, config.cmd_timeout()));
        let state = Arc::new(StateCell::new());

        let lifecycle =
            MigrationStateMachine::new(Arc::clone(&channel), Arc::clone(&state), config.clone());
        let tracker = Mutex::new(DirtyPageTracker::new(Arc::clone(&channel)));
        let transfer = Mutex::new(StateTransferBuffer::new(
            Arc::clone(&channel),
            Arc::clone(&state),
            config,
        ));

        lifecycle.register()?;
        tracing::info!(vf = vf_id, "migration handle bound");

        Ok(Self {
            vf_id,
            lifecycle,
            tracker,
            transfer,
            state,
        })
    }

    /// VF id this handle controls.
    #[must_use]
    pub const fn vf_id(&self) -> u16 {
        self.vf_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MigrationState {
        self.state.get()
    }

    /// The transition that drove the machine into `Error`, if any.
    #[must_use]
    pub fn failed_transition(&self) -> Option<FailedTransition> {
        self.state.failed_transition()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Suspend the VF (`Running → Stopping → Stopped`).
    ///
    /// # Errors
    ///
    /// See [`MigrationStateMachine::suspend`].
    pub fn suspend(&self) -> Result<()> {
        self.lifecycle.suspend()
    }

    /// Resume the VF (`Stopped → Resuming → Running`), validating any
    /// restored blob. Blob bookkeeping is discarded on success.
    ///
    /// # Errors
    ///
    /// See [`MigrationStateMachine::resume`].
    pub fn resume(&self) -> Result<()> {
        self.lifecycle.resume()?;
        self.transfer_lock().discard();
        Ok(())
    }

    /// Re-arm after an external device reset (`Error → Running`),
    /// dropping blob bookkeeping and the tracking session record.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the machine is in `Error`.
    pub fn reset(&self) -> Result<()> {
        self.lifecycle.reset()?;
        self.transfer_lock().discard();
        // The device reset killed any tracking session; drop the session
        // record, sending the disable best-effort.
        let mut tracker = self.tracker_lock();
        if tracker.is_enabled() {
            if let Err(err) = tracker.disable() {
                tracing::debug!(vf = self.vf_id, error = %err, "post-reset dirty disable failed");
            }
        }
        Ok(())
    }

    /// Forward the orchestrator's own migration phase to firmware.
    /// Advisory only; never fails.
    pub fn notify_host_status(&self, status: HostStatus) {
        self.lifecycle.notify_host_status(status);
    }

    // ── Dirty tracking ───────────────────────────────────────────────────

    /// Query dirty-tracking capacity.
    ///
    /// # Errors
    ///
    /// Channel errors propagate unmodified.
    pub fn query_capacity(&self) -> Result<DirtyCapacity> {
        self.tracker_lock().query_capacity()
    }

    /// Start dirty tracking over `regions`.
    ///
    /// # Errors
    ///
    /// See [`DirtyPageTracker::enable`].
    pub fn enable_dirty_tracking(&self, regions: &[DirtyRegion]) -> Result<()> {
        self.tracker_lock().enable(regions)
    }

    /// Stop dirty tracking. Idempotent.
    ///
    /// # Errors
    ///
    /// See [`DirtyPageTracker::disable`].
    pub fn disable_dirty_tracking(&self) -> Result<()> {
        self.tracker_lock().disable()
    }

    /// Fetch the next dirty bitmap page.
    ///
    /// # Errors
    ///
    /// See [`DirtyPageTracker::fetch_next_page`].
    pub fn fetch_next_page(&self, read_seq: bool) -> Result<BitmapPage> {
        self.tracker_lock().fetch_next_page(read_seq)
    }

    /// Acknowledge bitmap page `seq`.
    ///
    /// # Errors
    ///
    /// See [`DirtyPageTracker::acknowledge`].
    pub fn acknowledge(&self, seq: u32) -> Result<()> {
        self.tracker_lock().acknowledge(seq)
    }

    // ── State blob ───────────────────────────────────────────────────────

    /// Query the state blob size.
    ///
    /// # Errors
    ///
    /// See [`StateTransferBuffer::query_size`].
    pub fn query_size(&self) -> Result<u64> {
        self.transfer_lock().query_size()
    }

    /// Read a blob range during save.
    ///
    /// Rejected while dirty tracking is still enabled: stop-copy must not
    /// begin until the orchestrator has finished draining, and enforcing
    /// that here turns a silent-corruption hazard into a loud error.
    ///
    /// # Errors
    ///
    /// `InvalidState` if tracking is enabled; otherwise see
    /// [`StateTransferBuffer::read_state`].
    pub fn read_state(&self, offset: u64, length: usize) -> Result<Bytes> {
        if self.tracker_lock().is_enabled() {
            return Err(MigrationError::invalid_state(
                "state blob read while dirty tracking is enabled",
            ));
        }
        self.transfer_lock().read_state(offset, length)
    }

    /// Write a blob range during restore.
    ///
    /// # Errors
    ///
    /// See [`StateTransferBuffer::write_state`].
    pub fn write_state(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.transfer_lock().write_state(offset, data)
    }

    fn tracker_lock(&self) -> std::sync::MutexGuard<'_, DirtyPageTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transfer_lock(&self) -> std::sync::MutexGuard<'_, StateTransferBuffer> {
        self.transfer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for VfDevice {
    fn drop(&mut self) {
        // Safety net: release device-side tracking resources and withdraw
        // the client no matter what phase the migration died in.
        let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        if tracker.is_enabled() {
            if let Err(err) = tracker.disable() {
                tracing::warn!(vf = self.vf_id, error = %err, "teardown dirty disable failed");
            }
        }
        drop(tracker);

        if let Err(err) = self.lifecycle.unregister() {
            tracing::debug!(vf = self.vf_id, error = %err, "teardown unregister failed");
        }
    }
}
