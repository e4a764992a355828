//! Migration lifecycle state.
//!
//! The state value and its transition table live here; the operations that
//! drive transitions live in [`lifecycle`](crate::lifecycle) and
//! [`transfer`](crate::transfer). A transition that fails midway latches
//! [`MigrationState::Error`] together with a record of which transition was
//! being attempted — the machine is never left in an undefined intermediate
//! state.

use std::sync::{Mutex, PoisonError};

use crate::error::{MigrationError, Result};

/// Lifecycle state of one passthrough VF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// VF running normally; initial state.
    Running,
    /// Quiesce requested, drain in progress.
    Stopping,
    /// VF quiesced.
    Stopped,
    /// State blob size being queried.
    SavingStatus,
    /// State blob transfer in progress.
    Saving,
    /// Restore/resume in progress.
    Resuming,
    /// A transition failed; terminal until an external reset.
    Error,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::SavingStatus => "saving-status",
            Self::Saving => "saving",
            Self::Resuming => "resuming",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

impl MigrationState {
    /// Whether `self → next` appears in the transition table.
    ///
    /// `Error` is reachable from every state but only left via
    /// [`StateCell::reset`].
    #[must_use]
    pub const fn allows(self, next: Self) -> bool {
        if matches!(next, Self::Error) {
            return true;
        }
        matches!(
            (self, next),
            (Self::Running, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
                | (Self::Stopped, Self::SavingStatus)
                | (Self::SavingStatus, Self::Saving)
                | (Self::Saving, Self::Stopped)
                | (Self::Stopped, Self::Resuming)
                | (Self::Resuming, Self::Running)
        )
    }
}

/// The transition that drove the machine into `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedTransition {
    /// State the machine was leaving.
    pub from: MigrationState,
    /// State the machine was trying to reach.
    pub to: MigrationState,
}

#[derive(Debug)]
struct Inner {
    state: MigrationState,
    failed: Option<FailedTransition>,
}

/// Mutex-guarded state value shared by the lifecycle and transfer paths.
///
/// All reads and writes go through one lock, so transitions are atomic
/// with respect to concurrent readers: an observer sees the state of the
/// last completed step, never a torn intermediate.
#[derive(Debug)]
pub struct StateCell {
    inner: Mutex<Inner>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    /// New cell in the initial `Running` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: MigrationState::Running,
                failed: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> MigrationState {
        self.lock().state
    }

    /// The transition that failed, if the machine is in `Error`.
    #[must_use]
    pub fn failed_transition(&self) -> Option<FailedTransition> {
        self.lock().failed
    }

    /// Atomically move `from → to`, validating both the current state and
    /// the transition table.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the machine is not in `from` or the table does
    /// not allow the step. The state is untouched on error.
    pub fn advance(&self, from: MigrationState, to: MigrationState) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != from {
            return Err(MigrationError::invalid_state(format!(
                "cannot enter {to} from {}, expected {from}",
                inner.state
            )));
        }
        if !from.allows(to) {
            return Err(MigrationError::invalid_state(format!(
                "transition {from} -> {to} not in table"
            )));
        }
        tracing::debug!(%from, %to, "migration state transition");
        inner.state = to;
        Ok(())
    }

    /// Like [`advance`](Self::advance), but a no-op when already in `to`.
    /// Used by operations that are legal both at the start of a transition
    /// and while it is in progress (chunked transfers).
    ///
    /// # Errors
    ///
    /// `InvalidState` as for `advance`.
    pub fn ensure(&self, from: MigrationState, to: MigrationState) -> Result<()> {
        {
            let inner = self.lock();
            if inner.state == to {
                return Ok(());
            }
        }
        self.advance(from, to)
    }

    /// Require the current state to be one of `wanted`.
    ///
    /// # Errors
    ///
    /// `InvalidState` naming `operation` and the offending state.
    pub fn require(&self, wanted: &[MigrationState], operation: &str) -> Result<MigrationState> {
        let state = self.lock().state;
        if wanted.contains(&state) {
            Ok(state)
        } else {
            Err(MigrationError::invalid_state(format!(
                "{operation} not permitted in state {state}"
            )))
        }
    }

    /// Latch `Error`, recording the transition that failed. Idempotent;
    /// the first failure record wins.
    pub fn fail(&self, from: MigrationState, to: MigrationState) {
        let mut inner = self.lock();
        tracing::error!(%from, %to, previous = %inner.state, "migration transition failed");
        inner.state = MigrationState::Error;
        if inner.failed.is_none() {
            inner.failed = Some(FailedTransition { from, to });
        }
    }

    /// Leave `Error` after an external device reset, returning to
    /// `Running` and clearing the failure record.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the machine is not in `Error`.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != MigrationState::Error {
            return Err(MigrationError::invalid_state(format!(
                "reset only valid in error state, currently {}",
                inner.state
            )));
        }
        tracing::info!("migration state reset to running");
        inner.state = MigrationState::Running;
        inner.failed = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [MigrationState; 7] = [
        MigrationState::Running,
        MigrationState::Stopping,
        MigrationState::Stopped,
        MigrationState::SavingStatus,
        MigrationState::Saving,
        MigrationState::Resuming,
        MigrationState::Error,
    ];

    #[test]
    fn table_matches_lifecycle() {
        use MigrationState as S;
        let legal = [
            (S::Running, S::Stopping),
            (S::Stopping, S::Stopped),
            (S::Stopped, S::SavingStatus),
            (S::SavingStatus, S::Saving),
            (S::Saving, S::Stopped),
            (S::Stopped, S::Resuming),
            (S::Resuming, S::Running),
        ];
        for from in ALL {
            for to in ALL {
                let expected = to == S::Error || legal.contains(&(from, to));
                assert_eq!(from.allows(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn advance_checks_current_state() {
        let cell = StateCell::new();
        let err = cell
            .advance(MigrationState::Stopped, MigrationState::Resuming)
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidState { .. }));
        assert_eq!(cell.get(), MigrationState::Running);
    }

    #[test]
    fn ensure_is_reentrant() {
        let cell = StateCell::new();
        cell.advance(MigrationState::Running, MigrationState::Stopping)
            .unwrap();
        cell.advance(MigrationState::Stopping, MigrationState::Stopped)
            .unwrap();
        cell.ensure(MigrationState::Stopped, MigrationState::Resuming)
            .unwrap();
        cell.ensure(MigrationState::Stopped, MigrationState::Resuming)
            .unwrap();
        assert_eq!(cell.get(), MigrationState::Resuming);
    }

    #[test]
    fn fail_latches_first_record() {
        let cell = StateCell::new();
        cell.fail(MigrationState::Running, MigrationState::Stopping);
        cell.fail(MigrationState::Stopped, MigrationState::Resuming);
        assert_eq!(cell.get(), MigrationState::Error);
        let failed = cell.failed_transition().unwrap();
        assert_eq!(failed.from, MigrationState::Running);
        assert_eq!(failed.to, MigrationState::Stopping);
    }

    #[test]
    fn reset_only_from_error() {
        let cell = StateCell::new();
        assert!(cell.reset().is_err());
        cell.fail(MigrationState::Running, MigrationState::Stopping);
        cell.reset().unwrap();
        assert_eq!(cell.get(), MigrationState::Running);
        assert!(cell.failed_transition().is_none());
    }
}
