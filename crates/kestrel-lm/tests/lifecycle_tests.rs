//! Lifecycle state machine tests against the scripted stub transport.

mod common;

use std::sync::Arc;

use common::{bound_vf, FailMode};
use kestrel_lm::{MigrationError, MigrationState};
use kestrel_proto::{CmdStatus, HostStatus, Opcode};

#[test]
fn suspend_reaches_stopped() {
    let (vf, handle) = bound_vf(256);

    assert_eq!(vf.state(), MigrationState::Running);
    vf.suspend().expect("suspend");
    assert_eq!(vf.state(), MigrationState::Stopped);

    let fw = handle.fw();
    assert!(fw.suspended);
    assert_eq!(fw.last_host_status, Some(HostStatus::Stopped as u8));
    drop(fw);

    assert_eq!(handle.count(Opcode::LmSuspend), 1);
    assert!(handle.count(Opcode::LmSuspendStatus) >= 1);
}

#[test]
fn suspend_polls_through_again_answers() {
    let (vf, handle) = bound_vf(256);
    handle.fw().quiesce_delay = 3;

    vf.suspend().expect("suspend");
    assert_eq!(vf.state(), MigrationState::Stopped);
    // Three `Again` answers plus the final success.
    assert_eq!(handle.count(Opcode::LmSuspendStatus), 4);
}

#[test]
fn illegal_transition_rejected_without_side_effects() {
    let (vf, handle) = bound_vf(256);
    let commands_before = handle.opcodes().len();

    let err = vf.resume().unwrap_err();
    assert!(matches!(err, MigrationError::InvalidState { .. }));
    assert_eq!(vf.state(), MigrationState::Running);
    // Nothing reached the wire.
    assert_eq!(handle.opcodes().len(), commands_before);
}

#[test]
fn timeout_during_stopping_latches_error() {
    let (vf, handle) = bound_vf(256);
    handle.fw().fail(Opcode::LmSuspendStatus, FailMode::Timeout);

    let err = vf.suspend().unwrap_err();
    assert!(matches!(err, MigrationError::Timeout { .. }));
    assert_eq!(vf.state(), MigrationState::Error);

    let failed = vf.failed_transition().expect("failure recorded");
    assert_eq!(failed.from, MigrationState::Stopping);
    assert_eq!(failed.to, MigrationState::Stopped);

    // Everything lifecycle-related is now rejected until an external reset.
    assert!(matches!(
        vf.resume().unwrap_err(),
        MigrationError::InvalidState { .. }
    ));
    assert!(matches!(
        vf.suspend().unwrap_err(),
        MigrationError::InvalidState { .. }
    ));

    vf.reset().expect("reset after external device reset");
    assert_eq!(vf.state(), MigrationState::Running);
    assert!(vf.failed_transition().is_none());
}

#[test]
fn quiesce_budget_exhaustion_is_fatal() {
    let (vf, handle) = bound_vf(256);
    // Firmware never finishes draining.
    handle.fw().quiesce_delay = u32::MAX;

    let err = vf.suspend().unwrap_err();
    assert!(matches!(err, MigrationError::Timeout { .. }));
    assert_eq!(vf.state(), MigrationState::Error);
}

#[test]
fn advisory_failure_does_not_invalidate_transition() {
    let (vf, handle) = bound_vf(256);
    handle.fw().fail(
        Opcode::LmHostStatus,
        FailMode::Status(CmdStatus::DmaFault as u8),
    );

    vf.suspend().expect("suspend despite advisory failure");
    assert_eq!(vf.state(), MigrationState::Stopped);
}

#[test]
fn busy_device_rejects_without_state_change() {
    let (vf, handle) = bound_vf(256);
    handle
        .not_ready
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = vf.query_capacity().unwrap_err();
    assert!(matches!(err, MigrationError::Busy));
    assert!(err.is_retryable());
    assert_eq!(vf.state(), MigrationState::Running);

    handle
        .not_ready
        .store(false, std::sync::atomic::Ordering::SeqCst);
    vf.query_capacity().expect("capacity after device ready");
}

#[test]
fn concurrent_contexts_never_interleave_on_the_wire() {
    let (vf, handle) = bound_vf(256);
    let vf = Arc::new(vf);

    // Lifecycle-style traffic and dirty-drain-style traffic from two
    // threads; the channel lock must serialize them.
    let drain = {
        let vf = Arc::clone(&vf);
        std::thread::spawn(move || {
            for _ in 0..50 {
                vf.query_capacity().expect("capacity");
            }
        })
    };
    for _ in 0..50 {
        vf.notify_host_status(HostStatus::Running);
    }
    drain.join().expect("drain thread");

    assert!(
        !handle.overlap.load(std::sync::atomic::Ordering::SeqCst),
        "two commands overlapped on the wire"
    );
    assert_eq!(handle.count(Opcode::DirtyStatus), 50);
    assert_eq!(handle.count(Opcode::LmHostStatus), 50);
}

#[test]
fn teardown_disables_tracking_and_unregisters() {
    let (vf, handle) = bound_vf(256);
    let region = kestrel_proto::DirtyRegion::new(0, 64 * 4096, 12);
    vf.enable_dirty_tracking(&[region]).expect("enable");

    drop(vf);

    assert_eq!(handle.count(Opcode::DirtyDisable), 1);
    assert_eq!(handle.count(Opcode::LmUnregister), 1);
    let fw = handle.fw();
    assert!(!fw.dirty_enabled);
    assert!(!fw.registered);
}

#[test]
fn plain_resume_round_trip() {
    let (vf, handle) = bound_vf(256);

    vf.suspend().expect("suspend");
    vf.resume().expect("resume");
    assert_eq!(vf.state(), MigrationState::Running);

    let fw = handle.fw();
    assert!(!fw.suspended);
    assert_eq!(fw.last_host_status, Some(HostStatus::Running as u8));
}
