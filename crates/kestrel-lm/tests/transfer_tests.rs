//! State blob save/restore tests against the scripted stub transport.

mod common;

use common::bound_vf;
use kestrel_lm::{MigrationError, MigrationState};
use kestrel_proto::{CmdStatus, DirtyRegion, Opcode, DEFAULT_PAGE_SHIFT};

#[test]
fn query_size_requires_stopped() {
    let (vf, _handle) = bound_vf(1000);
    let err = vf.query_size().unwrap_err();
    assert!(matches!(err, MigrationError::InvalidState { .. }));
    assert_eq!(vf.state(), MigrationState::Running);
}

#[test]
fn read_requires_size_query() {
    let (vf, _handle) = bound_vf(1000);
    vf.suspend().expect("suspend");
    let err = vf.read_state(0, 16).unwrap_err();
    assert!(matches!(err, MigrationError::InvalidState { .. }));
}

#[test]
fn save_pass_walks_the_state_table() {
    let (vf, _handle) = bound_vf(1000);
    vf.suspend().expect("suspend");

    let size = vf.query_size().expect("size");
    assert_eq!(size, 1000);
    assert_eq!(vf.state(), MigrationState::SavingStatus);

    let head = vf.read_state(0, 400).expect("head");
    assert_eq!(vf.state(), MigrationState::Saving);

    let mid = vf.read_state(400, 400).expect("mid");
    let tail = vf.read_state(800, 200).expect("tail");
    // Watermark hit the queried size: the save pass is closed.
    assert_eq!(vf.state(), MigrationState::Stopped);

    let mut blob = Vec::new();
    blob.extend_from_slice(&head);
    blob.extend_from_slice(&mid);
    blob.extend_from_slice(&tail);
    let expected: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
    assert_eq!(blob, expected);
}

#[test]
fn read_past_size_is_out_of_range() {
    let (vf, _handle) = bound_vf(1000);
    vf.suspend().expect("suspend");
    vf.query_size().expect("size");

    let err = vf.read_state(990, 20).unwrap_err();
    assert!(matches!(
        err,
        MigrationError::OutOfRange {
            offset: 990,
            length: 20,
            size: 1000
        }
    ));
    // Misuse is fatal to the call, not to the machine.
    assert_eq!(vf.state(), MigrationState::SavingStatus);
}

#[test]
fn blob_round_trip_with_shuffled_write_order() {
    let (vf, handle) = bound_vf(1000);
    vf.suspend().expect("suspend");
    let size = vf.query_size().expect("size") as usize;
    let blob = vf.read_state(0, size).expect("read all");
    assert_eq!(vf.state(), MigrationState::Stopped);

    // Write the chunks back in arbitrary order; the device only
    // validates the reassembled blob at resume.
    vf.write_state(400, &blob[400..800]).expect("middle chunk");
    assert_eq!(vf.state(), MigrationState::Resuming);
    vf.write_state(800, &blob[800..]).expect("tail chunk");
    vf.write_state(0, &blob[..400]).expect("head chunk");

    vf.resume().expect("resume validates blob");
    assert_eq!(vf.state(), MigrationState::Running);

    let fw = handle.fw();
    assert!(!fw.suspended);
    assert_eq!(fw.restored, fw.blob);
}

#[test]
fn corrupted_restore_is_rejected_at_resume() {
    let (vf, _handle) = bound_vf(1000);
    vf.suspend().expect("suspend");
    let size = vf.query_size().expect("size") as usize;
    let blob = vf.read_state(0, size).expect("read all");

    let mut corrupted = blob.to_vec();
    corrupted[123] ^= 0xFF;
    vf.write_state(0, &corrupted).expect("write back");

    let err = vf.resume().unwrap_err();
    assert_eq!(err.device_code(), Some(CmdStatus::BadState as u8));
    assert_eq!(vf.state(), MigrationState::Error);

    let failed = vf.failed_transition().expect("failure recorded");
    assert_eq!(failed.from, MigrationState::Resuming);
    assert_eq!(failed.to, MigrationState::Running);
}

#[test]
fn large_blob_reads_are_chunked() {
    let (vf, handle) = bound_vf(10_000);
    vf.suspend().expect("suspend");
    let size = vf.query_size().expect("size") as usize;

    vf.read_state(0, size).expect("read all");
    // 10_000 bytes at the 4096-byte tier: three save commands.
    assert_eq!(handle.count(Opcode::LmSaveState), 3);
}

#[test]
fn write_requires_stopped_or_resuming() {
    let (vf, _handle) = bound_vf(1000);
    let err = vf.write_state(0, &[0u8; 16]).unwrap_err();
    assert!(matches!(err, MigrationError::InvalidState { .. }));
}

#[test]
fn read_rejected_while_dirty_tracking_enabled() {
    let (vf, _handle) = bound_vf(1000);
    let region = DirtyRegion::new(0, 64 * 4096, DEFAULT_PAGE_SHIFT);
    vf.enable_dirty_tracking(&[region]).expect("enable");

    vf.suspend().expect("suspend");
    vf.query_size().expect("size");

    // Stop-copy must not start until the drain loop has been stopped.
    let err = vf.read_state(0, 16).unwrap_err();
    assert!(matches!(err, MigrationError::InvalidState { .. }));

    vf.disable_dirty_tracking().expect("disable");
    vf.read_state(0, 16).expect("read after drain stops");
}
