//! Scripted stub transport for driving the migration core without
//! hardware.
//!
//! The stub models just enough firmware behavior to exercise the
//! contracts: quiesce that answers `Again` a configurable number of
//! times, a state blob validated byte-for-byte at resume, a dirty
//! session whose bitmap pages are a deterministic function of the
//! sequence number, and per-opcode failure injection. It also records
//! submission order and detects any overlapping submission, which the
//! channel lock must make impossible.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kestrel_lm::{
    CommandTransport, DataXfer, MigrationError, Result, TransferConfig, VfDevice,
};
use kestrel_proto::{CmdStatus, CommandBlock, Completion, Opcode, REGION_DESC_LEN};

/// How an injected failure manifests.
pub enum FailMode {
    /// Swallow the command and report a timeout.
    Timeout,
    /// Complete with the given non-zero status.
    Status(u8),
}

/// Device-side model shared between the transport and the test body.
pub struct Firmware {
    pub blob: Vec<u8>,
    pub restored: Vec<u8>,
    pub covered: Vec<bool>,
    /// `Again` answers remaining before quiesce completes.
    pub quiesce_polls: u32,
    /// Value `quiesce_polls` is reloaded to on each `LM_SUSPEND`.
    pub quiesce_delay: u32,
    pub suspended: bool,
    pub dirty_enabled: bool,
    pub active_regions: u8,
    pub max_regions: u8,
    pub chunk_len: u32,
    pub registered: bool,
    pub last_host_status: Option<u8>,
    pub fail_next: HashMap<u8, FailMode>,
}

impl Firmware {
    pub fn new(blob_len: usize) -> Self {
        let blob: Vec<u8> = (0..blob_len).map(|i| (i % 251) as u8).collect();
        Self {
            restored: vec![0; blob.len()],
            covered: vec![false; blob.len()],
            blob,
            quiesce_polls: 0,
            quiesce_delay: 0,
            suspended: false,
            dirty_enabled: false,
            active_regions: 0,
            max_regions: 4,
            chunk_len: 8,
            registered: false,
            last_host_status: None,
            fail_next: HashMap::new(),
        }
    }

    /// Inject a failure for the next command with this opcode.
    pub fn fail(&mut self, op: Opcode, mode: FailMode) {
        self.fail_next.insert(op as u8, mode);
    }
}

/// Expected content of bitmap page `seq` at byte `i`.
pub fn bitmap_byte(seq: u32, i: usize) -> u8 {
    (seq as u8) ^ (i as u8) ^ 0x5A
}

/// Test-side view of the stub.
#[derive(Clone)]
pub struct StubHandle {
    pub fw: Arc<Mutex<Firmware>>,
    pub log: Arc<Mutex<Vec<u8>>>,
    pub overlap: Arc<AtomicBool>,
    pub not_ready: Arc<AtomicBool>,
}

impl StubHandle {
    pub fn opcodes(&self) -> Vec<Opcode> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|raw| Opcode::from_raw(*raw))
            .collect()
    }

    pub fn count(&self, op: Opcode) -> usize {
        self.opcodes().iter().filter(|o| **o == op).count()
    }

    pub fn fw(&self) -> std::sync::MutexGuard<'_, Firmware> {
        self.fw.lock().unwrap()
    }
}

pub struct StubTransport {
    fw: Arc<Mutex<Firmware>>,
    log: Arc<Mutex<Vec<u8>>>,
    in_flight: Arc<AtomicBool>,
    overlap: Arc<AtomicBool>,
    not_ready: Arc<AtomicBool>,
    /// Hold the wire busy for this long per command so overlap would show.
    submit_hold: Duration,
}

pub fn stub(blob_len: usize) -> (StubTransport, StubHandle) {
    let fw = Arc::new(Mutex::new(Firmware::new(blob_len)));
    let log = Arc::new(Mutex::new(Vec::new()));
    let overlap = Arc::new(AtomicBool::new(false));
    let not_ready = Arc::new(AtomicBool::new(false));
    let handle = StubHandle {
        fw: Arc::clone(&fw),
        log: Arc::clone(&log),
        overlap: Arc::clone(&overlap),
        not_ready: Arc::clone(&not_ready),
    };
    let transport = StubTransport {
        fw,
        log,
        in_flight: Arc::new(AtomicBool::new(false)),
        overlap,
        not_ready,
        submit_hold: Duration::from_micros(200),
    };
    (transport, handle)
}

/// A bound `VfDevice` over a fresh stub, with test-sized timeouts.
pub fn bound_vf(blob_len: usize) -> (VfDevice, StubHandle) {
    let (transport, handle) = stub(blob_len);
    let config = TransferConfig {
        cmd_timeout_ms: 250,
        suspend_timeout_ms: 500,
        suspend_poll_ms: 1,
        blob_chunk_len: 0,
    };
    let vf = VfDevice::new(Box::new(transport), 3, config).expect("bind stub VF");
    (vf, handle)
}

impl CommandTransport for StubTransport {
    fn ready(&self) -> bool {
        !self.not_ready.load(Ordering::SeqCst)
    }

    fn submit(
        &mut self,
        cmd: &CommandBlock,
        data: DataXfer<'_>,
        timeout: Duration,
    ) -> Result<Completion> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        std::thread::sleep(self.submit_hold);

        let result = self.process(cmd, data, timeout);

        self.in_flight.store(false, Ordering::SeqCst);
        result
    }
}

impl StubTransport {
    fn process(
        &mut self,
        cmd: &CommandBlock,
        data: DataXfer<'_>,
        timeout: Duration,
    ) -> Result<Completion> {
        self.log.lock().unwrap().push(cmd.opcode_raw());
        let mut fw = self.fw.lock().unwrap();

        if let Some(mode) = fw.fail_next.remove(&cmd.opcode_raw()) {
            match mode {
                FailMode::Timeout => {
                    return Err(MigrationError::Timeout {
                        duration_ms: timeout.as_millis() as u64,
                    })
                }
                FailMode::Status(code) => return Ok(Completion::error(code)),
            }
        }

        let op = cmd
            .opcode()
            .ok_or_else(|| MigrationError::invalid_argument("unknown opcode"))?;
        let comp = match op {
            Opcode::LmRegister => {
                fw.registered = true;
                Completion::ok()
            }
            Opcode::LmUnregister => {
                fw.registered = false;
                Completion::ok()
            }
            Opcode::LmSuspend => {
                fw.quiesce_polls = fw.quiesce_delay;
                Completion::ok()
            }
            Opcode::LmSuspendStatus => {
                if fw.quiesce_polls > 0 {
                    fw.quiesce_polls -= 1;
                    Completion::error(CmdStatus::Again as u8)
                } else {
                    fw.suspended = true;
                    Completion::ok()
                }
            }
            Opcode::LmResume => {
                let restore_started = fw.covered.iter().any(|c| *c);
                if restore_started {
                    let complete = fw.covered.iter().all(|c| *c);
                    if !complete || fw.restored != fw.blob {
                        return Ok(Completion::error(CmdStatus::BadState as u8));
                    }
                }
                fw.suspended = false;
                Completion::ok()
            }
            Opcode::LmStateSize => Completion::with_blob_size(fw.blob.len() as u64),
            Opcode::LmSaveState => {
                let offset = cmd.arg_u32(8) as usize;
                let len = cmd.arg_u32(12) as usize;
                let DataXfer::FromDevice(buf) = data else {
                    return Ok(Completion::error(CmdStatus::BadArg as u8));
                };
                if offset + len > fw.blob.len() || buf.len() != len {
                    return Ok(Completion::error(CmdStatus::BadArg as u8));
                }
                buf.copy_from_slice(&fw.blob[offset..offset + len]);
                Completion::ok()
            }
            Opcode::LmRestoreState => {
                let offset = cmd.arg_u32(8) as usize;
                let len = cmd.arg_u32(12) as usize;
                let DataXfer::ToDevice(buf) = data else {
                    return Ok(Completion::error(CmdStatus::BadArg as u8));
                };
                if offset + len > fw.restored.len() || buf.len() != len {
                    return Ok(Completion::error(CmdStatus::BadArg as u8));
                }
                fw.restored[offset..offset + len].copy_from_slice(buf);
                for c in &mut fw.covered[offset..offset + len] {
                    *c = true;
                }
                Completion::ok()
            }
            Opcode::LmHostStatus => {
                fw.last_host_status = Some(cmd.arg_u8(8));
                Completion::ok()
            }
            Opcode::DirtyStatus => {
                Completion::with_dirty_capacity(fw.max_regions, fw.active_regions, fw.chunk_len)
            }
            Opcode::DirtyEnable => {
                let n = cmd.arg_u8(8) as usize;
                let DataXfer::ToDevice(buf) = data else {
                    return Ok(Completion::error(CmdStatus::BadArg as u8));
                };
                if n == 0 || n > fw.max_regions as usize || buf.len() != n * REGION_DESC_LEN {
                    return Ok(Completion::error(CmdStatus::BadArg as u8));
                }
                fw.dirty_enabled = true;
                fw.active_regions = n as u8;
                Completion::ok()
            }
            Opcode::DirtyDisable => {
                fw.dirty_enabled = false;
                fw.active_regions = 0;
                Completion::ok()
            }
            Opcode::DirtyReadSeq => {
                let seq = cmd.arg_u32(8);
                let DataXfer::FromDevice(buf) = data else {
                    return Ok(Completion::error(CmdStatus::BadArg as u8));
                };
                if !fw.dirty_enabled {
                    return Ok(Completion::error(CmdStatus::BadState as u8));
                }
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = bitmap_byte(seq, i);
                }
                Completion::ok()
            }
            Opcode::DirtyAck => {
                if !fw.dirty_enabled {
                    return Ok(Completion::error(CmdStatus::BadState as u8));
                }
                Completion::ok()
            }
        };
        Ok(comp)
    }
}
