//! Firmware completion status codes.

/// Status byte returned in every completion.
///
/// `Ok` and `Again` are the only non-fatal codes: `Again` is returned by
/// `LM_SUSPEND_STATUS` while the VF is still draining and the caller is
/// expected to poll again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdStatus {
    /// Command completed.
    Ok = 0,
    /// Operation still in progress; poll again.
    Again = 1,
    /// Opcode unknown to this firmware.
    BadOpcode = 2,
    /// Argument block rejected.
    BadArg = 3,
    /// Device out of resources for the request.
    NoMem = 4,
    /// DMA fault while reaching the host buffer.
    DmaFault = 5,
    /// Command processor busy with an internal operation.
    Busy = 6,
    /// Operation not supported by this VF.
    NotSupported = 7,
    /// Command illegal in the device's current migration phase, or restored
    /// state failed validation at resume.
    BadState = 8,
}

impl CmdStatus {
    /// Decode a raw status byte; unknown codes return `None`.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Ok,
            1 => Self::Again,
            2 => Self::BadOpcode,
            3 => Self::BadArg,
            4 => Self::NoMem,
            5 => Self::DmaFault,
            6 => Self::Busy,
            7 => Self::NotSupported,
            8 => Self::BadState,
            _ => return None,
        })
    }

    /// Short name for log lines.
    #[must_use]
    pub const fn name(raw: u8) -> &'static str {
        match Self::from_raw(raw) {
            Some(Self::Ok) => "ok",
            Some(Self::Again) => "again",
            Some(Self::BadOpcode) => "bad-opcode",
            Some(Self::BadArg) => "bad-arg",
            Some(Self::NoMem) => "no-mem",
            Some(Self::DmaFault) => "dma-fault",
            Some(Self::Busy) => "busy",
            Some(Self::NotSupported) => "not-supported",
            Some(Self::BadState) => "bad-state",
            None => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for raw in 0..=8u8 {
            let status = CmdStatus::from_raw(raw).unwrap();
            assert_eq!(status as u8, raw);
        }
        assert_eq!(CmdStatus::from_raw(200), None);
    }

    #[test]
    fn names() {
        assert_eq!(CmdStatus::name(0), "ok");
        assert_eq!(CmdStatus::name(8), "bad-state");
        assert_eq!(CmdStatus::name(0x7F), "unknown");
    }
}
