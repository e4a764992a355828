//! PCIe identifiers for migration-capable Kestrel functions.

/// Kestrel Networks vendor ID.
pub const KESTREL_VENDOR_ID: u16 = 0x1F52;

/// Device IDs for the Kestrel SmartNIC family.
pub mod device_id {
    /// K2100 physical function (`lspci: 1f52:4010`).
    pub const K2100_PF: u16 = 0x4010;
    /// K2100 SR-IOV virtual function — the migratable function.
    pub const K2100_VF: u16 = 0x4011;
}

/// Device IDs whose VFs support the live-migration command set.
pub const LM_CAPABLE_DEVICE_IDS: &[u16] = &[device_id::K2100_VF];

/// Format a `vendor:device` string for use with `lspci -d`.
#[must_use]
pub fn lspci_filter() -> String {
    format!("{:04x}:{:04x}", KESTREL_VENDOR_ID, device_id::K2100_VF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vf_is_lm_capable() {
        assert!(LM_CAPABLE_DEVICE_IDS.contains(&device_id::K2100_VF));
        assert!(!LM_CAPABLE_DEVICE_IDS.contains(&device_id::K2100_PF));
        assert_eq!(lspci_filter(), "1f52:4011");
    }
}
