//! Runtime VF discovery.
//!
//! Scans PCIe sysfs for migration-capable Kestrel virtual functions. No
//! hardcoded device lists — everything is resolved from
//! `/sys/bus/pci/devices` at call time.

use std::path::{Path, PathBuf};

use kestrel_proto::pcie::{KESTREL_VENDOR_ID, LM_CAPABLE_DEVICE_IDS};

use crate::error::{MigrationError, Result};

/// One discovered migration-capable VF.
#[derive(Debug, Clone)]
pub struct VfInfo {
    /// PCIe address of the VF (e.g. `0000:a1:00.2`).
    pub pcie_address: String,
    /// PCIe address of the parent physical function.
    pub physfn: Option<String>,
    /// Index of this VF under its parent (`virtfnN`), when resolvable.
    pub vf_index: Option<u16>,
    /// IOMMU group number, when the IOMMU is enabled.
    pub iommu_group: Option<u32>,
}

/// Discovers and lists migration-capable VFs.
#[derive(Debug)]
pub struct VfManager {
    vfs: Vec<VfInfo>,
}

impl VfManager {
    /// Scan the system for Kestrel VFs.
    ///
    /// # Errors
    ///
    /// `NoVfsFound` when the scan completes without a match; `Io` when
    /// the sysfs device directory cannot be read at all.
    pub fn discover() -> Result<Self> {
        Self::discover_in(Path::new("/sys/bus/pci/devices"))
    }

    /// Scan a specific sysfs device directory (separated out for tests).
    ///
    /// # Errors
    ///
    /// As for [`discover`](Self::discover).
    pub fn discover_in(devices_dir: &Path) -> Result<Self> {
        let mut vfs = Vec::new();

        for entry in std::fs::read_dir(devices_dir)?.flatten() {
            let path = entry.path();
            let Some(vendor) = read_hex_u16(&path.join("vendor")) else {
                continue;
            };
            let Some(device) = read_hex_u16(&path.join("device")) else {
                continue;
            };
            if vendor != KESTREL_VENDOR_ID || !LM_CAPABLE_DEVICE_IDS.contains(&device) {
                continue;
            }

            let pcie_address = entry.file_name().to_string_lossy().to_string();
            let physfn = read_link_name(&path.join("physfn"));
            let vf_index = physfn
                .as_deref()
                .and_then(|pf| find_vf_index(devices_dir, pf, &pcie_address));
            let iommu_group =
                read_link_name(&path.join("iommu_group")).and_then(|n| n.parse().ok());

            tracing::debug!(
                pcie_address,
                ?physfn,
                ?vf_index,
                ?iommu_group,
                "found migration-capable VF"
            );
            vfs.push(VfInfo {
                pcie_address,
                physfn,
                vf_index,
                iommu_group,
            });
        }

        if vfs.is_empty() {
            tracing::warn!("no migration-capable VFs found");
            return Err(MigrationError::NoVfsFound);
        }

        vfs.sort_by(|a, b| a.pcie_address.cmp(&b.pcie_address));
        tracing::info!(count = vfs.len(), "discovered migration-capable VFs");
        Ok(Self { vfs })
    }

    /// All discovered VFs, ordered by PCIe address.
    #[must_use]
    pub fn vfs(&self) -> &[VfInfo] {
        &self.vfs
    }

    /// Look up one VF by PCIe address.
    #[must_use]
    pub fn find(&self, pcie_address: &str) -> Option<&VfInfo> {
        self.vfs.iter().find(|v| v.pcie_address == pcie_address)
    }
}

fn read_hex_u16(path: &Path) -> Option<u16> {
    let content = std::fs::read_to_string(path).ok()?;
    u16::from_str_radix(content.trim().trim_start_matches("0x"), 16).ok()
}

fn read_link_name(path: &Path) -> Option<String> {
    let link = std::fs::read_link(path).ok()?;
    Some(link.file_name()?.to_string_lossy().to_string())
}

/// Resolve which `virtfnN` link of the parent PF points at `vf_addr`.
fn find_vf_index(devices_dir: &Path, physfn: &str, vf_addr: &str) -> Option<u16> {
    let pf_dir: PathBuf = devices_dir.join(physfn);
    for n in 0..256u16 {
        let link = pf_dir.join(format!("virtfn{n}"));
        match std::fs::read_link(&link) {
            Ok(target) => {
                if target.file_name().is_some_and(|f| f.to_string_lossy() == vf_addr) {
                    return Some(n);
                }
            }
            Err(_) => break,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_without_hardware() {
        // On machines without a Kestrel NIC the scan must fail cleanly,
        // not panic.
        match VfManager::discover() {
            Ok(mgr) => {
                for vf in mgr.vfs() {
                    println!("VF {} (group {:?})", vf.pcie_address, vf.iommu_group);
                }
            }
            Err(MigrationError::NoVfsFound | MigrationError::Io { .. }) => {}
            Err(e) => panic!("unexpected discovery error: {e}"),
        }
    }
}
