//! `kestrel` — command-line interface for Kestrel VF live migration.
//!
//! ```text
//! USAGE:
//!   kestrel enumerate                     List migration-capable VFs
//!   kestrel status <pcie-addr>            Dirty-tracking capacity and blob size probe
//!   kestrel suspend <pcie-addr>           Quiesce a VF
//!   kestrel resume <pcie-addr>            Resume a VF
//!   kestrel save <pcie-addr> <file>       Suspend and save device state to a file
//!   kestrel restore <pcie-addr> <file>    Restore device state and resume
//! ```
//!
//! All commands except `enumerate` need the VF bound to `vfio-pci` and
//! access to its `/dev/vfio` group.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kestrel_lm::{TransferConfig, VfDevice, VfInfo, VfManager, VfioTransport};

#[derive(Parser)]
#[command(name = "kestrel", about = "Kestrel SmartNIC VF live migration CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List migration-capable VFs and their IOMMU groups.
    Enumerate,
    /// Print dirty-tracking capacity for one VF.
    Status {
        /// PCIe address (e.g. 0000:a1:00.2).
        pcie_addr: String,
    },
    /// Suspend (quiesce) a VF.
    Suspend {
        /// PCIe address (e.g. 0000:a1:00.2).
        pcie_addr: String,
    },
    /// Resume a suspended VF.
    Resume {
        /// PCIe address (e.g. 0000:a1:00.2).
        pcie_addr: String,
    },
    /// Suspend a VF and save its device state to a file.
    Save {
        /// PCIe address (e.g. 0000:a1:00.2).
        pcie_addr: String,
        /// Output file for the state blob.
        file: std::path::PathBuf,
    },
    /// Restore device state from a file and resume the VF.
    Restore {
        /// PCIe address (e.g. 0000:a1:00.2).
        pcie_addr: String,
        /// State blob previously produced by `save`.
        file: std::path::PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Cmd::Enumerate => cmd_enumerate(),
        Cmd::Status { pcie_addr } => cmd_status(&pcie_addr),
        Cmd::Suspend { pcie_addr } => cmd_suspend(&pcie_addr),
        Cmd::Resume { pcie_addr } => cmd_resume(&pcie_addr),
        Cmd::Save { pcie_addr, file } => cmd_save(&pcie_addr, &file),
        Cmd::Restore { pcie_addr, file } => cmd_restore(&pcie_addr, &file),
    }
}

fn cmd_enumerate() -> Result<()> {
    let mgr = VfManager::discover()?;
    println!("Migration-capable VFs: {}", mgr.vfs().len());
    println!();
    for vf in mgr.vfs() {
        print_vf(vf);
    }
    Ok(())
}

fn print_vf(vf: &VfInfo) {
    println!("{}", vf.pcie_address);
    if let Some(pf) = &vf.physfn {
        match vf.vf_index {
            Some(idx) => println!("     PF    {pf}  (virtfn{idx})"),
            None => println!("     PF    {pf}"),
        }
    }
    match vf.iommu_group {
        Some(group) => println!("     IOMMU group {group}"),
        None => println!("     IOMMU group unavailable (IOMMU disabled?)"),
    }
    println!();
}

fn open_vf(pcie_addr: &str) -> Result<VfDevice> {
    let mgr = VfManager::discover()?;
    let info = mgr
        .find(pcie_addr)
        .with_context(|| format!("{pcie_addr} is not a migration-capable VF"))?;
    let vf_id = info.vf_index.unwrap_or(0);

    let transport = VfioTransport::open(pcie_addr)?;
    let vf = VfDevice::new(Box::new(transport), vf_id, TransferConfig::default())?;
    Ok(vf)
}

fn cmd_status(pcie_addr: &str) -> Result<()> {
    let vf = open_vf(pcie_addr)?;
    let cap = vf.query_capacity()?;
    println!("VF            : {pcie_addr}");
    println!("State         : {}", vf.state());
    println!("Dirty regions : {}/{} active", cap.active_regions, cap.max_regions);
    println!("Bitmap chunk  : {} bytes", cap.chunk_len);
    Ok(())
}

fn cmd_suspend(pcie_addr: &str) -> Result<()> {
    let vf = open_vf(pcie_addr)?;
    vf.suspend()?;
    println!("{pcie_addr}: suspended");
    Ok(())
}

fn cmd_resume(pcie_addr: &str) -> Result<()> {
    let vf = open_vf(pcie_addr)?;
    vf.resume()
        .with_context(|| format!("resume {pcie_addr} (was it suspended by this tool?)"))?;
    println!("{pcie_addr}: resumed");
    Ok(())
}

fn cmd_save(pcie_addr: &str, file: &std::path::Path) -> Result<()> {
    let vf = open_vf(pcie_addr)?;
    vf.suspend()?;
    let size = vf.query_size()?;
    println!("{pcie_addr}: suspended, state blob {size} bytes");

    let blob = vf.read_state(0, usize::try_from(size).context("blob exceeds address space")?)?;
    std::fs::write(file, &blob)
        .with_context(|| format!("writing state blob to {}", file.display()))?;
    println!("{pcie_addr}: saved {} bytes to {}", blob.len(), file.display());
    println!("VF left suspended; `kestrel resume` or migrate the guest.");
    Ok(())
}

fn cmd_restore(pcie_addr: &str, file: &std::path::Path) -> Result<()> {
    let blob = std::fs::read(file)
        .with_context(|| format!("reading state blob from {}", file.display()))?;

    let vf = open_vf(pcie_addr)?;
    vf.suspend()
        .with_context(|| format!("quiescing {pcie_addr} before restore"))?;
    vf.write_state(0, &blob)?;
    vf.resume()
        .with_context(|| "device rejected restored state at resume")?;
    println!(
        "{pcie_addr}: restored {} bytes from {} and resumed",
        blob.len(),
        file.display()
    );
    Ok(())
}
