//! Userspace live-migration driver core for Kestrel SmartNIC SR-IOV VFs.
//!
//! Implements the migration control surface a VFIO/hypervisor framework
//! drives to move one passthrough virtual function between hosts: suspend
//! and quiesce, dirty-memory tracking with paged bitmap retrieval, opaque
//! device-state save/restore, and resume — all over a serialized command
//! channel to the device's firmware command processor.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐   ┌───────────────────┐
//! │ lifecycle driver  │   │ dirty drain loop  │   (orchestrator threads)
//! └─────────┬─────────┘   └─────────┬─────────┘
//!           ▼                       ▼
//! ┌─────────────────────────────────────────────┐
//! │ VfDevice — state machine · tracker · blob   │
//! └─────────────────────┬───────────────────────┘
//!                       ▼
//!            CommandChannel (one in-flight)
//!                       ▼
//!            CommandTransport (VFIO mailbox / stub)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use kestrel_lm::{TransferConfig, VfDevice, VfioTransport};
//!
//! # fn main() -> kestrel_lm::Result<()> {
//! let transport = VfioTransport::open("0000:a1:00.2")?;
//! let vf = VfDevice::new(Box::new(transport), 2, TransferConfig::default())?;
//!
//! vf.suspend()?;
//! let size = vf.query_size()?;
//! let blob = vf.read_state(0, size as usize)?;
//! println!("saved {} bytes of device state", blob.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod channel;
mod config;
mod device;
pub mod dirty;
mod discovery;
mod error;
pub mod lifecycle;
mod mmio;
pub mod state;
pub mod transfer;
pub mod transport;
pub mod vfio;

pub use channel::CommandChannel;
pub use config::TransferConfig;
pub use device::VfDevice;
pub use dirty::{BitmapPage, DirtyCapacity, DirtyPageTracker};
pub use discovery::{VfInfo, VfManager};
pub use error::{MigrationError, Result};
pub use lifecycle::MigrationStateMachine;
pub use state::{FailedTransition, MigrationState, StateCell};
pub use transfer::StateTransferBuffer;
pub use transport::{CommandTransport, DataXfer};
pub use vfio::VfioTransport;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        BitmapPage, CommandTransport, DataXfer, DirtyCapacity, MigrationError, MigrationState,
        Result, TransferConfig, VfDevice, VfManager, VfioTransport,
    };
    pub use kestrel_proto::{DirtyRegion, HostStatus};
}
