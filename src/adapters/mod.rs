//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Ports                              │
//! │   LoopControl │ ManagementInterface │ DaemonSupervisor          │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  LosetupLoopControl │ CliManagementClient │ DeviceMapperCleaner │
//! │  InMemoryHost / InMemoryDaemon                                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The process controller for the daemon binary lives in
//! [`crate::daemon`].

pub(crate) mod command;
mod device_mapper;
mod in_memory;
mod losetup;
mod management_cli;

pub use device_mapper::{DeviceMapperCleaner, STRATIS_DM_PREFIX};
pub use in_memory::{AssemblyPolicy, HostStats, InMemoryDaemon, InMemoryDaemonHandle, InMemoryHost};
pub use losetup::LosetupLoopControl;
pub use management_cli::CliManagementClient;
