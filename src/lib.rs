//! Hotplug Harness - Incremental Pool Assembly Verification
//!
//! Drives a storage daemon through device-arrival scenarios and checks that
//! every multi-device pool becomes visible if and only if all of its member
//! devices have been (re)discovered, across daemon restarts and under
//! duplicate arrival notifications.
//!
//! # Architecture
//!
//! ```text
//! ScenarioDriver ──▶ LoopbackDeviceManager ──▶ BackingStore
//!       │                    │
//!       │                    ▼
//!       │              LoopControl (losetup / in-memory)
//!       ▼
//! AssemblyOracle ──▶ ManagementInterface (CLI / in-memory)
//!       │
//!       ▼
//! DaemonSupervisor (process controller / in-memory)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Port implementations for real tools and an in-memory host
//! - [`config`] - Harness configuration
//! - [`daemon`] - Daemon process control and readiness wait
//! - [`device`] - Loopback device lifecycle
//! - [`domain`] - Value objects and port traits
//! - [`error`] - Error types
//! - [`oracle`] - Pool visibility queries and assertions
//! - [`scenario`] - Activation order, scenario driver and reports
//! - [`storage`] - Sparse backing files

pub mod adapters;
pub mod config;
pub mod daemon;
pub mod device;
pub mod domain;
pub mod error;
pub mod oracle;
pub mod scenario;
pub mod storage;

// Re-export commonly used types
pub use config::HarnessConfig;
pub use device::LoopbackDeviceManager;
pub use domain::{DeviceToken, PoolHandle};
pub use error::{Error, Result};
pub use oracle::{AssemblyOracle, PoolVisibility};
pub use scenario::{ScenarioDriver, ScenarioKind, ScenarioOutcome, ScenarioReport};
pub use storage::BackingStore;
