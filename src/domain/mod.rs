//! Domain Layer
//!
//! Value objects and port traits shared by the harness core and its adapters.
//!
//! # Usage
//!
//! ```ignore
//! use hotplug_harness::domain::{LoopControl, ManagementInterface};
//!
//! async fn visible<M: ManagementInterface>(mgmt: &M) -> Result<usize> {
//!     Ok(mgmt.list_pools(None).await?.len())
//! }
//! ```

pub mod ports;

pub use ports::{
    CreatePoolRequest, DaemonSupervisor, DeviceToken, LoopControl, ManagementInterface,
    PoolHandle,
};
