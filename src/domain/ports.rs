//! Domain Ports (Port/Adapter Pattern)
//!
//! The harness core only talks to the outside world through the traits in
//! this module. Adapters implement them for real tools (`losetup`, the
//! management CLI, the daemon binary) or for the in-memory host used by the
//! test suite.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Harness Core                          │
//! │  LoopbackDeviceManager │ AssemblyOracle │ ScenarioDriver    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  LoopControl │ ManagementInterface │ DaemonSupervisor       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  LosetupLoopControl │ CliManagementClient │ DaemonController│
//! │  InMemoryHost (all three)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Stable identity of one simulated device across attach/detach cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceToken(pub u64);

impl DeviceToken {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeviceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// A pool as seen through the management interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PoolHandle {
    /// Pool name
    pub name: String,
    /// Object path or UUID, when the transport exposes one
    pub object_path: Option<String>,
}

impl PoolHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            object_path: None,
        }
    }

    pub fn with_object_path(mut self, path: impl Into<String>) -> Self {
        self.object_path = Some(path.into());
        self
    }
}

impl std::fmt::Display for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.object_path {
            Some(path) => write!(f, "{} ({})", self.name, path),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Arguments of a pool creation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatePoolRequest {
    pub name: String,
    /// Redundancy hint, `None` lets the daemon choose
    pub redundancy: Option<u16>,
    pub force: bool,
    /// Device nodes the pool is built from
    pub devices: Vec<String>,
}

impl CreatePoolRequest {
    /// Request with the defaults used by every scenario.
    pub fn new(name: impl Into<String>, devices: Vec<String>) -> Self {
        Self {
            name: name.into(),
            redundancy: Some(0),
            force: false,
            devices,
        }
    }
}

// =============================================================================
// Loop Device Port
// =============================================================================

/// Port for the OS loop-device and device-event facilities.
///
/// A first attach of a file makes the OS emit an arrival notification on its
/// own; re-attaching the same file later does not, so callers that emulate
/// hot-plug must call [`LoopControl::notify_arrival`] themselves.
#[async_trait]
pub trait LoopControl: Send + Sync {
    /// Attach `backing_file` to a free loop device, returning its node.
    async fn attach(&self, backing_file: &Path) -> Result<String>;

    /// Detach a loop device node.
    async fn detach(&self, device_node: &str) -> Result<()>;

    /// Synthesize an "add" event for an attached node.
    async fn notify_arrival(&self, device_node: &str) -> Result<()>;

    /// Block until the OS device-event queue is empty.
    async fn drain_event_queue(&self) -> Result<()>;
}

// =============================================================================
// Management Port
// =============================================================================

/// Port for the daemon's management interface.
#[async_trait]
pub trait ManagementInterface: Send + Sync {
    /// Create a pool from the given devices.
    async fn create_pool(&self, request: &CreatePoolRequest) -> Result<PoolHandle>;

    /// List visible pools, optionally restricted to one name.
    async fn list_pools(&self, name_filter: Option<&str>) -> Result<Vec<PoolHandle>>;
}

// =============================================================================
// Daemon Supervision Port
// =============================================================================

/// Port for starting and stopping the daemon under test.
#[async_trait]
pub trait DaemonSupervisor: Send {
    /// Token for one running daemon instance.
    type Handle: Send;

    /// Forcibly remove any prior daemon instance and its kernel state.
    async fn clear_stale_state(&mut self) -> Result<()>;

    /// Launch a daemon instance. Readiness is awaited separately.
    async fn start(&mut self) -> Result<Self::Handle>;

    /// Stop the given instance and wait for it to exit.
    async fn stop(&mut self, handle: Self::Handle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_token_display_and_order() {
        let a = DeviceToken::new(3);
        let b = DeviceToken::new(11);
        assert_eq!(a.to_string(), "dev#3");
        assert!(a < b);
        assert_eq!(b.id(), 11);
    }

    #[test]
    fn test_pool_handle_display() {
        let plain = PoolHandle::new("stratis_ABCDE");
        assert_eq!(plain.to_string(), "stratis_ABCDE");

        let with_path = PoolHandle::new("p").with_object_path("/org/storage/pool/1");
        assert_eq!(with_path.to_string(), "p (/org/storage/pool/1)");
    }

    #[test]
    fn test_create_pool_request_defaults() {
        let req = CreatePoolRequest::new("p", vec!["/dev/loop0".into()]);
        assert_eq!(req.redundancy, Some(0));
        assert!(!req.force);
        assert_eq!(req.devices, vec!["/dev/loop0".to_string()]);
    }
}
