//! Loopback Device Manager
//!
//! Presents ephemeral block devices over [`BackingStore`] files. Each device
//! is identified by a [`DeviceToken`] that never changes, while the node it is
//! attached to may differ between attach cycles (the OS reuses loop names).
//!
//! # Arrival notifications
//!
//! The first attach of a backing file produces an arrival notification from
//! the OS. Re-attaching the same file does not, so [`hotplug`] always
//! synthesizes one explicitly to emulate a real hot-plug.
//!
//! [`hotplug`]: LoopbackDeviceManager::hotplug

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::HarnessConfig;
use crate::domain::{DeviceToken, LoopControl};
use crate::error::{Error, Result};
use crate::storage::{BackingFile, BackingStore};

/// Bytes per MiB.
pub const MIB: u64 = 1 << 20;

/// Attachment state of one token.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceBinding {
    pub token: DeviceToken,
    /// Current node, `None` while detached
    pub device_node: Option<String>,
    pub backing_file: BackingFile,
}

impl DeviceBinding {
    pub fn is_attached(&self) -> bool {
        self.device_node.is_some()
    }
}

/// Per-run operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCounters {
    pub created: u64,
    pub unplugged: u64,
    pub hotplugged: u64,
    pub synthetic_events: u64,
}

/// Owner of every binding and backing file it creates.
pub struct LoopbackDeviceManager<L> {
    control: L,
    store: BackingStore,
    bindings: BTreeMap<DeviceToken, DeviceBinding>,
    next_token: u64,
    counters: DeviceCounters,
}

impl<L: LoopControl> LoopbackDeviceManager<L> {
    /// Create a manager with its own scratch directory.
    pub fn new(control: L, config: &HarnessConfig) -> Result<Self> {
        let store = BackingStore::new(config.scratch_root.as_deref())?;
        Ok(Self::with_store(control, store))
    }

    pub fn with_store(control: L, store: BackingStore) -> Self {
        Self {
            control,
            store,
            bindings: BTreeMap::new(),
            next_token: 0,
            counters: DeviceCounters::default(),
        }
    }

    /// Loop-device port used by this manager.
    pub fn control(&self) -> &L {
        &self.control
    }

    pub fn counters(&self) -> DeviceCounters {
        self.counters
    }

    /// Number of tracked devices.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Tokens in creation order.
    pub fn tokens(&self) -> impl Iterator<Item = DeviceToken> + '_ {
        self.bindings.keys().copied()
    }

    pub fn binding(&self, token: DeviceToken) -> Option<&DeviceBinding> {
        self.bindings.get(&token)
    }

    /// Current node of `token`, `None` when detached or unknown.
    pub fn device_node(&self, token: DeviceToken) -> Option<&str> {
        self.bindings
            .get(&token)
            .and_then(|b| b.device_node.as_deref())
    }

    /// Current nodes of `tokens`; every token must be attached.
    pub fn device_nodes(&self, tokens: &[DeviceToken]) -> Result<Vec<String>> {
        tokens
            .iter()
            .map(|&token| {
                self.device_node(token).map(str::to_owned).ok_or_else(|| {
                    Error::device(
                        format!("resolve {}", token),
                        "device is not attached or unknown",
                    )
                })
            })
            .collect()
    }

    /// Create a `size_mib` MiB device and attach it.
    ///
    /// The OS emits the arrival notification for this first attach.
    #[instrument(skip(self))]
    pub async fn create_device(&mut self, size_mib: u64) -> Result<DeviceToken> {
        let size_bytes = size_mib.checked_mul(MIB).ok_or_else(|| {
            Error::Config(format!("device size of {} MiB overflows", size_mib))
        })?;
        let backing_file = self.store.create(size_bytes)?;
        let node = match self.control.attach(backing_file.path()).await {
            Ok(node) => node,
            Err(e) => {
                let _ = self.store.destroy(&backing_file);
                return Err(e);
            }
        };

        let token = DeviceToken::new(self.next_token);
        self.next_token += 1;
        self.counters.created += 1;

        debug!(%token, node = %node, "Created device");
        self.bindings.insert(
            token,
            DeviceBinding {
                token,
                device_node: Some(node),
                backing_file,
            },
        );
        Ok(token)
    }

    /// Detach `token`'s node, keeping the backing file.
    ///
    /// No-op for detached or unknown tokens.
    #[instrument(skip(self))]
    pub async fn unplug(&mut self, token: DeviceToken) -> Result<()> {
        let Some(binding) = self.bindings.get_mut(&token) else {
            debug!(%token, "Unplug of unknown token ignored");
            return Ok(());
        };
        let Some(node) = binding.device_node.clone() else {
            return Ok(());
        };

        self.control.detach(&node).await?;
        binding.device_node = None;
        self.counters.unplugged += 1;
        debug!(%token, node = %node, "Unplugged device");
        Ok(())
    }

    /// Re-attach `token`'s backing file and signal its arrival.
    ///
    /// No-op for unknown tokens. A token that is still attached only gets the
    /// arrival notification.
    #[instrument(skip(self))]
    pub async fn hotplug(&mut self, token: DeviceToken) -> Result<()> {
        let Some(binding) = self.bindings.get_mut(&token) else {
            debug!(%token, "Hotplug of unknown token ignored");
            return Ok(());
        };

        let node = match &binding.device_node {
            Some(node) => {
                warn!(%token, node = %node, "Hotplug of attached device, only notifying");
                node.clone()
            }
            None => {
                if !self.store.exists(&binding.backing_file) {
                    return Err(Error::device(
                        format!("attach {}", binding.backing_file.path().display()),
                        "backing file no longer exists",
                    ));
                }
                let node = self.control.attach(binding.backing_file.path()).await?;
                binding.device_node = Some(node.clone());
                node
            }
        };

        self.control.notify_arrival(&node).await?;
        self.counters.hotplugged += 1;
        self.counters.synthetic_events += 1;
        debug!(%token, node = %node, "Hotplugged device");
        Ok(())
    }

    /// Synthesize a redundant arrival notification for an attached token.
    ///
    /// No-op for detached or unknown tokens.
    #[instrument(skip(self))]
    pub async fn generate_arrival_event(&mut self, token: DeviceToken) -> Result<()> {
        let Some(node) = self.device_node(token).map(str::to_owned) else {
            return Ok(());
        };
        self.control.notify_arrival(&node).await?;
        self.counters.synthetic_events += 1;
        Ok(())
    }

    /// Detach and delete every tracked device and reset the counters.
    ///
    /// Every device is attempted even when one fails; the first failure is
    /// returned. The scratch directory is kept.
    pub async fn destroy_devices(&mut self) -> Result<()> {
        let mut first_error = None;
        let count = self.bindings.len();

        for (token, binding) in std::mem::take(&mut self.bindings) {
            if let Some(node) = &binding.device_node {
                if let Err(e) = self.control.detach(node).await {
                    warn!(%token, node = %node, error = %e, "Failed to detach device");
                    first_error.get_or_insert(e);
                }
            }
            if let Err(e) = self.store.destroy(&binding.backing_file) {
                warn!(%token, error = %e, "Failed to remove backing file");
                first_error.get_or_insert(e);
            }
        }

        self.counters = DeviceCounters::default();
        info!(count, "Destroyed devices");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Destroy every device, then the scratch directory.
    ///
    /// Consumes the manager.
    pub async fn destroy_all(mut self) -> Result<()> {
        let devices = self.destroy_devices().await;
        let store = self.store.destroy_all();
        devices.and(store)
    }
}

impl<L> std::fmt::Debug for LoopbackDeviceManager<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackDeviceManager")
            .field("scratch", &self.store.scratch_dir())
            .field("devices", &self.bindings.len())
            .field("next_token", &self.next_token)
            .field("counters", &self.counters)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryHost;
    use assert_matches::assert_matches;

    fn manager(host: &InMemoryHost) -> (tempfile::TempDir, LoopbackDeviceManager<InMemoryHost>) {
        let root = tempfile::TempDir::new().unwrap();
        let store = BackingStore::new(Some(root.path())).unwrap();
        (root, LoopbackDeviceManager::with_store(host.clone(), store))
    }

    #[tokio::test]
    async fn test_create_device_attaches_and_emits_one_arrival() {
        let host = InMemoryHost::new();
        let (_root, mut mgr) = manager(&host);

        let token = mgr.create_device(8).await.unwrap();

        let node = mgr.device_node(token).unwrap().to_string();
        assert!(node.starts_with("/dev/loop"));
        assert_eq!(host.pending_events(), 1);
        assert_eq!(mgr.binding(token).unwrap().backing_file.size_bytes(), 8 * MIB);
        assert_eq!(mgr.counters().created, 1);
    }

    #[tokio::test]
    async fn test_unplug_keeps_backing_file() {
        let host = InMemoryHost::new();
        let (_root, mut mgr) = manager(&host);
        let token = mgr.create_device(1).await.unwrap();
        let path = mgr.binding(token).unwrap().backing_file.path().to_path_buf();

        mgr.unplug(token).await.unwrap();

        assert!(mgr.device_node(token).is_none());
        assert!(path.exists());
        assert_eq!(host.attached_count(), 0);

        // Already detached and unknown tokens are no-ops
        mgr.unplug(token).await.unwrap();
        mgr.unplug(DeviceToken::new(999)).await.unwrap();
        assert_eq!(mgr.counters().unplugged, 1);
    }

    #[tokio::test]
    async fn test_hotplug_reattaches_and_synthesizes_arrival() {
        let host = InMemoryHost::new();
        let (_root, mut mgr) = manager(&host);
        let token = mgr.create_device(1).await.unwrap();
        host.drain_pending();

        mgr.unplug(token).await.unwrap();
        mgr.hotplug(token).await.unwrap();

        assert!(mgr.device_node(token).is_some());
        // Re-attach emits nothing on its own; the one event is synthetic
        assert_eq!(host.pending_events(), 1);
        assert_eq!(mgr.counters().synthetic_events, 1);
    }

    #[tokio::test]
    async fn test_token_survives_node_name_changes() {
        let host = InMemoryHost::new();
        let (_root, mut mgr) = manager(&host);
        let a = mgr.create_device(1).await.unwrap();
        let b = mgr.create_device(1).await.unwrap();
        let a_node = mgr.device_node(a).unwrap().to_string();

        mgr.unplug(a).await.unwrap();
        mgr.unplug(b).await.unwrap();
        mgr.hotplug(b).await.unwrap();

        // b now holds the lowest free node, which a used before
        assert_eq!(mgr.device_node(b).unwrap(), a_node);
        mgr.hotplug(a).await.unwrap();
        assert_ne!(mgr.device_node(a).unwrap(), a_node);
        assert_eq!(mgr.binding(a).unwrap().token, a);
    }

    #[tokio::test]
    async fn test_hotplug_unknown_token_is_noop() {
        let host = InMemoryHost::new();
        let (_root, mut mgr) = manager(&host);
        mgr.hotplug(DeviceToken::new(42)).await.unwrap();
        assert_eq!(host.pending_events(), 0);
    }

    #[tokio::test]
    async fn test_hotplug_missing_backing_file_is_device_error() {
        let host = InMemoryHost::new();
        let (_root, mut mgr) = manager(&host);
        let token = mgr.create_device(1).await.unwrap();
        mgr.unplug(token).await.unwrap();

        let path = mgr.binding(token).unwrap().backing_file.path().to_path_buf();
        std::fs::remove_file(path).unwrap();

        assert_matches!(mgr.hotplug(token).await, Err(Error::Device { .. }));
    }

    #[tokio::test]
    async fn test_generate_arrival_event_only_for_attached() {
        let host = InMemoryHost::new();
        let (_root, mut mgr) = manager(&host);
        let token = mgr.create_device(1).await.unwrap();
        host.drain_pending();

        mgr.generate_arrival_event(token).await.unwrap();
        mgr.generate_arrival_event(token).await.unwrap();
        assert_eq!(host.pending_events(), 2);

        mgr.unplug(token).await.unwrap();
        mgr.generate_arrival_event(token).await.unwrap();
        mgr.generate_arrival_event(DeviceToken::new(7)).await.unwrap();
        assert_eq!(host.pending_events(), 2);
    }

    #[tokio::test]
    async fn test_device_nodes_requires_attached_tokens() {
        let host = InMemoryHost::new();
        let (_root, mut mgr) = manager(&host);
        let a = mgr.create_device(1).await.unwrap();
        let b = mgr.create_device(1).await.unwrap();

        assert_eq!(mgr.device_nodes(&[a, b]).unwrap().len(), 2);

        mgr.unplug(b).await.unwrap();
        assert_matches!(mgr.device_nodes(&[a, b]), Err(Error::Device { .. }));
    }

    #[tokio::test]
    async fn test_destroy_devices_keeps_tokens_unique() {
        let host = InMemoryHost::new();
        let (_root, mut mgr) = manager(&host);
        let first = mgr.create_device(1).await.unwrap();
        let detached = mgr.create_device(1).await.unwrap();
        mgr.unplug(detached).await.unwrap();

        mgr.destroy_devices().await.unwrap();

        assert!(mgr.is_empty());
        assert_eq!(host.attached_count(), 0);
        assert_eq!(mgr.counters(), DeviceCounters::default());

        let next = mgr.create_device(1).await.unwrap();
        assert!(next > first && next > detached);
    }

    #[tokio::test]
    async fn test_destroy_devices_attempts_every_device() {
        let host = InMemoryHost::new();
        let (_root, mut mgr) = manager(&host);
        let mut paths = Vec::new();
        for _ in 0..3 {
            let token = mgr.create_device(1).await.unwrap();
            paths.push(mgr.binding(token).unwrap().backing_file.path().to_path_buf());
        }

        host.fail_next_detach();
        assert_matches!(mgr.destroy_devices().await, Err(Error::Device { .. }));

        // Only the failed detach stays attached
        assert_eq!(host.attached_count(), 1);
        assert!(paths.iter().all(|p| !p.exists()));
        assert!(mgr.is_empty());
        assert!(mgr.store.is_empty());
        assert_eq!(mgr.counters(), DeviceCounters::default());
    }

    #[tokio::test]
    async fn test_oversized_device_is_config_error() {
        let host = InMemoryHost::new();
        let (_root, mut mgr) = manager(&host);

        assert_matches!(mgr.create_device(u64::MAX).await, Err(Error::Config(_)));
        assert!(mgr.store.is_empty());
        assert_eq!(host.attached_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_all_removes_scratch() {
        let host = InMemoryHost::new();
        let (_root, mut mgr) = manager(&host);
        mgr.create_device(1).await.unwrap();
        let scratch = mgr.store.scratch_dir().to_path_buf();

        mgr.destroy_all().await.unwrap();

        assert!(!scratch.exists());
        assert_eq!(host.attached_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_attach_is_fatal_and_leaves_no_file() {
        let host = InMemoryHost::new();
        host.fail_next_attach();
        let (_root, mut mgr) = manager(&host);

        assert_matches!(mgr.create_device(1).await, Err(Error::Device { .. }));
        assert!(mgr.is_empty());
        assert!(mgr.store.is_empty());
    }
}
