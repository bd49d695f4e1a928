//! In-Memory Host
//!
//! A process-local stand-in for the loop-device layer, the device-event
//! queue, and a pool-assembling daemon, all sharing one state. It implements
//! [`LoopControl`], [`ManagementInterface`] and (through [`InMemoryDaemon`])
//! [`DaemonSupervisor`], so scenarios run without root or a real daemon.
//!
//! The daemon's assembly rule is selected with [`AssemblyPolicy`]. Only
//! [`AssemblyPolicy::AllMembers`] is correct; the others reproduce classic
//! discovery bugs so tests can prove that each scenario catches them.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::domain::{
    CreatePoolRequest, DaemonSupervisor, LoopControl, ManagementInterface, PoolHandle,
};
use crate::error::{Error, Result};

const POOL_PATH_PREFIX: &str = "/org/storage/pool";

/// Rule the simulated daemon uses to decide that a pool is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AssemblyPolicy {
    /// Assemble once every member device has been discovered
    #[default]
    AllMembers,
    /// Assemble as soon as any member device is seen
    AnyMember,
    /// Assemble when the total number of discovered devices, across all
    /// pools, reaches the pool's member count
    GlobalDeviceCount,
    /// Like `AllMembers`, but every redundant arrival of a member of an
    /// assembled pool sets up another instance of it
    DuplicateOnRepeat,
    /// Discover devices only while starting up, never from arrivals
    IgnoreArrivals,
}

/// Counters describing what the host has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    pub attaches: u64,
    pub detaches: u64,
    pub arrivals_processed: u64,
    pub arrivals_dropped: u64,
    pub daemon_starts: u64,
    pub daemon_stops: u64,
    pub forced_cleanups: u64,
}

#[derive(Debug)]
struct SimPool {
    name: String,
    id: u64,
    members: BTreeSet<PathBuf>,
}

#[derive(Debug)]
struct RunningDaemon {
    generation: u64,
    refusals_remaining: u32,
    discovered: BTreeSet<PathBuf>,
    /// Extra instances per pool name
    duplicates: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct HostState {
    policy: AssemblyPolicy,
    ready_after_attempts: u32,
    /// Loop minor -> backing file
    loops: BTreeMap<u32, PathBuf>,
    ever_attached: BTreeSet<PathBuf>,
    events: VecDeque<String>,
    fail_next_attach: bool,
    fail_next_detach: bool,
    /// Pool metadata; on real devices this lives in on-disk signatures
    pools: Vec<SimPool>,
    next_pool_id: u64,
    daemon: Option<RunningDaemon>,
    generation: u64,
    stats: HostStats,
}

fn node_name(minor: u32) -> String {
    format!("/dev/loop{}", minor)
}

fn parse_minor(node: &str) -> Option<u32> {
    node.strip_prefix("/dev/loop")?.parse().ok()
}

impl HostState {
    fn backing_of(&self, node: &str) -> Option<&PathBuf> {
        parse_minor(node).and_then(|minor| self.loops.get(&minor))
    }

    fn attached_backings(&self) -> BTreeSet<PathBuf> {
        self.loops.values().cloned().collect()
    }

    fn owning_pool(&self, backing: &Path) -> Option<&SimPool> {
        self.pools.iter().find(|p| p.members.contains(backing))
    }

    fn process_arrival(&mut self, node: &str) {
        let Some(backing) = self.backing_of(node).cloned() else {
            self.stats.arrivals_dropped += 1;
            return;
        };
        let policy = self.policy;
        let complete_pool = self
            .owning_pool(&backing)
            .map(|p| (p.name.clone(), p.members.clone()));

        let Some(daemon) = self.daemon.as_mut() else {
            self.stats.arrivals_dropped += 1;
            return;
        };
        self.stats.arrivals_processed += 1;

        match policy {
            AssemblyPolicy::IgnoreArrivals => {
                trace!(node, "arrival ignored by policy");
            }
            AssemblyPolicy::DuplicateOnRepeat => {
                let repeat = !daemon.discovered.insert(backing);
                if let Some((name, members)) = complete_pool {
                    if repeat && members.is_subset(&daemon.discovered) {
                        *daemon.duplicates.entry(name).or_default() += 1;
                    }
                }
            }
            _ => {
                daemon.discovered.insert(backing);
            }
        }
    }

    fn visible_instances(&self, pool: &SimPool, daemon: &RunningDaemon) -> usize {
        let assembled = match self.policy {
            AssemblyPolicy::AllMembers
            | AssemblyPolicy::DuplicateOnRepeat
            | AssemblyPolicy::IgnoreArrivals => pool.members.is_subset(&daemon.discovered),
            AssemblyPolicy::AnyMember => !pool.members.is_disjoint(&daemon.discovered),
            AssemblyPolicy::GlobalDeviceCount => daemon.discovered.len() >= pool.members.len(),
        };
        if !assembled {
            return 0;
        }
        1 + daemon.duplicates.get(&pool.name).copied().unwrap_or(0)
    }
}

/// Shared in-memory host. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHost {
    state: Arc<Mutex<HostState>>,
}

impl InMemoryHost {
    /// Host whose daemon follows [`AssemblyPolicy::AllMembers`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Host whose daemon follows `policy`.
    pub fn with_policy(policy: AssemblyPolicy) -> Self {
        let host = Self::new();
        host.state.lock().policy = policy;
        host
    }

    /// Make every daemon start refuse the first `attempts` management calls.
    pub fn set_ready_after_attempts(&self, attempts: u32) {
        self.state.lock().ready_after_attempts = attempts;
    }

    /// Make the next attach fail like a broken loop layer.
    pub fn fail_next_attach(&self) {
        self.state.lock().fail_next_attach = true;
    }

    /// Make the next detach fail. The device stays attached.
    pub fn fail_next_detach(&self) {
        self.state.lock().fail_next_detach = true;
    }

    /// Supervisor for this host's daemon.
    pub fn daemon(&self) -> InMemoryDaemon {
        InMemoryDaemon { host: self.clone() }
    }

    pub fn policy(&self) -> AssemblyPolicy {
        self.state.lock().policy
    }

    pub fn stats(&self) -> HostStats {
        self.state.lock().stats
    }

    /// Number of attached loop devices.
    pub fn attached_count(&self) -> usize {
        self.state.lock().loops.len()
    }

    /// Number of undelivered arrival notifications.
    pub fn pending_events(&self) -> usize {
        self.state.lock().events.len()
    }

    /// Discard undelivered arrival notifications.
    pub fn drain_pending(&self) {
        self.state.lock().events.clear();
    }

    pub fn is_daemon_running(&self) -> bool {
        self.state.lock().daemon.is_some()
    }

    /// Pools recorded on the simulated devices, visible or not.
    pub fn recorded_pools(&self) -> usize {
        self.state.lock().pools.len()
    }
}

#[async_trait]
impl LoopControl for InMemoryHost {
    async fn attach(&self, backing_file: &Path) -> Result<String> {
        let mut state = self.state.lock();
        let command = format!("losetup -f --show {}", backing_file.display());

        if std::mem::take(&mut state.fail_next_attach) {
            return Err(Error::device(command, "injected attach failure"));
        }
        if !backing_file.exists() {
            return Err(Error::device(command, "No such file or directory"));
        }

        let minor = (0..)
            .find(|m| !state.loops.contains_key(m))
            .unwrap_or_default();
        state.loops.insert(minor, backing_file.to_path_buf());
        state.stats.attaches += 1;

        let node = node_name(minor);
        if state.ever_attached.insert(backing_file.to_path_buf()) {
            // Only the first attach of a file is announced by the OS
            state.events.push_back(node.clone());
        }
        debug!(node = %node, backing = %backing_file.display(), "attached");
        Ok(node)
    }

    async fn detach(&self, device_node: &str) -> Result<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_detach) {
            return Err(Error::device(
                format!("losetup -d {}", device_node),
                "injected detach failure",
            ));
        }
        match parse_minor(device_node).and_then(|m| state.loops.remove(&m)) {
            Some(_) => {
                state.stats.detaches += 1;
                Ok(())
            }
            None => Err(Error::device(
                format!("losetup -d {}", device_node),
                "No such device or address",
            )),
        }
    }

    async fn notify_arrival(&self, device_node: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.backing_of(device_node).is_none() {
            return Err(Error::device(
                format!("write add to uevent of {}", device_node),
                "No such file or directory",
            ));
        }
        state.events.push_back(device_node.to_string());
        Ok(())
    }

    async fn drain_event_queue(&self) -> Result<()> {
        let mut state = self.state.lock();
        while let Some(node) = state.events.pop_front() {
            state.process_arrival(&node);
        }
        Ok(())
    }
}

#[async_trait]
impl ManagementInterface for InMemoryHost {
    async fn create_pool(&self, request: &CreatePoolRequest) -> Result<PoolHandle> {
        let mut state = self.state.lock();
        ready_daemon(&mut state)?;

        if request.devices.is_empty() {
            return Err(Error::Management("at least one device is required".into()));
        }
        if state.pools.iter().any(|p| p.name == request.name) {
            return Err(Error::Management(format!(
                "pool {} already exists",
                request.name
            )));
        }

        let mut members = BTreeSet::new();
        for node in &request.devices {
            let backing = state
                .backing_of(node)
                .cloned()
                .ok_or_else(|| Error::Management(format!("device {} not found", node)))?;
            if let Some(owner) = state.owning_pool(&backing) {
                return Err(Error::Management(format!(
                    "device {} already belongs to pool {}",
                    node, owner.name
                )));
            }
            members.insert(backing);
        }

        let id = state.next_pool_id;
        state.next_pool_id += 1;
        if let Some(daemon) = state.daemon.as_mut() {
            daemon.discovered.extend(members.iter().cloned());
        }
        state.pools.push(SimPool {
            name: request.name.clone(),
            id,
            members,
        });

        debug!(pool = %request.name, devices = request.devices.len(), "pool created");
        Ok(PoolHandle::new(&request.name).with_object_path(format!("{}/{}", POOL_PATH_PREFIX, id)))
    }

    async fn list_pools(&self, name_filter: Option<&str>) -> Result<Vec<PoolHandle>> {
        let mut state = self.state.lock();
        ready_daemon(&mut state)?;

        let state = &*state;
        let Some(daemon) = state.daemon.as_ref() else {
            return Err(Error::NotConnected("daemon is not running".into()));
        };

        let mut handles = Vec::new();
        for pool in &state.pools {
            if name_filter.is_some_and(|name| name != pool.name) {
                continue;
            }
            for instance in 0..state.visible_instances(pool, daemon) {
                let path = match instance {
                    0 => format!("{}/{}", POOL_PATH_PREFIX, pool.id),
                    n => format!("{}/{}/{}", POOL_PATH_PREFIX, pool.id, n),
                };
                handles.push(PoolHandle::new(&pool.name).with_object_path(path));
            }
        }
        Ok(handles)
    }
}

/// Fails with `NotConnected` until the running daemon has refused enough
/// calls.
fn ready_daemon(state: &mut HostState) -> Result<()> {
    let Some(daemon) = state.daemon.as_mut() else {
        return Err(Error::NotConnected("daemon is not running".into()));
    };
    if daemon.refusals_remaining > 0 {
        daemon.refusals_remaining -= 1;
        return Err(Error::NotConnected("daemon is still starting".into()));
    }
    Ok(())
}

/// Instance token of a simulated daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InMemoryDaemonHandle {
    pub generation: u64,
}

/// [`DaemonSupervisor`] for the daemon inside an [`InMemoryHost`].
#[derive(Debug, Clone)]
pub struct InMemoryDaemon {
    host: InMemoryHost,
}

#[async_trait]
impl DaemonSupervisor for InMemoryDaemon {
    type Handle = InMemoryDaemonHandle;

    async fn clear_stale_state(&mut self) -> Result<()> {
        let mut state = self.host.state.lock();
        if state.daemon.take().is_some() {
            state.stats.forced_cleanups += 1;
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<InMemoryDaemonHandle> {
        let mut state = self.host.state.lock();
        if state.daemon.is_some() {
            return Err(Error::Daemon("a daemon instance is already running".into()));
        }

        state.generation += 1;
        // Events raised before start were never seen by this instance
        let dropped = state.events.len() as u64;
        state.events.clear();
        state.stats.arrivals_dropped += dropped;

        let discovered = state.attached_backings();
        state.daemon = Some(RunningDaemon {
            generation: state.generation,
            refusals_remaining: state.ready_after_attempts,
            discovered,
            duplicates: BTreeMap::new(),
        });
        state.stats.daemon_starts += 1;

        Ok(InMemoryDaemonHandle {
            generation: state.generation,
        })
    }

    async fn stop(&mut self, handle: InMemoryDaemonHandle) -> Result<()> {
        let mut state = self.host.state.lock();
        match &state.daemon {
            Some(d) if d.generation == handle.generation => {
                state.daemon = None;
                state.stats.daemon_stops += 1;
                Ok(())
            }
            _ => Err(Error::Daemon(format!(
                "daemon generation {} is not running",
                handle.generation
            ))),
        }
    }
}
