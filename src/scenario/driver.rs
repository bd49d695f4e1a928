//! Scenario Driver
//!
//! Runs assembly scenarios against a daemon: creates devices and pools,
//! manipulates device presence, settles and asserts pool visibility after
//! every step. Whatever happens inside a scenario, the daemon is stopped and
//! every device is destroyed before the next one starts.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use super::report::{ScenarioKind, ScenarioReport};
use super::sequence::{activation_sequence, split_final};
use super::{random_pool_name, PoolSpec};
use crate::config::{HarnessConfig, ReadinessPolicy, SettlePolicy};
use crate::daemon::wait_ready;
use crate::device::LoopbackDeviceManager;
use crate::domain::{CreatePoolRequest, DaemonSupervisor, LoopControl, ManagementInterface};
use crate::error::{Error, Result};
use crate::oracle::AssemblyOracle;

/// Report under construction plus the step currently executing.
struct ScenarioRun {
    report: ScenarioReport,
    checkpoint: String,
}

impl ScenarioRun {
    fn new(kind: ScenarioKind) -> Self {
        Self {
            report: ScenarioReport::new(kind),
            checkpoint: "start".to_string(),
        }
    }

    fn enter(&mut self, checkpoint: impl Into<String>) {
        self.checkpoint = checkpoint.into();
        debug!(checkpoint = %self.checkpoint, "Entering step");
    }
}

/// Drives scenarios over a device manager, a management interface and a
/// daemon supervisor.
pub struct ScenarioDriver<L, M, D: DaemonSupervisor> {
    devices: LoopbackDeviceManager<L>,
    oracle: AssemblyOracle<M>,
    daemon: D,
    running: Option<D::Handle>,
    settle: SettlePolicy,
    readiness: ReadinessPolicy,
    device_size_mib: u64,
    reports: Vec<ScenarioReport>,
}

impl<L, M, D> ScenarioDriver<L, M, D>
where
    L: LoopControl,
    M: ManagementInterface,
    D: DaemonSupervisor,
{
    pub fn new(
        devices: LoopbackDeviceManager<L>,
        mgmt: M,
        daemon: D,
        config: &HarnessConfig,
    ) -> Self {
        Self {
            devices,
            oracle: AssemblyOracle::new(mgmt),
            daemon,
            running: None,
            settle: config.settle,
            readiness: config.readiness,
            device_size_mib: config.device_size_mib,
            reports: Vec::new(),
        }
    }

    pub fn devices(&self) -> &LoopbackDeviceManager<L> {
        &self.devices
    }

    pub fn oracle(&self) -> &AssemblyOracle<M> {
        &self.oracle
    }

    pub fn is_daemon_running(&self) -> bool {
        self.running.is_some()
    }

    /// Reports of every scenario run so far, failed ones included.
    pub fn reports(&self) -> &[ScenarioReport] {
        &self.reports
    }

    pub fn take_reports(&mut self) -> Vec<ScenarioReport> {
        std::mem::take(&mut self.reports)
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    /// Interleaved multi-pool activation.
    ///
    /// Every pool must stay invisible while any of its members is missing and
    /// resolve to exactly one pool once the last member arrives. With
    /// `restart_between_steps` the daemon is restarted after each partial
    /// activation instead of settling.
    pub async fn run_scenario(
        &mut self,
        pool_count: usize,
        devices_per_pool: usize,
        restart_between_steps: bool,
    ) -> Result<ScenarioReport> {
        self.run(ScenarioKind::Assembly {
            pool_count,
            devices_per_pool,
            restart_between_steps,
        })
        .await
    }

    /// One pool whose members re-arrive with `duplicate_notifications`
    /// redundant arrival notifications each.
    pub async fn run_single_pool_idempotence(
        &mut self,
        device_count: usize,
        duplicate_notifications: usize,
    ) -> Result<ScenarioReport> {
        self.run(ScenarioKind::Idempotence {
            device_count,
            duplicate_notifications,
        })
        .await
    }

    /// Run one scenario and tear it down, whatever the outcome.
    ///
    /// The report is kept in [`reports`](Self::reports) in both cases; the
    /// first error of the run is returned.
    #[instrument(skip_all, fields(scenario = %kind))]
    pub async fn run(&mut self, kind: ScenarioKind) -> Result<ScenarioReport> {
        validate(kind)?;
        info!("Starting scenario");

        let mut run = ScenarioRun::new(kind);
        let mut result = match kind {
            ScenarioKind::Assembly {
                pool_count,
                devices_per_pool,
                restart_between_steps,
            } => {
                self.assembly_steps(&mut run, pool_count, devices_per_pool, restart_between_steps)
                    .await
            }
            ScenarioKind::Idempotence {
                device_count,
                duplicate_notifications,
            } => {
                self.idempotence_steps(&mut run, device_count, duplicate_notifications)
                    .await
            }
        };

        if result.is_ok() {
            run.enter("teardown");
        }
        let teardown = self.teardown().await;
        result = result.and(teardown);

        let mut report = run.report;
        match result {
            Ok(()) => {
                report.pass();
                info!(duration = ?report.duration, "Scenario passed");
                self.reports.push(report.clone());
                Ok(report)
            }
            Err(e) => {
                report.fail(&run.checkpoint, &e);
                error!(checkpoint = %run.checkpoint, error = %e, "Scenario failed");
                self.reports.push(report);
                Err(e)
            }
        }
    }

    /// Run `kinds` in order, continuing past failures.
    ///
    /// Returns the report of each run; failures are marked in the reports.
    pub async fn run_all(&mut self, kinds: &[ScenarioKind]) -> Vec<ScenarioReport> {
        let first = self.reports.len();
        let mut failed = 0usize;
        for &kind in kinds {
            // Failures are already recorded in the report
            if self.run(kind).await.is_err() {
                failed += 1;
            }
        }
        info!(total = kinds.len(), failed, "Scenario batch finished");
        self.reports[first..].to_vec()
    }

    async fn assembly_steps(
        &mut self,
        run: &mut ScenarioRun,
        pool_count: usize,
        devices_per_pool: usize,
        restart_between_steps: bool,
    ) -> Result<()> {
        run.enter("prepare");
        self.prepare().await?;

        run.enter("create pools");
        let mut pools = Vec::with_capacity(pool_count);
        for pool_index in 0..pool_count {
            run.enter(format!("create pool {}", pool_index));
            let spec = self.create_pool(devices_per_pool).await?;
            run.report.pools.push(spec.name().to_string());
            pools.push(spec);
        }
        run.report.record(
            &run.checkpoint,
            &format!("created {} pool(s) of {} device(s)", pool_count, devices_per_pool),
        );

        run.enter("baseline restart");
        self.restart().await?;
        self.checkpoint(run, None, pool_count).await?;

        run.enter("restart without members");
        self.stop_daemon().await?;
        for spec in &mut pools {
            for &token in spec.tokens() {
                self.devices.unplug(token).await?;
            }
            spec.reset_presented();
        }
        self.start_daemon().await?;
        self.checkpoint(run, None, 0).await?;

        let sequence = activation_sequence(&pools);
        let (partial, last) = split_final(&sequence, pool_count);

        for (position, activation) in partial.iter().enumerate() {
            run.enter(format!(
                "activation {} (pool {}, device {})",
                position, activation.pool_index, activation.device_index
            ));
            self.devices.hotplug(activation.token).await?;
            pools[activation.pool_index].mark_presented(activation.token);

            if restart_between_steps {
                self.restart().await?;
            } else {
                self.settle().await?;
            }
            self.checkpoint(run, None, 0).await?;
        }

        run.enter("final activation");
        for activation in last {
            self.devices.hotplug(activation.token).await?;
            pools[activation.pool_index].mark_presented(activation.token);
        }
        self.settle().await?;
        self.checkpoint(run, None, pool_count).await?;

        for (pool_index, spec) in pools.iter().enumerate() {
            run.enter(format!("pool {} by name", pool_index));
            self.checkpoint(run, Some(spec.name()), 1).await?;
        }
        Ok(())
    }

    async fn idempotence_steps(
        &mut self,
        run: &mut ScenarioRun,
        device_count: usize,
        duplicate_notifications: usize,
    ) -> Result<()> {
        run.enter("prepare");
        self.prepare().await?;
        self.checkpoint(run, None, 0).await?;

        run.enter("create pool");
        let mut spec = self.create_pool(device_count).await?;
        run.report.pools.push(spec.name().to_string());

        run.enter("restart without members");
        self.stop_daemon().await?;
        for &token in spec.tokens() {
            self.devices.unplug(token).await?;
        }
        spec.reset_presented();
        self.start_daemon().await?;
        self.checkpoint(run, None, 0).await?;

        run.enter("hotplug");
        let tokens = spec.tokens().to_vec();
        for &token in &tokens {
            self.devices.hotplug(token).await?;
            spec.mark_presented(token);
        }

        run.enter(format!("{} duplicate notification(s)", duplicate_notifications));
        for _ in 0..duplicate_notifications {
            for &token in &tokens {
                self.devices.generate_arrival_event(token).await?;
            }
        }
        self.settle().await?;
        self.checkpoint(run, None, 1).await?;

        run.enter("pool by name");
        self.checkpoint(run, Some(spec.name()), 1).await?;
        Ok(())
    }

    // =========================================================================
    // Steps
    // =========================================================================

    async fn checkpoint(
        &self,
        run: &mut ScenarioRun,
        name_filter: Option<&str>,
        expected: usize,
    ) -> Result<()> {
        let observed = self
            .oracle
            .assert_count(&run.checkpoint, name_filter, expected)
            .await?;
        run.report.record_count(&run.checkpoint, expected, observed);
        Ok(())
    }

    /// Create `device_count` devices and a pool over them.
    async fn create_pool(&mut self, device_count: usize) -> Result<PoolSpec> {
        let mut tokens = Vec::with_capacity(device_count);
        for _ in 0..device_count {
            tokens.push(self.devices.create_device(self.device_size_mib).await?);
        }

        let name = random_pool_name();
        let nodes = self.devices.device_nodes(&tokens)?;
        let handle = self
            .oracle
            .management()
            .create_pool(&CreatePoolRequest::new(&name, nodes))
            .await?;
        info!(pool = %handle, devices = device_count, "Created pool");

        let mut spec = PoolSpec::new(name, tokens.clone());
        for token in tokens {
            spec.mark_presented(token);
        }
        Ok(spec)
    }

    /// Drain the event queue, then give the daemon the grace delay.
    async fn settle(&self) -> Result<()> {
        self.devices.control().drain_event_queue().await?;
        if !self.settle.grace.is_zero() {
            sleep(self.settle.grace).await;
        }
        Ok(())
    }

    /// Stop any daemon this driver still runs, then clear stale state.
    pub async fn clear_stale_state(&mut self) -> Result<()> {
        if let Some(handle) = self.running.take() {
            warn!("Stopping daemon left running by a previous scenario");
            self.daemon.stop(handle).await?;
        }
        self.daemon.clear_stale_state().await
    }

    async fn prepare(&mut self) -> Result<()> {
        self.clear_stale_state().await?;
        self.start_daemon().await
    }

    async fn start_daemon(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::Daemon("daemon is already running".into()));
        }
        let handle = self.daemon.start().await?;
        self.running = Some(handle);
        wait_ready(self.oracle.management(), &self.readiness).await
    }

    async fn stop_daemon(&mut self) -> Result<()> {
        match self.running.take() {
            Some(handle) => self.daemon.stop(handle).await,
            None => Ok(()),
        }
    }

    async fn restart(&mut self) -> Result<()> {
        self.stop_daemon().await?;
        self.start_daemon().await
    }

    /// Stop the daemon and destroy every device, attempting both.
    async fn teardown(&mut self) -> Result<()> {
        let stopped = self.stop_daemon().await;
        if let Err(e) = &stopped {
            warn!(error = %e, "Failed to stop daemon during teardown");
        }
        let destroyed = self.devices.destroy_devices().await;
        if let Err(e) = &destroyed {
            warn!(error = %e, "Failed to destroy devices during teardown");
        }
        stopped.and(destroyed)
    }

    /// Tear down and remove the scratch directory.
    pub async fn shutdown(mut self) -> Result<()> {
        let stopped = self.stop_daemon().await;
        let destroyed = self.devices.destroy_all().await;
        stopped.and(destroyed)
    }

    /// Grace delay applied after each event-queue drain.
    pub fn settle_grace(&self) -> Duration {
        self.settle.grace
    }
}

fn validate(kind: ScenarioKind) -> Result<()> {
    match kind {
        ScenarioKind::Assembly {
            pool_count,
            devices_per_pool: 0,
            ..
        } if pool_count > 0 => Err(Error::Config(
            "a pool needs at least one device".into(),
        )),
        ScenarioKind::Idempotence { device_count: 0, .. } => Err(Error::Config(
            "a pool needs at least one device".into(),
        )),
        _ => Ok(()),
    }
}

impl<L, M, D: DaemonSupervisor> std::fmt::Debug for ScenarioDriver<L, M, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioDriver")
            .field("daemon_running", &self.running.is_some())
            .field("settle", &self.settle)
            .field("readiness", &self.readiness)
            .field("reports", &self.reports.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AssemblyPolicy, InMemoryDaemon, InMemoryHost};
    use assert_matches::assert_matches;

    type TestDriver = ScenarioDriver<InMemoryHost, InMemoryHost, InMemoryDaemon>;

    fn driver(host: &InMemoryHost) -> TestDriver {
        let mut config = HarnessConfig::default();
        config.settle.grace = Duration::ZERO;
        config.device_size_mib = 1;
        let devices = LoopbackDeviceManager::new(host.clone(), &config).unwrap();
        ScenarioDriver::new(devices, host.clone(), host.daemon(), &config)
    }

    #[tokio::test]
    async fn test_two_by_four_passes() {
        let host = InMemoryHost::new();
        let mut driver = driver(&host);

        let report = driver.run_scenario(2, 4, false).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.pools.len(), 2);
        // baseline, floor, 6 partial activations, final, 2 by name
        assert_eq!(report.assertions().count(), 11);
        assert!(!driver.is_daemon_running());
        assert_eq!(host.attached_count(), 0);
    }

    #[tokio::test]
    async fn test_any_member_policy_fails_first_activation() {
        let host = InMemoryHost::with_policy(AssemblyPolicy::AnyMember);
        let mut driver = driver(&host);

        let err = driver.run_scenario(2, 2, false).await.unwrap_err();
        assert_matches!(
            err,
            Error::AssemblyAssertion { expected: 0, observed: 1, ref step, .. }
                if step.starts_with("activation 0")
        );
        assert!(!host.is_daemon_running());
        assert_eq!(host.attached_count(), 0);

        let report = &driver.reports()[0];
        assert!(!report.is_success());
        assert!(report.last_step().unwrap().checkpoint.starts_with("activation 0"));
    }

    #[tokio::test]
    async fn test_zero_devices_is_config_error() {
        let host = InMemoryHost::new();
        let mut driver = driver(&host);

        assert_matches!(driver.run_scenario(1, 0, false).await, Err(Error::Config(_)));
        assert_matches!(driver.run_single_pool_idempotence(0, 1).await, Err(Error::Config(_)));
        assert!(driver.reports().is_empty());
        assert_eq!(host.stats().daemon_starts, 0);
    }

    #[tokio::test]
    async fn test_zero_pools_only_checks_empty_visibility() {
        let host = InMemoryHost::new();
        let mut driver = driver(&host);

        let report = driver.run_scenario(0, 3, false).await.unwrap();
        assert!(report.pools.is_empty());
        assert!(report.assertions().all(|s| s.observed == Some(0)));
    }

    #[tokio::test]
    async fn test_attach_failure_still_tears_down() {
        let host = InMemoryHost::new();
        let mut driver = driver(&host);

        // Let the first pool's devices attach, then break the loop layer
        let report = driver.run_scenario(1, 1, false).await.unwrap();
        assert!(report.is_success());

        host.fail_next_attach();
        assert_matches!(
            driver.run_single_pool_idempotence(2, 1).await,
            Err(Error::Device { .. })
        );
        assert!(!host.is_daemon_running());
        assert_eq!(host.attached_count(), 0);
        assert_eq!(driver.devices().len(), 0);
        assert_eq!(driver.reports().len(), 2);
    }
}
