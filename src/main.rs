//! Hotplug Harness
//!
//! Runs pool assembly scenarios against a storage daemon using loopback
//! devices, the device-event queue and the daemon's management CLI.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Hotplug Harness                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Loopback   │◀───│   Scenario   │───▶│   Assembly   │       │
//! │  │   Devices    │    │    Driver    │    │    Oracle    │       │
//! │  └──────────────┘    └──────┬───────┘    └──────────────┘       │
//! │                             ▼                                    │
//! │                      ┌──────────────┐                            │
//! │                      │    Daemon    │                            │
//! │                      │  Controller  │                            │
//! │                      └──────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hotplug_harness::adapters::{CliManagementClient, LosetupLoopControl};
use hotplug_harness::config::HarnessArgs;
use hotplug_harness::daemon::DaemonController;
use hotplug_harness::domain::DaemonSupervisor;
use hotplug_harness::scenario::{self, ScenarioDriver, ScenarioKind, ScenarioReport};
use hotplug_harness::LoopbackDeviceManager;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Hotplug Harness - incremental pool assembly checks for a storage daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    harness: HarnessArgs,

    /// Write every scenario report to this file as JSON
    #[arg(long, env = "HARNESS_REPORT")]
    report: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Interleaved activation over several multi-device pools
    Assembly {
        #[arg(long, default_value_t = 2)]
        pools: usize,
        #[arg(long, default_value_t = 4)]
        devices_per_pool: usize,
        /// Restart the daemon after each partial activation instead of settling
        #[arg(long)]
        restart: bool,
    },
    /// One pool flooded with redundant arrival notifications
    Idempotence {
        #[arg(long, default_value_t = 16)]
        device_count: usize,
        #[arg(long, default_value_t = 1)]
        duplicates: usize,
    },
    /// Every pool count up to --max-pools with every device count up to --max-devices
    Combinations {
        #[arg(long, default_value_t = 2)]
        max_pools: usize,
        #[arg(long, default_value_t = 3)]
        max_devices: usize,
    },
    /// 2 pools x 4 devices with daemon restarts between activations
    Existing,
    /// 16 devices arriving together
    Simultaneous,
    /// 16 devices with 3 spurious arrival notifications each
    Spurious,
    /// All named runs in order
    Suite,
    /// Kill stray daemon instances and remove leftover device-mapper tables
    Cleanup,
}

impl Command {
    fn scenarios(self) -> Vec<ScenarioKind> {
        match self {
            Command::Assembly {
                pools,
                devices_per_pool,
                restart,
            } => vec![ScenarioKind::Assembly {
                pool_count: pools,
                devices_per_pool,
                restart_between_steps: restart,
            }],
            Command::Idempotence {
                device_count,
                duplicates,
            } => vec![ScenarioKind::Idempotence {
                device_count,
                duplicate_notifications: duplicates,
            }],
            Command::Combinations {
                max_pools,
                max_devices,
            } => scenario::combinations(0..=max_pools, 1..=max_devices),
            Command::Existing => vec![scenario::existing()],
            Command::Simultaneous => vec![scenario::simultaneous()],
            Command::Spurious => vec![scenario::spurious()],
            Command::Suite => scenario::suite(),
            Command::Cleanup => Vec::new(),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args
        .harness
        .clone()
        .into_config()
        .context("invalid harness configuration")?;

    info!("Starting Hotplug Harness");
    info!("  Daemon: {}", config.daemon_path.display());
    info!("  Device size: {} MiB", config.device_size_mib);
    info!("  Settle grace: {:?}", config.settle.grace);

    let mut daemon = DaemonController::for_loopback(&config);
    info!("  Backend mode: {}", daemon.mode());

    if let Command::Cleanup = args.command {
        daemon
            .clear_stale_state()
            .await
            .context("stale state cleanup failed")?;
        info!("Cleanup complete");
        return Ok(());
    }

    let control = LosetupLoopControl::new(&config.tools);
    let mgmt = CliManagementClient::new(config.tools.management_cli.clone());
    let devices = LoopbackDeviceManager::new(control, &config)
        .context("failed to create scratch directory")?;

    let mut driver = ScenarioDriver::new(devices, mgmt, daemon, &config);
    let reports = driver.run_all(&args.command.scenarios()).await;

    if let Err(e) = driver.shutdown().await {
        warn!("Harness shutdown incomplete: {}", e);
    }

    print_summary(&reports);
    if let Some(path) = &args.report {
        write_reports(path, &reports)?;
        info!("Reports written to {}", path.display());
    }

    let failed = reports.iter().filter(|r| !r.is_success()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} scenario(s) failed", failed, reports.len());
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Reporting
// =============================================================================

fn print_summary(reports: &[ScenarioReport]) {
    for report in reports {
        match &report.error {
            Some(error) => println!(
                "{:<7} {} ({:?}): {}",
                report.outcome, report.scenario, report.duration, error
            ),
            None => println!(
                "{:<7} {} ({:?})",
                report.outcome, report.scenario, report.duration
            ),
        }
    }
}

fn write_reports(path: &Path, reports: &[ScenarioReport]) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(reports).context("failed to serialize reports")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}
