//! Harness Configuration
//!
//! All environment-derived settings are read once, at process start, into a
//! [`HarnessConfig`] that is passed by reference to every component.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};

/// Default size of every simulated device, in MiB.
pub const DEFAULT_DEVICE_SIZE_MIB: u64 = 2048;

// =============================================================================
// Backend Mode
// =============================================================================

/// Which engine the daemon is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// In-daemon simulated engine (`--sim`)
    Simulated,
    /// Real device engine (`--debug`)
    Real,
}

impl BackendMode {
    /// Launch flag passed to the daemon for this mode.
    pub fn daemon_flag(&self) -> &'static str {
        match self {
            BackendMode::Simulated => "--sim",
            BackendMode::Real => "--debug",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendMode::Simulated => write!(f, "sim"),
            BackendMode::Real => write!(f, "real"),
        }
    }
}

impl FromStr for BackendMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sim" | "simulator" | "simulated" => Ok(BackendMode::Simulated),
            "real" => Ok(BackendMode::Real),
            other => Err(Error::Config(format!(
                "unknown backend mode '{}', expected 'sim' or 'real'",
                other
            ))),
        }
    }
}

// =============================================================================
// Policies
// =============================================================================

/// Bounded poll used while waiting for the daemon to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadinessPolicy {
    /// Upper bound on the whole wait
    pub timeout: Duration,
    /// Delay between attempts
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(100),
        }
    }
}

/// Grace delay applied after the event queue has drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SettlePolicy {
    pub grace: Duration,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(1),
        }
    }
}

/// External tools the harness shells out to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolPaths {
    pub losetup: PathBuf,
    pub udevadm: PathBuf,
    pub dmsetup: PathBuf,
    pub pkill: PathBuf,
    pub management_cli: PathBuf,
    /// Directory holding per-device `uevent` files
    pub sysfs_block: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            losetup: PathBuf::from("losetup"),
            udevadm: PathBuf::from("udevadm"),
            dmsetup: PathBuf::from("/usr/sbin/dmsetup"),
            pkill: PathBuf::from("pkill"),
            management_cli: PathBuf::from("stratis"),
            sysfs_block: PathBuf::from("/sys/class/block"),
        }
    }
}

// =============================================================================
// Harness Configuration
// =============================================================================

/// Configuration shared by every harness component.
#[derive(Debug, Clone, Serialize)]
pub struct HarnessConfig {
    /// Engine the daemon runs
    pub mode: BackendMode,
    /// Daemon executable
    pub daemon_path: PathBuf,
    /// Real devices, only meaningful in real-backend mode
    pub devices: Vec<PathBuf>,
    /// Parent of the scratch directory (system temp dir when absent)
    pub scratch_root: Option<PathBuf>,
    /// Size of each loopback device in MiB
    pub device_size_mib: u64,
    pub tools: ToolPaths,
    pub readiness: ReadinessPolicy,
    pub settle: SettlePolicy,
    /// How long a SIGTERM'd daemon gets before it is killed
    pub stop_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::Simulated,
            daemon_path: PathBuf::from("stratisd"),
            devices: Vec::new(),
            scratch_root: None,
            device_size_mib: DEFAULT_DEVICE_SIZE_MIB,
            tools: ToolPaths::default(),
            readiness: ReadinessPolicy::default(),
            settle: SettlePolicy::default(),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl HarnessConfig {
    /// Reject settings that would make a scenario meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.device_size_mib == 0 {
            return Err(Error::Config("device size must be greater than 0".into()));
        }
        if self.device_size_mib.checked_mul(1 << 20).is_none() {
            return Err(Error::Config(format!(
                "device size of {} MiB does not fit in bytes",
                self.device_size_mib
            )));
        }
        if self.readiness.interval.is_zero() {
            return Err(Error::Config("readiness interval must be non-zero".into()));
        }
        if self.readiness.interval > self.readiness.timeout {
            return Err(Error::Config(format!(
                "readiness interval {:?} exceeds timeout {:?}",
                self.readiness.interval, self.readiness.timeout
            )));
        }
        if self.mode == BackendMode::Simulated && !self.devices.is_empty() {
            tracing::warn!(
                count = self.devices.len(),
                "real device list ignored in simulated backend mode"
            );
        }
        Ok(())
    }

    /// Real devices, empty unless running against the real backend.
    pub fn real_devices(&self) -> &[PathBuf] {
        match self.mode {
            BackendMode::Real => &self.devices,
            BackendMode::Simulated => &[],
        }
    }
}

// =============================================================================
// CLI / Environment
// =============================================================================

/// Environment-backed command line options that build a [`HarnessConfig`].
#[derive(clap::Args, Debug, Clone)]
pub struct HarnessArgs {
    /// Backend mode (sim or real)
    #[arg(long, env = "STRATIS_TEST_MODE", default_value = "sim")]
    pub mode: String,

    /// Path to the daemon executable
    #[arg(long, env = "STRATISD", default_value = "stratisd")]
    pub daemon: PathBuf,

    /// Real devices (comma separated, real mode only)
    #[arg(long, env = "STRATIS_DEVICES", value_delimiter = ',')]
    pub devices: Vec<PathBuf>,

    /// Device attach tool
    #[arg(long, env = "LOSETUP_BIN", default_value = "losetup")]
    pub losetup: PathBuf,

    /// Event queue drain tool
    #[arg(long, env = "UDEVADM_BIN", default_value = "udevadm")]
    pub udevadm: PathBuf,

    /// Device-mapper tool
    #[arg(long, env = "STRATIS_DMSETUP_BIN", default_value = "/usr/sbin/dmsetup")]
    pub dmsetup: PathBuf,

    /// Management CLI
    #[arg(long, env = "STRATIS_CLI", default_value = "stratis")]
    pub management_cli: PathBuf,

    /// Parent directory for backing files
    #[arg(long, env = "HARNESS_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Size of each loopback device in MiB
    #[arg(long, env = "HARNESS_DEVICE_SIZE_MIB", default_value_t = DEFAULT_DEVICE_SIZE_MIB)]
    pub device_size_mib: u64,

    /// Grace delay after the event queue drains (ms)
    #[arg(long, env = "HARNESS_SETTLE_GRACE_MS", default_value = "1000")]
    pub settle_grace_ms: u64,

    /// Daemon readiness budget (ms)
    #[arg(long, env = "HARNESS_READY_TIMEOUT_MS", default_value = "10000")]
    pub ready_timeout_ms: u64,

    /// Delay between readiness attempts (ms)
    #[arg(long, env = "HARNESS_READY_INTERVAL_MS", default_value = "100")]
    pub ready_interval_ms: u64,
}

impl HarnessArgs {
    /// Build and validate the harness configuration.
    pub fn into_config(self) -> Result<HarnessConfig> {
        let config = HarnessConfig {
            mode: self.mode.parse()?,
            daemon_path: self.daemon,
            devices: self.devices,
            scratch_root: self.scratch_dir,
            device_size_mib: self.device_size_mib,
            tools: ToolPaths {
                losetup: self.losetup,
                udevadm: self.udevadm,
                dmsetup: self.dmsetup,
                management_cli: self.management_cli,
                ..ToolPaths::default()
            },
            readiness: ReadinessPolicy {
                timeout: Duration::from_millis(self.ready_timeout_ms),
                interval: Duration::from_millis(self.ready_interval_ms),
            },
            settle: SettlePolicy {
                grace: Duration::from_millis(self.settle_grace_ms),
            },
            ..HarnessConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}
