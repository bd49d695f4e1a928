//! Assembly Scenarios
//!
//! Pool expectations, the interleaved activation order, the driver that
//! plays scenarios against a daemon, and the reports it produces.
//!
//! The named runs below make up the standard suite:
//!
//! | run            | scenario                                 |
//! |----------------|------------------------------------------|
//! | `combinations` | assembly, 0..=2 pools x 1..=3 devices    |
//! | `existing`     | assembly, 2 pools x 4 devices, restarts  |
//! | `simultaneous` | idempotence, 16 devices, 1 duplicate     |
//! | `spurious`     | idempotence, 16 devices, 3 duplicates    |

mod driver;
mod pool_spec;
mod report;
mod sequence;

use std::ops::RangeInclusive;

pub use driver::ScenarioDriver;
pub use pool_spec::{random_pool_name, PoolSpec};
pub use report::{ScenarioKind, ScenarioOutcome, ScenarioReport, ScenarioStep};
pub use sequence::{activation_sequence, split_final, Activation};

/// Assembly scenarios over every pool count and device count in the ranges.
pub fn combinations(
    pools: RangeInclusive<usize>,
    devices: RangeInclusive<usize>,
) -> Vec<ScenarioKind> {
    pools
        .flat_map(|pool_count| {
            devices.clone().map(move |devices_per_pool| ScenarioKind::Assembly {
                pool_count,
                devices_per_pool,
                restart_between_steps: false,
            })
        })
        .collect()
}

/// Default combinations: up to 2 pools of up to 3 devices.
pub fn default_combinations() -> Vec<ScenarioKind> {
    combinations(0..=2, 1..=3)
}

/// Devices arrive while the daemon is restarted between steps.
pub fn existing() -> ScenarioKind {
    ScenarioKind::Assembly {
        pool_count: 2,
        devices_per_pool: 4,
        restart_between_steps: true,
    }
}

/// Sixteen devices arriving together.
pub fn simultaneous() -> ScenarioKind {
    ScenarioKind::Idempotence {
        device_count: 16,
        duplicate_notifications: 1,
    }
}

/// Sixteen devices with a storm of spurious arrival notifications.
pub fn spurious() -> ScenarioKind {
    ScenarioKind::Idempotence {
        device_count: 16,
        duplicate_notifications: 3,
    }
}

/// Every named run, in order.
pub fn suite() -> Vec<ScenarioKind> {
    let mut kinds = default_combinations();
    kinds.extend([existing(), simultaneous(), spurious()]);
    kinds
}
