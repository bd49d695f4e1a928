//! Scenario reports.
//!
//! Every run keeps a timestamped step log. Failed runs keep the error text and
//! the step it happened at, so the first failure can be located without
//! rerunning.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Which scenario a report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioKind {
    /// Interleaved multi-pool activation
    Assembly {
        pool_count: usize,
        devices_per_pool: usize,
        restart_between_steps: bool,
    },
    /// One pool flooded with redundant arrival notifications
    Idempotence {
        device_count: usize,
        duplicate_notifications: usize,
    },
}

impl std::fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioKind::Assembly {
                pool_count,
                devices_per_pool,
                restart_between_steps,
            } => write!(
                f,
                "assembly({} pools x {} devices{})",
                pool_count,
                devices_per_pool,
                if *restart_between_steps { ", restarts" } else { "" }
            ),
            ScenarioKind::Idempotence {
                device_count,
                duplicate_notifications,
            } => write!(
                f,
                "idempotence({} devices, {} duplicates)",
                device_count, duplicate_notifications
            ),
        }
    }
}

/// Final state of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScenarioOutcome {
    Running,
    Passed,
    Failed,
}

impl std::fmt::Display for ScenarioOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioOutcome::Running => f.pad("RUNNING"),
            ScenarioOutcome::Passed => f.pad("PASSED"),
            ScenarioOutcome::Failed => f.pad("FAILED"),
        }
    }
}

/// A step in a scenario run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioStep {
    pub checkpoint: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Expected pool count, for assertion steps
    pub expected: Option<usize>,
    /// Observed pool count, for assertion steps
    pub observed: Option<usize>,
    pub duration_ms: Option<u64>,
}

/// Result of one scenario run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: ScenarioKind,

    pub outcome: ScenarioOutcome,

    /// Names of the pools the scenario created
    pub pools: Vec<String>,

    pub start_time: DateTime<Utc>,

    pub end_time: DateTime<Utc>,

    /// Total duration
    pub duration: Duration,

    /// Error if failed
    pub error: Option<String>,

    /// Step-by-step log
    pub steps: Vec<ScenarioStep>,
}

impl ScenarioReport {
    pub fn new(scenario: ScenarioKind) -> Self {
        let now = Utc::now();
        Self {
            scenario,
            outcome: ScenarioOutcome::Running,
            pools: Vec::new(),
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
            error: None,
            steps: vec![],
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ScenarioOutcome::Passed
    }

    /// Checkpoints whose observed count was recorded.
    pub fn assertions(&self) -> impl Iterator<Item = &ScenarioStep> {
        self.steps.iter().filter(|s| s.observed.is_some())
    }

    /// Most recent step, the failing one for a failed report.
    pub fn last_step(&self) -> Option<&ScenarioStep> {
        self.steps.last()
    }

    /// Record a step without a pool count.
    pub(crate) fn record(&mut self, checkpoint: &str, message: &str) {
        self.push(checkpoint, message, None, None);
    }

    /// Record a passed pool-count assertion.
    pub(crate) fn record_count(&mut self, checkpoint: &str, expected: usize, observed: usize) {
        let message = format!("{} pool(s) visible", observed);
        self.push(checkpoint, &message, Some(expected), Some(observed));
    }

    pub(crate) fn pass(&mut self) {
        self.push("done", "scenario passed", None, None);
        self.outcome = ScenarioOutcome::Passed;
    }

    pub(crate) fn fail(&mut self, checkpoint: &str, error: &crate::error::Error) {
        let (expected, observed) = match error {
            crate::error::Error::AssemblyAssertion {
                expected, observed, ..
            } => (Some(*expected), Some(*observed)),
            _ => (None, None),
        };
        let message = error.to_string();
        self.push(checkpoint, &message, expected, observed);
        self.outcome = ScenarioOutcome::Failed;
        self.error = Some(message);
    }

    fn push(
        &mut self,
        checkpoint: &str,
        message: &str,
        expected: Option<usize>,
        observed: Option<usize>,
    ) {
        let now = Utc::now();
        let last_step_time = self
            .steps
            .last()
            .map(|s| s.timestamp)
            .unwrap_or(self.start_time);
        let duration_ms = (now - last_step_time).num_milliseconds().max(0) as u64;

        self.steps.push(ScenarioStep {
            checkpoint: checkpoint.to_string(),
            timestamp: now,
            message: message.to_string(),
            expected,
            observed,
            duration_ms: Some(duration_ms),
        });

        self.end_time = now;
        self.duration = (now - self.start_time).to_std().unwrap_or(Duration::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn kind() -> ScenarioKind {
        ScenarioKind::Assembly {
            pool_count: 2,
            devices_per_pool: 4,
            restart_between_steps: false,
        }
    }

    #[test]
    fn test_report_pass() {
        let mut report = ScenarioReport::new(kind());
        assert_eq!(report.outcome, ScenarioOutcome::Running);

        report.record("setup", "created 8 devices");
        report.record_count("baseline", 2, 2);
        report.pass();

        assert!(report.is_success());
        assert_eq!(report.steps.len(), 3);
        assert_eq!(report.assertions().count(), 1);
        assert!(report.error.is_none());
        assert!(report.end_time >= report.start_time);
    }

    #[test]
    fn test_report_fail_keeps_counts() {
        let mut report = ScenarioReport::new(kind());
        let err = Error::AssemblyAssertion {
            step: "activation 3".into(),
            filter: None,
            expected: 0,
            observed: 1,
        };
        report.fail("activation 3", &err);

        assert!(!report.is_success());
        let last = report.last_step().unwrap();
        assert_eq!(last.checkpoint, "activation 3");
        assert_eq!((last.expected, last.observed), (Some(0), Some(1)));
        assert!(report.error.as_deref().unwrap().contains("activation 3"));
    }

    #[test]
    fn test_report_serializes() {
        let mut report = ScenarioReport::new(ScenarioKind::Idempotence {
            device_count: 16,
            duplicate_notifications: 3,
        });
        report.pass();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["scenario"]["kind"], "idempotence");
        assert_eq!(json["scenario"]["duplicate_notifications"], 3);
        assert_eq!(json["outcome"], "Passed");
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(kind().to_string(), "assembly(2 pools x 4 devices)");
    }
}
