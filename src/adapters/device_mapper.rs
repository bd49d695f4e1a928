//! Device-Mapper Cleanup
//!
//! Best-effort removal of device-mapper tables left behind by a previous
//! daemon instance.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::command::run_tool;
use crate::error::Result;

/// Prefix of every table the daemon creates.
pub const STRATIS_DM_PREFIX: &str = "stratis-";

/// Passes allowed per table before giving up.
const PASSES_PER_TABLE: usize = 5;

/// Removes leftover device-mapper tables with `dmsetup`.
#[derive(Debug, Clone)]
pub struct DeviceMapperCleaner {
    dmsetup: PathBuf,
    prefix: String,
}

impl DeviceMapperCleaner {
    pub fn new(dmsetup: impl Into<PathBuf>) -> Self {
        Self {
            dmsetup: dmsetup.into(),
            prefix: STRATIS_DM_PREFIX.to_string(),
        }
    }

    /// Tables whose names start with the daemon prefix.
    pub async fn list(&self) -> Result<Vec<String>> {
        let output = match run_tool(&self.dmsetup, ["ls"]).await {
            Ok(output) => output,
            Err(e) => {
                warn!(dmsetup = %self.dmsetup.display(), error = %e, "dmsetup unavailable");
                return Ok(Vec::new());
            }
        };
        if !output.success() {
            debug!(reason = %output.failure_reason(), "dmsetup ls failed");
            return Ok(Vec::new());
        }
        Ok(select_tables(&output.stdout, &self.prefix))
    }

    async fn remove(&self, table: &str) -> Result<bool> {
        let output = run_tool(&self.dmsetup, ["remove", table]).await?;
        Ok(output.success())
    }

    /// Remove every daemon table, retrying because tables depend on each
    /// other and only come off once their dependents are gone.
    ///
    /// Returns the tables that could not be removed.
    pub async fn remove_all(&self) -> Result<Vec<String>> {
        let mut remaining = self.list().await?;
        let max_passes = remaining.len() * PASSES_PER_TABLE;
        let mut passes = 0;

        while !remaining.is_empty() && passes <= max_passes {
            passes += 1;
            let mut still_there = Vec::with_capacity(remaining.len());
            for table in remaining {
                if self.remove(&table).await? {
                    debug!(table = %table, "removed device-mapper table");
                } else {
                    still_there.push(table);
                }
            }
            remaining = still_there;
        }

        if remaining.is_empty() {
            info!(passes, "device-mapper state clean");
        } else {
            warn!(?remaining, passes, "device-mapper tables left behind");
        }
        Ok(remaining)
    }
}

/// Pick the whitespace separated words of `dmsetup ls` output that carry
/// `prefix`.
fn select_tables(listing: &str, prefix: &str) -> Vec<String> {
    listing
        .split_whitespace()
        .filter(|word| word.starts_with(prefix))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_tables() {
        let listing = "stratis-1-private-abc-thinpool\t(253:4)\n\
                       fedora-root\t(253:0)\n\
                       stratis-1-abc-flex-mdv\t(253:1)\n";
        assert_eq!(
            select_tables(listing, STRATIS_DM_PREFIX),
            vec![
                "stratis-1-private-abc-thinpool".to_string(),
                "stratis-1-abc-flex-mdv".to_string()
            ]
        );
        assert!(select_tables("No devices found\n", STRATIS_DM_PREFIX).is_empty());
    }

    #[tokio::test]
    async fn test_failed_listing_means_nothing_to_remove() {
        let cleaner = DeviceMapperCleaner::new("false");
        assert!(cleaner.list().await.unwrap().is_empty());
        assert!(cleaner.remove_all().await.unwrap().is_empty());

        let missing = DeviceMapperCleaner::new("/nonexistent/dmsetup");
        assert!(missing.remove_all().await.unwrap().is_empty());
    }
}
