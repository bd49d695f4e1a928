//! Management CLI Adapter
//!
//! Implements the `ManagementInterface` port by driving the daemon's command
//! line client.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::command::{run_tool, ToolOutput};
use crate::domain::{CreatePoolRequest, ManagementInterface, PoolHandle};
use crate::error::{Error, Result};

/// Markers of a daemon that is not on the bus (yet).
const NOT_CONNECTED_MARKERS: &[&str] = &[
    "serviceunknown",
    "namehasnoowner",
    "connection refused",
    "could not connect",
    "failed to connect",
];

/// CLI-backed management client.
#[derive(Debug, Clone)]
pub struct CliManagementClient {
    cli: PathBuf,
}

impl CliManagementClient {
    pub fn new(cli: impl Into<PathBuf>) -> Self {
        Self { cli: cli.into() }
    }

    async fn invoke(&self, args: &[&str]) -> Result<String> {
        let output = run_tool(&self.cli, args)
            .await
            .map_err(|e| Error::Management(format!("{}: {}", self.cli.display(), e)))?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify_failure(&output))
        }
    }
}

/// Map a failed CLI run onto `NotConnected` or `Management`.
fn classify_failure(output: &ToolOutput) -> Error {
    let text = format!("{}\n{}", output.stderr, output.stdout).to_lowercase();
    let reason = format!("{}: {}", output.command, output.failure_reason());
    if NOT_CONNECTED_MARKERS.iter().any(|m| text.contains(m)) {
        Error::NotConnected(reason)
    } else {
        Error::Management(reason)
    }
}

/// Pool names from `pool list` output: first column of every row after the
/// header.
fn parse_pool_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_owned)
        .collect()
}

#[async_trait]
impl ManagementInterface for CliManagementClient {
    #[instrument(skip(self), fields(pool = %request.name))]
    async fn create_pool(&self, request: &CreatePoolRequest) -> Result<PoolHandle> {
        let mut args = vec!["pool", "create"];
        if request.force {
            args.push("--force");
        }
        args.push(&request.name);
        args.extend(request.devices.iter().map(String::as_str));

        self.invoke(&args).await?;
        debug!(devices = request.devices.len(), "pool created");
        Ok(PoolHandle::new(&request.name))
    }

    async fn list_pools(&self, name_filter: Option<&str>) -> Result<Vec<PoolHandle>> {
        let stdout = self.invoke(&["pool", "list"]).await?;
        Ok(parse_pool_list(&stdout)
            .into_iter()
            .filter(|name| name_filter.map_or(true, |f| f == name.as_str()))
            .map(PoolHandle::new)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn failed(stderr: &str) -> ToolOutput {
        ToolOutput {
            command: "stratis pool list".into(),
            status: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn test_parse_pool_list_skips_header() {
        let out = "Name            Total / Used / Free    Properties   UUID   Alerts\n\
                   stratis_ABCDE   8 GiB / 0.5 GiB       ~Ca,~Cr      1a2b\n\
                   stratis_FGHIJ   8 GiB / 0.5 GiB       ~Ca,~Cr      3c4d\n";
        assert_eq!(
            parse_pool_list(out),
            vec!["stratis_ABCDE".to_string(), "stratis_FGHIJ".to_string()]
        );
        assert!(parse_pool_list("Name  Total  Properties\n").is_empty());
        assert!(parse_pool_list("").is_empty());
    }

    #[test]
    fn test_classify_failure() {
        assert_matches!(
            classify_failure(&failed(
                "org.freedesktop.DBus.Error.ServiceUnknown: name not activatable"
            )),
            Error::NotConnected(_)
        );
        assert_matches!(
            classify_failure(&failed("Pool name already in use")),
            Error::Management(_)
        );
    }

    #[tokio::test]
    async fn test_missing_cli_is_management_error() {
        let client = CliManagementClient::new("/nonexistent/stratis");
        assert_matches!(client.list_pools(None).await, Err(Error::Management(_)));
    }

    #[tokio::test]
    async fn test_list_pools_from_silent_cli_is_empty() {
        let client = CliManagementClient::new("true");
        assert!(client.list_pools(None).await.unwrap().is_empty());
    }
}
