//! Synchronous invocation of external tools.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::trace;

/// Captured result of one tool run.
#[derive(Debug, Clone)]
pub(crate) struct ToolOutput {
    /// Rendered command line, for error messages
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Best description of why the tool failed.
    pub fn failure_reason(&self) -> String {
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        match self.status {
            Some(code) => format!("exit status {}: {}", code, detail),
            None => format!("terminated by signal: {}", detail),
        }
    }
}

/// Run `program` with `args` to completion, capturing its output.
pub(crate) async fn run_tool<I, S>(program: &Path, args: I) -> std::io::Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let command = std::iter::once(program.as_os_str())
        .chain(args.iter().map(|a| a.as_os_str()))
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");

    trace!(command = %command, "running tool");
    let output = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await?;

    Ok(ToolOutput {
        command,
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_tool_captures_status() {
        let ok = run_tool(Path::new("true"), ["ignored"]).await.unwrap();
        assert!(ok.success());
        assert_eq!(ok.command, "true ignored");

        let failed = run_tool(Path::new("false"), Vec::<String>::new()).await.unwrap();
        assert!(!failed.success());
        assert!(failed.failure_reason().starts_with("exit status 1"));
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        assert!(run_tool(Path::new("/nonexistent/tool"), ["x"]).await.is_err());
    }
}
