//! Loop Device Adapter
//!
//! Implements the `LoopControl` port with `losetup`, sysfs `uevent` writes
//! and `udevadm settle`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::command::run_tool;
use crate::config::ToolPaths;
use crate::domain::LoopControl;
use crate::error::{Error, Result};

/// Token written to a device's `uevent` file to raise an "add" event.
const ADD_EVENT: &str = "add";

/// `losetup`-backed loop device control.
#[derive(Debug, Clone)]
pub struct LosetupLoopControl {
    losetup: PathBuf,
    udevadm: PathBuf,
    sysfs_block: PathBuf,
}

impl LosetupLoopControl {
    pub fn new(tools: &ToolPaths) -> Self {
        Self {
            losetup: tools.losetup.clone(),
            udevadm: tools.udevadm.clone(),
            sysfs_block: tools.sysfs_block.clone(),
        }
    }

    /// Path of the `uevent` file for a device node such as `/dev/loop3`.
    fn uevent_path(&self, device_node: &str) -> Result<PathBuf> {
        let name = Path::new(device_node)
            .file_name()
            .ok_or_else(|| Error::device("uevent", format!("bad device node {}", device_node)))?;
        Ok(self.sysfs_block.join(name).join("uevent"))
    }

    async fn run_checked(&self, program: &Path, args: &[&str]) -> Result<String> {
        let output = run_tool(program, args).await.map_err(|e| {
            Error::device(format!("{} {}", program.display(), args.join(" ")), e.to_string())
        })?;
        if !output.success() {
            return Err(Error::device(output.command.clone(), output.failure_reason()));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl LoopControl for LosetupLoopControl {
    #[instrument(skip(self))]
    async fn attach(&self, backing_file: &Path) -> Result<String> {
        let file = backing_file.to_string_lossy();
        let stdout = self
            .run_checked(&self.losetup, &["-f", "--show", &*file])
            .await?;
        let node = stdout.trim().to_string();
        if node.is_empty() {
            return Err(Error::device(
                format!("{} -f --show {}", self.losetup.display(), file),
                "no device node reported",
            ));
        }
        debug!(node = %node, "attached loop device");
        Ok(node)
    }

    #[instrument(skip(self))]
    async fn detach(&self, device_node: &str) -> Result<()> {
        self.run_checked(&self.losetup, &["-d", device_node]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn notify_arrival(&self, device_node: &str) -> Result<()> {
        let path = self.uevent_path(device_node)?;
        tokio::fs::write(&path, ADD_EVENT).await.map_err(|e| {
            Error::device(format!("write {} to {}", ADD_EVENT, path.display()), e.to_string())
        })
    }

    async fn drain_event_queue(&self) -> Result<()> {
        self.run_checked(&self.udevadm, &["settle"]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn control(losetup: &str, udevadm: &str, sysfs: &Path) -> LosetupLoopControl {
        LosetupLoopControl::new(&ToolPaths {
            losetup: PathBuf::from(losetup),
            udevadm: PathBuf::from(udevadm),
            sysfs_block: sysfs.to_path_buf(),
            ..ToolPaths::default()
        })
    }

    #[tokio::test]
    async fn test_notify_arrival_writes_add_token() {
        let sysfs = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(sysfs.path().join("loop3")).unwrap();
        let ctl = control("losetup", "udevadm", sysfs.path());

        ctl.notify_arrival("/dev/loop3").await.unwrap();

        let written = std::fs::read_to_string(sysfs.path().join("loop3/uevent")).unwrap();
        assert_eq!(written, "add");
    }

    #[tokio::test]
    async fn test_notify_arrival_for_missing_device_fails() {
        let sysfs = tempfile::TempDir::new().unwrap();
        let ctl = control("losetup", "udevadm", sysfs.path());
        assert_matches!(
            ctl.notify_arrival("/dev/loop9").await,
            Err(Error::Device { .. })
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_device_error() {
        let sysfs = tempfile::TempDir::new().unwrap();
        let ctl = control("false", "false", sysfs.path());

        assert_matches!(ctl.detach("/dev/loop0").await, Err(Error::Device { .. }));
        assert_matches!(ctl.drain_event_queue().await, Err(Error::Device { .. }));
    }

    #[tokio::test]
    async fn test_successful_tools() {
        let sysfs = tempfile::TempDir::new().unwrap();
        let ctl = control("true", "true", sysfs.path());

        ctl.detach("/dev/loop0").await.unwrap();
        ctl.drain_event_queue().await.unwrap();
        // `true` prints nothing, so no node can be reported
        assert_matches!(
            ctl.attach(Path::new("/tmp/backing.img")).await,
            Err(Error::Device { .. })
        );
    }
}
