//! Daemon Supervision
//!
//! Process control for the daemon under test and the readiness wait that
//! follows every start.

mod controller;
mod readiness;

pub use controller::{DaemonController, DaemonProcess};
pub use readiness::wait_ready;
