//! Loopback Device Management
//!
//! Ephemeral block devices built from sparse backing files, addressed by
//! stable [`DeviceToken`](crate::domain::DeviceToken)s.

mod manager;

pub use manager::{DeviceBinding, DeviceCounters, LoopbackDeviceManager, MIB};
