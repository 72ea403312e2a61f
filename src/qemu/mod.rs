// Hypervisor process management: command-line construction, child
// supervision, QMP control channel.
pub mod config;
pub mod controller;
pub mod qmp;

pub use config::{DriveSpec, QemuSpec};
pub use qmp::{QmpClient, QmpSession};
