//! Sandbox provisioning and reconciliation.
//!
//! `driver` is a thin, stateless adapter over a local container-runtime CLI
//! (`docker` by default). `controller` owns the reconciliation loop that
//! drives jobs from `queued` to a terminal status by watching the Store and
//! the driver and closing the gap between them every tick.

pub mod controller;
pub mod driver;

pub use controller::{Controller, ControllerConfig};
pub use driver::{SandboxDriver, SandboxDriverConfig, SandboxError, SandboxInfo, SandboxStatus};
