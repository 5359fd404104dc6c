//! HTTP surface for the CI service: job submission, log streaming, and
//! job/user listing, backed by the `store`, `sandbox`, and `auth` crates.

pub mod middleware;
pub mod server;
pub mod telemetry;
