//! Shared domain model for the ZaneOps deployment engine.
//!
//! Everything here is plain data: deployment statuses and slots, the
//! immutable service snapshot embedded in every deployment, the change
//! records attached to it, and the deterministic resource-name generators
//! used as cross-process handles by the orchestrator and the proxy.

pub mod change;
pub mod deployment;
pub mod names;
pub mod service;

pub use change::{ChangeField, ChangeType, DeploymentChange};
pub use deployment::{DeploymentSlot, DeploymentStatus};
pub use service::ServiceSnapshot;

/// Default overall budget for a first-time healthcheck, in seconds.
pub const DEFAULT_HEALTHCHECK_TIMEOUT: u64 = 30;

/// Default poll interval between healthcheck attempts, in seconds.
pub const DEFAULT_HEALTHCHECK_WAIT_INTERVAL: u64 = 5;

/// Private DNS zone that blue/green slot aliases resolve in.
pub const DEFAULT_INTERNAL_DOMAIN: &str = "zaneops.internal";
