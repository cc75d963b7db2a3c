use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use ulid::Ulid;

/// States a deployment can be in.
///
/// `Failed`, `Removed` and `Cancelled` are terminal. `Healthy` and
/// `Sleeping` toggle into each other; everything else moves forward only.
#[derive(
    sqlx::Type,
    Debug,
    Default,
    Display,
    Clone,
    Copy,
    EnumString,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    /// Enqueued, waiting for the per-service workflow to pick it up
    #[default]
    Queued,

    /// The workflow has claimed the deployment and is mutating state
    Preparing,

    /// The swarm task exists but is not running yet
    Starting,

    /// More than one concurrent task was observed for the deployment
    Restarting,

    /// The task is running and the custom probe (if any) passes
    Healthy,

    /// The task failed, was rejected, or the probe did not pass
    Unhealthy,

    /// Final status of a rollout that never became healthy
    Failed,

    /// The deployment's swarm service has been torn down
    Removed,

    /// Scaled to zero on purpose; toggles back to `Healthy`
    Sleeping,

    /// Cancelled before any orchestrator state was touched
    Cancelled,
}

impl DeploymentStatus {
    /// A terminal status is never written over by the monitor schedule.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Removed | Self::Cancelled)
    }

    /// Statuses a crashed or queued workflow run may resume from.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::Preparing | Self::Starting | Self::Restarting)
    }

    /// Whether the deployment has ever had a swarm task observed for it.
    /// Used by the evaluator: zero tasks for a deployment in one of these
    /// states means someone scaled the service down behind our back.
    pub fn has_started(&self) -> bool {
        matches!(self, Self::Healthy | Self::Starting | Self::Restarting)
    }
}

/// One of the two DNS-addressable upstream pools of a service.
///
/// Successive deployments alternate slots so the proxy can keep both
/// upstreams configured and let load balancing find the live one.
#[derive(
    sqlx::Type,
    Debug,
    Default,
    Display,
    Clone,
    Copy,
    EnumString,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentSlot {
    #[default]
    Blue,
    Green,
}

impl DeploymentSlot {
    /// The slot the next deployment of a service must take.
    pub fn alternate(&self) -> Self {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }

    /// Lowercase form used in slot DNS aliases (`app.blue.zaneops.internal`).
    pub fn dns_segment(&self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }
}

/// Generate a fresh deployment hash, e.g. `dpl_dkr_01h455vb4pex5vsknk084sn02q`.
///
/// The hash is the resource key for swarm service names, proxy route IDs
/// and monitor schedule IDs, so it must be unique across the system.
pub fn generate_deployment_hash() -> String {
    format!("dpl_dkr_{}", Ulid::new().to_string().to_lowercase())
}

/// Strip the `dpl_dkr_` prefix; this is what gets injected into the
/// container as `ZANE_DEPLOYMENT_HASH`.
pub fn unprefixed_hash(hash: &str) -> &str {
    hash.strip_prefix("dpl_dkr_").unwrap_or(hash)
}
