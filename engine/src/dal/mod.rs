//! Data access layer.
//!
//! The engine reads and writes a deliberately small field set: deployment
//! rows (with their change records and embedded service snapshot), project
//! rows, and the archived project/service rows consumed by the teardown
//! workflows. Everything else about a service lives in the snapshot.

mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;

pub use sqlite::SqliteDal;

use zane_common::service::UrlConfig;
use zane_common::{DeploymentChange, DeploymentSlot, DeploymentStatus, ServiceSnapshot};

use crate::error::Result;

/// A deployment row: the immutable snapshot of a service plus the rollout
/// bookkeeping the workflows maintain.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Deployment {
    pub hash: String,
    pub service_id: String,
    pub project_id: String,
    pub slot: DeploymentSlot,
    pub status: DeploymentStatus,
    pub status_reason: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub is_current_production: bool,
    /// Deployment-only URL (`{hash}.{root_domain}`), when one was assigned.
    pub url: Option<String>,
    /// Token the PATH probe presents to the deployment URL.
    pub auth_token: String,
    pub service_snapshot: Json<ServiceSnapshot>,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub commit_author_name: Option<String>,
    pub build_started_at: Option<DateTime<Utc>>,
    pub build_finished_at: Option<DateTime<Utc>>,
    pub ignore_build_cache: bool,
}

impl Deployment {
    pub fn service(&self) -> &ServiceSnapshot {
        &self.service_snapshot.0
    }
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ArchivedProject {
    pub id: i64,
    pub original_id: String,
}

/// What remains of a service after archival: just enough to tear down its
/// orchestrator resources and proxy routes.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ArchivedService {
    pub original_id: String,
    pub project_original_id: String,
    pub urls: Json<Vec<UrlConfig>>,
    pub deployment_urls: Json<Vec<String>>,
    pub deployment_hashes: Json<Vec<String>>,
    pub volume_ids: Json<Vec<String>>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub(crate) struct DeploymentChangeRow {
    pub field: zane_common::ChangeField,
    pub change_type: zane_common::ChangeType,
    pub item_id: Option<String>,
    pub new_value: Option<Json<Value>>,
    pub old_value: Option<Json<Value>>,
}

impl From<DeploymentChangeRow> for DeploymentChange {
    fn from(row: DeploymentChangeRow) -> Self {
        DeploymentChange {
            field: row.field,
            change_type: row.change_type,
            item_id: row.item_id,
            new_value: row.new_value.map(|value| value.0),
            old_value: row.old_value.map(|value| value.0),
        }
    }
}

#[async_trait]
pub trait Dal: Clone + Send + Sync + 'static {
    async fn insert_project(&self, project_id: &str) -> Result<()>;

    async fn project_exists(&self, project_id: &str) -> Result<bool>;

    async fn insert_deployment(
        &self,
        deployment: &Deployment,
        changes: &[DeploymentChange],
    ) -> Result<()>;

    async fn deployment(&self, hash: &str) -> Result<Option<Deployment>>;

    async fn deployment_changes(&self, hash: &str) -> Result<Vec<DeploymentChange>>;

    /// QUEUED → PREPARING, stamping `started_at`. Returns the row if it
    /// exists; the transition only happens when the row is still QUEUED.
    async fn mark_preparing(&self, hash: &str) -> Result<Option<Deployment>>;

    async fn set_status(
        &self,
        hash: &str,
        status: DeploymentStatus,
        reason: Option<&str>,
    ) -> Result<()>;

    /// The most recent deployment of the service queued strictly before
    /// `before`, excluding `excluding_hash`.
    async fn previous_deployment(
        &self,
        service_id: &str,
        before: DateTime<Utc>,
        excluding_hash: &str,
    ) -> Result<Option<Deployment>>;

    /// The oldest other QUEUED deployment of the service, if any. This is
    /// the continue-as-new drain query.
    async fn next_queued_deployment(
        &self,
        service_id: &str,
        excluding_hash: &str,
    ) -> Result<Option<Deployment>>;

    /// The deployment currently holding `is_current_production` for the
    /// service; the slot of a new deployment alternates against it.
    async fn current_production_deployment(&self, service_id: &str)
        -> Result<Option<Deployment>>;

    /// Atomic final write: status (HEALTHY or FAILED), reason and
    /// `finished_at`; flips `is_current_production` on when the rollout is
    /// healthy or this is the only deployment of the service, and clears
    /// the flag on every sibling in the same transaction.
    async fn finish_deployment(
        &self,
        hash: &str,
        healthy: bool,
        reason: Option<&str>,
    ) -> Result<Option<DeploymentStatus>>;

    /// Deployments whose workflow did not reach a final status; re-enqueued
    /// at engine start.
    async fn unfinished_deployments(&self) -> Result<Vec<Deployment>>;

    /// The current production deployments that are up (or sleeping); their
    /// monitor schedules are re-created at engine start.
    async fn monitored_deployments(&self) -> Result<Vec<Deployment>>;

    async fn insert_archived_project(&self, original_id: &str) -> Result<i64>;

    async fn archived_project(&self, id: i64) -> Result<Option<ArchivedProject>>;

    async fn insert_archived_service(&self, service: &ArchivedService, archived_project_id: i64)
        -> Result<()>;

    async fn archived_services(&self, archived_project_id: i64) -> Result<Vec<ArchivedService>>;

    /// Liveness check run by the monitor schedule before each pass so a
    /// long-idle pool gets its dead connections recycled.
    async fn ping(&self) -> Result<()>;
}
