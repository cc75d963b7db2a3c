//! The ZaneOps deployment orchestration engine.
//!
//! Drives user-defined services from a queued change-set to a running,
//! healthy, traffic-receiving deployment on Docker Swarm, exposed through
//! the Caddy reverse proxy and continuously re-evaluated by per-deployment
//! monitor schedules.

pub mod activities;
pub mod args;
pub mod dal;
pub mod deployment;
pub mod error;
pub mod healthcheck;
pub mod proxy;
pub mod swarm;
pub mod workflow;

use std::sync::Arc;

use chrono::Utc;
use sqlx::types::Json;
use tracing::info;

use zane_common::deployment::generate_deployment_hash;
use zane_common::names::deploy_workflow_id;
use zane_common::{DeploymentChange, DeploymentSlot, DeploymentStatus, ServiceSnapshot};

use crate::activities::Activities;
use crate::args::EngineConfig;
use crate::dal::Dal;
use crate::deployment::monitor::MonitorScheduler;
use crate::deployment::{archive, deploy, project, ArchivedServiceDetails, DeploymentDetails,
    DeploymentTarget};
use crate::error::Result;
use crate::swarm::SwarmClient;
use crate::workflow::{run_once, CancelResult, TaskHandle, TaskRouter, WorkflowRegistry};

/// A deployment submitted by the API: the frozen service snapshot plus
/// the change-set that produced it.
#[derive(Clone, Debug)]
pub struct DeploymentRequest {
    pub service: ServiceSnapshot,
    pub changes: Vec<DeploymentChange>,
    /// Deployment-only URL to expose behind the auth gate, if any.
    pub url: Option<String>,
    /// Token PATH probes present against the deployment URL.
    pub auth_token: String,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub commit_author_name: Option<String>,
    pub ignore_build_cache: bool,
}

/// The engine: owns the workflow runtime, the activity layer and the
/// monitor scheduler, and is the single entry point for workflow
/// submissions.
pub struct EngineService<D: Dal> {
    activities: Arc<Activities<D>>,
    router: TaskRouter,
    registry: WorkflowRegistry,
    monitors: MonitorScheduler,
}

impl<D: Dal> EngineService<D> {
    pub fn new(dal: D, swarm: SwarmClient, config: EngineConfig) -> Self {
        Self {
            activities: Arc::new(Activities::new(dal, swarm, config)),
            router: TaskRouter::default(),
            registry: WorkflowRegistry::default(),
            monitors: MonitorScheduler::default(),
        }
    }

    /// Re-enqueue every deployment whose workflow did not reach a final
    /// status before the engine last stopped, and re-create the monitor
    /// schedules of the deployments that are up. Activities are
    /// idempotent, so a half-finished rollout converges when replayed.
    pub async fn start(&self) -> Result<()> {
        let unfinished = self.activities.dal().unfinished_deployments().await?;
        info!(count = unfinished.len(), "re-enqueuing unfinished deployments");

        for row in unfinished {
            let changes = self.activities.dal().deployment_changes(&row.hash).await?;
            let details = DeploymentDetails::from_row(row, changes);
            self.route_deploy(details).await?;
        }

        let monitored = self.activities.dal().monitored_deployments().await?;
        info!(count = monitored.len(), "re-creating monitor schedules");
        for row in monitored {
            self.monitors.register(
                Arc::clone(&self.activities),
                deployment::MonitorTarget {
                    deployment: DeploymentTarget::from_row(&row),
                    healthcheck: row.service().healthcheck.clone(),
                    auth_token: row.auth_token.clone(),
                },
            );
        }
        Ok(())
    }

    /// Persist a new deployment row (alternating the slot against the
    /// latest sibling) and hand it to the per-service workflow queue.
    /// Returns the generated deployment hash.
    pub async fn enqueue_deployment(&self, request: DeploymentRequest) -> Result<String> {
        let production = self
            .activities
            .dal()
            .current_production_deployment(&request.service.id)
            .await?;
        let slot = next_slot(production.as_ref().map(|row| row.slot));
        let hash = generate_deployment_hash();

        let row = dal::Deployment {
            hash: hash.clone(),
            service_id: request.service.id.clone(),
            project_id: request.service.project_id.clone(),
            slot,
            status: DeploymentStatus::Queued,
            status_reason: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            is_current_production: false,
            url: request.url.clone(),
            auth_token: request.auth_token.clone(),
            service_snapshot: Json(request.service.clone()),
            commit_sha: request.commit_sha.clone(),
            commit_message: request.commit_message.clone(),
            commit_author_name: request.commit_author_name.clone(),
            build_started_at: None,
            build_finished_at: None,
            ignore_build_cache: request.ignore_build_cache,
        };
        self.activities.dal().insert_deployment(&row, &request.changes).await?;

        let details = DeploymentDetails::from_row(row, request.changes);
        info!(deployment = %hash, service = %details.service.id, "deployment enqueued");
        self.route_deploy(details).await?;
        Ok(hash)
    }

    /// Cancellation update for the service's active deploy workflow.
    /// Accepted only while the run has not started mutating orchestrator
    /// state; refused afterwards.
    pub fn cancel_deployment(&self, service_id: &str, project_id: &str) -> CancelResult {
        self.registry
            .request_cancellation(&deploy_workflow_id(service_id, project_id))
    }

    pub async fn create_project_resources(&self, project_id: String) -> Result<TaskHandle> {
        let activities = Arc::clone(&self.activities);
        let workflow_id = format!("create-project-resources-{project_id}");
        self.router
            .route(
                &workflow_id,
                Box::new(run_once(move || async move {
                    project::create_project_resources(activities, project_id).await?;
                    Ok(())
                })),
            )
            .await
    }

    pub async fn remove_project_resources(&self, archived_project_id: i64) -> Result<TaskHandle> {
        let activities = Arc::clone(&self.activities);
        let workflow_id = format!("remove-project-resources-{archived_project_id}");
        self.router
            .route(
                &workflow_id,
                Box::new(run_once(move || async move {
                    project::remove_project_resources(activities, archived_project_id).await
                })),
            )
            .await
    }

    pub async fn archive_service(&self, service: ArchivedServiceDetails) -> Result<TaskHandle> {
        let activities = Arc::clone(&self.activities);
        let monitors = self.monitors.clone();
        let workflow_id = format!("archive-service-{}-{}", service.original_id, service.project_id);
        self.router
            .route(
                &workflow_id,
                Box::new(run_once(move || async move {
                    archive::archive_service(activities, monitors, service).await
                })),
            )
            .await
    }

    pub async fn toggle_service(&self, deployment: DeploymentTarget) -> Result<TaskHandle> {
        let activities = Arc::clone(&self.activities);
        let workflow_id = format!("toggle-{}-{}", deployment.service_id, deployment.project_id);
        self.router
            .route(
                &workflow_id,
                Box::new(run_once(move || async move {
                    archive::toggle_service(activities, deployment).await
                })),
            )
            .await
    }

    async fn route_deploy(&self, details: DeploymentDetails) -> Result<TaskHandle> {
        let workflow_id = details.workflow_id();
        let activities = Arc::clone(&self.activities);
        let registry = self.registry.clone();
        let monitors = self.monitors.clone();

        self.router
            .route(
                &workflow_id,
                Box::new(run_once(move || async move {
                    deploy::run(activities, registry, monitors, details).await;
                    Ok(())
                })),
            )
            .await
    }
}

/// The slot of a new deployment alternates against the last successful
/// deployment's slot; the first deployment of a service is blue.
fn next_slot(current_production: Option<DeploymentSlot>) -> DeploymentSlot {
    match current_production {
        Some(slot) => slot.alternate(),
        None => DeploymentSlot::Blue,
    }
}
