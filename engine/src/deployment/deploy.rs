//! The per-service deploy workflow.
//!
//! One run drives a single deployment from QUEUED to a terminal outcome;
//! when it finishes (success, failure or cancellation) it drains the
//! queue by continuing as a new run with the oldest other QUEUED
//! deployment of the service. All runs for a service share the
//! deterministic workflow ID, so they are strictly serialized.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument};

use zane_common::DeploymentStatus;

use crate::activities::Activities;
use crate::dal::Dal;
use crate::deployment::monitor::MonitorScheduler;
use crate::deployment::{DeploymentDetails, DeploymentTarget, MonitorTarget};
use crate::error::Result;
use crate::workflow::{execute_activity, RetryPolicy, WorkflowRegistry};

const DB_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const PROXY_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const SWARM_CREATE_TIMEOUT: Duration = Duration::from_secs(30);
const SCALE_DOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Run the deploy workflow for `deployment`, then keep draining the
/// service's queue until no QUEUED sibling remains.
pub async fn run<D: Dal>(
    activities: Arc<Activities<D>>,
    registry: WorkflowRegistry,
    monitors: MonitorScheduler,
    mut deployment: DeploymentDetails,
) {
    loop {
        // Dedup: a sibling run may already have drained this deployment
        // through continue-as-new by the time its own routed task runs.
        match activities.dal().deployment(&deployment.hash).await {
            Ok(Some(row)) if row.status.is_in_flight() => {}
            Ok(_) => {
                info!(deployment = %deployment.hash, "deployment was already handled, skipping");
                break;
            }
            Err(err) => {
                error!(deployment = %deployment.hash, error = %err, "could not load deployment");
                break;
            }
        }

        let workflow_id = deployment.workflow_id();
        registry.begin(&workflow_id);

        let outcome = run_once(&activities, &registry, &monitors, &deployment).await;
        registry.finish(&workflow_id);

        match outcome {
            Ok(status) => {
                info!(deployment = %deployment.hash, ?status, "deploy workflow finished");
            }
            Err(err) => {
                error!(deployment = %deployment.hash, error = %err, "deploy workflow failed");
                // Record the failure on the row so the deployment does not
                // stay stuck in a transient status.
                if let Err(save_err) = activities
                    .set_deployment_status(
                        &deployment.hash,
                        DeploymentStatus::Failed,
                        Some(&err.to_string()),
                    )
                    .await
                {
                    error!(deployment = %deployment.hash, error = %save_err, "could not record workflow failure");
                }
            }
        }

        // Drain the queue: continue as a new run with the next QUEUED
        // deployment, regardless of how this run ended.
        let next = execute_activity(
            RetryPolicy::default(),
            DB_WRITE_TIMEOUT,
            "get_next_queued_deployment",
            || activities.get_next_queued_deployment(&deployment),
        )
        .await;

        match next {
            Ok(Some(next_deployment)) => {
                info!(
                    deployment = %next_deployment.hash,
                    "continuing with the next queued deployment"
                );
                deployment = next_deployment;
            }
            Ok(None) => break,
            Err(err) => {
                error!(error = %err, "could not drain the deployment queue");
                break;
            }
        }
    }
}

/// One pass of the state machine, for one deployment.
#[instrument(skip_all, fields(deployment = %deployment.hash))]
async fn run_once<D: Dal>(
    activities: &Arc<Activities<D>>,
    registry: &WorkflowRegistry,
    monitors: &MonitorScheduler,
    deployment: &DeploymentDetails,
) -> Result<DeploymentStatus> {
    let retry_policy = RetryPolicy::default();
    let workflow_id = deployment.workflow_id();
    let service = &deployment.service;

    // The only point where cancellation is honoured: before any
    // orchestrator state has been touched.
    if registry.is_cancellation_requested(&workflow_id) {
        execute_activity(retry_policy, DB_WRITE_TIMEOUT, "mark_deployment_cancelled", || {
            activities.mark_deployment_cancelled(deployment)
        })
        .await?;
        return Ok(DeploymentStatus::Cancelled);
    }
    registry.commit(&workflow_id);

    execute_activity(retry_policy, DB_WRITE_TIMEOUT, "prepare_deployment", || {
        activities.prepare_deployment(&deployment.hash)
    })
    .await?;

    let previous = execute_activity(
        retry_policy,
        DB_WRITE_TIMEOUT,
        "get_previous_production_deployment",
        || activities.get_previous_production_deployment(deployment),
    )
    .await?;

    if !service.docker_volumes().is_empty() {
        execute_activity(retry_policy, SWARM_CREATE_TIMEOUT, "create_volumes", || {
            activities.create_volumes(deployment)
        })
        .await?;
    }

    // A deployment that reuses volumes or published ports cannot run next
    // to its predecessor, so the previous production deployment is drained
    // first. A FAILED predecessor has nothing running to drain.
    if let Some(previous) = previous
        .as_ref()
        .filter(|previous| should_scale_down_previous(service, previous))
    {
        execute_activity(
            retry_policy,
            SCALE_DOWN_TIMEOUT,
            "scale_down_service_deployment",
            || activities.scale_down_service_deployment(previous),
        )
        .await?;
    }

    execute_activity(retry_policy, SWARM_CREATE_TIMEOUT, "create_swarm_service", || {
        activities.create_swarm_service(deployment)
    })
    .await?;

    if service.http_port().is_some() {
        execute_activity(retry_policy, PROXY_WRITE_TIMEOUT, "expose_deployment_url", || {
            activities.expose_deployment_url(deployment)
        })
        .await?;
    }

    let healthcheck_timeout = service
        .healthcheck
        .as_ref()
        .and_then(|healthcheck| healthcheck.timeout_seconds)
        .unwrap_or(activities.config().healthcheck_timeout);
    let (status, status_reason) = execute_activity(
        retry_policy,
        Duration::from_secs(healthcheck_timeout + 5),
        "run_deployment_healthcheck",
        || activities.run_deployment_healthcheck(deployment),
    )
    .await?;

    let healthy = status == DeploymentStatus::Healthy;
    if healthy && service.http_port().is_some() {
        execute_activity(retry_policy, PROXY_WRITE_TIMEOUT, "expose_service_urls", || {
            activities.expose_service_urls(deployment)
        })
        .await?;
    }

    let final_status = execute_activity(retry_policy, DB_WRITE_TIMEOUT, "finish_and_save", || {
        activities.finish_and_save(&deployment.hash, healthy, status_reason.as_deref())
    })
    .await?;

    if healthy {
        if let Some(previous) = previous.as_ref() {
            execute_activity(
                retry_policy,
                SCALE_DOWN_TIMEOUT,
                "scale_down_and_remove_deployment",
                || activities.scale_down_and_remove_deployment(previous),
            )
            .await?;

            execute_activity(retry_policy, SWARM_CREATE_TIMEOUT, "remove_old_volumes", || {
                activities.remove_old_volumes(deployment)
            })
            .await?;

            execute_activity(retry_policy, PROXY_WRITE_TIMEOUT, "remove_old_urls", || {
                activities.remove_old_urls(deployment)
            })
            .await?;

            execute_activity(
                retry_policy,
                DB_WRITE_TIMEOUT,
                "cleanup_previous_deployment",
                || activities.cleanup_previous_deployment(previous),
            )
            .await?;

            monitors.unregister(&previous.monitor_schedule_id());
        }

        monitors.register(
            Arc::clone(activities),
            MonitorTarget {
                deployment: deployment.as_target(),
                healthcheck: service.healthcheck.clone(),
                auth_token: deployment.auth_token.clone(),
            },
        );
    } else {
        let deployment_target = deployment.as_target();
        execute_activity(
            retry_policy,
            SCALE_DOWN_TIMEOUT,
            "scale_down_and_remove_deployment",
            || activities.scale_down_and_remove_deployment(&deployment_target),
        )
        .await?;

        // The previous production deployment takes the traffic back.
        if let Some(previous) = previous
            .as_ref()
            .filter(|previous| previous.status != Some(DeploymentStatus::Failed))
        {
            execute_activity(
                retry_policy,
                PROXY_WRITE_TIMEOUT,
                "scale_back_service_deployment",
                || activities.scale_back_service_deployment(previous),
            )
            .await?;
        }
    }

    Ok(final_status)
}

/// The previous production deployment must be drained before the new one
/// starts when the service binds host resources (published ports) or
/// reuses volumes; a FAILED predecessor is already down.
fn should_scale_down_previous(
    service: &zane_common::ServiceSnapshot,
    previous: &DeploymentTarget,
) -> bool {
    (!service.volumes.is_empty() || !service.non_http_ports().is_empty())
        && previous.status != Some(DeploymentStatus::Failed)
}
