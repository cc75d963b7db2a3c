//! Service archival and sleep-toggle workflows.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use zane_common::DeploymentStatus;

use crate::activities::Activities;
use crate::dal::Dal;
use crate::deployment::monitor::MonitorScheduler;
use crate::deployment::{ArchivedServiceDetails, DeploymentTarget};
use crate::error::Result;
use crate::workflow::{execute_activity, RetryPolicy};

const DB_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const PROXY_DELETE_TIMEOUT: Duration = Duration::from_secs(10);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);
const SCALE_TIMEOUT: Duration = Duration::from_secs(60);

/// Archive one service: drop its routes from the proxy, then tear down
/// every deployment's swarm service and managed volumes.
#[instrument(skip(activities, monitors, service), fields(service = %service.original_id))]
pub async fn archive_service<D: Dal>(
    activities: Arc<Activities<D>>,
    monitors: MonitorScheduler,
    service: ArchivedServiceDetails,
) -> Result<()> {
    let retry_policy = RetryPolicy::default();

    for deployment in &service.deployments {
        monitors.unregister(&deployment.monitor_schedule_id());
    }

    execute_activity(
        retry_policy,
        PROXY_DELETE_TIMEOUT,
        "unexpose_service_from_http",
        || activities.unexpose_service_from_http(&service),
    )
    .await?;

    execute_activity(retry_policy, CLEANUP_TIMEOUT, "cleanup_service_resources", || {
        activities.cleanup_service_resources(&service)
    })
    .await?;

    info!(service = %service.original_id, "service archived");
    Ok(())
}

/// Toggle a deployment between running and sleeping. Orthogonal to a
/// rollout: the swarm service is scaled, never recreated.
#[instrument(skip(activities, deployment), fields(deployment = %deployment.hash))]
pub async fn toggle_service<D: Dal>(
    activities: Arc<Activities<D>>,
    deployment: DeploymentTarget,
) -> Result<()> {
    let retry_policy = RetryPolicy::default();

    if deployment.status == Some(DeploymentStatus::Sleeping) {
        execute_activity(retry_policy, SCALE_TIMEOUT, "scale_back_service_deployment", || {
            activities.scale_back_service_deployment(&deployment)
        })
        .await?;
        // The monitor schedule flips the status to HEALTHY once the task
        // is back up.
        execute_activity(retry_policy, DB_WRITE_TIMEOUT, "set_deployment_status", || {
            activities.set_deployment_status(&deployment.hash, DeploymentStatus::Starting, None)
        })
        .await?;
    } else {
        execute_activity(retry_policy, SCALE_TIMEOUT, "scale_down_service_deployment", || {
            activities.scale_down_service_deployment(&deployment)
        })
        .await?;
        execute_activity(retry_policy, DB_WRITE_TIMEOUT, "set_deployment_status", || {
            activities.set_deployment_status(&deployment.hash, DeploymentStatus::Sleeping, None)
        })
        .await?;
    }
    Ok(())
}
