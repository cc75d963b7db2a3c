//! Project-level resource workflows.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tracing::{info, instrument};

use crate::activities::Activities;
use crate::dal::Dal;
use crate::error::Result;
use crate::workflow::{execute_activity, RetryPolicy};

const DB_READ_TIMEOUT: Duration = Duration::from_secs(5);
const PROXY_UPDATE_TIMEOUT: Duration = Duration::from_secs(30);
const PROXY_DELETE_TIMEOUT: Duration = Duration::from_secs(10);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Create the project overlay network and attach it to the proxy. Both
/// steps are idempotent, so retries converge on the same state.
#[instrument(skip(activities))]
pub async fn create_project_resources<D: Dal>(
    activities: Arc<Activities<D>>,
    project_id: String,
) -> Result<String> {
    let retry_policy = RetryPolicy::default();

    let network_id = execute_activity(
        retry_policy,
        DB_READ_TIMEOUT,
        "create_project_network",
        || activities.create_project_network(&project_id),
    )
    .await?;

    execute_activity(
        retry_policy,
        PROXY_UPDATE_TIMEOUT,
        "attach_network_to_proxy",
        || activities.attach_network_to_proxy(&network_id),
    )
    .await?;

    info!(%project_id, %network_id, "project resources created");
    Ok(network_id)
}

/// Tear down everything an archived project owned: every service's routes
/// and resources (concurrently), then the network, which is only deleted
/// once the proxy has observably dropped it.
#[instrument(skip(activities))]
pub async fn remove_project_resources<D: Dal>(
    activities: Arc<Activities<D>>,
    archived_project_id: i64,
) -> Result<()> {
    let retry_policy = RetryPolicy::default();

    let project_id = execute_activity(retry_policy, DB_READ_TIMEOUT, "get_archived_project", || {
        activities.get_archived_project(archived_project_id)
    })
    .await?;

    let services = execute_activity(
        retry_policy,
        DB_READ_TIMEOUT,
        "get_archived_project_services",
        || activities.get_archived_project_services(archived_project_id),
    )
    .await?;

    try_join_all(services.iter().map(|service| {
        let activities = Arc::clone(&activities);
        async move {
            execute_activity(
                retry_policy,
                PROXY_DELETE_TIMEOUT,
                "unexpose_service_from_http",
                || activities.unexpose_service_from_http(service),
            )
            .await
        }
    }))
    .await?;

    try_join_all(services.iter().map(|service| {
        let activities = Arc::clone(&activities);
        async move {
            execute_activity(
                retry_policy,
                CLEANUP_TIMEOUT,
                "cleanup_service_resources",
                || activities.cleanup_service_resources(service),
            )
            .await
        }
    }))
    .await?;

    execute_activity(
        retry_policy,
        PROXY_UPDATE_TIMEOUT,
        "detach_network_from_proxy",
        || activities.detach_network_from_proxy(&project_id),
    )
    .await?;

    execute_activity(
        retry_policy,
        PROXY_DELETE_TIMEOUT,
        "remove_project_network",
        || activities.remove_project_network(&project_id),
    )
    .await?;

    info!(%project_id, "project resources removed");
    Ok(())
}
