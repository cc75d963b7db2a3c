//! Deterministic resource names and workflow IDs.
//!
//! These strings are cross-process handles: the orchestrator looks
//! resources up by them, the proxy addresses routes by them, and the
//! workflow runtime serializes on them. They must never drift.

use std::collections::HashMap;

/// Label applied to every resource the engine manages.
pub const MANAGED_LABEL: &str = "zane-managed";

/// Label carrying the owning project id.
pub const PROJECT_LABEL: &str = "zane-project";

/// Label identifying the reverse-proxy swarm service.
pub const PROXY_ROLE_LABEL: &str = "zane.role=proxy";

/// Project-wide overlay network.
pub fn project_network_name(project_id: &str) -> String {
    format!("net-{project_id}")
}

/// Per-environment overlay network. Kept alongside the legacy project-wide
/// name so callers can be migrated in one place.
pub fn env_network_name(project_id: &str, env_id: &str) -> String {
    format!("net-{project_id}-{env_id}")
}

pub fn volume_resource_name(volume_id: &str) -> String {
    format!("vol-{volume_id}")
}

pub fn swarm_service_name(project_id: &str, service_id: &str, deployment_hash: &str) -> String {
    format!("srv-{project_id}-{service_id}-{deployment_hash}")
}

/// The deterministic ID of the per-service deploy workflow; two
/// deployments of the same service always hash to the same queue.
pub fn deploy_workflow_id(service_id: &str, project_id: &str) -> String {
    format!("deploy-{service_id}-{project_id}")
}

/// The per-deployment monitor schedule ID.
pub fn monitor_schedule_id(deployment_hash: &str, service_id: &str, project_id: &str) -> String {
    format!("monitor-{deployment_hash}-{service_id}-{project_id}")
}

/// Labels stamped on every managed resource, with optional extras such as
/// `parent`, `deployment_hash` or `service`.
pub fn resource_labels<'a, I>(project_id: &str, extra: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (PROJECT_LABEL.to_string(), project_id.to_string()),
    ]);
    for (key, value) in extra {
        labels.insert(key.to_string(), value.to_string());
    }
    labels
}

/// `key=value` selectors for docker `label` filters.
pub fn label_selectors(labels: &HashMap<String, String>) -> Vec<String> {
    labels.iter().map(|(key, value)| format!("{key}={value}")).collect()
}
