//! Workflow definitions and their payload types.
//!
//! Workflows only ever carry flat, owned payloads (IDs, the embedded
//! snapshot, change records), never live database handles, so nothing
//! ORM-shaped crosses a suspension point.

pub mod archive;
pub mod deploy;
pub mod monitor;
pub mod project;

use chrono::{DateTime, Utc};

use zane_common::deployment::unprefixed_hash;
use zane_common::names::{deploy_workflow_id, monitor_schedule_id, swarm_service_name};
use zane_common::service::HealthcheckConfig;
use zane_common::{DeploymentChange, DeploymentSlot, DeploymentStatus, ServiceSnapshot};

use crate::dal;

/// Everything the deploy workflow needs to know about one deployment,
/// captured from the row at pickup time.
#[derive(Clone, Debug)]
pub struct DeploymentDetails {
    pub hash: String,
    pub slot: DeploymentSlot,
    pub queued_at: DateTime<Utc>,
    /// Deployment-only URL, when one was assigned at enqueue time.
    pub url: Option<String>,
    /// Token presented by PATH probes against the deployment URL.
    pub auth_token: String,
    pub service: ServiceSnapshot,
    pub changes: Vec<DeploymentChange>,
}

impl DeploymentDetails {
    pub fn from_row(row: dal::Deployment, changes: Vec<DeploymentChange>) -> Self {
        Self {
            hash: row.hash,
            slot: row.slot,
            queued_at: row.queued_at,
            url: row.url,
            auth_token: row.auth_token,
            service: row.service_snapshot.0,
            changes,
        }
    }

    /// The serialization point: all deployments of a service share this ID.
    pub fn workflow_id(&self) -> String {
        deploy_workflow_id(&self.service.id, &self.service.project_id)
    }

    pub fn unprefixed_hash(&self) -> &str {
        unprefixed_hash(&self.hash)
    }

    /// Name of the swarm service backing this deployment.
    pub fn service_name(&self) -> String {
        swarm_service_name(&self.service.project_id, &self.service.id, &self.hash)
    }

    /// The service's own aliases plus the slot alias
    /// (`{alias}.{slot}.{internal_domain}`) that the proxy upstreams dial.
    pub fn network_aliases(&self, internal_domain: &str) -> Vec<String> {
        if self.service.network_aliases.is_empty() {
            return Vec::new();
        }
        let mut aliases = self.service.network_aliases.clone();
        aliases.push(format!(
            "{}.{}.{}",
            self.service.network_alias,
            self.slot.dns_segment(),
            internal_domain
        ));
        aliases
    }

    pub fn as_target(&self) -> DeploymentTarget {
        DeploymentTarget {
            hash: self.hash.clone(),
            project_id: self.service.project_id.clone(),
            service_id: self.service.id.clone(),
            status: None,
            url: self.url.clone(),
        }
    }
}

/// The minimal handle used by scale/remove/monitor operations, where the
/// full snapshot is not needed.
#[derive(Clone, Debug, PartialEq)]
pub struct DeploymentTarget {
    pub hash: String,
    pub project_id: String,
    pub service_id: String,
    pub status: Option<DeploymentStatus>,
    pub url: Option<String>,
}

impl DeploymentTarget {
    pub fn from_row(row: &dal::Deployment) -> Self {
        Self {
            hash: row.hash.clone(),
            project_id: row.project_id.clone(),
            service_id: row.service_id.clone(),
            status: Some(row.status),
            url: row.url.clone(),
        }
    }

    pub fn service_name(&self) -> String {
        swarm_service_name(&self.project_id, &self.service_id, &self.hash)
    }

    pub fn monitor_schedule_id(&self) -> String {
        monitor_schedule_id(&self.hash, &self.service_id, &self.project_id)
    }
}

/// Payload of the recurring monitor workflow.
#[derive(Clone, Debug)]
pub struct MonitorTarget {
    pub deployment: DeploymentTarget,
    pub healthcheck: Option<HealthcheckConfig>,
    pub auth_token: String,
}

/// What remains of an archived service: the handles needed to tear down
/// its routes, swarm services and volumes.
#[derive(Clone, Debug)]
pub struct ArchivedServiceDetails {
    pub original_id: String,
    pub project_id: String,
    pub urls: Vec<zane_common::service::UrlConfig>,
    pub deployment_urls: Vec<String>,
    pub deployments: Vec<DeploymentTarget>,
    pub volume_ids: Vec<String>,
}

impl ArchivedServiceDetails {
    pub fn from_row(row: dal::ArchivedService) -> Self {
        let deployments = row
            .deployment_hashes
            .0
            .iter()
            .map(|hash| DeploymentTarget {
                hash: hash.clone(),
                project_id: row.project_original_id.clone(),
                service_id: row.original_id.clone(),
                status: None,
                url: None,
            })
            .collect();
        Self {
            original_id: row.original_id,
            project_id: row.project_original_id,
            urls: row.urls.0,
            deployment_urls: row.deployment_urls.0,
            deployments,
            volume_ids: row.volume_ids.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sqlx::types::Json;

    use zane_common::service::PortConfig;

    use super::*;

    fn details(slot: DeploymentSlot) -> DeploymentDetails {
        DeploymentDetails {
            hash: "dpl_dkr_h1".into(),
            slot,
            queued_at: Utc::now(),
            url: Some("h1.zaneops.dev".into()),
            auth_token: "token".into(),
            service: ServiceSnapshot {
                id: "app".into(),
                slug: "app".into(),
                project_id: "p1".into(),
                environment_id: Some("production".into()),
                image: "nginx:alpine".into(),
                command: None,
                credentials: None,
                env_variables: vec![],
                volumes: vec![],
                ports: vec![PortConfig { host: None, forwarded: 80 }],
                urls: vec![],
                healthcheck: None,
                resource_limits: None,
                network_alias: "app".into(),
                network_aliases: vec!["app".into()],
            },
            changes: vec![],
        }
    }

    #[test]
    fn aliases_include_the_slot_alias() {
        let aliases = details(DeploymentSlot::Green).network_aliases("zaneops.internal");
        assert_eq!(aliases, vec!["app".to_string(), "app.green.zaneops.internal".to_string()]);
    }

    #[test]
    fn no_aliases_without_a_base_alias_list() {
        let mut details = details(DeploymentSlot::Blue);
        details.service.network_aliases.clear();
        assert!(details.network_aliases("zaneops.internal").is_empty());
    }

    #[test]
    fn names_and_ids_are_derived_from_the_hash() {
        let details = details(DeploymentSlot::Blue);
        assert_eq!(details.service_name(), "srv-p1-app-dpl_dkr_h1");
        assert_eq!(details.workflow_id(), "deploy-app-p1");
        assert_eq!(details.unprefixed_hash(), "h1");
        assert_eq!(details.as_target().monitor_schedule_id(), "monitor-dpl_dkr_h1-app-p1");
    }

    #[test]
    fn target_from_row_keeps_the_status() {
        let row = dal::Deployment {
            hash: "dpl_dkr_h1".into(),
            service_id: "app".into(),
            project_id: "p1".into(),
            slot: DeploymentSlot::Blue,
            status: DeploymentStatus::Healthy,
            status_reason: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            is_current_production: true,
            url: None,
            auth_token: String::new(),
            service_snapshot: Json(details(DeploymentSlot::Blue).service),
            commit_sha: None,
            commit_message: None,
            commit_author_name: None,
            build_started_at: None,
            build_finished_at: None,
            ignore_build_cache: false,
        };

        let target = DeploymentTarget::from_row(&row);
        assert_eq!(target.status, Some(DeploymentStatus::Healthy));
        assert_eq!(target.service_name(), "srv-p1-app-dpl_dkr_h1");
    }
}
