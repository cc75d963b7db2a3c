//! Deployment activities: the idempotent, retryable side-effect layer.
//!
//! Every method is safe to run more than once: orchestrator resources are
//! created if absent and looked up by their deterministic names, proxy
//! writes address stable IDs, and database transitions are guarded. The
//! workflows invoke these through [`crate::workflow::execute_activity`],
//! which supplies the retry policy and start-to-close timeout.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use zane_common::names::{project_network_name, resource_labels, volume_resource_name};
use zane_common::service::UrlConfig;
use zane_common::{ChangeField, ChangeType, DeploymentStatus};

use crate::args::EngineConfig;
use crate::dal::Dal;
use crate::deployment::{
    ArchivedServiceDetails, DeploymentDetails, DeploymentTarget, MonitorTarget,
};
use crate::error::{Error, Result};
use crate::healthcheck::{run_healthcheck, HealthcheckMode};
use crate::proxy::{routes, ProxyClient};
use crate::swarm::{spec, NetworkRef, SwarmClient};

pub struct Activities<D> {
    dal: D,
    swarm: SwarmClient,
    proxy: ProxyClient,
    /// Client used for PATH probes against deployment URLs.
    http: reqwest::Client,
    config: EngineConfig,
}

impl<D: Dal> Activities<D> {
    pub fn new(dal: D, swarm: SwarmClient, config: EngineConfig) -> Self {
        let proxy = ProxyClient::new(&config);
        Self {
            dal,
            swarm,
            proxy,
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn dal(&self) -> &D {
        &self.dal
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.config.healthcheck_wait_interval)
    }

    // ── Project resources ───────────────────────────────────────

    /// Create the project's overlay network and return its ID. Looked up
    /// by name first, so reruns are no-ops.
    #[instrument(skip(self))]
    pub async fn create_project_network(&self, project_id: &str) -> Result<String> {
        if !self.dal.project_exists(project_id).await? {
            return Err(Error::not_found(format!(
                "project with id `{project_id}` does not exist"
            )));
        }

        self.swarm
            .create_overlay_network(
                &project_network_name(project_id),
                resource_labels(project_id, []),
            )
            .await
    }

    #[instrument(skip(self))]
    pub async fn attach_network_to_proxy(&self, network_id: &str) -> Result<()> {
        self.swarm.attach_network_to_proxy(network_id).await
    }

    #[instrument(skip(self))]
    pub async fn get_archived_project(&self, archived_project_id: i64) -> Result<String> {
        let project = self
            .dal
            .archived_project(archived_project_id)
            .await?
            .ok_or_else(|| {
                Error::not_found(format!(
                    "archived project with id `{archived_project_id}` does not exist"
                ))
            })?;
        Ok(project.original_id)
    }

    #[instrument(skip(self))]
    pub async fn get_archived_project_services(
        &self,
        archived_project_id: i64,
    ) -> Result<Vec<ArchivedServiceDetails>> {
        let project = self
            .dal
            .archived_project(archived_project_id)
            .await?
            .ok_or_else(|| {
                Error::not_found(format!(
                    "archived project with id `{archived_project_id}` does not exist"
                ))
            })?;

        let services = self.dal.archived_services(project.id).await?;
        Ok(services.into_iter().map(ArchivedServiceDetails::from_row).collect())
    }

    /// Detach the project network from the proxy, then wait until no
    /// running proxy task references it anymore.
    #[instrument(skip(self))]
    pub async fn detach_network_from_proxy(&self, project_id: &str) -> Result<String> {
        let network_name = project_network_name(project_id);
        let network = self.swarm.inspect_network(&network_name).await?.ok_or_else(|| {
            Error::not_found(format!(
                "network `{network_name}` for project `{project_id}` does not exist"
            ))
        })?;
        let network = NetworkRef {
            id: network.id.unwrap_or_else(|| network_name.clone()),
            name: network_name,
        };

        self.swarm.detach_network_from_proxy(&network).await?;

        while self.swarm.proxy_references_network(&network).await? {
            debug!(network = %network.name, "proxy still references the network, waiting");
            sleep(self.wait_interval()).await;
        }
        Ok(network.id)
    }

    #[instrument(skip(self))]
    pub async fn remove_project_network(&self, project_id: &str) -> Result<()> {
        self.swarm.remove_network(&project_network_name(project_id)).await
    }

    // ── Deployment lifecycle ────────────────────────────────────

    /// QUEUED → PREPARING, stamping the start time.
    #[instrument(skip(self))]
    pub async fn prepare_deployment(&self, deployment_hash: &str) -> Result<()> {
        self.dal
            .mark_preparing(deployment_hash)
            .await?
            .ok_or_else(|| Error::not_found("cannot execute a deploy on a non existent deployment"))?;
        Ok(())
    }

    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn get_previous_production_deployment(
        &self,
        deployment: &DeploymentDetails,
    ) -> Result<Option<DeploymentTarget>> {
        let previous = self
            .dal
            .previous_deployment(&deployment.service.id, deployment.queued_at, &deployment.hash)
            .await?;
        Ok(previous.as_ref().map(DeploymentTarget::from_row))
    }

    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn get_next_queued_deployment(
        &self,
        deployment: &DeploymentDetails,
    ) -> Result<Option<DeploymentDetails>> {
        let Some(row) = self
            .dal
            .next_queued_deployment(&deployment.service.id, &deployment.hash)
            .await?
        else {
            return Ok(None);
        };

        let changes = self.dal.deployment_changes(&row.hash).await?;
        Ok(Some(DeploymentDetails::from_row(row, changes)))
    }

    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn mark_deployment_cancelled(&self, deployment: &DeploymentDetails) -> Result<()> {
        self.dal
            .set_status(
                &deployment.hash,
                DeploymentStatus::Cancelled,
                Some("Deployment cancelled."),
            )
            .await
    }

    /// Create the managed volume for every docker volume of the service,
    /// keyed `vol-{id}` and labelled with the owning service.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn create_volumes(&self, deployment: &DeploymentDetails) -> Result<()> {
        let service = &deployment.service;
        for volume in service.docker_volumes() {
            let name = volume_resource_name(&volume.id);
            if !self.swarm.volume_exists(&name).await? {
                self.swarm
                    .create_volume(
                        &name,
                        resource_labels(
                            &service.project_id,
                            [("parent", service.id.as_str())],
                        ),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Create the deployment's swarm service exactly as specified. If the
    /// named service already exists this is a no-op.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn create_swarm_service(&self, deployment: &DeploymentDetails) -> Result<()> {
        let service = &deployment.service;
        let service_name = deployment.service_name();

        if self.swarm.inspect_service(&service_name).await?.is_some() {
            debug!(service = %service_name, "swarm service already exists, skipping");
            return Ok(());
        }

        // A pull failure here is not fatal: the node-side pull will fail
        // too and the task lands in `rejected`, which the healthcheck
        // reports as UNHEALTHY with the daemon's error string.
        if let Err(err) = self
            .swarm
            .pull_image(&service.image, service.credentials.as_ref())
            .await
        {
            warn!(image = %service.image, error = %err, "image pull failed");
        }

        let existing_volumes: HashSet<String> = self
            .swarm
            .volumes_with_labels(&resource_labels(
                &service.project_id,
                [("parent", service.id.as_str())],
            ))
            .await?
            .into_iter()
            .map(|volume| volume.name)
            .collect();

        let service_spec = spec::deployment_service_spec(deployment, &existing_volumes, &self.config);
        self.swarm
            .create_service(service_spec, service.credentials.as_ref())
            .await?;
        Ok(())
    }

    /// Scale a deployment's swarm service to zero and wait until its task
    /// list is empty.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn scale_down_service_deployment(&self, deployment: &DeploymentTarget) -> Result<()> {
        let service_name = deployment.service_name();
        self.swarm.scale_service(&service_name, 0).await?;
        self.wait_until_service_drained(&service_name).await
    }

    /// Scale down, wait for the drain, then remove the swarm service.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn scale_down_and_remove_deployment(
        &self,
        deployment: &DeploymentTarget,
    ) -> Result<()> {
        let service_name = deployment.service_name();
        self.swarm.scale_service(&service_name, 0).await?;
        self.wait_until_service_drained(&service_name).await?;
        self.swarm.remove_service(&service_name).await
    }

    /// Bring a previously drained deployment back to one replica.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn scale_back_service_deployment(&self, deployment: &DeploymentTarget) -> Result<()> {
        self.swarm.scale_service(&deployment.service_name(), 1).await
    }

    // ── Proxy exposure ──────────────────────────────────────────

    /// Install the deployment-only URL route, when the service speaks
    /// HTTP and a deployment URL was assigned.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn expose_deployment_url(&self, deployment: &DeploymentDetails) -> Result<()> {
        let service = &deployment.service;
        let (Some(http_port), Some(url)) = (service.http_port(), deployment.url.as_deref()) else {
            return Ok(());
        };
        self.proxy
            .expose_deployment_url(url, &deployment.service_name(), http_port.forwarded)
            .await
    }

    /// Upsert the per-domain config and route for each service URL. Blue
    /// and green hashes come from the current deployment and its previous
    /// sibling, so both colors are logged whenever two deployments exist.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn expose_service_urls(&self, deployment: &DeploymentDetails) -> Result<()> {
        let service = &deployment.service;
        let Some(http_port) = service.http_port() else {
            return Ok(());
        };

        let previous = self
            .dal
            .previous_deployment(&service.id, deployment.queued_at, &deployment.hash)
            .await?;
        self.proxy
            .expose_service_urls(
                service,
                http_port,
                (&deployment.hash, deployment.slot),
                previous.as_ref().map(|row| (row.hash.as_str(), row.slot)),
            )
            .await
    }

    /// Delete the routes of URLs that are gone from the new snapshot:
    /// every URL with a DELETE change, plus the old shape of every
    /// updated URL whose route ID changed.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn remove_old_urls(&self, deployment: &DeploymentDetails) -> Result<()> {
        let suffix = &self.config.route_id_suffix;
        for change in &deployment.changes {
            if change.field != ChangeField::Urls {
                continue;
            }
            let Some(old_url) = change
                .old_value
                .as_ref()
                .and_then(|value| serde_json::from_value::<UrlConfig>(value.clone()).ok())
            else {
                continue;
            };

            let stale = match change.change_type {
                ChangeType::Delete => true,
                ChangeType::Update => {
                    let new_id = change
                        .new_value
                        .as_ref()
                        .and_then(|value| serde_json::from_value::<UrlConfig>(value.clone()).ok())
                        .map(|new_url| routes::url_route_id(&new_url, suffix));
                    new_id.as_deref() != Some(routes::url_route_id(&old_url, suffix).as_str())
                }
                ChangeType::Add => false,
            };

            if stale {
                self.proxy.unexpose_url(&old_url).await?;
            }
        }
        Ok(())
    }

    /// Remove every managed volume that carries a DELETE change. Volumes
    /// that are already gone are ignored.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn remove_old_volumes(&self, deployment: &DeploymentDetails) -> Result<()> {
        for change in &deployment.changes {
            if !change.is_volume_deletion() {
                continue;
            }
            if let Some(volume_id) = change.item_id.as_deref() {
                self.swarm.remove_volume(&volume_resource_name(volume_id)).await?;
            }
        }
        Ok(())
    }

    /// Delete each service URL route (and empty domain configs), then the
    /// deployment URLs.
    #[instrument(skip(self, service), fields(service = %service.original_id))]
    pub async fn unexpose_service_from_http(&self, service: &ArchivedServiceDetails) -> Result<()> {
        self.proxy.unexpose_urls(&service.urls).await?;
        self.proxy.remove_deployment_urls(&service.deployment_urls).await
    }

    /// Tear down every swarm service and managed volume of an archived
    /// service. Swarm services that are already gone are skipped.
    #[instrument(skip(self, service), fields(service = %service.original_id))]
    pub async fn cleanup_service_resources(&self, service: &ArchivedServiceDetails) -> Result<()> {
        for deployment in &service.deployments {
            let service_name = deployment.service_name();
            if self.swarm.inspect_service(&service_name).await?.is_none() {
                continue;
            }

            self.swarm.scale_service(&service_name, 0).await?;
            self.wait_until_service_drained(&service_name).await?;

            let volumes = self
                .swarm
                .volumes_with_labels(&resource_labels(
                    &deployment.project_id,
                    [("parent", deployment.service_id.as_str())],
                ))
                .await?;
            for volume in &volumes {
                self.swarm.remove_volume(&volume.name).await?;
            }
            info!(service = %service_name, volumes = volumes.len(), "removed deployment resources");

            self.swarm.remove_service(&service_name).await?;
        }
        Ok(())
    }

    // ── Status bookkeeping ──────────────────────────────────────

    /// Final status write for a rollout; exactly one deployment of the
    /// service holds `is_current_production` afterwards.
    #[instrument(skip(self))]
    pub async fn finish_and_save(
        &self,
        deployment_hash: &str,
        healthy: bool,
        reason: Option<&str>,
    ) -> Result<DeploymentStatus> {
        self.dal
            .finish_deployment(deployment_hash, healthy, reason)
            .await?
            .ok_or_else(|| Error::not_found("cannot save a non existent deployment"))
    }

    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn cleanup_previous_deployment(&self, deployment: &DeploymentTarget) -> Result<()> {
        self.dal.set_status(&deployment.hash, DeploymentStatus::Removed, None).await
    }

    #[instrument(skip(self))]
    pub async fn set_deployment_status(
        &self,
        deployment_hash: &str,
        status: DeploymentStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        self.dal.set_status(deployment_hash, status, reason).await
    }

    // ── Healthchecks ────────────────────────────────────────────

    /// The bounded first-time healthcheck run during a rollout.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.hash))]
    pub async fn run_deployment_healthcheck(
        &self,
        deployment: &DeploymentDetails,
    ) -> Result<(DeploymentStatus, Option<String>)> {
        let row = self
            .dal
            .deployment(&deployment.hash)
            .await?
            .ok_or_else(|| Error::not_found("cannot check the status of a non existent deployment"))?;

        run_healthcheck(
            &self.swarm,
            &self.http,
            &self.config,
            &deployment.as_target(),
            deployment.service.healthcheck.as_ref(),
            &deployment.auth_token,
            row.status,
            HealthcheckMode::Bounded,
        )
        .await
    }

    /// One monitor pass: recycle stale DB connections, re-evaluate the
    /// deployment once, and write the result back. Terminal and sleeping
    /// deployments are left untouched.
    #[instrument(skip(self, target), fields(deployment = %target.deployment.hash))]
    pub async fn run_monitor_pass(&self, target: &MonitorTarget) -> Result<DeploymentStatus> {
        self.dal.ping().await?;

        let row = self
            .dal
            .deployment(&target.deployment.hash)
            .await?
            .ok_or_else(|| Error::not_found("cannot monitor a non existent deployment"))?;
        if row.status.is_terminal() || row.status == DeploymentStatus::Sleeping {
            return Ok(row.status);
        }

        let (status, reason) = run_healthcheck(
            &self.swarm,
            &self.http,
            &self.config,
            &target.deployment,
            target.healthcheck.as_ref(),
            &target.auth_token,
            row.status,
            HealthcheckMode::OneShot,
        )
        .await?;

        self.dal
            .set_status(&target.deployment.hash, status, reason.as_deref())
            .await?;
        Ok(status)
    }

    async fn wait_until_service_drained(&self, service_name: &str) -> Result<()> {
        loop {
            let tasks = self.swarm.service_tasks(service_name, None, None).await?;
            if tasks.is_empty() {
                debug!(service = %service_name, "service is down");
                return Ok(());
            }
            debug!(
                service = %service_name,
                tasks = tasks.len(),
                "service is not down yet, retrying in {}s",
                self.config.healthcheck_wait_interval
            );
            sleep(self.wait_interval()).await;
        }
    }
}
