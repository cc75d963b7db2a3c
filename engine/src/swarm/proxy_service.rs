use std::collections::HashMap;

use bollard::models::{NetworkAttachmentConfig, Service};
use bollard::query_parameters::{ListServicesOptionsBuilder, UpdateServiceOptionsBuilder};
use tracing::info;

use zane_common::names::PROXY_ROLE_LABEL;

use super::SwarmClient;
use crate::error::{Error, Result};

impl SwarmClient {
    /// The reverse-proxy swarm service, discovered by its role label.
    pub async fn proxy_service(&self) -> Result<Service> {
        let filters: HashMap<String, Vec<String>> =
            HashMap::from([("label".to_string(), vec![PROXY_ROLE_LABEL.to_string()])]);
        let options = ListServicesOptionsBuilder::default().filters(&filters).build();

        let services = self.docker.list_services(Some(options)).await?;
        services
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("proxy service is not up"))
    }

    /// Add a network to the proxy's task-template network list. This is
    /// the only place (together with [`Self::detach_network_from_proxy`])
    /// allowed to mutate it.
    pub async fn attach_network_to_proxy(&self, network_id: &str) -> Result<()> {
        self.update_proxy_networks(|targets| {
            if !targets.iter().any(|target| target == network_id) {
                targets.push(network_id.to_string());
            }
        })
        .await
    }

    pub async fn detach_network_from_proxy(&self, network: &NetworkRef) -> Result<()> {
        let network = network.clone();
        self.update_proxy_networks(move |targets| {
            targets.retain(|target| !network.matches(target));
        })
        .await
    }

    /// Whether any running proxy task still references the network. Used
    /// to wait for the proxy to observably drop it before deletion.
    pub async fn proxy_references_network(&self, network: &NetworkRef) -> Result<bool> {
        let proxy = self.proxy_service().await?;
        let proxy_name = proxy
            .spec
            .as_ref()
            .and_then(|spec| spec.name.clone())
            .unwrap_or_default();

        let tasks = self.service_tasks(&proxy_name, None, Some("running")).await?;
        let referenced = tasks.iter().any(|task| {
            task.spec
                .as_ref()
                .and_then(|spec| spec.networks.as_ref())
                .map(|networks| {
                    networks.iter().any(|attachment| {
                        attachment
                            .target
                            .as_deref()
                            .map(|target| network.matches(target))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false)
        });
        Ok(referenced)
    }

    async fn update_proxy_networks<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<String>),
    {
        let proxy = self.proxy_service().await?;
        let name = proxy
            .spec
            .as_ref()
            .and_then(|spec| spec.name.clone())
            .ok_or_else(|| Error::internal("proxy service has no name"))?;
        let version = proxy
            .version
            .as_ref()
            .and_then(|version| version.index)
            .unwrap_or(0);

        let mut service_spec = proxy.spec.unwrap_or_default();
        let mut task_template = service_spec.task_template.take().unwrap_or_default();

        let mut targets: Vec<String> = task_template
            .networks
            .take()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|attachment| attachment.target)
            .collect();
        mutate(&mut targets);

        task_template.networks = Some(
            targets
                .into_iter()
                .map(|target| NetworkAttachmentConfig { target: Some(target), ..Default::default() })
                .collect(),
        );
        service_spec.task_template = Some(task_template);

        let options = UpdateServiceOptionsBuilder::default()
            .version(version as i32)
            .build();
        self.docker
            .update_service(&name, service_spec, options, None)
            .await?;
        info!(proxy = %name, "updated proxy network list");
        Ok(())
    }
}

/// A network referenced either by ID (what the proxy spec carries) or by
/// name (what task attachments sometimes report).
#[derive(Clone, Debug)]
pub struct NetworkRef {
    pub id: String,
    pub name: String,
}

impl NetworkRef {
    pub fn matches(&self, target: &str) -> bool {
        target == self.id || target == self.name
    }
}
