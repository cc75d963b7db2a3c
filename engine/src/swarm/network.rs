use std::collections::HashMap;

use bollard::models::{NetworkCreateRequest, NetworkInspect};
use bollard::query_parameters::InspectNetworkOptions;
use tracing::info;

use super::{is_not_found, SwarmClient};
use crate::error::{Error, Result};

impl SwarmClient {
    /// Create an attachable overlay network. Idempotent: when a network
    /// with this name already exists its ID is returned instead.
    pub async fn create_overlay_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<String> {
        if let Some(existing) = self.inspect_network(name).await? {
            if let Some(id) = existing.id {
                return Ok(id);
            }
        }

        let request = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("overlay".to_string()),
            attachable: Some(true),
            labels: Some(labels),
            ..Default::default()
        };
        let response = self.docker.create_network(request).await?;
        info!(network = %name, network_id = %response.id, "created overlay network");
        Ok(response.id)
    }

    pub async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInspect>> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions>)
            .await
        {
            Ok(network) => Ok(Some(network)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a network. Missing networks are a non-retryable error: the
    /// teardown workflows expect the network they created to still exist.
    pub async fn remove_network(&self, name: &str) -> Result<()> {
        match self.docker.remove_network(name).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => {
                Err(Error::not_found(format!("network `{name}` does not exist")))
            }
            Err(err) => Err(err.into()),
        }
    }
}
