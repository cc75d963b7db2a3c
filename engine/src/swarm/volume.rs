use std::collections::HashMap;

use bollard::models::{Volume, VolumeCreateRequest};
use bollard::query_parameters::{ListVolumesOptionsBuilder, RemoveVolumeOptions};
use tracing::debug;

use zane_common::names::label_selectors;

use super::{is_not_found, SwarmClient};
use crate::error::Result;

impl SwarmClient {
    pub async fn volume_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<Volume> {
        let request = VolumeCreateRequest {
            name: Some(name.to_string()),
            driver: Some("local".to_string()),
            labels: Some(labels),
            ..Default::default()
        };
        let volume = self.docker.create_volume(request).await?;
        debug!(volume = %name, "created volume");
        Ok(volume)
    }

    /// All volumes carrying the given labels; used for `parent`-scoped
    /// lookups and teardown.
    pub async fn volumes_with_labels(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<Volume>> {
        let filters: HashMap<String, Vec<String>> =
            HashMap::from([("label".to_string(), label_selectors(labels))]);
        let options = ListVolumesOptionsBuilder::default().filters(&filters).build();
        let response = self.docker.list_volumes(Some(options)).await?;
        Ok(response.volumes.unwrap_or_default())
    }

    /// Force-remove a volume. A volume that is already gone is a no-op.
    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        match self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
