use std::collections::HashMap;

use bollard::auth::DockerCredentials;
use bollard::models::{Service, ServiceSpec, ServiceSpecMode, ServiceSpecModeReplicated, Task};
use bollard::query_parameters::{
    InspectServiceOptions, ListTasksOptionsBuilder, UpdateServiceOptionsBuilder,
};
use tracing::info;

use zane_common::service::RegistryCredentials;

use super::{is_not_found, SwarmClient};
use crate::error::{Error, Result};

impl SwarmClient {
    /// Inspect a swarm service by name. Absent services are `None`, not an
    /// error, so callers can implement create-if-absent.
    pub async fn inspect_service(&self, name: &str) -> Result<Option<Service>> {
        match self
            .docker
            .inspect_service(name, None::<InspectServiceOptions>)
            .await
        {
            Ok(service) => Ok(Some(service)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Create a swarm service, pulling credentials through for private
    /// registries. Returns the service ID.
    pub async fn create_service(
        &self,
        service_spec: ServiceSpec,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<String> {
        let name = service_spec.name.clone().unwrap_or_default();
        let response = self
            .docker
            .create_service(service_spec, credentials.map(docker_credentials))
            .await?;

        let id = response
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::internal("daemon did not return a service id"))?;
        info!(service = %name, service_id = %id, "created swarm service");
        Ok(id)
    }

    /// Set the replica count of a service. Fails with a non-retryable
    /// error when the service does not exist.
    pub async fn scale_service(&self, name: &str, replicas: i64) -> Result<()> {
        let service = self.inspect_service(name).await?.ok_or_else(|| {
            Error::not_found(format!("cannot scale nonexistent service `{name}`"))
        })?;

        let version = service
            .version
            .as_ref()
            .and_then(|version| version.index)
            .unwrap_or(0);
        let mut service_spec = service.spec.unwrap_or_default();
        service_spec.mode = Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated { replicas: Some(replicas) }),
            ..Default::default()
        });

        let options = UpdateServiceOptionsBuilder::default()
            .version(version as i32)
            .build();
        self.docker
            .update_service(name, service_spec, options, None)
            .await?;
        Ok(())
    }

    pub async fn remove_service(&self, name: &str) -> Result<()> {
        match self.docker.delete_service(name).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => {
                Err(Error::not_found(format!("service `{name}` does not exist")))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Tasks belonging to a swarm service, optionally narrowed by a label
    /// selector or desired state.
    pub async fn service_tasks(
        &self,
        service_name: &str,
        label: Option<&str>,
        desired_state: Option<&str>,
    ) -> Result<Vec<Task>> {
        let mut filters: HashMap<String, Vec<String>> =
            HashMap::from([("service".to_string(), vec![service_name.to_string()])]);
        if let Some(label) = label {
            filters.insert("label".to_string(), vec![label.to_string()]);
        }
        if let Some(state) = desired_state {
            filters.insert("desired-state".to_string(), vec![state.to_string()]);
        }

        let options = ListTasksOptionsBuilder::default().filters(&filters).build();
        let tasks = self.docker.list_tasks(Some(options)).await?;
        Ok(tasks)
    }
}

pub(crate) fn docker_credentials(credentials: &RegistryCredentials) -> DockerCredentials {
    DockerCredentials {
        username: Some(credentials.username.clone()),
        password: Some(credentials.password.clone()),
        ..Default::default()
    }
}
