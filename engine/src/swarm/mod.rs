//! Orchestrator adapter: a thin semantic wrapper over the Docker Swarm
//! service, task, volume and network APIs.
//!
//! Domain methods live in sibling modules (`service`, `volume`, `network`,
//! `image`, `exec`, `proxy_service`) which add `impl SwarmClient` blocks.

mod exec;
mod image;
mod network;
mod proxy_service;
mod service;
pub mod spec;
mod volume;

pub use proxy_service::NetworkRef;

use bollard::Docker;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct SwarmClient {
    pub(crate) docker: Docker,
}

impl SwarmClient {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect to the daemon at `socket_path` (empty means the platform
    /// default).
    pub fn connect(socket_path: &str) -> Result<Self> {
        let docker = if socket_path.is_empty() {
            Docker::connect_with_defaults()
        } else {
            let clean_path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(clean_path, 120, bollard::API_DEFAULT_VERSION)
        };
        Ok(Self { docker: docker.map_err(Error::from)? })
    }
}

/// Whether the daemon reported the resource as absent.
pub(crate) fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}
