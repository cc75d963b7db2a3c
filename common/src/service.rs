use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Immutable description of a service, captured at enqueue time and
/// embedded in the deployment row. Workflows and activities only ever see
/// this snapshot, never the live service record, so a rollout is not
/// affected by edits made while it runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub id: String,
    pub slug: String,
    pub project_id: String,
    /// Environment the service belongs to (e.g. `production`).
    #[serde(default)]
    pub environment_id: Option<String>,
    pub image: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub credentials: Option<RegistryCredentials>,
    #[serde(default)]
    pub env_variables: Vec<EnvVariable>,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub urls: Vec<UrlConfig>,
    #[serde(default)]
    pub healthcheck: Option<HealthcheckConfig>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    /// DNS name the slot aliases hang off of (`{alias}.blue.{domain}`).
    pub network_alias: String,
    #[serde(default)]
    pub network_aliases: Vec<String>,
}

impl ServiceSnapshot {
    /// The port fronted by the proxy, if any. HTTP ports have no host
    /// binding; they are reached through the blue/green upstreams only.
    pub fn http_port(&self) -> Option<&PortConfig> {
        self.ports.iter().find(|port| port.host.is_none())
    }

    /// Ports published directly on the swarm service endpoint.
    pub fn non_http_ports(&self) -> Vec<&PortConfig> {
        self.ports.iter().filter(|port| port.host.is_some()).collect()
    }

    /// Volumes backed by an engine-managed docker volume resource.
    pub fn docker_volumes(&self) -> Vec<&VolumeConfig> {
        self.volumes
            .iter()
            .filter(|volume| volume.host_path.is_none())
            .collect()
    }

    /// Volumes bound to a path on the node; these have no managed resource.
    pub fn host_volumes(&self) -> Vec<&VolumeConfig> {
        self.volumes
            .iter()
            .filter(|volume| volume.host_path.is_some())
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvVariable {
    pub key: String,
    pub value: String,
}

/// `(host, forwarded)` port pair. `host: None` marks the HTTP port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default)]
    pub host: Option<u16>,
    pub forwarded: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub container_path: String,
    #[serde(default)]
    pub host_path: Option<String>,
    #[serde(default)]
    pub mode: VolumeMode,
}

#[derive(
    Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

impl VolumeMode {
    /// The mount access flag docker expects.
    pub fn flag(&self) -> &'static str {
        match self {
            Self::ReadWrite => "rw",
            Self::ReadOnly => "ro",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UrlConfig {
    pub domain: String,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default)]
    pub strip_prefix: bool,
    #[serde(default)]
    pub redirect_to: Option<RedirectConfig>,
    #[serde(default)]
    pub associated_port: Option<u16>,
}

fn default_base_path() -> String {
    "/".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RedirectConfig {
    pub url: String,
    #[serde(default)]
    pub permanent: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    #[serde(rename = "type")]
    pub kind: HealthcheckKind,
    /// A shell command for `Command` probes, a request path for `Path` ones.
    pub value: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
}

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthcheckKind {
    Command,
    Path,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub memory_bytes: Option<i64>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn snapshot_with_ports(ports: Vec<PortConfig>) -> ServiceSnapshot {
        ServiceSnapshot {
            id: "srv_1".into(),
            slug: "app".into(),
            project_id: "p1".into(),
            environment_id: Some("production".into()),
            image: "ghcr.io/acme/app:latest".into(),
            command: None,
            credentials: None,
            env_variables: vec![],
            volumes: vec![],
            ports,
            urls: vec![],
            healthcheck: None,
            resource_limits: None,
            network_alias: "app".into(),
            network_aliases: vec!["app".into()],
        }
    }

    #[test]
    fn http_port_is_the_unbound_one() {
        let snapshot = snapshot_with_ports(vec![
            PortConfig { host: Some(5432), forwarded: 5432 },
            PortConfig { host: None, forwarded: 80 },
        ]);

        assert_eq!(snapshot.http_port().unwrap().forwarded, 80);
        let non_http: Vec<u16> = snapshot
            .non_http_ports()
            .iter()
            .map(|port| port.forwarded)
            .collect();
        assert_eq!(non_http, vec![5432]);
    }

    #[test]
    fn volumes_split_between_managed_and_host() {
        let mut snapshot = snapshot_with_ports(vec![]);
        snapshot.volumes = vec![
            VolumeConfig {
                id: "vol_a".into(),
                name: Some("data".into()),
                container_path: "/data".into(),
                host_path: None,
                mode: VolumeMode::ReadWrite,
            },
            VolumeConfig {
                id: "vol_b".into(),
                name: None,
                container_path: "/etc/config".into(),
                host_path: Some("/srv/config".into()),
                mode: VolumeMode::ReadOnly,
            },
        ];

        assert_eq!(snapshot.docker_volumes().len(), 1);
        assert_eq!(snapshot.docker_volumes()[0].id, "vol_a");
        assert_eq!(snapshot.host_volumes().len(), 1);
        assert_eq!(snapshot.host_volumes()[0].mode.flag(), "ro");
    }

    #[test]
    fn snapshot_deserializes_with_defaults() {
        let snapshot: ServiceSnapshot = serde_json::from_value(serde_json::json!({
            "id": "srv_1",
            "slug": "app",
            "project_id": "p1",
            "image": "nginx:alpine",
            "network_alias": "app",
        }))
        .unwrap();

        assert!(snapshot.ports.is_empty());
        assert!(snapshot.healthcheck.is_none());
        assert!(snapshot.http_port().is_none());
    }

    #[test]
    fn url_base_path_defaults_to_root() {
        let url: UrlConfig = serde_json::from_value(serde_json::json!({
            "domain": "app.example.com",
        }))
        .unwrap();

        assert_eq!(url.base_path, "/");
        assert!(!url.strip_prefix);
        assert!(url.redirect_to.is_none());
    }
}
