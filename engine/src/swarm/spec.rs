//! Construction of the swarm `ServiceSpec` for a deployment.

use std::collections::HashSet;

use bollard::models::{
    EndpointPortConfig, EndpointPortConfigProtocolEnum, EndpointPortConfigPublishModeEnum,
    EndpointSpec, Limit, Mount, MountTypeEnum, NetworkAttachmentConfig, ServiceSpec,
    ServiceSpecMode, ServiceSpecModeReplicated, TaskSpec, TaskSpecContainerSpec, TaskSpecLogDriver,
    TaskSpecResources, TaskSpecRestartPolicy, TaskSpecRestartPolicyConditionEnum,
};

use zane_common::names::{project_network_name, resource_labels, volume_resource_name};

use crate::args::EngineConfig;
use crate::deployment::DeploymentDetails;

const RESTART_MAX_ATTEMPTS: i64 = 3;
const RESTART_DELAY_NS: i64 = 5_000_000_000;

/// Build the full service spec for a deployment.
///
/// `existing_volumes` is the set of managed volume names that actually
/// exist; a volume whose resource has been deleted out from under us is
/// skipped rather than letting the create call fail.
pub fn deployment_service_spec(
    deployment: &DeploymentDetails,
    existing_volumes: &HashSet<String>,
    config: &EngineConfig,
) -> ServiceSpec {
    let service = &deployment.service;

    let mut env: Vec<String> = service
        .env_variables
        .iter()
        .map(|variable| format!("{}={}", variable.key, variable.value))
        .collect();
    env.extend([
        "ZANE=1".to_string(),
        format!("ZANE_DEPLOYMENT_SLOT={}", deployment.slot),
        format!("ZANE_DEPLOYMENT_HASH={}", deployment.unprefixed_hash()),
        "ZANE_DEPLOYMENT_TYPE=docker".to_string(),
        format!("ZANE_PRIVATE_DOMAIN={}", service.network_alias),
        format!("ZANE_SERVICE_ID={}", service.id),
        format!("ZANE_SERVICE_NAME={}", service.slug),
        format!("ZANE_PROJECT_ID={}", service.project_id),
        format!(
            "ZANE_DEPLOYMENT_URL={}",
            deployment.url.as_deref().unwrap_or("\"\"")
        ),
    ]);

    let mut mounts: Vec<Mount> = Vec::new();
    for volume in service.docker_volumes() {
        let volume_name = volume_resource_name(&volume.id);
        // Only mount volumes whose resource still exists.
        if !existing_volumes.contains(&volume_name) {
            continue;
        }
        mounts.push(Mount {
            target: Some(volume.container_path.clone()),
            source: Some(volume_name),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(volume.mode == zane_common::service::VolumeMode::ReadOnly),
            ..Default::default()
        });
    }
    for volume in service.host_volumes() {
        mounts.push(Mount {
            target: Some(volume.container_path.clone()),
            source: volume.host_path.clone(),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(volume.mode == zane_common::service::VolumeMode::ReadOnly),
            ..Default::default()
        });
    }

    // HTTP ports are fronted by the proxy; only the rest get published.
    let published_ports: Vec<EndpointPortConfig> = service
        .non_http_ports()
        .iter()
        .map(|port| EndpointPortConfig {
            target_port: Some(port.forwarded as i64),
            published_port: port.host.map(|host| host as i64),
            protocol: Some(EndpointPortConfigProtocolEnum::TCP),
            publish_mode: Some(EndpointPortConfigPublishModeEnum::INGRESS),
            ..Default::default()
        })
        .collect();
    let endpoint_spec = if published_ports.is_empty() {
        None
    } else {
        Some(EndpointSpec { ports: Some(published_ports), ..Default::default() })
    };

    let labels = resource_labels(
        &service.project_id,
        [
            ("deployment_hash", deployment.hash.as_str()),
            ("service", service.id.as_str()),
        ],
    );

    let log_driver = Some(TaskSpecLogDriver {
        name: Some("fluentd".to_string()),
        options: Some(
            [
                ("fluentd-address".to_string(), config.fluentd_host.clone()),
                (
                    "tag".to_string(),
                    serde_json::json!({
                        "service_id": service.id,
                        "deployment_id": deployment.hash,
                    })
                    .to_string(),
                ),
                ("mode".to_string(), "non-blocking".to_string()),
                ("fluentd-async".to_string(), "true".to_string()),
                ("fluentd-max-retries".to_string(), "10".to_string()),
                ("fluentd-sub-second-precision".to_string(), "true".to_string()),
            ]
            .into(),
        ),
    });

    let resources = service.resource_limits.as_ref().map(|limits| TaskSpecResources {
        limits: Some(Limit {
            nano_cpus: limits.cpus.map(|cpus| (cpus * 1_000_000_000.0) as i64),
            memory_bytes: limits.memory_bytes,
            ..Default::default()
        }),
        ..Default::default()
    });

    ServiceSpec {
        name: Some(deployment.service_name()),
        labels: Some(labels.clone()),
        mode: Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated { replicas: Some(1) }),
            ..Default::default()
        }),
        task_template: Some(TaskSpec {
            container_spec: Some(TaskSpecContainerSpec {
                image: Some(service.image.clone()),
                command: service
                    .command
                    .as_ref()
                    .map(|command| command.split_whitespace().map(str::to_string).collect()),
                env: Some(env),
                labels: Some(labels),
                mounts: if mounts.is_empty() { None } else { Some(mounts) },
                ..Default::default()
            }),
            networks: Some(vec![NetworkAttachmentConfig {
                target: Some(project_network_name(&service.project_id)),
                aliases: Some(deployment.network_aliases(&config.internal_domain)),
                ..Default::default()
            }]),
            restart_policy: Some(TaskSpecRestartPolicy {
                condition: Some(TaskSpecRestartPolicyConditionEnum::ON_FAILURE),
                max_attempts: Some(RESTART_MAX_ATTEMPTS),
                delay: Some(RESTART_DELAY_NS),
                ..Default::default()
            }),
            resources,
            log_driver,
            ..Default::default()
        }),
        endpoint_spec,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use zane_common::service::{
        EnvVariable, PortConfig, ResourceLimits, ServiceSnapshot, VolumeConfig, VolumeMode,
    };
    use zane_common::DeploymentSlot;

    use super::*;

    fn deployment() -> DeploymentDetails {
        DeploymentDetails {
            hash: "dpl_dkr_h1".into(),
            slot: DeploymentSlot::Blue,
            queued_at: Utc::now(),
            url: Some("h1.zaneops.dev".into()),
            auth_token: "token".into(),
            service: ServiceSnapshot {
                id: "app".into(),
                slug: "app".into(),
                project_id: "p1".into(),
                environment_id: Some("production".into()),
                image: "ghcr.io/acme/app:v3".into(),
                command: Some("caddy run --watch".into()),
                credentials: None,
                env_variables: vec![EnvVariable { key: "PORT".into(), value: "80".into() }],
                volumes: vec![
                    VolumeConfig {
                        id: "vol_data".into(),
                        name: Some("data".into()),
                        container_path: "/data".into(),
                        host_path: None,
                        mode: VolumeMode::ReadWrite,
                    },
                    VolumeConfig {
                        id: "vol_gone".into(),
                        name: None,
                        container_path: "/gone".into(),
                        host_path: None,
                        mode: VolumeMode::ReadWrite,
                    },
                    VolumeConfig {
                        id: "vol_host".into(),
                        name: None,
                        container_path: "/etc/config".into(),
                        host_path: Some("/srv/config".into()),
                        mode: VolumeMode::ReadOnly,
                    },
                ],
                ports: vec![
                    PortConfig { host: None, forwarded: 80 },
                    PortConfig { host: Some(5432), forwarded: 5432 },
                ],
                urls: vec![],
                healthcheck: None,
                resource_limits: Some(ResourceLimits {
                    cpus: Some(1.5),
                    memory_bytes: Some(536_870_912),
                }),
                network_alias: "app".into(),
                network_aliases: vec!["app".into()],
            },
            changes: vec![],
        }
    }

    fn existing(names: &[&str]) -> HashSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn spec_is_named_after_the_deployment() {
        let spec = deployment_service_spec(&deployment(), &existing(&[]), &EngineConfig::default());
        assert_eq!(spec.name.as_deref(), Some("srv-p1-app-dpl_dkr_h1"));

        let mode = spec.mode.unwrap();
        assert_eq!(mode.replicated.unwrap().replicas, Some(1));
    }

    #[test]
    fn zane_variables_are_injected_after_user_env() {
        let spec = deployment_service_spec(&deployment(), &existing(&[]), &EngineConfig::default());
        let env = spec.task_template.unwrap().container_spec.unwrap().env.unwrap();

        assert_eq!(env[0], "PORT=80");
        assert!(env.contains(&"ZANE=1".to_string()));
        assert!(env.contains(&"ZANE_DEPLOYMENT_SLOT=BLUE".to_string()));
        assert!(env.contains(&"ZANE_DEPLOYMENT_HASH=h1".to_string()));
        assert!(env.contains(&"ZANE_DEPLOYMENT_TYPE=docker".to_string()));
        assert!(env.contains(&"ZANE_PRIVATE_DOMAIN=app".to_string()));
        assert!(env.contains(&"ZANE_SERVICE_ID=app".to_string()));
        assert!(env.contains(&"ZANE_PROJECT_ID=p1".to_string()));
        assert!(env.contains(&"ZANE_DEPLOYMENT_URL=h1.zaneops.dev".to_string()));
    }

    #[test]
    fn a_missing_deployment_url_is_quoted_empty() {
        let mut details = deployment();
        details.url = None;
        let spec = deployment_service_spec(&details, &existing(&[]), &EngineConfig::default());
        let env = spec.task_template.unwrap().container_spec.unwrap().env.unwrap();
        assert!(env.contains(&"ZANE_DEPLOYMENT_URL=\"\"".to_string()));
    }

    #[test]
    fn mounts_skip_volumes_whose_resource_is_gone() {
        let spec = deployment_service_spec(
            &deployment(),
            &existing(&["vol-vol_data"]),
            &EngineConfig::default(),
        );
        let mounts = spec.task_template.unwrap().container_spec.unwrap().mounts.unwrap();

        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].source.as_deref(), Some("vol-vol_data"));
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::VOLUME));
        assert_eq!(mounts[0].read_only, Some(false));
        // The host volume needs no managed resource.
        assert_eq!(mounts[1].source.as_deref(), Some("/srv/config"));
        assert_eq!(mounts[1].typ, Some(MountTypeEnum::BIND));
        assert_eq!(mounts[1].read_only, Some(true));
    }

    #[test]
    fn only_non_http_ports_are_published() {
        let spec = deployment_service_spec(&deployment(), &existing(&[]), &EngineConfig::default());
        let ports = spec.endpoint_spec.unwrap().ports.unwrap();

        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].published_port, Some(5432));
        assert_eq!(ports[0].target_port, Some(5432));
    }

    #[test]
    fn no_endpoint_spec_without_published_ports() {
        let mut details = deployment();
        details.service.ports = vec![PortConfig { host: None, forwarded: 80 }];
        let spec = deployment_service_spec(&details, &existing(&[]), &EngineConfig::default());
        assert!(spec.endpoint_spec.is_none());
    }

    #[test]
    fn network_attachment_carries_the_slot_alias() {
        let spec = deployment_service_spec(&deployment(), &existing(&[]), &EngineConfig::default());
        let networks = spec.task_template.unwrap().networks.unwrap();

        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].target.as_deref(), Some("net-p1"));
        assert_eq!(
            networks[0].aliases.as_ref().unwrap(),
            &vec!["app".to_string(), "app.blue.zaneops.internal".to_string()],
        );
    }

    #[test]
    fn restart_policy_and_log_driver_are_pinned() {
        let spec = deployment_service_spec(&deployment(), &existing(&[]), &EngineConfig::default());
        let task_template = spec.task_template.unwrap();

        let restart = task_template.restart_policy.unwrap();
        assert_eq!(restart.condition, Some(TaskSpecRestartPolicyConditionEnum::ON_FAILURE));
        assert_eq!(restart.max_attempts, Some(3));
        assert_eq!(restart.delay, Some(5_000_000_000));

        let log_driver = task_template.log_driver.unwrap();
        assert_eq!(log_driver.name.as_deref(), Some("fluentd"));
        let options = log_driver.options.unwrap();
        assert_eq!(options.get("mode").map(String::as_str), Some("non-blocking"));
        let tag: serde_json::Value = serde_json::from_str(options.get("tag").unwrap()).unwrap();
        assert_eq!(tag["service_id"], "app");
        assert_eq!(tag["deployment_id"], "dpl_dkr_h1");
    }

    #[test]
    fn labels_mark_the_resource_as_managed() {
        let spec = deployment_service_spec(&deployment(), &existing(&[]), &EngineConfig::default());
        let labels = spec.labels.unwrap();

        assert_eq!(labels.get("zane-managed").map(String::as_str), Some("true"));
        assert_eq!(labels.get("zane-project").map(String::as_str), Some("p1"));
        assert_eq!(labels.get("deployment_hash").map(String::as_str), Some("dpl_dkr_h1"));
        assert_eq!(labels.get("service").map(String::as_str), Some("app"));

        // Task labels mirror the service labels so healthchecks can filter
        // the task list by deployment hash.
        let container_labels =
            spec.task_template.unwrap().container_spec.unwrap().labels.unwrap();
        assert_eq!(
            container_labels.get("deployment_hash").map(String::as_str),
            Some("dpl_dkr_h1")
        );
    }

    #[test]
    fn resource_limits_convert_to_nano_cpus() {
        let spec = deployment_service_spec(&deployment(), &existing(&[]), &EngineConfig::default());
        let limits = spec.task_template.unwrap().resources.unwrap().limits.unwrap();
        assert_eq!(limits.nano_cpus, Some(1_500_000_000));
        assert_eq!(limits.memory_bytes, Some(536_870_912));
    }
}
