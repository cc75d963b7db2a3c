//! The healthcheck evaluator.
//!
//! One evaluator serves both callers: the deploy workflow runs it in
//! [`HealthcheckMode::Bounded`] with an overall budget and a poll
//! interval, and the monitor schedule runs a single
//! [`HealthcheckMode::OneShot`] pass. The swarm task state is mapped
//! through a fixed matrix; a custom command or HTTP probe only runs once
//! the task itself is `running`.

use std::time::Duration;

use bollard::models::{Task, TaskState};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use zane_common::service::{HealthcheckConfig, HealthcheckKind};
use zane_common::DeploymentStatus;

use crate::args::EngineConfig;
use crate::deployment::DeploymentTarget;
use crate::error::{Error, Result};
use crate::swarm::SwarmClient;

const STARTING_FAILURE_REASON: &str =
    "The service failed to meet the healthcheck requirements when starting the service.";
const SCALED_DOWN_REASON: &str =
    "An Unknown error occurred, did you manually scale down the service ?";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthcheckMode {
    /// Poll until healthy or the budget runs out (first-time check during
    /// a deploy).
    Bounded,
    /// A single evaluation pass (monitor schedule).
    OneShot,
}

/// What the task-state matrix concluded about a deployment.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskEvaluation {
    pub status: DeploymentStatus,
    pub reason: Option<String>,
    pub container_id: Option<String>,
}

/// Map the deployment's task list onto a deployment status.
///
/// The task with the largest `Version.Index` is authoritative. More than
/// one concurrent task means the service is being restarted, so the
/// not-yet-running states map to `Restarting` instead of `Starting`.
/// Returns `None` when no task was observed at all.
pub fn evaluate_tasks(tasks: &[Task]) -> Option<TaskEvaluation> {
    let most_recent = tasks
        .iter()
        .max_by_key(|task| task.version.as_ref().and_then(|version| version.index).unwrap_or(0))?;

    let starting_status = if tasks.len() > 1 {
        DeploymentStatus::Restarting
    } else {
        DeploymentStatus::Starting
    };

    let task_status = most_recent.status.as_ref();
    let state = task_status.and_then(|status| status.state);
    let err = task_status.and_then(|status| status.err.clone());
    let message = task_status.and_then(|status| status.message.clone());
    let exit_code = task_status
        .and_then(|status| status.container_status.as_ref())
        .and_then(|container| container.exit_code);
    let container_id = task_status
        .and_then(|status| status.container_status.as_ref())
        .and_then(|container| container.container_id.clone());

    let mut status = match state {
        Some(TaskState::RUNNING) => DeploymentStatus::Healthy,
        Some(TaskState::COMPLETE) | Some(TaskState::SHUTDOWN) | Some(TaskState::REMOVE) => {
            DeploymentStatus::Removed
        }
        Some(TaskState::FAILED) | Some(TaskState::REJECTED) | Some(TaskState::ORPHANED) => {
            DeploymentStatus::Unhealthy
        }
        _ => starting_status,
    };

    // A shutdown task that errored or exited non-zero did not stop cleanly.
    if state == Some(TaskState::SHUTDOWN) && (err.is_some() || matches!(exit_code, Some(code) if code != 0))
    {
        status = DeploymentStatus::Unhealthy;
    }

    Some(TaskEvaluation { status, reason: err.or(message), container_id })
}

/// Run the healthcheck for a deployment and return `(status, reason)`.
///
/// Errors only when the deployment's swarm service does not exist, which
/// is non-retryable: a timed-out or failing probe is a result, not an
/// error.
#[allow(clippy::too_many_arguments)]
pub async fn run_healthcheck(
    swarm: &SwarmClient,
    http: &reqwest::Client,
    config: &EngineConfig,
    target: &DeploymentTarget,
    healthcheck: Option<&HealthcheckConfig>,
    auth_token: &str,
    last_status: DeploymentStatus,
    mode: HealthcheckMode,
) -> Result<(DeploymentStatus, Option<String>)> {
    let service_name = target.service_name();
    if swarm.inspect_service(&service_name).await?.is_none() {
        return Err(Error::not_found(format!(
            "cannot run a healthcheck on nonexistent deployment `{}`",
            target.hash
        )));
    }

    let timeout = healthcheck
        .and_then(|healthcheck| healthcheck.timeout_seconds)
        .unwrap_or(config.healthcheck_timeout);
    let wait_interval = Duration::from_secs(config.healthcheck_wait_interval);
    let started = Instant::now();

    let mut status = DeploymentStatus::Unhealthy;
    let mut reason = Some(STARTING_FAILURE_REASON.to_string());
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let time_left = Duration::from_secs(timeout).saturating_sub(started.elapsed());
        debug!(
            deployment = %target.hash,
            attempt = attempts,
            time_left = time_left.as_secs(),
            "healthcheck attempt"
        );

        let label = format!("deployment_hash={}", target.hash);
        let tasks = swarm.service_tasks(&service_name, Some(&label), None).await?;

        match evaluate_tasks(&tasks) {
            None => {
                if last_status.has_started() {
                    return Ok((DeploymentStatus::Unhealthy, Some(SCALED_DOWN_REASON.to_string())));
                }
            }
            Some(evaluation) => {
                status = evaluation.status;
                reason = evaluation.reason;

                if status == DeploymentStatus::Healthy {
                    if let Some(healthcheck) = healthcheck {
                        let probe_budget = std::cmp::min(time_left, Duration::from_secs(5));
                        let (probe_status, probe_reason) = run_probe(
                            swarm,
                            http,
                            config,
                            healthcheck,
                            target,
                            auth_token,
                            evaluation.container_id.as_deref(),
                            probe_budget,
                        )
                        .await;
                        status = probe_status;
                        reason = probe_reason;
                    }
                }
            }
        }

        if mode == HealthcheckMode::OneShot {
            info!(deployment = %target.hash, ?status, "healthcheck pass finished");
            return Ok((status, reason));
        }

        if status == DeploymentStatus::Healthy {
            info!(deployment = %target.hash, attempts, "deployment is healthy");
            return Ok((status, reason));
        }

        let time_left = Duration::from_secs(timeout).saturating_sub(started.elapsed());
        if time_left > wait_interval {
            debug!(
                deployment = %target.hash,
                attempt = attempts,
                "healthcheck attempt failed, retrying in {}s",
                wait_interval.as_secs()
            );
            sleep(wait_interval).await;
            continue;
        }

        return Ok((status, reason));
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_probe(
    swarm: &SwarmClient,
    http: &reqwest::Client,
    config: &EngineConfig,
    healthcheck: &HealthcheckConfig,
    target: &DeploymentTarget,
    auth_token: &str,
    container_id: Option<&str>,
    budget: Duration,
) -> (DeploymentStatus, Option<String>) {
    debug!(
        deployment = %target.hash,
        kind = %healthcheck.kind,
        value = %healthcheck.value,
        "running custom healthcheck"
    );

    match healthcheck.kind {
        HealthcheckKind::Command => {
            let Some(container_id) = container_id else {
                return (
                    DeploymentStatus::Unhealthy,
                    Some("no container to run the healthcheck command in".to_string()),
                );
            };
            match swarm.exec_in_container(container_id, &healthcheck.value).await {
                Ok((0, output)) => (DeploymentStatus::Healthy, Some(output)),
                Ok((_, output)) => (DeploymentStatus::Unhealthy, Some(output)),
                Err(err) => (DeploymentStatus::Unhealthy, Some(err.to_string())),
            }
        }
        HealthcheckKind::Path => {
            let Some(deployment_url) = target.url.as_deref() else {
                return (
                    DeploymentStatus::Unhealthy,
                    Some("deployment has no URL to probe".to_string()),
                );
            };
            let full_url = format!(
                "{}://{}{}",
                config.probe_scheme(),
                deployment_url,
                healthcheck.value
            );
            let response = http
                .get(&full_url)
                .header("Authorization", format!("Token {auth_token}"))
                .timeout(budget)
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = if response.status() == reqwest::StatusCode::OK {
                        DeploymentStatus::Healthy
                    } else {
                        DeploymentStatus::Unhealthy
                    };
                    let body = response.text().await.unwrap_or_default();
                    (status, Some(body))
                }
                Err(err) => (DeploymentStatus::Unhealthy, Some(err.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bollard::models::{ContainerStatus, ObjectVersion, TaskStatus};
    use pretty_assertions::assert_eq;

    use super::*;

    fn task(index: u64, state: TaskState) -> Task {
        Task {
            version: Some(ObjectVersion { index: Some(index) }),
            status: Some(TaskStatus { state: Some(state), ..Default::default() }),
            ..Default::default()
        }
    }

    fn task_with_exit(index: u64, state: TaskState, exit_code: i64, err: Option<&str>) -> Task {
        Task {
            version: Some(ObjectVersion { index: Some(index) }),
            status: Some(TaskStatus {
                state: Some(state),
                err: err.map(str::to_string),
                container_status: Some(ContainerStatus {
                    exit_code: Some(exit_code),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn no_tasks_is_not_an_evaluation() {
        assert_eq!(evaluate_tasks(&[]), None);
    }

    #[test]
    fn the_largest_version_index_wins() {
        let tasks = vec![
            task_with_exit(7, TaskState::SHUTDOWN, 0, None),
            task(12, TaskState::RUNNING),
        ];
        let evaluation = evaluate_tasks(&tasks).unwrap();
        assert_eq!(evaluation.status, DeploymentStatus::Healthy);
    }

    #[test]
    fn single_pending_task_is_starting_but_two_are_restarting() {
        let single = vec![task(1, TaskState::PENDING)];
        assert_eq!(evaluate_tasks(&single).unwrap().status, DeploymentStatus::Starting);

        let double = vec![task(1, TaskState::SHUTDOWN), task(2, TaskState::PREPARING)];
        assert_eq!(evaluate_tasks(&double).unwrap().status, DeploymentStatus::Restarting);
    }

    #[test]
    fn clean_shutdown_is_removed_but_dirty_shutdown_is_unhealthy() {
        let clean = vec![task_with_exit(3, TaskState::SHUTDOWN, 0, None)];
        assert_eq!(evaluate_tasks(&clean).unwrap().status, DeploymentStatus::Removed);

        let non_zero = vec![task_with_exit(3, TaskState::SHUTDOWN, 137, None)];
        assert_eq!(evaluate_tasks(&non_zero).unwrap().status, DeploymentStatus::Unhealthy);

        let errored = vec![task_with_exit(3, TaskState::SHUTDOWN, 0, Some("task: non-zero exit"))];
        let evaluation = evaluate_tasks(&errored).unwrap();
        assert_eq!(evaluation.status, DeploymentStatus::Unhealthy);
        assert_eq!(evaluation.reason.as_deref(), Some("task: non-zero exit"));
    }

    #[test]
    fn failed_and_rejected_tasks_are_unhealthy() {
        for state in [TaskState::FAILED, TaskState::REJECTED, TaskState::ORPHANED] {
            let tasks = vec![task(1, state)];
            assert_eq!(evaluate_tasks(&tasks).unwrap().status, DeploymentStatus::Unhealthy);
        }
    }

    #[test]
    fn the_error_string_beats_the_message() {
        let tasks = vec![Task {
            version: Some(ObjectVersion { index: Some(1) }),
            status: Some(TaskStatus {
                state: Some(TaskState::FAILED),
                err: Some("No such image".to_string()),
                message: Some("started".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let evaluation = evaluate_tasks(&tasks).unwrap();
        assert_eq!(evaluation.reason.as_deref(), Some("No such image"));
    }

    #[test]
    fn container_id_is_surfaced_for_command_probes() {
        let tasks = vec![Task {
            version: Some(ObjectVersion { index: Some(1) }),
            status: Some(TaskStatus {
                state: Some(TaskState::RUNNING),
                container_status: Some(ContainerStatus {
                    container_id: Some("c0ffee".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let evaluation = evaluate_tasks(&tasks).unwrap();
        assert_eq!(evaluation.container_id.as_deref(), Some("c0ffee"));
    }
}
