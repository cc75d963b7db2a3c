use bollard::exec::{StartExecOptions, StartExecResults};
use bollard::models::ExecConfig;
use futures::StreamExt;

use super::SwarmClient;
use crate::error::Result;

impl SwarmClient {
    /// Run a shell command inside a container and wait for it, returning
    /// the exit code and captured output. This is how COMMAND healthchecks
    /// probe a running task.
    pub async fn exec_in_container(
        &self,
        container_id: &str,
        command: &str,
    ) -> Result<(i64, String)> {
        let config = ExecConfig {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()]),
            ..Default::default()
        };

        let exec = self.docker.create_exec(container_id, config).await?;
        let started = self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions { detach: false, ..Default::default() }))
            .await?;

        let mut captured = String::new();
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                let chunk = chunk?;
                captured.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
            }
        }

        let inspection = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = inspection.exit_code.unwrap_or(-1);
        Ok((exit_code, captured))
    }
}
