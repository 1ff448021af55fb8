use std::collections::HashMap;
use std::time::Duration;

use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions, WaitContainerOptions,
};
use futures::StreamExt;

use crate::constants::WORKSPACE_MOUNT;
use crate::sandbox::{Sandbox, SandboxError, SandboxSpec, SandboxUsage, WaitOutcome};

const CPU_PERIOD_US: i64 = 100_000;
const SANDBOX_USER: &str = "65534:65534";

/// Docker Engine implementation of the container layer. One container per
/// execution: workspace bind mount, hard memory limit, CPU quota, pid
/// limit, dropped capabilities, no-new-privileges, noexec tmpfs and an
/// isolated network namespace unless the environment enables egress.
#[derive(Clone)]
pub struct DockerSandbox {
    docker: Docker,
}

impl std::fmt::Debug for DockerSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerSandbox").finish_non_exhaustive()
    }
}

impl DockerSandbox {
    pub fn new() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Launch(e.to_string()))?;
        Ok(Self { docker })
    }

    fn host_config(spec: &SandboxSpec) -> HostConfig {
        let memory = spec.memory_limit_bytes;
        HostConfig {
            binds: Some(vec![format!(
                "{}:{}",
                spec.workspace_dir.display(),
                WORKSPACE_MOUNT
            )]),
            memory: Some(memory),
            // No swap headroom beyond the memory ceiling.
            memory_swap: Some(memory),
            cpu_period: Some(CPU_PERIOD_US),
            cpu_quota: Some((spec.cpu_cores * CPU_PERIOD_US as f64) as i64),
            pids_limit: Some(spec.pids_limit),
            cap_drop: Some(vec!["ALL".to_string()]),
            // Minimum needed for toolchains that chown/setuid during setup.
            cap_add: Some(vec![
                "CHOWN".to_string(),
                "SETUID".to_string(),
                "SETGID".to_string(),
            ]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                "rw,noexec,nosuid,size=64m".to_string(),
            )])),
            network_mode: Some(if spec.network_enabled {
                "bridge".to_string()
            } else {
                "none".to_string()
            }),
            ..Default::default()
        }
    }
}

/// "Already gone" is success for teardown calls.
fn ignore_missing(err: bollard::errors::Error) -> Result<(), SandboxError> {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 304,
            ..
        } => Ok(()),
        other => Err(SandboxError::Runtime(other.to_string())),
    }
}

#[async_trait::async_trait]
impl Sandbox for DockerSandbox {
    async fn launch(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        let options = Some(CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            user: Some(SANDBOX_USER.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(!spec.network_enabled),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(options, body)
            .await
            .map_err(|e| SandboxError::Launch(e.to_string()))?;

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<StartContainerOptions>)
            .await
        {
            // Launch failed halfway; don't leak the created container.
            let _ = self.remove(&container.id).await;
            return Err(SandboxError::Launch(e.to_string()));
        }

        tracing::debug!(container = %container.id, image = %spec.image, "sandbox launched");
        Ok(container.id)
    }

    async fn wait(&self, container_id: &str, limit: Duration) -> Result<WaitOutcome, SandboxError> {
        let mut wait_stream = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions>);

        tokio::select! {
            next = wait_stream.next() => match next {
                Some(Ok(response)) => Ok(WaitOutcome::Exited(response.status_code)),
                // Non-zero exits surface as a dedicated error variant.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Ok(WaitOutcome::Exited(code))
                }
                Some(Err(e)) => Err(SandboxError::Runtime(e.to_string())),
                None => Err(SandboxError::Runtime(
                    "container wait stream ended unexpectedly".to_string(),
                )),
            },
            _ = tokio::time::sleep(limit) => Ok(WaitOutcome::TimedOut),
        }
    }

    async fn collect_logs(&self, container_id: &str) -> Result<(String, String), SandboxError> {
        let mut log_stream = self.docker.logs(
            container_id,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(entry) = log_stream.next().await {
            match entry.map_err(|e| SandboxError::Runtime(e.to_string()))? {
                LogOutput::StdOut { message } => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdErr { message } => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }
        Ok((stdout, stderr))
    }

    async fn usage(&self, container_id: &str) -> Result<SandboxUsage, SandboxError> {
        let mut usage = SandboxUsage::default();

        let mut stats_stream = self.docker.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        if let Some(Ok(stats)) = stats_stream.next().await {
            if let Some(memory) = stats.memory_stats {
                usage.memory_peak_bytes = memory.max_usage.or(memory.usage).unwrap_or(0);
            }
            if let Some(cpu_usage) = stats.cpu_stats.and_then(|c| c.cpu_usage) {
                usage.cpu_time_ms = cpu_usage.total_usage.unwrap_or(0) / 1_000_000;
            }
        }

        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| SandboxError::Runtime(e.to_string()))?;
        usage.oom_killed = inspect
            .state
            .and_then(|s| s.oom_killed)
            .unwrap_or(false);

        Ok(usage)
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), SandboxError> {
        // Docker sends SIGTERM, then SIGKILL once the grace period elapses.
        match self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: Some(grace.as_secs() as i32),
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => ignore_missing(e),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), SandboxError> {
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => ignore_missing(e),
        }
    }
}
