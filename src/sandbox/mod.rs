use std::path::PathBuf;
use std::time::Duration;

pub mod docker;
pub mod stub;

pub use docker::DockerSandbox;
pub use stub::StubSandbox;

/// Everything the container layer needs to launch one isolated run.
#[derive(Clone, Debug)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    /// KEY=VALUE pairs.
    pub env: Vec<String>,
    /// Host directory bind-mounted read-write at the workspace mount point.
    pub workspace_dir: PathBuf,
    pub memory_limit_bytes: i64,
    pub cpu_cores: f64,
    pub pids_limit: i64,
    pub network_enabled: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SandboxUsage {
    pub memory_peak_bytes: u64,
    pub cpu_time_ms: u64,
    pub oom_killed: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    Exited(i64),
    TimedOut,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to launch sandbox: {0}")]
    Launch(String),
    #[error("sandbox runtime error: {0}")]
    Runtime(String),
}

/// Container layer seam. The production implementation drives the Docker
/// Engine API; tests substitute mocks or scripted stubs.
///
/// `stop` and `remove` are idempotent: tearing down a container that is
/// already gone is not an error, so the runner's timeout path and an
/// explicit stop request can race freely.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Sandbox: std::fmt::Debug + Send + Sync {
    /// Creates and starts the container, returning its id. The id must be
    /// available to concurrent stop requests immediately.
    async fn launch(&self, spec: &SandboxSpec) -> Result<String, SandboxError>;

    /// Blocks until the container exits or `limit` elapses.
    async fn wait(&self, container_id: &str, limit: Duration) -> Result<WaitOutcome, SandboxError>;

    /// Full stdout/stderr captured so far.
    async fn collect_logs(&self, container_id: &str) -> Result<(String, String), SandboxError>;

    /// Best-effort resource accounting (memory high-water mark, CPU time,
    /// OOM-kill flag).
    async fn usage(&self, container_id: &str) -> Result<SandboxUsage, SandboxError>;

    /// Graceful stop, escalating to a forced kill after `grace`.
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), SandboxError>;

    /// Removes container resources.
    async fn remove(&self, container_id: &str) -> Result<(), SandboxError>;
}
