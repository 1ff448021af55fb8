use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use uuid::Uuid;

use crate::sandbox::{Sandbox, SandboxError, SandboxSpec, SandboxUsage, WaitOutcome};

/// Scripted sandbox for tests and local development: pretends every launch
/// runs for `run_time` and exits with the configured outcome. Teardown
/// calls are counted so tests can assert idempotent cleanup.
#[derive(Clone, Debug)]
pub struct StubSandbox {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub run_time: Duration,
    pub usage: SandboxUsage,
    pub fail_launch: Option<String>,
    stops: Arc<AtomicUsize>,
    removes: Arc<AtomicUsize>,
}

impl StubSandbox {
    pub fn new(exit_code: i64, stdout: &str, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            run_time: Duration::from_millis(10),
            usage: SandboxUsage {
                memory_peak_bytes: 1024 * 1024,
                cpu_time_ms: 5,
                oom_killed: false,
            },
            fail_launch: None,
            stops: Arc::new(AtomicUsize::new(0)),
            removes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_launch(msg: &str) -> Self {
        let mut stub = Self::new(0, "", "");
        stub.fail_launch = Some(msg.to_string());
        stub
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Sandbox for StubSandbox {
    async fn launch(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        tracing::debug!("stub launch: image={}, cmd={:?}", spec.image, spec.cmd);
        if let Some(msg) = &self.fail_launch {
            return Err(SandboxError::Launch(msg.clone()));
        }
        Ok(format!("stub-{}", Uuid::new_v4()))
    }

    async fn wait(&self, _container_id: &str, limit: Duration) -> Result<WaitOutcome, SandboxError> {
        if self.run_time > limit {
            tokio::time::sleep(limit).await;
            return Ok(WaitOutcome::TimedOut);
        }
        tokio::time::sleep(self.run_time).await;
        Ok(WaitOutcome::Exited(self.exit_code))
    }

    async fn collect_logs(&self, _container_id: &str) -> Result<(String, String), SandboxError> {
        Ok((self.stdout.clone(), self.stderr.clone()))
    }

    async fn usage(&self, _container_id: &str) -> Result<SandboxUsage, SandboxError> {
        Ok(self.usage)
    }

    async fn stop(&self, _container_id: &str, _grace: Duration) -> Result<(), SandboxError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, _container_id: &str) -> Result<(), SandboxError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
