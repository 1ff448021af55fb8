use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::constants::TRUNCATION_MARKER;
use crate::domain::{ExecutionStatus, LimitKind, ResourceUsage};
use crate::environment::ExecutionEnvironment;
use crate::errors::EngineError;
use crate::sandbox::{Sandbox, SandboxSpec, WaitOutcome};
use crate::store::ExecutionStore;
use crate::workspace::WorkspaceBuilder;

/// Shared between a running worker and concurrent stop requests.
#[derive(Debug, Default)]
struct RunHandle {
    cancel_requested: AtomicBool,
    container_id: std::sync::Mutex<Option<String>>,
}

impl RunHandle {
    fn container(&self) -> Option<String> {
        self.container_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn set_container(&self, id: &str) {
        if let Ok(mut guard) = self.container_id.lock() {
            *guard = Some(id.to_string());
        }
    }
}

/// Core execution state machine: prepares the workspace, launches one
/// container per execution, enforces timeouts, captures output and always
/// tears the container down. Concurrency is bounded globally and per
/// environment.
#[derive(Debug)]
pub struct SandboxRunner {
    sandbox: Arc<dyn Sandbox>,
    store: Arc<ExecutionStore>,
    workspaces: WorkspaceBuilder,
    global_slots: Arc<Semaphore>,
    env_slots: DashMap<String, Arc<Semaphore>>,
    per_env_limit: usize,
    stop_grace: Duration,
    handles: DashMap<Uuid, Arc<RunHandle>>,
}

impl SandboxRunner {
    pub fn new(sandbox: Arc<dyn Sandbox>, store: Arc<ExecutionStore>, config: &EngineConfig) -> Self {
        Self {
            sandbox,
            store,
            workspaces: WorkspaceBuilder::new(&config.workspace_root),
            global_slots: Arc::new(Semaphore::new(config.max_concurrent_executions)),
            env_slots: DashMap::new(),
            per_env_limit: config.max_concurrent_per_environment,
            stop_grace: config.stop_grace,
            handles: DashMap::new(),
        }
    }

    /// Runs one execution to a terminal state. Infra faults (launch
    /// failure, host-side errors) come back as `Err` after the record has
    /// been marked; a user program crashing is a normal `Completed` record
    /// with a non-zero exit code.
    #[tracing::instrument(skip(self, env), fields(execution = %execution_id))]
    pub async fn execute(
        &self,
        execution_id: Uuid,
        env: &ExecutionEnvironment,
    ) -> Result<(), EngineError> {
        let _global_slot = self
            .global_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let env_slots = self
            .env_slots
            .entry(env.key())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_env_limit)))
            .clone();
        let _env_slot = env_slots
            .acquire_owned()
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let handle = Arc::new(RunHandle::default());
        self.handles.insert(execution_id, handle.clone());
        let result = self.run(execution_id, env, &handle).await;
        self.handles.remove(&execution_id);
        result
    }

    async fn run(
        &self,
        execution_id: Uuid,
        env: &ExecutionEnvironment,
        handle: &RunHandle,
    ) -> Result<(), EngineError> {
        let execution = self
            .store
            .get(execution_id)
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        if execution.status.is_terminal() {
            // Stopped while still queued.
            return Ok(());
        }

        // The workspace handle lives until this function returns, so the
        // directory is removed on every path out.
        let workspace = match self.workspaces.prepare(&execution, env).await {
            Ok(ws) => ws,
            Err(e) => {
                self.store.with_mut(execution_id, |x| {
                    x.error_message = Some(e.to_string());
                })?;
                self.store.transition(execution_id, ExecutionStatus::Errored)?;
                return Err(e);
            }
        };

        if handle.cancel_requested.load(Ordering::SeqCst) {
            self.store.transition(execution_id, ExecutionStatus::Cancelled)?;
            return Ok(());
        }

        let spec = SandboxSpec {
            name: format!("exec-{execution_id}"),
            image: env.image.clone(),
            cmd: env.launch_plan.render(
                &workspace.source_file,
                &workspace.binary_file,
                &execution.argv,
                workspace.has_stdin,
            ),
            env: execution
                .env_vars
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
            workspace_dir: workspace.host_path().to_path_buf(),
            memory_limit_bytes: (env.memory_limit_mb * 1024 * 1024) as i64,
            cpu_cores: env.cpu_cores,
            pids_limit: env.pids_limit,
            network_enabled: env.features.network,
        };

        self.store.transition(execution_id, ExecutionStatus::Running)?;
        let started = Instant::now();

        let container_id = match self.sandbox.launch(&spec).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(execution = %execution_id, error = %e, "sandbox launch failed");
                self.store.with_mut(execution_id, |x| {
                    x.error_message = Some(e.to_string());
                })?;
                self.store.transition(execution_id, ExecutionStatus::Failed)?;
                return Err(EngineError::SandboxLaunch(e.to_string()));
            }
        };
        // Recorded immediately so a concurrent stop request can act on it.
        handle.set_container(&container_id);
        self.store.with_mut(execution_id, |x| {
            x.container_id = Some(container_id.clone());
        })?;

        let mut limit_exceeded = None;
        let mut error_message = None;
        let mut exit_code = None;
        let mut terminal = None;

        match self.sandbox.wait(&container_id, env.default_timeout).await {
            Ok(WaitOutcome::Exited(code)) => exit_code = Some(code),
            Ok(WaitOutcome::TimedOut) => {
                tracing::warn!(execution = %execution_id, "wall-clock limit exceeded, stopping container");
                if let Err(e) = self.sandbox.stop(&container_id, self.stop_grace).await {
                    // Escalation is best effort; teardown continues below.
                    tracing::warn!(container = %container_id, error = %e, "graceful stop failed");
                }
                limit_exceeded = Some(LimitKind::Time);
                terminal = Some(ExecutionStatus::TimedOut);
            }
            Err(e) => {
                error_message = Some(e.to_string());
                terminal = Some(ExecutionStatus::Errored);
            }
        }

        let (stdout, stderr) = self
            .sandbox
            .collect_logs(&container_id)
            .await
            .unwrap_or_default();
        let usage = self.sandbox.usage(&container_id).await.unwrap_or_default();

        // Resource release never depends on the success path.
        if let Err(e) = self.sandbox.remove(&container_id).await {
            tracing::warn!(container = %container_id, error = %e, "container remove failed");
        }

        let terminal = if handle.cancel_requested.load(Ordering::SeqCst) {
            ExecutionStatus::Cancelled
        } else if let Some(status) = terminal {
            status
        } else if usage.oom_killed {
            limit_exceeded = Some(LimitKind::Memory);
            error_message = Some("memory limit exceeded".to_string());
            ExecutionStatus::Failed
        } else if usage.cpu_time_ms > env.cpu_time_limit_secs * 1_000 {
            limit_exceeded = Some(LimitKind::Time);
            ExecutionStatus::TimedOut
        } else {
            ExecutionStatus::Completed
        };

        let wall_time_ms = started.elapsed().as_millis() as u64;
        self.store.with_mut(execution_id, |x| {
            x.stdout = truncate_output(&stdout, env.max_output_bytes);
            x.stderr = truncate_output(&stderr, env.max_output_bytes);
            x.exit_code = exit_code;
            x.usage = ResourceUsage {
                wall_time_ms,
                cpu_time_ms: usage.cpu_time_ms,
                memory_peak_bytes: usage.memory_peak_bytes,
            };
            x.limit_exceeded = limit_exceeded;
            x.error_message = error_message.clone();
            x.success = terminal == ExecutionStatus::Completed && exit_code == Some(0);
        })?;
        self.store.transition(execution_id, terminal)?;

        tracing::info!(
            execution = %execution_id,
            status = ?terminal,
            exit_code = ?exit_code,
            wall_time_ms,
            "execution finished"
        );
        Ok(())
    }

    /// Requests cancellation. Safe to call repeatedly and to race with the
    /// runner's own timeout path or with natural completion: teardown is
    /// idempotent and an already-terminal execution is left untouched.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let execution = self
            .store
            .get(execution_id)
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        if execution.status.is_terminal() {
            return Ok(());
        }

        if let Some(handle) = self.handles.get(&execution_id).map(|h| Arc::clone(&h)) {
            handle.cancel_requested.store(true, Ordering::SeqCst);
            if let Some(container_id) = handle.container() {
                if let Err(e) = self.sandbox.stop(&container_id, self.stop_grace).await {
                    tracing::warn!(container = %container_id, error = %e, "stop request failed");
                }
            }
            // The owning worker observes the flag, marks Cancelled and
            // removes the container.
            Ok(())
        } else {
            // Not picked up by a worker yet, or the worker finished
            // between the status read above and now.
            self.cancel_unclaimed(execution_id)
        }
    }

    /// Cancels an execution that has no live worker handle. The worker may
    /// have finished in the meantime; a cancel landing on a terminal record
    /// is a no-op, not an error.
    fn cancel_unclaimed(&self, execution_id: Uuid) -> Result<(), EngineError> {
        match self.store.transition(execution_id, ExecutionStatus::Cancelled) {
            Err(EngineError::InvalidTransition { from, .. }) if from.is_terminal() => Ok(()),
            other => other,
        }
    }
}

/// Cuts output at the size ceiling (on a char boundary) and appends a
/// visible marker; truncated output is never silently dropped.
fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = output[..cut].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}
