use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::domain::{Execution, ExecutionStatus};
use crate::errors::EngineError;

/// In-memory execution record store. Each execution maps 1:1 to one worker,
/// so updates are keyed field writes under the shard guard; no two workers
/// ever mutate the same record concurrently.
#[derive(Debug, Default)]
pub struct ExecutionStore {
    executions: DashMap<Uuid, Execution>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, execution: Execution) {
        self.executions.insert(execution.id, execution);
    }

    pub fn get(&self, id: Uuid) -> Option<Execution> {
        self.executions.get(&id).map(|e| e.clone())
    }

    pub fn remove(&self, id: Uuid) {
        self.executions.remove(&id);
    }

    pub fn all(&self) -> Vec<Execution> {
        self.executions.iter().map(|e| e.clone()).collect()
    }

    pub fn with_mut<F>(&self, id: Uuid, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut Execution),
    {
        let mut entry = self
            .executions
            .get_mut(&id)
            .ok_or(EngineError::ExecutionNotFound(id))?;
        f(&mut entry);
        Ok(())
    }

    /// Moves an execution along the status DAG, stamping started/completed
    /// timestamps. Transitioning to the state it is already in is a no-op,
    /// which keeps racing teardown paths idempotent.
    pub fn transition(&self, id: Uuid, next: ExecutionStatus) -> Result<(), EngineError> {
        let mut entry = self
            .executions
            .get_mut(&id)
            .ok_or(EngineError::ExecutionNotFound(id))?;

        if entry.status == next {
            return Ok(());
        }
        if !entry.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: entry.status,
                to: next,
            });
        }

        tracing::debug!(execution = %id, from = ?entry.status, to = ?next, "status transition");
        entry.status = next;
        match next {
            ExecutionStatus::Running => entry.started_at = Some(Utc::now()),
            s if s.is_terminal() => entry.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Retention cleanup: clears container handles on terminal executions
    /// completed before the cutoff. Returns how many were cleared.
    pub fn purge_container_handles(&self, before: DateTime<Utc>) -> usize {
        let mut purged = 0;
        for mut entry in self.executions.iter_mut() {
            if entry.status.is_terminal()
                && entry.container_id.is_some()
                && entry.completed_at.is_some_and(|t| t < before)
            {
                entry.container_id = None;
                purged += 1;
            }
        }
        purged
    }
}
