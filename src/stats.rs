use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use itertools::Itertools;

use crate::domain::{ExecutionStatistics, ExecutionStatus};
use crate::store::ExecutionStore;

/// Daily observability rollups for admin dashboards. Read-only over the
/// execution records; recomputing a date overwrites its row, so re-runs
/// are idempotent.
#[derive(Debug)]
pub struct StatisticsCollector {
    store: Arc<ExecutionStore>,
    daily: DashMap<NaiveDate, ExecutionStatistics>,
}

impl StatisticsCollector {
    pub fn new(store: Arc<ExecutionStore>) -> Self {
        Self {
            store,
            daily: DashMap::new(),
        }
    }

    pub fn get(&self, date: NaiveDate) -> Option<ExecutionStatistics> {
        self.daily.get(&date).map(|s| s.clone())
    }

    #[tracing::instrument(skip(self))]
    pub fn collect_daily(&self, date: NaiveDate) -> ExecutionStatistics {
        let executions: Vec<_> = self
            .store
            .all()
            .into_iter()
            .filter(|e| e.created_at.date_naive() == date)
            .collect();

        let count_status = |status: ExecutionStatus| {
            executions.iter().filter(|e| e.status == status).count() as u64
        };

        let total = executions.len() as u64;
        let wall_times: Vec<u64> = executions
            .iter()
            .filter(|e| e.status.is_terminal())
            .map(|e| e.usage.wall_time_ms)
            .collect();
        let average_wall_time_ms = if wall_times.is_empty() {
            0.0
        } else {
            wall_times.iter().sum::<u64>() as f64 / wall_times.len() as f64
        };

        let per_language = executions
            .iter()
            .map(|e| e.language.clone())
            .counts()
            .into_iter()
            .map(|(language, n)| (language, n as u64))
            .collect();
        let distinct_users = executions.iter().map(|e| e.user_id).unique().count() as u64;

        let stats = ExecutionStatistics {
            date,
            total,
            completed: count_status(ExecutionStatus::Completed),
            failed: count_status(ExecutionStatus::Failed),
            timed_out: count_status(ExecutionStatus::TimedOut),
            cancelled: count_status(ExecutionStatus::Cancelled),
            errored: count_status(ExecutionStatus::Errored),
            average_wall_time_ms,
            per_language,
            distinct_users,
        };

        tracing::info!(
            %date,
            total = stats.total,
            completed = stats.completed,
            "daily statistics collected"
        );
        self.daily.insert(date, stats.clone());
        stats
    }
}
