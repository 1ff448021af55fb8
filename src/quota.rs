use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::domain::{QuotaSnapshot, ResourceUsage, UserTier};
use crate::environment::ExecutionEnvironment;
use crate::errors::EngineError;

/// Daily budget attached to a user tier.
#[derive(Clone, Copy, Debug)]
pub struct QuotaLimits {
    pub executions: u64,
    pub cpu_seconds: u64,
    pub memory_mb: u64,
}

impl UserTier {
    pub fn daily_limits(self) -> QuotaLimits {
        match self {
            UserTier::Free => QuotaLimits {
                executions: 50,
                cpu_seconds: 300,
                memory_mb: 4 * 1024,
            },
            UserTier::Premium => QuotaLimits {
                executions: 200,
                cpu_seconds: 1_800,
                memory_mb: 16 * 1024,
            },
            UserTier::Instructor => QuotaLimits {
                executions: 500,
                cpu_seconds: 3_600,
                memory_mb: 32 * 1024,
            },
            UserTier::Admin => QuotaLimits {
                executions: u64::MAX,
                cpu_seconds: u64::MAX,
                memory_mb: u64::MAX,
            },
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct QuotaRecord {
    period: NaiveDate,
    executions_used: u64,
    cpu_ms_used: u64,
    memory_mb_used: u64,
}

impl QuotaRecord {
    fn fresh(period: NaiveDate) -> Self {
        Self {
            period,
            executions_used: 0,
            cpu_ms_used: 0,
            memory_mb_used: 0,
        }
    }

    /// Lazy reset-on-touch: the first access of a new period zeroes the
    /// counters. Callers hold the shard guard, so concurrent first access
    /// resets exactly once.
    fn roll_over(&mut self, today: NaiveDate) {
        if self.period != today {
            *self = Self::fresh(today);
        }
    }
}

/// Per-user daily execution budgets plus a per-environment daily cap that
/// protects a single popular runtime from being monopolized.
///
/// `admit` reserves an execution slot (counters increase atomically under
/// the map shard guard); `commit` adds the measured CPU/memory usage after
/// the run. Counters only grow within a period and reset exactly once when
/// the period rolls over.
#[derive(Debug, Default)]
pub struct QuotaManager {
    users: DashMap<Uuid, QuotaRecord>,
    environments: DashMap<String, QuotaRecord>,
}

impl QuotaManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(
        &self,
        user: Uuid,
        tier: UserTier,
        env: &ExecutionEnvironment,
    ) -> Result<(), EngineError> {
        self.admit_at(Utc::now().date_naive(), user, tier, env)
    }

    pub fn commit(&self, user: Uuid, usage: &ResourceUsage) {
        self.commit_at(Utc::now().date_naive(), user, usage)
    }

    pub fn snapshot(&self, user: Uuid, tier: UserTier) -> QuotaSnapshot {
        self.snapshot_at(Utc::now().date_naive(), user, tier)
    }

    fn admit_at(
        &self,
        today: NaiveDate,
        user: Uuid,
        tier: UserTier,
        env: &ExecutionEnvironment,
    ) -> Result<(), EngineError> {
        let limits = tier.daily_limits();
        let resets_at = next_reset(today);

        {
            let mut record = self
                .users
                .entry(user)
                .or_insert_with(|| QuotaRecord::fresh(today));
            record.roll_over(today);

            if record.executions_used >= limits.executions {
                return Err(EngineError::QuotaExceeded {
                    reason: format!("daily execution limit of {} reached", limits.executions),
                    resets_at,
                });
            }
            if record.cpu_ms_used / 1_000 >= limits.cpu_seconds {
                return Err(EngineError::QuotaExceeded {
                    reason: format!("daily CPU budget of {}s exhausted", limits.cpu_seconds),
                    resets_at,
                });
            }
            if record.memory_mb_used >= limits.memory_mb {
                return Err(EngineError::QuotaExceeded {
                    reason: format!("daily memory budget of {}MB exhausted", limits.memory_mb),
                    resets_at,
                });
            }
            record.executions_used += 1;
        }

        let mut env_record = self
            .environments
            .entry(env.key())
            .or_insert_with(|| QuotaRecord::fresh(today));
        env_record.roll_over(today);
        if env_record.executions_used >= env.daily_cap {
            // Give the user's reserved slot back.
            if let Some(mut record) = self.users.get_mut(&user) {
                record.executions_used = record.executions_used.saturating_sub(1);
            }
            return Err(EngineError::QuotaExceeded {
                reason: format!(
                    "environment '{}' reached its daily cap of {}",
                    env.key(),
                    env.daily_cap
                ),
                resets_at,
            });
        }
        env_record.executions_used += 1;

        Ok(())
    }

    fn commit_at(&self, today: NaiveDate, user: Uuid, usage: &ResourceUsage) {
        let mut record = self
            .users
            .entry(user)
            .or_insert_with(|| QuotaRecord::fresh(today));
        record.roll_over(today);
        record.cpu_ms_used += usage.cpu_time_ms;
        record.memory_mb_used += usage.memory_peak_bytes / (1024 * 1024);
    }

    fn snapshot_at(&self, today: NaiveDate, user: Uuid, tier: UserTier) -> QuotaSnapshot {
        let limits = tier.daily_limits();
        let record = self
            .users
            .get(&user)
            .map(|r| *r)
            .filter(|r| r.period == today)
            .unwrap_or_else(|| QuotaRecord::fresh(today));

        let cpu_seconds_used = record.cpu_ms_used / 1_000;
        QuotaSnapshot {
            period: today,
            resets_at: next_reset(today),
            executions_used: record.executions_used,
            executions_limit: limits.executions,
            cpu_seconds_used,
            cpu_seconds_limit: limits.cpu_seconds,
            memory_mb_used: record.memory_mb_used,
            memory_mb_limit: limits.memory_mb,
            exceeded: record.executions_used >= limits.executions
                || cpu_seconds_used >= limits.cpu_seconds
                || record.memory_mb_used >= limits.memory_mb,
        }
    }
}

fn next_reset(today: NaiveDate) -> DateTime<Utc> {
    (today + chrono::Days::new(1))
        .and_time(NaiveTime::MIN)
        .and_utc()
}
