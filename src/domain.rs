use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionKind {
    /// Ad-hoc playground run, not bound to an exercise.
    Playground,
    /// Graded exercise submission.
    ExerciseSubmission,
    /// Assessment/exam run.
    Assessment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    Errored,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Errored
        )
    }

    /// Status transitions form a DAG: Pending -> Queued -> Running ->
    /// terminal. Cancellation is allowed from any non-terminal state.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Queued) => true,
            (Queued, Running) => true,
            (Running, s) if s.is_terminal() => true,
            // A launch that never starts can still fail or be cancelled.
            (Pending | Queued, Failed | Cancelled | Errored) => true,
            _ => false,
        }
    }
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        ExecutionStatus::Pending
    }
}

/// Which resource ceiling a run tripped, when it tripped one. Kept apart
/// from the status so "your program used too much memory" and "your program
/// exceeded the time limit" stay distinguishable from a plain crash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitKind {
    Time,
    Memory,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ResourceUsage {
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_peak_bytes: u64,
}

/// One request to run code. Owned exclusively by the requesting user;
/// immutable (except cleanup fields) once a terminal status is reached.
#[derive(Clone, Debug)]
pub struct Execution {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Registry key of the environment this ran under, e.g. "python:3.11".
    pub environment: String,
    pub language: String,
    pub kind: ExecutionKind,
    pub source_code: String,
    pub stdin: String,
    pub argv: Vec<String>,
    pub env_vars: HashMap<String, String>,
    pub exercise_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub usage: ResourceUsage,
    pub limit_exceeded: Option<LimitKind>,
    /// Container handle while the run is alive; cleared by retention
    /// cleanup after the run is long terminal.
    pub container_id: Option<String>,
    pub error_message: Option<String>,
    pub success: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub test_results: Vec<TestResult>,
}

impl Execution {
    pub fn new(
        user_id: Uuid,
        environment: String,
        language: String,
        kind: ExecutionKind,
        source_code: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            environment,
            language,
            kind,
            source_code,
            stdin: String::new(),
            argv: Vec::new(),
            env_vars: HashMap::new(),
            exercise_id: None,
            status: ExecutionStatus::Pending,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            usage: ResourceUsage::default(),
            limit_exceeded: None,
            container_id: None,
            error_message: None,
            success: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            test_results: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchMode {
    /// Byte-exact comparison, no normalization.
    Strict,
    /// Collapse runs of whitespace before comparing.
    IgnoreWhitespace,
    /// Case-fold before comparing.
    IgnoreCase,
    /// Similarity-ratio comparison against the configured threshold.
    Similarity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestVisibility {
    Public,
    Hidden,
}

/// A grading fixture bound to an exercise. (exercise, name) is unique.
#[derive(Clone, Debug)]
pub struct TestCase {
    pub id: Uuid,
    pub exercise_id: Uuid,
    pub name: String,
    pub input: String,
    pub expected_stdout: String,
    pub expected_exit_code: i64,
    /// Substring that must appear in stderr when set.
    pub expected_error: Option<String>,
    pub timeout_override_secs: Option<u64>,
    pub memory_override_mb: Option<u64>,
    pub weight: f64,
    pub match_mode: MatchMode,
    pub visibility: TestVisibility,
    pub order: u32,
    pub active: bool,
}

impl TestCase {
    pub fn new(exercise_id: Uuid, name: &str, input: &str, expected_stdout: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            exercise_id,
            name: name.to_string(),
            input: input.to_string(),
            expected_stdout: expected_stdout.to_string(),
            expected_exit_code: 0,
            expected_error: None,
            timeout_override_secs: None,
            memory_override_mb: None,
            weight: 1.0,
            match_mode: MatchMode::Similarity,
            visibility: TestVisibility::Public,
            order: 0,
            active: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    TimedOut,
    Skipped,
}

/// Outcome of one execution against one test case. At most one per
/// (execution, test case) pair.
#[derive(Clone, Debug)]
pub struct TestResult {
    pub test_case_id: Uuid,
    pub test_name: String,
    pub status: TestStatus,
    pub actual_stdout: String,
    pub actual_stderr: String,
    pub actual_exit_code: Option<i64>,
    pub similarity: f64,
    pub points_earned: f64,
    pub points_possible: f64,
    pub diff: String,
    pub feedback: String,
}

#[derive(Clone, Debug, Default)]
pub struct GradeReport {
    pub total_tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub total_points: f64,
    pub earned_points: f64,
    pub percentage: f64,
    pub results: Vec<TestResult>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserTier {
    Free,
    Premium,
    Instructor,
    Admin,
}

#[derive(Clone, Copy, Debug)]
pub struct QuotaSnapshot {
    pub period: NaiveDate,
    pub resets_at: DateTime<Utc>,
    pub executions_used: u64,
    pub executions_limit: u64,
    pub cpu_seconds_used: u64,
    pub cpu_seconds_limit: u64,
    pub memory_mb_used: u64,
    pub memory_mb_limit: u64,
    pub exceeded: bool,
}

/// One aggregated observability row per day. Recomputed idempotently.
#[derive(Clone, Debug)]
pub struct ExecutionStatistics {
    pub date: NaiveDate,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub errored: u64,
    pub average_wall_time_ms: f64,
    pub per_language: HashMap<String, u64>,
    pub distinct_users: u64,
}
