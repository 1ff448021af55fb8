use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use itertools::Itertools;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::constants::DANGEROUS_PATTERNS;
use crate::domain::{
    Execution, ExecutionKind, ExecutionStatistics, ExecutionStatus, QuotaSnapshot, TestCase,
    UserTier,
};
use crate::environment::{EnvironmentRegistry, ExecutionEnvironment};
use crate::errors::EngineError;
use crate::grader::{Grader, TestRunner};
use crate::quota::QuotaManager;
use crate::runner::SandboxRunner;
use crate::sandbox::Sandbox;
use crate::stats::StatisticsCollector;
use crate::store::ExecutionStore;

#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub user_id: Uuid,
    pub tier: UserTier,
    pub language: String,
    pub version: Option<String>,
    pub kind: ExecutionKind,
    pub source_code: String,
    pub stdin: String,
    pub argv: Vec<String>,
    pub env_vars: HashMap<String, String>,
    pub exercise_id: Option<Uuid>,
}

impl SubmitRequest {
    pub fn new(user_id: Uuid, tier: UserTier, language: &str, source_code: &str) -> Self {
        Self {
            user_id,
            tier,
            language: language.to_string(),
            version: None,
            kind: ExecutionKind::Playground,
            source_code: source_code.to_string(),
            stdin: String::new(),
            argv: Vec::new(),
            env_vars: HashMap::new(),
            exercise_id: None,
        }
    }
}

/// The engine facade exposed to collaborating subsystems (HTTP layer,
/// course/exercise subsystem). Owns the registry, quota ledger, runner,
/// grader and statistics collector; transport is someone else's problem.
#[derive(Debug)]
pub struct SandboxService {
    registry: EnvironmentRegistry,
    quota: QuotaManager,
    store: Arc<ExecutionStore>,
    runner: Arc<SandboxRunner>,
    test_runner: TestRunner,
    stats: StatisticsCollector,
    test_cases: DashMap<Uuid, Vec<TestCase>>,
    config: EngineConfig,
}

impl SandboxService {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        registry: EnvironmentRegistry,
        config: EngineConfig,
    ) -> Self {
        let store = Arc::new(ExecutionStore::new());
        let runner = Arc::new(SandboxRunner::new(sandbox, store.clone(), &config));
        let test_runner =
            TestRunner::new(runner.clone(), store.clone(), Grader::new(config.grader));
        Self {
            registry,
            quota: QuotaManager::new(),
            stats: StatisticsCollector::new(store.clone()),
            store,
            runner,
            test_runner,
            test_cases: DashMap::new(),
            config,
        }
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    /// Collaborator input seam: the exercise subsystem registers the
    /// grading fixtures for an exercise. Names must be unique within the
    /// exercise.
    pub fn register_test_cases(
        &self,
        exercise_id: Uuid,
        cases: Vec<TestCase>,
    ) -> Result<(), EngineError> {
        if !cases.iter().map(|c| c.name.as_str()).all_unique() {
            return Err(EngineError::InvalidSubmission(
                "duplicate test case name within exercise".to_string(),
            ));
        }
        self.test_cases.insert(exercise_id, cases);
        Ok(())
    }

    /// Validates, admits against quota, runs the submission in a sandbox
    /// and, when the exercise has registered test cases, grades it. Blocks
    /// until the execution reaches a terminal state.
    #[tracing::instrument(skip(self, request), fields(user = %request.user_id, language = %request.language))]
    pub async fn submit_execution(&self, request: SubmitRequest) -> Result<Execution, EngineError> {
        // Rejections below cost zero sandbox resources.
        let env = self
            .registry
            .resolve(&request.language, request.version.as_deref())?;
        self.validate_source(&request.source_code, &env)?;
        self.quota.admit(request.user_id, request.tier, &env)?;

        let mut execution = Execution::new(
            request.user_id,
            env.key(),
            env.language.clone(),
            request.kind,
            request.source_code,
        );
        execution.stdin = request.stdin;
        execution.argv = request.argv;
        execution.env_vars = request.env_vars;
        execution.exercise_id = request.exercise_id;
        let execution_id = execution.id;

        self.store.insert(execution);
        self.store.transition(execution_id, ExecutionStatus::Queued)?;
        let run = self.runner.execute(execution_id, &env).await;

        // Post-hoc usage accounting happens even for failed runs; the
        // admission slot was consumed either way.
        if let Some(done) = self.store.get(execution_id) {
            self.quota.commit(request.user_id, &done.usage);
        }
        run?;

        self.maybe_grade(execution_id, &env).await?;

        self.store
            .get(execution_id)
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    async fn maybe_grade(
        &self,
        execution_id: Uuid,
        env: &ExecutionEnvironment,
    ) -> Result<(), EngineError> {
        let submission = self
            .store
            .get(execution_id)
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        let Some(exercise_id) = submission.exercise_id else {
            return Ok(());
        };
        let Some(cases) = self.test_cases.get(&exercise_id).map(|c| c.clone()) else {
            return Ok(());
        };
        if submission.status == ExecutionStatus::Cancelled {
            return Ok(());
        }

        let report = self.test_runner.grade_all(&submission, env, &cases).await?;
        tracing::info!(
            execution = %execution_id,
            %exercise_id,
            percentage = report.percentage,
            passed = report.passed,
            total = report.total_tests,
            "submission graded"
        );
        self.store.with_mut(execution_id, |x| {
            x.test_results = report.results;
        })
    }

    /// Caller must own the execution.
    pub async fn stop_execution(&self, user_id: Uuid, execution_id: Uuid) -> Result<(), EngineError> {
        self.owned(user_id, execution_id)?;
        self.runner.stop(execution_id).await
    }

    /// The execution record with its resolved test results.
    pub fn execution_result(&self, user_id: Uuid, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.owned(user_id, execution_id)
    }

    pub fn quota_status(&self, user_id: Uuid, tier: UserTier) -> QuotaSnapshot {
        self.quota.snapshot(user_id, tier)
    }

    pub fn collect_daily_stats(&self, date: NaiveDate) -> ExecutionStatistics {
        self.stats.collect_daily(date)
    }

    /// Retention cleanup of container handles on old terminal executions.
    pub fn purge_expired_handles(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        self.store.purge_container_handles(cutoff)
    }

    fn owned(&self, user_id: Uuid, execution_id: Uuid) -> Result<Execution, EngineError> {
        let execution = self
            .store
            .get(execution_id)
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        if execution.user_id != user_id {
            return Err(EngineError::AccessDenied);
        }
        Ok(execution)
    }

    /// Coarse literal pre-filter, defense in depth only: real isolation is
    /// the sandbox's job.
    fn validate_source(
        &self,
        source: &str,
        env: &ExecutionEnvironment,
    ) -> Result<(), EngineError> {
        if source.trim().is_empty() {
            return Err(EngineError::InvalidSubmission(
                "source code is empty".to_string(),
            ));
        }
        if source.len() > self.config.max_source_bytes {
            return Err(EngineError::InvalidSubmission(format!(
                "source code exceeds {} bytes",
                self.config.max_source_bytes
            )));
        }
        for pattern in DANGEROUS_PATTERNS
            .iter()
            .copied()
            .chain(env.blocked_patterns.iter().map(String::as_str))
        {
            if source.contains(pattern) {
                return Err(EngineError::InvalidSubmission(format!(
                    "source contains blocked pattern '{pattern}'"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LimitKind, TestStatus};
    use crate::sandbox::StubSandbox;
    use std::time::Duration;

    fn service_with(stub: StubSandbox) -> SandboxService {
        let mut config = EngineConfig::default();
        config.workspace_root =
            std::env::temp_dir().join(format!("service-test-{}", Uuid::new_v4()));
        SandboxService::new(
            Arc::new(stub),
            EnvironmentRegistry::with_defaults(),
            config,
        )
    }

    #[tokio::test]
    async fn hello_world_round_trip() {
        let service = service_with(StubSandbox::new(0, "Hello, World!\n", ""));
        let user = Uuid::new_v4();

        let request = SubmitRequest::new(
            user,
            UserTier::Free,
            "python",
            "print(\"Hello, World!\")",
        );
        let execution = service.submit_execution(request).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.exit_code, Some(0));
        assert_eq!(execution.stdout, "Hello, World!\n");
        assert!(execution.success);

        let fetched = service.execution_result(user, execution.id).unwrap();
        assert_eq!(fetched.stdout, "Hello, World!\n");

        let snapshot = service.quota_status(user, UserTier::Free);
        assert_eq!(snapshot.executions_used, 1);
    }

    #[tokio::test]
    async fn empty_source_is_rejected_before_any_run() {
        let service = service_with(StubSandbox::new(0, "", ""));
        let user = Uuid::new_v4();

        let request = SubmitRequest::new(user, UserTier::Free, "python", "   \n  ");
        let result = service.submit_execution(request).await;
        assert!(matches!(result, Err(EngineError::InvalidSubmission(_))));

        // Zero resource cost: nothing stored, no quota consumed.
        let snapshot = service.quota_status(user, UserTier::Free);
        assert_eq!(snapshot.executions_used, 0);
    }

    #[tokio::test]
    async fn dangerous_patterns_are_rejected() {
        let service = service_with(StubSandbox::new(0, "", ""));
        let request = SubmitRequest::new(
            Uuid::new_v4(),
            UserTier::Free,
            "python",
            "import subprocess\nsubprocess.run(['ls'])",
        );
        assert!(matches!(
            service.submit_execution(request).await,
            Err(EngineError::InvalidSubmission(_))
        ));
    }

    #[tokio::test]
    async fn unknown_environment_is_rejected() {
        let service = service_with(StubSandbox::new(0, "", ""));
        let request = SubmitRequest::new(Uuid::new_v4(), UserTier::Free, "cobol", "DISPLAY 'X'.");
        assert!(matches!(
            service.submit_execution(request).await,
            Err(EngineError::EnvironmentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn environment_daily_cap_rejects_with_quota_error() {
        let service = service_with(StubSandbox::new(0, "ok\n", ""));
        let mut tiny = service.registry().resolve("python", Some("3.11")).unwrap();
        tiny.version = "tiny".to_string();
        tiny.daily_cap = 1;
        service.registry().register(tiny).unwrap();

        let mut request =
            SubmitRequest::new(Uuid::new_v4(), UserTier::Premium, "python", "print(1)");
        request.version = Some("tiny".to_string());
        service.submit_execution(request.clone()).await.unwrap();

        request.user_id = Uuid::new_v4();
        assert!(matches!(
            service.submit_execution(request).await,
            Err(EngineError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn timeout_is_a_distinct_terminal_state() {
        let registry = EnvironmentRegistry::with_defaults();
        let mut slow = registry.resolve("python", Some("3.11")).unwrap();
        slow.version = "slow".to_string();
        slow.default_timeout = Duration::from_millis(50);
        registry.register(slow).unwrap();

        let mut stub = StubSandbox::new(0, "", "");
        stub.run_time = Duration::from_millis(500);
        let mut config = EngineConfig::default();
        config.workspace_root =
            std::env::temp_dir().join(format!("service-test-{}", Uuid::new_v4()));
        let service = SandboxService::new(Arc::new(stub), registry, config);

        let user = Uuid::new_v4();
        let mut request = SubmitRequest::new(user, UserTier::Free, "python", "while True: pass");
        request.version = Some("slow".to_string());

        let execution = service.submit_execution(request).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::TimedOut);
        assert_eq!(execution.limit_exceeded, Some(LimitKind::Time));
        assert!(!execution.success);
    }

    #[tokio::test]
    async fn graded_submission_carries_test_results() {
        let service = service_with(StubSandbox::new(0, "7\n", ""));
        let user = Uuid::new_v4();
        let exercise = Uuid::new_v4();

        let mut case = TestCase::new(exercise, "sum", "3\n4\n", "7\n");
        case.weight = 3.0;
        service.register_test_cases(exercise, vec![case]).unwrap();

        let mut request = SubmitRequest::new(
            user,
            UserTier::Free,
            "python",
            "print(int(input()) + int(input()))",
        );
        request.kind = ExecutionKind::ExerciseSubmission;
        request.exercise_id = Some(exercise);

        let execution = service.submit_execution(request).await.unwrap();
        assert_eq!(execution.test_results.len(), 1);
        let result = &execution.test_results[0];
        assert_eq!(result.status, TestStatus::Passed);
        assert_eq!(result.points_earned, 3.0);
    }

    #[tokio::test]
    async fn duplicate_test_case_names_are_rejected() {
        let service = service_with(StubSandbox::new(0, "", ""));
        let exercise = Uuid::new_v4();
        let cases = vec![
            TestCase::new(exercise, "same", "", ""),
            TestCase::new(exercise, "same", "", ""),
        ];
        assert!(service.register_test_cases(exercise, cases).is_err());
    }

    #[tokio::test]
    async fn stop_requires_ownership() {
        let service = service_with(StubSandbox::new(0, "ok\n", ""));
        let owner = Uuid::new_v4();

        let execution = service
            .submit_execution(SubmitRequest::new(owner, UserTier::Free, "python", "print(1)"))
            .await
            .unwrap();

        let stranger = Uuid::new_v4();
        assert!(matches!(
            service.stop_execution(stranger, execution.id).await,
            Err(EngineError::AccessDenied)
        ));
        assert!(matches!(
            service.execution_result(stranger, execution.id),
            Err(EngineError::AccessDenied)
        ));

        // The owner stopping an already-finished run is a harmless no-op.
        service.stop_execution(owner, execution.id).await.unwrap();
    }

    #[tokio::test]
    async fn launch_failure_surfaces_and_marks_the_record() {
        let service = service_with(StubSandbox::failing_launch("image missing"));
        let user = Uuid::new_v4();

        let request = SubmitRequest::new(user, UserTier::Free, "python", "print(1)");
        let result = service.submit_execution(request).await;
        assert!(matches!(result, Err(EngineError::SandboxLaunch(_))));

        // The admission slot was still consumed.
        let snapshot = service.quota_status(user, UserTier::Free);
        assert_eq!(snapshot.executions_used, 1);
    }

    #[tokio::test]
    async fn purge_clears_handles_past_retention() {
        let mut config = EngineConfig::default();
        config.workspace_root =
            std::env::temp_dir().join(format!("service-test-{}", Uuid::new_v4()));
        config.retention_days = 0;
        let service = SandboxService::new(
            Arc::new(StubSandbox::new(0, "ok\n", "")),
            EnvironmentRegistry::with_defaults(),
            config,
        );

        let user = Uuid::new_v4();
        let execution = service
            .submit_execution(SubmitRequest::new(user, UserTier::Free, "python", "print(1)"))
            .await
            .unwrap();
        assert!(execution.container_id.is_some());

        assert_eq!(service.purge_expired_handles(), 1);
        let purged = service.execution_result(user, execution.id).unwrap();
        assert!(purged.container_id.is_none());
    }

    #[tokio::test]
    async fn daily_stats_reflect_submissions() {
        let service = service_with(StubSandbox::new(0, "ok\n", ""));
        let user = Uuid::new_v4();
        for _ in 0..3 {
            service
                .submit_execution(SubmitRequest::new(user, UserTier::Free, "python", "print(1)"))
                .await
                .unwrap();
        }

        let stats = service.collect_daily_stats(Utc::now().date_naive());
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.distinct_users, 1);
        assert_eq!(stats.per_language["python"], 3);
    }
}
