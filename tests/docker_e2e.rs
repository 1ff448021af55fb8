//! End-to-end scenarios against a real Docker daemon. Ignored by default;
//! run with `cargo test -- --ignored` on a host with Docker and the stock
//! images pulled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use codelab_sandbox::{
    DockerSandbox, EngineConfig, EnvironmentRegistry, ExecutionStatus, LimitKind, SandboxService,
    SubmitRequest, TestCase, TestStatus, UserTier,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn docker_service() -> SandboxService {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let sandbox = DockerSandbox::new().expect("docker daemon not reachable");
    let mut config = EngineConfig::default();
    config.workspace_root = std::env::temp_dir().join(format!("e2e-{}", Uuid::new_v4()));
    SandboxService::new(Arc::new(sandbox), EnvironmentRegistry::with_defaults(), config)
}

#[tokio::test]
#[ignore = "requires a Docker daemon and the python:3.11-slim image"]
async fn python_hello_world_completes() {
    let service = docker_service();
    let mut request = SubmitRequest::new(
        Uuid::new_v4(),
        UserTier::Free,
        "python",
        "print(\"Hello, World!\")",
    );
    request.version = Some("3.11".to_string());

    let execution = service.submit_execution(request).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.exit_code, Some(0));
    assert_eq!(execution.stdout, "Hello, World!\n");
}

#[tokio::test]
#[ignore = "requires a Docker daemon and the python:3.11-slim image"]
async fn sleeping_program_times_out_and_is_removed() {
    let registry = EnvironmentRegistry::with_defaults();
    let mut env = registry.resolve("python", Some("3.11")).unwrap();
    env.version = "e2e-short".to_string();
    env.default_timeout = Duration::from_secs(5);
    registry.register(env).unwrap();

    let sandbox = DockerSandbox::new().expect("docker daemon not reachable");
    let mut config = EngineConfig::default();
    config.workspace_root = std::env::temp_dir().join(format!("e2e-{}", Uuid::new_v4()));
    let service = SandboxService::new(Arc::new(sandbox), registry, config);

    let mut request = SubmitRequest::new(
        Uuid::new_v4(),
        UserTier::Free,
        "python",
        "import time\ntime.sleep(60)",
    );
    request.version = Some("e2e-short".to_string());

    let started = Instant::now();
    let execution = service.submit_execution(request).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(execution.status, ExecutionStatus::TimedOut);
    assert_eq!(execution.limit_exceeded, Some(LimitKind::Time));
    assert!(elapsed < Duration::from_secs(15), "took {elapsed:?}");
}

#[tokio::test]
#[ignore = "requires a Docker daemon and the python:3.11-slim image"]
async fn sum_exercise_passes_its_test_case() {
    let service = docker_service();
    let exercise = Uuid::new_v4();
    let mut case = TestCase::new(exercise, "sum", "3\n4\n", "7\n");
    case.weight = 2.0;
    service.register_test_cases(exercise, vec![case]).unwrap();

    let mut request = SubmitRequest::new(
        Uuid::new_v4(),
        UserTier::Free,
        "python",
        "print(int(input()) + int(input()))",
    );
    request.version = Some("3.11".to_string());
    request.exercise_id = Some(exercise);

    let execution = service.submit_execution(request).await.unwrap();
    assert_eq!(execution.test_results.len(), 1);
    assert_eq!(execution.test_results[0].status, TestStatus::Passed);
    assert_eq!(execution.test_results[0].points_earned, 2.0);
}
