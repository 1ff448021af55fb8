//! Code execution sandbox engine for the learning platform.
//!
//! Accepts untrusted submitted source, runs it in an isolated, resource
//! bounded container, captures its output and optionally scores it against
//! an exercise's test cases. The transport layer (HTTP/gRPC) lives
//! elsewhere; [`service::SandboxService`] is the boundary collaborators
//! talk to.

pub mod config;
pub mod constants;
pub mod domain;
pub mod environment;
pub mod errors;
pub mod grader;
pub mod quota;
pub mod runner;
pub mod sandbox;
pub mod service;
pub mod stats;
pub mod store;
pub mod workspace;

pub use config::{EngineConfig, GraderConfig};
pub use domain::{
    Execution, ExecutionKind, ExecutionStatus, GradeReport, LimitKind, QuotaSnapshot, TestCase,
    TestResult, TestStatus, UserTier,
};
pub use environment::{EnvironmentRegistry, ExecutionEnvironment, LaunchPlan};
pub use errors::EngineError;
pub use sandbox::{DockerSandbox, Sandbox, StubSandbox};
pub use service::{SandboxService, SubmitRequest};
