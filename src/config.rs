use std::path::PathBuf;
use std::time::Duration;

/// Grading policy knobs. The threshold/cutoff values were policy constants
/// in earlier versions of the platform; they are configuration here.
#[derive(Clone, Copy, Debug)]
pub struct GraderConfig {
    /// Minimum similarity ratio for a non-strict comparison to pass.
    pub similarity_threshold: f64,
    /// Minimum similarity ratio below which no partial credit is awarded.
    pub partial_credit_cutoff: f64,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.9,
            partial_credit_cutoff: 0.5,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Root directory under which per-execution workspaces are created.
    pub workspace_root: PathBuf,
    /// Ceiling on sandbox runs in flight across all environments.
    pub max_concurrent_executions: usize,
    /// Ceiling on sandbox runs in flight per environment.
    pub max_concurrent_per_environment: usize,
    /// Grace period between the graceful stop signal and the forced kill.
    pub stop_grace: Duration,
    /// Upper bound on submitted source size.
    pub max_source_bytes: usize,
    /// Container handles on terminal executions are cleared after this
    /// many days.
    pub retention_days: i64,
    pub grader: GraderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("codelab-sandbox"),
            max_concurrent_executions: 16,
            max_concurrent_per_environment: 4,
            stop_grace: Duration::from_secs(5),
            max_source_bytes: 128 * 1024,
            retention_days: 7,
            grader: GraderConfig::default(),
        }
    }
}
