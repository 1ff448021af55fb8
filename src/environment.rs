use std::time::Duration;

use dashmap::DashMap;

use crate::constants::{STDIN_FILE, WORKSPACE_MOUNT};
use crate::errors::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvironmentStatus {
    Active,
    Maintenance,
    Deprecated,
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    Stdin,
    Network,
    FileIo,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EnvFeatures {
    pub stdin: bool,
    pub network: bool,
    pub file_io: bool,
}

impl EnvFeatures {
    pub fn enabled(&self) -> Vec<Feature> {
        let mut out = Vec::new();
        if self.stdin {
            out.push(Feature::Stdin);
        }
        if self.network {
            out.push(Feature::Network);
        }
        if self.file_io {
            out.push(Feature::FileIo);
        }
        out
    }
}

/// How an environment turns a workspace into a running process. Adding a
/// language means registering a new environment with its own plan; nothing
/// else in the crate branches on the language name.
#[derive(Clone, Debug)]
pub enum LaunchPlan {
    /// Single interpreter invocation, e.g. `python3 {source}`.
    Interpret { command: String },
    /// Compile step chained before the run step with `&&`.
    CompileAndRun { compile: String, run: String },
}

impl LaunchPlan {
    /// Renders the plan into an `sh -c` command line against the workspace
    /// layout. `{source}` and `{binary}` placeholders resolve to paths under
    /// the in-container mount point; argv is appended shell-quoted and
    /// stdin, when present, is redirected from the workspace stdin file.
    pub fn render(&self, source_file: &str, binary_file: &str, argv: &[String], with_stdin: bool) -> Vec<String> {
        let source = format!("{WORKSPACE_MOUNT}/{source_file}");
        let binary = format!("{WORKSPACE_MOUNT}/{binary_file}");

        let mut line = match self {
            LaunchPlan::Interpret { command } => substitute(command, &source, &binary),
            LaunchPlan::CompileAndRun { compile, run } => format!(
                "{} && {}",
                substitute(compile, &source, &binary),
                substitute(run, &source, &binary)
            ),
        };

        for arg in argv {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        if with_stdin {
            line.push_str(&format!(" < {WORKSPACE_MOUNT}/{STDIN_FILE}"));
        }

        vec!["/bin/sh".to_string(), "-c".to_string(), line]
    }
}

fn substitute(template: &str, source: &str, binary: &str) -> String {
    template.replace("{source}", source).replace("{binary}", binary)
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// A supported language/runtime configuration. (language, version) is the
/// unique registry key. Read-heavy, mutated only by administrators.
#[derive(Clone, Debug)]
pub struct ExecutionEnvironment {
    pub language: String,
    pub version: String,
    pub image: String,
    pub default_timeout: Duration,
    pub memory_limit_mb: u64,
    pub cpu_time_limit_secs: u64,
    pub cpu_cores: f64,
    pub max_output_bytes: usize,
    pub pids_limit: i64,
    pub features: EnvFeatures,
    /// Per-environment deny list checked by the submission pre-filter.
    pub blocked_patterns: Vec<String>,
    pub launch_plan: LaunchPlan,
    /// Filename the submitted source is written under, e.g. "main.py".
    pub source_file: String,
    /// Compiled-output filename reserved in the workspace.
    pub binary_file: String,
    /// Extra files the builder materializes into every workspace for this
    /// environment (manifest, wrapper entry point, ...).
    pub scaffold_files: Vec<(String, String)>,
    pub status: EnvironmentStatus,
    /// Higher wins when resolving a language without an explicit version.
    pub priority: u32,
    /// Daily execution cap across all users of this environment.
    pub daily_cap: u64,
}

impl ExecutionEnvironment {
    pub fn key(&self) -> String {
        format!("{}:{}", self.language, self.version)
    }

    pub fn is_active(&self) -> bool {
        self.status == EnvironmentStatus::Active
    }
}

/// Catalog of supported runtimes, keyed by "language:version".
#[derive(Debug, Default)]
pub struct EnvironmentRegistry {
    entries: DashMap<String, ExecutionEnvironment>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the stock runtimes.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for env in default_environments() {
            // Seed keys are distinct by construction.
            let _ = registry.register(env);
        }
        registry
    }

    pub fn register(&self, env: ExecutionEnvironment) -> Result<(), EngineError> {
        let key = env.key();
        if self.entries.contains_key(&key) {
            return Err(EngineError::DuplicateEnvironment(key));
        }
        self.entries.insert(key, env);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<ExecutionEnvironment> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Best match for a language: the exact (language, version) pair when
    /// given and active, otherwise the highest-priority active entry.
    pub fn resolve(
        &self,
        language: &str,
        version: Option<&str>,
    ) -> Result<ExecutionEnvironment, EngineError> {
        let not_found = || EngineError::EnvironmentNotFound {
            language: language.to_string(),
            version: version.map(str::to_string),
        };

        if let Some(version) = version {
            return self
                .entries
                .get(&format!("{language}:{version}"))
                .filter(|e| e.is_active())
                .map(|e| e.clone())
                .ok_or_else(not_found);
        }

        self.entries
            .iter()
            .filter(|e| e.language == language && e.is_active())
            .max_by_key(|e| e.priority)
            .map(|e| e.clone())
            .ok_or_else(not_found)
    }
}

fn default_environments() -> Vec<ExecutionEnvironment> {
    let base = ExecutionEnvironment {
        language: String::new(),
        version: String::new(),
        image: String::new(),
        default_timeout: Duration::from_secs(10),
        memory_limit_mb: 256,
        cpu_time_limit_secs: 10,
        cpu_cores: 1.0,
        max_output_bytes: 64 * 1024,
        pids_limit: 64,
        features: EnvFeatures {
            stdin: true,
            network: false,
            file_io: true,
        },
        blocked_patterns: Vec::new(),
        launch_plan: LaunchPlan::Interpret {
            command: String::new(),
        },
        source_file: String::new(),
        binary_file: "main.bin".to_string(),
        scaffold_files: Vec::new(),
        status: EnvironmentStatus::Active,
        priority: 100,
        daily_cap: 10_000,
    };

    vec![
        ExecutionEnvironment {
            language: "python".to_string(),
            version: "3.11".to_string(),
            image: "python:3.11-slim".to_string(),
            launch_plan: LaunchPlan::Interpret {
                command: "python3 {source}".to_string(),
            },
            source_file: "main.py".to_string(),
            blocked_patterns: vec![
                "os.system".to_string(),
                "subprocess".to_string(),
                "shutil.rmtree".to_string(),
            ],
            ..base.clone()
        },
        ExecutionEnvironment {
            language: "javascript".to_string(),
            version: "20".to_string(),
            image: "node:20-slim".to_string(),
            launch_plan: LaunchPlan::Interpret {
                command: "node {source}".to_string(),
            },
            source_file: "main.js".to_string(),
            scaffold_files: vec![(
                "package.json".to_string(),
                "{ \"name\": \"submission\", \"type\": \"commonjs\" }\n".to_string(),
            )],
            blocked_patterns: vec!["child_process".to_string()],
            ..base.clone()
        },
        ExecutionEnvironment {
            language: "cpp".to_string(),
            version: "17".to_string(),
            image: "gcc:13".to_string(),
            default_timeout: Duration::from_secs(20),
            memory_limit_mb: 512,
            launch_plan: LaunchPlan::CompileAndRun {
                compile: "g++ -std=c++17 -O2 -o {binary} {source}".to_string(),
                run: "{binary}".to_string(),
            },
            source_file: "main.cpp".to_string(),
            ..base
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_exact_version() {
        let registry = EnvironmentRegistry::with_defaults();
        let env = registry.resolve("python", Some("3.11")).unwrap();
        assert_eq!(env.image, "python:3.11-slim");
    }

    #[test]
    fn resolve_without_version_picks_highest_priority_active() {
        let registry = EnvironmentRegistry::with_defaults();
        let mut old = registry.resolve("python", Some("3.11")).unwrap();
        old.version = "3.8".to_string();
        old.priority = 10;
        registry.register(old).unwrap();

        let env = registry.resolve("python", None).unwrap();
        assert_eq!(env.version, "3.11");
    }

    #[test]
    fn resolve_skips_inactive_environments() {
        let registry = EnvironmentRegistry::new();
        let mut env = default_environments().remove(0);
        env.status = EnvironmentStatus::Disabled;
        registry.register(env).unwrap();

        assert!(matches!(
            registry.resolve("python", None),
            Err(EngineError::EnvironmentNotFound { .. })
        ));
        assert!(matches!(
            registry.resolve("python", Some("3.11")),
            Err(EngineError::EnvironmentNotFound { .. })
        ));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let registry = EnvironmentRegistry::with_defaults();
        let env = registry.resolve("python", Some("3.11")).unwrap();
        assert!(matches!(
            registry.register(env),
            Err(EngineError::DuplicateEnvironment(_))
        ));
    }

    #[test]
    fn feature_list_reflects_the_flags() {
        let registry = EnvironmentRegistry::with_defaults();
        let env = registry.resolve("python", Some("3.11")).unwrap();
        assert_eq!(env.features.enabled(), vec![Feature::Stdin, Feature::FileIo]);

        let mut open = env;
        open.features.network = true;
        assert!(open.features.enabled().contains(&Feature::Network));
    }

    #[test]
    fn interpret_plan_renders_with_stdin_and_argv() {
        let plan = LaunchPlan::Interpret {
            command: "python3 {source}".to_string(),
        };
        let cmd = plan.render("main.py", "main.bin", &["a b".to_string()], true);
        assert_eq!(cmd[0], "/bin/sh");
        assert_eq!(cmd[1], "-c");
        assert_eq!(
            cmd[2],
            "python3 /workspace/main.py 'a b' < /workspace/stdin.txt"
        );
    }

    #[test]
    fn compile_plan_chains_build_and_run() {
        let plan = LaunchPlan::CompileAndRun {
            compile: "g++ -o {binary} {source}".to_string(),
            run: "{binary}".to_string(),
        };
        let cmd = plan.render("main.cpp", "main.bin", &[], false);
        assert_eq!(
            cmd[2],
            "g++ -o /workspace/main.bin /workspace/main.cpp && /workspace/main.bin"
        );
    }
}
