use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::fs;

use crate::constants::STDIN_FILE;
use crate::domain::Execution;
use crate::environment::ExecutionEnvironment;
use crate::errors::EngineError;

/// Ephemeral filesystem area holding one execution's source and scaffold
/// files. The directory is exclusively owned by its execution and is the
/// sole mount point exposed to the sandbox. Dropping the handle removes the
/// directory, so success, failure and cancellation all clean up.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    pub source_file: String,
    pub binary_file: String,
    pub has_stdin: bool,
}

impl Workspace {
    pub fn host_path(&self) -> &Path {
        self.dir.path()
    }
}

#[derive(Clone, Debug)]
pub struct WorkspaceBuilder {
    root: PathBuf,
}

impl WorkspaceBuilder {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().into(),
        }
    }

    /// Materializes a workspace for one execution: source under the
    /// environment's filename, stdin file when the execution carries stdin,
    /// plus any environment scaffold files. Owner-only directory, read-only
    /// data files.
    pub async fn prepare(
        &self,
        execution: &Execution,
        env: &ExecutionEnvironment,
    ) -> Result<Workspace, EngineError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| EngineError::WorkspacePrep(e.to_string()))?;

        let dir = TempDir::with_prefix_in("exec-", &self.root)
            .map_err(|e| EngineError::WorkspacePrep(e.to_string()))?;

        set_mode(dir.path(), 0o700).await?;

        let source_path = dir.path().join(&env.source_file);
        write_file(&source_path, &execution.source_code).await?;

        let has_stdin = env.features.stdin && !execution.stdin.is_empty();
        if has_stdin {
            write_file(&dir.path().join(STDIN_FILE), &execution.stdin).await?;
        }

        for (name, contents) in &env.scaffold_files {
            write_file(&dir.path().join(name), contents).await?;
        }

        tracing::debug!(
            execution = %execution.id,
            path = %dir.path().display(),
            "workspace prepared"
        );

        Ok(Workspace {
            dir,
            source_file: env.source_file.clone(),
            binary_file: env.binary_file.clone(),
            has_stdin,
        })
    }
}

async fn write_file(path: &Path, contents: &str) -> Result<(), EngineError> {
    fs::write(path, contents)
        .await
        .map_err(|e| EngineError::WorkspacePrep(e.to_string()))?;
    set_mode(path, 0o644).await
}

async fn set_mode(path: &Path, mode: u32) -> Result<(), EngineError> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| EngineError::WorkspacePrep(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExecutionKind;
    use crate::environment::EnvironmentRegistry;
    use uuid::Uuid;

    fn submission(stdin: &str) -> Execution {
        let mut execution = Execution::new(
            Uuid::new_v4(),
            "python:3.11".to_string(),
            "python".to_string(),
            ExecutionKind::Playground,
            "print('hi')".to_string(),
        );
        execution.stdin = stdin.to_string();
        execution
    }

    #[tokio::test]
    async fn prepare_writes_source_and_stdin() {
        let root = std::env::temp_dir().join(format!("ws-test-{}", Uuid::new_v4()));
        let builder = WorkspaceBuilder::new(&root);
        let env = EnvironmentRegistry::with_defaults()
            .resolve("python", None)
            .unwrap();

        let ws = builder.prepare(&submission("1\n2\n"), &env).await.unwrap();

        let source = std::fs::read_to_string(ws.host_path().join("main.py")).unwrap();
        assert_eq!(source, "print('hi')");
        let stdin = std::fs::read_to_string(ws.host_path().join(STDIN_FILE)).unwrap();
        assert_eq!(stdin, "1\n2\n");
        assert!(ws.has_stdin);

        let mode = std::fs::metadata(ws.host_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn prepare_writes_scaffold_files() {
        let root = std::env::temp_dir().join(format!("ws-test-{}", Uuid::new_v4()));
        let builder = WorkspaceBuilder::new(&root);
        let env = EnvironmentRegistry::with_defaults()
            .resolve("javascript", None)
            .unwrap();

        let ws = builder.prepare(&submission(""), &env).await.unwrap();

        assert!(ws.host_path().join("package.json").exists());
        assert!(!ws.has_stdin);
        assert!(!ws.host_path().join(STDIN_FILE).exists());
    }

    #[tokio::test]
    async fn workspace_is_removed_on_drop() {
        let root = std::env::temp_dir().join(format!("ws-test-{}", Uuid::new_v4()));
        let builder = WorkspaceBuilder::new(&root);
        let env = EnvironmentRegistry::with_defaults()
            .resolve("python", None)
            .unwrap();

        let ws = builder.prepare(&submission(""), &env).await.unwrap();
        let path = ws.host_path().to_path_buf();
        assert!(path.exists());
        drop(ws);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn prepare_fails_on_unwritable_root() {
        // /proc is a read-only pseudo filesystem.
        let builder = WorkspaceBuilder::new("/proc/ws-test");
        let env = EnvironmentRegistry::with_defaults()
            .resolve("python", None)
            .unwrap();

        let result = builder.prepare(&submission(""), &env).await;
        assert!(matches!(result, Err(EngineError::WorkspacePrep(_))));
    }
}
