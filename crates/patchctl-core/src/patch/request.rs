//! Change requests and the operations they carry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cancel::CancellationToken;
use crate::error::{PatchError, Result};
use crate::process::{run_command, truncate_output, CommandSpec};

/// A mutation of the working tree.
///
/// `apply` receives the directory to mutate: the repository root for live
/// runs, a scratch copy for dry runs. Operations must confine their writes to
/// that directory. An `Err` is reported as an operation failure and triggers
/// rollback.
#[async_trait]
pub trait PatchOperation: Send + Sync {
    async fn apply(&self, workdir: &Path, cancel: &CancellationToken) -> std::result::Result<(), String>;

    /// Short label for logs and reports.
    fn describe(&self) -> String {
        "operation".to_string()
    }
}

/// Adapts a synchronous closure into a [`PatchOperation`].
///
/// The closure runs on the blocking pool and gets a token it should poll
/// between steps; the executor cancels it on timeout and waits for it to
/// return before touching the tree. A panic inside it is reported as an
/// operation failure instead of unwinding into the executor.
pub struct FnOperation<F> {
    label: String,
    f: Arc<F>,
}

impl<F> FnOperation<F>
where
    F: Fn(&Path, &CancellationToken) -> std::result::Result<(), String> + Send + Sync + 'static,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            f: Arc::new(f),
        }
    }
}

#[async_trait]
impl<F> PatchOperation for FnOperation<F>
where
    F: Fn(&Path, &CancellationToken) -> std::result::Result<(), String> + Send + Sync + 'static,
{
    async fn apply(&self, workdir: &Path, cancel: &CancellationToken) -> std::result::Result<(), String> {
        if cancel.is_cancelled() {
            return Err("cancelled before the operation started".to_string());
        }
        let f = Arc::clone(&self.f);
        let workdir = workdir.to_path_buf();
        let cancel = cancel.clone();
        match tokio::task::spawn_blocking(move || f(&workdir, &cancel)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(format!("operation '{}' panicked", self.label)),
            Err(e) => Err(format!("operation '{}' did not complete: {e}", self.label)),
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Runs a shell command line in the working directory.
#[derive(Debug, Clone)]
pub struct ShellOperation {
    command: String,
    timeout: Duration,
}

impl ShellOperation {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PatchOperation for ShellOperation {
    async fn apply(&self, workdir: &Path, cancel: &CancellationToken) -> std::result::Result<(), String> {
        let spec = CommandSpec::shell(&self.command, workdir, self.timeout);
        let output = run_command(&spec, cancel).await.map_err(|e| e.to_string())?;
        if output.success {
            tracing::debug!(command = %self.command, duration_ms = output.duration_ms, "shell operation finished");
            Ok(())
        } else {
            Err(format!(
                "`{}` exited with {:?}: {}",
                self.command,
                output.exit_code,
                truncate_output(&output.combined(), 2000)
            ))
        }
    }

    fn describe(&self) -> String {
        format!("sh: {}", self.command)
    }
}

/// Everything the executor needs to run one patch.
#[derive(Clone)]
pub struct ChangeRequest {
    pub description: String,
    pub operation: Arc<dyn PatchOperation>,
    /// Validation commands, run in order from the working-tree root.
    pub test_commands: Vec<String>,
    /// Commit pre-existing uncommitted changes together with the patch.
    pub auto_commit_uncommitted: bool,
    pub dry_run: bool,
    pub force_new_branch: bool,
    /// Push the branch after committing.
    pub publish: bool,
}

impl ChangeRequest {
    /// Build a request. The description must contain something besides
    /// whitespace.
    pub fn new(description: impl Into<String>, operation: Arc<dyn PatchOperation>) -> Result<Self> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(PatchError::InvalidRequest(
                "change description must not be empty".to_string(),
            ));
        }
        Ok(Self {
            description,
            operation,
            test_commands: Vec::new(),
            auto_commit_uncommitted: false,
            dry_run: false,
            force_new_branch: false,
            publish: false,
        })
    }

    /// Convenience for closure-backed requests.
    pub fn from_fn<F>(description: impl Into<String>, f: F) -> Result<Self>
    where
        F: Fn(&Path) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self::from_cancellable_fn(description, move |dir, _| f(dir))
    }

    /// Closure-backed request whose closure watches the cancellation token.
    pub fn from_cancellable_fn<F>(description: impl Into<String>, f: F) -> Result<Self>
    where
        F: Fn(&Path, &CancellationToken) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        let description = description.into();
        let label = description.clone();
        Self::new(description, Arc::new(FnOperation::new(label, f)))
    }

    pub fn with_test_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.test_commands
            .extend(commands.into_iter().map(Into::into).filter(|c: &String| !c.trim().is_empty()));
        self
    }

    pub fn auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit_uncommitted = enabled;
        self
    }

    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn force_new_branch(mut self, enabled: bool) -> Self {
        self.force_new_branch = enabled;
        self
    }

    pub fn publish(mut self, enabled: bool) -> Self {
        self.publish = enabled;
        self
    }
}

impl fmt::Debug for ChangeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeRequest")
            .field("description", &self.description)
            .field("operation", &self.operation.describe())
            .field("test_commands", &self.test_commands)
            .field("auto_commit_uncommitted", &self.auto_commit_uncommitted)
            .field("dry_run", &self.dry_run)
            .field("force_new_branch", &self.force_new_branch)
            .field("publish", &self.publish)
            .finish()
    }
}

/// Write `contents` to `relative` under `workdir`, creating parent
/// directories. Handy for closure operations.
pub fn write_file(workdir: &Path, relative: impl AsRef<Path>, contents: &str) -> std::result::Result<(), String> {
    let path: PathBuf = workdir.join(relative.as_ref());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("{}: {e}", parent.display()))?;
    }
    std::fs::write(&path, contents).map_err(|e| format!("{}: {e}", path.display()))
}
