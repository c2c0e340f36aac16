//! The patch executor: branch, apply, validate, commit, publish, and roll
//! back on failure.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;

use super::publish::{GitPushPublisher, Publisher};
use super::request::ChangeRequest;
use super::result::{FailureKind, PatchResult};
use super::snapshot::{remove_if_present, Fingerprint, PreImage, ScratchCopy};
use super::state::PatchState;
use super::validation::{unique_key, CommandValidator, ValidationOutcome, Validator};
use crate::branch::BranchStrategyResolver;
use crate::cancel::CancellationToken;
use crate::config::PatchSettings;
use crate::context::RepoContext;
use crate::error::{PatchError, Result};
use crate::git::GitCli;
use crate::lock::{repo_key, repo_locks};
use crate::metrics::METRICS;
use crate::obs;
use crate::rollback::{select_rollback_type, RollbackManager, RollbackOptions, RollbackType};

/// Per-run bookkeeping that the result does not expose.
struct Attempt {
    git: GitCli,
    live: bool,
    created_branch: bool,
    committed: bool,
    before: Option<Fingerprint>,
    preimage: Option<PreImage>,
    /// The operation outlived its grace period and may still be writing.
    operation_running: bool,
}

/// How the caller's operation failed.
enum OperationError {
    /// It returned an error, or was interrupted and has since stopped.
    Failed(String),
    /// It was interrupted and is still running after the grace period.
    Running(String),
}

impl Attempt {
    fn workdir(&self) -> &Path {
        self.git.workdir()
    }
}

/// Runs change requests against one repository.
///
/// Runs against the same repository are serialized through a process-wide
/// lock, so concurrent `execute` calls never interleave git operations.
pub struct PatchExecutor {
    context: RepoContext,
    settings: PatchSettings,
    validators: Vec<Arc<dyn Validator>>,
    publisher: Option<Arc<dyn Publisher>>,
    cancel: CancellationToken,
}

impl PatchExecutor {
    pub fn new(context: RepoContext, settings: PatchSettings) -> Self {
        Self {
            context,
            settings,
            validators: Vec::new(),
            publisher: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Add a validator that runs after the request's test commands.
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Override how branches are published (default: `git push`).
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn context(&self) -> &RepoContext {
        &self.context
    }

    /// Execute one change request.
    ///
    /// Only precondition failures are returned as `Err` (not a repository,
    /// dry run impossible). Everything after that is captured in the
    /// [`PatchResult`], including rollbacks.
    pub async fn execute(&self, request: &ChangeRequest) -> Result<PatchResult> {
        let patch_id = Uuid::new_v4().to_string();
        let span = obs::patch_span(&patch_id);
        self.execute_inner(patch_id, request).instrument(span).await
    }

    async fn execute_inner(&self, patch_id: String, request: &ChangeRequest) -> Result<PatchResult> {
        if !self.context.is_git_repo() {
            return Err(PatchError::NotARepository(
                self.context.root().display().to_string(),
            ));
        }
        obs::emit_patch_started(&patch_id, &request.description, request.dry_run);

        let _repo_guard = repo_locks().acquire(&repo_key(self.context.root())).await;
        let git = self.context.git().with_cancel(self.cancel.clone());

        let resolution = BranchStrategyResolver::new(git.clone(), self.context.trunk_branch())
            .resolve(&request.description, request.force_new_branch)
            .await;
        let mut result = PatchResult::begin(patch_id, &request.description, request.dry_run, resolution.plan);
        if let Some(warning) = resolution.warning {
            result.warn(warning);
        }
        if !resolution.success {
            result.fail(FailureKind::Git, "could not determine the current branch");
            result.advance(PatchState::Aborted);
            return Ok(self.finish(result));
        }

        if request.dry_run {
            self.dry_run(&git, request, &mut result).await?;
        } else {
            self.live_run(&git, request, &mut result).await;
        }
        Ok(self.finish(result))
    }

    async fn live_run(&self, git: &GitCli, request: &ChangeRequest, result: &mut PatchResult) {
        let mut attempt = Attempt {
            git: git.clone(),
            live: true,
            created_branch: false,
            committed: false,
            before: None,
            preimage: None,
            operation_running: false,
        };

        match PreImage::capture(git).await {
            Ok(preimage) => attempt.preimage = Some(preimage),
            Err(e) => {
                result.fail(self.failure_kind(&e), format!("could not snapshot uncommitted changes: {e}"));
                result.advance(PatchState::Aborted);
                return;
            }
        }

        if self.run_pipeline(&mut attempt, request, result).await {
            return;
        }
        if result.final_state.is_terminal() {
            return;
        }
        self.roll_back(&attempt, result).await;
    }

    async fn dry_run(&self, git: &GitCli, request: &ChangeRequest, result: &mut PatchResult) -> Result<()> {
        let scratch = ScratchCopy::create(git).await?;
        tracing::info!(scratch = %scratch.path().display(), "dry run in scratch copy");

        let mut attempt = Attempt {
            git: git.at(scratch.path()),
            live: false,
            created_branch: false,
            committed: false,
            before: None,
            preimage: None,
            operation_running: false,
        };

        let succeeded = self.run_pipeline(&mut attempt, request, result).await;

        if let Some(sha) = result.commit_hash.take() {
            result.warn(format!("dry run: commit {sha} was only made in a scratch copy"));
        }
        if !succeeded && !result.final_state.is_terminal() {
            let would = select_rollback_type(attempt.created_branch, false);
            result.warn(format!(
                "dry run: a live run would roll back with {}",
                would.as_str()
            ));
            result.advance(PatchState::Aborted);
        }
        Ok(())
    }

    /// Drive the state machine up to `Done`. Returns `false` on failure,
    /// leaving the result in the state where the failure happened.
    async fn run_pipeline(&self, attempt: &mut Attempt, request: &ChangeRequest, result: &mut PatchResult) -> bool {
        if !result.branch_plan.skip_branch_creation {
            let name = result.branch_name.clone();
            if let Err(e) = self.create_branch(&attempt.git, &name).await {
                result.fail(self.failure_kind(&e), format!("could not create branch '{name}': {e}"));
                result.advance(PatchState::Aborted);
                return false;
            }
            attempt.created_branch = true;
            if attempt.live {
                result.created_branch = true;
            }
        }

        match Fingerprint::capture(&attempt.git).await {
            Ok(before) => attempt.before = Some(before),
            Err(e) => {
                result.fail(self.failure_kind(&e), format!("could not fingerprint the working tree: {e}"));
                if attempt.live && attempt.created_branch {
                    let cleanup = RollbackManager::with_git(
                        GitCli::new(attempt.workdir(), self.context.git_timeout()),
                        self.context.trunk_branch(),
                    )
                    .rollback_with(
                        &result.branch_name,
                        RollbackType::DeleteBranch,
                        &RollbackOptions {
                            checkpoint: None,
                            return_to: Some(result.branch_plan.current_branch.clone()),
                        },
                    )
                    .await;
                    result.rollback = Some(cleanup);
                }
                result.advance(PatchState::Aborted);
                return false;
            }
        }
        if attempt.live {
            result.checkpoint = attempt.git.head_sha().await.ok();
        }
        result.advance(PatchState::BranchResolved);

        let applied = self.apply_operation(attempt, request).await;
        result.advance(PatchState::Applied);
        let kind = if self.cancel.is_cancelled() {
            FailureKind::Cancelled
        } else {
            FailureKind::Operation
        };
        match applied {
            Ok(()) => self.collect_affected(attempt, result).await,
            Err(OperationError::Failed(message)) => {
                self.collect_affected(attempt, result).await;
                result.fail(kind, message);
                return false;
            }
            Err(OperationError::Running(message)) => {
                attempt.operation_running = true;
                result.fail(kind, message);
                return false;
            }
        }

        if !self.validate(attempt, request, result).await {
            return false;
        }
        result.advance(PatchState::Validated);

        match self.commit(attempt, request, result).await {
            Ok(true) => result.advance(PatchState::Committed),
            Ok(false) => {
                result.success = true;
                result.advance(PatchState::Done);
                return true;
            }
            Err(e) => {
                result.fail(self.failure_kind(&e), format!("commit failed: {e}"));
                return false;
            }
        }

        if request.publish || self.settings.publish {
            if !attempt.live {
                result.warn("dry run: publish skipped");
            } else {
                let publisher: Arc<dyn Publisher> = match &self.publisher {
                    Some(publisher) => Arc::clone(publisher),
                    None => Arc::new(GitPushPublisher::new(self.context.remote())),
                };
                if let Err(e) = publisher.publish(&attempt.git, &result.branch_name).await {
                    result.fail(self.failure_kind(&e), format!("publish failed: {e}"));
                    return false;
                }
                result.pushed = true;
                result.advance(PatchState::Published);
            }
        }

        result.success = true;
        result.advance(PatchState::Done);
        true
    }

    /// Create and check out `name` from the trunk tip. Falls back to HEAD when
    /// trunk does not exist locally, and to an orphan checkout on an unborn
    /// repository.
    async fn create_branch(&self, git: &GitCli, name: &str) -> Result<()> {
        let trunk = self.context.trunk_branch();
        if git.branch_exists(trunk).await? {
            return git.create_branch(name, trunk).await;
        }
        if git.head_sha().await.is_ok() {
            return git.create_branch(name, "HEAD").await;
        }
        git.run(&["checkout", "-b", name]).await.map(|_| ())
    }

    /// Run the caller's operation under the operation timeout.
    ///
    /// On timeout or cancellation the operation's own token is cancelled and
    /// the operation is awaited for up to the grace period, so nothing reads
    /// or restores the tree while it may still be writing.
    async fn apply_operation(&self, attempt: &Attempt, request: &ChangeRequest) -> std::result::Result<(), OperationError> {
        let label = request.operation.describe();
        let limit = self.settings.operation_timeout();
        let op_cancel = self.cancel.child_token();
        tracing::info!(operation = %label, "applying operation");

        let mut apply = request.operation.apply(attempt.workdir(), &op_cancel);
        let interrupted = tokio::select! {
            outcome = &mut apply => return outcome.map_err(OperationError::Failed),
            _ = tokio::time::sleep(limit) => format!("operation '{label}' timed out after {}s", limit.as_secs()),
            _ = self.cancel.cancelled() => format!("operation '{label}' was cancelled"),
        };

        op_cancel.cancel();
        let grace = self.settings.operation_grace();
        match tokio::time::timeout(grace, &mut apply).await {
            Ok(_) => Err(OperationError::Failed(interrupted)),
            Err(_) => {
                tracing::error!(operation = %label, grace_secs = grace.as_secs(), "operation still running after grace period");
                Err(OperationError::Running(format!(
                    "{interrupted}; still running after a {}s grace period",
                    grace.as_secs()
                )))
            }
        }
    }

    async fn collect_affected(&self, attempt: &Attempt, result: &mut PatchResult) {
        let Some(before) = &attempt.before else {
            return;
        };
        // Fingerprinting runs git; use a handle the cancel token cannot stop
        // so rollback still knows what to restore.
        let git = GitCli::new(attempt.workdir(), self.context.git_timeout());
        match Fingerprint::capture(&git).await {
            Ok(after) => {
                result.affected_files = before.changed_since(&after);
                tracing::debug!(
                    tracked = after.len(),
                    affected = result.affected_files.len(),
                    "computed affected files"
                );
            }
            Err(e) => result.warn(format!("could not compute affected files: {e}")),
        }
    }

    async fn validate(&self, attempt: &Attempt, request: &ChangeRequest, result: &mut PatchResult) -> bool {
        let mut validators: Vec<Arc<dyn Validator>> = request
            .test_commands
            .iter()
            .map(|cmd| Arc::new(CommandValidator::new(cmd.clone(), self.settings.test_timeout())) as Arc<dyn Validator>)
            .collect();
        validators.extend(self.validators.iter().cloned());

        for validator in validators {
            let name = validator.name();
            let key = unique_key(&result.validation_results, &name);
            let outcome = if self.cancel.is_cancelled() {
                ValidationOutcome {
                    interrupted: true,
                    ..ValidationOutcome::failed("cancelled before validation started")
                }
            } else {
                validator.validate(attempt.workdir(), &self.cancel).await
            };
            let passed = outcome.success;
            let details = outcome.details.clone();
            result.validation_results.insert(key, outcome);

            if !passed {
                let kind = if self.cancel.is_cancelled() {
                    FailureKind::Cancelled
                } else {
                    FailureKind::Validation
                };
                result.fail(
                    kind,
                    PatchError::Validation { name, details }.to_string(),
                );
                return false;
            }
        }
        true
    }

    /// Stage and commit. `Ok(false)` means there was nothing to commit.
    async fn commit(&self, attempt: &mut Attempt, request: &ChangeRequest, result: &mut PatchResult) -> Result<bool> {
        let git = &attempt.git;
        if request.auto_commit_uncommitted || self.settings.auto_commit_uncommitted {
            git.add_all().await?;
        } else {
            let mut stageable = Vec::new();
            for path in &result.affected_files {
                if attempt.workdir().join(path).exists() || git.exists_in("HEAD", path).await.unwrap_or(false) {
                    stageable.push(path.clone());
                }
            }
            git.add_paths(&stageable).await?;
        }

        if !git.has_staged_changes().await? {
            result.warn("no changes to commit");
            return Ok(false);
        }

        let message = format!(
            "{}\n\nAffected files: {}\nPatch-Id: {}",
            request.description.trim(),
            result.affected_files.len(),
            result.patch_id
        );
        let sha = git.commit(&message).await?;
        tracing::info!(commit = %sha, branch = %result.branch_name, "committed patch");
        attempt.committed = true;
        result.commit_hash = Some(sha);
        Ok(true)
    }

    async fn roll_back(&self, attempt: &Attempt, result: &mut PatchResult) {
        if attempt.operation_running {
            result.warn(format!(
                "operation may still be writing to {}; rollback skipped, manual cleanup required",
                attempt.workdir().display()
            ));
            result.advance(PatchState::Aborted);
            return;
        }

        // The caller's token may already be cancelled; rollback must still run.
        let git = GitCli::new(attempt.workdir(), self.context.git_timeout());

        if !attempt.committed {
            if let Err(e) = self.restore_working_tree(&git, attempt, result).await {
                result.warn(format!("working tree restore incomplete: {e}"));
            }
        }

        let rollback_type = select_rollback_type(attempt.created_branch, result.pushed);
        let checkpoint = match rollback_type {
            // Revert the patch commit itself, not the pre-patch HEAD.
            RollbackType::RevertCommit => result.commit_hash.clone(),
            _ => result.checkpoint.clone(),
        };
        let options = RollbackOptions {
            checkpoint,
            return_to: Some(result.branch_plan.current_branch.clone()),
        };
        let rollback = RollbackManager::with_git(git, self.context.trunk_branch())
            .rollback_with(&result.branch_name, rollback_type, &options)
            .await;

        if attempt.committed {
            if let Some(preimage) = &attempt.preimage {
                if let Err(e) = preimage.restore_all(attempt.workdir()) {
                    result.warn(format!("could not restore uncommitted changes: {e}"));
                }
            }
        }

        if !rollback.success {
            result.warn(format!(
                "rollback ({}) failed; manual cleanup required: {}",
                rollback_type.as_str(),
                rollback.error.as_deref().unwrap_or("unknown error")
            ));
        }
        result.rollback = Some(rollback);
        result.advance(PatchState::RolledBack);
    }

    /// Put every affected path back to its pre-patch content.
    async fn restore_working_tree(&self, git: &GitCli, attempt: &Attempt, result: &PatchResult) -> Result<()> {
        let root = attempt.workdir();
        let mut from_checkpoint = Vec::new();
        let mut removed = Vec::new();

        for path in &result.affected_files {
            if let Some(preimage) = attempt.preimage.as_ref().filter(|p| p.covers(path)) {
                preimage.restore(root, path)?;
                continue;
            }
            let tracked = match &result.checkpoint {
                Some(checkpoint) => git.exists_in(checkpoint, path).await.unwrap_or(false),
                None => false,
            };
            if tracked {
                from_checkpoint.push(path.clone());
            } else {
                remove_if_present(&root.join(path))?;
                removed.push(path.clone());
            }
        }

        if let Some(checkpoint) = &result.checkpoint {
            git.restore_paths(checkpoint, &from_checkpoint).await?;
        }
        if !removed.is_empty() {
            if let Err(e) = git.unstage_paths(&removed).await {
                tracing::debug!(error = %e, "unstaging removed paths failed");
            }
            prune_empty_parents(root, &removed);
        }
        tracing::info!(
            restored = from_checkpoint.len(),
            removed = removed.len(),
            "restored working tree"
        );
        Ok(())
    }

    fn failure_kind(&self, error: &PatchError) -> FailureKind {
        if self.cancel.is_cancelled() && error.is_interrupted() {
            return FailureKind::Cancelled;
        }
        match error {
            PatchError::FileSystem { .. } | PatchError::Io(_) => FailureKind::FileSystem,
            PatchError::Cancelled(_) => FailureKind::Cancelled,
            _ => FailureKind::Git,
        }
    }

    fn finish(&self, mut result: PatchResult) -> PatchResult {
        result.finished_at = chrono::Utc::now();
        if result.success && !result.dry_run {
            METRICS.inc_patches_applied();
        }
        obs::emit_patch_finished(
            &result.patch_id,
            &result.branch_name,
            result.success,
            result.affected_files.len(),
        );
        result
    }
}

/// Remove directories left empty by deleting `removed`, stopping at `root`.
fn prune_empty_parents(root: &Path, removed: &[PathBuf]) {
    let mut dirs: BTreeSet<PathBuf> = BTreeSet::new();
    for path in removed {
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir.as_os_str().is_empty() {
                break;
            }
            dirs.insert(dir.to_path_buf());
            parent = dir.parent();
        }
    }
    // Deepest first.
    for dir in dirs.iter().rev() {
        let _ = std::fs::remove_dir(root.join(dir));
    }
}
