//! Rollback of patch branches and commits.
//!
//! Three strategies, chosen by [`select_rollback_type`]:
//! - [`RollbackType::DeleteBranch`] for branches created by this invocation
//!   that were never pushed,
//! - [`RollbackType::RevertCommit`] once a push has happened (history may be
//!   shared, so it is never rewritten),
//! - [`RollbackType::ResetToParent`] otherwise.
//!
//! Every strategy is idempotent: rolling back an already-clean branch is a
//! successful no-op. Failures are reported, never retried.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::context::RepoContext;
use crate::error::Result;
use crate::git::GitCli;
use crate::metrics::METRICS;
use crate::obs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackType {
    ResetToParent,
    DeleteBranch,
    RevertCommit,
}

impl RollbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackType::ResetToParent => "reset_to_parent",
            RollbackType::DeleteBranch => "delete_branch",
            RollbackType::RevertCommit => "revert_commit",
        }
    }
}

impl std::str::FromStr for RollbackType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reset" | "reset_to_parent" | "reset-to-parent" => Ok(RollbackType::ResetToParent),
            "delete" | "delete_branch" | "delete-branch" => Ok(RollbackType::DeleteBranch),
            "revert" | "revert_commit" | "revert-commit" => Ok(RollbackType::RevertCommit),
            other => Err(format!("unknown rollback type: {other}")),
        }
    }
}

/// Pick the rollback strategy for a failed patch.
pub fn select_rollback_type(created_branch: bool, pushed: bool) -> RollbackType {
    if pushed {
        RollbackType::RevertCommit
    } else if created_branch {
        RollbackType::DeleteBranch
    } else {
        RollbackType::ResetToParent
    }
}

/// Outcome of one rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub success: bool,
    pub rollback_type: RollbackType,
    pub branch: String,
    /// What the repository looks like afterwards (a ref, SHA or note).
    pub restored_state: String,
    pub error: Option<String>,
}

/// Optional knobs for [`RollbackManager::rollback_with`].
#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    /// `ResetToParent`: reset here instead of the merge-base with trunk.
    /// `RevertCommit`: the commit to revert instead of the branch tip.
    pub checkpoint: Option<String>,
    /// `DeleteBranch`: branch to check out before deleting (default: trunk).
    pub return_to: Option<String>,
}

/// Outcome of [`RollbackManager::prune_stale_branches`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
    pub dry_run: bool,
}

/// Reverts branches and commits to a prior state.
pub struct RollbackManager {
    git: GitCli,
    trunk_branch: String,
}

impl RollbackManager {
    pub fn new(context: &RepoContext) -> Self {
        Self::with_git(context.git(), context.trunk_branch())
    }

    pub fn with_git(git: GitCli, trunk_branch: &str) -> Self {
        Self {
            git,
            trunk_branch: trunk_branch.to_string(),
        }
    }

    pub async fn rollback(&self, branch: &str, rollback_type: RollbackType) -> RollbackResult {
        self.rollback_with(branch, rollback_type, &RollbackOptions::default())
            .await
    }

    pub async fn rollback_with(
        &self,
        branch: &str,
        rollback_type: RollbackType,
        options: &RollbackOptions,
    ) -> RollbackResult {
        let outcome = match rollback_type {
            RollbackType::DeleteBranch => self.delete_branch(branch, options).await,
            RollbackType::ResetToParent => self.reset_to_parent(branch, options).await,
            RollbackType::RevertCommit => self.revert_commit(branch, options).await,
        };

        let result = match outcome {
            Ok(restored_state) => RollbackResult {
                success: true,
                rollback_type,
                branch: branch.to_string(),
                restored_state,
                error: None,
            },
            Err(e) => {
                tracing::error!(branch = %branch, rollback_type = rollback_type.as_str(), error = %e, "rollback failed");
                RollbackResult {
                    success: false,
                    rollback_type,
                    branch: branch.to_string(),
                    restored_state: "unknown; manual inspection required".to_string(),
                    error: Some(e.to_string()),
                }
            }
        };

        if result.success {
            METRICS.inc_rollbacks();
        }
        obs::emit_rollback_finished(branch, rollback_type.as_str(), result.success);
        result
    }

    async fn delete_branch(&self, branch: &str, options: &RollbackOptions) -> Result<String> {
        if branch == self.trunk_branch {
            return Err(crate::error::PatchError::InvalidRequest(format!(
                "refusing to delete trunk branch '{branch}'"
            )));
        }
        let return_to = options
            .return_to
            .clone()
            .filter(|b| b != branch)
            .unwrap_or_else(|| self.trunk_branch.clone());

        if !self.git.branch_exists(branch).await? {
            return Ok(format!("branch '{branch}' already absent"));
        }

        if self.git.current_branch().await.ok().as_deref() == Some(branch) {
            self.git.checkout(&return_to).await?;
        }
        self.git.delete_branch(branch).await?;
        Ok(format!("deleted '{branch}'; on '{return_to}'"))
    }

    async fn reset_to_parent(&self, branch: &str, options: &RollbackOptions) -> Result<String> {
        let target = match &options.checkpoint {
            Some(checkpoint) => self.git.rev_parse(checkpoint).await?,
            None => self.git.merge_base(branch, &self.trunk_branch).await?,
        };
        let tip = self.git.rev_parse(&format!("refs/heads/{branch}")).await?;
        if tip == target {
            return Ok(target);
        }

        if self.git.current_branch().await.ok().as_deref() == Some(branch) {
            self.git.reset_hard(&target).await?;
        } else {
            self.git.run(&["branch", "-f", branch, &target]).await?;
        }
        Ok(target)
    }

    async fn revert_commit(&self, branch: &str, options: &RollbackOptions) -> Result<String> {
        if self.git.current_branch().await.ok().as_deref() != Some(branch) {
            self.git.checkout(branch).await?;
        }

        let commit = match &options.checkpoint {
            Some(commit) => self.git.rev_parse(commit).await?,
            None => {
                let tip_message = self
                    .git
                    .log_messages("-1")
                    .await?
                    .into_iter()
                    .next()
                    .unwrap_or_default();
                if is_revert_message(&tip_message) {
                    return self.git.head_sha().await;
                }
                self.git.head_sha().await?
            }
        };

        let marker = format!("This reverts commit {commit}");
        let since = self.git.log_messages(&format!("{commit}..HEAD")).await?;
        if since.iter().any(|m| m.contains(&marker)) {
            return self.git.head_sha().await;
        }

        self.git.revert(&commit).await
    }

    /// Delete stale local branches under `prefix`, keeping the newest branch
    /// per hour. Trunk and the checked-out branch are never deleted.
    pub async fn prune_stale_branches(&self, prefix: &str, dry_run: bool) -> Result<PruneReport> {
        let current = self.git.current_branch().await.ok();
        let branches = self.git.list_branches(prefix).await?;

        let mut report = PruneReport {
            dry_run,
            ..PruneReport::default()
        };
        let mut seen_hours = BTreeSet::new();
        for info in branches {
            let hour = info.committed_at.format("%Y-%m-%d %H").to_string();
            let protected =
                info.name == self.trunk_branch || current.as_deref() == Some(info.name.as_str());
            if seen_hours.insert(hour) || protected {
                report.kept.push(info.name);
                continue;
            }
            if dry_run {
                report.deleted.push(info.name);
                continue;
            }
            match self.git.delete_branch(&info.name).await {
                Ok(()) => report.deleted.push(info.name),
                Err(e) => {
                    tracing::warn!(branch = %info.name, error = %e, "failed to prune branch");
                    report.failed.push(info.name);
                }
            }
        }
        tracing::info!(
            kept = report.kept.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            dry_run,
            "pruned stale branches"
        );
        Ok(report)
    }
}

fn is_revert_message(message: &str) -> bool {
    message.starts_with("Revert \"") && message.contains("This reverts commit ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_policy() {
        assert_eq!(select_rollback_type(true, false), RollbackType::DeleteBranch);
        assert_eq!(select_rollback_type(true, true), RollbackType::RevertCommit);
        assert_eq!(select_rollback_type(false, true), RollbackType::RevertCommit);
        assert_eq!(select_rollback_type(false, false), RollbackType::ResetToParent);
    }

    #[test]
    fn parse_rollback_type() {
        assert_eq!("reset".parse::<RollbackType>().unwrap(), RollbackType::ResetToParent);
        assert_eq!("delete-branch".parse::<RollbackType>().unwrap(), RollbackType::DeleteBranch);
        assert_eq!("revert_commit".parse::<RollbackType>().unwrap(), RollbackType::RevertCommit);
        assert!("squash".parse::<RollbackType>().is_err());
    }

    #[test]
    fn revert_message_detection() {
        assert!(is_revert_message(
            "Revert \"add a\"\n\nThis reverts commit 0123abcd."
        ));
        assert!(!is_revert_message("add a"));
    }
}
