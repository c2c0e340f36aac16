//! Patch run results.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::PatchState;
use super::validation::ValidationOutcome;
use crate::branch::BranchPlan;
use crate::rollback::RollbackResult;

/// Why a patch run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Git,
    Operation,
    Validation,
    Cancelled,
    FileSystem,
}

/// One edge taken by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PatchState,
    pub to: PatchState,
}

/// Everything a caller needs to know about one patch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchResult {
    pub patch_id: String,
    pub description: String,
    pub success: bool,
    pub dry_run: bool,
    pub branch_name: String,
    pub branch_plan: BranchPlan,
    pub created_branch: bool,
    pub checkpoint: Option<String>,
    pub commit_hash: Option<String>,
    pub pushed: bool,
    pub affected_files: BTreeSet<PathBuf>,
    pub validation_results: BTreeMap<String, ValidationOutcome>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub final_state: PatchState,
    pub transitions: Vec<StateTransition>,
    pub rollback: Option<RollbackResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PatchResult {
    pub(crate) fn begin(patch_id: String, description: &str, dry_run: bool, plan: BranchPlan) -> Self {
        let now = Utc::now();
        Self {
            patch_id,
            description: description.to_string(),
            success: false,
            dry_run,
            branch_name: plan.target_branch_name.clone(),
            branch_plan: plan,
            created_branch: false,
            checkpoint: None,
            commit_hash: None,
            pushed: false,
            affected_files: BTreeSet::new(),
            validation_results: BTreeMap::new(),
            warnings: Vec::new(),
            error: None,
            failure_kind: None,
            final_state: PatchState::Init,
            transitions: Vec::new(),
            rollback: None,
            started_at: now,
            finished_at: now,
        }
    }

    /// Move the state machine along `self.final_state → to`.
    pub(crate) fn advance(&mut self, to: PatchState) {
        let from = self.final_state;
        if !from.can_transition_to(to) {
            tracing::error!(patch_id = %self.patch_id, from = %from, to = %to, "illegal patch state transition");
            debug_assert!(false, "illegal patch state transition {from} -> {to}");
            return;
        }
        crate::obs::emit_patch_transition(&self.patch_id, from.as_str(), to.as_str());
        self.transitions.push(StateTransition { from, to });
        self.final_state = to;
    }

    pub(crate) fn fail(&mut self, kind: FailureKind, error: impl Into<String>) {
        self.success = false;
        self.failure_kind = Some(kind);
        self.error = Some(error.into());
    }

    pub(crate) fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!(patch_id = %self.patch_id, "{warning}");
        self.warnings.push(warning);
    }

    /// States visited, starting with `Init`.
    pub fn path(&self) -> Vec<PatchState> {
        std::iter::once(PatchState::Init)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> BranchPlan {
        BranchPlan {
            current_branch: "main".to_string(),
            skip_branch_creation: false,
            target_branch_name: "patch/20260101-000000-x".to_string(),
            reason: "on trunk".to_string(),
        }
    }

    #[test]
    fn advance_records_path() {
        let mut result = PatchResult::begin("p1".into(), "x", false, plan());
        result.advance(PatchState::BranchResolved);
        result.advance(PatchState::Applied);
        result.advance(PatchState::RolledBack);
        assert_eq!(
            result.path(),
            vec![PatchState::Init, PatchState::BranchResolved, PatchState::Applied, PatchState::RolledBack]
        );
        assert_eq!(result.final_state, PatchState::RolledBack);
    }

    #[test]
    fn serializes_with_snake_case_states() {
        let mut result = PatchResult::begin("p1".into(), "x", true, plan());
        result.advance(PatchState::Aborted);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["final_state"], "aborted");
        assert_eq!(json["branch_name"], "patch/20260101-000000-x");
    }
}
