//! Patch lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a patch run currently is.
///
/// Happy path: `Init → BranchResolved → Applied → Validated → Committed →
/// (Published) → Done`. `RolledBack` is only reachable once a checkpoint
/// exists (from `Applied` onwards); `Aborted` ends runs that had nothing to
/// roll back, including every failed dry run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchState {
    Init,
    BranchResolved,
    Applied,
    Validated,
    Committed,
    Published,
    Done,
    RolledBack,
    Aborted,
}

impl PatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchState::Init => "init",
            PatchState::BranchResolved => "branch_resolved",
            PatchState::Applied => "applied",
            PatchState::Validated => "validated",
            PatchState::Committed => "committed",
            PatchState::Published => "published",
            PatchState::Done => "done",
            PatchState::RolledBack => "rolled_back",
            PatchState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PatchState::Done | PatchState::RolledBack | PatchState::Aborted)
    }

    /// Whether `self → next` is a legal edge.
    pub fn can_transition_to(&self, next: PatchState) -> bool {
        use PatchState::*;
        match (self, next) {
            (Init, BranchResolved) => true,
            (BranchResolved, Applied) => true,
            (Applied, Validated) => true,
            (Validated, Committed) | (Validated, Done) => true,
            (Committed, Published) | (Committed, Done) => true,
            (Published, Done) => true,
            (Applied | Validated | Committed, RolledBack) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for PatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
