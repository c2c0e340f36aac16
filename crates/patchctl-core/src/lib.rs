//! patchctl core library
//!
//! Git-controlled patch orchestration: branch strategy, transactional patch
//! execution with rollback, artifact consolidation, backup statistics and
//! duplicate failure-report suppression.

pub mod branch;
pub mod cancel;
pub mod config;
pub mod consolidate;
pub mod context;
pub mod error;
pub mod git;
pub mod issues;
pub mod lock;
pub mod metrics;
pub mod obs;
pub mod patch;
pub mod process;
pub mod rollback;
pub mod stats;
pub mod telemetry;

pub use branch::{BranchPlan, BranchQuery, BranchResolution, BranchStrategyResolver};
pub use cancel::CancellationToken;
pub use config::{ConsolidationSettings, GitSettings, IssueSettings, PatchSettings, PatchctlConfig};
pub use consolidate::{
    ArtifactConsolidator, CleanupTarget, Confirmation, ConsolidateOptions, ConsolidationManifest, Disposition,
    FixedConfirmation,
};
pub use context::{Platform, RepoContext};
pub use error::{PatchError, Result};
pub use git::{BranchInfo, GitCli};
pub use issues::{
    Decision, GitHubIssueTracker, IssueCategory, IssueDuplicationGuard, IssueRecord, IssueTracker,
    MemoryIssueTracker,
};
pub use metrics::METRICS;
pub use patch::{ChangeRequest, PatchExecutor, PatchResult, PatchState};
pub use rollback::{RollbackManager, RollbackOptions, RollbackResult, RollbackType};
pub use stats::{analyze, BackupFile, Report, ReportMode};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
