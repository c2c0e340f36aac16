//! Patch execution.
//!
//! A [`ChangeRequest`] carries a working-tree operation plus validation
//! commands. [`PatchExecutor`] runs it through
//! `Init → BranchResolved → Applied → Validated → Committed → (Published) → Done`,
//! rolling back via [`RollbackManager`](crate::rollback::RollbackManager) when
//! a step after the checkpoint fails.

mod executor;
mod publish;
mod report;
mod request;
mod result;
mod snapshot;
mod state;
mod validation;

pub use executor::PatchExecutor;
pub use publish::{GitPushPublisher, Publisher};
pub use report::render_patch_report_md;
pub use request::{write_file, ChangeRequest, FnOperation, PatchOperation, ShellOperation};
pub use result::{FailureKind, PatchResult, StateTransition};
pub use snapshot::{Fingerprint, PreImage, ScratchCopy};
pub use state::PatchState;
pub use validation::{CommandValidator, ValidationOutcome, Validator};
