//! Failure-report de-duplication.
//!
//! Automated pipelines report failures as issues. [`IssueDuplicationGuard`]
//! folds a report into a similar recent one, or numbers it when a category
//! is noisy, instead of opening a fresh issue every time.

mod github;
mod guard;
mod record;
mod similarity;
mod tracker;

pub use github::{parse_marker, render_marker, GitHubIssueTracker, DEFAULT_API_URL};
pub use guard::{should_create_or_update, Decision, Evaluation, GuardPolicy, IssueDuplicationGuard, ReportOutcome};
pub use record::{IssueCategory, IssueRecord};
pub use similarity::{
    counter_suffix_value, jaccard, similarity_key, similarity_score, strip_counter_suffix, tokens, DEFAULT_SIMILARITY_THRESHOLD,
};
pub use tracker::{IssueTracker, MemoryIssueTracker};
