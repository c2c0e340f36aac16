//! Duplicate-issue suppression.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::record::IssueRecord;
use super::similarity::{counter_suffix_value, similarity_score, strip_counter_suffix};
use super::tracker::IssueTracker;
use crate::config::IssueSettings;
use crate::error::{PatchError, Result};
use crate::lock::issue_locks;
use crate::metrics::METRICS;
use crate::obs;

/// What to do with a new failure report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Create,
    /// Fold the report into an existing record.
    UpdateExisting { id: String, score: f64 },
    /// Create a fresh record titled with a `(#n)` suffix.
    CreateWithCounter { counter: u32 },
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Create => "create",
            Decision::UpdateExisting { .. } => "update_existing",
            Decision::CreateWithCounter { .. } => "create_with_counter",
        }
    }
}

/// Thresholds for [`should_create_or_update`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardPolicy {
    pub window: Duration,
    pub count_threshold: usize,
    pub similarity_threshold: f64,
    /// Reports a record may absorb before it is considered full; 0 disables.
    pub max_occurrences: u32,
}

impl From<&IssueSettings> for GuardPolicy {
    fn from(settings: &IssueSettings) -> Self {
        Self {
            window: settings.window(),
            count_threshold: settings.count_threshold,
            similarity_threshold: settings.similarity_threshold,
            max_occurrences: settings.max_occurrences,
        }
    }
}

/// Reports folded into `record` since it was opened. A `(#n)` record was
/// opened at occurrence `n`, a plain one at 1.
fn absorbed(record: &IssueRecord) -> u32 {
    let base = counter_suffix_value(&record.title).unwrap_or(1);
    record.occurrence_counter.saturating_sub(base) + 1
}

/// Decide between `Create`, `UpdateExisting` and `CreateWithCounter`.
///
/// Only records of the candidate's category created inside the window
/// count. In order:
/// 1. `count_threshold` or more recent records yield `CreateWithCounter`,
///    whatever their similarity.
/// 2. The most similar record at or above the similarity threshold that is
///    not full absorbs the report.
/// 3. If every similar record is full, `CreateWithCounter` opens a successor.
/// 4. Otherwise `Create`.
///
/// The counter is one past both the recent count and the highest counter
/// seen.
pub fn should_create_or_update(
    candidate: &IssueRecord,
    existing: &[IssueRecord],
    policy: &GuardPolicy,
    now: DateTime<Utc>,
) -> Decision {
    let since = now - policy.window;
    let recent: Vec<&IssueRecord> = existing
        .iter()
        .filter(|r| r.category == candidate.category && r.created_at >= since && r.created_at <= now)
        .collect();
    let next_counter = || {
        let highest = recent.iter().map(|r| r.occurrence_counter).max().unwrap_or(0);
        (recent.len() as u32).max(highest) + 1
    };

    if policy.count_threshold > 0 && recent.len() >= policy.count_threshold {
        return Decision::CreateWithCounter { counter: next_counter() };
    }

    let similar: Vec<(&IssueRecord, &String, f64)> = recent
        .iter()
        .filter_map(|r| r.id.as_ref().map(|id| (*r, id, similarity_score(candidate, r))))
        .filter(|(_, _, score)| *score >= policy.similarity_threshold)
        .collect();
    let is_full = |r: &IssueRecord| policy.max_occurrences > 0 && absorbed(r) >= policy.max_occurrences;

    let best = similar
        .iter()
        .filter(|entry| !is_full(entry.0))
        .max_by(|a, b| a.2.total_cmp(&b.2));
    if let Some((_, id, score)) = best {
        return Decision::UpdateExisting {
            id: (*id).clone(),
            score: *score,
        };
    }
    if !similar.is_empty() {
        return Decision::CreateWithCounter { counter: next_counter() };
    }

    Decision::Create
}

/// Result of [`IssueDuplicationGuard::evaluate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub decision: Decision,
    /// Recent same-category records that were considered.
    pub considered: usize,
    pub warnings: Vec<String>,
}

/// Result of [`IssueDuplicationGuard::report`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportOutcome {
    pub decision: Decision,
    pub record: IssueRecord,
    pub warnings: Vec<String>,
}

/// Mediates automated failure reports so repeated failures do not spam the
/// tracker.
pub struct IssueDuplicationGuard {
    tracker: Arc<dyn IssueTracker>,
    policy: GuardPolicy,
    labels: Vec<String>,
}

impl IssueDuplicationGuard {
    pub fn new(tracker: Arc<dyn IssueTracker>, settings: &IssueSettings) -> Self {
        Self {
            tracker,
            policy: GuardPolicy::from(settings),
            labels: settings.labels.clone(),
        }
    }

    pub fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    /// Search the tracker and decide. A tracker failure degrades to
    /// `Create` with a warning.
    pub async fn evaluate(&self, candidate: &IssueRecord) -> Evaluation {
        self.evaluate_at(candidate, Utc::now()).await
    }

    pub async fn evaluate_at(&self, candidate: &IssueRecord, now: DateTime<Utc>) -> Evaluation {
        self.decide(candidate, now).await.0
    }

    async fn decide(&self, candidate: &IssueRecord, now: DateTime<Utc>) -> (Evaluation, Vec<IssueRecord>) {
        let since = now - self.policy.window;
        let existing = match self.tracker.search_open(candidate.category, since).await {
            Ok(existing) => existing,
            Err(e) => {
                let e = PatchError::DuplicateDetection(e.to_string());
                tracing::warn!(category = %candidate.category, error = %e, "issue search failed; creating a new record");
                obs::emit_issue_decision(candidate.category.as_str(), Decision::Create.as_str());
                let evaluation = Evaluation {
                    decision: Decision::Create,
                    considered: 0,
                    warnings: vec![e.to_string()],
                };
                return (evaluation, Vec::new());
            }
        };

        let decision = should_create_or_update(candidate, &existing, &self.policy, now);
        obs::emit_issue_decision(candidate.category.as_str(), decision.as_str());
        let evaluation = Evaluation {
            decision,
            considered: existing.iter().filter(|r| r.category == candidate.category).count(),
            warnings: Vec::new(),
        };
        (evaluation, existing)
    }

    /// Evaluate and apply the decision. Search, decide and write happen under
    /// a process-wide per-category lock, so concurrent reports of one
    /// category cannot both create a record.
    pub async fn report(&self, candidate: IssueRecord) -> Result<ReportOutcome> {
        let _guard = issue_locks().acquire(candidate.category.as_str()).await;
        let (evaluation, existing) = self.decide(&candidate, Utc::now()).await;

        let mut candidate = candidate;
        for label in self.labels.iter().cloned().chain(std::iter::once(candidate.category.label())) {
            if !candidate.labels.contains(&label) {
                candidate.labels.push(label);
            }
        }

        let record = match &evaluation.decision {
            Decision::Create => self.tracker.create(&candidate).await?,
            Decision::CreateWithCounter { counter } => {
                let base = strip_counter_suffix(&candidate.title).trim_end().to_string();
                candidate.title = format!("{base} (#{counter})");
                candidate.occurrence_counter = *counter;
                self.tracker.create(&candidate).await?
            }
            Decision::UpdateExisting { id, .. } => {
                let current = existing
                    .iter()
                    .find(|r| r.id.as_deref() == Some(id.as_str()))
                    .map_or(1, |r| r.occurrence_counter);
                let next = current + 1;
                let updated = self.tracker.update(id, &candidate.rendered_body(), next).await?;
                METRICS.inc_issues_suppressed();
                updated
            }
        };

        tracing::info!(
            decision = evaluation.decision.as_str(),
            id = record.id.as_deref().unwrap_or("-"),
            counter = record.occurrence_counter,
            "issue report handled"
        );
        Ok(ReportOutcome {
            decision: evaluation.decision,
            record,
            warnings: evaluation.warnings,
        })
    }
}
