//! Branch strategy: decide whether a change gets a fresh patch branch or
//! continues on the current one.
//!
//! The anti-recursive rule: when the tool is re-invoked from a branch that
//! already follows a feature-branch convention, it stays on that branch
//! instead of spawning a nested chain of patch branches.

use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::git::GitCli;

/// Prefix of every branch patchctl synthesizes.
pub const PATCH_BRANCH_PREFIX: &str = "patch/";

/// Prefixes treated as "already on a feature branch".
pub const FEATURE_BRANCH_PREFIXES: &[&str] = &["patch/", "feature/", "fix/", "hotfix/"];

const SLUG_FALLBACK: &str = "patch";
const SLUG_MAX_LEN: usize = 50;
const MAX_COLLISION_SUFFIX: u32 = 100;

/// The branch decision for one change request. Never mutated; a new plan is
/// computed for every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchPlan {
    pub current_branch: String,
    pub skip_branch_creation: bool,
    pub target_branch_name: String,
    pub reason: String,
}

/// Resolver output. `success == false` means the branch query failed and the
/// plan is a degraded, non-destructive one (stay where we are).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchResolution {
    pub success: bool,
    pub plan: BranchPlan,
    pub warning: Option<String>,
}

/// Read-only branch queries the resolver needs.
#[async_trait]
pub trait BranchQuery: Send + Sync {
    async fn current_branch(&self) -> Result<String>;
    async fn branch_exists(&self, name: &str) -> Result<bool>;
}

#[async_trait]
impl BranchQuery for GitCli {
    async fn current_branch(&self) -> Result<String> {
        GitCli::current_branch(self).await
    }

    async fn branch_exists(&self, name: &str) -> Result<bool> {
        GitCli::branch_exists(self, name).await
    }
}

fn non_slug_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9-]+").expect("valid slug regex"))
}

fn repeated_dashes() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-{2,}").expect("valid dash regex"))
}

/// Derive a branch-safe slug from a free-form description.
///
/// Lower-cases, turns every run of characters outside `[a-z0-9-]` into a
/// single `-`, collapses repeated dashes and trims them from both ends. Never
/// returns an empty string.
pub fn slugify(description: &str) -> String {
    let lowered = description.to_lowercase();
    let dashed = non_slug_chars().replace_all(&lowered, "-");
    let collapsed = repeated_dashes().replace_all(&dashed, "-");
    let mut slug: String = collapsed.trim_matches('-').chars().take(SLUG_MAX_LEN).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        SLUG_FALLBACK.to_string()
    } else {
        slug
    }
}

/// `patch/<YYYYMMDD-HHMMSS>-<slug>` for `now`.
pub fn synthesize_branch_name(description: &str, now: DateTime<Utc>) -> String {
    format!(
        "{PATCH_BRANCH_PREFIX}{}-{}",
        now.format("%Y%m%d-%H%M%S"),
        slugify(description)
    )
}

/// Whether `branch` follows one of the feature-branch conventions.
pub fn is_feature_branch(branch: &str) -> bool {
    FEATURE_BRANCH_PREFIXES
        .iter()
        .any(|prefix| branch.starts_with(prefix) && branch.len() > prefix.len())
}

/// Decides the branch plan for a change.
pub struct BranchStrategyResolver<Q> {
    query: Q,
    trunk_branch: String,
}

impl<Q: BranchQuery> BranchStrategyResolver<Q> {
    pub fn new(query: Q, trunk_branch: impl Into<String>) -> Self {
        Self {
            query,
            trunk_branch: trunk_branch.into(),
        }
    }

    fn is_trunk(&self, branch: &str) -> bool {
        branch == self.trunk_branch || branch == "main" || branch == "master"
    }

    pub async fn resolve(&self, description: &str, force_new_branch: bool) -> BranchResolution {
        self.resolve_at(description, force_new_branch, Utc::now()).await
    }

    /// Resolve using an explicit clock, so names are reproducible in tests.
    pub async fn resolve_at(
        &self,
        description: &str,
        force_new_branch: bool,
        now: DateTime<Utc>,
    ) -> BranchResolution {
        let current_branch = match self.query.current_branch().await {
            Ok(branch) => branch,
            Err(e) => {
                tracing::warn!(error = %e, "branch query failed; continuing without a new branch");
                return BranchResolution {
                    success: false,
                    plan: BranchPlan {
                        current_branch: self.trunk_branch.clone(),
                        skip_branch_creation: true,
                        target_branch_name: self.trunk_branch.clone(),
                        reason: format!("branch query failed: {e}"),
                    },
                    warning: Some(e.to_string()),
                };
            }
        };

        if force_new_branch {
            return self
                .new_branch(description, now, current_branch, "new branch forced by caller", None)
                .await;
        }

        if is_feature_branch(&current_branch) && !self.is_trunk(&current_branch) {
            tracing::info!(branch = %current_branch, "already on a feature branch; reusing it");
            return BranchResolution {
                success: true,
                plan: BranchPlan {
                    target_branch_name: current_branch.clone(),
                    current_branch,
                    skip_branch_creation: true,
                    reason: "already on a feature branch (anti-recursive protection)".to_string(),
                },
                warning: None,
            };
        }

        if self.is_trunk(&current_branch) {
            return self
                .new_branch(description, now, current_branch, "on trunk branch", None)
                .await;
        }

        let warning = format!(
            "branch '{current_branch}' does not follow a known naming convention; creating a patch branch"
        );
        tracing::warn!(branch = %current_branch, "unexpected branch naming");
        self.new_branch(
            description,
            now,
            current_branch,
            "unexpected branch naming",
            Some(warning),
        )
        .await
    }

    async fn new_branch(
        &self,
        description: &str,
        now: DateTime<Utc>,
        current_branch: String,
        reason: &str,
        warning: Option<String>,
    ) -> BranchResolution {
        let base = synthesize_branch_name(description, now);
        let (target_branch_name, collision_warning) = self.unique_name(&base).await;
        BranchResolution {
            success: true,
            plan: BranchPlan {
                current_branch,
                skip_branch_creation: false,
                target_branch_name,
                reason: reason.to_string(),
            },
            warning: warning.or(collision_warning),
        }
    }

    /// `base`, or `base-2`, `base-3`, ... when earlier names already exist.
    async fn unique_name(&self, base: &str) -> (String, Option<String>) {
        match self.query.branch_exists(base).await {
            Ok(false) => return (base.to_string(), None),
            Ok(true) => {}
            Err(e) => {
                return (
                    base.to_string(),
                    Some(format!("could not check branch existence: {e}")),
                )
            }
        }
        for n in 2..=MAX_COLLISION_SUFFIX {
            let candidate = format!("{base}-{n}");
            if let Ok(false) = self.query.branch_exists(&candidate).await {
                return (candidate, None);
            }
        }
        let fallback = format!("{base}-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        (fallback, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PatchError;
    use chrono::TimeZone;
    use std::collections::HashSet;

    struct FakeQuery {
        current: std::result::Result<String, String>,
        existing: HashSet<String>,
    }

    impl FakeQuery {
        fn on(branch: &str) -> Self {
            Self {
                current: Ok(branch.to_string()),
                existing: HashSet::new(),
            }
        }
    }

    #[async_trait]
    impl BranchQuery for FakeQuery {
        async fn current_branch(&self) -> Result<String> {
            self.current.clone().map_err(PatchError::NotARepository)
        }

        async fn branch_exists(&self, name: &str) -> Result<bool> {
            Ok(self.existing.contains(name))
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 14, 3, 5, 28).unwrap()
    }

    #[test]
    fn slugify_examples() {
        assert_eq!(slugify("fix: update readme"), "fix-update-readme");
        assert_eq!(slugify("  Hello,   World!! "), "hello-world");
        assert_eq!(slugify("already-dashed---name"), "already-dashed-name");
        assert_eq!(slugify("***"), "patch");
        assert_eq!(slugify(""), "patch");
    }

    #[test]
    fn slugify_caps_length_without_trailing_dash() {
        let slug = slugify(&"ab-".repeat(40));
        assert!(slug.len() <= SLUG_MAX_LEN);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn synthesized_name_has_timestamp_and_slug() {
        let name = synthesize_branch_name("fix: update readme", fixed_now());
        assert_eq!(name, "patch/20250614-030528-fix-update-readme");
        let re = Regex::new(r"^patch/\d{8}-\d{6}-fix-update-readme$").unwrap();
        assert!(re.is_match(&name));
    }

    #[tokio::test]
    async fn trunk_gets_new_branch() {
        for trunk in ["main", "master"] {
            let resolver = BranchStrategyResolver::new(FakeQuery::on(trunk), "main");
            let res = resolver
                .resolve_at("fix: update readme", false, fixed_now())
                .await;
            assert!(res.success);
            assert!(!res.plan.skip_branch_creation);
            assert_eq!(
                res.plan.target_branch_name,
                "patch/20250614-030528-fix-update-readme"
            );
            assert_eq!(res.plan.current_branch, trunk);
        }
    }

    #[tokio::test]
    async fn feature_branches_are_reused() {
        for branch in ["patch/20250101-000000-x", "feature/login", "fix/typo", "hotfix/urgent"] {
            let resolver = BranchStrategyResolver::new(FakeQuery::on(branch), "main");
            let res = resolver.resolve_at("anything", false, fixed_now()).await;
            assert!(res.success);
            assert!(res.plan.skip_branch_creation, "{branch} should be reused");
            assert_eq!(res.plan.target_branch_name, branch);
        }
    }

    #[tokio::test]
    async fn force_overrides_feature_branch() {
        let resolver = BranchStrategyResolver::new(FakeQuery::on("feature/login"), "main");
        let res = resolver.resolve_at("retry", true, fixed_now()).await;
        assert!(!res.plan.skip_branch_creation);
        assert!(res.plan.target_branch_name.starts_with("patch/20250614-030528-retry"));
    }

    #[tokio::test]
    async fn unexpected_branch_creates_new_with_warning() {
        let resolver = BranchStrategyResolver::new(FakeQuery::on("wip-stuff"), "main");
        let res = resolver.resolve_at("cleanup", false, fixed_now()).await;
        assert!(res.success);
        assert!(!res.plan.skip_branch_creation);
        assert!(res.warning.unwrap().contains("wip-stuff"));
    }

    #[tokio::test]
    async fn collision_appends_suffix() {
        let mut query = FakeQuery::on("main");
        query
            .existing
            .insert("patch/20250614-030528-cleanup".to_string());
        query
            .existing
            .insert("patch/20250614-030528-cleanup-2".to_string());
        let resolver = BranchStrategyResolver::new(query, "main");
        let res = resolver.resolve_at("cleanup", false, fixed_now()).await;
        assert_eq!(res.plan.target_branch_name, "patch/20250614-030528-cleanup-3");
    }

    #[tokio::test]
    async fn query_failure_degrades_to_skip() {
        let query = FakeQuery {
            current: Err("not a git repository".to_string()),
            existing: HashSet::new(),
        };
        let resolver = BranchStrategyResolver::new(query, "main");
        let res = resolver.resolve_at("x", false, fixed_now()).await;
        assert!(!res.success);
        assert!(res.plan.skip_branch_creation);
        assert_eq!(res.plan.target_branch_name, "main");
    }

    #[test]
    fn bare_prefix_is_not_a_feature_branch() {
        assert!(!is_feature_branch("patch/"));
        assert!(is_feature_branch("fix/x"));
        assert!(!is_feature_branch("fixes/x"));
    }
}
