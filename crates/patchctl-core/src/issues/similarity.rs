//! Similarity scoring between issue reports.
//!
//! Score, in `0.0..=1.0`:
//! - `0.0` when categories differ;
//! - `1.0` when similarity keys are equal (same category, same normalized
//!   title tokens);
//! - otherwise `0.7 * J(title) + 0.3 * J(body)`, with `J` the Jaccard index
//!   over normalized tokens.
//!
//! Tokens are lower-cased alphanumeric runs of at least two characters.
//! Purely numeric or hex-looking tokens (line numbers, SHAs, run ids) and
//! `(#n)` counter suffixes are dropped, so two reports of the same failure
//! from different runs compare equal.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use super::record::{IssueCategory, IssueRecord};

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.6;

const TITLE_WEIGHT: f64 = 0.7;
const BODY_WEIGHT: f64 = 0.3;
const KEY_HEX_CHARS: usize = 16;

fn counter_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*\(#(\d+)\)\s*$").expect("valid counter regex"))
}

fn token_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z0-9]+").expect("valid token regex"))
}

/// Strip a trailing `(#n)` counter suffix.
pub fn strip_counter_suffix(title: &str) -> &str {
    match counter_suffix().find(title) {
        Some(m) => &title[..m.start()],
        None => title,
    }
}

/// The `n` of a trailing `(#n)` suffix.
pub fn counter_suffix_value(title: &str) -> Option<u32> {
    counter_suffix()
        .captures(title)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn is_noise(token: &str) -> bool {
    if token.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    token.len() >= 7 && token.chars().all(|c| c.is_ascii_hexdigit())
}

/// Normalized token set of `text`.
pub fn tokens(text: &str) -> BTreeSet<String> {
    let lower = strip_counter_suffix(text).to_lowercase();
    token_chars()
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|t| t.len() >= 2 && !is_noise(t))
        .map(str::to_string)
        .collect()
}

/// Jaccard index of two sets; two empty sets are identical.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Stable key for "the same failure": category plus sorted title tokens.
pub fn similarity_key(category: IssueCategory, title: &str) -> String {
    let joined = tokens(title).into_iter().collect::<Vec<_>>().join(" ");
    let digest = Sha256::digest(format!("{}\n{joined}", category.as_str()).as_bytes());
    hex::encode(digest)[..KEY_HEX_CHARS].to_string()
}

pub fn similarity_score(a: &IssueRecord, b: &IssueRecord) -> f64 {
    if a.category != b.category {
        return 0.0;
    }
    if a.similarity_key == b.similarity_key {
        return 1.0;
    }
    let title = jaccard(&tokens(&a.title), &tokens(&b.title));
    let body = jaccard(&tokens(&a.body), &tokens(&b.body));
    TITLE_WEIGHT * title + BODY_WEIGHT * body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_drop_noise() {
        let t = tokens("Build 1234 failed at deadbeefcafe (#3)");
        let expected: BTreeSet<String> = ["build", "failed", "at"].iter().map(|s| s.to_string()).collect();
        assert_eq!(t, expected);
    }

    #[test]
    fn counter_suffix_value_parses_trailing_number() {
        assert_eq!(counter_suffix_value("Nightly tests failed (#12)"), Some(12));
        assert_eq!(counter_suffix_value("Nightly tests failed"), None);
        assert_eq!(counter_suffix_value("(#2) is not a suffix here"), None);
    }

    #[test]
    fn counter_suffix_is_ignored_by_key() {
        let a = similarity_key(IssueCategory::Other, "Nightly tests failed");
        let b = similarity_key(IssueCategory::Other, "Nightly tests failed (#4)");
        assert_eq!(a, b);
        assert_eq!(a.len(), KEY_HEX_CHARS);
        assert_ne!(a, similarity_key(IssueCategory::GitFailure, "Nightly tests failed"));
    }

    #[test]
    fn category_mismatch_scores_zero() {
        let a = IssueRecord::with_category("same title", "", IssueCategory::SyntaxError);
        let b = IssueRecord::with_category("same title", "", IssueCategory::GitFailure);
        assert_eq!(similarity_score(&a, &b), 0.0);
    }

    #[test]
    fn identical_titles_score_one() {
        let a = IssueRecord::with_category("Pester run failed on run 88", "x", IssueCategory::Other);
        let b = IssueRecord::with_category("Pester run failed on run 91", "y", IssueCategory::Other);
        assert_eq!(similarity_score(&a, &b), 1.0);
    }

    #[test]
    fn partial_overlap_is_weighted() {
        let a = IssueRecord::with_category("lint failed in scripts", "ruff E501", IssueCategory::Other);
        let b = IssueRecord::with_category("lint failed in docs", "ruff E501", IssueCategory::Other);
        // title: {lint, failed, in} shared of {lint, failed, in, scripts, docs} = 0.6
        // body: identical = 1.0
        let score = similarity_score(&a, &b);
        assert!((score - (0.7 * 0.6 + 0.3)).abs() < 1e-9, "score = {score}");
    }

    #[test]
    fn jaccard_of_empty_sets() {
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 1.0);
        let one: BTreeSet<String> = ["x1".to_string()].into_iter().collect();
        assert_eq!(jaccard(&one, &BTreeSet::new()), 0.0);
    }
}
