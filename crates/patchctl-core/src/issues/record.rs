//! Issue records and the failure category taxonomy.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::similarity::similarity_key;

/// Failure category. Category equality is a precondition for two reports
/// being duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    ModuleImport,
    SyntaxError,
    EnvironmentFailure,
    GitFailure,
    Other,
}

const MODULE_IMPORT_MARKERS: &[&str] = &[
    "modulenotfounderror",
    "importerror",
    "no module named",
    "import-module",
    "cannot find module",
    "could not load module",
    "unresolved import",
    "can't find crate",
];

const SYNTAX_MARKERS: &[&str] = &[
    "syntaxerror",
    "syntax error",
    "indentationerror",
    "parsererror",
    "parse error",
    "unexpected token",
    "missing closing",
    "expected one of",
];

const GIT_MARKERS: &[&str] = &[
    "fatal: ",
    "merge conflict",
    "conflict (content)",
    "non-fast-forward",
    "detached head",
    "did not match any file(s) known to git",
    "git push",
    "git checkout",
];

const ENVIRONMENT_MARKERS: &[&str] = &[
    "command not found",
    "is not recognized as",
    "permission denied",
    "no such file or directory",
    "environment variable",
    "timed out",
    "connection refused",
    "out of memory",
    "no space left on device",
];

impl IssueCategory {
    pub const ALL: [IssueCategory; 5] = [
        IssueCategory::ModuleImport,
        IssueCategory::SyntaxError,
        IssueCategory::EnvironmentFailure,
        IssueCategory::GitFailure,
        IssueCategory::Other,
    ];

    /// Classify failure text (title, log excerpt, or both) by keyword.
    /// The most specific category wins: import and syntax errors are checked
    /// before git and environment failures.
    pub fn classify(text: &str) -> Self {
        let lower = text.to_lowercase();
        let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));
        if has(MODULE_IMPORT_MARKERS) {
            IssueCategory::ModuleImport
        } else if has(SYNTAX_MARKERS) {
            IssueCategory::SyntaxError
        } else if has(GIT_MARKERS) {
            IssueCategory::GitFailure
        } else if has(ENVIRONMENT_MARKERS) {
            IssueCategory::EnvironmentFailure
        } else {
            IssueCategory::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCategory::ModuleImport => "module-import",
            IssueCategory::SyntaxError => "syntax-error",
            IssueCategory::EnvironmentFailure => "environment-failure",
            IssueCategory::GitFailure => "git-failure",
            IssueCategory::Other => "other",
        }
    }

    /// Tracker label carrying the category.
    pub fn label(&self) -> String {
        format!("category:{}", self.as_str())
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let name = label.strip_prefix("category:")?;
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IssueCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown issue category: {s}"))
    }
}

/// A tracked failure report, or a candidate for one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    /// Tracker reference; `None` until the record has been created.
    pub id: Option<String>,
    pub title: String,
    pub body: String,
    pub category: IssueCategory,
    pub created_at: DateTime<Utc>,
    pub similarity_key: String,
    /// How many failures this record stands for. Never decreases.
    pub occurrence_counter: u32,
    pub environment_snapshot: BTreeMap<String, String>,
    pub labels: Vec<String>,
}

impl IssueRecord {
    /// A new, not yet tracked report. The category is inferred from the title
    /// and body.
    pub fn candidate(title: impl Into<String>, body: impl Into<String>) -> Self {
        let title = title.into();
        let body = body.into();
        let category = IssueCategory::classify(&format!("{title}\n{body}"));
        Self::with_category(title, body, category)
    }

    pub fn with_category(title: impl Into<String>, body: impl Into<String>, category: IssueCategory) -> Self {
        let title = title.into();
        Self {
            id: None,
            similarity_key: similarity_key(category, &title),
            title,
            body: body.into(),
            category,
            created_at: Utc::now(),
            occurrence_counter: 1,
            environment_snapshot: BTreeMap::new(),
            labels: Vec::new(),
        }
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn environment(mut self, snapshot: BTreeMap<String, String>) -> Self {
        self.environment_snapshot = snapshot;
        self
    }

    pub fn labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels.extend(labels.into_iter().map(Into::into));
        self
    }

    /// Body with the environment snapshot appended as a table.
    pub fn rendered_body(&self) -> String {
        if self.environment_snapshot.is_empty() {
            return self.body.clone();
        }
        let mut body = self.body.trim_end().to_string();
        body.push_str("\n\n### Environment\n\n| Key | Value |\n|---|---|\n");
        for (key, value) in &self.environment_snapshot {
            body.push_str(&format!("| {key} | {} |\n", value.replace('|', "\\|")));
        }
        body
    }
}
