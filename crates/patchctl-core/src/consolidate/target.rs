//! Cleanup targets: which stray artifacts to sweep and what to do with them.

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::error::{PatchError, Result};

/// What happens to a matched file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Move under the archive root, preserving the relative path.
    #[default]
    Archive,
    /// Remove permanently. Needs `force` or an explicit confirmation.
    Delete,
}

impl Disposition {
    pub fn is_destructive(&self) -> bool {
        matches!(self, Disposition::Delete)
    }
}

/// One sweep rule. Validated on construction: the path must be non-empty
/// and relative, and the pattern must be a valid glob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCleanupTarget", into = "RawCleanupTarget")]
pub struct CleanupTarget {
    path: PathBuf,
    max_age_days: u32,
    pattern: Pattern,
    pub(crate) disposition: Disposition,
    category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCleanupTarget {
    path: PathBuf,
    max_age_days: u32,
    pattern: String,
    #[serde(default)]
    disposition: Disposition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    category: Option<String>,
}

impl TryFrom<RawCleanupTarget> for CleanupTarget {
    type Error = PatchError;

    fn try_from(raw: RawCleanupTarget) -> Result<Self> {
        let target = CleanupTarget::new(raw.path, raw.max_age_days, &raw.pattern)?
            .with_disposition(raw.disposition);
        Ok(match raw.category {
            Some(category) => target.with_category(category),
            None => target,
        })
    }
}

impl From<CleanupTarget> for RawCleanupTarget {
    fn from(target: CleanupTarget) -> Self {
        Self {
            path: target.path,
            max_age_days: target.max_age_days,
            pattern: target.pattern.as_str().to_string(),
            disposition: target.disposition,
            category: target.category,
        }
    }
}

impl CleanupTarget {
    pub fn new(path: impl Into<PathBuf>, max_age_days: u32, pattern: &str) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(PatchError::InvalidConfig("cleanup target path must not be empty".to_string()));
        }
        if path.is_absolute() || path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(PatchError::InvalidConfig(format!(
                "cleanup target path must stay inside the repository: {}",
                path.display()
            )));
        }
        if pattern.trim().is_empty() {
            return Err(PatchError::InvalidConfig("cleanup target pattern must not be empty".to_string()));
        }
        let pattern = Pattern::new(pattern)
            .map_err(|e| PatchError::InvalidConfig(format!("invalid glob '{pattern}': {e}")))?;
        Ok(Self {
            path,
            max_age_days,
            pattern,
            disposition: Disposition::Archive,
            category: None,
        })
    }

    pub fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into()).filter(|c: &String| !c.trim().is_empty());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_age_days(&self) -> u32 {
        self.max_age_days
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    /// Whether a file matches. Patterns containing `/` are matched against the
    /// path relative to the target directory; others against the file name.
    pub fn matches(&self, relative: &Path) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        if self.pattern.as_str().contains('/') {
            self.pattern.matches_path_with(relative, options)
        } else {
            relative
                .file_name()
                .map(|name| self.pattern.matches_with(&name.to_string_lossy(), options))
                .unwrap_or(false)
        }
    }
}

/// Targets used when the configuration names none: editor and merge
/// leftovers, hand-made backups, and temp files.
pub fn default_targets() -> Vec<CleanupTarget> {
    let specs: [(&str, u32, &str, Disposition, &str); 5] = [
        (".", 30, "*.bak", Disposition::Archive, "backups"),
        (".", 30, "*.backup", Disposition::Archive, "backups"),
        (".", 14, "*.orig", Disposition::Archive, "merge-leftovers"),
        (".", 14, "*~", Disposition::Archive, "editor-backups"),
        (".", 7, "*.tmp", Disposition::Delete, "temp"),
    ];
    specs
        .iter()
        .filter_map(|(path, days, pattern, disposition, category)| {
            CleanupTarget::new(*path, *days, pattern)
                .ok()
                .map(|t| t.with_disposition(*disposition).with_category(*category))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_targets() {
        assert!(CleanupTarget::new("", 30, "*.bak").is_err());
        assert!(CleanupTarget::new("../outside", 30, "*.bak").is_err());
        assert!(CleanupTarget::new("backups", 30, "").is_err());
        assert!(CleanupTarget::new("backups", 30, "[unclosed").is_err());
    }

    #[test]
    fn file_name_and_path_patterns() {
        let by_name = CleanupTarget::new("backups", 30, "*.bak").unwrap();
        assert!(by_name.matches(Path::new("deep/dir/a.bak")));
        assert!(!by_name.matches(Path::new("a.bak.txt")));

        let by_path = CleanupTarget::new(".", 30, "scripts/fix-*.ps1").unwrap();
        assert!(by_path.matches(Path::new("scripts/fix-net.ps1")));
        assert!(!by_path.matches(Path::new("other/scripts/fix-net.ps1")));
    }

    #[test]
    fn toml_round_trip_keeps_disposition_and_category() {
        #[derive(Deserialize, Serialize)]
        struct Wrapper {
            targets: Vec<CleanupTarget>,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
[[targets]]
path = "tmp"
max_age_days = 3
pattern = "*.tmp"
disposition = "delete"
category = "temp"
"#,
        )
        .unwrap();
        let target = &parsed.targets[0];
        assert_eq!(target.disposition(), Disposition::Delete);
        assert_eq!(target.category(), Some("temp"));
        assert_eq!(target.pattern(), "*.tmp");

        let rendered = toml::to_string(&parsed).unwrap();
        assert!(rendered.contains("disposition = \"delete\""));
    }

    #[test]
    fn defaults_are_valid() {
        let defaults = default_targets();
        assert_eq!(defaults.len(), 5);
        assert!(defaults.iter().any(|t| t.disposition().is_destructive()));
    }
}
