//! Typed configuration loaded from `patchctl.toml`.
//!
//! Every field has a default, so a repository without a config file behaves
//! sensibly. Values are validated when the file is parsed, not at first use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consolidate::target::{default_targets, CleanupTarget};
use crate::error::{PatchError, Result};

/// File name looked up at the repository root.
pub const CONFIG_FILE_NAME: &str = "patchctl.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PatchctlConfig {
    pub git: GitSettings,
    pub patch: PatchSettings,
    pub consolidation: ConsolidationSettings,
    pub issues: IssueSettings,
}

/// Git subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GitSettings {
    /// Trunk branch override. When unset, `main` then `master` are probed.
    pub trunk: Option<String>,
    /// Remote used when publishing patch branches.
    pub remote: String,
    /// Timeout for a single git invocation.
    pub timeout_secs: u64,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            trunk: None,
            remote: "origin".to_string(),
            timeout_secs: 60,
        }
    }
}

impl GitSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Patch execution defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PatchSettings {
    /// Timeout for each test command.
    pub test_timeout_secs: u64,
    /// Timeout for the caller's operation when it runs a subprocess.
    pub operation_timeout_secs: u64,
    /// How long a timed-out or cancelled operation may keep running before
    /// rollback is abandoned.
    pub operation_grace_secs: u64,
    /// Commit pre-existing uncommitted changes together with the patch.
    pub auto_commit_uncommitted: bool,
    /// Push the patch branch after a successful commit.
    pub publish: bool,
}

impl Default for PatchSettings {
    fn default() -> Self {
        Self {
            test_timeout_secs: 600,
            operation_timeout_secs: 600,
            operation_grace_secs: 30,
            auto_commit_uncommitted: false,
            publish: false,
        }
    }
}

impl PatchSettings {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn operation_grace(&self) -> Duration {
        Duration::from_secs(self.operation_grace_secs)
    }
}

/// Artifact consolidation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsolidationSettings {
    pub targets: Vec<CleanupTarget>,
    /// Archive root, relative to the repository root.
    pub archive_root: PathBuf,
    /// Where manifests are written. Defaults to the repository root.
    pub reports_dir: Option<PathBuf>,
    /// Upper bound on concurrent target scans.
    pub workers: usize,
    /// Additional directory or file names that are never touched.
    pub extra_exclusions: Vec<String>,
}

impl Default for ConsolidationSettings {
    fn default() -> Self {
        Self {
            targets: default_targets(),
            archive_root: PathBuf::from("backups/consolidated-backups"),
            reports_dir: None,
            workers: 4,
            extra_exclusions: Vec::new(),
        }
    }
}

/// Duplicate-issue suppression settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IssueSettings {
    /// How far back an existing report counts as "recent".
    pub window_minutes: i64,
    /// Same-category reports within the window before a counter suffix is used.
    pub count_threshold: usize,
    /// Minimum similarity score for an existing report to absorb a new one.
    pub similarity_threshold: f64,
    /// Reports one record may absorb before a counter-suffixed successor is
    /// opened. 0 means unlimited.
    pub max_occurrences: u32,
    /// `owner/name` of the GitHub repository receiving reports.
    pub github_repo: Option<String>,
    /// Labels attached to every automated report.
    pub labels: Vec<String>,
}

impl Default for IssueSettings {
    fn default() -> Self {
        Self {
            window_minutes: 120,
            count_threshold: 3,
            similarity_threshold: 0.6,
            max_occurrences: 10,
            github_repo: None,
            labels: vec!["automated".to_string()],
        }
    }
}

impl IssueSettings {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_minutes)
    }
}

impl PatchctlConfig {
    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config = Self::parse(&content)
            .map_err(|e| PatchError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `patchctl.toml` from a repository root.
    pub fn load_for_repo(root: &Path) -> Result<Self> {
        Self::load(&root.join(CONFIG_FILE_NAME))
    }

    fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn validate(&self) -> Result<()> {
        if self.git.timeout_secs == 0 {
            return Err(PatchError::InvalidConfig(
                "git.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.consolidation.workers == 0 {
            return Err(PatchError::InvalidConfig(
                "consolidation.workers must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.issues.similarity_threshold) {
            return Err(PatchError::InvalidConfig(format!(
                "issues.similarity_threshold must be within 0..=1, got {}",
                self.issues.similarity_threshold
            )));
        }
        if self.issues.window_minutes <= 0 {
            return Err(PatchError::InvalidConfig(
                "issues.window_minutes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidate::target::Disposition;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PatchctlConfig::load_for_repo(dir.path()).unwrap();
        assert_eq!(config, PatchctlConfig::default());
        assert_eq!(config.git.remote, "origin");
        assert_eq!(config.issues.count_threshold, 3);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"
[git]
trunk = "develop"

[[consolidation.targets]]
path = "backups"
max_age_days = 30
pattern = "*.bak"
disposition = "delete"
"#,
        )
        .unwrap();

        let config = PatchctlConfig::load_for_repo(dir.path()).unwrap();
        assert_eq!(config.git.trunk.as_deref(), Some("develop"));
        assert_eq!(config.git.timeout_secs, 60);
        assert_eq!(config.consolidation.targets.len(), 1);
        assert_eq!(config.consolidation.targets[0].disposition, Disposition::Delete);
        assert_eq!(config.patch, PatchSettings::default());
    }

    #[test]
    fn invalid_glob_in_target_is_rejected_at_parse_time() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"
[[consolidation.targets]]
path = "backups"
max_age_days = 30
pattern = "[unclosed"
"#,
        )
        .unwrap();

        let err = PatchctlConfig::load_for_repo(dir.path()).unwrap_err();
        assert!(matches!(err, PatchError::InvalidConfig(_)));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[issues]\nsimilarity_threshold = 1.5\n",
        )
        .unwrap();
        let err = PatchctlConfig::load_for_repo(dir.path()).unwrap_err();
        assert!(err.to_string().contains("similarity_threshold"));
    }
}
