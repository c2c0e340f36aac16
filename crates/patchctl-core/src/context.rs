//! Repository context shared by every component.
//!
//! Resolved once at startup and passed by reference; nothing here mutates
//! process-wide state after construction.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::GitSettings;
use crate::error::Result;
use crate::git::GitCli;

/// Environment variable that overrides the repository root.
pub const PROJECT_ROOT_ENV: &str = "PROJECT_ROOT";
/// Platform-separated module search path.
pub const MODULE_PATH_ENV: &str = "PATCHCTL_MODULE_PATH";
/// CI variables copied into failure-report environment snapshots.
pub const CI_ENV_VARS: &[&str] = &["RUN_URL", "COMMIT_SHA", "BRANCH_NAME", "GITHUB_REPOSITORY"];

/// Operating system family, derived from the compile target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Windows,
    Linux,
    MacOS,
    Unknown,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOS
        } else {
            Platform::Unknown
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Windows => "Windows",
            Platform::Linux => "Linux",
            Platform::MacOS => "MacOS",
            Platform::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Immutable description of the repository patchctl operates on.
#[derive(Debug, Clone)]
pub struct RepoContext {
    root: PathBuf,
    is_git_repo: bool,
    platform: Platform,
    trunk_branch: String,
    module_path: Vec<PathBuf>,
    env: BTreeMap<String, String>,
    git_timeout: Duration,
    remote: String,
}

impl RepoContext {
    /// Resolve the context starting from `start`.
    ///
    /// Root resolution order: `PROJECT_ROOT`, then `git rev-parse
    /// --show-toplevel`, then `start` itself. Outside a git repository the
    /// context is still built, with `is_git_repo() == false`, so callers can
    /// decide whether that is fatal.
    pub async fn discover(start: &Path, settings: &GitSettings) -> Result<Self> {
        let discovery = GitCli::new(start, settings.timeout());
        let is_git_repo = discovery.is_repo().await;

        let root = match std::env::var_os(PROJECT_ROOT_ENV) {
            Some(root) if !root.is_empty() => PathBuf::from(root),
            _ if is_git_repo => discovery.toplevel().await?,
            _ => start.to_path_buf(),
        };

        let git = GitCli::new(&root, settings.timeout());
        let trunk_branch = match &settings.trunk {
            Some(trunk) => trunk.clone(),
            None => detect_trunk(&git, is_git_repo).await,
        };

        let module_path = std::env::var_os(MODULE_PATH_ENV)
            .map(|raw| std::env::split_paths(&raw).collect())
            .unwrap_or_default();

        let env = CI_ENV_VARS
            .iter()
            .filter_map(|key| {
                std::env::var(key)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .map(|v| (key.to_string(), v))
            })
            .collect();

        let context = Self {
            root,
            is_git_repo,
            platform: Platform::current(),
            trunk_branch,
            module_path,
            env,
            git_timeout: settings.timeout(),
            remote: settings.remote.clone(),
        };
        tracing::debug!(
            root = %context.root.display(),
            is_git_repo = context.is_git_repo,
            platform = %context.platform,
            trunk = %context.trunk_branch,
            "resolved repository context"
        );
        Ok(context)
    }

    /// Build a context without probing the environment (tests, embedding).
    pub fn from_parts(root: &Path, trunk_branch: &str, is_git_repo: bool) -> Self {
        Self {
            root: root.to_path_buf(),
            is_git_repo,
            platform: Platform::current(),
            trunk_branch: trunk_branch.to_string(),
            module_path: Vec::new(),
            env: BTreeMap::new(),
            git_timeout: GitSettings::default().timeout(),
            remote: GitSettings::default().remote,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_git_repo(&self) -> bool {
        self.is_git_repo
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn trunk_branch(&self) -> &str {
        &self.trunk_branch
    }

    pub fn module_path(&self) -> &[PathBuf] {
        &self.module_path
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn git_timeout(&self) -> Duration {
        self.git_timeout
    }

    /// Whether `branch` is the trunk (or one of the conventional trunk names).
    pub fn is_trunk(&self, branch: &str) -> bool {
        branch == self.trunk_branch || branch == "main" || branch == "master"
    }

    /// A git handle rooted at the repository.
    pub fn git(&self) -> GitCli {
        GitCli::new(&self.root, self.git_timeout)
    }

    pub async fn current_branch(&self) -> Result<String> {
        self.git().current_branch().await
    }

    pub async fn head_commit(&self) -> Option<String> {
        if !self.is_git_repo {
            return None;
        }
        self.git().head_sha().await.ok()
    }

    /// Key/value snapshot attached to automated failure reports.
    pub async fn environment_snapshot(&self) -> BTreeMap<String, String> {
        let mut snapshot = self.env.clone();
        snapshot.insert("platform".to_string(), self.platform.to_string());
        snapshot.insert("root".to_string(), self.root.display().to_string());
        if self.is_git_repo {
            if let Ok(branch) = self.current_branch().await {
                snapshot.insert("branch".to_string(), branch);
            }
            if let Some(commit) = self.head_commit().await {
                snapshot.insert("commit".to_string(), commit);
            }
        }
        snapshot
    }
}

async fn detect_trunk(git: &GitCli, is_git_repo: bool) -> String {
    if is_git_repo {
        for candidate in ["main", "master"] {
            if git.branch_exists(candidate).await.unwrap_or(false) {
                return candidate.to_string();
            }
        }
    }
    "main".to_string()
}
