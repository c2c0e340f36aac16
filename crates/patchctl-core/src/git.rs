//! Git CLI wrapper.
//!
//! All repository mutation goes through `git` subprocesses run under the
//! configured timeout. Exit code 0 is success; anything else becomes
//! [`PatchError::Git`] carrying stdout and stderr.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, FixedOffset};

use crate::cancel::CancellationToken;
use crate::error::{PatchError, Result};
use crate::process::{run_command, CommandOutput, CommandSpec};

/// A local branch with its tip's committer date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub name: String,
    pub committed_at: DateTime<FixedOffset>,
}

/// Handle for running git in one working directory.
#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
    timeout: Duration,
    cancel: CancellationToken,
}

impl GitCli {
    pub fn new(workdir: &Path, timeout: Duration) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a cancellation token observed by every subsequent command.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Same settings, different working directory.
    pub fn at(&self, workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            timeout: self.timeout,
            cancel: self.cancel.clone(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn spec(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new("git", &self.workdir, self.timeout)
            .args(args.iter().copied())
            .env("GIT_TERMINAL_PROMPT", "0")
    }

    /// Run git and return the raw output, whatever the exit code.
    pub async fn output(&self, args: &[&str]) -> Result<CommandOutput> {
        run_command(&self.spec(args), &self.cancel).await
    }

    /// Run git and return trimmed stdout; non-zero exit is an error.
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.success {
            return Err(PatchError::Git {
                command: args.join(" "),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Check whether the working directory is inside a git work tree.
    pub async fn is_repo(&self) -> bool {
        self.output(&["rev-parse", "--is-inside-work-tree"])
            .await
            .map(|o| o.success && o.stdout.trim() == "true")
            .unwrap_or(false)
    }

    pub async fn toplevel(&self) -> Result<PathBuf> {
        self.run(&["rev-parse", "--show-toplevel"])
            .await
            .map(PathBuf::from)
    }

    /// Name of the checked-out branch. Works on unborn branches too.
    pub async fn current_branch(&self) -> Result<String> {
        let name = self.run(&["symbolic-ref", "--short", "-q", "HEAD"]).await?;
        if name.is_empty() {
            return Err(PatchError::Git {
                command: "symbolic-ref --short -q HEAD".to_string(),
                exit_code: Some(0),
                stdout: String::new(),
                stderr: "HEAD is detached".to_string(),
            });
        }
        Ok(name)
    }

    /// Capture the HEAD commit SHA.
    pub async fn head_sha(&self) -> Result<String> {
        let sha = self.run(&["rev-parse", "HEAD"]).await?;
        if sha.is_empty() {
            return Err(PatchError::Git {
                command: "rev-parse HEAD".to_string(),
                exit_code: Some(0),
                stdout: String::new(),
                stderr: "empty output".to_string(),
            });
        }
        Ok(sha)
    }

    pub async fn rev_parse(&self, rev: &str) -> Result<String> {
        self.run(&["rev-parse", "--verify", "--quiet", rev]).await
    }

    pub async fn branch_exists(&self, name: &str) -> Result<bool> {
        let refname = format!("refs/heads/{name}");
        let output = self
            .output(&["rev-parse", "--verify", "--quiet", &refname])
            .await?;
        Ok(output.success)
    }

    /// Local branches under `refs/heads/<prefix>`, newest first.
    pub async fn list_branches(&self, prefix: &str) -> Result<Vec<BranchInfo>> {
        let pattern = format!("refs/heads/{prefix}");
        let raw = self
            .run(&[
                "for-each-ref",
                "--sort=-committerdate",
                "--format=%(committerdate:iso-strict)%09%(refname:short)",
                &pattern,
            ])
            .await?;

        let mut branches = Vec::new();
        for line in raw.lines() {
            let Some((date, name)) = line.split_once('\t') else {
                continue;
            };
            match DateTime::parse_from_rfc3339(date.trim()) {
                Ok(committed_at) => branches.push(BranchInfo {
                    name: name.trim().to_string(),
                    committed_at,
                }),
                Err(e) => tracing::warn!(branch = %name, error = %e, "unparsable committer date"),
            }
        }
        Ok(branches)
    }

    /// Create `name` at `start_point` and check it out.
    pub async fn create_branch(&self, name: &str, start_point: &str) -> Result<()> {
        self.run(&["checkout", "-b", name, start_point]).await.map(|_| ())
    }

    pub async fn checkout(&self, name: &str) -> Result<()> {
        self.run(&["checkout", name]).await.map(|_| ())
    }

    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        self.run(&["branch", "-D", name]).await.map(|_| ())
    }

    /// Whether the working tree or index has any change (untracked included).
    pub async fn is_dirty(&self) -> Result<bool> {
        let status = self.run(&["status", "--porcelain"]).await?;
        Ok(!status.is_empty())
    }

    /// Stage everything, including deletions and untracked files.
    pub async fn add_all(&self) -> Result<()> {
        self.run(&["add", "-A"]).await.map(|_| ())
    }

    /// Stage exactly `paths` (additions, modifications and deletions).
    pub async fn add_paths(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let rendered: Vec<String> = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        let mut args = vec!["add", "-A", "--"];
        args.extend(rendered.iter().map(String::as_str));
        self.run(&args).await.map(|_| ())
    }

    /// Whether anything is staged for commit.
    pub async fn has_staged_changes(&self) -> Result<bool> {
        let output = self.output(&["diff", "--cached", "--quiet"]).await?;
        match output.exit_code {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(PatchError::Git {
                command: "diff --cached --quiet".to_string(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    /// Commit the index and return the new HEAD SHA.
    pub async fn commit(&self, message: &str) -> Result<String> {
        self.run(&["commit", "-m", message]).await?;
        self.head_sha().await
    }

    pub async fn reset_hard(&self, target: &str) -> Result<()> {
        self.run(&["reset", "--hard", target]).await.map(|_| ())
    }

    /// Create an inverse commit for `commit` and return the new HEAD SHA.
    pub async fn revert(&self, commit: &str) -> Result<String> {
        self.run(&["revert", "--no-edit", commit]).await?;
        self.head_sha().await
    }

    pub async fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.run(&["push", "-u", remote, branch]).await.map(|_| ())
    }

    pub async fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        self.run(&["merge-base", a, b]).await
    }

    /// Full commit messages in `range`, newest first.
    pub async fn log_messages(&self, range: &str) -> Result<Vec<String>> {
        let raw = self.run(&["log", "--format=%B%x00", range]).await?;
        Ok(raw
            .split('\0')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect())
    }

    /// Tracked files plus untracked files that are not ignored.
    pub async fn list_files(&self) -> Result<Vec<PathBuf>> {
        let raw = self
            .run(&["ls-files", "-z", "--cached", "--others", "--exclude-standard"])
            .await?;
        let mut files = split_nul(&raw);
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Paths whose working-tree content differs from HEAD, plus untracked
    /// files. On an unborn branch every listed file counts as changed.
    pub async fn changed_paths(&self) -> Result<Vec<PathBuf>> {
        if self.head_sha().await.is_err() {
            return self.list_files().await;
        }
        let mut paths = split_nul(&self.run(&["diff", "--name-only", "-z", "HEAD"]).await?);
        paths.extend(split_nul(
            &self
                .run(&["ls-files", "-z", "--others", "--exclude-standard"])
                .await?,
        ));
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Whether `path` exists in `rev`'s tree.
    pub async fn exists_in(&self, rev: &str, path: &Path) -> Result<bool> {
        let spec = format!("{rev}:{}", path.to_string_lossy());
        let output = self.output(&["cat-file", "-e", &spec]).await?;
        Ok(output.success)
    }

    /// Restore `paths` in the index and working tree from `rev`.
    pub async fn restore_paths(&self, rev: &str, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let rendered: Vec<String> = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        let mut args = vec!["checkout", rev, "--"];
        args.extend(rendered.iter().map(String::as_str));
        self.run(&args).await.map(|_| ())
    }

    /// Unstage `paths` without touching the working tree.
    pub async fn unstage_paths(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let rendered: Vec<String> = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        let mut args = vec!["reset", "-q", "--"];
        args.extend(rendered.iter().map(String::as_str));
        self.run(&args).await.map(|_| ())
    }
}

fn split_nul(raw: &str) -> Vec<PathBuf> {
    raw.split('\0')
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run_git(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init", "-b", "main"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        run_git(dir.path(), &["commit", "--allow-empty", "-m", "initial"]);
        dir
    }

    fn git(dir: &Path) -> GitCli {
        GitCli::new(dir, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn head_sha_returns_40_hex_chars() {
        let repo = make_git_repo();
        let sha = git(repo.path()).head_sha().await.unwrap();
        assert_eq!(sha.len(), 40, "SHA should be 40 hex chars, got: {sha}");
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn is_repo_distinguishes_repo_and_plain_dir() {
        let repo = make_git_repo();
        assert!(git(repo.path()).is_repo().await);
        let plain = tempfile::tempdir().unwrap();
        assert!(!git(plain.path()).is_repo().await);
    }

    #[tokio::test]
    async fn current_branch_fails_outside_repo() {
        let plain = tempfile::tempdir().unwrap();
        let err = git(plain.path()).current_branch().await.unwrap_err();
        assert!(matches!(err, PatchError::Git { .. }));
    }

    #[tokio::test]
    async fn branch_lifecycle() {
        let repo = make_git_repo();
        let g = git(repo.path());
        assert_eq!(g.current_branch().await.unwrap(), "main");
        assert!(!g.branch_exists("patch/x").await.unwrap());

        g.create_branch("patch/x", "main").await.unwrap();
        assert_eq!(g.current_branch().await.unwrap(), "patch/x");
        assert!(g.branch_exists("patch/x").await.unwrap());

        let listed = g.list_branches("patch/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "patch/x");

        g.checkout("main").await.unwrap();
        g.delete_branch("patch/x").await.unwrap();
        assert!(!g.branch_exists("patch/x").await.unwrap());
    }

    #[tokio::test]
    async fn commit_and_list_files() {
        let repo = make_git_repo();
        let g = git(repo.path());
        std::fs::write(repo.path().join("a.txt"), "a").unwrap();
        assert!(g.is_dirty().await.unwrap());
        assert_eq!(g.list_files().await.unwrap(), vec![PathBuf::from("a.txt")]);

        g.add_all().await.unwrap();
        assert!(g.has_staged_changes().await.unwrap());
        let sha = g.commit("add a").await.unwrap();
        assert_eq!(sha, g.head_sha().await.unwrap());
        assert!(!g.is_dirty().await.unwrap());
        assert!(g.exists_in("HEAD", Path::new("a.txt")).await.unwrap());
        assert!(!g.exists_in("HEAD~1", Path::new("a.txt")).await.unwrap());
    }
}
