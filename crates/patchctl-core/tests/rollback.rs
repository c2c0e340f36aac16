//! Rollback strategies and their idempotence.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use patchctl_core::{GitCli, RollbackManager, RollbackOptions, RollbackType};

fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git should run");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn make_git_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    run_git(dir.path(), &["init", "-b", "main"]);
    run_git(dir.path(), &["config", "user.name", "test-user"]);
    run_git(dir.path(), &["config", "user.email", "test@example.com"]);
    std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
    run_git(dir.path(), &["add", "."]);
    run_git(dir.path(), &["commit", "-m", "initial"]);
    dir
}

fn commit_file(dir: &Path, name: &str, contents: &str) -> String {
    std::fs::write(dir.join(name), contents).unwrap();
    run_git(dir, &["add", name]);
    run_git(dir, &["commit", "-m", &format!("change {name}")]);
    run_git(dir, &["rev-parse", "HEAD"])
}

fn manager(repo: &Path) -> RollbackManager {
    RollbackManager::with_git(GitCli::new(repo, Duration::from_secs(30)), "main")
}

#[tokio::test]
async fn delete_branch_twice_is_a_no_op() {
    let repo = make_git_repo();
    run_git(repo.path(), &["checkout", "-b", "patch/x"]);
    commit_file(repo.path(), "b.txt", "two\n");

    let first = manager(repo.path()).rollback("patch/x", RollbackType::DeleteBranch).await;
    assert!(first.success, "{:?}", first.error);
    assert_eq!(run_git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
    assert!(run_git(repo.path(), &["branch", "--list", "patch/x"]).is_empty());

    let second = manager(repo.path()).rollback("patch/x", RollbackType::DeleteBranch).await;
    assert!(second.success);
    assert!(second.restored_state.contains("already absent"));
}

#[tokio::test]
async fn delete_returns_to_requested_branch() {
    let repo = make_git_repo();
    run_git(repo.path(), &["checkout", "-b", "feature/base"]);
    run_git(repo.path(), &["checkout", "-b", "patch/y"]);

    let options = RollbackOptions {
        checkpoint: None,
        return_to: Some("feature/base".to_string()),
    };
    let result = manager(repo.path())
        .rollback_with("patch/y", RollbackType::DeleteBranch, &options)
        .await;

    assert!(result.success);
    assert_eq!(run_git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]), "feature/base");
}

#[tokio::test]
async fn trunk_is_never_deleted() {
    let repo = make_git_repo();
    let result = manager(repo.path()).rollback("main", RollbackType::DeleteBranch).await;
    assert!(!result.success);
    assert!(result.error.is_some());
    assert_eq!(run_git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
}

#[tokio::test]
async fn reset_to_checkpoint_is_idempotent() {
    let repo = make_git_repo();
    run_git(repo.path(), &["checkout", "-b", "feature/z"]);
    let checkpoint = commit_file(repo.path(), "b.txt", "two\n");
    commit_file(repo.path(), "c.txt", "three\n");

    let options = RollbackOptions {
        checkpoint: Some(checkpoint.clone()),
        return_to: None,
    };
    let first = manager(repo.path())
        .rollback_with("feature/z", RollbackType::ResetToParent, &options)
        .await;
    assert!(first.success, "{:?}", first.error);
    assert_eq!(run_git(repo.path(), &["rev-parse", "HEAD"]), checkpoint);
    assert!(!repo.path().join("c.txt").exists());

    let second = manager(repo.path())
        .rollback_with("feature/z", RollbackType::ResetToParent, &options)
        .await;
    assert!(second.success);
    assert_eq!(run_git(repo.path(), &["rev-parse", "HEAD"]), checkpoint);
}

#[tokio::test]
async fn reset_defaults_to_merge_base_with_trunk() {
    let repo = make_git_repo();
    let base = run_git(repo.path(), &["rev-parse", "HEAD"]);
    run_git(repo.path(), &["checkout", "-b", "feature/m"]);
    commit_file(repo.path(), "b.txt", "two\n");
    run_git(repo.path(), &["checkout", "main"]);

    let result = manager(repo.path()).rollback("feature/m", RollbackType::ResetToParent).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(run_git(repo.path(), &["rev-parse", "feature/m"]), base);
    assert_eq!(run_git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
}

#[tokio::test]
async fn revert_twice_adds_one_revert_commit() {
    let repo = make_git_repo();
    run_git(repo.path(), &["checkout", "-b", "feature/r"]);
    commit_file(repo.path(), "b.txt", "two\n");
    let count_before: usize = run_git(repo.path(), &["rev-list", "--count", "HEAD"]).parse().unwrap();

    let first = manager(repo.path()).rollback("feature/r", RollbackType::RevertCommit).await;
    assert!(first.success, "{:?}", first.error);
    assert!(!repo.path().join("b.txt").exists());

    let second = manager(repo.path()).rollback("feature/r", RollbackType::RevertCommit).await;
    assert!(second.success);

    let count_after: usize = run_git(repo.path(), &["rev-list", "--count", "HEAD"]).parse().unwrap();
    assert_eq!(count_after, count_before + 1);
}

#[tokio::test]
async fn prune_keeps_newest_per_hour_and_current() {
    let repo = make_git_repo();
    for name in ["patch/one", "patch/two", "patch/three"] {
        run_git(repo.path(), &["branch", name]);
    }
    run_git(repo.path(), &["checkout", "patch/two"]);

    let dry = manager(repo.path()).prune_stale_branches("patch/", true).await.unwrap();
    assert!(dry.dry_run);
    assert_eq!(dry.kept.len() + dry.deleted.len(), 3);
    assert!(dry.kept.contains(&"patch/two".to_string()));
    assert_eq!(run_git(repo.path(), &["branch", "--list", "patch/*"]).lines().count(), 3);

    let live = manager(repo.path()).prune_stale_branches("patch/", false).await.unwrap();
    assert_eq!(live.deleted, dry.deleted);
    assert!(live.failed.is_empty());
    let remaining = run_git(repo.path(), &["branch", "--list", "patch/*"]);
    assert!(remaining.contains("patch/two"));
    assert_eq!(remaining.lines().count(), live.kept.len());
}
