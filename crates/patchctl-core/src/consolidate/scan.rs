//! Read-only discovery of artifact files.
//!
//! Shared by the consolidator (age-filtered candidates per target) and the
//! statistics analyzer (inventory of everything matching).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use walkdir::{DirEntry, WalkDir};

use super::target::CleanupTarget;
use crate::cancel::CancellationToken;

/// Directory names never descended into.
pub const STATIC_EXCLUSIONS: &[&str] = &[".git", ".svn", ".hg", "node_modules", "target", "modules"];

/// File-name prefix of consolidation manifests.
pub const MANIFEST_PREFIX: &str = "consolidation-manifest-";

const ACTIVE_LOG_HOURS: i64 = 24;

/// Exclusion rules. Exclusions always win over include patterns.
#[derive(Debug, Clone)]
pub struct Exclusions {
    names: BTreeSet<String>,
    archive_root: PathBuf,
    now: DateTime<Utc>,
}

impl Exclusions {
    /// `archive_root` is relative to `root`; `extra` adds directory or file
    /// names to the static list.
    pub fn new(root: &Path, archive_root: &Path, extra: &[String], now: DateTime<Utc>) -> Self {
        let mut names: BTreeSet<String> = STATIC_EXCLUSIONS.iter().map(|s| s.to_string()).collect();
        names.extend(extra.iter().filter(|s| !s.trim().is_empty()).cloned());
        Self {
            names,
            archive_root: root.join(archive_root),
            now,
        }
    }

    fn excludes_dir(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        self.names.contains(name.as_ref()) || entry.path().starts_with(&self.archive_root)
    }

    /// Whether a file is off limits: excluded by name, a manifest, or a log
    /// still being written to.
    pub fn excludes_file(&self, path: &Path, modified: DateTime<Utc>) -> bool {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return true;
        };
        if self.names.contains(name.as_ref()) {
            return true;
        }
        if name.starts_with(MANIFEST_PREFIX) && name.ends_with(".json") {
            return true;
        }
        let is_log = path.extension().map(|e| e == "log").unwrap_or(false);
        is_log && self.now - modified < Duration::hours(ACTIVE_LOG_HOURS)
    }
}

/// A file found by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundFile {
    /// Relative to the repository root.
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Output of one walk.
#[derive(Debug, Clone, Default)]
pub struct WalkOutcome {
    pub files: Vec<FoundFile>,
    /// Unreadable entries. Informational; nothing was attempted on them.
    pub errors: Vec<String>,
    pub cancelled: bool,
}

/// Walk `root/base`, returning files accepted by `accept` (called with the
/// path relative to `base`) and not excluded.
pub fn walk_matching<F>(
    root: &Path,
    base: &Path,
    exclusions: &Exclusions,
    cancel: &CancellationToken,
    accept: F,
) -> WalkOutcome
where
    F: Fn(&Path) -> bool,
{
    let start = if base.as_os_str().is_empty() || base == Path::new(".") {
        root.to_path_buf()
    } else {
        root.join(base)
    };
    let mut outcome = WalkOutcome::default();
    if !start.exists() {
        return outcome;
    }

    let walker = WalkDir::new(&start)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_type().is_dir() || !exclusions.excludes_dir(e));

    for entry in walker {
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            break;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                outcome.errors.push(e.to_string());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Ok(relative_to_base) = path.strip_prefix(&start) else {
            continue;
        };
        if !accept(relative_to_base) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                outcome.errors.push(format!("{}: {e}", path.display()));
                continue;
            }
        };
        let modified: DateTime<Utc> = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH).into();
        if exclusions.excludes_file(path, modified) {
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
        outcome.files.push(FoundFile {
            path: relative,
            size_bytes: metadata.len(),
            modified,
        });
    }
    outcome.files.sort_by(|a, b| a.path.cmp(&b.path));
    outcome
}

/// Files under `target` matching its pattern and older than its age limit.
pub fn scan_target(
    root: &Path,
    target: &CleanupTarget,
    exclusions: &Exclusions,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> WalkOutcome {
    let cutoff = now - Duration::days(i64::from(target.max_age_days()));
    let mut outcome = walk_matching(root, target.path(), exclusions, cancel, |rel| target.matches(rel));
    outcome.files.retain(|f| f.modified < cutoff);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn set_age(path: &Path, days: u64) {
        let when = SystemTime::now() - std::time::Duration::from_secs(days * 86_400);
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    fn exclusions(root: &Path) -> Exclusions {
        Exclusions::new(root, Path::new("backups/consolidated-backups"), &[], Utc::now())
    }

    #[test]
    fn age_filter_and_pattern() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("backups")).unwrap();
        fs::write(dir.path().join("backups/a.bak"), "old").unwrap();
        fs::write(dir.path().join("backups/b.bak"), "new").unwrap();
        fs::write(dir.path().join("backups/c.txt"), "other").unwrap();
        set_age(&dir.path().join("backups/a.bak"), 45);
        set_age(&dir.path().join("backups/b.bak"), 5);
        set_age(&dir.path().join("backups/c.txt"), 45);

        let target = CleanupTarget::new("backups", 30, "*.bak").unwrap();
        let outcome = scan_target(dir.path(), &target, &exclusions(dir.path()), Utc::now(), &CancellationToken::new());
        let paths: Vec<_> = outcome.files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("backups/a.bak")]);
        assert_eq!(outcome.files[0].size_bytes, 3);
    }

    #[test]
    fn exclusions_win_over_patterns() {
        let dir = tempfile::tempdir().unwrap();
        for sub in [".git", "node_modules/pkg", "backups/consolidated-backups/x", "src"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
            fs::write(dir.path().join(sub).join("old.bak"), "x").unwrap();
            set_age(&dir.path().join(sub).join("old.bak"), 90);
        }
        let target = CleanupTarget::new(".", 30, "*.bak").unwrap();
        let outcome = scan_target(dir.path(), &target, &exclusions(dir.path()), Utc::now(), &CancellationToken::new());
        let paths: Vec<_> = outcome.files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("src/old.bak")]);
    }

    #[test]
    fn active_logs_and_manifests_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("current.log"), "x").unwrap();
        fs::write(dir.path().join("stale.log"), "x").unwrap();
        set_age(&dir.path().join("stale.log"), 3);
        fs::write(dir.path().join("consolidation-manifest-20260101-000000.json"), "{}").unwrap();

        let outcome = walk_matching(dir.path(), Path::new("."), &exclusions(dir.path()), &CancellationToken::new(), |_| true);
        let names: Vec<_> = outcome
            .files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["stale.log"]);
    }

    #[test]
    fn missing_base_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = CleanupTarget::new("nope", 1, "*").unwrap();
        let outcome = scan_target(dir.path(), &target, &exclusions(dir.path()), Utc::now(), &CancellationToken::new());
        assert!(outcome.files.is_empty());
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn cancelled_walk_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bak"), "x").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = walk_matching(dir.path(), Path::new("."), &exclusions(dir.path()), &cancel, |_| true);
        assert!(outcome.cancelled);
        assert!(outcome.files.is_empty());
    }
}
