//! Artifact consolidation: sweep stray backup, merge-leftover and temp files
//! into a timestamped archive (or delete them), always leaving a manifest.
//!
//! Two phases. Scanning is read-only and runs one blocking task per target,
//! bounded by `workers`. Actions run sequentially so byte accounting in the
//! manifest stays consistent. Individual failures are recorded, never fatal.

pub mod manifest;
pub mod scan;
pub mod target;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use uuid::Uuid;

pub use manifest::{ConsolidationManifest, FailedEntry, ManifestEntry, SkippedEntry};
pub use scan::{Exclusions, FoundFile, STATIC_EXCLUSIONS};
pub use target::{default_targets, CleanupTarget, Disposition};

use crate::cancel::CancellationToken;
use crate::config::ConsolidationSettings;
use crate::context::RepoContext;
use crate::error::{PatchError, Result};
use crate::metrics::METRICS;
use crate::obs;

/// Asks the caller before destructive actions.
pub trait Confirmation: Send + Sync {
    /// Return `true` to allow deleting `files` (relative paths) for `target`.
    fn confirm(&self, target: &CleanupTarget, files: &[PathBuf]) -> bool;
}

/// Confirmation that always answers the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedConfirmation(pub bool);

impl Confirmation for FixedConfirmation {
    fn confirm(&self, _target: &CleanupTarget, _files: &[PathBuf]) -> bool {
        self.0
    }
}

/// Per-run switches.
#[derive(Clone, Default)]
pub struct ConsolidateOptions {
    pub dry_run: bool,
    /// Perform deletions without asking.
    pub force: bool,
    pub confirmation: Option<Arc<dyn Confirmation>>,
    pub cancel: CancellationToken,
}

impl fmt::Debug for ConsolidateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsolidateOptions")
            .field("dry_run", &self.dry_run)
            .field("force", &self.force)
            .field("confirmation", &self.confirmation.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Candidates found for one target.
#[derive(Debug, Clone)]
pub struct TargetScan {
    pub target: CleanupTarget,
    pub files: Vec<FoundFile>,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

pub struct ArtifactConsolidator {
    context: RepoContext,
    settings: ConsolidationSettings,
}

impl ArtifactConsolidator {
    pub fn new(context: RepoContext, settings: ConsolidationSettings) -> Self {
        Self { context, settings }
    }

    /// Targets from configuration.
    pub fn configured_targets(&self) -> &[CleanupTarget] {
        &self.settings.targets
    }

    fn exclusions(&self, now: DateTime<Utc>) -> Exclusions {
        Exclusions::new(
            self.context.root(),
            &self.settings.archive_root,
            &self.settings.extra_exclusions,
            now,
        )
    }

    /// Read-only scan phase: candidates per target, in target order. A file
    /// matched by several targets is attributed to the first.
    pub async fn scan(&self, targets: &[CleanupTarget], now: DateTime<Utc>, cancel: &CancellationToken) -> Vec<TargetScan> {
        let permits = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let exclusions = Arc::new(self.exclusions(now));
        let root = Arc::new(self.context.root().to_path_buf());

        let tasks = targets.iter().cloned().map(|target| {
            let permits = Arc::clone(&permits);
            let exclusions = Arc::clone(&exclusions);
            let root = Arc::clone(&root);
            let cancel = cancel.clone();
            async move {
                let _permit = permits.acquire_owned().await;
                let scanned = target.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    scan::scan_target(&root, &scanned, &exclusions, now, &cancel)
                })
                .await;
                match joined {
                    Ok(outcome) => TargetScan {
                        target,
                        files: outcome.files,
                        errors: outcome.errors,
                        cancelled: outcome.cancelled,
                    },
                    Err(e) => TargetScan {
                        target,
                        files: Vec::new(),
                        errors: vec![format!("scan task failed: {e}")],
                        cancelled: false,
                    },
                }
            }
        });
        let mut scans = futures::future::join_all(tasks).await;

        let mut seen = BTreeSet::new();
        for scan in &mut scans {
            scan.files.retain(|f| seen.insert(f.path.clone()));
        }
        scans
    }

    /// Run a sweep over `targets`.
    ///
    /// Returns `Err` only when the repository root does not exist; every
    /// per-file problem is recorded in the manifest.
    pub async fn consolidate(&self, targets: &[CleanupTarget], options: &ConsolidateOptions) -> Result<ConsolidationManifest> {
        let root = self.context.root().to_path_buf();
        if !root.is_dir() {
            return Err(PatchError::fs(&root, "repository root does not exist"));
        }

        let now = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let destination = self
            .settings
            .archive_root
            .join(now.format("%Y%m%d-%H%M%S").to_string());
        let mut manifest = ConsolidationManifest::new(run_id, now, destination, options.dry_run);
        manifest.source_commit = self.context.head_commit().await;

        tracing::info!(
            run_id = %manifest.run_id,
            targets = targets.len(),
            dry_run = options.dry_run,
            force = options.force,
            "starting consolidation"
        );

        let scans = self.scan(targets, now, &options.cancel).await;
        let mut touched_dirs: BTreeSet<(PathBuf, PathBuf)> = BTreeSet::new();

        for scan in scans {
            for error in &scan.errors {
                manifest.warn(format!("scan of '{}': {error}", scan.target.path().display()));
            }
            if scan.cancelled || options.cancel.is_cancelled() {
                manifest.cancelled = true;
                break;
            }
            if scan.files.is_empty() {
                tracing::debug!(path = %scan.target.path().display(), pattern = scan.target.pattern(), "no matches");
                continue;
            }

            let gate = self.delete_gate(&scan, options, &mut manifest);
            for file in &scan.files {
                if options.cancel.is_cancelled() {
                    manifest.cancelled = true;
                    break;
                }
                self.process_file(&root, &scan.target, file, gate, options, &mut manifest, &mut touched_dirs);
            }
            if manifest.cancelled {
                break;
            }
        }

        if !options.dry_run {
            self.prune_empty_dirs(&root, &touched_dirs, &mut manifest);
        }

        if !options.dry_run {
            let reports_dir = match &self.settings.reports_dir {
                Some(dir) => root.join(dir),
                None => root.clone(),
            };
            match manifest.write_to(&reports_dir) {
                Ok(path) => tracing::info!(path = %path.display(), "wrote consolidation manifest"),
                Err(e) => manifest.warn(format!("could not write manifest: {e}")),
            }
            METRICS.add_files_consolidated(manifest.moved_files.len() as u64);
        }

        obs::emit_consolidation_finished(
            &manifest.run_id,
            manifest.files_processed,
            manifest.failed_files.len(),
            manifest.total_size_bytes,
            manifest.dry_run,
            manifest.cancelled,
        );
        Ok(manifest)
    }

    /// Decide once per target whether its deletions may proceed.
    fn delete_gate(
        &self,
        scan: &TargetScan,
        options: &ConsolidateOptions,
        manifest: &mut ConsolidationManifest,
    ) -> DeleteGate {
        if !scan.target.disposition().is_destructive() {
            return DeleteGate::NotDestructive;
        }
        if options.force {
            return DeleteGate::Allowed;
        }
        let Some(confirmation) = &options.confirmation else {
            manifest.warn(format!(
                "skipping {} deletion(s) for '{}' ({}): confirmation required (use force)",
                scan.files.len(),
                scan.target.path().display(),
                scan.target.pattern()
            ));
            return DeleteGate::Denied("confirmation required");
        };
        if options.dry_run {
            return DeleteGate::Pending;
        }
        let files: Vec<PathBuf> = scan.files.iter().map(|f| f.path.clone()).collect();
        if confirmation.confirm(&scan.target, &files) {
            DeleteGate::Allowed
        } else {
            manifest.warn(format!(
                "deletion of {} file(s) for '{}' declined",
                files.len(),
                scan.target.path().display()
            ));
            DeleteGate::Denied("deletion declined")
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_file(
        &self,
        root: &Path,
        target: &CleanupTarget,
        file: &FoundFile,
        gate: DeleteGate,
        options: &ConsolidateOptions,
        manifest: &mut ConsolidationManifest,
        touched_dirs: &mut BTreeSet<(PathBuf, PathBuf)>,
    ) {
        let source = root.join(&file.path);
        let category = target.category().map(str::to_string);

        match target.disposition() {
            Disposition::Archive => {
                let mut destination = manifest.destination.clone();
                if let Some(category) = &category {
                    destination.push(category);
                }
                destination.push(&file.path);

                if !options.dry_run {
                    if let Err(e) = move_file(&source, &root.join(&destination)) {
                        manifest.record_failed(file.path.clone(), e.to_string());
                        return;
                    }
                    touched_dirs.insert((target.path().to_path_buf(), file.path.clone()));
                }
                manifest.record_moved(ManifestEntry {
                    source: file.path.clone(),
                    destination: Some(destination),
                    size_bytes: file.size_bytes,
                    action: Disposition::Archive,
                    category,
                    pending_confirmation: false,
                });
            }
            Disposition::Delete => {
                if let DeleteGate::Denied(reason) = gate {
                    manifest.record_skipped(file.path.clone(), reason);
                    return;
                }
                if !options.dry_run {
                    if let Err(e) = delete_file(&source) {
                        manifest.record_failed(file.path.clone(), e.to_string());
                        return;
                    }
                    touched_dirs.insert((target.path().to_path_buf(), file.path.clone()));
                }
                manifest.record_moved(ManifestEntry {
                    source: file.path.clone(),
                    destination: None,
                    size_bytes: file.size_bytes,
                    action: Disposition::Delete,
                    category,
                    pending_confirmation: matches!(gate, DeleteGate::Pending),
                });
            }
        }
    }

    /// Remove directories emptied by this run, bottom-up, never above the
    /// target's own directory.
    fn prune_empty_dirs(&self, root: &Path, touched: &BTreeSet<(PathBuf, PathBuf)>, manifest: &mut ConsolidationManifest) {
        let mut candidates: BTreeSet<PathBuf> = BTreeSet::new();
        for (target_dir, file) in touched {
            let stop = normalize(target_dir);
            let mut parent = file.parent();
            while let Some(dir) = parent {
                if dir.as_os_str().is_empty() || normalize(dir) == stop || !dir.starts_with(&stop) {
                    break;
                }
                candidates.insert(dir.to_path_buf());
                parent = dir.parent();
            }
        }

        for dir in candidates.iter().rev() {
            let absolute = root.join(dir);
            let is_empty = match std::fs::read_dir(&absolute) {
                Ok(mut entries) => entries.next().is_none(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    manifest.failed_directories.push(FailedEntry {
                        path: dir.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if !is_empty {
                continue;
            }
            match std::fs::remove_dir(&absolute) {
                Ok(()) => manifest.pruned_directories.push(dir.clone()),
                Err(e) => {
                    manifest.warn(format!("could not prune {}: {e}", dir.display()));
                    manifest.failed_directories.push(FailedEntry {
                        path: dir.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteGate {
    NotDestructive,
    Allowed,
    /// Dry run with a confirmation provider present: report, do not ask.
    Pending,
    Denied(&'static str),
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}

/// Move `source` to `destination`, creating parents. Falls back to
/// copy-then-remove across filesystems. A missing source whose destination
/// already exists counts as done, so re-running an interrupted sweep is safe.
pub fn move_file(source: &Path, destination: &Path) -> Result<()> {
    if !source.exists() {
        if destination.exists() {
            return Ok(());
        }
        return Err(PatchError::fs(source, "source file disappeared"));
    }
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PatchError::fs(parent, e))?;
    }
    let destination = unique_destination(destination);
    if std::fs::rename(source, &destination).is_ok() {
        return Ok(());
    }
    std::fs::copy(source, &destination).map_err(|e| PatchError::fs(source, e))?;
    std::fs::remove_file(source).map_err(|e| PatchError::fs(source, e))
}

/// `destination`, or `destination.1`, `.2`, ... if it is taken.
fn unique_destination(destination: &Path) -> PathBuf {
    if !destination.exists() {
        return destination.to_path_buf();
    }
    let mut n = 1;
    loop {
        let mut name = destination.as_os_str().to_owned();
        name.push(format!(".{n}"));
        let candidate = PathBuf::from(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn delete_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PatchError::fs(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bak");
        let dst = dir.path().join("archive/x/a.bak");
        std::fs::write(&src, "data").unwrap();

        move_file(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "data");

        move_file(&src, &dst).unwrap();
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "data");
    }

    #[test]
    fn move_never_clobbers_an_archived_file() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("archive/a.bak");
        std::fs::create_dir_all(dst.parent().unwrap()).unwrap();
        std::fs::write(&dst, "first").unwrap();
        let src = dir.path().join("a.bak");
        std::fs::write(&src, "second").unwrap();

        move_file(&src, &dst).unwrap();
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "first");
        assert_eq!(std::fs::read_to_string(dir.path().join("archive/a.bak.1")).unwrap(), "second");
    }

    #[test]
    fn missing_source_without_destination_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = move_file(&dir.path().join("nope"), &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, PatchError::FileSystem { .. }));
    }

    #[test]
    fn normalize_drops_cur_dir() {
        assert_eq!(normalize(Path::new("./backups")), PathBuf::from("backups"));
        assert_eq!(normalize(Path::new(".")), PathBuf::new());
    }
}
