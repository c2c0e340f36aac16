//! Consolidation manifests: the audit record of one sweep.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scan::MANIFEST_PREFIX;
use super::target::Disposition;
use crate::error::{PatchError, Result};

/// A file that was (or in a dry run, would be) archived or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Relative to the repository root.
    pub source: PathBuf,
    /// Archive location; `None` for deletions.
    pub destination: Option<PathBuf>,
    pub size_bytes: u64,
    pub action: Disposition,
    pub category: Option<String>,
    /// Dry run only: a live run would ask for confirmation first.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending_confirmation: bool,
}

/// An attempted file or directory operation that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub path: PathBuf,
    pub reason: String,
}

/// A matched file that was deliberately left alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: String,
}

/// Audit record of one consolidation run. Never modified after the run
/// completes; each run writes a new file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationManifest {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    /// `moved_files.len() + failed_files.len()`.
    pub files_processed: usize,
    pub total_size_bytes: u64,
    pub moved_files: Vec<ManifestEntry>,
    pub failed_files: Vec<FailedEntry>,
    pub skipped_files: Vec<SkippedEntry>,
    pub pruned_directories: Vec<PathBuf>,
    pub failed_directories: Vec<FailedEntry>,
    pub warnings: Vec<String>,
    /// Timestamped archive root for this run.
    pub destination: PathBuf,
    pub source_commit: Option<String>,
    pub dry_run: bool,
    pub cancelled: bool,
}

impl ConsolidationManifest {
    pub fn new(run_id: String, timestamp: DateTime<Utc>, destination: PathBuf, dry_run: bool) -> Self {
        Self {
            run_id,
            timestamp,
            files_processed: 0,
            total_size_bytes: 0,
            moved_files: Vec::new(),
            failed_files: Vec::new(),
            skipped_files: Vec::new(),
            pruned_directories: Vec::new(),
            failed_directories: Vec::new(),
            warnings: Vec::new(),
            destination,
            source_commit: None,
            dry_run,
            cancelled: false,
        }
    }

    pub(crate) fn record_moved(&mut self, entry: ManifestEntry) {
        self.total_size_bytes += entry.size_bytes;
        self.moved_files.push(entry);
        self.files_processed = self.moved_files.len() + self.failed_files.len();
    }

    pub(crate) fn record_failed(&mut self, path: PathBuf, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(path = %path.display(), reason = %reason, "consolidation step failed");
        self.failed_files.push(FailedEntry { path, reason });
        self.files_processed = self.moved_files.len() + self.failed_files.len();
    }

    pub(crate) fn record_skipped(&mut self, path: PathBuf, reason: impl Into<String>) {
        self.skipped_files.push(SkippedEntry {
            path,
            reason: reason.into(),
        });
    }

    pub(crate) fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!("{warning}");
        self.warnings.push(warning);
    }

    /// Sources of every moved (or would-be moved) file.
    pub fn moved_paths(&self) -> BTreeSet<PathBuf> {
        self.moved_files.iter().map(|e| e.source.clone()).collect()
    }

    /// Canonical file name for a manifest written at `timestamp`.
    pub fn file_name(timestamp: DateTime<Utc>) -> String {
        format!("{MANIFEST_PREFIX}{}.json", timestamp.format("%Y%m%d-%H%M%S"))
    }

    /// Write as pretty JSON into `dir`. Never overwrites an existing
    /// manifest; a numeric suffix is added instead.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).map_err(|e| PatchError::fs(dir, e))?;
        let base = Self::file_name(self.timestamp);
        let mut path = dir.join(&base);
        let mut n = 1;
        while path.exists() {
            let stem = base.trim_end_matches(".json");
            path = dir.join(format!("{stem}-{n}.json"));
            n += 1;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).map_err(|e| PatchError::fs(&path, e))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| PatchError::fs(path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u64) -> ManifestEntry {
        ManifestEntry {
            source: PathBuf::from(path),
            destination: None,
            size_bytes: size,
            action: Disposition::Delete,
            category: None,
            pending_confirmation: false,
        }
    }

    #[test]
    fn processed_count_tracks_moved_plus_failed() {
        let mut manifest = ConsolidationManifest::new("r".into(), Utc::now(), PathBuf::from("x"), false);
        assert_eq!(manifest.files_processed, 0);
        manifest.record_moved(entry("a.bak", 10));
        manifest.record_failed(PathBuf::from("b.bak"), "permission denied");
        manifest.record_skipped(PathBuf::from("c.tmp"), "needs confirmation");
        assert_eq!(manifest.files_processed, 2);
        assert_eq!(manifest.total_size_bytes, 10);
    }

    #[test]
    fn write_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ConsolidationManifest::new("r".into(), Utc::now(), PathBuf::from("x"), false);
        let first = manifest.write_to(dir.path()).unwrap();
        let second = manifest.write_to(dir.path()).unwrap();
        assert_ne!(first, second);
        assert_eq!(ConsolidationManifest::load(&first).unwrap(), manifest);
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(MANIFEST_PREFIX));
    }
}
