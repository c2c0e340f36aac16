//! Working-tree snapshots: content fingerprints for change detection and
//! pre-images for restoring a tree after a failed patch.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::error::{PatchError, Result};
use crate::git::GitCli;

/// SHA-256 of every tracked or untracked-but-not-ignored file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint {
    files: BTreeMap<PathBuf, String>,
}

impl Fingerprint {
    pub async fn capture(git: &GitCli) -> Result<Self> {
        let listed = git.list_files().await?;
        let root = git.workdir().to_path_buf();
        tokio::task::spawn_blocking(move || Self::hash_all(&root, listed))
            .await
            .map_err(|e| PatchError::Operation(format!("fingerprint task failed: {e}")))?
    }

    fn hash_all(root: &Path, listed: Vec<PathBuf>) -> Result<Self> {
        let mut files = BTreeMap::new();
        for relative in listed {
            let path = root.join(&relative);
            if !path.is_file() {
                continue;
            }
            files.insert(relative, hash_file(&path)?);
        }
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    /// Paths created, modified or deleted between `self` and `after`.
    pub fn changed_since(&self, after: &Fingerprint) -> BTreeSet<PathBuf> {
        let mut changed = BTreeSet::new();
        for (path, hash) in &self.files {
            if after.files.get(path) != Some(hash) {
                changed.insert(path.clone());
            }
        }
        for path in after.files.keys() {
            if !self.files.contains_key(path) {
                changed.insert(path.clone());
            }
        }
        changed
    }
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|e| PatchError::fs(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| PatchError::fs(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Copies of every file that differed from HEAD before the patch ran.
///
/// `git checkout`/`reset --hard` only know committed content; the pre-image
/// keeps the user's uncommitted edits so a rollback can put them back.
#[derive(Debug)]
pub struct PreImage {
    dir: TempDir,
    saved: BTreeSet<PathBuf>,
    absent: BTreeSet<PathBuf>,
}

impl PreImage {
    pub async fn capture(git: &GitCli) -> Result<Self> {
        let changed = git.changed_paths().await?;
        let root = git.workdir().to_path_buf();
        tokio::task::spawn_blocking(move || Self::copy_out(&root, changed))
            .await
            .map_err(|e| PatchError::Operation(format!("pre-image task failed: {e}")))?
    }

    fn copy_out(root: &Path, changed: Vec<PathBuf>) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("patchctl-preimage-")
            .tempdir()?;
        let mut saved = BTreeSet::new();
        let mut absent = BTreeSet::new();
        for relative in changed {
            let source = root.join(&relative);
            if !source.is_file() {
                absent.insert(relative);
                continue;
            }
            let dest = dir.path().join(&relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| PatchError::fs(parent, e))?;
            }
            fs::copy(&source, &dest).map_err(|e| PatchError::fs(&source, e))?;
            saved.insert(relative);
        }
        Ok(Self { dir, saved, absent })
    }

    /// Whether `path` had uncommitted content (or an uncommitted deletion).
    pub fn covers(&self, path: &Path) -> bool {
        self.saved.contains(path) || self.absent.contains(path)
    }

    /// Put `path` back the way it was captured.
    pub fn restore(&self, root: &Path, path: &Path) -> Result<()> {
        let target = root.join(path);
        if self.saved.contains(path) {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| PatchError::fs(parent, e))?;
            }
            fs::copy(self.dir.path().join(path), &target).map_err(|e| PatchError::fs(&target, e))?;
        } else if self.absent.contains(path) {
            remove_if_present(&target)?;
        }
        Ok(())
    }

    /// Restore every captured path.
    pub fn restore_all(&self, root: &Path) -> Result<()> {
        for path in self.saved.iter().chain(self.absent.iter()) {
            self.restore(root, path)?;
        }
        Ok(())
    }
}

pub(crate) fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PatchError::fs(path, e)),
    }
}

/// Scratch copy of a repository used for dry runs: the git directory plus
/// every tracked and untracked-but-not-ignored file.
#[derive(Debug)]
pub struct ScratchCopy {
    dir: TempDir,
}

impl ScratchCopy {
    pub async fn create(git: &GitCli) -> Result<Self> {
        let root = git.workdir().to_path_buf();
        let git_dir = root.join(".git");
        if !git_dir.is_dir() {
            return Err(PatchError::InvalidRequest(format!(
                "dry run needs a plain .git directory at {}",
                root.display()
            )));
        }
        let listed = git.list_files().await?;
        tokio::task::spawn_blocking(move || Self::copy_tree(&root, listed))
            .await
            .map_err(|e| PatchError::Operation(format!("scratch copy task failed: {e}")))?
    }

    fn copy_tree(root: &Path, listed: Vec<PathBuf>) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("patchctl-dryrun-").tempdir()?;

        for entry in WalkDir::new(root.join(".git")).follow_links(false) {
            let entry = entry.map_err(|e| PatchError::fs(root, e))?;
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            copy_entry(entry.path(), &dir.path().join(relative), entry.file_type())?;
        }

        for relative in listed {
            let source = root.join(&relative);
            let Ok(meta) = fs::symlink_metadata(&source) else {
                continue;
            };
            copy_entry(&source, &dir.path().join(&relative), meta.file_type())?;
        }
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn copy_entry(source: &Path, dest: &Path, file_type: fs::FileType) -> Result<()> {
    if file_type.is_dir() {
        return fs::create_dir_all(dest).map_err(|e| PatchError::fs(dest, e));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| PatchError::fs(parent, e))?;
    }
    if file_type.is_symlink() {
        #[cfg(unix)]
        {
            let target = fs::read_link(source).map_err(|e| PatchError::fs(source, e))?;
            std::os::unix::fs::symlink(target, dest).map_err(|e| PatchError::fs(dest, e))?;
        }
        return Ok(());
    }
    if file_type.is_file() {
        fs::copy(source, dest).map_err(|e| PatchError::fs(source, e))?;
    }
    Ok(())
}
