//! Fixed-count retention over the backup directory.
//!
//! The directory listing is the index: every regular file directly inside it
//! counts, ordered by modification time. The oldest are removed until at most
//! `cap` remain. Each removal stands alone, so one stuck file does not keep
//! the rest of the excess around.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::BackupError;

/// Outcome of one pruning pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RetentionReport {
    /// Files left in the directory.
    pub kept: usize,
    pub deleted: Vec<PathBuf>,
    /// Files that should have gone but could not be removed.
    pub failed: Vec<(PathBuf, String)>,
}

/// A file seen while listing the backup directory.
#[derive(Debug, Clone)]
pub struct BackupFile {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// List regular files directly inside `dir`, oldest first.
///
/// Equal modification times keep directory enumeration order.
pub fn list_backups(dir: &Path) -> Result<Vec<BackupFile>, BackupError> {
    let err = |source| BackupError::Retention {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(err)? {
        let entry = entry.map_err(err)?;
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                // Vanished between listing and stat.
                debug!(path = %entry.path().display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !meta.is_file() {
            continue;
        }
        files.push(BackupFile {
            path: entry.path(),
            modified: meta.modified().map_err(err)?,
        });
    }
    files.sort_by_key(|f| f.modified);
    Ok(files)
}

/// Prune `dir` down to `cap` files.
pub fn enforce(dir: &Path, cap: usize) -> Result<RetentionReport, BackupError> {
    let files = list_backups(dir)?;
    let report = prune(files, cap, |p| std::fs::remove_file(p));
    if !report.deleted.is_empty() || !report.failed.is_empty() {
        info!(
            dir = %dir.display(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            kept = report.kept,
            "retention pass complete"
        );
    }
    Ok(report)
}

/// Remove entries from the front of `files` (oldest first) until `cap`
/// remain, using `remove` for each deletion.
pub fn prune<F>(files: Vec<BackupFile>, cap: usize, mut remove: F) -> RetentionReport
where
    F: FnMut(&Path) -> std::io::Result<()>,
{
    let excess = files.len().saturating_sub(cap);
    let mut report = RetentionReport {
        kept: files.len() - excess,
        ..Default::default()
    };

    for file in files.into_iter().take(excess) {
        match remove(&file.path) {
            Ok(()) => {
                debug!(path = %file.path.display(), "deleted old backup");
                report.deleted.push(file.path);
            }
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "failed to delete old backup");
                report.failed.push((file.path, e.to_string()));
                report.kept += 1;
            }
        }
    }
    report
}
