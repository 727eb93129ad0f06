//! Final naming and placement of backup files.

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::error::BackupError;

/// `<hostname>_<MMDDYYYY>.tgz`
pub fn backup_file_name(hostname: &str, date: NaiveDate) -> String {
    format!("{}_{}.tgz", sanitize(hostname), date.format("%m%d%Y"))
}

/// Replace path separators so a name can never escape its directory.
pub fn sanitize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect()
}

/// Rename `working` into `backup_dir` under its dated hostname.
///
/// An existing backup of the same host and day is replaced.
pub fn place(
    working: &Path,
    backup_dir: &Path,
    hostname: &str,
    date: NaiveDate,
) -> Result<PathBuf, BackupError> {
    let target = backup_dir.join(backup_file_name(hostname, date));
    let err = |source| BackupError::Placement {
        from: working.to_path_buf(),
        to: target.clone(),
        source,
    };

    std::fs::create_dir_all(backup_dir).map_err(err)?;
    if target.exists() {
        info!(path = %target.display(), "replacing backup taken earlier today");
    }
    if let Err(e) = std::fs::rename(working, &target) {
        if e.kind() == std::io::ErrorKind::NotFound {
            return Err(err(e));
        }
        // Working and backup directories on different filesystems.
        warn!(from = %working.display(), error = %e, "rename failed, copying into place");
        copy_into_place(working, &target).map_err(err)?;
    }

    info!(from = %working.display(), to = %target.display(), "backup placed");
    Ok(target)
}

/// Fill `part` with `fill`, then rename it to `path`.
///
/// `part` is removed on any failure so no partial file lingers.
pub(crate) fn write_then_rename<F>(part: &Path, path: &Path, fill: F) -> std::io::Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let result = File::create(part)
        .and_then(|mut f| {
            fill(&mut f)?;
            f.sync_all()
        })
        .and_then(|()| std::fs::rename(part, path));
    if result.is_err() {
        let _ = std::fs::remove_file(part);
    }
    result
}

/// Copy `from` to a `.part` sibling of `to`, rename it over `to`, then
/// drop `from`.
fn copy_into_place(from: &Path, to: &Path) -> std::io::Result<()> {
    let mut part = to.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    write_then_rename(&part, to, |f| {
        let mut src = File::open(from)?;
        std::io::copy(&mut src, f).map(|_| ())
    })?;
    std::fs::remove_file(from)
}
