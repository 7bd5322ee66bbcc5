//! Moves existing configuration files out of the way before a package is extracted over them.

use std::ffi::OsString;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use fs_err as fs;
use rpm_header::{FileFlags, PackageMetadata};

use crate::{resolve_path, InstallError};

/// The suffix appended to the name of a backed up configuration file.
pub const BACKUP_SUFFIX: &str = ".rpmorig";

/// Returns the path a configuration file at `path` is backed up to.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// For every configuration file of the package that already exists below `root` as a regular
/// file, copies it to `<path>.rpmorig` and removes the original. Permissions, timestamps and the
/// owner are preserved. Returns the paths of the backups.
pub fn backup_config_files(
    metadata: &PackageMetadata<'_>,
    root: &Path,
) -> Result<Vec<PathBuf>, InstallError> {
    let mut backups = Vec::new();
    for file in metadata.files()? {
        if !file.flags.contains(FileFlags::CONFIG) {
            continue;
        }

        let path = resolve_path(root, &file.path())?;
        match fs::symlink_metadata(&path) {
            Ok(existing) if existing.file_type().is_file() => {
                let backup = backup_path(&path);
                tracing::debug!("backing up {} to {}", path.display(), backup.display());

                // `copy` also transfers the permission bits.
                fs::copy(&path, &backup).map_err(|err| {
                    InstallError::Io(String::from("backing up a configuration file"), err)
                })?;
                let accessed = filetime::FileTime::from_last_access_time(&existing);
                let modified = filetime::FileTime::from_last_modification_time(&existing);
                filetime::set_file_times(&backup, accessed, modified).map_err(|err| {
                    InstallError::Io(String::from("preserving the timestamps of a backup"), err)
                })?;
                // Fails without privileges unless the original belongs to the current user.
                if let Err(err) = std::os::unix::fs::lchown(
                    &backup,
                    Some(existing.uid()),
                    Some(existing.gid()),
                ) {
                    tracing::warn!(
                        "failed to preserve the owner of {}: {err}",
                        backup.display()
                    );
                }
                fs::remove_file(&path).map_err(|err| {
                    InstallError::Io(String::from("removing a backed up configuration file"), err)
                })?;
                backups.push(backup);
            }
            _ => {}
        }
    }
    Ok(backups)
}
