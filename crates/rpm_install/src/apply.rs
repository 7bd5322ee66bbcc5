//! Applies an [`InstallPlan`] to the file system.

use std::fmt;
use std::fmt::Formatter;
use std::fs::{File, OpenOptions, Permissions};
use std::io::{self, ErrorKind};
use std::num::NonZeroU64;
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use fs_err as fs;
use nix::sys::stat::{umask, Mode};
use rpm_header::{align_up, PAGE_SIZE};

use crate::plan::{InstallAction, InstallPlan};
use crate::{resolve_path, ConflictError, InstallError};

/// Describes how the content of a file is transferred from the package image into the file on
/// disk.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CloneMethod {
    /// The file shares its extents with the package image. This requires a file system with
    /// reflink support and the package and the destination on the same file system.
    #[default]
    Reflink,

    /// The bytes are copied.
    Copy,

    /// Try to reflink, but copy if the file system does not support it.
    ReflinkOrCopy,
}

impl fmt::Display for CloneMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CloneMethod::Reflink => write!(f, "reflink"),
            CloneMethod::Copy => write!(f, "copy"),
            CloneMethod::ReflinkOrCopy => write!(f, "reflink or copy"),
        }
    }
}

/// Options for [`apply_plan`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Replace existing files instead of failing.
    pub force: bool,

    /// How file contents are transferred.
    pub clone_method: CloneMethod,
}

/// What [`apply_plan`] did.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ApplySummary {
    /// Number of directories created.
    pub directories: usize,
    /// Number of regular files created by reflinking.
    pub reflinked: usize,
    /// Number of regular files created by copying.
    pub copied: usize,
    /// Number of hard links created.
    pub hardlinks: usize,
    /// Number of symbolic links created.
    pub symlinks: usize,
    /// Number of skipped entries.
    pub skipped: usize,
}

/// Sets the process umask and restores the previous one when dropped.
struct UmaskGuard(Mode);

impl UmaskGuard {
    fn set(mode: Mode) -> Self {
        UmaskGuard(umask(mode))
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        umask(self.0);
    }
}

/// Applies all actions of `plan` in order. File contents are read from `package`, paths are
/// resolved against `root`.
///
/// The umask is set to `022` while the plan is applied. Parent directories that do not exist are
/// created with mode `0755`.
pub fn apply_plan(
    plan: &InstallPlan,
    package: &File,
    root: &Path,
    options: &ApplyOptions,
) -> Result<ApplySummary, InstallError> {
    let _umask = UmaskGuard::set(Mode::from_bits_truncate(0o022));
    let mut summary = ApplySummary::default();

    for action in &plan.actions {
        let path = resolve_path(root, action.path())?;
        if !matches!(action, InstallAction::MkDir { .. } | InstallAction::Skip { .. }) {
            create_parent(&path)?;
        }

        match action {
            InstallAction::MkDir { mode, .. } => {
                tracing::debug!("creating directory {} ({mode:o})", path.display());
                fs::create_dir_all(&path).map_err(|err| {
                    InstallError::Io(String::from("creating a directory"), err)
                })?;
                fs::set_permissions(&path, Permissions::from_mode(*mode)).map_err(|err| {
                    InstallError::Io(String::from("setting directory permissions"), err)
                })?;
                summary.directories += 1;
            }
            InstallAction::Symlink { target, .. } => {
                tracing::debug!("symlinking {} -> {}", path.display(), target.display());
                create_symlink(target, &path, options.force)?;
                summary.symlinks += 1;
            }
            InstallAction::CloneFile {
                mode,
                src_offset,
                size,
                ..
            } => {
                tracing::debug!(
                    "cloning {size} bytes at offset {src_offset} into {}",
                    path.display()
                );
                match clone_file(package, &path, *mode, *src_offset, *size, options)? {
                    CloneMethod::Copy => summary.copied += 1,
                    _ => summary.reflinked += 1,
                }
            }
            InstallAction::HardLink { existing_path, .. } => {
                let existing = resolve_path(root, existing_path)?;
                tracing::debug!("hardlinking {} -> {}", path.display(), existing.display());
                create_hardlink(&existing, &path, options.force)?;
                summary.hardlinks += 1;
            }
            InstallAction::Skip { path, reason } => {
                tracing::debug!("skipping {} ({reason:?})", path.display());
                summary.skipped += 1;
            }
        }
    }

    Ok(summary)
}

fn create_parent(path: &Path) -> Result<(), InstallError> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(|err| {
            InstallError::Io(String::from("creating a parent directory"), err)
        }),
        None => Ok(()),
    }
}

/// Removes a clobbered destination if `force` is set, otherwise reports the conflict.
fn remove_existing(path: &Path, force: bool) -> Result<(), InstallError> {
    if !force {
        return Err(ConflictError::AlreadyExists(path.to_path_buf()).into());
    }
    fs::remove_file(path)
        .map_err(|err| InstallError::Io(String::from("removing clobbered file"), err))
}

fn create_symlink(target: &Path, path: &Path, force: bool) -> Result<(), InstallError> {
    loop {
        match fs_err::os::unix::fs::symlink(target, path) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => remove_existing(path, force)?,
            Err(err) => return Err(InstallError::Io(String::from("creating a symlink"), err)),
        }
    }
}

fn create_hardlink(existing: &Path, path: &Path, force: bool) -> Result<(), InstallError> {
    loop {
        match fs::hard_link(existing, path) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => remove_existing(path, force)?,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ConflictError::MissingHardlinkSource(existing.to_path_buf()).into())
            }
            Err(err) => return Err(InstallError::Io(String::from("creating a hard link"), err)),
        }
    }
}

/// Creates `path` and fills it with `size` bytes taken from `package` at `src_offset`. Returns
/// the method that was actually used. On failure the file is removed again.
fn clone_file(
    package: &File,
    path: &Path,
    mode: u32,
    src_offset: u64,
    size: u64,
    options: &ApplyOptions,
) -> Result<CloneMethod, InstallError> {
    let mut open_options = OpenOptions::new();
    open_options.write(true).mode(mode & 0o7777);
    if options.force {
        open_options.create(true).truncate(true);
    } else {
        open_options.create_new(true);
    }
    let destination = match open_options.open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(ConflictError::AlreadyExists(path.to_path_buf()).into())
        }
        Err(err) => {
            return Err(InstallError::Io(
                format!("creating '{}'", path.display()),
                err,
            ))
        }
    };

    let result = transfer(package, &destination, src_offset, size, options.clone_method)
        .and_then(|method| destination.set_len(size).map(|_| method));
    match result {
        Ok(method) => Ok(method),
        Err(err) => {
            drop(destination);
            if let Err(remove_err) = fs::remove_file(path) {
                tracing::warn!("failed to remove {}: {remove_err}", path.display());
            }
            Err(InstallError::FailedToClone {
                path: path.to_path_buf(),
                method: options.clone_method,
                source: err,
            })
        }
    }
}

fn transfer(
    package: &File,
    destination: &File,
    src_offset: u64,
    size: u64,
    method: CloneMethod,
) -> io::Result<CloneMethod> {
    // A zero length clone means "until the end of the source".
    if size == 0 {
        return Ok(method);
    }

    let length = align_up(size, PAGE_SIZE);
    match method {
        CloneMethod::Reflink => {
            reflink_range(package, destination, src_offset, length)?;
            Ok(CloneMethod::Reflink)
        }
        CloneMethod::Copy => {
            copy_range(package, destination, src_offset, size)?;
            Ok(CloneMethod::Copy)
        }
        CloneMethod::ReflinkOrCopy => {
            match reflink_range(package, destination, src_offset, length) {
                Ok(()) => Ok(CloneMethod::Reflink),
                Err(err) if is_reflink_unsupported(&err) => {
                    tracing::debug!("reflink is not supported ({err}), falling back to copying");
                    copy_range(package, destination, src_offset, size)?;
                    Ok(CloneMethod::Copy)
                }
                Err(err) => Err(err),
            }
        }
    }
}

/// Whether a failed clone should be retried by copying.
fn is_reflink_unsupported(err: &io::Error) -> bool {
    use nix::errno::Errno;
    err.kind() == ErrorKind::Unsupported
        || matches!(
            err.raw_os_error().map(Errno::from_raw),
            Some(Errno::EOPNOTSUPP | Errno::EXDEV | Errno::EINVAL | Errno::ENOSYS | Errno::ENOTTY)
        )
}

/// Clones `length` bytes of `source` starting at `offset` to the start of `destination`.
fn reflink_range(source: &File, destination: &File, offset: u64, length: u64) -> io::Result<()> {
    let Some(length) = NonZeroU64::new(length) else {
        return Ok(());
    };
    reflink_copy::ReflinkBlockBuilder::new(source, destination, length)
        .from_offset(offset)
        .to_offset(0)
        .reflink_block()
}

/// Copies `size` bytes of `source` starting at `offset` to the start of `destination`.
fn copy_range(source: &File, destination: &File, offset: u64, size: u64) -> io::Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0;
    while copied < size {
        let chunk = (size - copied).min(buf.len() as u64) as usize;
        let read = source.read_at(&mut buf[..chunk], offset + copied)?;
        if read == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "the package ends before the end of the file contents",
            ));
        }
        destination.write_all_at(&buf[..read], copied)?;
        copied += read as u64;
    }
    Ok(())
}
