//! Turns the file entries of a package into an ordered list of [`InstallAction`]s.
//!
//! Planning does not touch the file system. Given the same metadata and options it always
//! produces the same plan.

use std::collections::BTreeMap;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use rpm_header::{align_up, FileRecord, FileType, PackageMetadata, PAGE_SIZE};

use crate::{ConflictError, InstallError};

/// Why a file entry does not result in any change on disk.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SkipReason {
    /// The entry is a ghost file.
    Ghost,
    /// The entry lies outside of the prefix the installation is restricted to.
    OutsidePrefix,
    /// The entry is a device, fifo or socket.
    SpecialFile,
}

/// A single step of an installation. Paths are absolute package paths which are resolved against
/// the installation root when the plan is applied.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum InstallAction {
    /// Create a directory (and its parents) and set its permissions.
    MkDir {
        /// The directory to create.
        path: PathBuf,
        /// The permissions of the directory.
        mode: u32,
    },
    /// Create a symbolic link.
    Symlink {
        /// The path of the link.
        path: PathBuf,
        /// The target the link points to, stored verbatim.
        target: PathBuf,
    },
    /// Create a regular file by cloning a range of the package image.
    CloneFile {
        /// The file to create.
        path: PathBuf,
        /// The permissions of the file.
        mode: u32,
        /// The absolute offset of the content in the package image.
        src_offset: u64,
        /// The size of the content.
        size: u64,
    },
    /// Create a hard link to a file created by an earlier action.
    HardLink {
        /// The path of the new link.
        path: PathBuf,
        /// The file to link to.
        existing_path: PathBuf,
    },
    /// Do nothing for this entry.
    Skip {
        /// The path of the entry.
        path: PathBuf,
        /// Why the entry is skipped.
        reason: SkipReason,
    },
}

impl InstallAction {
    /// The path this action operates on.
    pub fn path(&self) -> &std::path::Path {
        match self {
            InstallAction::MkDir { path, .. }
            | InstallAction::Symlink { path, .. }
            | InstallAction::CloneFile { path, .. }
            | InstallAction::HardLink { path, .. }
            | InstallAction::Skip { path, .. } => path,
        }
    }
}

/// The files of a package that share the same inode.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HardlinkGroup {
    /// The inode shared by the members. `None` if the package does not store inodes, in which
    /// case every file forms its own group.
    pub inode: Option<u64>,
    /// The file indices of the members, ascending.
    pub members: Vec<usize>,
}

impl HardlinkGroup {
    /// The member whose content is stored in the payload. All other members are links to it.
    pub fn source(&self) -> usize {
        self.members[0]
    }
}

/// Groups the regular, non-ghost files of a package by inode. Groups are ordered by inode.
pub fn hardlink_groups(files: &[FileRecord<'_>]) -> Vec<HardlinkGroup> {
    let mut by_inode: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    let mut groups = Vec::new();
    for file in files
        .iter()
        .filter(|file| file.file_type() == FileType::Regular && !file.is_ghost())
    {
        match file.inode {
            Some(inode) => by_inode.entry(inode).or_default().push(file.index),
            None => groups.push(HardlinkGroup {
                inode: None,
                members: vec![file.index],
            }),
        }
    }

    // Files are visited in index order so the members are already sorted.
    by_inode
        .into_iter()
        .map(|(inode, members)| HardlinkGroup {
            inode: Some(inode),
            members,
        })
        .chain(groups)
        .collect()
}

/// Options that influence the plan.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Only install entries whose directory name starts with this prefix.
    pub only_prefix: Option<PathBuf>,

    /// Whether the installation runs with root privileges. Unprivileged installations make every
    /// directory accessible to its owner so the installation can write into it.
    pub privileged: bool,
}

/// The ordered list of actions that install a package.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InstallPlan {
    /// The absolute offset of the first file in the package image.
    pub payload_start: u64,
    /// The actions, in the order in which they must be applied.
    pub actions: Vec<InstallAction>,
}

/// Plans the installation of the files of a reflink package whose file contents start at the
/// first page boundary at or after `payload_offset`.
pub fn plan(
    metadata: &PackageMetadata<'_>,
    payload_offset: u64,
    options: &PlanOptions,
) -> Result<InstallPlan, InstallError> {
    let files = metadata.files()?;

    let mut source_of: Vec<usize> = (0..files.len()).collect();
    for group in hardlink_groups(&files) {
        for &member in &group.members {
            source_of[member] = group.source();
        }
    }

    let outside_prefix = |file: &FileRecord<'_>| match &options.only_prefix {
        Some(prefix) => !file.dir_name.starts_with(prefix.as_os_str().as_bytes()),
        None => false,
    };

    let payload_start = align_up(payload_offset, PAGE_SIZE);
    let mut offset = payload_start;
    let mut actions = Vec::with_capacity(files.len());
    for file in &files {
        let path = file.path();
        if file.is_ghost() {
            actions.push(InstallAction::Skip {
                path,
                reason: SkipReason::Ghost,
            });
            continue;
        }

        let filtered = outside_prefix(file);
        let file_type = file.file_type();
        if filtered && file_type != FileType::Regular {
            actions.push(InstallAction::Skip {
                path,
                reason: SkipReason::OutsidePrefix,
            });
            continue;
        }

        let action = match file_type {
            FileType::Directory => {
                let mut mode = file.permissions();
                if !options.privileged {
                    mode |= 0o700;
                }
                InstallAction::MkDir { path, mode }
            }
            FileType::Symlink => InstallAction::Symlink {
                path,
                target: PathBuf::from(std::ffi::OsStr::from_bytes(
                    file.link_to.unwrap_or_default(),
                )),
            },
            FileType::Other => {
                tracing::info!("skipping special file {}", path.display());
                InstallAction::Skip {
                    path,
                    reason: SkipReason::SpecialFile,
                }
            }
            FileType::Regular if source_of[file.index] != file.index => {
                let source = &files[source_of[file.index]];
                if filtered {
                    InstallAction::Skip {
                        path,
                        reason: SkipReason::OutsidePrefix,
                    }
                } else if outside_prefix(source) {
                    return Err(ConflictError::SkippedSource {
                        path,
                        source_path: source.path(),
                    }
                    .into());
                } else {
                    InstallAction::HardLink {
                        path,
                        existing_path: source.path(),
                    }
                }
            }
            FileType::Regular => {
                let src_offset = offset;
                offset += align_up(file.size, PAGE_SIZE);
                if filtered {
                    InstallAction::Skip {
                        path,
                        reason: SkipReason::OutsidePrefix,
                    }
                } else {
                    InstallAction::CloneFile {
                        path,
                        mode: file.permissions(),
                        src_offset,
                        size: file.size,
                    }
                }
            }
        };
        actions.push(action);
    }

    Ok(InstallPlan {
        payload_start,
        actions,
    })
}
