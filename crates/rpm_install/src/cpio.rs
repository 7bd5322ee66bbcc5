//! Extraction of `newc` cpio archives, the archive format of regular package payloads.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::Permissions;
use std::io::{self, ErrorKind, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use fs_err as fs;
use rpm_header::FileType;

/// The size of a `newc` header.
const HEADER_SIZE: usize = 110;

/// The name of the entry that terminates an archive.
const TRAILER: &[u8] = b"TRAILER!!!";

/// The longest entry name or symlink target that is accepted, `PATH_MAX` on Linux.
const MAX_PATH_SIZE: u32 = 4096;

/// An error that can occur when extracting an archive.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum ExtractError {
    #[error("an io error occurred")]
    IoError(#[from] io::Error),

    #[error("could not create the destination path")]
    CouldNotCreateDestination(#[source] io::Error),

    #[error("invalid cpio header magic {0:?}")]
    InvalidMagic(String),

    #[error("the cpio header field '{0}' is not a hexadecimal number")]
    InvalidHeaderField(&'static str),

    #[error("the cpio header field '{field}' ({size}) exceeds the maximum path length")]
    PathTooLong { field: &'static str, size: u32 },

    #[error("the archive entry '{0}' escapes the destination directory")]
    PathEscapesDestination(String),

    #[error("'{}' already exists", .0.display())]
    AlreadyExists(PathBuf),
}

/// Controls how entries are written.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ExtractFlags {
    /// Set the modification time of extracted entries to the one stored in the archive.
    pub restore_timestamps: bool,

    /// Create missing parent directories of entries.
    pub create_leading_dirs: bool,

    /// Write files to a temporary file next to the destination and rename it over an existing
    /// entry. Without this flag existing entries cause [`ExtractError::AlreadyExists`].
    pub replace_via_rename: bool,
}

/// What an extraction produced.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ExtractSummary {
    /// Number of regular files written.
    pub files: usize,
    /// Number of directories created.
    pub directories: usize,
    /// Number of symbolic links created.
    pub symlinks: usize,
    /// Number of hard links created.
    pub hardlinks: usize,
    /// Number of entries that were skipped (devices, fifos, sockets).
    pub skipped: usize,
}

/// Extracts an archive stream into a directory.
pub trait ArchiveExtractor: Send + Sync {
    /// Reads the archive from `payload` and writes its entries below `destination`.
    fn extract(
        &self,
        payload: &mut dyn Read,
        destination: &Path,
        flags: ExtractFlags,
    ) -> Result<ExtractSummary, ExtractError>;
}

/// An [`ArchiveExtractor`] for `newc` cpio archives (magic `070701` or `070702`).
#[derive(Debug, Default, Clone, Copy)]
pub struct CpioExtractor;

#[derive(Debug)]
struct Header {
    ino: u32,
    mode: u32,
    nlink: u32,
    mtime: u32,
    file_size: u32,
    dev_major: u32,
    dev_minor: u32,
    name_size: u32,
}

/// Number of padding bytes that follow `len` bytes to reach a multiple of four.
fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Allocates the buffer for a name or symlink target of `size` bytes.
fn path_buffer(field: &'static str, size: u32) -> Result<Vec<u8>, ExtractError> {
    if size > MAX_PATH_SIZE {
        return Err(ExtractError::PathTooLong { field, size });
    }
    Ok(vec![0u8; size as usize])
}

fn skip(reader: &mut dyn Read, len: u64) -> io::Result<()> {
    let skipped = io::copy(&mut (&mut *reader).take(len), &mut io::sink())?;
    if skipped != len {
        return Err(ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

fn read_header(reader: &mut dyn Read) -> Result<Header, ExtractError> {
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw)?;

    let magic = &raw[..6];
    if magic != b"070701" && magic != b"070702" {
        return Err(ExtractError::InvalidMagic(
            String::from_utf8_lossy(magic).into_owned(),
        ));
    }

    let field = |index: usize, name: &'static str| {
        let start = 6 + index * 8;
        std::str::from_utf8(&raw[start..start + 8])
            .ok()
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .ok_or(ExtractError::InvalidHeaderField(name))
    };

    Ok(Header {
        ino: field(0, "ino")?,
        mode: field(1, "mode")?,
        nlink: field(4, "nlink")?,
        mtime: field(5, "mtime")?,
        file_size: field(6, "filesize")?,
        dev_major: field(7, "devmajor")?,
        dev_minor: field(8, "devminor")?,
        name_size: field(11, "namesize")?,
    })
}

/// Turns an archive path into a path relative to the destination. Returns `None` for the entry
/// that denotes the destination itself.
fn relative_path(name: &[u8]) -> Result<Option<PathBuf>, ExtractError> {
    let mut path = PathBuf::new();
    for component in Path::new(OsStr::from_bytes(name)).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ExtractError::PathEscapesDestination(
                    String::from_utf8_lossy(name).into_owned(),
                ))
            }
        }
    }
    Ok((!path.as_os_str().is_empty()).then_some(path))
}

/// Removes an existing non-directory entry at `path` if replacing is allowed.
fn clear_destination(path: &Path, flags: ExtractFlags) -> Result<(), ExtractError> {
    match path.symlink_metadata() {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) if flags.replace_via_rename => Ok(fs::remove_file(path)?),
        Ok(_) => Err(ExtractError::AlreadyExists(path.to_path_buf())),
        Err(_) => Ok(()),
    }
}

fn write_file(
    reader: &mut dyn Read,
    path: &Path,
    header: &Header,
    flags: ExtractFlags,
) -> Result<(), ExtractError> {
    let size = u64::from(header.file_size);
    let permissions = Permissions::from_mode(header.mode & 0o7777);

    if flags.replace_via_rename {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        if io::copy(&mut (&mut *reader).take(size), temp.as_file_mut())? != size {
            return Err(io::Error::from(ErrorKind::UnexpectedEof).into());
        }
        temp.as_file().set_permissions(permissions)?;
        temp.persist(path).map_err(|err| ExtractError::IoError(err.error))?;
    } else {
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(ExtractError::AlreadyExists(path.to_path_buf()))
            }
            Err(err) => return Err(err.into()),
        };
        if io::copy(&mut (&mut *reader).take(size), &mut file)? != size {
            return Err(io::Error::from(ErrorKind::UnexpectedEof).into());
        }
        file.set_permissions(permissions)?;
    }
    Ok(())
}

fn link_members(
    source: &Path,
    members: Vec<PathBuf>,
    flags: ExtractFlags,
    summary: &mut ExtractSummary,
) -> Result<(), ExtractError> {
    for member in members {
        clear_destination(&member, flags)?;
        fs::hard_link(source, &member)?;
        summary.hardlinks += 1;
    }
    Ok(())
}

impl ArchiveExtractor for CpioExtractor {
    fn extract(
        &self,
        payload: &mut dyn Read,
        destination: &Path,
        flags: ExtractFlags,
    ) -> Result<ExtractSummary, ExtractError> {
        fs::create_dir_all(destination).map_err(ExtractError::CouldNotCreateDestination)?;

        let mut summary = ExtractSummary::default();
        // Members of a hard link set seen before the member that carries the data.
        let mut pending_links: HashMap<(u32, u32, u32), Vec<PathBuf>> = HashMap::new();
        // Directory timestamps are restored last, creating entries inside them changes them.
        let mut directory_times = Vec::new();

        loop {
            let header = read_header(payload)?;
            let mut name = path_buffer("namesize", header.name_size)?;
            payload.read_exact(&mut name)?;
            skip(payload, padding(HEADER_SIZE + name.len()) as u64)?;
            if name.last() == Some(&0) {
                name.pop();
            }
            if name == TRAILER {
                break;
            }

            let data_padding = padding(header.file_size as usize) as u64;
            let Some(relative) = relative_path(&name)? else {
                skip(payload, u64::from(header.file_size) + data_padding)?;
                continue;
            };
            let path = destination.join(relative);
            if flags.create_leading_dirs {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
            }
            let mtime = filetime::FileTime::from_unix_time(i64::from(header.mtime), 0);

            match FileType::from_mode(header.mode) {
                FileType::Directory => {
                    tracing::trace!("extracting directory {}", path.display());
                    fs::create_dir_all(&path)?;
                    fs::set_permissions(&path, Permissions::from_mode(header.mode & 0o7777))?;
                    skip(payload, u64::from(header.file_size))?;
                    directory_times.push((path, mtime));
                    summary.directories += 1;
                }
                FileType::Symlink => {
                    let mut target = path_buffer("filesize", header.file_size)?;
                    payload.read_exact(&mut target)?;
                    tracing::trace!("extracting symlink {}", path.display());
                    clear_destination(&path, flags)?;
                    fs_err::os::unix::fs::symlink(OsStr::from_bytes(&target), &path)?;
                    if flags.restore_timestamps {
                        filetime::set_symlink_file_times(&path, mtime, mtime)?;
                    }
                    summary.symlinks += 1;
                }
                FileType::Regular if header.nlink > 1 && header.file_size == 0 => {
                    pending_links
                        .entry((header.dev_major, header.dev_minor, header.ino))
                        .or_default()
                        .push(path);
                }
                FileType::Regular => {
                    tracing::trace!("extracting file {}", path.display());
                    write_file(payload, &path, &header, flags)?;
                    if flags.restore_timestamps {
                        filetime::set_file_times(&path, mtime, mtime)?;
                    }
                    summary.files += 1;

                    if header.nlink > 1 {
                        let key = (header.dev_major, header.dev_minor, header.ino);
                        if let Some(members) = pending_links.remove(&key) {
                            link_members(&path, members, flags, &mut summary)?;
                        }
                    }
                }
                FileType::Other => {
                    tracing::info!("skipping special file {}", path.display());
                    skip(payload, u64::from(header.file_size))?;
                    summary.skipped += 1;
                }
            }
            skip(payload, data_padding)?;
        }

        // Hard link sets whose data never arrived are empty files.
        for (_, mut members) in pending_links {
            let first = members.remove(0);
            clear_destination(&first, flags)?;
            fs::File::create(&first)?;
            summary.files += 1;
            link_members(&first, members, flags, &mut summary)?;
        }

        if flags.restore_timestamps {
            for (path, mtime) in directory_times.into_iter().rev() {
                filetime::set_file_times(&path, mtime, mtime)?;
            }
        }

        Ok(summary)
    }
}
