//! A typed view of the package attributes and the per-file arrays stored in a [`TagStore`].

use std::borrow::Cow;
use std::ffi::OsStr;
use std::fmt;
use std::fmt::Formatter;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use once_cell::unsync::OnceCell;

use crate::store::TagStore;
use crate::{tag, HeaderError};

/// The name, version, release and architecture that identify a package.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Nevra {
    /// The name of the package.
    pub name: String,
    /// The version of the package.
    pub version: String,
    /// The release of the package.
    pub release: String,
    /// The architecture the package was built for.
    pub arch: String,
}

impl Nevra {
    /// Returns the file name used for this package, `name-version-release.arch.rpm`.
    pub fn file_name(&self) -> String {
        format!("{self}.rpm")
    }
}

impl fmt::Display for Nevra {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}.{}",
            self.name, self.version, self.release, self.arch
        )
    }
}

/// The flags stored for every file of a package.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct FileFlags(u32);

impl FileFlags {
    /// The file is a configuration file.
    pub const CONFIG: FileFlags = FileFlags(1 << 0);
    /// The file is documentation.
    pub const DOC: FileFlags = FileFlags(1 << 1);
    /// The file is owned by the package but has no content in the payload.
    pub const GHOST: FileFlags = FileFlags(1 << 6);

    /// Constructs flags from their raw value. Unknown bits are preserved.
    pub const fn from_bits(bits: u32) -> Self {
        FileFlags(bits)
    }

    /// Returns the raw value.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if all bits of `other` are set.
    pub const fn contains(self, other: FileFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FileFlags {
    type Output = FileFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        FileFlags(self.0 | rhs.0)
    }
}

/// The kind of a file entry, derived from the file type bits of its mode.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum FileType {
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// A regular file.
    Regular,
    /// Any other kind of file (devices, fifos, sockets).
    Other,
}

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFLNK: u32 = 0o120_000;
const S_IFREG: u32 = 0o100_000;

impl FileType {
    /// Determines the file type from a mode.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            S_IFREG => FileType::Regular,
            _ => FileType::Other,
        }
    }
}

/// A single file entry of a package, assembled from the per-file arrays.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FileRecord<'a> {
    /// The index of the file in the per-file arrays.
    pub index: usize,
    /// The directory of the file, including the trailing slash.
    pub dir_name: &'a [u8],
    /// The name of the file within its directory.
    pub base_name: &'a [u8],
    /// The mode, including the file type bits.
    pub mode: u32,
    /// The size of the file content in bytes.
    pub size: u64,
    /// The flags of the file.
    pub flags: FileFlags,
    /// The name of the owning user, if stored.
    pub user: Option<&'a str>,
    /// The name of the owning group, if stored.
    pub group: Option<&'a str>,
    /// The target of a symbolic link, if stored.
    pub link_to: Option<&'a [u8]>,
    /// The inode number used to group hard links, if stored.
    pub inode: Option<u64>,
    /// The number of hard links, if stored.
    pub nlink: Option<u32>,
}

impl FileRecord<'_> {
    /// The absolute path of the file inside the package.
    pub fn path(&self) -> PathBuf {
        let mut bytes = Vec::with_capacity(self.dir_name.len() + self.base_name.len());
        bytes.extend_from_slice(self.dir_name);
        bytes.extend_from_slice(self.base_name);
        PathBuf::from(OsStr::from_bytes(&bytes))
    }

    /// The kind of this file.
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    /// The permission bits of the mode, including the setuid, setgid and sticky bits.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Returns true if the file is a ghost entry.
    pub fn is_ghost(&self) -> bool {
        self.flags.contains(FileFlags::GHOST)
    }
}

fn non_empty_str<'a>(bytes: Option<&&'a [u8]>) -> Option<&'a str> {
    bytes
        .copied()
        .filter(|bytes| !bytes.is_empty())
        .and_then(|bytes| std::str::from_utf8(bytes).ok())
}

/// A view over the well known tags of a package.
///
/// String arrays that are consulted per file are scanned once and cached in the view.
pub struct PackageMetadata<'a> {
    store: &'a TagStore,
    base_names: OnceCell<Vec<&'a [u8]>>,
    dir_names: OnceCell<Vec<&'a [u8]>>,
    user_names: OnceCell<Vec<&'a [u8]>>,
    group_names: OnceCell<Vec<&'a [u8]>>,
    link_targets: OnceCell<Vec<&'a [u8]>>,
}

impl<'a> PackageMetadata<'a> {
    /// Constructs a view over `store`.
    pub fn new(store: &'a TagStore) -> Self {
        Self {
            store,
            base_names: OnceCell::new(),
            dir_names: OnceCell::new(),
            user_names: OnceCell::new(),
            group_names: OnceCell::new(),
            link_targets: OnceCell::new(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &'a TagStore {
        self.store
    }

    fn string(&self, tag: i32) -> Result<Option<Cow<'a, str>>, HeaderError> {
        Ok(self
            .store
            .get_bytes(tag, 0)?
            .map(String::from_utf8_lossy))
    }

    fn uint(&self, tag: i32, index: u32) -> Result<Option<u64>, HeaderError> {
        Ok(self.store.get(tag, index)?.and_then(|value| value.as_uint()))
    }

    fn cached<'c>(
        &self,
        cell: &'c OnceCell<Vec<&'a [u8]>>,
        tag: i32,
    ) -> Result<&'c [&'a [u8]], HeaderError> {
        cell.get_or_try_init(|| self.store.string_array(tag))
            .map(Vec::as_slice)
    }

    /// The name of the package.
    pub fn name(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::NAME)
    }

    /// The version of the package.
    pub fn version(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::VERSION)
    }

    /// The release of the package.
    pub fn release(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::RELEASE)
    }

    /// The one line summary.
    pub fn summary(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::SUMMARY)
    }

    /// The long description.
    pub fn description(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::DESCRIPTION)
    }

    /// The time at which the package was built.
    pub fn build_time(&self) -> Result<Option<DateTime<Utc>>, HeaderError> {
        Ok(self
            .uint(tag::BUILDTIME, 0)?
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0)))
    }

    /// The host on which the package was built.
    pub fn build_host(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::BUILDHOST)
    }

    /// The total size of the files in the package.
    pub fn size(&self) -> Result<Option<u64>, HeaderError> {
        self.uint(tag::SIZE, 0)
    }

    /// The vendor of the package.
    pub fn vendor(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::VENDOR)
    }

    /// The license of the package.
    pub fn license(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::LICENSE)
    }

    /// The packager.
    pub fn packager(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::PACKAGER)
    }

    /// The group the package belongs to.
    pub fn group(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::GROUP)
    }

    /// The upstream URL.
    pub fn url(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::URL)
    }

    /// The architecture of the package.
    pub fn arch(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::ARCH)
    }

    /// The name of the source package this package was built from. Absent for source packages.
    pub fn source_rpm(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::SOURCERPM)
    }

    /// The relocatable prefixes of the package.
    pub fn prefixes(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::PREFIXES)
    }

    /// The name of the compressor used for the payload.
    pub fn payload_compressor(&self) -> Result<Option<Cow<'a, str>>, HeaderError> {
        self.string(tag::PAYLOADCOMPRESSOR)
    }

    /// Returns true if this is a source package.
    pub fn is_source_package(&self) -> bool {
        self.store.entry(tag::SOURCERPM).is_none()
    }

    /// The identity of the package. Missing fields are empty.
    pub fn nevra(&self) -> Result<Nevra, HeaderError> {
        let field = |value: Option<Cow<'a, str>>| value.map(Cow::into_owned).unwrap_or_default();
        Ok(Nevra {
            name: field(self.name()?),
            version: field(self.version()?),
            release: field(self.release()?),
            arch: field(self.arch()?),
        })
    }

    /// The number of files in the package.
    pub fn file_count(&self) -> usize {
        self.store.count(tag::BASENAMES) as usize
    }

    /// The base names of all files.
    pub fn base_names(&self) -> Result<&[&'a [u8]], HeaderError> {
        self.cached(&self.base_names, tag::BASENAMES)
    }

    /// The directory names referenced by the files.
    pub fn dir_names(&self) -> Result<&[&'a [u8]], HeaderError> {
        self.cached(&self.dir_names, tag::DIRNAMES)
    }

    /// The index into [`PackageMetadata::dir_names`] of file `index`.
    pub fn dir_index(&self, index: usize) -> Result<Option<i64>, HeaderError> {
        self.store.get_int(tag::DIRINDEXES, index as u32)
    }

    /// The directory name of file `index`.
    pub fn dir_name(&self, index: usize) -> Result<&'a [u8], HeaderError> {
        let dir_index = self.dir_index(index)?.unwrap_or(-1);
        let dir_names = self.dir_names()?;
        usize::try_from(dir_index)
            .ok()
            .and_then(|idx| dir_names.get(idx).copied())
            .ok_or(HeaderError::InvalidDirIndex { index, dir_index })
    }

    /// Assembles the record of file `index`.
    pub fn file(&self, index: usize) -> Result<FileRecord<'a>, HeaderError> {
        let dir_name = self.dir_name(index)?;
        let idx = index as u32;
        let base_name = self.base_names()?.get(index).copied().unwrap_or_default();
        let user = non_empty_str(self.cached(&self.user_names, tag::FILEUSERNAME)?.get(index));
        let group = non_empty_str(self.cached(&self.group_names, tag::FILEGROUPNAME)?.get(index));
        let link_to = self
            .cached(&self.link_targets, tag::FILELINKTOS)?
            .get(index)
            .copied()
            .filter(|target| !target.is_empty());

        Ok(FileRecord {
            index,
            dir_name,
            base_name,
            mode: self.uint(tag::FILEMODES, idx)?.unwrap_or(0) as u32,
            size: self.uint(tag::FILESIZES, idx)?.unwrap_or(0),
            flags: FileFlags::from_bits(self.uint(tag::FILEFLAGS, idx)?.unwrap_or(0) as u32),
            user,
            group,
            link_to,
            inode: self.uint(tag::FILEINODES, idx)?,
            nlink: self.uint(tag::FILENLINKS, idx)?.map(|n| n as u32),
        })
    }

    /// Assembles the records of all files.
    pub fn files(&self) -> Result<Vec<FileRecord<'a>>, HeaderError> {
        (0..self.file_count()).map(|idx| self.file(idx)).collect()
    }
}
