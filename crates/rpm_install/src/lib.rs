#![deny(missing_docs)]

//! `rpm_install` installs RPM packages onto a file system.
//!
//! Packages whose payload is laid out for reflinking are installed by cloning every file straight
//! out of the package image (see [`plan`] and [`apply`]). All other packages are decompressed and
//! extracted with an [`ArchiveExtractor`]. In both cases the owners recorded in the package are
//! applied afterwards and a copy of the package headers is kept in the [`HeaderStore`].

pub mod apply;
pub mod backup;
pub mod cpio;
pub mod header_store;
pub mod owner;
pub mod payload;
pub mod plan;

use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub use apply::{apply_plan, ApplyOptions, ApplySummary, CloneMethod};
pub use cpio::{ArchiveExtractor, CpioExtractor, ExtractError, ExtractFlags, ExtractSummary};
pub use header_store::HeaderStore;
pub use owner::{NameResolver, SystemNameResolver};
pub use payload::PayloadError;
pub use plan::{InstallAction, InstallPlan, PlanOptions, SkipReason};

use rpm_header::{HeaderError, Nevra, PackageMetadata, TagStore, REFLINK_PAYLOAD_MAGIC};
use tracing::instrument;

/// An error that can occur when installing a package.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// The package headers could not be decoded.
    #[error(transparent)]
    Header(#[from] HeaderError),

    /// An IO error occurred.
    #[error("unexpected io operation while {0}")]
    Io(String, #[source] std::io::Error),

    /// The installation conflicts with the state of the file system.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// The content of a file could not be transferred from the package.
    #[error("failed to {method} the contents of '{}'", path.display())]
    FailedToClone {
        /// The file that was being created.
        path: PathBuf,
        /// The configured clone method.
        method: CloneMethod,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The payload could not be decompressed.
    #[error("failed to decompress the payload")]
    Payload(#[from] PayloadError),

    /// The payload could not be extracted.
    #[error("failed to extract the payload")]
    Extract(#[from] ExtractError),

    /// The package headers could not be written to the header store.
    #[error("failed to write '{}' to the header store", .0.display())]
    HeaderStore(PathBuf, #[source] std::io::Error),

    /// A path recorded in the package points outside of the installation root.
    #[error("'{}' points outside of the installation root", .0.display())]
    PathEscapesRoot(PathBuf),
}

/// An installation step that cannot be carried out without overwriting or losing something.
#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    /// The destination already exists and `force` is not set.
    #[error("'{}' already exists", .0.display())]
    AlreadyExists(PathBuf),

    /// A hard link refers to a file that does not exist.
    #[error("the hard link source '{}' does not exist", .0.display())]
    MissingHardlinkSource(PathBuf),

    /// A hard link refers to a file that is excluded from the installation.
    #[error(
        "'{}' is a hard link to '{}' which is not installed",
        path.display(),
        source_path.display()
    )]
    SkippedSource {
        /// The hard link.
        path: PathBuf,
        /// The file it links to.
        source_path: PathBuf,
    },

    /// The header store already contains this package.
    #[error("the package is already installed ('{}' exists)", .0.display())]
    AlreadyInstalled(PathBuf),
}

/// Resolves an absolute package path against the installation root. Paths with `..` components
/// are rejected, they could point anywhere on the file system.
pub(crate) fn resolve_path(root: &Path, package_path: &Path) -> Result<PathBuf, InstallError> {
    let mut path = root.to_path_buf();
    for component in package_path.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(InstallError::PathEscapesRoot(package_path.to_path_buf()))
            }
        }
    }
    Ok(path)
}

/// Additional options to pass to [`install_package`]. Using [`InstallOptions::default`] installs
/// into `/` with reflinks, which is what you want in most cases.
#[derive(Default, Clone)]
pub struct InstallOptions {
    /// The directory the package is installed into. Defaults to `/`.
    pub root: Option<PathBuf>,

    /// Replace existing files instead of failing.
    pub force: bool,

    /// Only install entries whose directory starts with this prefix. Only honored for reflink
    /// packages.
    pub only_prefix: Option<PathBuf>,

    /// Only touch the file system, do not record the package in the header store.
    pub just_fs: bool,

    /// How file contents are transferred from the package into the installed files.
    pub clone_method: CloneMethod,

    /// Whether the installation runs with root privileges. If this is `None` it is determined from
    /// the uid of the process.
    pub privileged: Option<bool>,

    /// Maps user and group names to ids. If this is `None` the [`SystemNameResolver`] is used.
    pub name_resolver: Option<Arc<dyn NameResolver>>,

    /// Extracts regular payloads. If this is `None` the [`CpioExtractor`] is used.
    pub extractor: Option<Arc<dyn ArchiveExtractor>>,
}

/// How the files of a package were put in place.
#[derive(Debug)]
pub enum InstalledContent {
    /// The files were cloned out of a reflink payload.
    Reflinked(ApplySummary),

    /// The payload was decompressed and extracted.
    Extracted {
        /// The configuration files that were moved out of the way.
        backups: Vec<PathBuf>,
        /// What the extractor did.
        summary: ExtractSummary,
    },
}

/// The result of [`install_package`].
#[derive(Debug)]
pub struct InstallSummary {
    /// The identity of the installed package.
    pub nevra: Nevra,

    /// The copy of the package headers in the header store, unless `just_fs` was set.
    pub header_path: Option<PathBuf>,

    /// How the files were put in place.
    pub content: InstalledContent,

    /// The number of entries whose owner was set.
    pub owned: usize,
}

/// Installs the package at `path`.
///
/// The headers are decoded and, unless [`InstallOptions::just_fs`] is set, copied to the header
/// store. If the payload is laid out for reflinking the files are planned and cloned out of the
/// package. Otherwise existing configuration files are backed up and the payload is decompressed
/// and extracted: binary packages into the installation root, source packages into the current
/// directory. Finally the owners of all files are set.
#[instrument(skip_all, fields(package = %path.display()))]
pub fn install_package(path: &Path, options: &InstallOptions) -> Result<InstallSummary, InstallError> {
    let root = options.root.clone().unwrap_or_else(|| PathBuf::from("/"));
    let (mut file, _) = fs_err::File::open(path)
        .map_err(|err| InstallError::Io(String::from("opening the package"), err))?
        .into_parts();

    let store = TagStore::read(&mut file)?;
    let metadata = PackageMetadata::new(&store);
    let nevra = metadata.nevra()?;
    let payload_offset = store.payload_offset();
    tracing::debug!("installing {nevra}, payload starts at {payload_offset}");

    // Nothing is touched before every recorded path is known to stay below the root.
    for file in metadata.files()? {
        resolve_path(&root, &file.path())?;
    }

    let header_path = if options.just_fs {
        None
    } else {
        Some(HeaderStore::new(&root).install(&mut file, payload_offset, &nevra)?)
    };

    let mut magic = [0u8; 4];
    let is_reflink = match file.read_exact(&mut magic) {
        Ok(()) => u32::from_be_bytes(magic) == REFLINK_PAYLOAD_MAGIC,
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => false,
        Err(err) => return Err(InstallError::Io(String::from("reading the payload"), err)),
    };

    let content = if is_reflink {
        let plan_options = PlanOptions {
            only_prefix: options.only_prefix.clone(),
            privileged: options
                .privileged
                .unwrap_or_else(|| nix::unistd::getuid().is_root()),
        };
        let plan = plan::plan(&metadata, payload_offset + 4, &plan_options)?;
        let apply_options = ApplyOptions {
            force: options.force,
            clone_method: options.clone_method,
        };
        InstalledContent::Reflinked(apply_plan(&plan, &file, &root, &apply_options)?)
    } else {
        file.seek(SeekFrom::Start(payload_offset))
            .map_err(|err| InstallError::Io(String::from("seeking to the payload"), err))?;
        let backups = backup::backup_config_files(&metadata, &root)?;

        let compressor = metadata.payload_compressor()?;
        let mut payload = payload::decompress(BufReader::new(&file), compressor.as_deref(), true)?;
        let destination = if metadata.is_source_package() {
            std::env::current_dir().map_err(|err| {
                InstallError::Io(String::from("determining the current directory"), err)
            })?
        } else {
            root.clone()
        };
        let flags = ExtractFlags {
            restore_timestamps: true,
            create_leading_dirs: true,
            replace_via_rename: true,
        };
        let summary = match &options.extractor {
            Some(extractor) => extractor.extract(&mut payload, &destination, flags)?,
            None => CpioExtractor.extract(&mut payload, &destination, flags)?,
        };
        InstalledContent::Extracted { backups, summary }
    };

    let owned = match &options.name_resolver {
        Some(resolver) => owner::apply_ownership(&metadata, &root, resolver.as_ref())?,
        None => owner::apply_ownership(&metadata, &root, &SystemNameResolver::default())?,
    };

    Ok(InstallSummary {
        nevra,
        header_path,
        content,
        owned,
    })
}
