//! The header store keeps a copy of the lead and headers of every installed package, so installed
//! packages can be queried without a package database.

use std::fs::{File, Permissions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use fs_err as fs;
use rpm_header::{Nevra, PackageMetadata, TagStore};

use crate::{ConflictError, InstallError};

/// The location of the header store relative to the installation root.
pub const HEADER_STORE_DIR: &str = "usr/lib/sysimage/rpm-headers";

/// A directory with one `<name>-<version>-<release>.<arch>.rpm` file per installed package. Each
/// file contains the package up to the start of its payload.
#[derive(Debug, Clone)]
pub struct HeaderStore {
    dir: PathBuf,
}

impl HeaderStore {
    /// Returns the header store of the installation at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join(HEADER_STORE_DIR),
        }
    }

    /// The directory of the store.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Copies the first `payload_start` bytes of `package` into the store. Fails if a package with
    /// the same identity is already stored. The position of `package` is left at
    /// `payload_start`.
    pub fn install(
        &self,
        package: &mut File,
        payload_start: u64,
        nevra: &Nevra,
    ) -> Result<PathBuf, InstallError> {
        fs::create_dir_all(&self.dir)
            .and_then(|()| fs::set_permissions(&self.dir, Permissions::from_mode(0o755)))
            .map_err(|err| InstallError::Io(String::from("creating the header store"), err))?;

        let path = self.dir.join(nevra.file_name());
        let mut destination = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(ConflictError::AlreadyInstalled(path).into())
            }
            Err(err) => return Err(InstallError::HeaderStore(path, err)),
        };

        let result = copy_headers(package, &mut destination, payload_start);
        drop(destination);
        if let Err(err) = result {
            if let Err(remove_err) = fs::remove_file(&path) {
                tracing::warn!("failed to remove {}: {remove_err}", path.display());
            }
            return Err(InstallError::HeaderStore(path, err));
        }

        tracing::debug!("stored the headers of {nevra} in {}", path.display());
        Ok(path)
    }

    /// Lists the files in the store, sorted by name. A store that does not exist is empty.
    pub fn entries(&self) -> Result<Vec<PathBuf>, InstallError> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(InstallError::Io(
                    String::from("reading the header store"),
                    err,
                ))
            }
        };

        let mut entries = read_dir
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| InstallError::Io(String::from("reading the header store"), err))?;
        entries.sort();
        Ok(entries)
    }

    /// Returns the files in the store whose package name is `name`. Files that cannot be decoded
    /// are skipped with a warning.
    pub fn find(&self, name: &str) -> Result<Vec<PathBuf>, InstallError> {
        let mut found = Vec::new();
        for path in self.entries()? {
            let store = match TagStore::open(&path) {
                Ok(store) => store,
                Err(err) => {
                    tracing::warn!("skipping {}: {err}", path.display());
                    continue;
                }
            };
            match PackageMetadata::new(&store).name() {
                Ok(Some(stored)) if stored == name => found.push(path),
                Ok(_) => {}
                Err(err) => tracing::warn!("skipping {}: {err}", path.display()),
            }
        }
        Ok(found)
    }
}

fn copy_headers(
    package: &mut File,
    destination: &mut impl Write,
    payload_start: u64,
) -> io::Result<()> {
    package.seek(SeekFrom::Start(0))?;
    let copied = io::copy(&mut Read::take(&*package, payload_start), destination);
    package.seek(SeekFrom::Start(payload_start))?;
    if copied? != payload_start {
        return Err(io::Error::new(
            ErrorKind::UnexpectedEof,
            "the package is shorter than its headers",
        ));
    }
    Ok(())
}
