//! Applies the owners recorded in a package to the installed files.

use std::collections::HashMap;
use std::path::Path;

use nix::unistd::{getgid, getuid, Group, User};
use parking_lot::Mutex;
use rpm_header::PackageMetadata;

use crate::{resolve_path, InstallError};

/// Maps the user and group names stored in a package to numeric ids.
pub trait NameResolver: Send + Sync {
    /// Returns the uid of `name`, or the fallback uid if the user is unknown or `None`.
    fn uid(&self, name: Option<&str>) -> u32;

    /// Returns the gid of `name`, or the fallback gid if the group is unknown or `None`.
    fn gid(&self, name: Option<&str>) -> u32;
}

/// Resolves names through the system user and group databases. Unknown names resolve to the uid
/// and gid of the current process. Lookups are cached.
#[derive(Debug, Default)]
pub struct SystemNameResolver {
    users: Mutex<HashMap<String, Option<u32>>>,
    groups: Mutex<HashMap<String, Option<u32>>>,
}

impl NameResolver for SystemNameResolver {
    fn uid(&self, name: Option<&str>) -> u32 {
        let Some(name) = name else {
            return getuid().as_raw();
        };
        let mut users = self.users.lock();
        let uid = *users.entry(name.to_string()).or_insert_with(|| {
            match User::from_name(name) {
                Ok(user) => user.map(|user| user.uid.as_raw()),
                Err(err) => {
                    tracing::debug!("failed to look up user '{name}': {err}");
                    None
                }
            }
        });
        uid.unwrap_or_else(|| {
            tracing::debug!("user '{name}' does not exist, using the current user");
            getuid().as_raw()
        })
    }

    fn gid(&self, name: Option<&str>) -> u32 {
        let Some(name) = name else {
            return getgid().as_raw();
        };
        let mut groups = self.groups.lock();
        let gid = *groups.entry(name.to_string()).or_insert_with(|| {
            match Group::from_name(name) {
                Ok(group) => group.map(|group| group.gid.as_raw()),
                Err(err) => {
                    tracing::debug!("failed to look up group '{name}': {err}");
                    None
                }
            }
        });
        gid.unwrap_or_else(|| {
            tracing::debug!("group '{name}' does not exist, using the current group");
            getgid().as_raw()
        })
    }
}

/// Changes the owner of every installed file of the package. Symbolic links themselves are
/// changed, not their targets.
///
/// Entries that do not exist below `root` are skipped. Failing to change an owner is not an
/// error, an unprivileged installation can only give files to itself. Returns the number of
/// entries whose owner was set.
pub fn apply_ownership(
    metadata: &PackageMetadata<'_>,
    root: &Path,
    resolver: &dyn NameResolver,
) -> Result<usize, InstallError> {
    let mut changed = 0;
    for file in metadata.files()? {
        let path = resolve_path(root, &file.path())?;
        if let Err(err) = path.symlink_metadata() {
            tracing::debug!("not changing the owner of {}: {err}", path.display());
            continue;
        }

        let uid = resolver.uid(file.user);
        let gid = resolver.gid(file.group);
        match std::os::unix::fs::lchown(&path, Some(uid), Some(gid)) {
            Ok(()) => changed += 1,
            Err(err) => tracing::warn!(
                "failed to change the owner of {} to {uid}:{gid}: {err}",
                path.display()
            ),
        }
    }
    Ok(changed)
}
