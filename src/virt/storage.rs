//! Per-user private storage for virtual packages.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::virt::package::PackageId;

/// Provides deterministic, create-on-demand directories per `(package, user)`.
pub trait StorageProvider: Send + Sync {
    /// Where the data directory of `(package, user)` lives. Touches nothing on disk.
    fn data_path(&self, package_id: &PackageId, user_id: u32) -> PathBuf;
    fn data_dir(&self, package_id: &PackageId, user_id: u32) -> io::Result<PathBuf>;
    fn cache_dir(&self, package_id: &PackageId, user_id: u32) -> io::Result<PathBuf>;
    fn external_dir(&self, package_id: &PackageId, user_id: u32) -> io::Result<PathBuf>;
    /// Deletes every directory of `(package, user)`. Missing directories are not an error.
    fn wipe(&self, package_id: &PackageId, user_id: u32) -> io::Result<()>;
}

/// Storage laid out inside each package's backing directory:
///
/// ```text
/// <root>/<package_id>/data/user_<id>
/// <root>/<package_id>/cache/user_<id>
/// <root>/<package_id>/external/user_<id>
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, package_id: &PackageId, kind: &str, user_id: u32) -> PathBuf {
        self.root
            .join(package_id.as_str())
            .join(kind)
            .join(format!("user_{}", user_id))
    }

    fn ensure(&self, package_id: &PackageId, kind: &str, user_id: u32) -> io::Result<PathBuf> {
        let dir = self.user_dir(package_id, kind, user_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl StorageProvider for DirectoryStorage {
    fn data_path(&self, package_id: &PackageId, user_id: u32) -> PathBuf {
        self.user_dir(package_id, "data", user_id)
    }

    fn data_dir(&self, package_id: &PackageId, user_id: u32) -> io::Result<PathBuf> {
        self.ensure(package_id, "data", user_id)
    }

    fn cache_dir(&self, package_id: &PackageId, user_id: u32) -> io::Result<PathBuf> {
        self.ensure(package_id, "cache", user_id)
    }

    fn external_dir(&self, package_id: &PackageId, user_id: u32) -> io::Result<PathBuf> {
        self.ensure(package_id, "external", user_id)
    }

    fn wipe(&self, package_id: &PackageId, user_id: u32) -> io::Result<()> {
        for kind in ["data", "cache", "external"] {
            match fs::remove_dir_all(self.user_dir(package_id, kind, user_id)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
