//! Virtual package store.
//!
//! Tracks every package installed into the virtual environment together with
//! its private backing directory:
//!
//! ```text
//! <root>/<package_id>/base-archive   copied package archive
//! <root>/<package_id>/package.json   persisted VirtualPackageRecord
//! <root>/<package_id>/data/...       per-user private data
//! <root>/<package_id>/cache/...      per-user cache
//! ```
//!
//! The backing path is derived only from a validated [`PackageId`], never
//! from a caller-supplied path.
//!
//! # Concurrency
//!
//! Records live in an `RwLock<BTreeMap>`, so [`PackageStore::list_all`] is a
//! point-in-time snapshot and reads never wait on I/O. Mutations of the same
//! package are serialized by a per-package guard; the map write lock itself is
//! only taken for the final insert/remove, after (or before) the file I/O.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::InstallError;
use crate::virt::inspector::PackageInspector;

/// Name of the copied archive inside a backing directory.
pub const ARCHIVE_FILE: &str = "base-archive";

/// Name of the persisted record inside a backing directory.
pub const RECORD_FILE: &str = "package.json";

const MAX_PACKAGE_ID_LEN: usize = 255;

/// A package identifier that is safe to use as a single path component.
///
/// Accepted: ASCII letters, digits, `.`, `_` and `-`; no leading dot and no
/// `..` sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageId(String);

impl PackageId {
    /// Validates `raw` as a package identifier.
    ///
    /// # Example
    ///
    /// ```
    /// use appvirt::virt::package::PackageId;
    ///
    /// assert!(PackageId::parse("com.demo.app").is_ok());
    /// assert!(PackageId::parse("../etc").is_err());
    /// assert!(PackageId::parse("com/demo").is_err());
    /// ```
    pub fn parse(raw: &str) -> Result<Self, InstallError> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_PACKAGE_ID_LEN
            && !raw.starts_with('.')
            && !raw.contains("..")
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(InstallError::InvalidPackageId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PackageId {
    type Error = InstallError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PackageId> for String {
    fn from(id: PackageId) -> Self {
        id.0
    }
}

impl Borrow<str> for PackageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PackageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata reported by the package inspector for an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PackageMetadata {
    pub package_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub version_name: String,
    #[serde(default)]
    pub version_code: i64,
}

/// One installed virtual package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VirtualPackageRecord {
    pub package_id: PackageId,
    pub display_name: String,
    pub version_name: String,
    pub version_code: i64,
    /// Milliseconds since the Unix epoch.
    pub install_timestamp: u64,
    /// Milliseconds since the Unix epoch; never earlier than `install_timestamp`.
    pub update_timestamp: u64,
    pub backing_path: PathBuf,
}

impl VirtualPackageRecord {
    pub fn archive_path(&self) -> PathBuf {
        self.backing_path.join(ARCHIVE_FILE)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Concurrent store of installed virtual packages.
pub struct PackageStore {
    root: PathBuf,
    packages: RwLock<BTreeMap<PackageId, VirtualPackageRecord>>,
    /// Serializes install and uninstall of the same package, including their
    /// file I/O. Readers never take it, and other packages never wait on it.
    guards: DashMap<PackageId, Arc<Mutex<()>>>,
}

impl PackageStore {
    /// Creates an empty store rooted at `root`. No I/O happens until the first install.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            packages: RwLock::new(BTreeMap::new()),
            guards: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic backing directory of `package_id`.
    pub fn backing_path(&self, package_id: &PackageId) -> PathBuf {
        self.root.join(package_id.as_str())
    }

    /// Installs or updates `package_id` from the archive at `archive_path`.
    ///
    /// The archive and the new `package.json` are both written to temp files
    /// inside the backing directory before either is renamed into place, so a
    /// failed write leaves a previous install untouched. A reinstall keeps the
    /// original `install_timestamp` and updates version and display fields in
    /// place.
    ///
    /// # Errors
    ///
    /// - [`InstallError::ArchiveUnreadable`] if the archive cannot be opened
    /// - [`InstallError::CopyFailed`] if the backing path cannot be written
    /// - [`InstallError::VersionDowngrade`] if `metadata.version_code` is lower than the installed one
    pub fn install(
        &self,
        package_id: &PackageId,
        metadata: &PackageMetadata,
        archive_path: &Path,
    ) -> Result<VirtualPackageRecord, InstallError> {
        let guard = self.guard(package_id);
        let _held = guard.lock().unwrap_or_else(PoisonError::into_inner);

        let existing = self.query(package_id.as_str());
        if let Some(existing) = &existing {
            if metadata.version_code < existing.version_code {
                return Err(InstallError::VersionDowngrade {
                    package_id: package_id.to_string(),
                    installed: existing.version_code,
                    requested: metadata.version_code,
                });
            }
        }

        let backing_path = self.backing_path(package_id);
        let staged_archive = stage_archive(archive_path, &backing_path)?;

        let now = now_millis();
        let record = match &existing {
            Some(existing) => VirtualPackageRecord {
                display_name: metadata.display_name.clone(),
                version_name: metadata.version_name.clone(),
                version_code: metadata.version_code,
                update_timestamp: now.max(existing.install_timestamp),
                ..existing.clone()
            },
            None => VirtualPackageRecord {
                package_id: package_id.clone(),
                display_name: metadata.display_name.clone(),
                version_name: metadata.version_name.clone(),
                version_code: metadata.version_code,
                install_timestamp: now,
                update_timestamp: now,
                backing_path: backing_path.clone(),
            },
        };
        let staged_record = stage_record(&record)?;

        // Record first: if it cannot be renamed the old archive is still in place.
        persist(staged_record, &backing_path.join(RECORD_FILE))?;
        if let Err(e) = persist(staged_archive, &record.archive_path()) {
            restore_record_file(existing.as_ref(), &backing_path);
            return Err(e);
        }

        self.packages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(package_id.clone(), record.clone());

        tracing::info!(
            "Installed {} {} (version code {})",
            record.package_id,
            record.version_name,
            record.version_code
        );
        Ok(record)
    }

    /// Removes `package_id` and deletes its backing directory.
    ///
    /// Returns `false` if the package is not installed. Killing the package's
    /// processes is the caller's job and must happen first.
    pub fn uninstall(&self, package_id: &str) -> bool {
        let Ok(package_id) = PackageId::parse(package_id) else {
            return false;
        };

        let removed = {
            let guard = self.guard(&package_id);
            let _held = guard.lock().unwrap_or_else(PoisonError::into_inner);
            self.remove_locked(&package_id)
        };
        // Nobody else holds the guard: drop it so the map does not grow forever.
        self.guards
            .remove_if(&package_id, |_, guard| Arc::strong_count(guard) == 1);
        removed
    }

    fn remove_locked(&self, package_id: &PackageId) -> bool {
        let removed = self
            .packages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(package_id);

        let Some(record) = removed else {
            return false;
        };

        match fs::remove_dir_all(&record.backing_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to delete backing path {}: {}",
                record.backing_path.display(),
                e
            ),
        }

        tracing::info!("Uninstalled {}", package_id);
        true
    }

    pub fn query(&self, package_id: &str) -> Option<VirtualPackageRecord> {
        self.packages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(package_id)
            .cloned()
    }

    pub fn contains(&self, package_id: &str) -> bool {
        self.packages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(package_id)
    }

    /// Point-in-time snapshot of every record, ordered by package id.
    pub fn list_all(&self) -> Vec<VirtualPackageRecord> {
        self.packages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.packages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restores records from an existing storage root.
    ///
    /// Each subdirectory holding a `base-archive` is loaded from its
    /// `package.json`, or re-inspected when that file is missing or stale.
    /// Directories that fail both are skipped with a warning. Returns the
    /// number of packages loaded.
    pub fn load_existing(&self, inspector: &dyn PackageInspector) -> usize {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!("Cannot scan {}: {}", self.root.display(), e);
                return 0;
            }
        };

        let mut loaded = BTreeMap::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(package_id) = PackageId::parse(name) else {
                continue;
            };
            if !dir.join(ARCHIVE_FILE).is_file() {
                continue;
            }

            match self.restore_record(&package_id, &dir, inspector) {
                Some(record) => {
                    loaded.insert(package_id, record);
                }
                None => tracing::warn!("Skipping unreadable package directory {}", dir.display()),
            }
        }

        let count = loaded.len();
        self.packages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(loaded);
        tracing::info!("Loaded {} virtual package(s) from {}", count, self.root.display());
        count
    }

    fn restore_record(
        &self,
        package_id: &PackageId,
        dir: &Path,
        inspector: &dyn PackageInspector,
    ) -> Option<VirtualPackageRecord> {
        if let Ok(content) = fs::read_to_string(dir.join(RECORD_FILE)) {
            match serde_json::from_str::<VirtualPackageRecord>(&content) {
                Ok(mut record) if record.package_id == *package_id => {
                    record.backing_path = dir.to_path_buf();
                    return Some(record);
                }
                Ok(_) => tracing::warn!("{} names a different package", dir.join(RECORD_FILE).display()),
                Err(e) => tracing::debug!("Ignoring corrupt {}: {}", dir.join(RECORD_FILE).display(), e),
            }
        }

        let metadata = inspector.parse_archive(&dir.join(ARCHIVE_FILE))?;
        if metadata.package_id != package_id.as_str() {
            return None;
        }
        let timestamp = fs::metadata(dir)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or_else(now_millis);
        Some(VirtualPackageRecord {
            package_id: package_id.clone(),
            display_name: metadata.display_name,
            version_name: metadata.version_name,
            version_code: metadata.version_code,
            install_timestamp: timestamp,
            update_timestamp: timestamp,
            backing_path: dir.to_path_buf(),
        })
    }

    fn guard(&self, package_id: &PackageId) -> Arc<Mutex<()>> {
        Arc::clone(self.guards.entry(package_id.clone()).or_default().value())
    }
}

/// Copies the archive into a temp file inside `backing_path`.
fn stage_archive(archive_path: &Path, backing_path: &Path) -> Result<NamedTempFile, InstallError> {
    let mut source = File::open(archive_path)
        .map_err(|_| InstallError::ArchiveUnreadable(archive_path.to_path_buf()))?;

    fs::create_dir_all(backing_path).map_err(|source| InstallError::CopyFailed {
        path: backing_path.to_path_buf(),
        source,
    })?;

    let copy_failed = |source: io::Error| InstallError::CopyFailed {
        path: backing_path.join(ARCHIVE_FILE),
        source,
    };
    let mut staged = NamedTempFile::new_in(backing_path).map_err(copy_failed)?;
    io::copy(&mut source, &mut staged).map_err(copy_failed)?;
    staged.flush().map_err(copy_failed)?;
    Ok(staged)
}

fn stage_record(record: &VirtualPackageRecord) -> Result<NamedTempFile, InstallError> {
    let copy_failed = |source: io::Error| InstallError::CopyFailed {
        path: record.backing_path.join(RECORD_FILE),
        source,
    };

    let json = serde_json::to_vec_pretty(record).map_err(|e| copy_failed(e.into()))?;
    let mut staged = NamedTempFile::new_in(&record.backing_path).map_err(copy_failed)?;
    staged.write_all(&json).map_err(copy_failed)?;
    staged.flush().map_err(copy_failed)?;
    Ok(staged)
}

fn persist(staged: NamedTempFile, target: &Path) -> Result<(), InstallError> {
    staged
        .persist(target)
        .map_err(|e| InstallError::CopyFailed {
            path: target.to_path_buf(),
            source: e.error,
        })?;
    Ok(())
}

/// Puts `package.json` back the way it was before a failed install.
fn restore_record_file(previous: Option<&VirtualPackageRecord>, backing_path: &Path) {
    let target = backing_path.join(RECORD_FILE);
    let restored = match previous {
        Some(previous) => stage_record(previous).and_then(|staged| persist(staged, &target)),
        None => fs::remove_file(&target).map_err(|source| InstallError::CopyFailed {
            path: target.clone(),
            source,
        }),
    };
    if let Err(e) = restored {
        tracing::warn!("Failed to restore {}: {}", target.display(), e);
    }
}
