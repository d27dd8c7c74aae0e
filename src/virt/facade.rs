//! Virtualization facade.
//!
//! The single entry point interceptors and front-ends use to install,
//! uninstall, launch, kill and query virtual apps. It composes the package
//! store and the process registry and enforces the invariant neither of them
//! can see on its own: a package is never uninstalled while a process of it
//! is still tracked. Install, uninstall and launch of the same package run
//! under one per-package lock, so a launch cannot slip in between the kills
//! and the removal of an uninstall.
//!
//! Every operation comes in two forms. `try_*` methods return
//! `Result<_, VirtError>`; the plain methods log the error and return a
//! `bool` or `Option`, which is what interceptors running inside a host call
//! want.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use crate::error::{InstallError, VirtError};
use crate::virt::identity::VirtualIdentity;
use crate::virt::inspector::PackageInspector;
use crate::virt::launcher::LaunchRequest;
use crate::virt::package::{PackageId, PackageStore, VirtualPackageRecord};
use crate::virt::process::{ProcessKey, ProcessRegistry, StartOutcome, VirtualProcessRecord};
use crate::virt::storage::StorageProvider;

/// User namespace that gets storage created at install time.
pub const PRIMARY_USER: u32 = 0;

pub struct VirtualizationFacade {
    packages: Arc<PackageStore>,
    processes: Arc<ProcessRegistry>,
    storage: Arc<dyn StorageProvider>,
    inspector: Arc<dyn PackageInspector>,
    lifecycle: DashMap<PackageId, Arc<Mutex<()>>>,
}

/// A pending process record that is dropped again unless the launch commits.
///
/// Also runs when the launcher panics, so a failed spawn never leaves a
/// record that later launches would attach to.
struct PendingLaunch<'a> {
    processes: &'a ProcessRegistry,
    key: ProcessKey,
    launch_id: u64,
    committed: bool,
}

impl Drop for PendingLaunch<'_> {
    fn drop(&mut self) {
        if !self.committed && self.processes.abandon(&self.key, self.launch_id) {
            tracing::debug!(
                "Dropped pending record of {}:{}",
                self.key.package_id,
                self.key.user_id
            );
        }
    }
}

impl VirtualizationFacade {
    pub fn new(
        packages: Arc<PackageStore>,
        processes: Arc<ProcessRegistry>,
        storage: Arc<dyn StorageProvider>,
        inspector: Arc<dyn PackageInspector>,
    ) -> Self {
        Self {
            packages,
            processes,
            storage,
            inspector,
            lifecycle: DashMap::new(),
        }
    }

    pub fn packages(&self) -> &Arc<PackageStore> {
        &self.packages
    }

    pub fn processes(&self) -> &Arc<ProcessRegistry> {
        &self.processes
    }

    pub fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    pub fn inspector(&self) -> &Arc<dyn PackageInspector> {
        &self.inspector
    }

    /// Installs (or updates) the package contained in the archive at `archive_path`.
    ///
    /// The archive must exist and be readable by the package inspector. The
    /// primary user's data and cache directories are created before the
    /// package is committed; if either step fails a fresh package leaves
    /// nothing behind.
    pub fn try_install_app(&self, archive_path: &Path) -> Result<VirtualPackageRecord, VirtError> {
        if !archive_path.is_file() {
            return Err(InstallError::ArchiveUnreadable(archive_path.to_path_buf()).into());
        }

        let metadata = self
            .inspector
            .parse_archive(archive_path)
            .ok_or_else(|| InstallError::ArchiveUnreadable(archive_path.to_path_buf()))?;
        let package_id = PackageId::parse(&metadata.package_id)?;

        self.exclusive(&package_id, || -> Result<VirtualPackageRecord, VirtError> {
            let fresh = !self.packages.contains(package_id.as_str());

            let prepared = self
                .storage
                .data_dir(&package_id, PRIMARY_USER)
                .and_then(|_| self.storage.cache_dir(&package_id, PRIMARY_USER));
            if let Err(source) = prepared {
                if fresh {
                    self.discard_backing(&package_id);
                }
                return Err(InstallError::CopyFailed {
                    path: self.packages.backing_path(&package_id),
                    source,
                }
                .into());
            }

            self.packages
                .install(&package_id, &metadata, archive_path)
                .map_err(|e| {
                    if fresh {
                        self.discard_backing(&package_id);
                    }
                    VirtError::from(e)
                })
        })
    }

    pub fn install_app(&self, archive_path: &Path) -> Option<VirtualPackageRecord> {
        match self.try_install_app(archive_path) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Install of {} failed: {}", archive_path.display(), e);
                None
            }
        }
    }

    /// Kills every tracked process of the package, then removes it and its storage.
    pub fn try_uninstall_app(&self, package_id: &str) -> Result<(), VirtError> {
        let id = PackageId::parse(package_id)
            .map_err(|_| VirtError::InvalidPackageId(package_id.to_string()))?;

        self.exclusive(&id, || -> Result<(), VirtError> {
            if !self.packages.contains(package_id) {
                return Err(VirtError::NotInstalled(package_id.to_string()));
            }

            let mut users = self.processes.users_of(package_id);
            for &user_id in &users {
                self.processes.kill(package_id, user_id);
            }

            if !self.packages.uninstall(package_id) {
                return Err(VirtError::NotInstalled(package_id.to_string()));
            }

            if !users.contains(&PRIMARY_USER) {
                users.push(PRIMARY_USER);
            }
            for user_id in users {
                if let Err(e) = self.storage.wipe(&id, user_id) {
                    tracing::warn!("Failed to wipe storage of {}:{}: {}", package_id, user_id, e);
                }
            }
            Ok(())
        })
    }

    pub fn uninstall_app(&self, package_id: &str) -> bool {
        match self.try_uninstall_app(package_id) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Uninstall of {} failed: {}", package_id, e);
                false
            }
        }
    }

    /// Launches the package for `user_id`, or attaches to its existing record.
    ///
    /// Only the caller that created the pending record spawns a process. If
    /// the spawn fails, or panics, that record is dropped again so the next
    /// launch starts clean.
    pub fn try_launch_app(
        &self,
        package_id: &str,
        user_id: u32,
    ) -> Result<VirtualProcessRecord, VirtError> {
        let id = PackageId::parse(package_id)
            .map_err(|_| VirtError::InvalidPackageId(package_id.to_string()))?;
        self.exclusive(&id, || self.launch_locked(&id, user_id))
    }

    fn launch_locked(&self, id: &PackageId, user_id: u32) -> Result<VirtualProcessRecord, VirtError> {
        let package_id = id.as_str();
        let package = self
            .packages
            .query(package_id)
            .ok_or_else(|| VirtError::NotInstalled(package_id.to_string()))?;

        let created = match self.processes.start(package_id, user_id) {
            StartOutcome::Attached(record) => {
                tracing::debug!("{}:{} already started, attaching", package_id, user_id);
                return Ok(record);
            }
            StartOutcome::Created(record) => record,
        };
        let mut pending = PendingLaunch {
            processes: &self.processes,
            key: created.key(),
            launch_id: created.launch_id,
            committed: false,
        };

        let launch_failed = |reason: String| VirtError::LaunchFailed {
            package_id: package_id.to_string(),
            user_id,
            reason,
        };

        let data_dir = self
            .storage
            .data_dir(id, user_id)
            .map_err(|e| launch_failed(format!("data directory: {}", e)))?;
        let cache_dir = self
            .storage
            .cache_dir(id, user_id)
            .map_err(|e| launch_failed(format!("cache directory: {}", e)))?;

        let request = LaunchRequest {
            identity: VirtualIdentity::new(package_id, user_id),
            archive_path: package.archive_path(),
            data_dir,
            cache_dir,
        };

        let handle = self
            .processes
            .launcher()
            .spawn(&request)
            .map_err(|e| launch_failed(format!("{:#}", e)))?;

        if !self.processes.mark_alive(&pending.key, pending.launch_id, handle) {
            // Killed while spawning: the process must not outlive its record.
            if let Err(e) = self.processes.launcher().terminate(&handle) {
                tracing::debug!("Terminating orphaned pid {} failed: {:#}", handle.pid, e);
            }
            return Err(launch_failed("killed while starting".to_string()));
        }
        pending.committed = true;

        tracing::info!("Launched {}:{} as pid {}", package_id, user_id, handle.pid);
        self.processes
            .get(package_id, user_id)
            .ok_or_else(|| launch_failed("record vanished after start".to_string()))
    }

    pub fn launch_app(&self, package_id: &str, user_id: u32) -> bool {
        match self.try_launch_app(package_id, user_id) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("{}", e);
                false
            }
        }
    }

    pub fn try_kill_app(&self, package_id: &str, user_id: u32) -> Result<(), VirtError> {
        if self.processes.kill(package_id, user_id) {
            Ok(())
        } else {
            Err(VirtError::NotInstalled(package_id.to_string()))
        }
    }

    /// Returns `true` if a record existed for `(package_id, user_id)`.
    pub fn kill_app(&self, package_id: &str, user_id: u32) -> bool {
        self.try_kill_app(package_id, user_id).is_ok()
    }

    pub fn is_app_running(&self, package_id: &str, user_id: u32) -> bool {
        self.processes.is_running(package_id, user_id)
    }

    pub fn is_installed(&self, package_id: &str) -> bool {
        self.packages.contains(package_id)
    }

    /// Snapshot of installed packages, ordered by package id.
    pub fn list_installed(&self) -> Vec<VirtualPackageRecord> {
        self.packages.list_all()
    }

    pub fn try_get_package_record(&self, package_id: &str) -> Result<VirtualPackageRecord, VirtError> {
        self.packages
            .query(package_id)
            .ok_or_else(|| VirtError::NotInstalled(package_id.to_string()))
    }

    pub fn get_package_record(&self, package_id: &str) -> Option<VirtualPackageRecord> {
        self.packages.query(package_id)
    }

    pub fn running_processes(&self) -> Vec<VirtualProcessRecord> {
        self.processes
            .snapshot()
            .into_iter()
            .filter(|record| record.alive)
            .collect()
    }

    pub fn identity_of_pid(&self, pid: u32) -> Option<VirtualIdentity> {
        self.processes.identity_of_pid(pid)
    }

    /// Forgets processes that exited on their own.
    pub fn reap_exited(&self) -> Vec<ProcessKey> {
        self.processes.reap()
    }

    /// Runs `op` holding the lifecycle lock of `package_id`.
    fn exclusive<T>(&self, package_id: &PackageId, op: impl FnOnce() -> T) -> T {
        let lock = Arc::clone(self.lifecycle.entry(package_id.clone()).or_default().value());
        let result = {
            let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
            op()
        };
        drop(lock);
        self.lifecycle
            .remove_if(package_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Removes whatever a failed first install left on disk.
    fn discard_backing(&self, package_id: &PackageId) {
        if let Err(e) = self.storage.wipe(package_id, PRIMARY_USER) {
            tracing::debug!("Failed to wipe storage of {}: {}", package_id, e);
        }
        let backing_path = self.packages.backing_path(package_id);
        match fs::remove_dir_all(&backing_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to delete {}: {}", backing_path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virt::package::PackageMetadata;
    use crate::virt::process::tests::FakeLauncher;
    use crate::virt::storage::DirectoryStorage;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    /// Reads `<package_id> <version_name> <version_code>` from the archive body.
    struct PlainTextInspector;

    impl PackageInspector for PlainTextInspector {
        fn parse_archive(&self, path: &Path) -> Option<PackageMetadata> {
            let content = fs::read_to_string(path).ok()?;
            let mut parts = content.split_whitespace();
            Some(PackageMetadata {
                package_id: parts.next()?.to_string(),
                display_name: "Demo".to_string(),
                version_name: parts.next()?.to_string(),
                version_code: parts.next()?.parse().ok()?,
            })
        }
    }

    struct Harness {
        root: TempDir,
        uploads: TempDir,
        launcher: Arc<FakeLauncher>,
        facade: VirtualizationFacade,
    }

    impl Harness {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let uploads = TempDir::new().unwrap();
            let launcher = Arc::new(FakeLauncher::default());
            let vapps = root.path().join("vapps");
            let facade = VirtualizationFacade::new(
                Arc::new(PackageStore::new(&vapps)),
                Arc::new(ProcessRegistry::new(launcher.clone())),
                Arc::new(DirectoryStorage::new(&vapps)),
                Arc::new(PlainTextInspector),
            );
            Self {
                root,
                uploads,
                launcher,
                facade,
            }
        }

        fn archive(&self, package: &str, name: &str, code: i64) -> PathBuf {
            let path = self.uploads.path().join(format!("{}-{}.pkg", package, code));
            fs::write(&path, format!("{} {} {}", package, name, code)).unwrap();
            path
        }
    }

    #[test]
    fn test_demo_app_lifecycle() {
        let h = Harness::new();

        h.facade.install_app(&h.archive("com.demo.app", "1.0", 1)).unwrap();
        let installed = h.facade.list_installed();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].version_code, 1);

        h.facade.install_app(&h.archive("com.demo.app", "2.0", 2)).unwrap();
        let installed = h.facade.list_installed();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].version_code, 2);

        assert!(h.facade.launch_app("com.demo.app", 0));
        assert!(h.facade.is_app_running("com.demo.app", 0));
        let first = h.facade.processes().get("com.demo.app", 0).unwrap();

        assert!(h.facade.kill_app("com.demo.app", 0));
        assert!(!h.facade.is_app_running("com.demo.app", 0));

        assert!(h.facade.launch_app("com.demo.app", 0));
        let second = h.facade.processes().get("com.demo.app", 0).unwrap();
        assert_ne!(first.launch_id, second.launch_id);
        assert_ne!(first.process_handle, second.process_handle);
        assert_eq!(h.launcher.spawned.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_install_creates_primary_user_storage() {
        let h = Harness::new();
        let record = h.facade.install_app(&h.archive("com.demo.app", "1.0", 1)).unwrap();
        assert!(record.backing_path.join("data/user_0").is_dir());
        assert!(record.backing_path.join("cache/user_0").is_dir());
    }

    #[test]
    fn test_install_rejects_missing_or_unparsable_archive() {
        let h = Harness::new();
        let err = h
            .facade
            .try_install_app(&h.uploads.path().join("missing.pkg"))
            .unwrap_err();
        assert!(matches!(err, VirtError::Install(InstallError::ArchiveUnreadable(_))));

        let garbage = h.uploads.path().join("garbage.pkg");
        fs::write(&garbage, "only-one-token").unwrap();
        assert!(h.facade.install_app(&garbage).is_none());

        let traversal = h.uploads.path().join("traversal.pkg");
        fs::write(&traversal, "../../etc 1.0 1").unwrap();
        let err = h.facade.try_install_app(&traversal).unwrap_err();
        assert!(matches!(err, VirtError::Install(InstallError::InvalidPackageId(_))));
        assert!(h.facade.list_installed().is_empty());
    }

    #[test]
    fn test_launch_requires_install() {
        let h = Harness::new();
        assert!(!h.facade.launch_app("com.never.installed", 0));
        assert!(matches!(
            h.facade.try_launch_app("com.never.installed", 0),
            Err(VirtError::NotInstalled(_))
        ));
        assert_eq!(h.launcher.spawned.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_second_launch_attaches() {
        let h = Harness::new();
        h.facade.install_app(&h.archive("com.demo.app", "1.0", 1)).unwrap();

        let first = h.facade.try_launch_app("com.demo.app", 0).unwrap();
        let second = h.facade.try_launch_app("com.demo.app", 0).unwrap();
        assert_eq!(first, second);
        assert_eq!(h.launcher.spawned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_launch_spawns_once() {
        let h = Harness::new();
        h.facade.install_app(&h.archive("com.demo.app", "1.0", 1)).unwrap();

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| h.facade.launch_app("com.demo.app", 0));
            }
        });

        assert_eq!(h.launcher.spawned.load(Ordering::SeqCst), 1);
        assert!(h.facade.is_app_running("com.demo.app", 0));
    }

    #[test]
    fn test_spawn_failure_abandons_pending_record() {
        let h = Harness::new();
        h.facade.install_app(&h.archive("com.demo.app", "1.0", 1)).unwrap();
        h.launcher.fail_spawn.store(true, Ordering::SeqCst);

        let err = h.facade.try_launch_app("com.demo.app", 0).unwrap_err();
        assert!(matches!(err, VirtError::LaunchFailed { user_id: 0, .. }));
        assert!(h.facade.processes().get("com.demo.app", 0).is_none());

        h.launcher.fail_spawn.store(false, Ordering::SeqCst);
        assert!(h.facade.launch_app("com.demo.app", 0));
    }

    #[test]
    fn test_spawn_panic_leaves_no_pending_record() {
        let h = Harness::new();
        h.facade.install_app(&h.archive("com.demo.app", "1.0", 1)).unwrap();
        h.launcher.panic_spawn.store(true, Ordering::SeqCst);

        let crashed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            h.facade.launch_app("com.demo.app", 0)
        }));
        assert!(crashed.is_err());
        assert!(h.facade.processes().get("com.demo.app", 0).is_none());

        h.launcher.panic_spawn.store(false, Ordering::SeqCst);
        assert!(h.facade.launch_app("com.demo.app", 0));
        assert!(h.facade.is_app_running("com.demo.app", 0));
        assert_eq!(h.launcher.spawned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_launch_during_uninstall_does_not_survive() {
        let h = Harness::new();
        h.facade.install_app(&h.archive("com.demo.app", "1.0", 1)).unwrap();
        assert!(h.facade.launch_app("com.demo.app", 5));
        // Uninstall is still killing user 5 when the second launch arrives.
        h.launcher.terminate_delay_ms.store(300, Ordering::SeqCst);

        let relaunched = std::thread::scope(|s| {
            let uninstall = s.spawn(|| h.facade.uninstall_app("com.demo.app"));
            let launch = s.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(50));
                h.facade.launch_app("com.demo.app", 0)
            });
            assert!(uninstall.join().unwrap());
            launch.join().unwrap()
        });

        assert!(!relaunched);
        assert!(!h.facade.is_installed("com.demo.app"));
        assert!(!h.facade.is_app_running("com.demo.app", 0));
        assert!(h.facade.processes().is_empty());
    }

    #[test]
    fn test_failed_storage_setup_rolls_back_install() {
        struct BrokenStorage(DirectoryStorage);

        impl StorageProvider for BrokenStorage {
            fn data_path(&self, package_id: &PackageId, user_id: u32) -> PathBuf {
                self.0.data_path(package_id, user_id)
            }
            fn data_dir(&self, _package_id: &PackageId, _user_id: u32) -> io::Result<PathBuf> {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
            }
            fn cache_dir(&self, package_id: &PackageId, user_id: u32) -> io::Result<PathBuf> {
                self.0.cache_dir(package_id, user_id)
            }
            fn external_dir(&self, package_id: &PackageId, user_id: u32) -> io::Result<PathBuf> {
                self.0.external_dir(package_id, user_id)
            }
            fn wipe(&self, package_id: &PackageId, user_id: u32) -> io::Result<()> {
                self.0.wipe(package_id, user_id)
            }
        }

        let h = Harness::new();
        let vapps = h.root.path().join("vapps");
        let facade = VirtualizationFacade::new(
            Arc::new(PackageStore::new(&vapps)),
            Arc::new(ProcessRegistry::new(h.launcher.clone())),
            Arc::new(BrokenStorage(DirectoryStorage::new(&vapps))),
            Arc::new(PlainTextInspector),
        );

        let err = facade
            .try_install_app(&h.archive("com.demo.app", "1.0", 1))
            .unwrap_err();
        assert!(matches!(err, VirtError::Install(InstallError::CopyFailed { .. })));
        assert!(facade.list_installed().is_empty());
        assert!(!vapps.join("com.demo.app").exists());
    }

    #[test]
    fn test_lifecycle_locks_are_released() {
        let h = Harness::new();
        h.facade.install_app(&h.archive("com.demo.app", "1.0", 1)).unwrap();
        assert!(h.facade.launch_app("com.demo.app", 0));
        assert!(h.facade.uninstall_app("com.demo.app"));
        assert!(h.facade.lifecycle.is_empty());
    }

    #[test]
    fn test_uninstall_kills_every_user() {
        let h = Harness::new();
        let record = h.facade.install_app(&h.archive("com.demo.app", "1.0", 1)).unwrap();
        assert!(h.facade.launch_app("com.demo.app", 0));
        assert!(h.facade.launch_app("com.demo.app", 10));

        assert!(h.facade.uninstall_app("com.demo.app"));

        assert!(!h.facade.is_app_running("com.demo.app", 0));
        assert!(!h.facade.is_app_running("com.demo.app", 10));
        assert!(h.facade.running_processes().is_empty());
        assert_eq!(h.launcher.terminated.load(Ordering::SeqCst), 2);
        assert!(h.facade.get_package_record("com.demo.app").is_none());
        assert!(!record.backing_path.exists());
    }

    #[test]
    fn test_uninstall_unknown_package() {
        let h = Harness::new();
        assert!(!h.facade.uninstall_app("com.never.installed"));
        assert!(matches!(
            h.facade.try_uninstall_app("com.never.installed"),
            Err(VirtError::NotInstalled(_))
        ));
        assert!(matches!(
            h.facade.try_uninstall_app("../x"),
            Err(VirtError::InvalidPackageId(_))
        ));
    }

    #[test]
    fn test_kill_unknown_is_false() {
        let h = Harness::new();
        assert!(!h.facade.kill_app("com.demo.app", 0));
    }

    #[test]
    fn test_identity_and_reap() {
        let h = Harness::new();
        h.facade.install_app(&h.archive("com.demo.app", "1.0", 1)).unwrap();
        let record = h.facade.try_launch_app("com.demo.app", 7).unwrap();
        let pid = record.process_handle.unwrap().pid;

        assert_eq!(
            h.facade.identity_of_pid(pid),
            Some(VirtualIdentity::new("com.demo.app", 7))
        );

        h.launcher.alive.remove(&pid);
        assert_eq!(h.facade.reap_exited(), vec![ProcessKey::new("com.demo.app", 7)]);
        assert!(h.facade.identity_of_pid(pid).is_none());
    }

    #[test]
    fn test_get_package_record() {
        let h = Harness::new();
        assert!(matches!(
            h.facade.try_get_package_record("com.demo.app"),
            Err(VirtError::NotInstalled(_))
        ));
        h.facade.install_app(&h.archive("com.demo.app", "1.0", 1)).unwrap();
        assert!(h.facade.is_installed("com.demo.app"));
        assert_eq!(
            h.facade.get_package_record("com.demo.app").unwrap().version_name,
            "1.0"
        );
    }
}
