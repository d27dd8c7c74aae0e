//! Error taxonomy for the interception and virtualization core.
//!
//! None of these errors is fatal to the process. The hook layer reports
//! registration collisions, the package store reports install failures, and
//! the [`VirtualizationFacade`](crate::virt::facade::VirtualizationFacade)
//! folds everything into boolean or optional results at its boundary so an
//! interceptor can never abort the host call it is attached to.
//!
//! # Error Categories
//!
//! ## Hook registration
//! - [`HookError::DuplicateTarget`] - the target already has an interceptor
//! - [`HookError::PatchFailed`] - the native bridge refused to patch the target
//!
//! ## Installation
//! - [`InstallError::ArchiveUnreadable`] - the package inspector could not parse the archive
//! - [`InstallError::CopyFailed`] - the backing path could not be written
//! - [`InstallError::InvalidPackageId`] - the declared identifier is not a safe path component
//! - [`InstallError::VersionDowngrade`] - reinstall with a lower version code
//!
//! ## Facade
//! - [`VirtError::NotInstalled`] - operation on an unknown package
//! - [`VirtError::LaunchFailed`] - the host process-creation primitive failed

use std::path::PathBuf;

use thiserror::Error;

use crate::hook::target::HookTarget;

/// Errors raised while registering interceptors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HookError {
    /// Another interceptor already owns this target (or is being installed on it).
    #[error("hook target already registered: {0}")]
    DuplicateTarget(HookTarget),

    /// The native interception bridge could not patch the target's dispatch slot.
    #[error("native bridge failed to patch {0}")]
    PatchFailed(HookTarget),
}

/// Errors raised by [`PackageStore::install`](crate::virt::package::PackageStore::install).
#[derive(Debug, Error)]
pub enum InstallError {
    /// The archive does not exist or the package inspector could not parse it.
    #[error("archive is unreadable: {}", .0.display())]
    ArchiveUnreadable(PathBuf),

    /// Copying the archive (or persisting the record) into the backing path failed.
    #[error("failed to write backing path {}: {source}", .path.display())]
    CopyFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The declared package identifier cannot be used as a storage key.
    #[error("invalid package identifier '{0}'")]
    InvalidPackageId(String),

    /// A reinstall tried to move the version code backwards.
    #[error("refusing to downgrade {package_id} from version code {installed} to {requested}")]
    VersionDowngrade {
        package_id: String,
        installed: i64,
        requested: i64,
    },
}

/// Errors surfaced by the `try_*` operations of the virtualization facade.
#[derive(Debug, Error)]
pub enum VirtError {
    /// The package is not present in the virtual package store.
    #[error("package '{0}' is not installed")]
    NotInstalled(String),

    /// The identifier could not be parsed as a [`PackageId`](crate::virt::package::PackageId).
    #[error("invalid package identifier '{0}'")]
    InvalidPackageId(String),

    /// Installation failed.
    #[error(transparent)]
    Install(#[from] InstallError),

    /// The host process-creation primitive failed to start the application.
    #[error("failed to launch {package_id} for user {user_id}: {reason}")]
    LaunchFailed {
        package_id: String,
        user_id: u32,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_target_message_names_target() {
        let target = HookTarget::native("libc.so", "open");
        let err = HookError::DuplicateTarget(target);
        assert!(err.to_string().contains("libc.so!open"));
    }

    #[test]
    fn test_install_error_converts_into_virt_error() {
        let err: VirtError = InstallError::InvalidPackageId("../etc".to_string()).into();
        assert!(matches!(err, VirtError::Install(InstallError::InvalidPackageId(_))));
        assert!(err.to_string().contains("../etc"));
    }

    #[test]
    fn test_downgrade_message() {
        let err = InstallError::VersionDowngrade {
            package_id: "com.demo.app".to_string(),
            installed: 3,
            requested: 2,
        };
        assert_eq!(
            err.to_string(),
            "refusing to downgrade com.demo.app from version code 3 to 2"
        );
    }
}
