//! Virtual package and process management.
//!
//! - [`package`]: installed packages and their backing directories
//! - [`process`]: running virtual app instances keyed by `(package, user)`
//! - [`facade`]: the operations interceptors call into
//!
//! [`inspector`], [`storage`] and [`launcher`] are the host collaborators,
//! each behind a trait with a filesystem/`std::process` default.

pub mod facade;
pub mod identity;
pub mod inspector;
pub mod launcher;
pub mod package;
pub mod process;
pub mod storage;

pub use facade::VirtualizationFacade;
pub use identity::VirtualIdentity;
pub use inspector::{ManifestInspector, PackageInspector};
pub use launcher::{CommandLauncher, LaunchRequest, ProcessHandle, ProcessLauncher};
pub use package::{PackageId, PackageMetadata, PackageStore, VirtualPackageRecord};
pub use process::{ProcessKey, ProcessRegistry, StartOutcome, VirtualProcessRecord};
pub use storage::{DirectoryStorage, StorageProvider};
