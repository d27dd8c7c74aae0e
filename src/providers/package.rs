//! Package-manager interceptors.
//!
//! Host package objects are modelled as JSON:
//!
//! ```json
//! {
//!   "package_name": "com.demo.app",
//!   "version_name": "2.0",
//!   "version_code": 2,
//!   "application_info": {
//!     "package_name": "com.demo.app",
//!     "name": "Demo",
//!     "source_dir": "<root>/com.demo.app/base-archive",
//!     "data_dir": "<root>/com.demo.app/data/user_0"
//!   }
//! }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::hook::interceptor::{CallContext, Decision, Interceptor};
use crate::hook::target::HookTarget;
use crate::virt::facade::{VirtualizationFacade, PRIMARY_USER};
use crate::virt::identity::VirtualIdentity;
use crate::virt::package::VirtualPackageRecord;

pub const PACKAGE_MANAGER: &str = "host.PackageManager";

pub fn installed_packages_target() -> HookTarget {
    HookTarget::managed(PACKAGE_MANAGER, "getInstalledPackages", "(int)List")
}

pub fn package_info_target() -> HookTarget {
    HookTarget::managed(PACKAGE_MANAGER, "getPackageInfo", "(String,int)PackageInfo")
}

pub fn application_info_target() -> HookTarget {
    HookTarget::managed(PACKAGE_MANAGER, "getApplicationInfo", "(String,int)ApplicationInfo")
}

// Queries only report where the data directory is; it is created at install
// and launch time, never here.
fn application_info(
    facade: &VirtualizationFacade,
    record: &VirtualPackageRecord,
    user_id: u32,
) -> Value {
    json!({
        "package_name": record.package_id,
        "name": record.display_name,
        "source_dir": record.archive_path(),
        "data_dir": facade.storage().data_path(&record.package_id, user_id),
    })
}

fn package_info(facade: &VirtualizationFacade, record: &VirtualPackageRecord, user_id: u32) -> Value {
    json!({
        "package_name": record.package_id,
        "version_name": record.version_name,
        "version_code": record.version_code,
        "application_info": application_info(facade, record, user_id),
    })
}

/// User id in argument `index`, defaulting to the primary user.
fn user_arg(ctx: &CallContext, index: usize) -> u32 {
    ctx.args
        .get(index)
        .and_then(Value::as_u64)
        .and_then(|user| u32::try_from(user).ok())
        .unwrap_or(PRIMARY_USER)
}

/// User of the calling virtual app, or the primary user for host callers.
fn caller_user() -> u32 {
    VirtualIdentity::current()
        .map(|identity| identity.user_id)
        .unwrap_or(PRIMARY_USER)
}

/// Appends virtual packages to the host's installed-package list.
pub struct GetInstalledPackagesHook {
    facade: Arc<VirtualizationFacade>,
}

impl GetInstalledPackagesHook {
    pub fn new(facade: Arc<VirtualizationFacade>) -> Self {
        Self { facade }
    }
}

impl Interceptor for GetInstalledPackagesHook {
    fn name(&self) -> &str {
        "installed-packages"
    }

    fn after(&self, ctx: &mut CallContext) -> anyhow::Result<Decision> {
        let Some(Value::Array(host)) = ctx.result() else {
            return Ok(Decision::Continue);
        };
        // Argument 0 is the host's flags word, not a user.
        let user_id = caller_user();

        let mut merged = host.clone();
        let mut names: HashSet<String> = host
            .iter()
            .filter_map(|info| info.get("package_name").and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        for record in self.facade.list_installed() {
            // A host package of the same name wins.
            if names.insert(record.package_id.to_string()) {
                merged.push(package_info(&self.facade, &record, user_id));
            }
        }

        Ok(Decision::ShortCircuitWithResult(Value::Array(merged)))
    }
}

/// Answers package-info queries for virtual packages.
pub struct GetPackageInfoHook {
    facade: Arc<VirtualizationFacade>,
}

impl GetPackageInfoHook {
    pub fn new(facade: Arc<VirtualizationFacade>) -> Self {
        Self { facade }
    }
}

impl Interceptor for GetPackageInfoHook {
    fn name(&self) -> &str {
        "package-info"
    }

    fn before(&self, ctx: &mut CallContext) -> anyhow::Result<Decision> {
        let Some(record) = ctx
            .arg_str(0)
            .and_then(|package_id| self.facade.get_package_record(package_id))
        else {
            return Ok(Decision::Continue);
        };
        let info = package_info(&self.facade, &record, user_arg(ctx, 1));
        Ok(Decision::ShortCircuitWithResult(info))
    }
}

/// Answers application-info queries for virtual packages.
pub struct GetApplicationInfoHook {
    facade: Arc<VirtualizationFacade>,
}

impl GetApplicationInfoHook {
    pub fn new(facade: Arc<VirtualizationFacade>) -> Self {
        Self { facade }
    }
}

impl Interceptor for GetApplicationInfoHook {
    fn name(&self) -> &str {
        "application-info"
    }

    fn before(&self, ctx: &mut CallContext) -> anyhow::Result<Decision> {
        let Some(record) = ctx
            .arg_str(0)
            .and_then(|package_id| self.facade.get_package_record(package_id))
        else {
            return Ok(Decision::Continue);
        };
        let info = application_info(&self.facade, &record, user_arg(ctx, 1));
        Ok(Decision::ShortCircuitWithResult(info))
    }
}
