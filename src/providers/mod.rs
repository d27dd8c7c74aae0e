//! Host-service interceptors.
//!
//! - [`activity`]: start, list and kill app processes
//! - [`package`]: installed-package queries
//! - [`io`]: file-path redirection on `open`, `openat`, `access` and `stat`
//!
//! [`install_default_hooks`] registers the groups enabled in
//! [`HooksConfig`](crate::config::HooksConfig).

pub mod activity;
pub mod io;
pub mod package;

use std::sync::Arc;

use anyhow::Result;

use crate::config::RuntimeConfig;
use crate::hook::interceptor::Interceptor;
use crate::hook::registry::HookRegistry;
use crate::hook::target::HookTarget;
use crate::virt::facade::VirtualizationFacade;

use self::activity::{GetRunningAppProcessesHook, KillBackgroundProcessesHook, StartActivityHook};
use self::io::PathRedirector;
use self::package::{GetApplicationInfoHook, GetInstalledPackagesHook, GetPackageInfoHook};

/// Directory under the storage root that mirrors redirected host paths.
///
/// Package ids cannot start with a dot, so this never collides with a package.
pub const REDIRECT_DIR: &str = ".fs";

/// Registers the default interceptors and returns the targets now hooked.
///
/// A target the bridge cannot patch, or that already has an interceptor, is
/// skipped with a warning; the remaining hooks are still installed.
///
/// # Errors
///
/// Fails only if the redirect patterns do not compile.
pub fn install_default_hooks(
    registry: &HookRegistry,
    facade: &Arc<VirtualizationFacade>,
    config: &RuntimeConfig,
) -> Result<Vec<HookTarget>> {
    let mut hooks: Vec<(HookTarget, Arc<dyn Interceptor>)> = Vec::new();

    if config.hooks.activity_manager {
        hooks.push((
            activity::start_activity_target(),
            Arc::new(StartActivityHook::new(facade.clone())),
        ));
        hooks.push((
            activity::running_app_processes_target(),
            Arc::new(GetRunningAppProcessesHook::new(facade.clone())),
        ));
        hooks.push((
            activity::kill_background_processes_target(),
            Arc::new(KillBackgroundProcessesHook::new(facade.clone())),
        ));
    }

    if config.hooks.package_manager {
        hooks.push((
            package::installed_packages_target(),
            Arc::new(GetInstalledPackagesHook::new(facade.clone())),
        ));
        hooks.push((
            package::package_info_target(),
            Arc::new(GetPackageInfoHook::new(facade.clone())),
        ));
        hooks.push((
            package::application_info_target(),
            Arc::new(GetApplicationInfoHook::new(facade.clone())),
        ));
    }

    if config.hooks.file_redirect && config.redirect.enabled {
        let redirector =
            PathRedirector::from_config(config.storage.root.join(REDIRECT_DIR), &config.redirect)?;
        for (target, hook) in io::redirect_hooks(&redirector) {
            hooks.push((target, Arc::new(hook)));
        }
    }

    let mut installed = Vec::with_capacity(hooks.len());
    for (target, interceptor) in hooks {
        match registry.register(target.clone(), interceptor) {
            Ok(()) => installed.push(target),
            Err(e) => tracing::warn!("Skipping hook: {}", e),
        }
    }

    tracing::info!("Installed {} host-service hook(s)", installed.len());
    Ok(installed)
}
