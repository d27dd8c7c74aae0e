//! Runtime context tying the interception and virtualization layers together.
//!
//! A [`Runtime`] is an ordinary value: tests and embedders build as many as
//! they like with [`Runtime::new`]. A process that wants a single shared
//! instance reachable from patched call points uses [`Runtime::initialize`]
//! once and [`Runtime::get`] afterwards.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::RuntimeConfig;
use crate::hook::bridge::{CallSiteBridge, NativeBridge};
use crate::hook::dispatcher::Dispatcher;
use crate::hook::registry::HookRegistry;
use crate::hook::target::HookTarget;
use crate::providers::install_default_hooks;
use crate::virt::facade::VirtualizationFacade;
use crate::virt::inspector::{ManifestInspector, PackageInspector};
use crate::virt::launcher::{CommandLauncher, ProcessLauncher};
use crate::virt::package::PackageStore;
use crate::virt::process::ProcessRegistry;
use crate::virt::storage::DirectoryStorage;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

pub struct Runtime {
    config: RuntimeConfig,
    registry: Arc<HookRegistry>,
    dispatcher: Dispatcher,
    facade: Arc<VirtualizationFacade>,
    hooks: Vec<HookTarget>,
}

impl Runtime {
    /// Builds a runtime from its host collaborators.
    ///
    /// Restores packages already present under the storage root and installs
    /// the hooks enabled in `config`.
    pub fn new(
        config: RuntimeConfig,
        bridge: Arc<dyn NativeBridge>,
        inspector: Arc<dyn PackageInspector>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self> {
        config.validate().context("Invalid runtime configuration")?;

        let root = config.storage.root.clone();
        let packages = Arc::new(PackageStore::new(&root));
        let restored = packages.load_existing(inspector.as_ref());
        tracing::debug!("Restored {} package(s) from {}", restored, root.display());

        let facade = Arc::new(VirtualizationFacade::new(
            packages,
            Arc::new(ProcessRegistry::new(launcher)),
            Arc::new(DirectoryStorage::new(&root)),
            inspector,
        ));

        let registry = Arc::new(HookRegistry::new(bridge));
        let hooks = install_default_hooks(&registry, &facade, &config)
            .context("Failed to install host-service hooks")?;

        Ok(Self {
            dispatcher: Dispatcher::new(Arc::clone(&registry)),
            config,
            registry,
            facade,
            hooks,
        })
    }

    /// Builds a runtime with the in-process bridge, manifest inspector and
    /// the launcher described by `config.launcher`.
    pub fn with_defaults(config: RuntimeConfig) -> Result<Self> {
        let launcher = Arc::new(CommandLauncher::new(config.launcher.clone()));
        Self::new(
            config,
            Arc::new(CallSiteBridge::new()),
            Arc::new(ManifestInspector),
            launcher,
        )
    }

    /// Builds the process-wide runtime on first call.
    ///
    /// Later calls return the existing instance and ignore their arguments.
    pub fn initialize(
        config: RuntimeConfig,
        bridge: Arc<dyn NativeBridge>,
        inspector: Arc<dyn PackageInspector>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<&'static Runtime> {
        let _init = INIT.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(runtime) = RUNTIME.get() {
            tracing::debug!("Runtime already initialized");
            return Ok(runtime);
        }

        let runtime = Self::new(config, bridge, inspector, launcher)?;
        Ok(RUNTIME.get_or_init(|| runtime))
    }

    /// The process-wide runtime, if [`initialize`](Self::initialize) succeeded.
    pub fn get() -> Option<&'static Runtime> {
        RUNTIME.get()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn facade(&self) -> &Arc<VirtualizationFacade> {
        &self.facade
    }

    /// Targets hooked at construction.
    pub fn hooks(&self) -> &[HookTarget] {
        &self.hooks
    }
}

/// Polls until `(package_id, user_id)` is no longer running.
///
/// Each tick reaps exited processes first, so a process that exits on its own
/// ends the wait as well as an explicit kill.
pub async fn wait_for_exit(
    facade: &VirtualizationFacade,
    package_id: &str,
    user_id: u32,
    poll: Duration,
) {
    let mut ticker = tokio::time::interval(poll);
    loop {
        ticker.tick().await;
        facade.reap_exited();
        if !facade.is_app_running(package_id, user_id) {
            return;
        }
    }
}
