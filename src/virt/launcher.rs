//! Host process-creation primitive used by the facade to start virtual apps.
//!
//! The launcher owns the real OS processes. The process registry only keeps
//! their [`ProcessHandle`]s and asks the launcher to terminate them or to
//! check whether they are alive.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::LauncherConfig;
use crate::virt::identity::{VirtualIdentity, IDENTITY_ENV};

/// Opaque handle to the real process behind a virtual process record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
}

/// Everything the launcher needs to start one virtual app instance.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub identity: VirtualIdentity,
    pub archive_path: PathBuf,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
}

pub trait ProcessLauncher: Send + Sync {
    /// Starts the process and tags it with `request.identity`.
    fn spawn(&self, request: &LaunchRequest) -> Result<ProcessHandle>;

    /// Terminates the process. Failing on an already-dead process is allowed.
    fn terminate(&self, handle: &ProcessHandle) -> Result<()>;

    fn is_alive(&self, handle: &ProcessHandle) -> bool;
}

/// Launches a configured program for each virtual app.
///
/// Arguments may contain `{archive}`, `{data_dir}`, `{cache_dir}`,
/// `{package}` and `{user}` placeholders. The child runs with its data
/// directory as working directory and receives:
///
/// - `APPVIRT_IDENTITY`: the encoded [`VirtualIdentity`]
/// - `APPVIRT_DATA_DIR` / `APPVIRT_CACHE_DIR`: its private directories
pub struct CommandLauncher {
    config: LauncherConfig,
    children: DashMap<u32, Child>,
}

impl CommandLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            children: DashMap::new(),
        }
    }

    fn expand(&self, arg: &str, request: &LaunchRequest) -> String {
        arg.replace("{archive}", &request.archive_path.to_string_lossy())
            .replace("{data_dir}", &request.data_dir.to_string_lossy())
            .replace("{cache_dir}", &request.cache_dir.to_string_lossy())
            .replace("{package}", &request.identity.package_id)
            .replace("{user}", &request.identity.user_id.to_string())
    }
}

impl ProcessLauncher for CommandLauncher {
    fn spawn(&self, request: &LaunchRequest) -> Result<ProcessHandle> {
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| self.expand(arg, request))
            .collect();

        tracing::debug!(
            "Spawning {} {} for {}:{}",
            self.config.program,
            args.join(" "),
            request.identity.package_id,
            request.identity.user_id
        );

        let child = Command::new(&self.config.program)
            .args(&args)
            .envs(&self.config.env)
            .env(IDENTITY_ENV, request.identity.encode())
            .env("APPVIRT_DATA_DIR", &request.data_dir)
            .env("APPVIRT_CACHE_DIR", &request.cache_dir)
            .current_dir(&request.data_dir)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn launcher program '{}'", self.config.program))?;

        let handle = ProcessHandle { pid: child.id() };
        self.children.insert(handle.pid, child);
        Ok(handle)
    }

    fn terminate(&self, handle: &ProcessHandle) -> Result<()> {
        let (_, mut child) = self
            .children
            .remove(&handle.pid)
            .with_context(|| format!("pid {} was not started by this launcher", handle.pid))?;

        // kill() fails with InvalidInput once the child has exited; wait() still reaps it.
        if let Err(e) = child.kill() {
            tracing::debug!("kill({}) failed: {}", handle.pid, e);
        }
        child
            .wait()
            .with_context(|| format!("Failed to reap pid {}", handle.pid))?;
        Ok(())
    }

    fn is_alive(&self, handle: &ProcessHandle) -> bool {
        let exited = match self.children.get_mut(&handle.pid) {
            Some(mut child) => !matches!(child.try_wait(), Ok(None)),
            None => return false,
        };
        if exited {
            self.children.remove(&handle.pid);
        }
        !exited
    }
}
