//! Activity-manager interceptors.
//!
//! Calls arrive with the package id as the first argument and an optional
//! user id as the second (default user 0). Calls about packages that are not
//! installed in the virtual environment pass through to the host untouched.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::hook::interceptor::{CallContext, CallError, Decision, Interceptor};
use crate::hook::target::HookTarget;
use crate::virt::facade::{VirtualizationFacade, PRIMARY_USER};

pub const ACTIVITY_MANAGER: &str = "host.ActivityManager";

pub fn start_activity_target() -> HookTarget {
    HookTarget::managed(ACTIVITY_MANAGER, "startActivity", "(String,int)int")
}

pub fn running_app_processes_target() -> HookTarget {
    HookTarget::managed(ACTIVITY_MANAGER, "getRunningAppProcesses", "()List")
}

pub fn kill_background_processes_target() -> HookTarget {
    HookTarget::managed(ACTIVITY_MANAGER, "killBackgroundProcesses", "(String,int)void")
}

/// Returns the virtual package named by the call, if it is installed.
fn virtual_target<'a>(facade: &VirtualizationFacade, ctx: &'a CallContext) -> Option<(&'a str, u32)> {
    let package_id = ctx.arg_str(0)?;
    if !facade.is_installed(package_id) {
        return None;
    }
    let user_id = ctx
        .args
        .get(1)
        .and_then(Value::as_u64)
        .and_then(|user| u32::try_from(user).ok())
        .unwrap_or(PRIMARY_USER);
    Some((package_id, user_id))
}

/// Starts virtual apps inside the virtual environment instead of the host.
pub struct StartActivityHook {
    facade: Arc<VirtualizationFacade>,
}

impl StartActivityHook {
    pub fn new(facade: Arc<VirtualizationFacade>) -> Self {
        Self { facade }
    }
}

impl Interceptor for StartActivityHook {
    fn name(&self) -> &str {
        "start-activity"
    }

    fn before(&self, ctx: &mut CallContext) -> anyhow::Result<Decision> {
        let Some((package_id, user_id)) = virtual_target(&self.facade, ctx) else {
            return Ok(Decision::Continue);
        };

        match self.facade.try_launch_app(package_id, user_id) {
            Ok(_) => Ok(Decision::ShortCircuitWithResult(json!(0))),
            Err(e) => Ok(Decision::ShortCircuitWithError(CallError::new(
                "ActivityNotStarted",
                e.to_string(),
            ))),
        }
    }
}

/// Narrows the host's process list to virtual processes.
///
/// Host entries are objects with a `pid` field. An entry is kept only when
/// its pid belongs to a live virtual process, and kept entries gain the
/// `package_id` and `user_id` they run as.
pub struct GetRunningAppProcessesHook {
    facade: Arc<VirtualizationFacade>,
}

impl GetRunningAppProcessesHook {
    pub fn new(facade: Arc<VirtualizationFacade>) -> Self {
        Self { facade }
    }
}

impl Interceptor for GetRunningAppProcessesHook {
    fn name(&self) -> &str {
        "running-app-processes"
    }

    fn after(&self, ctx: &mut CallContext) -> anyhow::Result<Decision> {
        let Some(Value::Array(entries)) = ctx.result() else {
            return Ok(Decision::Continue);
        };

        let mut filtered = Vec::new();
        let mut seen = HashSet::new();
        for entry in entries {
            let Some(pid) = entry
                .get("pid")
                .and_then(Value::as_u64)
                .and_then(|pid| u32::try_from(pid).ok())
            else {
                continue;
            };
            let Some(identity) = self.facade.identity_of_pid(pid) else {
                continue;
            };
            let mut entry = entry.clone();
            if let Value::Object(fields) = &mut entry {
                fields.insert("package_id".to_string(), json!(identity.package_id));
                fields.insert("user_id".to_string(), json!(identity.user_id));
            }
            seen.insert(pid);
            filtered.push(entry);
        }

        // Live virtual processes the host did not report.
        for record in self.facade.running_processes() {
            let Some(handle) = record.process_handle else {
                continue;
            };
            if seen.insert(handle.pid) {
                filtered.push(json!({
                    "pid": handle.pid,
                    "process_name": record.package_id,
                    "package_id": record.package_id,
                    "user_id": record.user_id,
                }));
            }
        }

        Ok(Decision::ShortCircuitWithResult(Value::Array(filtered)))
    }
}

/// Kills virtual apps in the virtual environment instead of the host.
pub struct KillBackgroundProcessesHook {
    facade: Arc<VirtualizationFacade>,
}

impl KillBackgroundProcessesHook {
    pub fn new(facade: Arc<VirtualizationFacade>) -> Self {
        Self { facade }
    }
}

impl Interceptor for KillBackgroundProcessesHook {
    fn name(&self) -> &str {
        "kill-background-processes"
    }

    fn before(&self, ctx: &mut CallContext) -> anyhow::Result<Decision> {
        let Some((package_id, user_id)) = virtual_target(&self.facade, ctx) else {
            return Ok(Decision::Continue);
        };
        self.facade.kill_app(package_id, user_id);
        Ok(Decision::ShortCircuitWithResult(Value::Null))
    }
}
