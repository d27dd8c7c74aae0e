//! Contract with the native interception bridge.
//!
//! The bridge is the low-level primitive that can locate a symbol in a loaded
//! library (or a managed method's dispatch slot) and redirect it into the
//! [`Dispatcher`](crate::hook::dispatcher::Dispatcher). Patches are
//! idempotent but irreversible: there is no unhook at this layer.

use dashmap::DashSet;

use crate::hook::target::HookTarget;

/// Patching primitive consumed by the [`HookRegistry`](crate::hook::registry::HookRegistry).
pub trait NativeBridge: Send + Sync {
    /// Redirects `symbol` in `library`. Returns `false` if the symbol cannot be found or patched.
    fn hook_symbol(&self, library: &str, symbol: &str) -> bool;

    /// Redirects the dispatch slot of a managed method.
    fn hook_managed_method(&self, type_name: &str, method_name: &str, signature: &str) -> bool;

    /// Patches whichever kind of target is given.
    fn patch(&self, target: &HookTarget) -> bool {
        match target {
            HookTarget::ManagedMethod {
                type_name,
                method_name,
                parameter_signature,
            } => self.hook_managed_method(type_name, method_name, parameter_signature),
            HookTarget::NativeSymbol {
                library_name,
                symbol_name,
            } => self.hook_symbol(library_name, symbol_name),
        }
    }
}

/// Bridge for call sites that already route through the dispatcher.
///
/// In-process call points (the host-service shims of this crate and any
/// embedder that calls [`Dispatcher::dispatch`](crate::hook::dispatcher::Dispatcher::dispatch))
/// need no machine-code patch; "patching" arms the call site. Arming the same
/// target twice is a no-op that still reports success.
#[derive(Debug, Default)]
pub struct CallSiteBridge {
    armed: DashSet<HookTarget>,
    denied_libraries: Vec<String>,
}

impl CallSiteBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bridge that refuses to patch any symbol of the given libraries.
    ///
    /// Mirrors a native bridge that cannot find a library in the process.
    pub fn with_denied_libraries(libraries: Vec<String>) -> Self {
        Self {
            armed: DashSet::new(),
            denied_libraries: libraries,
        }
    }

    /// Whether `target` has been armed.
    pub fn is_armed(&self, target: &HookTarget) -> bool {
        self.armed.contains(target)
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}

impl NativeBridge for CallSiteBridge {
    fn hook_symbol(&self, library: &str, symbol: &str) -> bool {
        if library.is_empty() || symbol.is_empty() {
            return false;
        }
        if self.denied_libraries.iter().any(|l| l == library) {
            tracing::debug!("Library {} is not loaded, cannot hook {}", library, symbol);
            return false;
        }
        self.armed.insert(HookTarget::native(library, symbol));
        true
    }

    fn hook_managed_method(&self, type_name: &str, method_name: &str, signature: &str) -> bool {
        if type_name.is_empty() || method_name.is_empty() {
            return false;
        }
        self.armed
            .insert(HookTarget::managed(type_name, method_name, signature));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_arms_target() {
        let bridge = CallSiteBridge::new();
        let target = HookTarget::native("libc.so", "open");
        assert!(bridge.patch(&target));
        assert!(bridge.is_armed(&target));
    }

    #[test]
    fn test_patch_is_idempotent() {
        let bridge = CallSiteBridge::new();
        let target = HookTarget::managed("host.ActivityManager", "killBackgroundProcesses", "");
        assert!(bridge.patch(&target));
        assert!(bridge.patch(&target));
        assert_eq!(bridge.armed_count(), 1);
    }

    #[test]
    fn test_rejects_empty_names() {
        let bridge = CallSiteBridge::new();
        assert!(!bridge.hook_symbol("", "open"));
        assert!(!bridge.hook_managed_method("host.ActivityManager", "", ""));
        assert_eq!(bridge.armed_count(), 0);
    }

    #[test]
    fn test_denied_library() {
        let bridge = CallSiteBridge::with_denied_libraries(vec!["libmissing.so".to_string()]);
        assert!(!bridge.hook_symbol("libmissing.so", "open"));
        assert!(bridge.hook_symbol("libc.so", "open"));
    }
}
