//! Concurrent registry of interceptors keyed by [`HookTarget`].
//!
//! Registration is a three-step protocol:
//!
//! 1. **Reserve**: the key is claimed with an invisible pending slot. A second
//!    registration of the same key now fails with `DuplicateTarget`, so
//!    same-key races resolve first-writer-wins.
//! 2. **Patch**: the target's dispatch slot is redirected through the
//!    [`NativeBridge`]. No map lock is held while the bridge runs.
//! 3. **Publish**: the pending slot becomes active and `lookup` starts
//!    returning the interceptor.
//!
//! Readers therefore never observe a registered-but-unpatched hook.
//!
//! `unregister` only drops the mapping. The patch itself is irreversible, and
//! a patched call point with no interceptor simply runs the original call.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use appvirt::hook::bridge::CallSiteBridge;
//! use appvirt::hook::interceptor::Interceptor;
//! use appvirt::hook::registry::HookRegistry;
//! use appvirt::hook::target::HookTarget;
//!
//! struct Passthrough;
//! impl Interceptor for Passthrough {}
//!
//! let registry = HookRegistry::new(Arc::new(CallSiteBridge::new()));
//! let target = HookTarget::native("libc.so", "open");
//!
//! registry.register(target.clone(), Arc::new(Passthrough)).unwrap();
//! assert!(registry.lookup(&target).is_some());
//! assert!(registry.register(target.clone(), Arc::new(Passthrough)).is_err());
//! ```

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use crate::error::HookError;
use crate::hook::bridge::NativeBridge;
use crate::hook::interceptor::Interceptor;
use crate::hook::target::HookTarget;

enum Slot {
    Pending,
    Active(Arc<dyn Interceptor>),
}

/// Thread-safe map from hook targets to their interceptors.
pub struct HookRegistry {
    slots: DashMap<HookTarget, Slot>,
    /// Targets the bridge has patched. Never shrinks.
    patched: DashSet<HookTarget>,
    bridge: Arc<dyn NativeBridge>,
}

impl HookRegistry {
    pub fn new(bridge: Arc<dyn NativeBridge>) -> Self {
        Self {
            slots: DashMap::new(),
            patched: DashSet::new(),
            bridge,
        }
    }

    /// Installs `interceptor` on `target`.
    ///
    /// # Errors
    ///
    /// - [`HookError::DuplicateTarget`] if the target is registered or being registered
    /// - [`HookError::PatchFailed`] if the bridge cannot patch the target
    pub fn register(
        &self,
        target: HookTarget,
        interceptor: Arc<dyn Interceptor>,
    ) -> Result<(), HookError> {
        match self.slots.entry(target.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!("Rejecting duplicate registration for {}", target);
                return Err(HookError::DuplicateTarget(target));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Pending);
            }
        }

        if !self.patched.contains(&target) {
            if !self.bridge.patch(&target) {
                self.slots
                    .remove_if(&target, |_, slot| matches!(slot, Slot::Pending));
                tracing::warn!("Native bridge refused to patch {}", target);
                return Err(HookError::PatchFailed(target));
            }
            self.patched.insert(target.clone());
        }

        // Only the reserving caller can move a pending slot forward.
        if let Some(mut slot) = self.slots.get_mut(&target) {
            *slot = Slot::Active(interceptor);
        }

        tracing::debug!("Registered interceptor on {}", target);
        Ok(())
    }

    /// Removes the interceptor on `target`. Returns `false` if none was active.
    pub fn unregister(&self, target: &HookTarget) -> bool {
        let removed = self
            .slots
            .remove_if(target, |_, slot| matches!(slot, Slot::Active(_)))
            .is_some();
        if removed {
            tracing::debug!("Unregistered interceptor on {} (patch left in place)", target);
        }
        removed
    }

    /// Returns the active interceptor for `target`, if any.
    pub fn lookup(&self, target: &HookTarget) -> Option<Arc<dyn Interceptor>> {
        self.slots.get(target).and_then(|slot| match &*slot {
            Slot::Active(interceptor) => Some(Arc::clone(interceptor)),
            Slot::Pending => None,
        })
    }

    /// Whether the bridge has ever patched `target`.
    pub fn is_patched(&self, target: &HookTarget) -> bool {
        self.patched.contains(target)
    }

    /// Snapshot of all active targets, sorted.
    pub fn targets(&self) -> Vec<HookTarget> {
        let mut targets: Vec<HookTarget> = self
            .slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Active(_)))
            .map(|entry| entry.key().clone())
            .collect();
        targets.sort();
        targets
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Active(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
