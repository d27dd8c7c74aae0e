//! Before/after interception protocol.
//!
//! When a patched call point fires, the dispatcher:
//!
//! 1. Builds a fresh [`CallContext`] for the call
//! 2. Runs the interceptor's `before` phase
//! 3. On a short-circuit, skips the original call and returns the supplied value or error
//! 4. Otherwise runs the original call and stores its outcome in the context
//! 5. Runs `after`, which may replace the outcome
//!
//! Exactly one of {original result, original error, short-circuit result,
//! short-circuit error} is final. A phase that returns `Err` or panics is
//! recorded in the context and treated as `Continue`, so a broken interceptor
//! never breaks the host call path it is attached to.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::hook::interceptor::{CallContext, CallError, Decision, Interceptor};
use crate::hook::registry::HookRegistry;
use crate::hook::target::HookTarget;

#[derive(Debug, Clone, Copy)]
enum Phase {
    Before,
    After,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Before => f.write_str("before"),
            Phase::After => f.write_str("after"),
        }
    }
}

/// Result of one dispatched call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub outcome: Result<Value, CallError>,
    /// Whether the original call ran.
    pub original_invoked: bool,
    /// Whether a phase supplied the final outcome.
    pub short_circuited: bool,
    /// Phase failures recorded (and ignored) during the call.
    pub failures: Vec<String>,
}

/// Runs interceptors around original calls.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HookRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HookRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    /// Dispatches a call and returns only its final outcome.
    pub fn dispatch<F>(
        &self,
        target: &HookTarget,
        receiver: Option<Value>,
        args: Vec<Value>,
        original: F,
    ) -> Result<Value, CallError>
    where
        F: FnOnce(&CallContext) -> Result<Value, CallError>,
    {
        self.invoke(target, receiver, args, original).outcome
    }

    /// Dispatches a call through the interceptor registered on `target`.
    ///
    /// `original` receives the context after the `before` phase, so it sees
    /// any argument rewrite.
    pub fn invoke<F>(
        &self,
        target: &HookTarget,
        receiver: Option<Value>,
        args: Vec<Value>,
        original: F,
    ) -> Invocation
    where
        F: FnOnce(&CallContext) -> Result<Value, CallError>,
    {
        let mut ctx = CallContext::new(receiver, args);

        let Some(interceptor) = self.registry.lookup(target) else {
            let outcome = original(&ctx);
            return Invocation {
                outcome,
                original_invoked: true,
                short_circuited: false,
                failures: Vec::new(),
            };
        };

        match run_phase(Phase::Before, interceptor.as_ref(), &mut ctx, target) {
            Decision::Continue => {}
            Decision::ShortCircuitWithResult(value) => {
                tracing::trace!("{} short-circuited {} with a result", interceptor.name(), target);
                ctx.short_circuit(Ok(value));
                return finish(ctx, false);
            }
            Decision::ShortCircuitWithError(err) => {
                tracing::trace!("{} short-circuited {} with {}", interceptor.name(), target, err);
                ctx.short_circuit(Err(err));
                return finish(ctx, false);
            }
        }

        let outcome = original(&ctx);
        ctx.set_outcome(outcome);

        match run_phase(Phase::After, interceptor.as_ref(), &mut ctx, target) {
            Decision::Continue => {}
            Decision::ShortCircuitWithResult(value) => ctx.short_circuit(Ok(value)),
            Decision::ShortCircuitWithError(err) => ctx.short_circuit(Err(err)),
        }

        finish(ctx, true)
    }
}

fn finish(mut ctx: CallContext, original_invoked: bool) -> Invocation {
    let short_circuited = ctx.short_circuited();
    let failures = ctx.failures().to_vec();
    Invocation {
        outcome: ctx.take_outcome(),
        original_invoked,
        short_circuited,
        failures,
    }
}

fn run_phase(
    phase: Phase,
    interceptor: &dyn Interceptor,
    ctx: &mut CallContext,
    target: &HookTarget,
) -> Decision {
    let result = panic::catch_unwind(AssertUnwindSafe(|| match phase {
        Phase::Before => interceptor.before(ctx),
        Phase::After => interceptor.after(ctx),
    }));

    let failure = match result {
        Ok(Ok(decision)) => return decision,
        Ok(Err(err)) => format!("{:#}", err),
        Err(payload) => {
            if let Some(msg) = payload.downcast_ref::<&str>() {
                format!("panicked: {}", msg)
            } else if let Some(msg) = payload.downcast_ref::<String>() {
                format!("panicked: {}", msg)
            } else {
                "panicked".to_string()
            }
        }
    };

    tracing::warn!(
        "{} phase of {} on {} failed, continuing: {}",
        phase,
        interceptor.name(),
        target,
        failure
    );
    ctx.record_failure(format!("{} {}: {}", interceptor.name(), phase, failure));
    Decision::Continue
}
