//! Interceptor trait and the per-call context it operates on.

use std::fmt;

use serde_json::Value;

/// Error outcome of an intercepted call.
///
/// This is the value a host call "throws": either the original call failed, or
/// an interceptor decided the call should fail. It is not used to report a
/// broken interceptor; those are recorded as [`CallContext::failures`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub kind: String,
    pub message: String,
}

impl CallError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CallError {}

/// What a hook phase wants the dispatcher to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Proceed with the current outcome (or with the original call, in `before`).
    Continue,
    /// Make `value` the final result.
    ShortCircuitWithResult(Value),
    /// Make `error` the final error.
    ShortCircuitWithError(CallError),
}

/// State of a single intercepted invocation.
///
/// Created by the dispatcher for each call and dropped when the call
/// completes. `result` and `error` are never both set.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub receiver: Option<Value>,
    /// Ordered arguments. A `before` phase may rewrite them; the original call sees the rewrite.
    pub args: Vec<Value>,
    result: Option<Value>,
    error: Option<CallError>,
    short_circuited: bool,
    failures: Vec<String>,
}

impl CallContext {
    pub fn new(receiver: Option<Value>, args: Vec<Value>) -> Self {
        Self {
            receiver,
            args,
            ..Self::default()
        }
    }

    /// Argument `index` as a string, if present and a string.
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Value::as_str)
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&CallError> {
        self.error.as_ref()
    }

    pub fn short_circuited(&self) -> bool {
        self.short_circuited
    }

    /// Phase failures recorded during this call.
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub(crate) fn set_outcome(&mut self, outcome: Result<Value, CallError>) {
        match outcome {
            Ok(value) => {
                self.result = Some(value);
                self.error = None;
            }
            Err(err) => {
                self.result = None;
                self.error = Some(err);
            }
        }
    }

    pub(crate) fn short_circuit(&mut self, outcome: Result<Value, CallError>) {
        self.set_outcome(outcome);
        self.short_circuited = true;
    }

    pub(crate) fn record_failure(&mut self, failure: String) {
        self.failures.push(failure);
    }

    /// The final outcome. A context with neither slot set resolves to `null`.
    pub(crate) fn take_outcome(&mut self) -> Result<Value, CallError> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self.result.take().unwrap_or(Value::Null)),
        }
    }
}

/// A hook attached to a [`HookTarget`](crate::hook::target::HookTarget).
///
/// Both phases are optional; an unimplemented phase is a no-op `Continue`.
/// Returning `Err` (or panicking) marks the phase as failed: the dispatcher
/// records the failure and carries on as if the phase returned `Continue`.
pub trait Interceptor: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &str {
        "interceptor"
    }

    /// Runs before the original call.
    fn before(&self, _ctx: &mut CallContext) -> anyhow::Result<Decision> {
        Ok(Decision::Continue)
    }

    /// Runs after the original call with its outcome in `ctx`.
    fn after(&self, _ctx: &mut CallContext) -> anyhow::Result<Decision> {
        Ok(Decision::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Empty;
    impl Interceptor for Empty {}

    #[test]
    fn test_default_phases_continue() {
        let mut ctx = CallContext::new(None, vec![]);
        assert_eq!(Empty.before(&mut ctx).unwrap(), Decision::Continue);
        assert_eq!(Empty.after(&mut ctx).unwrap(), Decision::Continue);
        assert_eq!(Empty.name(), "interceptor");
    }

    #[test]
    fn test_outcome_slots_are_exclusive() {
        let mut ctx = CallContext::new(None, vec![json!("com.demo.app")]);
        ctx.set_outcome(Ok(json!(1)));
        ctx.set_outcome(Err(CallError::new("IllegalState", "boom")));
        assert!(ctx.result().is_none());
        assert_eq!(ctx.error().unwrap().kind, "IllegalState");

        ctx.short_circuit(Ok(json!(0)));
        assert!(ctx.error().is_none());
        assert!(ctx.short_circuited());
        assert_eq!(ctx.take_outcome(), Ok(json!(0)));
    }

    #[test]
    fn test_arg_str() {
        let ctx = CallContext::new(None, vec![json!("com.demo.app"), json!(0)]);
        assert_eq!(ctx.arg_str(0), Some("com.demo.app"));
        assert_eq!(ctx.arg_str(1), None);
        assert_eq!(ctx.arg_str(5), None);
    }
}
