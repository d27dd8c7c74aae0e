//! Method and symbol interception.
//!
//! - [`target`]: addressing of interception points
//! - [`bridge`]: contract with the native patching primitive
//! - [`interceptor`]: the two-phase hook trait and per-call context
//! - [`registry`]: concurrent target → interceptor map
//! - [`dispatcher`]: the before/after protocol run at each call point

pub mod bridge;
pub mod dispatcher;
pub mod interceptor;
pub mod registry;
pub mod target;

pub use dispatcher::{Dispatcher, Invocation};
pub use interceptor::{CallContext, CallError, Decision, Interceptor};
pub use registry::HookRegistry;
pub use target::HookTarget;
