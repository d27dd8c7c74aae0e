//! appvirt - application virtualization and interception engine
//!
//! Installs application packages into a private registry and storage tree,
//! runs them as tagged virtual processes, and intercepts host
//! process-management, package-management and file-open calls so virtual
//! apps see the virtual environment instead of the host's.

pub mod config;
pub mod error;
pub mod hook;
pub mod providers;
pub mod runtime;
pub mod utils;
pub mod virt;
