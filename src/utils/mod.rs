//! Shared helpers.

pub mod glob;
