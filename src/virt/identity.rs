//! Virtualization identity tag carried by every launched process.
//!
//! At spawn time the launcher encodes the `(package, user)` pair as
//! base64-wrapped JSON in the [`IDENTITY_ENV`] variable. Code running inside
//! the virtual process reads it back with [`VirtualIdentity::current`]; the
//! host side looks identities up by pid in the process registry.

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

/// Environment variable holding the encoded identity.
pub const IDENTITY_ENV: &str = "APPVIRT_IDENTITY";

/// Which virtual package and user namespace a process runs as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualIdentity {
    pub package_id: String,
    pub user_id: u32,
}

impl VirtualIdentity {
    pub fn new(package_id: impl Into<String>, user_id: u32) -> Self {
        Self {
            package_id: package_id.into(),
            user_id,
        }
    }

    /// Encodes the identity for the process environment.
    pub fn encode(&self) -> String {
        let json = serde_json::json!({
            "package_id": self.package_id,
            "user_id": self.user_id,
        });
        general_purpose::STANDARD.encode(json.to_string())
    }

    /// Decodes a tag produced by [`encode`](Self::encode).
    pub fn decode(tag: &str) -> Result<Self> {
        let bytes = general_purpose::STANDARD
            .decode(tag.trim())
            .context("Identity tag is not valid base64")?;
        serde_json::from_slice(&bytes).context("Identity tag does not hold an identity")
    }

    /// The identity of the current process, or `None` on the host side.
    pub fn current() -> Option<Self> {
        let tag = std::env::var(IDENTITY_ENV).ok()?;
        match Self::decode(&tag) {
            Ok(identity) => Some(identity),
            Err(e) => {
                tracing::warn!("Ignoring malformed {}: {:#}", IDENTITY_ENV, e);
                None
            }
        }
    }

    /// Whether this process was launched as a virtual app.
    pub fn is_virtual_process() -> bool {
        Self::current().is_some()
    }
}
