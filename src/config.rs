//! Configuration for the virtualization runtime.
//!
//! Covers where virtual packages are stored, how their processes are
//! launched, which host paths are redirected into the virtual root, and which
//! host-service hooks are installed. Loaded from JSON files or strings and
//! validated before use.
//!
//! # Examples
//!
//! ```ignore
//! use appvirt::config::RuntimeConfig;
//!
//! // Load from JSON file
//! let config = RuntimeConfig::from_file("appvirt.json")?;
//!
//! // Create from JSON string
//! let json = r#"{"storage": {"root": "/var/lib/appvirt"}, "launcher": {"program": "/usr/bin/app-host"}}"#;
//! let config = RuntimeConfig::from_json_string(json)?;
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::utils::glob::glob_to_regex;

/// Where virtual packages and their private data live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StorageConfig {
    /// Root of the private storage tree (`<root>/<package_id>/...`).
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

/// How the host process-creation primitive starts a virtual app.
///
/// `args` may use the `{archive}`, `{data_dir}`, `{cache_dir}`, `{package}`
/// and `{user}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LauncherConfig {
    /// Program executed for every launch.
    #[serde(default = "default_launcher_program")]
    pub program: String,

    #[serde(default = "default_launcher_args")]
    pub args: Vec<String>,

    /// Extra environment variables for launched processes.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Host file paths redirected into the virtual storage tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RedirectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Glob patterns of host paths to redirect.
    ///
    /// - `*` matches within one path component
    /// - `**` matches across components
    #[serde(default = "default_redirect_patterns")]
    pub patterns: Vec<String>,
}

/// Which host-service interceptors are installed at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HooksConfig {
    #[serde(default = "default_true")]
    pub activity_manager: bool,

    #[serde(default = "default_true")]
    pub package_manager: bool,

    #[serde(default = "default_true")]
    pub file_redirect: bool,
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub launcher: LauncherConfig,

    #[serde(default)]
    pub redirect: RedirectConfig,

    #[serde(default)]
    pub hooks: HooksConfig,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("appvirt-data")
}

fn default_launcher_program() -> String {
    "sh".to_string()
}

fn default_launcher_args() -> Vec<String> {
    vec!["{archive}".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_redirect_patterns() -> Vec<String> {
    vec![
        "/data/data/**".to_string(),
        "/data/user/**".to_string(),
        "/sdcard/Android/data/**".to_string(),
        "/storage/emulated/0/Android/data/**".to_string(),
    ]
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: default_launcher_program(),
            args: default_launcher_args(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: default_redirect_patterns(),
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            activity_manager: true,
            package_manager: true,
            file_redirect: true,
        }
    }
}

impl StorageConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn validate(&self) -> Result<()> {
        let root = self
            .root
            .to_str()
            .ok_or_else(|| anyhow!("Storage root is not valid UTF-8"))?;
        validate_path_string(root).context("Invalid storage root")
    }
}

impl LauncherConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
        }
    }

    /// Validates the launcher configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The program is empty or contains null bytes
    /// - An argument or environment entry contains null bytes
    /// - An environment variable name is empty or contains `=`
    pub fn validate(&self) -> Result<()> {
        validate_path_string(&self.program).context("Invalid launcher program")?;

        for arg in &self.args {
            if arg.contains('\0') {
                return Err(anyhow!("Launcher argument contains null bytes: {:?}", arg));
            }
        }

        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(anyhow!("Invalid environment variable name: {:?}", key));
            }
            if value.contains('\0') {
                return Err(anyhow!("Environment variable {} contains null bytes", key));
            }
        }

        Ok(())
    }
}

impl RedirectConfig {
    pub fn new(enabled: bool, patterns: Vec<String>) -> Self {
        Self { enabled, patterns }
    }

    /// Validates the redirect patterns.
    ///
    /// Patterns must be absolute and compile as globs. When redirection is
    /// disabled the patterns are not checked.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        for pattern in &self.patterns {
            validate_path_string(pattern)
                .with_context(|| format!("Invalid redirect pattern: {}", pattern))?;
            if !pattern.starts_with('/') {
                return Err(anyhow!("Redirect pattern must be absolute: {}", pattern));
            }
            glob_to_regex(pattern)
                .with_context(|| format!("Invalid redirect pattern: {}", pattern))?;
        }

        if self.patterns.is_empty() {
            tracing::warn!("Path redirection is enabled but no patterns are configured");
        }

        Ok(())
    }
}

impl RuntimeConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The content is not valid JSON or does not match the schema
    /// - Validation fails
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_json_string(&content)
    }

    /// Loads a configuration from a JSON string.
    pub fn from_json_string(json: &str) -> Result<Self> {
        let config: RuntimeConfig =
            serde_json::from_str(json).context("Failed to parse JSON configuration")?;

        config.validate()?;

        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize configuration to JSON")
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.launcher.validate()?;
        self.redirect.validate()?;
        Ok(())
    }

    /// Merges another configuration into this one.
    ///
    /// Scalar settings (storage root, launcher program and args, flags) are
    /// taken from `other`. Environment entries and redirect patterns are
    /// unioned, with `other` winning on duplicate variable names.
    pub fn merge(&mut self, other: RuntimeConfig) -> Result<()> {
        self.storage = other.storage;

        self.launcher.program = other.launcher.program;
        self.launcher.args = other.launcher.args;
        self.launcher.env.extend(other.launcher.env);

        self.redirect.enabled = other.redirect.enabled;
        for pattern in other.redirect.patterns {
            if !self.redirect.patterns.contains(&pattern) {
                self.redirect.patterns.push(pattern);
            }
        }

        self.hooks = other.hooks;

        self.validate()
    }
}

/// Validates a path-like string used in configuration.
fn validate_path_string(path: &str) -> Result<()> {
    if path.contains('\0') {
        return Err(anyhow!("Path contains null bytes"));
    }

    if path.is_empty() {
        return Err(anyhow!("Path cannot be empty"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.storage.root, PathBuf::from("appvirt-data"));
        assert_eq!(config.launcher.program, "sh");
        assert!(config.redirect.enabled);
        assert_eq!(config.redirect.patterns.len(), 4);
        assert!(config.hooks.activity_manager);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_string() {
        let json = r#"{
            "storage": {"root": "/var/lib/appvirt"},
            "launcher": {
                "program": "/usr/bin/app-host",
                "args": ["--archive", "{archive}", "--user", "{user}"],
                "env": {"APP_HOST_LOG": "1"}
            },
            "redirect": {"enabled": true, "patterns": ["/data/data/**"]},
            "hooks": {"file_redirect": false}
        }"#;
        let config = RuntimeConfig::from_json_string(json).unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/var/lib/appvirt"));
        assert_eq!(config.launcher.args.len(), 4);
        assert_eq!(config.launcher.env["APP_HOST_LOG"], "1");
        assert_eq!(config.redirect.patterns, vec!["/data/data/**"]);
        assert!(!config.hooks.file_redirect);
        assert!(config.hooks.package_manager);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = RuntimeConfig::from_json_string("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_from_json_string_invalid() {
        assert!(RuntimeConfig::from_json_string("{ invalid json }").is_err());
    }

    #[test]
    fn test_launcher_validation() {
        assert!(LauncherConfig::new("", vec![]).validate().is_err());
        assert!(LauncherConfig::new("/bin/sh", vec!["a\0b".to_string()])
            .validate()
            .is_err());

        let mut config = LauncherConfig::new("/bin/sh", vec![]);
        config.env.insert("BAD=NAME".to_string(), "x".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redirect_validation() {
        assert!(RedirectConfig::new(true, vec!["relative/**".to_string()])
            .validate()
            .is_err());
        assert!(RedirectConfig::new(true, vec!["/data/[abc".to_string()])
            .validate()
            .is_err());
        // Disabled redirection skips pattern checks.
        assert!(RedirectConfig::new(false, vec!["relative".to_string()])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_storage_validation() {
        assert!(StorageConfig::new("").validate().is_err());
        assert!(StorageConfig::new("/var/lib/appvirt").validate().is_ok());
    }

    #[test]
    fn test_to_json_string_round_trip() {
        let config = RuntimeConfig::default();
        let json = config.to_json_string().unwrap();
        assert!(json.contains("storage"));
        assert!(json.contains("launcher"));
        assert_eq!(RuntimeConfig::from_json_string(&json).unwrap(), config);
    }

    #[test]
    fn test_merge() {
        let mut base = RuntimeConfig::default();
        base.launcher.env.insert("A".to_string(), "1".to_string());

        let mut other = RuntimeConfig::default();
        other.storage = StorageConfig::new("/srv/appvirt");
        other.launcher = LauncherConfig::new("/usr/bin/app-host", vec![]);
        other.launcher.env.insert("B".to_string(), "2".to_string());
        other.redirect.patterns = vec!["/data/data/**".to_string(), "/mnt/obb/**".to_string()];
        other.hooks.file_redirect = false;

        base.merge(other).unwrap();

        assert_eq!(base.storage.root, PathBuf::from("/srv/appvirt"));
        assert_eq!(base.launcher.program, "/usr/bin/app-host");
        assert_eq!(base.launcher.env.len(), 2);
        assert_eq!(base.redirect.patterns.len(), 5);
        assert!(!base.hooks.file_redirect);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("appvirt.json");
        std::fs::write(&path, r#"{"storage": {"root": "/tmp/appvirt"}}"#).unwrap();
        let config = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/tmp/appvirt"));

        assert!(RuntimeConfig::from_file(dir.path().join("missing.json")).is_err());
    }
}
