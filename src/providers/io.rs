//! File-path redirection for virtual apps.
//!
//! App-private host locations (by default `/data/data/`, `/data/user/`,
//! `/sdcard/Android/data/` and `/storage/emulated/0/Android/data/`) are
//! mirrored under a virtual root: `/data/data/com.demo.app/files/a` becomes
//! `<root>/data/data/com.demo.app/files/a`.
//!
//! `open`, `openat`, `access` and `stat` are all redirected, so an app that
//! checks for a file sees the same copy it later opens.

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use regex::Regex;
use serde_json::Value;

use crate::config::RedirectConfig;
use crate::hook::interceptor::{CallContext, Decision, Interceptor};
use crate::hook::target::HookTarget;
use crate::utils::glob::{compile_all, matches_any};

pub const LIBC: &str = "libc.so";

pub fn open_target() -> HookTarget {
    HookTarget::native(LIBC, "open")
}

pub fn openat_target() -> HookTarget {
    HookTarget::native(LIBC, "openat")
}

pub fn access_target() -> HookTarget {
    HookTarget::native(LIBC, "access")
}

pub fn stat_target() -> HookTarget {
    HookTarget::native(LIBC, "stat")
}

/// Rewrites matching host paths into the virtual root.
#[derive(Debug, Clone)]
pub struct PathRedirector {
    root: PathBuf,
    patterns: Vec<Regex>,
}

impl PathRedirector {
    /// Compiles `patterns` (globs over absolute paths) for redirection into `root`.
    pub fn new<S: AsRef<str>>(root: impl Into<PathBuf>, patterns: &[S]) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            patterns: compile_all(patterns)?,
        })
    }

    pub fn from_config(root: impl Into<PathBuf>, config: &RedirectConfig) -> Result<Self> {
        Self::new(root, config.patterns.as_slice())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn should_redirect(&self, path: &str) -> bool {
        matches_any(&self.patterns, path)
    }

    /// The redirected location of `path`, or `None` if it stays on the host.
    ///
    /// Paths containing `..` are never redirected, so a redirected path can
    /// not climb out of the virtual root.
    pub fn redirect(&self, path: &str) -> Option<PathBuf> {
        if !self.should_redirect(path) {
            return None;
        }
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            tracing::debug!("Not redirecting {}: contains '..'", path);
            return None;
        }
        let redirected = self.root.join(path.trim_start_matches('/'));
        tracing::debug!("Redirecting {} -> {}", path, redirected.display());
        Some(redirected)
    }
}

/// Rewrites the path argument of a libc file call before the real call runs.
pub struct PathRedirectHook {
    redirector: PathRedirector,
    path_arg: usize,
    create_parent: bool,
}

impl PathRedirectHook {
    /// For calls that may create the file: the redirected parent directory
    /// is created first.
    pub fn for_open(redirector: PathRedirector, path_arg: usize) -> Self {
        Self {
            redirector,
            path_arg,
            create_parent: true,
        }
    }

    /// For calls that only inspect the path; nothing is created.
    pub fn for_lookup(redirector: PathRedirector, path_arg: usize) -> Self {
        Self {
            redirector,
            path_arg,
            create_parent: false,
        }
    }

    pub fn redirector(&self) -> &PathRedirector {
        &self.redirector
    }
}

impl Interceptor for PathRedirectHook {
    fn name(&self) -> &str {
        "path-redirect"
    }

    fn before(&self, ctx: &mut CallContext) -> Result<Decision> {
        let Some(redirected) = ctx
            .arg_str(self.path_arg)
            .and_then(|path| self.redirector.redirect(path))
        else {
            return Ok(Decision::Continue);
        };
        if self.create_parent {
            if let Some(parent) = redirected.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        ctx.args[self.path_arg] = Value::String(redirected.to_string_lossy().into_owned());
        Ok(Decision::Continue)
    }
}

/// Redirect hooks for every libc file call, keyed by target.
pub fn redirect_hooks(redirector: &PathRedirector) -> Vec<(HookTarget, PathRedirectHook)> {
    vec![
        (open_target(), PathRedirectHook::for_open(redirector.clone(), 0)),
        (openat_target(), PathRedirectHook::for_open(redirector.clone(), 1)),
        (access_target(), PathRedirectHook::for_lookup(redirector.clone(), 0)),
        (stat_target(), PathRedirectHook::for_lookup(redirector.clone(), 0)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::bridge::CallSiteBridge;
    use crate::hook::dispatcher::Dispatcher;
    use crate::hook::registry::HookRegistry;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn redirector(root: &Path) -> PathRedirector {
        PathRedirector::from_config(root, &RedirectConfig::default()).unwrap()
    }

    #[test]
    fn test_default_prefixes_redirect() {
        let root = TempDir::new().unwrap();
        let r = redirector(root.path());

        for path in [
            "/data/data/com.demo.app/files/a",
            "/data/user/0/com.demo.app/cache/b",
            "/sdcard/Android/data/com.demo.app/c",
            "/storage/emulated/0/Android/data/com.demo.app/d",
        ] {
            let redirected = r.redirect(path).unwrap();
            assert_eq!(redirected, root.path().join(&path[1..]));
        }
    }

    #[test]
    fn test_other_paths_stay_on_host() {
        let root = TempDir::new().unwrap();
        let r = redirector(root.path());
        assert!(r.redirect("/system/lib/libc.so").is_none());
        assert!(r.redirect("/data/local/tmp/x").is_none());
        assert!(r.redirect("relative/data/data/x").is_none());
        assert!(r.redirect("/data/data/../../etc/passwd").is_none());
    }

    #[test]
    fn test_custom_patterns() {
        let root = TempDir::new().unwrap();
        let r = PathRedirector::new(root.path(), &["/mnt/obb/*/main.obb"]).unwrap();
        assert!(r.should_redirect("/mnt/obb/com.demo.app/main.obb"));
        assert!(!r.should_redirect("/mnt/obb/com.demo.app/patch.obb"));
        assert!(PathRedirector::new(root.path(), &["/mnt/[obb"]).is_err());
    }

    #[test]
    fn test_open_hook_rewrites_path_argument() {
        let root = TempDir::new().unwrap();
        let registry = Arc::new(HookRegistry::new(Arc::new(CallSiteBridge::new())));
        registry
            .register(open_target(), Arc::new(PathRedirectHook::for_open(redirector(root.path()), 0)))
            .unwrap();
        let dispatcher = Dispatcher::new(registry);

        let opened = dispatcher
            .dispatch(
                &open_target(),
                None,
                vec![json!("/data/data/com.demo.app/shared_prefs/p.xml"), json!(0)],
                |ctx| Ok(ctx.args[0].clone()),
            )
            .unwrap();

        let expected = root.path().join("data/data/com.demo.app/shared_prefs/p.xml");
        assert_eq!(opened, json!(expected.to_string_lossy()));
        assert!(expected.parent().unwrap().is_dir());

        let untouched = dispatcher
            .dispatch(&open_target(), None, vec![json!("/etc/hosts")], |ctx| {
                Ok(ctx.args[0].clone())
            })
            .unwrap();
        assert_eq!(untouched, json!("/etc/hosts"));
    }

    fn dispatcher(root: &Path) -> Dispatcher {
        let registry = Arc::new(HookRegistry::new(Arc::new(CallSiteBridge::new())));
        for (target, hook) in redirect_hooks(&redirector(root)) {
            registry.register(target, Arc::new(hook)).unwrap();
        }
        Dispatcher::new(registry)
    }

    #[test]
    fn test_openat_rewrites_second_argument() {
        let root = TempDir::new().unwrap();
        let dispatcher = dispatcher(root.path());

        let args = dispatcher
            .dispatch(
                &openat_target(),
                None,
                vec![json!(-100), json!("/data/data/com.demo.app/files/db"), json!(0)],
                |ctx| Ok(Value::Array(ctx.args.clone())),
            )
            .unwrap();

        let expected = root.path().join("data/data/com.demo.app/files/db");
        assert_eq!(args[0], json!(-100));
        assert_eq!(args[1], json!(expected.to_string_lossy()));
        assert!(expected.parent().unwrap().is_dir());
    }

    #[test]
    fn test_access_and_stat_see_the_opened_copy() {
        let root = TempDir::new().unwrap();
        let dispatcher = dispatcher(root.path());
        let path = "/data/data/com.demo.app/files/state";

        let opened = dispatcher
            .dispatch(&open_target(), None, vec![json!(path), json!(0)], |ctx| {
                Ok(ctx.args[0].clone())
            })
            .unwrap();
        for target in [access_target(), stat_target()] {
            let looked_up = dispatcher
                .dispatch(&target, None, vec![json!(path), json!(0)], |ctx| {
                    Ok(ctx.args[0].clone())
                })
                .unwrap();
            assert_eq!(looked_up, opened);
        }
    }

    #[test]
    fn test_lookup_does_not_create_directories() {
        let root = TempDir::new().unwrap();
        let dispatcher = dispatcher(root.path());

        let looked_up = dispatcher
            .dispatch(
                &stat_target(),
                None,
                vec![json!("/data/user/0/com.demo.app/missing/file")],
                |ctx| Ok(ctx.args[0].clone()),
            )
            .unwrap();

        let expected = root.path().join("data/user/0/com.demo.app/missing/file");
        assert_eq!(looked_up, json!(expected.to_string_lossy()));
        assert!(!root.path().join("data").exists());
    }
}
