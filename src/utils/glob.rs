//! Glob patterns for host path matching.
//!
//! Redirect rules in the runtime configuration are written as globs over
//! absolute host paths and compiled to anchored regular expressions once, when
//! the [`PathRedirector`](crate::providers::io::PathRedirector) is built.
//!
//! Supported glob syntax:
//! - `*` - any characters except `/` (one path component)
//! - `**` - any characters including `/` (any number of components)
//! - `?` - exactly one character except `/`
//! - `[...]` - character class, passed through to the regex
//! - everything else is literal
//!
//! # Examples
//!
//! ```
//! use appvirt::utils::glob::glob_to_regex;
//!
//! # fn main() -> anyhow::Result<()> {
//! let re = glob_to_regex("/data/data/**")?;
//! assert!(re.is_match("/data/data/com.demo.app/files/prefs.xml"));
//! assert!(!re.is_match("/data/local/tmp/x"));
//!
//! let re = glob_to_regex("/data/user/*/com.demo.app/**")?;
//! assert!(re.is_match("/data/user/0/com.demo.app/cache/a"));
//! assert!(!re.is_match("/data/user/0/x/com.demo.app/cache/a"));
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Context, Result};
use regex::Regex;

/// Compiles a glob pattern into an anchored regular expression.
///
/// # Errors
///
/// Fails on an unclosed `[` or when the resulting regex does not compile.
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let regex_str = glob_to_regex_string(glob)?;
    Regex::new(&regex_str).map_err(|e| anyhow!("Failed to compile glob pattern to regex: {}", e))
}

/// Compiles every pattern, naming the first one that fails.
pub fn compile_all<S: AsRef<str>>(globs: &[S]) -> Result<Vec<Regex>> {
    globs
        .iter()
        .map(|glob| {
            let glob = glob.as_ref();
            glob_to_regex(glob).with_context(|| format!("Invalid glob pattern: {}", glob))
        })
        .collect()
}

/// Whether `path` matches any of the compiled patterns.
pub fn matches_any(patterns: &[Regex], path: &str) -> bool {
    patterns.iter().any(|re| re.is_match(path))
}

/// Translates the glob one character at a time.
///
/// `**` becomes `.*`, `*` becomes `[^/]*`, `?` becomes `[^/]`, a `[...]` class
/// is copied through up to its closing `]`, and any other character is
/// escaped. The result is anchored with `^` and `$`.
fn glob_to_regex_string(glob: &str) -> Result<String> {
    let mut regex = String::with_capacity(glob.len() * 2 + 2);
    regex.push('^');

    let mut chars = glob.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '*' => {
                if chars.next_if(|&(_, next)| next == '*').is_some() {
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            '[' => {
                let close = glob[i..].find(']').ok_or_else(|| {
                    anyhow!(
                        "Unclosed character class '[' at position {} in glob pattern: {}",
                        i,
                        glob
                    )
                })?;
                regex.push_str(&glob[i..i + close + 1]);
                // Skip the rest of the class; `]` is ASCII so byte offsets line up.
                while chars.next_if(|&(j, _)| j <= i + close).is_some() {}
            }
            _ => {
                let mut buf = [0u8; 4];
                regex.push_str(&regex::escape(c.encode_utf8(&mut buf)));
            }
        }
    }

    regex.push('$');
    Ok(regex)
}
