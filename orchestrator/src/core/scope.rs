//! Deterministic path normalization and scope matching.
//!
//! Patterns without glob metacharacters are component-aware prefixes
//! (`src` matches `src/lib.rs` but not `srcx/lib.rs`). Patterns containing
//! `*`, `?` or `[` are globs where `*` never crosses `/` and `**` spans
//! directories.

use std::path::{Component, Path};

use anyhow::{Context, Result, anyhow};
use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Normalize a repo-relative path to `a/b/c` form.
///
/// Rejects absolute paths and paths that escape the root via `..`.
pub fn normalize_path(raw: &str) -> Result<String> {
    let unified = raw.replace('\\', "/");
    let path = Path::new(&unified);
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(anyhow!("path escapes the working copy: '{raw}'"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("path must be relative: '{raw}'"));
            }
        }
    }
    if parts.is_empty() {
        return Err(anyhow!("empty path: '{raw}'"));
    }
    Ok(parts.join("/"))
}

#[derive(Debug, Clone)]
enum Matcher {
    Prefix(String),
    Glob(Pattern),
}

/// Compiled set of path patterns.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    matchers: Vec<Matcher>,
}

impl PathMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut matchers = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            if raw.contains(['*', '?', '[']) {
                let pattern =
                    Pattern::new(raw).with_context(|| format!("invalid glob pattern '{raw}'"))?;
                matchers.push(Matcher::Glob(pattern));
            } else {
                let prefix = raw.trim_end_matches('/');
                let prefix = if prefix.is_empty() || prefix == "." {
                    String::new()
                } else {
                    normalize_path(prefix)?
                };
                matchers.push(Matcher::Prefix(prefix));
            }
        }
        Ok(Self { matchers })
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// `path` must already be normalized.
    pub fn matches(&self, path: &str) -> bool {
        self.matchers.iter().any(|matcher| match matcher {
            Matcher::Prefix(prefix) => is_under(path, prefix),
            Matcher::Glob(pattern) => pattern.matches_with(path, MATCH_OPTIONS),
        })
    }
}

fn is_under(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Split `paths` into (inside scope, outside scope), preserving order.
pub fn partition_by_scope<'a>(
    scope: &PathMatcher,
    paths: impl IntoIterator<Item = &'a str>,
) -> (Vec<&'a str>, Vec<&'a str>) {
    paths.into_iter().partition(|path| scope.matches(path))
}
