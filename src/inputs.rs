//! Input resolution for tasks.
//!
//! Glob expressions are resolved against a base directory into a sorted,
//! de-duplicated file set. Each file remembers its path below the glob's
//! static prefix so copy-style transforms can mirror the source layout.

use globset::{Glob, GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::error::ConfigError;
use crate::{klog_trace, Result};

/// A resolved input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: PathBuf,
    /// Path below the static prefix of the glob that matched it.
    pub relative: PathBuf,
}

fn has_meta(s: &str) -> bool {
    s.contains(['*', '?', '[', '{'])
}

fn normalize(pattern: &str) -> &str {
    pattern.trim_start_matches("./")
}

/// Leading directory of `pattern` that contains no glob metacharacters.
///
/// A pattern without metacharacters names a file, so its parent is returned.
pub fn static_prefix(pattern: &str) -> PathBuf {
    let path = Path::new(pattern);
    let mut prefix = PathBuf::new();
    let mut all_literal = true;
    for component in path.components() {
        match component {
            Component::Normal(part) if has_meta(&part.to_string_lossy()) => {
                all_literal = false;
                break;
            }
            Component::CurDir => {}
            other => prefix.push(other.as_os_str()),
        }
    }
    if all_literal {
        prefix.pop();
    }
    prefix
}

/// Directory depth below the static prefix a pattern can reach, if bounded.
fn max_depth(pattern: &str) -> Option<usize> {
    let pattern = normalize(pattern);
    if pattern.contains("**") || pattern.contains('{') {
        return None;
    }
    let total = Path::new(pattern).components().count();
    Some(total.saturating_sub(static_prefix(pattern).components().count()))
}

fn glob(pattern: &str) -> std::result::Result<Glob, ConfigError> {
    GlobBuilder::new(normalize(pattern))
        .literal_separator(true)
        .build()
        .map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.kind().to_string(),
        })
}

/// Compile a project-relative glob.
///
/// `*` and `?` stay within one path component, `**` crosses directories and
/// `{a,b}` matches either alternative.
pub fn compile(pattern: &str) -> std::result::Result<GlobMatcher, ConfigError> {
    Ok(glob(pattern)?.compile_matcher())
}

/// Compile several globs into one set.
pub fn compile_set(patterns: &[String]) -> std::result::Result<GlobSet, ConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(glob(pattern)?);
    }
    builder.build().map_err(|e| ConfigError::InvalidPattern {
        pattern: patterns.join(", "),
        reason: e.kind().to_string(),
    })
}

/// Check that every pattern compiles.
pub fn validate_patterns(patterns: &[String]) -> std::result::Result<(), ConfigError> {
    for pattern in patterns {
        glob(pattern)?;
    }
    Ok(())
}

/// Resolve `patterns` under `base`, dropping files matched by `exclude`.
///
/// Each pattern walks only its static prefix. Patterns and exclusions are
/// matched against paths relative to `base`.
pub fn resolve_inputs(base: &Path, patterns: &[String], exclude: &[String]) -> Result<Vec<InputFile>> {
    let excluded = compile_set(exclude)?;

    let mut files: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
    for pattern in patterns {
        let matcher = compile(pattern)?;
        let prefix = base.join(static_prefix(pattern));
        let mut walker = WalkDir::new(&prefix).follow_links(true);
        if let Some(depth) = max_depth(pattern) {
            walker = walker.max_depth(depth);
        }
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    klog_trace!("resolve_inputs: skipping {}: {}", prefix.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Ok(below_base) = path.strip_prefix(base) else {
                continue;
            };
            if !matcher.is_match(below_base) || excluded.is_match(below_base) {
                continue;
            }
            let relative = path
                .strip_prefix(&prefix)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| path.file_name().map(PathBuf::from).unwrap_or_default());
            files.entry(path.to_path_buf()).or_insert(relative);
        }
    }

    Ok(files
        .into_iter()
        .map(|(path, relative)| InputFile { path, relative })
        .collect())
}
