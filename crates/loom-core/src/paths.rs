use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Subtrees that are never watched, primed, or reported.
pub const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    ".next",
    ".nuxt",
    ".output",
    "coverage",
    "__pycache__",
];

pub const IGNORED_FILES: &[&str] = &[".DS_Store", "Thumbs.db"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path must be relative to the workspace root: {0}")]
    Absolute(String),
    #[error("path escapes the workspace root: {0}")]
    EscapesRoot(String),
    #[error("path has leading or trailing whitespace: {0:?}")]
    Padded(String),
}

/// Returns `path` relative to `root` using `/` separators, or `None` when the
/// path is the root itself or lies outside it.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

pub fn is_ignored(rel: &str) -> bool {
    let mut parts = rel.split('/').filter(|part| !part.is_empty()).peekable();
    while let Some(part) = parts.next() {
        if IGNORED_DIRS.contains(&part) {
            return true;
        }
        if parts.peek().is_none() && IGNORED_FILES.contains(&part) {
            return true;
        }
    }
    false
}

/// Joins a client-supplied relative path onto `root`, refusing anything that
/// could resolve outside of it.
pub fn resolve_relative(root: &Path, rel: &str) -> Result<PathBuf, PathError> {
    if rel.trim().is_empty() {
        return Err(PathError::Empty);
    }
    if rel.trim() != rel {
        return Err(PathError::Padded(rel.to_string()));
    }
    let candidate = Path::new(rel);
    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in candidate.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(PathError::EscapesRoot(rel.to_string())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Absolute(rel.to_string()))
            }
        }
    }
    if depth == 0 {
        return Err(PathError::Empty);
    }
    Ok(resolved)
}

/// Normalises a client-supplied relative path into the store key form.
pub fn normalize_relative(rel: &str) -> Result<String, PathError> {
    let resolved = resolve_relative(Path::new(""), rel)?;
    relative_path(Path::new(""), &resolved).ok_or(PathError::Empty)
}

pub fn project_name(root: &Path) -> String {
    root.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string())
}
