use crate::StoreError;
use farmwatch_core::{EVENTS_FILE, FORUM_FILE, ISSUES_FILE, STORE_MARKER_DIR};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const ROOT_ENV_VAR: &str = "INSHALLAH_ROOT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub root: PathBuf,
    pub store_dir: PathBuf,
    pub issues: PathBuf,
    pub forum: PathBuf,
    pub events: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let store_dir = root.join(STORE_MARKER_DIR);
        Self {
            issues: store_dir.join(ISSUES_FILE),
            forum: store_dir.join(FORUM_FILE),
            events: store_dir.join(EVENTS_FILE),
            store_dir,
            root,
        }
    }
}

/// Finds the directory holding the store marker.
///
/// An explicit `INSHALLAH_ROOT` in `env` must point at a valid root; otherwise
/// `start` and each of its ancestors are tried in turn.
pub fn resolve_store_root(
    start: &Path,
    env: &HashMap<String, String>,
) -> Result<PathBuf, StoreError> {
    if let Some(raw) = env.get(ROOT_ENV_VAR) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let path = absolutize(Path::new(trimmed));
            if !path.is_dir() {
                return Err(StoreError::Config {
                    path,
                    reason: "not a directory".to_string(),
                });
            }
            if !is_store_root(&path) {
                return Err(StoreError::Config {
                    path,
                    reason: format!("missing {STORE_MARKER_DIR}/ directory"),
                });
            }
            return Ok(path);
        }
    }

    let start = absolutize(start);
    find_store_root(&start).ok_or(StoreError::Discovery {
        start,
        marker: STORE_MARKER_DIR,
    })
}

pub fn resolve_store_root_from_env(start: &Path) -> Result<PathBuf, StoreError> {
    let env: HashMap<String, String> = std::env::vars().collect();
    resolve_store_root(start, &env)
}

fn find_store_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(path) = current {
        if is_store_root(path) {
            return Some(path.to_path_buf());
        }
        current = path.parent();
    }
    None
}

fn is_store_root(path: &Path) -> bool {
    path.join(STORE_MARKER_DIR).is_dir()
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
