use crate::listeners::{Listeners, Subscription};
use crate::paths::project_name;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MAX_RECENT: usize = 5;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("path not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Root plus recent roots; the shape handed to change listeners and persisted
/// between runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WorkspaceState {
    #[serde(default, rename = "last_workspace")]
    pub root: Option<PathBuf>,
    #[serde(default, rename = "recent_projects")]
    pub recent: Vec<PathBuf>,
}

impl WorkspaceState {
    pub fn load(path: &Path) -> Option<Self> {
        let raw = fs::read(path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        fs::write(path, data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootChange {
    Unchanged,
    Switched { root: PathBuf, previous: PathBuf },
}

/// The single current project root and its recent history.
pub struct WorkspaceRegistry {
    root: PathBuf,
    recent: Vec<PathBuf>,
    listeners: Listeners<WorkspaceState>,
}

impl WorkspaceRegistry {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
        let root = validate_directory(root.as_ref())?;
        Ok(Self {
            recent: vec![root.clone()],
            root,
            listeners: Listeners::new(),
        })
    }

    /// Appends previously persisted roots behind the current one.
    pub fn with_recent<I>(mut self, persisted: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        for path in persisted {
            if self.recent.len() >= MAX_RECENT {
                break;
            }
            if !self.recent.contains(&path) {
                self.recent.push(path);
            }
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_name(&self) -> String {
        project_name(&self.root)
    }

    pub fn recent(&self) -> &[PathBuf] {
        &self.recent
    }

    pub fn state(&self) -> WorkspaceState {
        WorkspaceState {
            root: Some(self.root.clone()),
            recent: self.recent.clone(),
        }
    }

    /// Callbacks run synchronously, in registration order, after every
    /// successful switch.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&WorkspaceState) + Send + Sync + 'static,
    {
        self.listeners.attach(callback)
    }

    /// Switches to `path`. On error the registry is left untouched.
    pub fn set_root(&mut self, path: impl AsRef<Path>) -> Result<RootChange, WorkspaceError> {
        let resolved = validate_directory(path.as_ref())?;
        if resolved == self.root {
            return Ok(RootChange::Unchanged);
        }
        let previous = std::mem::replace(&mut self.root, resolved.clone());
        self.push_recent(resolved.clone());
        self.listeners.emit(&self.state());
        Ok(RootChange::Switched {
            root: resolved,
            previous,
        })
    }

    fn push_recent(&mut self, path: PathBuf) {
        self.recent.retain(|existing| existing != &path);
        self.recent.insert(0, path);
        self.recent.truncate(MAX_RECENT);
    }
}

/// Resolves `path` against the process cwd and requires an existing directory.
pub fn validate_directory(path: &Path) -> Result<PathBuf, WorkspaceError> {
    let resolved = fs::canonicalize(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => WorkspaceError::NotFound(path.to_path_buf()),
        _ => WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    if !resolved.is_dir() {
        return Err(WorkspaceError::NotADirectory(resolved));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn dirs(count: usize) -> (TempDir, Vec<PathBuf>) {
        let base = tempfile::tempdir().expect("tempdir");
        let mut paths = Vec::new();
        for idx in 0..count {
            let path = base.path().join(format!("proj-{idx}"));
            fs::create_dir_all(&path).expect("mkdir");
            paths.push(fs::canonicalize(&path).expect("canonical"));
        }
        (base, paths)
    }

    #[test]
    fn open_rejects_missing_and_non_directory_roots() {
        let (base, _) = dirs(0);
        let file = base.path().join("file.txt");
        fs::write(&file, "x").expect("write");

        assert!(matches!(
            WorkspaceRegistry::open(base.path().join("missing")),
            Err(WorkspaceError::NotFound(_))
        ));
        assert!(matches!(
            WorkspaceRegistry::open(&file),
            Err(WorkspaceError::NotADirectory(_))
        ));
    }

    #[test]
    fn failed_switch_leaves_root_and_recent_untouched() {
        let (base, paths) = dirs(1);
        let mut registry = WorkspaceRegistry::open(&paths[0]).expect("open");

        let err = registry
            .set_root(base.path().join("nope"))
            .expect_err("missing dir");
        assert!(matches!(err, WorkspaceError::NotFound(_)));
        assert_eq!(registry.root(), paths[0].as_path());
        assert_eq!(registry.recent(), &paths[..1]);
    }

    #[test]
    fn switching_to_current_root_is_a_noop() {
        let (_base, paths) = dirs(1);
        let mut registry = WorkspaceRegistry::open(&paths[0]).expect("open");
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let _sub = registry.on_change(move |_| *counter.lock().expect("count") += 1);

        assert_eq!(
            registry.set_root(&paths[0]).expect("same root"),
            RootChange::Unchanged
        );
        assert_eq!(*calls.lock().expect("count"), 0);
    }

    #[test]
    fn recent_list_is_deduplicated_most_recent_first_and_bounded() {
        let (_base, paths) = dirs(7);
        let mut registry = WorkspaceRegistry::open(&paths[0]).expect("open");
        for path in &paths[1..] {
            registry.set_root(path).expect("switch");
        }
        registry.set_root(&paths[4]).expect("switch back");

        let expected = vec![
            paths[4].clone(),
            paths[6].clone(),
            paths[5].clone(),
            paths[3].clone(),
            paths[2].clone(),
        ];
        assert_eq!(registry.recent(), expected.as_slice());
        assert_eq!(registry.recent().len(), MAX_RECENT);
    }

    #[test]
    fn change_listeners_run_in_registration_order_with_new_root() {
        let (_base, paths) = dirs(2);
        let mut registry = WorkspaceRegistry::open(&paths[0]).expect("open");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        let _a = registry.on_change(move |state| {
            first
                .lock()
                .expect("seen")
                .push(("first", state.root.clone()));
        });
        let second = seen.clone();
        let _b = registry.on_change(move |state| {
            second
                .lock()
                .expect("seen")
                .push(("second", state.root.clone()));
        });

        let change = registry.set_root(&paths[1]).expect("switch");
        assert_eq!(
            change,
            RootChange::Switched {
                root: paths[1].clone(),
                previous: paths[0].clone()
            }
        );
        assert_eq!(
            *seen.lock().expect("seen"),
            vec![
                ("first", Some(paths[1].clone())),
                ("second", Some(paths[1].clone()))
            ]
        );
    }

    #[test]
    fn persisted_state_round_trips_and_seeds_recent() {
        let (base, paths) = dirs(3);
        let file = base.path().join("state").join("workspace.json");
        let state = WorkspaceState {
            root: Some(paths[1].clone()),
            recent: vec![paths[1].clone(), paths[2].clone(), paths[0].clone()],
        };
        state.save(&file).expect("save");

        let loaded = WorkspaceState::load(&file).expect("load");
        assert_eq!(loaded, state);

        let registry = WorkspaceRegistry::open(&paths[0])
            .expect("open")
            .with_recent(loaded.recent);
        assert_eq!(
            registry.recent(),
            &[paths[0].clone(), paths[1].clone(), paths[2].clone()]
        );
    }
}
