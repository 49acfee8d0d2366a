use loom_core::{
    paths::{is_ignored, relative_path},
    FileEventKind,
};
use notify::{
    event::{CreateKind, ModifyKind},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const DEFAULT_QUIESCENCE_MS: u64 = 300;
pub const DEFAULT_POLL_MS: u64 = 100;
pub const DEFAULT_MAX_PRIME_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WatchPolicy {
    /// How long a file must stay unchanged before its event is reported.
    pub quiescence: Duration,
    pub poll_interval: Duration,
    /// Seed the baseline store from disk when a root is opened. Off by
    /// default: baselines normally come from what the client has read.
    pub prime_baseline: bool,
    pub max_prime_bytes: u64,
}

impl Default for WatchPolicy {
    fn default() -> Self {
        Self {
            quiescence: Duration::from_millis(DEFAULT_QUIESCENCE_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            prime_baseline: false,
            max_prime_bytes: DEFAULT_MAX_PRIME_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: FileEventKind,
    /// Root-relative, `/`-separated.
    pub path: String,
}

type SharedWatcher = Arc<Mutex<RecommendedWatcher>>;

/// Watcher over one root. Every visible directory gets its own non-recursive
/// watch, so ignored subtrees never cost an OS handle. Dropping it (or
/// calling [`stop`]) releases the handles and ends the event stream.
///
/// [`stop`]: WatchEngine::stop
pub struct WatchEngine {
    root: PathBuf,
    watcher: Option<SharedWatcher>,
    task: JoinHandle<()>,
}

impl WatchEngine {
    pub fn start(
        root: &Path,
        policy: &WatchPolicy,
        sink: mpsc::UnboundedSender<WatchEvent>,
    ) -> notify::Result<Self> {
        let root = root.to_path_buf();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = raw_tx.send(event);
            }
            Err(err) => warn!(event = "watch_backend_error", error = %err),
        })?;
        watcher.watch(&root, RecursiveMode::NonRecursive)?;
        let watcher = Arc::new(Mutex::new(watcher));

        let task = tokio::spawn(pump(
            root.clone(),
            watcher.clone(),
            policy.quiescence,
            policy.poll_interval,
            raw_rx,
            sink,
        ));
        info!(event = "watch_started", root = %root.display());
        Ok(Self {
            root,
            watcher: Some(watcher),
            task,
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            let _ = lock_watcher(&watcher).unwatch(&self.root);
            self.task.abort();
            info!(event = "watch_stopped", root = %self.root.display());
        }
    }
}

impl Drop for WatchEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock_watcher(watcher: &SharedWatcher) -> std::sync::MutexGuard<'_, RecommendedWatcher> {
    watcher.lock().unwrap_or_else(PoisonError::into_inner)
}

fn watch_dir(watcher: &SharedWatcher, dir: &Path) {
    if let Err(err) = lock_watcher(watcher).watch(dir, RecursiveMode::NonRecursive) {
        warn!(event = "watch_failed", dir = %dir.display(), error = %err);
    }
}

type Fingerprint = (u64, Option<SystemTime>);

struct PendingFile {
    kind: FileEventKind,
    stable_since: Instant,
    fingerprint: Option<Fingerprint>,
}

struct Tracker {
    root: PathBuf,
    watcher: SharedWatcher,
    quiescence: Duration,
    files: HashSet<String>,
    dirs: HashSet<String>,
    pending: HashMap<String, PendingFile>,
}

impl Tracker {
    fn new(root: PathBuf, watcher: SharedWatcher, quiescence: Duration) -> Self {
        Self {
            root,
            watcher,
            quiescence,
            files: HashSet::new(),
            dirs: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    fn absolute(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn classify(&mut self, event: &Event, out: &mut Vec<WatchEvent>) {
        if matches!(
            event.kind,
            EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_))
        ) {
            return;
        }
        for path in &event.paths {
            let Some(rel) = relative_path(&self.root, path) else {
                continue;
            };
            if is_ignored(&rel) {
                continue;
            }
            match event.kind {
                EventKind::Create(CreateKind::Folder) => {
                    if !self.dirs.contains(&rel) {
                        self.dir_added(rel, out);
                    }
                }
                EventKind::Remove(_) => self.gone(&rel, out),
                _ => match fs::metadata(path) {
                    Ok(meta) if meta.is_dir() => {
                        if !self.dirs.contains(&rel) {
                            self.dir_added(rel, out);
                        }
                    }
                    Ok(meta) => self.touch(rel, Some(fingerprint(&meta))),
                    Err(_) => self.gone(&rel, out),
                },
            }
        }
    }

    fn touch(&mut self, rel: String, fingerprint: Option<Fingerprint>) {
        let kind = match self.pending.get(&rel) {
            Some(existing) => existing.kind,
            None if self.files.contains(&rel) => FileEventKind::Changed,
            None => FileEventKind::Added,
        };
        self.pending.insert(
            rel,
            PendingFile {
                kind,
                stable_since: Instant::now(),
                fingerprint,
            },
        );
    }

    fn dir_added(&mut self, rel: String, out: &mut Vec<WatchEvent>) {
        self.dirs.insert(rel.clone());
        out.push(WatchEvent {
            kind: FileEventKind::DirAdded,
            path: rel.clone(),
        });
        // Files written into a fresh directory can land before its watch does.
        let base = self.absolute(&rel);
        watch_dir(&self.watcher, &base);
        for entry in walk(&base) {
            let Some(child) = relative_path(&self.root, entry.path()) else {
                continue;
            };
            if entry.file_type().is_dir() {
                watch_dir(&self.watcher, entry.path());
                if self.dirs.insert(child.clone()) {
                    out.push(WatchEvent {
                        kind: FileEventKind::DirAdded,
                        path: child,
                    });
                }
            } else if !self.files.contains(&child) && !self.pending.contains_key(&child) {
                let print = entry.metadata().ok().map(|meta| fingerprint(&meta));
                self.touch(child, print);
            }
        }
    }

    fn gone(&mut self, rel: &str, out: &mut Vec<WatchEvent>) {
        if self.dirs.remove(rel) {
            let prefix = format!("{rel}/");
            let mut files: Vec<String> = self
                .files
                .iter()
                .filter(|file| file.starts_with(&prefix))
                .cloned()
                .collect();
            files.sort();
            for file in files {
                self.files.remove(&file);
                self.pending.remove(&file);
                out.push(WatchEvent {
                    kind: FileEventKind::Removed,
                    path: file,
                });
            }
            self.pending.retain(|path, _| !path.starts_with(&prefix));
            self.dirs.retain(|dir| !dir.starts_with(&prefix));
            out.push(WatchEvent {
                kind: FileEventKind::DirRemoved,
                path: rel.to_string(),
            });
            return;
        }
        self.pending.remove(rel);
        if self.files.remove(rel) {
            out.push(WatchEvent {
                kind: FileEventKind::Removed,
                path: rel.to_string(),
            });
        }
    }

    /// Re-stats pending files and flushes those quiet for the full window.
    fn settle(&mut self, now: Instant, out: &mut Vec<WatchEvent>) {
        let mut ready = Vec::new();
        let mut vanished = Vec::new();
        for (rel, pending) in self.pending.iter_mut() {
            let current = match fs::metadata(self.root.join(rel)) {
                Ok(meta) if meta.is_file() => fingerprint(&meta),
                _ => {
                    vanished.push(rel.clone());
                    continue;
                }
            };
            if pending.fingerprint != Some(current) {
                pending.fingerprint = Some(current);
                pending.stable_since = now;
                continue;
            }
            if now.duration_since(pending.stable_since) >= self.quiescence {
                ready.push(rel.clone());
            }
        }
        for rel in vanished {
            self.gone(&rel, out);
        }
        ready.sort();
        for rel in ready {
            if let Some(pending) = self.pending.remove(&rel) {
                self.files.insert(rel.clone());
                out.push(WatchEvent {
                    kind: pending.kind,
                    path: rel,
                });
            }
        }
    }
}

async fn pump(
    root: PathBuf,
    watcher: SharedWatcher,
    quiescence: Duration,
    poll_interval: Duration,
    mut raw_rx: mpsc::UnboundedReceiver<Event>,
    sink: mpsc::UnboundedSender<WatchEvent>,
) {
    let mut tracker = Tracker::new(root.clone(), watcher.clone(), quiescence);
    let index_root = root.clone();
    let indexed = tokio::task::spawn_blocking(move || {
        index_tree(&index_root, |dir| watch_dir(&watcher, dir))
    });
    match indexed.await {
        Ok((files, dirs)) => {
            debug!(event = "watch_indexed", files = files.len(), dirs = dirs.len());
            tracker.files = files;
            tracker.dirs = dirs;
        }
        Err(err) => warn!(event = "watch_index_failed", error = %err),
    }

    let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut out = Vec::new();
    loop {
        tokio::select! {
            raw = raw_rx.recv() => {
                let Some(raw) = raw else { break };
                tracker.classify(&raw, &mut out);
            }
            _ = ticker.tick(), if !tracker.pending.is_empty() => {
                tracker.settle(Instant::now(), &mut out);
            }
            _ = sink.closed() => break,
        }
        for event in out.drain(..) {
            debug!(event = "watch_event", kind = event.kind.as_str(), path = %event.path);
            if sink.send(event).is_err() {
                return;
            }
        }
    }
}

fn fingerprint(meta: &fs::Metadata) -> Fingerprint {
    (meta.len(), meta.modified().ok())
}

fn walk(base: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(base)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !is_ignored(&name)
        })
        .filter_map(Result::ok)
}

/// Indexes the visible tree, calling `on_dir` for each directory as the walk
/// reaches it. Ignored subtrees are never entered.
fn index_tree(
    root: &Path,
    mut on_dir: impl FnMut(&Path),
) -> (HashSet<String>, HashSet<String>) {
    let mut files = HashSet::new();
    let mut dirs = HashSet::new();
    for entry in walk(root) {
        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };
        if entry.file_type().is_dir() {
            on_dir(entry.path());
            dirs.insert(rel);
        } else if entry.file_type().is_file() {
            files.insert(rel);
        }
    }
    (files, dirs)
}

/// Reads every non-ignored UTF-8 text file under `root` no larger than
/// `max_bytes`. Used to prime baselines without emitting events.
pub fn scan_files(root: &Path, max_bytes: u64) -> Vec<(String, String)> {
    let mut found = Vec::new();
    for entry in walk(root) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };
        match entry.metadata() {
            Ok(meta) if meta.len() <= max_bytes => {}
            _ => continue,
        }
        if let Ok(content) = fs::read_to_string(entry.path()) {
            found.push((rel, content));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found
}
