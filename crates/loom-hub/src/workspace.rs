use crate::bus::ControlBus;
use crate::session::SessionRegistry;
use crate::watch::{scan_files, WatchEngine, WatchEvent, WatchPolicy};
use loom_core::{
    paths::{normalize_relative, resolve_relative, PathError},
    workspace::validate_directory,
    ControlMessage, FileEventKind, PendingReview, ReconcileOutcome, Reconciler, Rejection,
    ReviewResolution, RootChange, Subscription, WorkspaceError, WorkspaceRegistry,
    WorkspaceState,
};
use serde::Serialize;
use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FileError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FileError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    pub project_name: String,
    pub recent_roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrowseEntry {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrowseListing {
    pub current: String,
    pub parent: String,
    pub dirs: Vec<BrowseEntry>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveWatch {
    engine: WatchEngine,
    task: JoinHandle<()>,
}

impl ActiveWatch {
    fn stop(self) {
        self.engine.stop();
        self.task.abort();
    }
}

struct Current {
    registry: WorkspaceRegistry,
    watch: Option<ActiveWatch>,
}

struct WorkspaceInner {
    current: Mutex<Current>,
    reconciler: Arc<Mutex<Reconciler>>,
    sessions: SessionRegistry,
    bus: ControlBus,
    policy: WatchPolicy,
    _persist: Option<Subscription>,
}

impl Drop for WorkspaceInner {
    fn drop(&mut self) {
        let current = self
            .current
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(watch) = current.watch.take() {
            watch.stop();
        }
    }
}

/// The live workspace context: one root, its watcher, its reconciler, and the
/// sessions that follow it. Every root switch goes through [`Workspace::open`].
#[derive(Clone)]
pub struct Workspace {
    inner: Arc<WorkspaceInner>,
}

impl Workspace {
    /// Opens `root` and starts watching it. Must run inside a tokio runtime.
    pub fn start(
        root: &Path,
        recent: Vec<PathBuf>,
        state_file: Option<PathBuf>,
        sessions: SessionRegistry,
        bus: ControlBus,
        policy: WatchPolicy,
    ) -> Result<Self, WorkspaceError> {
        let registry = WorkspaceRegistry::open(root)?.with_recent(recent);
        let persist = state_file.map(|file| {
            persist_state(&file, &registry.state());
            registry.on_change(move |state| persist_state(&file, state))
        });
        let root = registry.root().to_path_buf();
        sessions.redirect_all(&root);

        let reconciler = Arc::new(Mutex::new(Reconciler::new(root.clone())));
        let generation = lock(&reconciler).generation();
        let watch = spawn_watch(&root, generation, &reconciler, &bus, &policy);
        info!(event = "workspace_ready", root = %root.display());

        Ok(Self {
            inner: Arc::new(WorkspaceInner {
                current: Mutex::new(Current { registry, watch }),
                reconciler,
                sessions,
                bus,
                policy,
                _persist: persist,
            }),
        })
    }

    pub fn info(&self) -> WorkspaceInfo {
        let current = lock(&self.inner.current);
        WorkspaceInfo {
            path: current.registry.root().to_path_buf(),
            project_name: current.registry.project_name(),
            recent_roots: current.registry.recent().to_vec(),
        }
    }

    pub fn root(&self) -> PathBuf {
        lock(&self.inner.current).registry.root().to_path_buf()
    }

    pub fn recent(&self) -> Vec<PathBuf> {
        lock(&self.inner.current).registry.recent().to_vec()
    }

    /// Switches the whole subsystem to `path`.
    ///
    /// On validation failure nothing changes. Otherwise, in order: the old
    /// watcher is stopped, every pending review and baseline is dropped, the
    /// new watcher starts, live sessions are sent to the new root, and
    /// `workspace-changed` is published.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<WorkspaceInfo, WorkspaceError> {
        let mut current = lock(&self.inner.current);
        let (root, previous) = match current.registry.set_root(path)? {
            RootChange::Unchanged => {
                debug!(event = "workspace_open_noop", root = %current.registry.root().display());
                drop(current);
                return Ok(self.info());
            }
            RootChange::Switched { root, previous } => (root, previous),
        };

        if let Some(watch) = current.watch.take() {
            watch.stop();
        }
        let (discarded, generation) = {
            let mut reconciler = lock(&self.inner.reconciler);
            let discarded = reconciler.reset(root.clone());
            (discarded, reconciler.generation())
        };
        current.watch = spawn_watch(
            &root,
            generation,
            &self.inner.reconciler,
            &self.inner.bus,
            &self.inner.policy,
        );
        let redirected = self.inner.sessions.redirect_all(&root);

        let info = WorkspaceInfo {
            path: root.clone(),
            project_name: current.registry.project_name(),
            recent_roots: current.registry.recent().to_vec(),
        };
        drop(current);

        info!(
            event = "workspace_switched",
            root = %root.display(),
            previous = %previous.display(),
            discarded_reviews = discarded,
            redirected_sessions = redirected
        );
        self.inner.bus.publish(ControlMessage::WorkspaceChanged {
            path: root.display().to_string(),
            project_name: info.project_name.clone(),
        });
        Ok(info)
    }

    pub fn reviews(&self) -> Vec<PendingReview> {
        lock(&self.inner.reconciler).pending()
    }

    pub fn baseline(&self, path: &str) -> Option<String> {
        lock(&self.inner.reconciler)
            .baseline(path)
            .map(str::to_string)
    }

    /// Keeps the external edit. Resolving an unknown path is a no-op.
    pub fn accept(&self, path: &str) -> Result<bool, FileError> {
        let path = normalize_relative(path)?;
        let accepted = lock(&self.inner.reconciler).accept(&path);
        let Some(review) = accepted else {
            return Ok(false);
        };
        info!(event = "review_accepted", path = %review.path);
        self.publish_resolved(review.path, ReviewResolution::Accepted);
        Ok(true)
    }

    /// Restores the pre-edit content on disk. Resolving an unknown path is a
    /// no-op.
    pub async fn reject(&self, path: &str) -> Result<bool, FileError> {
        let path = normalize_relative(path)?;
        let rejected = lock(&self.inner.reconciler).reject(&path);
        let Some(rejection) = rejected else {
            return Ok(false);
        };
        info!(event = "review_rejected", path = %rejection.path);
        self.publish_resolved(rejection.path.clone(), ReviewResolution::Rejected);
        self.restore(rejection).await;
        Ok(true)
    }

    pub fn accept_all(&self) -> usize {
        let accepted = lock(&self.inner.reconciler).accept_all();
        let count = accepted.len();
        for review in accepted {
            self.publish_resolved(review.path, ReviewResolution::Accepted);
        }
        if count > 0 {
            info!(event = "reviews_accepted", count = count);
        }
        count
    }

    pub async fn reject_all(&self) -> usize {
        let rejected = lock(&self.inner.reconciler).reject_all();
        let count = rejected.len();
        for rejection in &rejected {
            self.publish_resolved(rejection.path.clone(), ReviewResolution::Rejected);
        }
        for rejection in rejected {
            self.restore(rejection).await;
        }
        if count > 0 {
            info!(event = "reviews_rejected", count = count);
        }
        count
    }

    /// Reads a workspace file for the client, seeding its baseline if unknown.
    pub async fn read_file(&self, rel: &str) -> Result<String, FileError> {
        let key = normalize_relative(rel)?;
        let (absolute, generation) = {
            let reconciler = lock(&self.inner.reconciler);
            (
                resolve_relative(reconciler.root(), &key)?,
                reconciler.generation(),
            )
        };
        let content = tokio::fs::read_to_string(&absolute)
            .await
            .map_err(|source| FileError::Io {
                path: key.clone(),
                source,
            })?;
        let mut reconciler = lock(&self.inner.reconciler);
        if reconciler.is_current(generation) {
            reconciler.seed(&key, content.clone());
        }
        Ok(content)
    }

    /// Writes on behalf of the client. The written content becomes the
    /// baseline first so the watcher echo is recognised as a no-op.
    pub async fn write_file(&self, rel: &str, content: String) -> Result<(), FileError> {
        let key = normalize_relative(rel)?;
        let (absolute, discarded) = {
            let mut reconciler = lock(&self.inner.reconciler);
            let absolute = resolve_relative(reconciler.root(), &key)?;
            (absolute, reconciler.record_write(&key, content.clone()))
        };
        if discarded {
            self.publish_resolved(key.clone(), ReviewResolution::Discarded);
        }
        write_with_parents(&absolute, content.as_bytes())
            .await
            .map_err(|source| FileError::Io {
                path: key.clone(),
                source,
            })?;
        debug!(event = "file_written", path = %key, bytes = content.len());
        Ok(())
    }

    fn publish_resolved(&self, path: String, resolution: ReviewResolution) {
        self.inner
            .bus
            .publish(ControlMessage::ReviewResolved { path, resolution });
    }

    async fn restore(&self, rejection: Rejection) {
        if let Err(err) = write_with_parents(&rejection.absolute, rejection.content.as_bytes()).await
        {
            warn!(event = "reject_write_failed", path = %rejection.path, error = %err);
            self.inner.bus.publish(ControlMessage::error(
                "reject_write_failed",
                format!("could not restore {}: {err}", rejection.path),
            ));
        }
    }
}

async fn write_with_parents(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await
}

fn persist_state(file: &Path, state: &WorkspaceState) {
    match state.save(file) {
        Ok(()) => debug!(event = "workspace_state_saved", file = %file.display()),
        Err(err) => warn!(event = "workspace_state_save_failed", file = %file.display(), error = %err),
    }
}

fn spawn_watch(
    root: &Path,
    generation: u64,
    reconciler: &Arc<Mutex<Reconciler>>,
    bus: &ControlBus,
    policy: &WatchPolicy,
) -> Option<ActiveWatch> {
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = match WatchEngine::start(root, policy, tx) {
        Ok(engine) => engine,
        Err(err) => {
            warn!(event = "watch_start_failed", root = %root.display(), error = %err);
            bus.publish(ControlMessage::error(
                "watch_start_failed",
                format!("cannot watch {}: {err}", root.display()),
            ));
            return None;
        }
    };
    let task = tokio::spawn(reconcile_loop(
        ReconcileContext {
            root: root.to_path_buf(),
            generation,
            reconciler: reconciler.clone(),
            bus: bus.clone(),
            prime: policy.prime_baseline.then_some(policy.max_prime_bytes),
        },
        rx,
    ));
    Some(ActiveWatch { engine, task })
}

struct ReconcileContext {
    root: PathBuf,
    generation: u64,
    reconciler: Arc<Mutex<Reconciler>>,
    bus: ControlBus,
    prime: Option<u64>,
}

impl ReconcileContext {
    /// Runs `apply` only if the workspace has not moved on since this loop
    /// started. Publishing happens under the same lock, so nothing from an
    /// old root can be published after a switch.
    fn with_current<F>(&self, apply: F) -> bool
    where
        F: FnOnce(&mut Reconciler, &ControlBus),
    {
        let mut reconciler = lock(&self.reconciler);
        if !reconciler.is_current(self.generation) {
            return false;
        }
        apply(&mut reconciler, &self.bus);
        true
    }

    async fn prime(&self, max_bytes: u64) -> bool {
        let root = self.root.clone();
        let files = match tokio::task::spawn_blocking(move || scan_files(&root, max_bytes)).await {
            Ok(files) => files,
            Err(err) => {
                warn!(event = "baseline_prime_failed", error = %err);
                return true;
            }
        };
        let total = files.len();
        self.with_current(|reconciler, _| {
            let mut seeded = 0;
            for (path, content) in files {
                if reconciler.seed(&path, content) {
                    seeded += 1;
                }
            }
            info!(event = "baseline_primed", files = total, seeded = seeded);
        })
    }

    async fn handle(&self, event: WatchEvent) -> bool {
        let content = match event.kind {
            FileEventKind::Added | FileEventKind::Changed => {
                match tokio::fs::read_to_string(self.root.join(&event.path)).await {
                    Ok(content) => Some(content),
                    Err(err) => {
                        debug!(event = "watch_read_miss", path = %event.path, error = %err);
                        None
                    }
                }
            }
            _ => None,
        };

        self.with_current(|reconciler, bus| {
            bus.publish(ControlMessage::FileChanged {
                event: event.kind,
                path: event.path.clone(),
            });
            let outcome = match (event.kind, content) {
                (FileEventKind::Added, Some(content)) => reconciler.observe_added(&event.path, content),
                (FileEventKind::Changed, Some(content)) => {
                    reconciler.observe_changed(&event.path, content)
                }
                (FileEventKind::Removed, _) => reconciler.observe_removed(&event.path),
                _ => ReconcileOutcome::Unchanged,
            };
            publish_outcome(bus, &event.path, outcome);
        })
    }
}

fn publish_outcome(bus: &ControlBus, path: &str, outcome: ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::ReviewOpened(review) | ReconcileOutcome::ReviewReplaced(review) => {
            info!(event = "review_pending", path = %review.path);
            bus.publish(ControlMessage::PendingReview(review));
        }
        ReconcileOutcome::ReviewDiscarded { .. }
        | ReconcileOutcome::Removed {
            review_discarded: true,
        } => {
            debug!(event = "review_discarded", path = %path);
            bus.publish(ControlMessage::ReviewResolved {
                path: path.to_string(),
                resolution: ReviewResolution::Discarded,
            });
        }
        ReconcileOutcome::Unchanged | ReconcileOutcome::Cached | ReconcileOutcome::Removed { .. } => {}
    }
}

async fn reconcile_loop(ctx: ReconcileContext, mut events: mpsc::UnboundedReceiver<WatchEvent>) {
    if let Some(max_bytes) = ctx.prime {
        if !ctx.prime(max_bytes).await {
            return;
        }
    }
    while let Some(event) = events.recv().await {
        if !ctx.handle(event).await {
            break;
        }
    }
    debug!(event = "reconcile_loop_end", generation = ctx.generation);
}

/// Lists the visible subdirectories of `dir` for the folder picker.
pub async fn browse(dir: &Path) -> Result<BrowseListing, WorkspaceError> {
    let resolved = validate_directory(dir)?;
    let io_err = |source| WorkspaceError::Io {
        path: resolved.clone(),
        source,
    };
    let mut reader = tokio::fs::read_dir(&resolved).await.map_err(io_err)?;
    let mut dirs = Vec::new();
    while let Some(entry) = reader.next_entry().await.map_err(io_err)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        match entry.file_type().await {
            Ok(kind) if kind.is_dir() => {}
            _ => continue,
        }
        dirs.push(BrowseEntry {
            path: slashed(&entry.path()),
            name,
        });
    }
    dirs.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(BrowseListing {
        current: slashed(&resolved),
        parent: slashed(resolved.parent().unwrap_or(&resolved)),
        dirs,
    })
}

fn slashed(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusSubscription;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _base: TempDir,
        a: PathBuf,
        b: PathBuf,
        bus: ControlBus,
        workspace: Workspace,
    }

    fn policy() -> WatchPolicy {
        WatchPolicy {
            quiescence: Duration::from_millis(150),
            poll_interval: Duration::from_millis(25),
            ..WatchPolicy::default()
        }
    }

    async fn fixture() -> Fixture {
        let base = tempfile::tempdir().expect("tempdir");
        let a = base.path().join("proj-a");
        let b = base.path().join("proj-b");
        fs::create_dir_all(a.join("src")).expect("mkdir a");
        fs::create_dir_all(&b).expect("mkdir b");
        fs::write(a.join("src/x.ts"), "export const x = 1;\n").expect("seed a");
        fs::write(a.join("src/unread.ts"), "never shown\n").expect("seed unread");
        let a = fs::canonicalize(a).expect("canonical a");
        let b = fs::canonicalize(b).expect("canonical b");

        let bus = ControlBus::new(64);
        let sessions = SessionRegistry::new("/bin/sh", &a);
        let workspace = Workspace::start(&a, Vec::new(), None, sessions, bus.clone(), policy())
            .expect("start workspace");
        tokio::time::sleep(Duration::from_millis(250)).await;
        workspace.read_file("src/x.ts").await.expect("client read");
        Fixture {
            _base: base,
            a,
            b,
            bus,
            workspace,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached");
    }

    async fn next_review(sub: &mut BusSubscription) -> PendingReview {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .expect("bus message")
                .expect("bus open");
            if let ControlMessage::PendingReview(review) = &*msg {
                return review.clone();
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn external_edit_then_reject_restores_disk() {
        let fx = fixture().await;
        let mut sub = fx.bus.subscribe();

        fs::write(fx.a.join("src/x.ts"), "export const x = 2;\n").expect("external edit");
        let review = next_review(&mut sub).await;
        assert_eq!(review.path, "src/x.ts");
        assert_eq!(review.old_content, "export const x = 1;\n");
        assert_eq!(review.new_content, "export const x = 2;\n");

        assert!(fx.workspace.reject("src/x.ts").await.expect("reject"));
        assert_eq!(
            fs::read_to_string(fx.a.join("src/x.ts")).expect("read back"),
            "export const x = 1;\n"
        );
        assert_eq!(
            fx.workspace.baseline("src/x.ts").as_deref(),
            Some("export const x = 1;\n")
        );
        assert!(!fx.workspace.reject("src/x.ts").await.expect("second reject"));
    }

    async fn reviews_within(sub: &mut BusSubscription, window: Duration) -> Vec<PendingReview> {
        let deadline = tokio::time::Instant::now() + window;
        let mut reviews = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, sub.recv()).await {
            if let ControlMessage::PendingReview(review) = &*msg {
                reviews.push(review.clone());
            }
        }
        reviews
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_of_external_writes_opens_one_review_with_final_content() {
        let fx = fixture().await;
        let mut sub = fx.bus.subscribe();

        for idx in 1..=5 {
            fs::write(fx.a.join("src/x.ts"), format!("export const x = {};\n", idx * 10))
                .expect("external edit");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let reviews = reviews_within(&mut sub, Duration::from_millis(1200)).await;
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].old_content, "export const x = 1;\n");
        assert_eq!(reviews[0].new_content, "export const x = 50;\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_edit_replaces_review_and_keeps_original_baseline() {
        let fx = fixture().await;
        let mut sub = fx.bus.subscribe();

        fs::write(fx.a.join("src/x.ts"), "first\n").expect("first edit");
        let first = next_review(&mut sub).await;
        assert_eq!(first.new_content, "first\n");

        fs::write(fx.a.join("src/x.ts"), "second\n").expect("second edit");
        let second = next_review(&mut sub).await;
        assert_eq!(second.path, "src/x.ts");
        assert_eq!(second.old_content, "export const x = 1;\n");
        assert_eq!(second.new_content, "second\n");

        let pending = fx.workspace.reviews();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].new_content, "second\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn change_to_an_unread_file_is_cached_not_reviewed() {
        let fx = fixture().await;
        let mut sub = fx.bus.subscribe();
        assert!(fx.workspace.baseline("src/unread.ts").is_none());

        fs::write(fx.a.join("src/unread.ts"), "edited\n").expect("external edit");
        wait_until(|| fx.workspace.baseline("src/unread.ts").is_some()).await;

        assert_eq!(fx.workspace.baseline("src/unread.ts").as_deref(), Some("edited\n"));
        assert!(reviews_within(&mut sub, Duration::from_millis(300)).await.is_empty());
        assert!(fx.workspace.reviews().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn opt_in_priming_seeds_baselines_from_disk() {
        let base = tempfile::tempdir().expect("tempdir");
        fs::write(base.path().join("readme.md"), "hello\n").expect("seed");
        let root = fs::canonicalize(base.path()).expect("canonical");
        let policy = WatchPolicy {
            prime_baseline: true,
            ..policy()
        };
        let workspace = Workspace::start(
            &root,
            Vec::new(),
            None,
            SessionRegistry::new("/bin/sh", &root),
            ControlBus::new(8),
            policy,
        )
        .expect("start workspace");

        wait_until(|| workspace.baseline("readme.md").is_some()).await;
        assert_eq!(workspace.baseline("readme.md").as_deref(), Some("hello\n"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accept_moves_baseline_and_leaves_disk_alone() {
        let fx = fixture().await;
        let mut sub = fx.bus.subscribe();

        fs::write(fx.a.join("src/x.ts"), "accepted\n").expect("external edit");
        next_review(&mut sub).await;

        assert!(fx.workspace.accept("src/x.ts").expect("accept"));
        assert_eq!(fx.workspace.baseline("src/x.ts").as_deref(), Some("accepted\n"));
        assert_eq!(
            fs::read_to_string(fx.a.join("src/x.ts")).expect("read"),
            "accepted\n"
        );
        assert!(fx.workspace.reviews().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn switching_roots_drops_reviews_and_silences_old_watcher() {
        let fx = fixture().await;
        let mut sub = fx.bus.subscribe();
        fs::write(fx.a.join("src/x.ts"), "pending\n").expect("external edit");
        next_review(&mut sub).await;
        assert_eq!(fx.workspace.reviews().len(), 1);

        let info = fx.workspace.open(&fx.b).expect("switch");
        assert_eq!(info.path, fx.b);
        assert_eq!(info.project_name, "proj-b");
        assert!(fx.workspace.reviews().is_empty());
        assert!(fx.workspace.baseline("src/x.ts").is_none());

        fs::write(fx.a.join("src/x.ts"), "stale\n").expect("old root edit");
        tokio::time::sleep(Duration::from_millis(600)).await;
        let mut saw_switch = false;
        while let Some(msg) = sub.try_recv() {
            match &*msg {
                ControlMessage::WorkspaceChanged { path, .. } => {
                    saw_switch = true;
                    assert_eq!(Path::new(path), fx.b.as_path());
                }
                other => assert!(
                    !saw_switch,
                    "unexpected event after switch: {other:?}"
                ),
            }
        }
        assert!(saw_switch);
        assert!(fx.workspace.reviews().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_open_and_same_root_leave_state_untouched() {
        let fx = fixture().await;
        let mut sub = fx.bus.subscribe();
        let before = fx.workspace.info();

        let err = fx
            .workspace
            .open(fx.a.join("does-not-exist"))
            .expect_err("missing root");
        assert!(matches!(err, WorkspaceError::NotFound(_)));
        assert_eq!(fx.workspace.info(), before);

        assert_eq!(fx.workspace.open(&fx.a).expect("same root"), before);
        assert!(sub.try_recv().is_none());
        assert!(fx.workspace.baseline("src/x.ts").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_write_becomes_baseline_without_review() {
        let fx = fixture().await;
        let mut sub = fx.bus.subscribe();

        fx.workspace
            .write_file("src/y.ts", "fresh\n".to_string())
            .await
            .expect("write");
        assert_eq!(fx.workspace.baseline("src/y.ts").as_deref(), Some("fresh\n"));
        assert_eq!(
            fx.workspace.read_file("./src/y.ts").await.expect("read"),
            "fresh\n"
        );

        tokio::time::sleep(Duration::from_millis(600)).await;
        while let Some(msg) = sub.try_recv() {
            assert!(!matches!(&*msg, ControlMessage::PendingReview(_)));
        }
        assert!(matches!(
            fx.workspace.read_file("../escape").await,
            Err(FileError::Path(PathError::EscapesRoot(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bulk_resolution_covers_every_pending_review() {
        let fx = fixture().await;
        fs::write(fx.a.join("src/other.ts"), "one\n").expect("seed other");
        wait_until(|| fx.workspace.baseline("src/other.ts").is_some()).await;

        fs::write(fx.a.join("src/x.ts"), "edit x\n").expect("edit x");
        fs::write(fx.a.join("src/other.ts"), "edit other\n").expect("edit other");
        wait_until(|| fx.workspace.reviews().len() == 2).await;

        assert_eq!(fx.workspace.reject_all().await, 2);
        assert_eq!(
            fs::read_to_string(fx.a.join("src/other.ts")).expect("read"),
            "one\n"
        );
        assert_eq!(fx.workspace.accept_all(), 0);
    }

    #[tokio::test]
    async fn browse_lists_visible_directories_case_insensitively() {
        let base = tempfile::tempdir().expect("tempdir");
        for name in ["beta", "Alpha", ".hidden", "gamma"] {
            fs::create_dir(base.path().join(name)).expect("mkdir");
        }
        fs::write(base.path().join("file.txt"), "x").expect("write");

        let listing = browse(base.path()).await.expect("browse");
        let names: Vec<_> = listing.dirs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "beta", "gamma"]);
        assert!(listing.dirs[0].path.ends_with("/Alpha"));
        assert!(browse(&base.path().join("missing")).await.is_err());
    }
}
