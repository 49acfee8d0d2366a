use loom_core::{Listeners, SessionId, Subscription};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use std::{
    collections::HashMap,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to spawn {shell}: {message}")]
    Spawn { shell: String, message: String },
    #[error("working directory is not a directory: {}", .0.display())]
    InvalidCwd(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExit {
    pub id: SessionId,
    /// `None` when the session was killed before its exit status was reaped.
    pub exit_code: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub cols: u16,
    pub rows: u16,
    pub cwd: PathBuf,
    pub pid: Option<u32>,
}

/// Shell families that need different change-directory syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Posix,
    PowerShell,
    Cmd,
}

impl ShellKind {
    /// Accepts `/` and `\` separators on every platform.
    pub fn from_program(program: &str) -> Self {
        let name = program
            .rsplit(|c: char| c == '/' || c == '\\')
            .next()
            .unwrap_or(program)
            .to_lowercase();
        let stem = name.strip_suffix(".exe").unwrap_or(&name);
        match stem {
            "powershell" | "pwsh" => ShellKind::PowerShell,
            "cmd" => ShellKind::Cmd,
            _ => ShellKind::Posix,
        }
    }

    /// Keystrokes that move an idle interactive shell to `dir`.
    pub fn cd_command(&self, dir: &Path) -> String {
        let dir = dir.to_string_lossy();
        match self {
            ShellKind::Posix => format!("cd -- '{}'\r", dir.replace('\'', r"'\''")),
            ShellKind::PowerShell => {
                format!("Set-Location -LiteralPath '{}'\r", dir.replace('\'', "''"))
            }
            ShellKind::Cmd => format!("cd /d \"{}\"\r", dir.replace('"', "")),
        }
    }
}

pub fn default_shell() -> String {
    if cfg!(windows) {
        return "powershell.exe".to_string();
    }
    match std::env::var("SHELL") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => "/bin/bash".to_string(),
    }
}

fn lock<V: ?Sized>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Session {
    id: SessionId,
    pid: Option<u32>,
    shell: ShellKind,
    master: Mutex<Box<dyn MasterPty + Send>>,
    /// Feeds the session's writer thread; `None` once the session closed.
    input: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    size: Mutex<PtySize>,
    cwd: Mutex<PathBuf>,
    data: Listeners<[u8]>,
    exit: Listeners<SessionExit>,
    closed: AtomicBool,
    exited: AtomicBool,
}

impl Session {
    /// Queues input for the writer thread and returns immediately.
    fn write(&self, bytes: &[u8]) {
        if self.closed.load(Ordering::SeqCst) || bytes.is_empty() {
            return;
        }
        if let Some(input) = lock(&self.input).as_ref() {
            if input.send(bytes.to_vec()).is_err() {
                debug!(event = "session_write_closed", id = self.id);
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.input).take();
    }

    fn finish(&self, exit_code: Option<u32>) -> Option<SessionExit> {
        self.close();
        if self.exited.swap(true, Ordering::SeqCst) {
            return None;
        }
        let exit = SessionExit {
            id: self.id,
            exit_code,
        };
        self.exit.emit(&exit);
        Some(exit)
    }

    fn info(&self) -> SessionInfo {
        let size = *lock(&self.size);
        SessionInfo {
            id: self.id,
            cols: size.cols,
            rows: size.rows,
            cwd: lock(&self.cwd).clone(),
            pid: self.pid,
        }
    }
}

struct RegistryInner {
    next_id: AtomicU32,
    shell: String,
    default_cwd: Mutex<PathBuf>,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    exits: Listeners<SessionExit>,
}

impl RegistryInner {
    fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        lock(&self.sessions).get(&id).cloned()
    }

    fn retire(&self, session: &Session, exit_code: Option<u32>) {
        lock(&self.sessions).remove(&session.id);
        if let Some(exit) = session.finish(exit_code) {
            info!(event = "session_exit", id = exit.id, exit_code = ?exit.exit_code);
            self.exits.emit(&exit);
        }
    }
}

/// Owns every live PTY session. Handles are cheap clones of one registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(shell: impl Into<String>, default_cwd: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU32::new(0),
                shell: shell.into(),
                default_cwd: Mutex::new(default_cwd.into()),
                sessions: Mutex::new(HashMap::new()),
                exits: Listeners::new(),
            }),
        }
    }

    pub fn default_cwd(&self) -> PathBuf {
        lock(&self.inner.default_cwd).clone()
    }

    /// Starts the shell on a fresh PTY. A failure affects only this call.
    pub fn spawn(
        &self,
        cols: u16,
        rows: u16,
        cwd: Option<PathBuf>,
    ) -> Result<SessionId, SessionError> {
        let cwd = cwd.unwrap_or_else(|| self.default_cwd());
        if !cwd.is_dir() {
            return Err(SessionError::InvalidCwd(cwd));
        }
        let shell = self.inner.shell.clone();
        let spawn_err = |message: String| SessionError::Spawn {
            shell: shell.clone(),
            message,
        };
        if Path::new(&shell).is_absolute() && !Path::new(&shell).exists() {
            return Err(spawn_err("no such file".to_string()));
        }

        let size = PtySize {
            rows: rows.max(1),
            cols: cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = native_pty_system()
            .openpty(size)
            .map_err(|err| spawn_err(err.to_string()))?;

        let mut builder = CommandBuilder::new(&shell);
        builder.cwd(&cwd);
        builder.env("TERM", "xterm-256color");
        if cfg!(target_os = "macos") {
            builder.env("LANG", "en_US.UTF-8");
        }

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|err| spawn_err(err.to_string()))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| spawn_err(err.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| spawn_err(err.to_string()))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        spawn_writer(id, writer, input_rx).map_err(|err| {
            let _ = child.clone_killer().kill();
            spawn_err(err.to_string())
        })?;
        let session = Arc::new(Session {
            id,
            pid: child.process_id(),
            shell: ShellKind::from_program(&shell),
            master: Mutex::new(pair.master),
            input: Mutex::new(Some(input_tx)),
            killer: Mutex::new(child.clone_killer()),
            size: Mutex::new(size),
            cwd: Mutex::new(cwd.clone()),
            data: Listeners::new(),
            exit: Listeners::new(),
            closed: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        });
        lock(&self.inner.sessions).insert(id, session.clone());

        spawn_reader(Arc::downgrade(&self.inner), session.clone(), reader, child)
            .map_err(|err| {
                lock(&self.inner.sessions).remove(&id);
                session.close();
                let _ = lock(&session.killer).kill();
                spawn_err(err.to_string())
            })?;

        info!(
            event = "session_spawned",
            id = id,
            pid = ?session.pid,
            cols = size.cols,
            rows = size.rows,
            cwd = %cwd.display()
        );
        Ok(id)
    }

    /// Forwards raw input without waiting for the PTY to drain it. Unknown or
    /// exited sessions are ignored.
    pub fn write(&self, id: SessionId, bytes: &[u8]) {
        match self.inner.get(id) {
            Some(session) => session.write(bytes),
            None => debug!(event = "session_write_miss", id = id),
        }
    }

    /// Geometry is advisory: failures are logged and swallowed.
    pub fn resize(&self, id: SessionId, cols: u16, rows: u16) {
        let Some(session) = self.inner.get(id) else {
            return;
        };
        if session.closed.load(Ordering::SeqCst) {
            return;
        }
        let size = PtySize {
            rows: rows.max(1),
            cols: cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        };
        let resized = lock(&session.master).resize(size);
        match resized {
            Ok(()) => *lock(&session.size) = size,
            Err(err) => debug!(event = "session_resize_error", id = id, error = %err),
        }
    }

    /// Terminates the process; repeated calls are no-ops.
    pub fn kill(&self, id: SessionId) -> bool {
        let Some(session) = lock(&self.inner.sessions).remove(&id) else {
            return false;
        };
        session.close();
        if let Err(err) = lock(&session.killer).kill() {
            debug!(event = "session_kill_error", id = id, error = %err);
        }
        info!(event = "session_killed", id = id);
        self.inner.retire(&session, None);
        true
    }

    pub fn kill_all(&self) {
        for id in self.ids() {
            self.kill(id);
        }
    }

    /// Subscribes to raw output. `None` if the session is not live.
    pub fn on_data<F>(&self, id: SessionId, callback: F) -> Option<Subscription>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.inner
            .get(id)
            .map(|session| session.data.attach(callback))
    }

    pub fn on_exit<F>(&self, id: SessionId, callback: F) -> Option<Subscription>
    where
        F: Fn(&SessionExit) + Send + Sync + 'static,
    {
        self.inner
            .get(id)
            .map(|session| session.exit.attach(callback))
    }

    /// Notified once for every session that ends, killed or self-exited.
    pub fn on_any_exit<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionExit) + Send + Sync + 'static,
    {
        self.inner.exits.attach(callback)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        lock(&self.inner.sessions).contains_key(&id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = lock(&self.inner.sessions).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = lock(&self.inner.sessions).values().cloned().collect();
        let mut infos: Vec<_> = sessions.iter().map(|session| session.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Moves a live shell to `dir`. The PTY layer cannot change a running
    /// child's cwd, so this types the shell's own change-directory command.
    pub fn set_working_directory(&self, id: SessionId, dir: &Path) -> bool {
        let Some(session) = self.inner.get(id) else {
            return false;
        };
        session.write(session.shell.cd_command(dir).as_bytes());
        *lock(&session.cwd) = dir.to_path_buf();
        true
    }

    /// Points new and existing sessions at `dir`.
    pub fn redirect_all(&self, dir: &Path) -> usize {
        *lock(&self.inner.default_cwd) = dir.to_path_buf();
        let mut redirected = 0;
        for id in self.ids() {
            if self.set_working_directory(id, dir) {
                redirected += 1;
            }
        }
        if redirected > 0 {
            info!(event = "sessions_redirected", count = redirected, cwd = %dir.display());
        }
        redirected
    }
}

/// Drains queued input into the PTY on its own thread, so a child that stops
/// reading stalls only this thread.
fn spawn_writer(
    id: SessionId,
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-writer-{id}"))
        .spawn(move || {
            while let Some(chunk) = input.blocking_recv() {
                if let Err(err) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                    debug!(event = "session_write_error", id = id, error = %err);
                    break;
                }
            }
            debug!(event = "session_writer_end", id = id);
        })
        .map(|_| ())
}

fn spawn_reader(
    registry: Weak<RegistryInner>,
    session: Arc<Session>,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
) -> std::io::Result<()> {
    let id = session.id;
    std::thread::Builder::new()
        .name(format!("pty-reader-{id}"))
        .spawn(move || {
            let mut buffer = [0u8; READ_CHUNK_BYTES];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(count) => session.data.emit(&buffer[..count]),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(event = "session_read_end", id = id, error = %err);
                        break;
                    }
                }
            }
            let exit_code = match child.wait() {
                Ok(status) => Some(status.exit_code()),
                Err(err) => {
                    warn!(event = "session_wait_error", id = id, error = %err);
                    None
                }
            };
            match registry.upgrade() {
                Some(registry) => registry.retire(&session, exit_code),
                None => {
                    session.finish(exit_code);
                }
            }
        })
        .map(|_| ())
}
