mod api;
mod bus;
mod session;
mod watch;
mod workspace;

use anyhow::{bail, Context};
use clap::Parser;
use loom_core::WorkspaceState;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use crate::api::{Hub, HubConfig, DEFAULT_COLS, DEFAULT_ROWS};
use crate::bus::ControlBus;
use crate::session::{default_shell, SessionRegistry};
use crate::watch::WatchPolicy;
use crate::workspace::Workspace;

const STATE_FILE: &str = "workspace.json";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    root: Option<PathBuf>,
    shell: String,
    policy: WatchPolicy,
    initial_session: bool,
    state_dir: Option<PathBuf>,
    write_timeout: Duration,
    queue_capacity: usize,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "loom-hub", about = "Live terminal sessions and external-edit review for one project root")]
struct Args {
    /// Project root to open at start-up.
    path: Option<PathBuf>,
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    shell: String,
    #[arg(long, default_value_t = watch::DEFAULT_QUIESCENCE_MS)]
    quiescence_ms: u64,
    #[arg(long, default_value_t = watch::DEFAULT_POLL_MS)]
    poll_ms: u64,
    /// Seed review baselines from disk when a root is opened.
    #[arg(long, default_value_t = false)]
    prime: bool,
    #[arg(long, default_value_t = watch::DEFAULT_MAX_PRIME_BYTES)]
    max_prime_bytes: u64,
    #[arg(long, default_value_t = false)]
    no_initial_session: bool,
    #[arg(long)]
    state_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        bail!("refusing non-loopback listen address {addr}");
    }

    let state_file = config.state_dir.as_ref().map(|dir| dir.join(STATE_FILE));
    let persisted = state_file
        .as_deref()
        .and_then(WorkspaceState::load)
        .unwrap_or_default();
    let root = resolve_root(&config, &persisted)?;

    let bus = ControlBus::new(config.queue_capacity);
    let sessions = SessionRegistry::new(config.shell.clone(), root.clone());
    let workspace = Workspace::start(
        &root,
        persisted.recent,
        state_file,
        sessions.clone(),
        bus.clone(),
        config.policy.clone(),
    )
    .with_context(|| format!("cannot open workspace {}", root.display()))?;

    let hub = Hub::new(
        HubConfig {
            write_timeout: config.write_timeout,
        },
        bus,
        sessions.clone(),
        workspace,
    );
    if config.initial_session {
        match sessions.spawn(DEFAULT_COLS, DEFAULT_ROWS, None) {
            Ok(id) => hub.set_primary(id),
            Err(err) => warn!(event = "initial_session_failed", error = %err),
        }
    }

    let app = api::router(hub.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;

    info!(
        event = "hub_start",
        addr = %addr,
        root = %root.display(),
        shell = %config.shell
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;
    sessions.kill_all();
    if let Err(err) = served {
        error!(event = "hub_error", error = %err);
        return Err(err.into());
    }
    Ok(())
}

fn load_config() -> Config {
    let args = Args::parse();
    let debug = args.debug || env_true("LOOM_DEBUG");
    Config {
        addr: resolve_addr(&args.addr),
        root: args.path.or_else(|| env_path("PROJECT_ROOT")),
        shell: resolve_shell(&args.shell),
        policy: WatchPolicy {
            quiescence: Duration::from_millis(args.quiescence_ms),
            poll_interval: Duration::from_millis(args.poll_ms),
            prime_baseline: args.prime || env_true("LOOM_PRIME"),
            max_prime_bytes: args.max_prime_bytes,
        },
        initial_session: !args.no_initial_session,
        state_dir: args.state_dir.or_else(resolve_state_dir),
        write_timeout: Duration::from_secs(args.write_timeout),
        queue_capacity: args.queue_capacity,
        debug,
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

/// Explicit root first, then the last persisted workspace if it still
/// exists, then the process cwd.
fn resolve_root(config: &Config, persisted: &WorkspaceState) -> anyhow::Result<PathBuf> {
    if let Some(root) = &config.root {
        return Ok(root.clone());
    }
    if let Some(last) = persisted.root.as_ref().filter(|last| last.is_dir()) {
        info!(event = "workspace_restored", root = %last.display());
        return Ok(last.clone());
    }
    std::env::current_dir().context("cannot determine current directory")
}

/// `--debug` wins, then `LOOM_LOG_LEVEL`, then `RUST_LOG`, then `info`.
fn init_logging(config: &Config) -> Option<LogGuard> {
    let filter = match (config.debug, env_value("LOOM_LOG_LEVEL")) {
        (true, _) => EnvFilter::new("debug"),
        (false, Some(level)) => EnvFilter::new(level),
        (false, None) => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        }
    };
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Tees formatted log lines to stdout and the optional log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("loom-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_value(key).map(PathBuf::from)
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    env_value("LOOM_ADDR").unwrap_or_else(|| "127.0.0.1:3001".to_string())
}

fn resolve_shell(shell_flag: &str) -> String {
    if !shell_flag.trim().is_empty() {
        return shell_flag.to_string();
    }
    env_value("LOOM_SHELL").unwrap_or_else(default_shell)
}

fn resolve_state_dir() -> Option<PathBuf> {
    if let Some(dir) = env_path("LOOM_STATE_DIR") {
        return Some(dir);
    }
    if let Some(dir) = env_path("XDG_STATE_HOME") {
        return Some(dir.join("loom"));
    }
    env_path("HOME").map(|home| home.join(".local").join("state").join("loom"))
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_value("LOOM_LOG_DIR").unwrap_or_else(|| ".loom/logs".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_flags_and_positional_root() {
        let args = Args::try_parse_from([
            "loom-hub",
            "/tmp/proj",
            "--quiescence-ms",
            "500",
            "--prime",
            "--no-initial-session",
        ])
        .expect("parse");
        assert_eq!(args.path, Some(PathBuf::from("/tmp/proj")));
        assert_eq!(args.quiescence_ms, 500);
        assert_eq!(args.poll_ms, watch::DEFAULT_POLL_MS);
        assert!(args.prime);
        assert!(args.no_initial_session);
        assert_eq!(args.queue_capacity, 256);
    }

    #[test]
    fn explicit_flags_win_over_environment() {
        assert_eq!(resolve_addr("127.0.0.1:4100"), "127.0.0.1:4100");
        assert_eq!(resolve_shell("/bin/zsh"), "/bin/zsh");
        assert_eq!(resolve_log_dir("/var/log/loom"), "/var/log/loom");
    }

    #[test]
    fn persisted_root_is_used_only_when_it_still_exists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = load_test_config();
        let persisted = WorkspaceState {
            root: Some(dir.path().to_path_buf()),
            recent: Vec::new(),
        };
        assert_eq!(
            resolve_root(&config, &persisted).expect("root"),
            dir.path().to_path_buf()
        );

        let gone = WorkspaceState {
            root: Some(dir.path().join("gone")),
            recent: Vec::new(),
        };
        assert_eq!(
            resolve_root(&config, &gone).expect("root"),
            std::env::current_dir().expect("cwd")
        );

        config.root = Some(PathBuf::from("/explicit"));
        assert_eq!(
            resolve_root(&config, &persisted).expect("root"),
            PathBuf::from("/explicit")
        );
    }

    fn load_test_config() -> Config {
        Config {
            addr: "127.0.0.1:0".to_string(),
            root: None,
            shell: "/bin/sh".to_string(),
            policy: WatchPolicy::default(),
            initial_session: false,
            state_dir: None,
            write_timeout: Duration::from_secs(2),
            queue_capacity: 8,
            debug: false,
            log_dir: String::new(),
        }
    }
}
