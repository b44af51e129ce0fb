mod api;
mod hub;
mod render;
mod tailer;

use anyhow::{bail, Context};
use clap::Parser;
use farmwatch_core::live_sync::DEFAULT_MAX_FRAME_BYTES;
use farmwatch_store::{resolve_store_root_from_env, Store};
use hub::{HubConfig, LiveHub};
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:8765";
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Clone, Debug)]
struct Config {
    addr: SocketAddr,
    repo_root: PathBuf,
    debug: bool,
    log_filter: String,
    /// `None` means stdout only.
    log_file: Option<PathBuf>,
    heartbeat_interval: Duration,
    poll_interval: Duration,
    write_timeout: Duration,
    queue_capacity: usize,
}

#[derive(Parser, Debug)]
#[command(name = "farmwatch-monitor", about = "Live dashboard over an .inshallah store")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// Directory to start the store-root search from.
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    /// Tracing filter directive, e.g. `farmwatch_store=debug`.
    #[arg(long, default_value = "")]
    log_level: String,
    #[arg(long, default_value_t = 15)]
    heartbeat_seconds: u64,
    #[arg(long, default_value_t = 500)]
    poll_millis: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    /// Permit binding a non-loopback address.
    #[arg(long, default_value_t = false)]
    allow_remote: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load_config(Args::parse()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(event = "monitor_error", error = %format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let root = resolve_store_root_from_env(&config.repo_root)
        .with_context(|| format!("resolving store root from {}", config.repo_root.display()))?;
    let store = Arc::new(Store::open(&root));
    if let Err(err) = store.issue_counts() {
        warn!(event = "store_probe_failed", root = %root.display(), error = %err);
    }

    let hub = Arc::new(LiveHub::new(
        HubConfig {
            write_timeout: config.write_timeout,
            queue_capacity: config.queue_capacity,
            heartbeat_interval: config.heartbeat_interval,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        },
        Arc::clone(&store),
    ));
    let heartbeat = Arc::clone(&hub).start_heartbeat();
    let tailer = tokio::spawn(tailer::run_tailer(
        Arc::clone(&store),
        Arc::clone(&hub),
        config.poll_interval,
    ));

    let app = api::router(api::AppState {
        store,
        hub,
        root_label: root.display().to_string(),
    });

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;

    info!(
        event = "monitor_start",
        addr = %config.addr,
        root = %root.display(),
        debug = config.debug
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "monitor_shutdown");
    };
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    heartbeat.abort();
    tailer.abort();
    served.context("serving http")
}

fn load_config(args: Args) -> anyhow::Result<Config> {
    let raw_addr = resolve_addr(&args.addr);
    let addr: SocketAddr = raw_addr
        .parse()
        .with_context(|| format!("invalid listen address {raw_addr:?}"))?;
    if !addr.ip().is_loopback() && !args.allow_remote {
        bail!("refusing to bind non-loopback address {addr} without --allow-remote");
    }
    if args.queue_capacity == 0 {
        bail!("--queue-capacity must be at least 1");
    }
    let debug = args.debug || env_true("FARMWATCH_DEBUG");
    Ok(Config {
        addr,
        repo_root: args.repo_root,
        debug,
        log_filter: resolve_log_filter(debug, &args.log_level),
        log_file: resolve_log_dir(&args.log_dir).map(|dir| log_file_path(&dir, &addr)),
        heartbeat_interval: Duration::from_secs(args.heartbeat_seconds.max(1)),
        poll_interval: Duration::from_millis(args.poll_millis.max(50)),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        queue_capacity: args.queue_capacity,
    })
}

/// Installs the global subscriber. Log-file trouble degrades to stdout only.
fn init_logging(config: &Config) {
    let tee = match &config.log_file {
        Some(path) => LogTee::open(path).unwrap_or_else(|err| {
            eprintln!("log_file_error: {}: {err}", path.display());
            LogTee::stdout_only()
        }),
        None => LogTee::stdout_only(),
    };
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|err| {
        eprintln!("log_filter_error: {:?}: {err}", config.log_filter);
        EnvFilter::new(DEFAULT_LOG_FILTER)
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || tee.clone())
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// `--debug` wins, then `--log-level`, then `RUST_LOG`, then `FARMWATCH_LOG_LEVEL`.
fn resolve_log_filter(debug: bool, level_flag: &str) -> String {
    if debug {
        return "debug".to_string();
    }
    if !level_flag.trim().is_empty() {
        return level_flag.trim().to_string();
    }
    env_non_empty("RUST_LOG")
        .or_else(|| env_non_empty("FARMWATCH_LOG_LEVEL"))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

/// One file per listen port, so monitors sharing a log dir stay apart.
fn log_file_path(dir: &Path, addr: &SocketAddr) -> PathBuf {
    dir.join(format!("farmwatch-{}.log", addr.port()))
}

/// Copies every formatted log line to stdout and, if opened, the log file.
#[derive(Clone)]
struct LogTee {
    file: Option<Arc<Mutex<File>>>,
}

impl LogTee {
    fn stdout_only() -> Self {
        Self { file: None }
    }

    fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
        })
    }
}

impl Write for LogTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stdout().write_all(buf);
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().flush();
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.flush();
        }
        Ok(())
    }
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

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    env_non_empty("FARMWATCH_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

fn resolve_log_dir(log_dir_flag: &str) -> Option<PathBuf> {
    if !log_dir_flag.trim().is_empty() {
        return Some(PathBuf::from(log_dir_flag));
    }
    env_non_empty("FARMWATCH_LOG_DIR").map(PathBuf::from)
}
