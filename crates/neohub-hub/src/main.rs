use clap::Parser;
use neohub_core::resolve_socket_path;
use neohub_hub::activation::ActivationTracker;
use neohub_hub::desktop::{HeadlessWindows, XdotoolDesktop};
use neohub_hub::process::TokioLauncher;
use neohub_hub::registry::{EditorRegistry, DEFAULT_NO_FORK_FLAG};
use neohub_hub::report::LogReporter;
use neohub_hub::{socket_server, HubConfig};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "neohub-hub", version)]
struct Args {
    #[arg(long)]
    socket: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 5000)]
    restart_timeout_ms: u64,
    #[arg(long, default_value_t = 100)]
    restart_poll_ms: u64,
    #[arg(long, default_value = DEFAULT_NO_FORK_FLAG, allow_hyphen_values = true)]
    editor_flag: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);

    let foreground = Arc::new(XdotoolDesktop);
    let tracker = Arc::new(ActivationTracker::new(
        std::process::id(),
        foreground.clone(),
        Arc::new(HeadlessWindows),
    ));
    let reporter = Arc::new(LogReporter);
    let registry = EditorRegistry::spawn(
        config.registry_config(),
        Arc::new(TokioLauncher),
        foreground,
        tracker,
        reporter.clone(),
    );

    info!(
        event = "hub_start",
        version = env!("CARGO_PKG_VERSION"),
        socket = %config.socket_path.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(socket_server::run(
        config.server_config(),
        registry,
        reporter,
        shutdown_rx,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(event = "hub_shutdown_requested");
            let _ = shutdown_tx.send(true);
        }
        _ = shutdown_tx.closed() => {}
    }

    match server.await {
        Ok(Ok(())) => info!(event = "hub_stop"),
        Ok(Err(err)) => error!(event = "hub_error", error = %err),
        Err(err) => error!(event = "hub_error", error = %err),
    }
}

fn load_config() -> HubConfig {
    let args = Args::parse();
    HubConfig {
        socket_path: args.socket.unwrap_or_else(resolve_socket_path),
        debug: args.debug,
        log_dir: args.log_dir,
        restart_timeout: Duration::from_millis(args.restart_timeout_ms),
        restart_poll_interval: Duration::from_millis(args.restart_poll_ms.max(1)),
        no_fork_flag: args.editor_flag,
    }
}

/// Logs go to stdout, and are mirrored to `neohub-hub.log` when a log dir is set.
fn init_logging(config: &HubConfig) {
    let level = if config.debug {
        "debug".to_string()
    } else {
        std::env::var("NEOHUB_LOG").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = match open_log_file(config.log_dir.as_deref()) {
        Ok(Some(file)) => BoxMakeWriter::new(Mutex::new(file).and(io::stdout)),
        Ok(None) => BoxMakeWriter::new(io::stdout),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            BoxMakeWriter::new(io::stdout)
        }
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init();
}

fn open_log_file(log_dir: Option<&Path>) -> io::Result<Option<File>> {
    let Some(dir) = log_dir.filter(|dir| !dir.as_os_str().is_empty()) else {
        return Ok(None);
    };
    fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("neohub-hub.log"))
        .map(Some)
}
