use anyhow::{Context, Result};
use clap::Parser;
use neohub_cli::{shell, SocketClient};
use neohub_core::{resolve_socket_path, RunRequest};
use std::collections::BTreeMap;
use std::env;
use std::io;
use std::path::PathBuf;
use tracing::{debug, trace};
use tracing_subscriber::EnvFilter;

const EDITOR_BINARY: &str = "neovide";

#[derive(Parser, Debug)]
#[command(name = "neohub", version)]
#[command(
    about = "A CLI interface to NeoHub. Launch a new or activate an already running Neovide instance.",
    long_about = None
)]
struct Cli {
    /// Optional path passed to Neovide.
    path: Option<String>,
    /// Display name. Defaults to the file or directory name.
    #[arg(long)]
    name: Option<String>,
    /// Editor binary. Looked up on PATH when omitted.
    #[arg(long)]
    bin: Option<PathBuf>,
    /// Options passed to Neovide. Consumes every remaining argument.
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    opts: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let bin = match cli.bin.clone() {
        Some(bin) => bin,
        None => shell::find_binary(EDITOR_BINARY).context(
            "Failed to get a path to Neovide binary. Make sure it is available in your PATH.",
        )?,
    };
    let wd = env::current_dir().context("Failed to read the current directory")?;
    let request = build_request(cli, wd, bin, current_env());

    debug!(
        event = "outgoing_request",
        wd = %request.wd.display(),
        bin = %request.bin.display(),
        name = request.name.as_deref().unwrap_or("-"),
        path = request.path.as_deref().unwrap_or("-"),
        opts = ?request.opts
    );
    trace!(event = "outgoing_request_env", env = ?request.env);

    let response = SocketClient::new(resolve_socket_path())
        .send(&request)
        .context("Failed to communicate with NeoHub.")?;
    debug!(event = "response", response = %response);
    Ok(())
}

fn build_request(
    cli: Cli,
    wd: PathBuf,
    bin: PathBuf,
    env: BTreeMap<String, String>,
) -> RunRequest {
    RunRequest::new(wd, bin, cli.name, cli.path, cli.opts, env)
}

fn current_env() -> BTreeMap<String, String> {
    env::vars_os()
        .map(|(key, value)| {
            (
                key.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )
        })
        .collect()
}

fn init_logging() {
    let level = env::var("NEOHUB_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}
