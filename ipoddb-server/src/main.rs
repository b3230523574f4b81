//! iPod database server
//!
//! Keeps one mounted device open and serves its library to CLI clients over
//! a line-based JSON protocol.

mod config;
mod server;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::Config;

#[derive(Parser)]
#[command(name = "ipodd")]
#[command(about = "Serve the iTunesDB of a mounted iPod")]
struct Cli {
    /// Mount point of the device
    #[arg(short, long)]
    mountpoint: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7455")]
    addr: String,

    /// Abort queries running longer than this
    #[arg(long, default_value = "5000")]
    query_timeout_ms: u64,

    /// Write pending changes to the device on shutdown
    #[arg(long)]
    write_on_shutdown: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Install the global subscriber; the guard must live until exit
fn init_logging(cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let file = path
                .file_name()
                .with_context(|| format!("--log-file {:?} has no file name", path))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file));
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .compact()
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
            Ok(Some(guard))
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .compact()
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
            Ok(None)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli)?;

    info!("iPod database server starting");
    info!("Mount point: {:?}", cli.mountpoint);

    let config = Config {
        mountpoint: cli.mountpoint,
        bind_addr: cli.addr,
        query_timeout: Duration::from_millis(cli.query_timeout_ms),
        write_on_shutdown: cli.write_on_shutdown,
    };

    server::run(config).await
}
