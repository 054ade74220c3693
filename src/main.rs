use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pgtestproxy::config::{self, ProxyConfig};
use pgtestproxy::proxy;
use tracing_subscriber::EnvFilter;

/// Transparent PostgreSQL proxy that nests client transactions in
/// savepoints against one shared backend transaction, for fast test
/// isolation.
#[derive(Parser, Debug)]
#[command(name = "pgtestproxy", version, about)]
struct Cli {
    /// Address to listen on for client connections.
    #[arg(short = 'l', long, default_value = "127.0.0.1:5433")]
    listen: String,

    /// Address of the real PostgreSQL backend to proxy to.
    #[arg(short = 'u', long, default_value = "localhost:5432")]
    upstream: String,

    /// Write the process id to this file once listening.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Append log output to this file instead of stdout.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// A `tracing_subscriber` writer that is either stdout or a shared, already
/// opened file handle, picked once at startup from `--log-file`.
#[derive(Clone)]
enum LogWriter {
    Stdout,
    File(Arc<std::fs::File>),
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            LogWriter::Stdout => std::io::stdout().write(buf),
            LogWriter::File(f) => (&**f).write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            LogWriter::Stdout => std::io::stdout().flush(),
            LogWriter::File(f) => (&**f).flush(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let writer = match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            LogWriter::File(Arc::new(file))
        }
        None => LogWriter::Stdout,
    };

    let default_directive = match cli.verbose {
        0 => "pgtestproxy=info",
        1 => "pgtestproxy=debug",
        _ => "pgtestproxy=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)))
        .with_target(false)
        .with_writer(move || writer.clone())
        .init();

    if let Some(pid_file) = &cli.pid_file {
        config::write_pid_file(pid_file)?;
    }

    let config = ProxyConfig {
        listen_addr: cli.listen,
        upstream_addr: cli.upstream,
        pid_file: cli.pid_file,
        log_file: cli.log_file,
    };

    let factory = proxy::run_proxy_factory(config).await?;

    shutdown_signal().await;
    tracing::info!("shutdown signal received, terminating backend session");
    factory.shutdown().await;

    Ok(())
}

/// Waits for Ctrl-C, or for SIGTERM on unix, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
