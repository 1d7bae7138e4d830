//! Bridge server binary
//!
//! Run with: cargo run --bin bridgefs-server

use anyhow::Context;
use bridgefs::{Config, LogFormat, Server};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[arg(short, long, default_value = "7117")]
    port: u16,

    /// Root directory exposed over the bridge
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load or create configuration
    let mut config = if let Some(config_path) = args.config {
        Config::from_file(&config_path)
            .with_context(|| format!("failed to load config from {config_path}"))?
    } else {
        let mut config = Config::default();
        config.bind_address = args.bind;
        config.port = args.port;
        config.verbose = args.verbose;

        if let Some(root) = args.root {
            config.root_dir = root;
        }

        if let Some(log_format) = args.log_format {
            config.logging.format = log_format;
        }

        if let Some(log_file) = args.log_file {
            config.logging.file = Some(log_file);
        }

        if args.verbose {
            config.logging.level = "debug".to_string();
        }

        config
    };

    let _log_guard = init_logging(&mut config);

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        protocol_version = bridgefs::protocol::PROTOCOL_VERSION,
        "Starting BridgeFS server"
    );

    // Ensure root directory exists
    if !config.root_dir.exists() {
        info!(
            event = "creating_root_directory",
            directory = ?config.root_dir,
            "Creating root directory"
        );
        std::fs::create_dir_all(&config.root_dir).with_context(|| {
            format!("failed to create root directory {}", config.root_dir.display())
        })?;
    }

    info!(
        event = "server_configuration",
        bind_address = %config.bind_address,
        port = config.port,
        root_dir = ?config.root_dir,
        max_payload = config.max_payload,
        max_open_handles = config.max_open_handles,
        op_timeout_secs = config.op_timeout_secs,
        readdir_chunk = config.readdir_chunk,
        max_fs_concurrency = config.max_fs_concurrency,
        log_format = ?config.logging.format,
        log_file = ?config.logging.file,
        "BridgeFS server configuration"
    );

    config.validate().context("configuration validation failed")?;

    let server = Server::new(config)
        .await
        .context("failed to start server")?;
    server.run().await.context("server terminated with an error")?;

    info!(event = "server_shutdown", "BridgeFS server shutdown complete");
    Ok(())
}

/// Initialize tracing output per the logging configuration.
///
/// Returns the appender guard when logging to a file; the guard must stay
/// alive for the lifetime of the process or buffered log lines are lost.
fn init_logging(config: &mut Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    if let Some(log_file) = config.logging.file.clone() {
        match (log_file.parent(), log_file.file_name()) {
            (Some(parent), Some(file_name)) => {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        eprintln!("Warning: Failed to create log directory: {e}");
                        eprintln!("Falling back to stderr logging");
                        config.logging.file = None;
                    }
                }

                if config.logging.file.is_some() {
                    let file_appender = tracing_appender::rolling::daily(
                        parent,
                        file_name.to_string_lossy().as_ref(),
                    );
                    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                    match config.logging.format {
                        LogFormat::Json => {
                            tracing_subscriber::fmt()
                                .json()
                                .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                                .with_writer(non_blocking)
                                .with_current_span(true)
                                .with_span_list(true)
                                .init();
                        }
                        LogFormat::Text => {
                            tracing_subscriber::fmt()
                                .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                                .with_writer(non_blocking)
                                .init();
                        }
                    }

                    return Some(guard);
                }
            }
            _ => {
                eprintln!("Warning: invalid log file path, logging to stderr");
                config.logging.file = None;
            }
        }
    }

    // No file logging, log to stderr
    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                .init();
        }
    }

    None
}
