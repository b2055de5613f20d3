use clap::Parser;
use craftscan::{Config, ScanEngine, ScanError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// craftscan, a high-fanout scanner for the Minecraft server list protocol.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "craftscan",
    version,
    about = "High-fanout scanner for the Minecraft server list protocol",
    long_about = None
)]
struct Cli {
    /// Target specification: CIDR (e.g. 198.51.100.0/24), dashed range,
    /// single address, or a file path when discovery.method is "file".
    targets: String,

    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run with built-in defaults instead of reading the config file.
    #[arg(long)]
    no_config: bool,

    /// Log filter, e.g. "info" or "craftscan=debug".
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)),
        )
        .with_target(false)
        .init();

    let config = if cli.no_config {
        Config::default()
    } else {
        match Config::load(&cli.config) {
            Ok(config) => config,
            Err(err) => {
                error!(%err, path = %cli.config.display(), "configuration error");
                return ExitCode::from(1);
            }
        }
    };

    let mut engine = match ScanEngine::new(config) {
        Ok(engine) => engine,
        Err(ScanError::ConfigError(message)) => {
            error!(%message, "configuration error");
            return ExitCode::from(1);
        }
        Err(err) => {
            error!(%err, "startup failed");
            return ExitCode::from(2);
        }
    };

    // Ctrl-C triggers the graceful path; the grace period bounds the drain.
    let shutdown = engine.shutdown_token();
    let interrupted = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let interrupted_flag = std::sync::Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            interrupted_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            shutdown.cancel();
        }
    });

    let stats = engine.stats();
    match engine.run(&cli.targets).await {
        Ok(()) => {
            println!("{}", stats.summary());
            if interrupted.load(std::sync::atomic::Ordering::SeqCst) {
                ExitCode::from(130)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(ScanError::ConfigError(message)) => {
            error!(%message, "configuration error");
            ExitCode::from(1)
        }
        Err(err) => {
            error!(%err, "scan failed");
            ExitCode::from(2)
        }
    }
}
