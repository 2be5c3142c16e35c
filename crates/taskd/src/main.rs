//! taskd - autonomous task orchestration daemon.
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use task_core::Config;
use taskd::Daemon;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

/// Config file searched in the working directory when --config is absent.
const DEFAULT_CONFIG_PATH: &str = ".taskd/config";

#[derive(Parser)]
#[command(name = "taskd", about = "Autonomous task orchestration daemon", version)]
struct Cli {
    /// Path to the config file (key=value lines)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the SQLite database (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Path to the autonomy policy TOML file (overrides config)
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Bearer token required by the control plane
    #[arg(long, env = "TASKD_AUTH_TOKEN")]
    auth_token: Option<String>,
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Config::from_file(&default)?
            } else {
                Config::default()
            }
        }
    };

    // CLI flags win over the file.
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(policy) = &cli.policy {
        config.policy_path = Some(policy.clone());
    }
    Ok(config)
}

fn main() {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let working_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            error!("failed to resolve working directory: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(parent) = config.db_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!("failed to create data directory: {}", e);
            std::process::exit(1);
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(config, working_dir, cli.auth_token).await {
            Ok(daemon) => {
                let daemon_ref = &daemon;

                #[cfg(unix)]
                {
                    use tokio::signal::unix::{signal, SignalKind};
                    let mut sigterm = signal(SignalKind::terminate())
                        .expect("failed to register SIGTERM handler");
                    let mut sigint =
                        signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

                    tokio::select! {
                        result = daemon.run() => {
                            if let Err(e) = result {
                                error!("daemon error: {}", e);
                            }
                        }
                        _ = sigint.recv() => {
                            tracing::info!("received SIGINT, initiating graceful shutdown");
                            daemon_ref.shutdown();
                        }
                        _ = sigterm.recv() => {
                            tracing::info!("received SIGTERM, initiating graceful shutdown");
                            daemon_ref.shutdown();
                        }
                    }
                }

                #[cfg(not(unix))]
                {
                    tokio::select! {
                        result = daemon.run() => {
                            if let Err(e) = result {
                                error!("daemon error: {}", e);
                            }
                        }
                        _ = tokio::signal::ctrl_c() => {
                            tracing::info!("received SIGINT, initiating graceful shutdown");
                            daemon_ref.shutdown();
                        }
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {}", e);
                std::process::exit(1);
            }
        }
    });
}
