//! Foundry agent - self-hosted job execution daemon.
//!
//! The agent registers with a hub, syncs its state on an interval, and
//! runs the jobs it is handed: each job's commands execute in a stateful
//! shell (optionally inside a docker-compose composition) while output
//! streams to the job log.
//!
//! Modes:
//! - `serve` with a configured hub endpoint: sync with the hub.
//! - `serve` without one: legacy local TLS endpoint on :8000.
//! - `run job.yml`: execute a single job described in a local YAML file.

use std::path::{Path, PathBuf};

use clap::Parser;
use foundry_agent::config::Config;
use foundry_agent::listener::{Listener, ListenerConfig};
use foundry_agent::{server, VERSION};
use foundry_agent_lib::job::{Job, JobOptions, RunOptions};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Self-hosted job execution agent
#[derive(Parser, Debug)]
#[command(name = "foundry-agent", version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: platform-specific config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the agent: sync with the hub, or serve the local endpoint
    /// when no hub is configured
    Serve,

    /// Execute one job from a local YAML file, without a hub
    Run {
        /// Path to the job YAML
        path: PathBuf,
    },

    /// Print the agent version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Commands::Version = args.command {
        println!("{VERSION}");
        return Ok(());
    }

    init_logging(&Config::default_data_dir())?;

    match args.command {
        Commands::Serve => {
            let config_path = args.config.unwrap_or_else(Config::default_path);
            let config = if config_path.exists() {
                info!("Loading config from: {}", config_path.display());
                Config::load(&config_path)?
            } else {
                Config::default()
            };

            if config.hub.endpoint.is_empty() {
                config.validate_for_server()?;
                server::serve(&config.server, VERSION).await?;
            } else {
                config.validate_for_hub()?;
                let listener_config = ListenerConfig::from_config(&config, VERSION);
                let _listener =
                    Listener::start(reqwest::Client::new(), listener_config).await?;

                // The processor owns the lifecycle from here; shutdown
                // exits the process.
                std::future::pending::<()>().await;
            }
        }

        Commands::Run { path } => {
            cmd_run(&path).await?;
        }

        Commands::Version => unreachable!(),
    }

    Ok(())
}

/// Execute one job from a local YAML file.
async fn cmd_run(path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)?;
    let request: foundry_agent_lib::api::JobRequest = serde_yaml::from_str(&content)?;

    info!("Running job {} from {}", request.id, path.display());

    let job = Job::new(JobOptions::new(request, reqwest::Client::new()))?;
    job.run(RunOptions::default()).await;

    Ok(())
}

/// Initialize logging with stdout and daily-rolling file output.
fn init_logging(data_dir: &Path) -> anyhow::Result<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("foundry-agent")
        .filename_suffix("log")
        .build(&log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep the writer alive for the lifetime of the
    // program.
    std::mem::forget(guard);

    // Base filter suppresses noisy libraries; RUST_LOG layers on top.
    let base = "hyper=warn,reqwest=warn,h2=warn,rustls=warn";
    let filter = match std::env::var("RUST_LOG") {
        Ok(env) => EnvFilter::new(format!("{base},{env}")),
        Err(_) => EnvFilter::new(format!("{base},info")),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false)) // stdout
        .with(fmt::layer().with_target(true).with_ansi(false).with_writer(non_blocking)) // file
        .init();

    info!("Logging to: {}", log_dir.display());
    Ok(())
}
