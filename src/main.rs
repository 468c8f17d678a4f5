use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use flyover::commands;
use flyover::config::{AppConfig, config_path};
use flyover::log_format::PipelineLogFormat;

#[derive(Parser)]
#[command(name = "flyover", about = "Real-time aircraft surveillance data plane")]
struct Cli {
    /// Path to the TOML config file (defaults to the environment's path)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the complete data plane: ingestion, delivery, and the HTTP API
    Run,
    /// Run only the HTTP/WebSocket front
    Web,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().event_format(PipelineLogFormat))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(config_path);
    let config = AppConfig::load(&path)?;

    match cli.command {
        Commands::Run => commands::run::handle_run(config).await,
        Commands::Web => commands::web::handle_web(config).await,
    }
}
