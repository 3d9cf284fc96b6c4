mod check_cmd;
mod config;
mod relationships_cmd;
mod serve;
mod terminal_output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "relgate")]
#[command(about = "Authorizing reverse proxy backed by a relationship graph")]
#[command(version)]
struct Cli {
    /// Config file (default: $RELGATE_CONFIG_DIR/relgate.yaml or ~/.relgate/relgate.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Serve,
    /// Compile a rules file and report problems
    CheckRules {
        file: PathBuf,
        /// Object field paths rules may reference as `object.<path>`
        #[arg(long = "object-field")]
        object_fields: Vec<String>,
    },
    /// Print relationships stored in the permission graph
    Relationships {
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
        /// Only relationships on this resource type
        #[arg(long = "type")]
        resource_type: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            let (path, config) = config::load(cli.config.as_deref()).await?;
            relgate_logging::init_logger(config.logging.dir.as_deref(), &config.logging.level, config.logging.json);
            tracing::info!(config = %path.display(), "Configuration loaded");
            serve::run(config).await?;
        }
        Commands::CheckRules { file, object_fields } => {
            relgate_logging::init_logger(None, "warn", false);
            check_cmd::run(&file, &object_fields).await?;
        }
        Commands::Relationships { limit, resource_type } => {
            relgate_logging::init_logger(None, "warn", false);
            let (_, config) = config::load(cli.config.as_deref()).await?;
            relationships_cmd::run(&config, limit, resource_type).await?;
        }
    }

    Ok(())
}
