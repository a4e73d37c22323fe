//! Standalone npm registry server binary.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vm_npm_registry::metadata::MetadataService;
use vm_npm_registry::{init_subscriber, run_server, AppState, Config};

#[derive(Parser)]
#[command(name = "npm-registry")]
#[command(about = "npm registry with hosted, proxy and group repositories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON)
    #[arg(long, default_value = "npm-registry.json", global = true)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the registry server
    Start {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for metadata and tarballs
        #[arg(long)]
        data: Option<PathBuf>,
    },

    /// Write the default configuration to the config path
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Pull a proxy repository's remote registry root into the local store
    Ingest {
        /// Proxy repository id
        repository: String,

        /// Data directory for metadata and tarballs
        #[arg(long)]
        data: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_subscriber();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { host, port, data } => {
            let mut config = Config::load_or_default(&cli.config)?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data) = data {
                config.storage.data_dir = data;
            }
            run_server(config).await
        }

        Commands::InitConfig { force } => {
            if cli.config.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    cli.config.display()
                );
            }
            Config::default().save(&cli.config)?;
            println!("✅ Wrote default configuration to {}", cli.config.display());
            Ok(())
        }

        Commands::Ingest { repository, data } => {
            let mut config = Config::load_or_default(&cli.config)?;
            if let Some(data) = data {
                config.storage.data_dir = data;
            }
            let state = AppState::from_config(config)?;
            let MetadataService::Proxy(service) = state.repository(&repository)?.metadata().clone()
            else {
                bail!("Repository '{repository}' is not a proxy");
            };
            let count = service.ingest_registry_root().await?;
            println!("✅ Ingested {count} packages into {repository}");
            Ok(())
        }
    }
}
