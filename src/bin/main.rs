use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gateway_guard::{create_gateway, load_config, resolve_config_path, serve};
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gateway-guard")]
#[command(about = "Authenticating API gateway front end")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Serve {
        /// Path to gateway.json
        #[arg(short, long, env = "GATEWAY_CONFIG")]
        config: Option<PathBuf>,
        /// Override the listen address from the config file
        #[arg(long)]
        bind: Option<String>,
    },
    /// Load and validate a config file, then exit
    CheckConfig {
        #[arg(short, long, env = "GATEWAY_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Show which route policy a request path resolves to
    Resolve {
        path: String,
        #[arg(short, long, env = "GATEWAY_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("gateway_guard=info".parse()?)
                .add_directive("tower_http=warn".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, bind } => {
            let path = resolve_config_path(config.as_deref())?;
            info!("Loading gateway config from {}", path.display());
            let config = load_config(&path)?;
            let bind = bind.unwrap_or_else(|| config.listen.clone());

            let runtime = create_gateway(&config)?;
            // First tick fires immediately and loads the verification key.
            runtime
                .keys
                .clone()
                .spawn_periodic_refresh(config.tokens.refresh_interval());

            serve(runtime.state, &bind).await?;
        }
        Commands::CheckConfig { config } => {
            let path = resolve_config_path(config.as_deref())?;
            let config = load_config(&path)?;
            println!(
                "{}: OK ({} routes, identity service at {})",
                path.display(),
                config.routes.len(),
                config.identity.base_url
            );
        }
        Commands::Resolve { path: request_path, config } => {
            let path = resolve_config_path(config.as_deref())?;
            let config = load_config(&path)?;
            match config.route_table().resolve(&request_path) {
                Some(route) => println!("{}", serde_json::to_string_pretty(route)?),
                None => println!("No route for {}", request_path),
            }
        }
    }

    Ok(())
}
