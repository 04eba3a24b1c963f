use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use igpulse_meta::classify::Classifier;
use igpulse_meta::MetaClient;
use igpulse_storage::Store;

#[derive(Debug, Parser)]
#[command(name = "igpulse")]
#[command(about = "Instagram Growth Pulse command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync every connected account once and print the report
    Sync,
    /// Apply pending database migrations
    Migrate,
    /// Run the JSON API server
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Sync => {
            let store = Store::connect(&database_url()?).await?;
            let meta = MetaClient::from_env()?;
            let classifier = Classifier::from_env();
            let report = igpulse_sync::sync_all_accounts(&store, &meta, &classifier).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let store = Store::connect(&database_url()?).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            igpulse_web::serve_from_env().await?;
        }
    }

    Ok(())
}

fn database_url() -> Result<String> {
    std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL is not set"))
}
