use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use servel_core::ResourceKey;
use servel_storage::PgStore;
use servel_sync::{select_resources, SyncConfig, SyncService};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "servel-cli")]
#[command(about = "SERVEL election results sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API (default).
    Serve,
    /// Run one full sync cycle, or a single resource.
    Sync {
        /// Resource key such as `installation` or `tables-deputies`.
        #[arg(long)]
        resource: Option<String>,
    },
    /// Apply database migrations.
    Migrate,
    /// Print the current phase and the resources it selects.
    Phase,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => servel_web::serve_from_env().await?,
        Commands::Sync { resource: Some(resource) } => {
            let key: ResourceKey = resource.parse()?;
            let service = SyncService::from_config(SyncConfig::from_env()).await?;
            let result = service.sync_resource(key).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.is_failed() {
                anyhow::bail!("sync of {key} failed");
            }
        }
        Commands::Sync { resource: None } => {
            let summary = servel_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} phase={} mode={} resources={} failed={} partial={}",
                summary.run_id,
                summary.phase,
                summary.mode,
                summary.results.len(),
                summary.failed(),
                summary.partial()
            );
            for result in &summary.results {
                println!("  {}", serde_json::to_string(result)?);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url, 2)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Phase => {
            let config = SyncConfig::from_env();
            let now = chrono::Utc::now();
            let phase = config.windows.phase_at(now);
            let catalog = ResourceKey::catalog(&config.elections);
            let selected = select_resources(phase, &catalog, false)
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>();
            println!(
                "{} {} phase={} selects=[{}]",
                now.with_timezone(&config.windows.timezone).format("%Y-%m-%d %H:%M"),
                config.windows.timezone.name(),
                phase,
                selected.join(", ")
            );
        }
    }

    Ok(())
}
