use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tooldir_core::SyncMode;
use tooldir_storage::{PgStore, StoreBackend};
use tooldir_sync::resolve::{HeadProbe, UrlResolver, DEFAULT_RESOLVE_LIMIT};
use tooldir_sync::{SyncConfig, SyncRequest, SyncServices};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tooldir-cli")]
#[command(about = "Product Hunt tool directory sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental sync and print the JSON summary.
    Sync(SyncArgs),
    /// Serve the HTTP API (and cron jobs when enabled).
    Serve,
    /// Apply SQL migrations against DATABASE_URL.
    Migrate,
    /// Replace stored Product Hunt redirect links with their final URLs.
    ResolveUrls {
        #[arg(long, default_value_t = DEFAULT_RESOLVE_LIMIT)]
        limit: usize,
    },
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, default_value = "resume")]
    mode: SyncMode,
    #[arg(long, default_value_t = 6)]
    pages: u32,
    #[arg(long, default_value_t = 25)]
    size: u32,
    #[arg(long = "delay-ms", default_value_t = 800)]
    delay_ms: u64,
    /// Request maker and topic enrichment.
    #[arg(long)]
    topics: bool,
    /// Replay recorded pages from a directory instead of calling the API.
    #[arg(long)]
    fixtures: Option<PathBuf>,
}

impl Default for SyncArgs {
    fn default() -> Self {
        let defaults = SyncRequest::default();
        Self {
            mode: defaults.mode,
            pages: defaults.pages,
            size: defaults.page_size,
            delay_ms: defaults.delay_ms,
            topics: defaults.topics,
            fixtures: None,
        }
    }
}

impl From<&SyncArgs> for SyncRequest {
    fn from(args: &SyncArgs) -> Self {
        SyncRequest {
            mode: args.mode,
            pages: args.pages,
            page_size: args.size,
            delay_ms: args.delay_ms,
            topics: args.topics,
        }
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let services = SyncServices::from_env(args.fixtures.as_deref()).await?;
            match services.runner.trigger(SyncRequest::from(&args)).await {
                Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                Err(failure) => {
                    println!("{}", serde_json::to_string_pretty(&failure.report)?);
                    bail!("sync failed ({}): {}", failure.error.kind(), failure.error);
                }
            }
        }
        Commands::Serve => tooldir_web::serve_from_env().await?,
        Commands::Migrate => {
            let StoreBackend::Postgres { database_url } = StoreBackend::from_env()? else {
                bail!("migrate needs DATABASE_URL; PostgREST schemas are managed upstream");
            };
            let store = PgStore::connect(&database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::ResolveUrls { limit } => {
            let config = SyncConfig::from_env();
            let store = StoreBackend::from_env()?
                .connect(&config.http_client_config())
                .await?;
            let resolver = UrlResolver::new(Arc::new(HeadProbe::new(&config.user_agent)?))
                .with_limit(limit);
            let report = resolver.run(&*store).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
