use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use calpull_storage::PgRecordStore;
use calpull_sync::{
    pipeline_from_config, run_sync_once_from_env, RunMode, SyncConfig, SyncPipeline, SyncScheduler,
    PULL_TRIGGER,
};
use calpull_web::AppState;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "calpull")]
#[command(about = "Pull a remote event calendar feed into the local record store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one pull now and print a confirmation line per event.
    Sync,
    /// Serve the admin surface with the periodic pull registered.
    Serve,
    /// Run only the periodic pull until interrupted.
    Schedule,
    /// Apply the Postgres record store migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync_once_from_env(RunMode::Interactive).await?;
            for line in &summary.confirmations {
                println!("{line}");
            }
            println!("{}", summary.summary_line());
        }
        Commands::Serve => {
            let pipeline = Arc::new(pipeline_from_config(&config).await?);
            let scheduler = start_scheduler(pipeline.clone()).await?;
            let served = calpull_web::serve(AppState::new(pipeline), calpull_web::port_from_env()).await;
            scheduler.shutdown().await?;
            served?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline_from_config(&config).await?);
            let scheduler = start_scheduler(pipeline).await?;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("interrupt received; removing periodic trigger");
            scheduler.unregister_trigger(PULL_TRIGGER).await?;
            scheduler.shutdown().await?;
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow!("DATABASE_URL must be set to migrate"))?;
            PgRecordStore::connect(url).await?.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn start_scheduler(pipeline: Arc<SyncPipeline>) -> Result<SyncScheduler> {
    let schedule = pipeline.settings().load().await?.schedule;
    let scheduler = SyncScheduler::new().await?;
    scheduler
        .register_periodic_trigger(PULL_TRIGGER, &schedule, pipeline)
        .await?;
    scheduler.start().await?;
    Ok(scheduler)
}
