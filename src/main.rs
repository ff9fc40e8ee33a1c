//! # Subsync Main Entry Point
//!
//! CLI entry for the subsync service: apply migrations or run the service
//! (health sweep plus scheduled syncs of active connections).

use std::sync::Arc;

use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use subsync::classify::ClassificationService;
use subsync::classify::openai::OpenAiChat;
use subsync::config::{AppConfig, ConfigLoader};
use subsync::dedupe::DedupePolicy;
use subsync::filter::EmailFilter;
use subsync::mailbox::gmail::GmailSource;
use subsync::mailbox::token::{GoogleTokenProvider, TokenProvider};
use subsync::models::sync_job::JobType;
use subsync::orchestrator::SyncOrchestrator;
use subsync::progress::ProgressTracker;
use subsync::repositories::connection::ConnectionRepository;
use subsync::sweeper::JobSweeper;

#[derive(Parser)]
#[command(name = "subsync", about = "Mailbox subscription detection and sync service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations and exit.
    Migrate,
    /// Run the service: periodic syncs plus the job health sweep.
    Run,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config_loader = ConfigLoader::new();
    let config = config_loader.load()?;
    config.validate()?;

    subsync::telemetry::init_tracing(&config)?;
    if let Ok(redacted_json) = config.redacted_json() {
        info!(profile = %config.profile, "Loaded configuration: {}", redacted_json);
    }

    let db = subsync::db::init_pool(&config).await?;

    match cli.command {
        Command::Migrate => {
            Migrator::up(&db, None).await?;
            info!("Migrations applied");
            Ok(())
        }
        Command::Run => run_service(config, db).await,
    }
}

async fn run_service(
    config: AppConfig,
    db: sea_orm::DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    Migrator::up(&db, None).await?;

    let shutdown = CancellationToken::new();
    let sweeper = JobSweeper::new(config.sweep.clone(), Arc::new(db.clone()));
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown.clone()));

    let token_provider: Arc<dyn TokenProvider> = Arc::new(GoogleTokenProvider::new(
        config.gmail_client_id.clone().unwrap_or_default(),
        config.gmail_client_secret.clone().unwrap_or_default(),
    ));
    let tracker = Arc::new(ProgressTracker::new());
    let retry = subsync::backoff::RetryPolicy {
        max_attempts: config.retry.max_attempts,
        base_seconds: config.retry.base_seconds,
        max_seconds: config.retry.max_seconds,
        jitter_factor: config.retry.jitter_factor,
    };

    let sync_loop = {
        let db = db.clone();
        let config = config.clone();
        let shutdown = shutdown.clone();
        async move {
            let connections = ConnectionRepository::new(db.clone());
            let interval = std::time::Duration::from_secs(config.sweep.tick_seconds);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let active = match connections.list_active().await {
                    Ok(active) => active,
                    Err(err) => {
                        error!(error = %err, "Failed to load active connections");
                        continue;
                    }
                };

                for connection in active {
                    let source = Arc::new(GmailSource::new(
                        token_provider.clone(),
                        connection.clone(),
                        retry.clone(),
                    ));
                    let classifier = ClassificationService::new(
                        Arc::new(OpenAiChat::new(&config.llm)),
                        config.llm.clone(),
                        retry.clone(),
                    );
                    let orchestrator = SyncOrchestrator::new(
                        db.clone(),
                        source,
                        classifier,
                        EmailFilter::new(&config.filter),
                        DedupePolicy::new(&config.dedupe),
                        tracker.clone(),
                        config.sync.clone(),
                    );

                    let mode = if connection.last_synced_at.is_none() {
                        JobType::Initial
                    } else {
                        JobType::Incremental
                    };

                    if let Err(err) = orchestrator.run_sync(&connection, mode).await {
                        error!(
                            connection_id = %connection.id,
                            error = %err,
                            "Sync run failed"
                        );
                    }
                }
            }
        }
    };
    let sync_handle = tokio::spawn(sync_loop);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    let _ = sweeper_handle.await;
    let _ = sync_handle.await;

    Ok(())
}
