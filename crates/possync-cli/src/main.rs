use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use possync_pipeline::{build_alert_sink, QualityMonitor, SyncConfig};
use possync_store::{PgStore, Store};

#[derive(Debug, Parser)]
#[command(name = "possync-cli")]
#[command(about = "POS sync and reconciliation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full sync for every enabled tenant.
    Sync,
    /// Recompute the quality snapshot for a tenant and business date.
    Reconcile {
        tenant_id: i64,
        date: NaiveDate,
    },
    /// Run the cron scheduler in the foreground.
    Schedule,
    /// Apply pending database migrations.
    Migrate,
    /// Serve the HTTP API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summaries = possync_pipeline::run_sync_once_from_env().await?;
            for summary in &summaries {
                println!(
                    "sync complete: tenant={} batch={} collected={} processed={} inserted={} quality={}",
                    summary.tenant_id,
                    summary.batch_id,
                    summary.collected_records,
                    summary.orchestration.processed_count,
                    summary.orchestration.inserted_count,
                    summary.snapshot.status.as_str(),
                );
            }
        }
        Commands::Reconcile { tenant_id, date } => {
            let config = SyncConfig::from_env();
            let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.database_url).await?);
            let alerter = build_alert_sink(&config);
            let monitor = QualityMonitor::new(store, alerter, config.thresholds);
            let snapshot = monitor.reconcile(tenant_id, date).await?;
            println!(
                "reconciled: tenant={tenant_id} date={date} expected={:.2} actual={:.2} precision={:.2}% status={}",
                snapshot.expected_value,
                snapshot.actual_value,
                snapshot.percent_precision,
                snapshot.status.as_str(),
            );
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = possync_pipeline::build_pipeline_from_env(config).await?;
            match pipeline.maybe_build_scheduler().await? {
                Some(mut scheduler) => {
                    scheduler.start().await?;
                    println!("scheduler running; press ctrl-c to stop");
                    tokio::signal::ctrl_c().await?;
                }
                None => println!("scheduler disabled"),
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            possync_web::serve_from_env().await?;
        }
    }

    Ok(())
}
