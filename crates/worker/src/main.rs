//! Dunning Worker
//!
//! Drives the dunning state machine on a schedule:
//! - Due-step execution (every minute by default, `DUNNING_CRON`)
//! - Dunning backlog summary (hourly)
//! - Health check heartbeat (every 5 minutes)
//!
//! Side effects are delegated to the billing integration service at
//! `DUNNING_INTEGRATION_URL`. Without it the worker still advances schedules,
//! but retry, access, cancel and notify actions are skipped.

mod config;
mod integration;
mod runner;

use std::sync::Arc;
use std::time::Duration;

use dunning::{DunningConfig, DunningManager, DunningStatus, PgDunningStorage};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::integration::HttpIntegration;

/// Create a database connection pool
async fn create_db_pool(database_url: &str) -> anyhow::Result<sqlx::PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Wire the integration service into every callback slot
fn dunning_config(worker: &WorkerConfig) -> anyhow::Result<DunningConfig> {
    let config = DunningConfig::from_env()?;

    let Some(url) = &worker.integration_url else {
        warn!("DUNNING_INTEGRATION_URL not set - dunning actions will be skipped");
        return Ok(config);
    };

    let integration = Arc::new(HttpIntegration::new(
        url.clone(),
        worker.integration_api_key.clone(),
        worker.http_retries,
    )?);
    info!(integration_url = %url, "Dunning integration configured");

    Ok(config
        .with_payment_retrier(integration.clone())
        .with_access_controller(integration.clone())
        .with_subscription_canceller(integration.clone())
        .with_notifier(integration.clone())
        .with_customer_directory(integration.clone())
        .with_event_sink(integration))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let worker = WorkerConfig::from_env()?;
    init_logging(worker.json_logs);

    info!("Starting Dunning Worker");

    let pool = create_db_pool(&worker.database_url).await?;
    let storage = PgDunningStorage::new(pool);
    if worker.run_migrations {
        storage.migrate().await?;
    }

    let manager = Arc::new(DunningManager::new(Arc::new(storage), dunning_config(&worker)?)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Execute due dunning steps
    let step_manager = manager.clone();
    let batch_size = worker.batch_size;
    scheduler
        .add(Job::new_async(worker.cron.as_str(), move |_uuid, _l| {
            let manager = step_manager.clone();
            Box::pin(async move {
                let results =
                    runner::process_due_steps(&manager, OffsetDateTime::now_utc(), batch_size).await;
                if !results.is_empty() {
                    runner::log_step_results(&results);
                }
            })
        })?)
        .await?;
    info!(cron = %worker.cron, batch_size = batch_size, "Scheduled: Due dunning steps");

    // Job 2: Backlog summary (hourly)
    let summary_manager = manager.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let manager = summary_manager.clone();
            Box::pin(async move {
                let active = manager.list_states_by_status(DunningStatus::Active).await;
                let paused = manager.list_states_by_status(DunningStatus::Paused).await;
                match (active, paused) {
                    (Ok(active), Ok(paused)) => {
                        let owed_cents: i64 = active
                            .iter()
                            .chain(paused.iter())
                            .map(|s| s.total_amount_owed_cents())
                            .sum();
                        info!(
                            active = active.len(),
                            paused = paused.len(),
                            owed_cents = owed_cents,
                            "Dunning backlog"
                        );
                    }
                    (Err(e), _) | (_, Err(e)) => {
                        error!(error = %e, "Failed to load dunning backlog");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Dunning backlog summary (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Dunning Worker started successfully with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
