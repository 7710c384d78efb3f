use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

use campaign_consent::clock::SystemClock;
use campaign_consent::config;
use campaign_consent::db;
use campaign_consent::delivery::WebhookDelivery;
use campaign_consent::directory::HttpDirectory;
use campaign_consent::outbox;
use campaign_consent::{CampaignEngine, EngineSettings};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let data_dir = cfg.app.resolved_data_dir();
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/campaigns.db", data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let directory = Arc::new(HttpDirectory::new(
        &cfg.directory.base_url,
        cfg.directory_timeout(),
    )?);
    let delivery = WebhookDelivery::new(
        &cfg.delivery.webhook_url,
        Duration::from_millis(cfg.delivery.timeout_ms),
    )?;

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(CampaignEngine::new(
        pool,
        Arc::new(SystemClock),
        directory.clone(),
        EngineSettings::from(&cfg),
        Some(signal_tx),
    ));

    // Notification worker (single consumer)
    let dispatcher = engine.dispatcher.clone();
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    tokio::spawn(async move {
        loop {
            match outbox::process_next_task(&dispatcher, &delivery, directory.as_ref()).await {
                Ok(processed) => {
                    if !processed {
                        tokio::time::sleep(poll_sleep).await;
                    }
                }
                Err(err) => {
                    error!(?err, "notification worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    // Cutoff timer and readiness refresh
    let ticker = engine.clone();
    let every = Duration::from_secs(cfg.app.evaluation_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match ticker.orchestrator.tick().await {
                Ok(report) => {
                    if !report.started.is_empty() || !report.failed.is_empty() {
                        info!(
                            started = report.started.len(),
                            evaluated = report.evaluated.len(),
                            failed = report.failed.len(),
                            "evaluation pass"
                        );
                    }
                }
                Err(err) => error!(?err, "evaluation pass failed"),
            }
        }
    });

    // Exhausted deliveries become administrator alerts
    let alerts = engine.clone();
    tokio::spawn(async move {
        while let Some(signal) = signal_rx.recv().await {
            if let Err(err) = alerts.orchestrator.record_signal(signal).await {
                error!(?err, "failed to record dispatch signal");
            }
        }
    });

    info!(database_url = %database_url, "campaign consent engine running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
