use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use campaign_consent::clock::SystemClock;
use campaign_consent::config;
use campaign_consent::db;
use campaign_consent::directory::HttpDirectory;
use campaign_consent::model::{CampaignKind, Decision, NewCampaignEvent, Readiness};
use campaign_consent::orchestrator::{verdict_counts, StartOutcome, StartTrigger};
use campaign_consent::{CampaignEngine, EngineSettings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Administer campaign events from the command line")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a Draft event
    Create {
        #[arg(long)]
        title: String,
        /// VACCINE or HEALTH_CHECK
        #[arg(long, default_value = "VACCINE")]
        kind: String,
        /// Target class id; repeat for several classes
        #[arg(long = "class", required = true)]
        classes: Vec<String>,
        /// RFC 3339 timestamps
        #[arg(long)]
        window_start: DateTime<Utc>,
        #[arg(long)]
        window_end: DateTime<Utc>,
        #[arg(long)]
        cutoff: DateTime<Utc>,
        /// Overrides the configured consent threshold for this event
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Resolve rosters and send the first consent requests
    Schedule { event_id: String },
    /// Re-resolve rosters of a Scheduled event
    Refresh { event_id: String },
    /// Queue reminders for students whose consent is still pending
    Remind { event_id: String },
    /// Close the consent window now and start the event
    Override { event_id: String },
    Complete { event_id: String },
    Cancel { event_id: String },
    /// Record a guardian decision
    Decide {
        event_id: String,
        student_id: String,
        /// agree or disagree
        decision: String,
        #[arg(long)]
        guardian: String,
        /// Revision the guardian last saw
        #[arg(long, default_value = "0")]
        revision: i64,
    },
    /// Readiness per class and outstanding alerts
    Report { event_id: String },
    /// Disagreements and the feedback attached to them
    Disagreements { event_id: String },
    /// Delivery alerts, optionally for one event
    Alerts { event_id: Option<String> },
}

fn parse_decision(value: &str) -> Result<Decision> {
    match value.to_ascii_lowercase().as_str() {
        "agree" | "yes" => Ok(Decision::Agree),
        "disagree" | "no" => Ok(Decision::Disagree),
        other => Err(anyhow!("unknown decision {:?}", other)),
    }
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
    let engine = CampaignEngine::new(
        pool,
        Arc::new(SystemClock),
        directory,
        EngineSettings::from(&cfg),
        None,
    );
    let orch = &engine.orchestrator;

    match args.command {
        Command::Create {
            title,
            kind,
            classes,
            window_start,
            window_end,
            cutoff,
            threshold,
        } => {
            let kind = CampaignKind::parse(&kind.to_ascii_uppercase())
                .ok_or_else(|| anyhow!("unknown campaign kind {:?}", kind))?;
            let event = orch
                .create_event(NewCampaignEvent {
                    kind,
                    title,
                    target_classes: classes,
                    window_start,
                    window_end,
                    cutoff_at: cutoff,
                    consent_threshold: threshold,
                })
                .await?;
            println!("{}", event.id);
        }
        Command::Schedule { event_id } => {
            let event = orch.schedule(&event_id).await?;
            println!("{} {}", event.id, event.status);
        }
        Command::Refresh { event_id } => {
            for class in orch.refresh_roster(&event_id).await? {
                println!(
                    "{}\t{} students\t{} new",
                    class.roster.class_id,
                    class.roster.students.len(),
                    class.newly_enrolled().len()
                );
            }
        }
        Command::Remind { event_id } => {
            let queued = orch.send_reminders(&event_id).await?;
            println!("{} reminders queued", queued);
        }
        Command::Override { event_id } => match orch.start(&event_id, StartTrigger::AdminOverride).await? {
            StartOutcome::Started(eval) => {
                let counts = verdict_counts(&eval);
                println!(
                    "started: {} ready, {} partially ready, {} closed",
                    counts.get(&Readiness::Ready).unwrap_or(&0),
                    counts.get(&Readiness::PartiallyReady).unwrap_or(&0),
                    counts.get(&Readiness::Closed).unwrap_or(&0)
                );
            }
            StartOutcome::AllClosed(eval) => {
                println!("not started: all {} classes closed", eval.classes.len());
            }
            StartOutcome::NotDue => println!("not started: cutoff not reached"),
        },
        Command::Complete { event_id } => {
            let event = orch.complete(&event_id).await?;
            println!("{} {}", event.id, event.status);
        }
        Command::Cancel { event_id } => {
            let event = orch.cancel(&event_id).await?;
            println!("{} {}", event.id, event.status);
        }
        Command::Decide {
            event_id,
            student_id,
            decision,
            guardian,
            revision,
        } => {
            let record = engine
                .submit_decision(
                    &event_id,
                    &student_id,
                    parse_decision(&decision)?,
                    &guardian,
                    revision,
                )
                .await?;
            println!(
                "{} {} revision {}",
                record.student_id,
                record.status.as_str(),
                record.revision
            );
        }
        Command::Report { event_id } => {
            let report = orch.report(&event_id).await?;
            println!(
                "{} [{}] {} cutoff {}",
                report.event.title,
                report.event.status,
                report.event.kind.label(),
                report.event.cutoff_at.to_rfc3339()
            );
            if let Some(eval) = &report.evaluation {
                for class in &eval.classes {
                    println!(
                        "  {}\t{}\tagree {} disagree {} pending {}",
                        class.class_id,
                        class.verdict.as_str(),
                        class.agree,
                        class.disagree,
                        class.pending
                    );
                }
                if !eval.inconsistent.is_empty() {
                    println!("  off-roster records: {}", eval.inconsistent.join(", "));
                }
            }
            if !report.alerts.is_empty() {
                println!("  {} delivery alerts", report.alerts.len());
            }
        }
        Command::Disagreements { event_id } => {
            for review in engine.ledger.disagreements(&event_id).await? {
                println!(
                    "{}\t{}",
                    review.record.student_id,
                    review.record.acting_guardian_id.as_deref().unwrap_or("-")
                );
                for fb in review.feedback {
                    println!("    {}", fb.body);
                }
            }
        }
        Command::Alerts { event_id } => {
            for alert in orch.alerts(event_id.as_deref()).await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    alert.created_at.to_rfc3339(),
                    alert.event_id,
                    alert.student_id,
                    alert.kind.as_str(),
                    alert.detail
                );
            }
        }
    }

    Ok(())
}
