//! Wires the components together over one pool and one clock.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{instrument, warn};

use crate::clock::Clock;
use crate::cohort::CohortResolver;
use crate::config::{Config, RetryPolicy};
use crate::db::Pool;
use crate::directory::StudentDirectory;
use crate::error::EngineResult;
use crate::ledger::ConsentLedger;
use crate::model::{ConsentRecord, Decision, NotificationType};
use crate::orchestrator::CampaignOrchestrator;
use crate::outbox::{DispatchSignal, NotificationDispatcher};
use crate::scheduling::{SchedulingCoordinator, DEFAULT_CONSENT_THRESHOLD};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    pub consent_threshold: f64,
    pub retry: RetryPolicy,
    pub directory_timeout: Duration,
    pub directory_attempts: u32,
    pub directory_retry_base: Duration,
    pub delivery_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            consent_threshold: DEFAULT_CONSENT_THRESHOLD,
            retry: RetryPolicy::default(),
            directory_timeout: Duration::from_secs(5),
            directory_attempts: 3,
            directory_retry_base: Duration::from_millis(200),
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            consent_threshold: cfg.campaign.consent_threshold,
            retry: cfg.retry_policy(),
            directory_timeout: cfg.directory_timeout(),
            directory_attempts: cfg.directory.max_attempts,
            directory_retry_base: Duration::from_millis(200),
            delivery_timeout: Duration::from_millis(cfg.delivery.timeout_ms),
        }
    }
}

pub struct CampaignEngine {
    pub resolver: Arc<CohortResolver>,
    pub ledger: ConsentLedger,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub coordinator: Arc<SchedulingCoordinator>,
    pub orchestrator: CampaignOrchestrator,
}

impl CampaignEngine {
    pub fn new(
        pool: Pool,
        clock: Arc<dyn Clock>,
        directory: Arc<dyn StudentDirectory>,
        settings: EngineSettings,
        signals: Option<UnboundedSender<DispatchSignal>>,
    ) -> Self {
        let resolver = Arc::new(
            CohortResolver::new(pool.clone(), directory, clock.clone()).with_retry(
                settings.directory_timeout,
                settings.directory_attempts,
                settings.directory_retry_base,
            ),
        );
        let mut dispatcher = NotificationDispatcher::new(pool.clone(), clock.clone(), settings.retry)
            .with_call_timeout(settings.delivery_timeout);
        if let Some(tx) = signals {
            dispatcher = dispatcher.with_signals(tx);
        }
        let dispatcher = Arc::new(dispatcher);
        let coordinator = Arc::new(SchedulingCoordinator::new(
            pool.clone(),
            clock.clone(),
            settings.consent_threshold,
        ));
        let ledger = ConsentLedger::new(pool.clone(), clock.clone());
        let orchestrator = CampaignOrchestrator::new(
            pool,
            clock,
            resolver.clone(),
            dispatcher.clone(),
            coordinator.clone(),
        );
        Self {
            resolver,
            ledger,
            dispatcher,
            coordinator,
            orchestrator,
        }
    }

    /// Records a guardian decision, then re-evaluates the student's class and
    /// settles the student's outstanding notifications. Follow-up failures are
    /// logged; the next timer pass recomputes readiness anyway.
    #[instrument(skip(self))]
    pub async fn submit_decision(
        &self,
        event_id: &str,
        student_id: &str,
        decision: Decision,
        guardian_id: &str,
        expected_revision: i64,
    ) -> EngineResult<ConsentRecord> {
        let record = self
            .ledger
            .record_decision(event_id, student_id, decision, guardian_id, expected_revision)
            .await?;

        if let Err(err) = self.coordinator.refresh_for_student(event_id, student_id).await {
            warn!(event_id, student_id, ?err, "readiness refresh after decision failed");
        }
        let settled = [
            NotificationType::ConsentRequest,
            NotificationType::Reminder,
            NotificationType::DecisionReceipt,
        ];
        if let Err(err) = self
            .dispatcher
            .acknowledge_open(event_id, student_id, &settled)
            .await
        {
            warn!(event_id, student_id, ?err, "failed to settle open notifications");
        }
        if let Err(err) = self
            .dispatcher
            .enqueue(event_id, student_id, NotificationType::DecisionReceipt)
            .await
        {
            warn!(event_id, student_id, ?err, "failed to queue decision receipt");
        }
        Ok(record)
    }
}
