//! Notification dispatcher: deduplicated task queue with per-task backoff.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::db::{self, Pool};
use crate::delivery::{DeliveryError, NotificationDelivery, NotificationPayload};
use crate::directory::{GuardianContact, StudentDirectory};
use crate::error::{EngineError, EngineResult};
use crate::model::{
    CampaignEvent, DeliveryStatus, EventStatus, NotificationTask, NotificationType, TaskId,
};

/// Raised towards the orchestrator; never blocks scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchSignal {
    DeliveryExhausted {
        task: NotificationTask,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying {
        attempt: i32,
        next_due: DateTime<Utc>,
    },
    Exhausted,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    pool: Pool,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    call_timeout: Duration,
    signals: Option<UnboundedSender<DispatchSignal>>,
}

impl NotificationDispatcher {
    pub fn new(pool: Pool, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            clock,
            policy,
            call_timeout: Duration::from_secs(10),
            signals: None,
        }
    }

    pub fn with_signals(mut self, signals: UnboundedSender<DispatchSignal>) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Returns the open task for the key if there is one, otherwise queues a
    /// new task due now.
    pub async fn enqueue(
        &self,
        event_id: &str,
        student_id: &str,
        kind: NotificationType,
    ) -> EngineResult<TaskId> {
        let ids = self
            .enqueue_wave(event_id, &[student_id.to_string()], kind)
            .await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| EngineError::Invalid("enqueue produced no task".into()))
    }

    /// Enqueues one task per student atomically; a failed or cancelled call
    /// leaves no task behind.
    #[instrument(skip(self, students), fields(count = students.len()))]
    pub async fn enqueue_wave(
        &self,
        event_id: &str,
        students: &[String],
        kind: NotificationType,
    ) -> EngineResult<Vec<TaskId>> {
        let ids = db::enqueue_tasks(&self.pool, event_id, students, kind, self.clock.now()).await?;
        info!(event_id, kind = kind.as_str(), count = ids.len(), "notifications enqueued");
        Ok(ids)
    }

    async fn load(&self, task_id: TaskId) -> EngineResult<NotificationTask> {
        db::fetch_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("notification task {}", task_id)))
    }

    async fn not_open(&self, task_id: TaskId) -> EngineError {
        match self.load(task_id).await {
            Ok(task) => EngineError::Invalid(format!(
                "notification task {} is {}",
                task_id,
                task.status.as_str()
            )),
            Err(err) => err,
        }
    }

    pub async fn mark_sent(&self, task_id: TaskId) -> EngineResult<()> {
        if db::mark_task_sent(&self.pool, task_id, self.clock.now()).await? {
            Ok(())
        } else {
            Err(self.not_open(task_id).await)
        }
    }

    pub async fn acknowledge(&self, task_id: TaskId) -> EngineResult<()> {
        if db::acknowledge_task(&self.pool, task_id, self.clock.now()).await? {
            Ok(())
        } else {
            Err(self.not_open(task_id).await)
        }
    }

    /// Acknowledges every open task of the given kinds for the student.
    pub async fn acknowledge_open(
        &self,
        event_id: &str,
        student_id: &str,
        kinds: &[NotificationType],
    ) -> EngineResult<usize> {
        let now = self.clock.now();
        let mut count = 0;
        for task in db::open_tasks_for(&self.pool, event_id, student_id).await? {
            if kinds.contains(&task.kind) && db::acknowledge_task(&self.pool, task.id, now).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Records a failed delivery attempt. Transient failures go back in the
    /// queue with exponential backoff until the attempt ceiling; permanent
    /// failures and the last allowed attempt end the task and raise
    /// `DeliveryExhausted`.
    #[instrument(skip(self, error))]
    pub async fn mark_failed(
        &self,
        task_id: TaskId,
        error: &DeliveryError,
    ) -> EngineResult<FailureOutcome> {
        let task = self.load(task_id).await?;
        if task.status.is_terminal() {
            return Err(self.not_open(task_id).await);
        }
        // A task already marked Sent had its attempt counted then.
        let attempts = match task.status {
            DeliveryStatus::Sent => task.attempt,
            _ => task.attempt + 1,
        };
        let now = self.clock.now();
        let reason = error.to_string();

        if error.is_permanent() || attempts >= self.policy.max_attempts {
            // Settled concurrently (acknowledged by a decision): nothing to report.
            if !db::fail_task(&self.pool, task_id, attempts, &reason, now).await? {
                return Err(self.not_open(task_id).await);
            }
            warn!(task_id, attempts, error = %reason, "notification delivery exhausted");
            let mut task = task;
            task.attempt = attempts;
            task.status = DeliveryStatus::Failed;
            task.last_error = Some(reason.clone());
            self.signal(DispatchSignal::DeliveryExhausted { task, reason });
            return Ok(FailureOutcome::Exhausted);
        }

        let delay = self.policy.backoff_secs(attempts - 1);
        let next_due = now + ChronoDuration::seconds(delay);
        if !db::backoff_task(&self.pool, task_id, attempts, &reason, next_due, now).await? {
            return Err(self.not_open(task_id).await);
        }
        warn!(task_id, attempts, delay, error = %reason, "notification failed; backoff");
        Ok(FailureOutcome::Retrying {
            attempt: attempts,
            next_due,
        })
    }

    /// Ends a task without raising a signal (its event no longer needs it).
    pub async fn close(&self, task_id: TaskId, reason: &str) -> EngineResult<()> {
        let task = self.load(task_id).await?;
        if db::fail_task(&self.pool, task_id, task.attempt, reason, self.clock.now()).await? {
            info!(task_id, reason, "notification closed");
        } else {
            debug!(task_id, status = task.status.as_str(), "notification already settled");
        }
        Ok(())
    }

    pub async fn tasks(&self, event_id: &str) -> EngineResult<Vec<NotificationTask>> {
        Ok(db::list_tasks(&self.pool, event_id).await?)
    }

    fn signal(&self, signal: DispatchSignal) {
        match &self.signals {
            Some(tx) => {
                if let Err(err) = tx.send(signal) {
                    warn!(signal = ?err.0, "dispatch signal receiver gone");
                }
            }
            None => warn!(?signal, "no receiver for dispatch signal"),
        }
    }
}

/// Text shown to the guardian for a task.
pub fn render_summary(kind: NotificationType, event: &CampaignEvent) -> String {
    let what = format!(
        "{} ({}) on {}",
        event.title,
        event.kind.label(),
        event.window_start.format("%Y-%m-%d")
    );
    match kind {
        NotificationType::ConsentRequest => format!("Consent requested: {}", what),
        NotificationType::Reminder => format!("Reminder, consent still pending: {}", what),
        NotificationType::DecisionReceipt => format!("Your consent decision was recorded: {}", what),
        NotificationType::ClassClosed => {
            format!("Not enough consent was collected; session will be rescheduled: {}", what)
        }
    }
}

fn render(task: &NotificationTask, event: &CampaignEvent, guardian: GuardianContact) -> NotificationPayload {
    NotificationPayload {
        task_id: task.id,
        kind: task.kind,
        event_id: task.event_id.clone(),
        student_id: task.student_id.clone(),
        guardian_id: guardian.guardian_id,
        guardian_name: guardian.name,
        contact: guardian.contact,
        summary: render_summary(task.kind, event),
        consent_deadline: event.cutoff_at,
    }
}

/// Delivers the next due task, if any. Returns whether a task was processed.
#[instrument(skip_all)]
pub async fn process_next_task(
    dispatcher: &NotificationDispatcher,
    delivery: &dyn NotificationDelivery,
    directory: &dyn StudentDirectory,
) -> EngineResult<bool> {
    let Some(task) = db::next_due_task(&dispatcher.pool, dispatcher.clock.now()).await? else {
        return Ok(false);
    };

    let event = db::fetch_event(&dispatcher.pool, &task.event_id).await?;
    let event = match event {
        Some(e) if !matches!(e.status, EventStatus::Cancelled | EventStatus::Completed) => e,
        Some(e) => {
            dispatcher
                .close(task.id, &format!("event {}", e.status.as_str().to_lowercase()))
                .await?;
            return Ok(true);
        }
        None => {
            dispatcher.close(task.id, "event missing").await?;
            return Ok(true);
        }
    };

    let contact = tokio::time::timeout(
        dispatcher.call_timeout,
        directory.guardian_contact(&task.student_id),
    )
    .await;
    let guardian = match contact {
        Ok(Ok(Some(g))) => g,
        Ok(Ok(None)) => {
            let err = DeliveryError::Permanent(format!("no guardian on file for {}", task.student_id));
            dispatcher.mark_failed(task.id, &err).await?;
            return Ok(true);
        }
        Ok(Err(e)) => {
            dispatcher
                .mark_failed(task.id, &DeliveryError::Transient(format!("directory: {}", e)))
                .await?;
            return Ok(true);
        }
        Err(_) => {
            dispatcher
                .mark_failed(task.id, &DeliveryError::Transient("directory timed out".into()))
                .await?;
            return Ok(true);
        }
    };

    let payload = render(&task, &event, guardian);
    let res = match tokio::time::timeout(dispatcher.call_timeout, delivery.deliver(&payload)).await {
        Ok(res) => res,
        Err(_) => Err(DeliveryError::Transient("delivery timed out".into())),
    };
    match res {
        Ok(()) => {
            dispatcher.mark_sent(task.id).await?;
            info!(task_id = task.id, kind = task.kind.as_str(), "notification sent");
        }
        Err(err) => {
            dispatcher.mark_failed(task.id, &err).await?;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::CampaignKind;
    use chrono::TimeZone;

    fn event(now: DateTime<Utc>) -> CampaignEvent {
        CampaignEvent {
            id: "evt".into(),
            kind: CampaignKind::HealthCheck,
            title: "Eye screening".into(),
            target_classes: vec!["2C".into()],
            window_start: Utc.with_ymd_and_hms(2025, 10, 6, 8, 0, 0).unwrap(),
            window_end: Utc.with_ymd_and_hms(2025, 10, 6, 12, 0, 0).unwrap(),
            cutoff_at: Utc.with_ymd_and_hms(2025, 10, 3, 17, 0, 0).unwrap(),
            consent_threshold: None,
            status: EventStatus::Scheduled,
            created_at: now,
            updated_at: now,
        }
    }

    async fn setup() -> (NotificationDispatcher, Arc<ManualClock>) {
        let pool = db::init_memory_pool().await.unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 10, 1, 9, 0, 0).unwrap(),
        ));
        db::insert_event(&pool, &event(clock.now())).await.unwrap();
        let dispatcher = NotificationDispatcher::new(pool, clock.clone(), RetryPolicy::default());
        (dispatcher, clock)
    }

    #[test]
    fn summary_names_event_and_date() {
        let ev = event(Utc::now());
        let text = render_summary(NotificationType::Reminder, &ev);
        assert!(text.starts_with("Reminder"));
        assert!(text.contains("Eye screening"));
        assert!(text.contains("2025-10-06"));
    }

    #[tokio::test]
    async fn failure_after_send_counts_attempt_once() {
        let (dispatcher, clock) = setup().await;
        let id = dispatcher
            .enqueue("evt", "st-1", NotificationType::ConsentRequest)
            .await
            .unwrap();
        dispatcher.mark_sent(id).await.unwrap();

        let outcome = dispatcher
            .mark_failed(id, &DeliveryError::Transient("bounced".into()))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Retrying {
                attempt: 1,
                next_due: clock.now() + ChronoDuration::seconds(5),
            }
        );
        let task = dispatcher.load(id).await.unwrap();
        assert_eq!(task.status, DeliveryStatus::Queued);
        assert_eq!(task.last_error.as_deref(), Some("transient delivery failure: bounced"));
    }

    #[tokio::test]
    async fn terminal_tasks_reject_failures() {
        let (dispatcher, _clock) = setup().await;
        let id = dispatcher
            .enqueue("evt", "st-1", NotificationType::DecisionReceipt)
            .await
            .unwrap();
        dispatcher
            .mark_failed(id, &DeliveryError::Permanent("bad address".into()))
            .await
            .unwrap();
        assert!(matches!(
            dispatcher
                .mark_failed(id, &DeliveryError::Transient("again".into()))
                .await,
            Err(EngineError::Invalid(_))
        ));
        assert!(dispatcher.mark_sent(id).await.is_err());
    }

    // Emulates another writer settling the task between load and update.
    async fn settle_concurrently(dispatcher: &NotificationDispatcher) {
        sqlx::query(
            "CREATE TRIGGER skip_task_update BEFORE UPDATE ON notification_tasks \
             BEGIN SELECT RAISE(IGNORE); END",
        )
        .execute(&dispatcher.pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn lost_failure_update_raises_no_signal() {
        let (dispatcher, _clock) = setup().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let dispatcher = dispatcher.with_signals(tx);
        let exhausted = dispatcher
            .enqueue("evt", "st-1", NotificationType::ConsentRequest)
            .await
            .unwrap();
        let retried = dispatcher
            .enqueue("evt", "st-2", NotificationType::ConsentRequest)
            .await
            .unwrap();
        settle_concurrently(&dispatcher).await;

        assert!(dispatcher
            .mark_failed(exhausted, &DeliveryError::Permanent("bad address".into()))
            .await
            .is_err());
        assert!(dispatcher
            .mark_failed(retried, &DeliveryError::Transient("bounced".into()))
            .await
            .is_err());
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.load(retried).await.unwrap().attempt, 0);

        dispatcher.close(exhausted, "event cancelled").await.unwrap();
        assert_eq!(
            dispatcher.load(exhausted).await.unwrap().status,
            DeliveryStatus::Queued
        );
    }

    #[tokio::test]
    async fn acknowledge_open_filters_by_kind() {
        let (dispatcher, _clock) = setup().await;
        let request = dispatcher
            .enqueue("evt", "st-1", NotificationType::ConsentRequest)
            .await
            .unwrap();
        let closed = dispatcher
            .enqueue("evt", "st-1", NotificationType::ClassClosed)
            .await
            .unwrap();
        let count = dispatcher
            .acknowledge_open("evt", "st-1", &[NotificationType::ConsentRequest])
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            dispatcher.load(request).await.unwrap().status,
            DeliveryStatus::Acknowledged
        );
        assert_eq!(
            dispatcher.load(closed).await.unwrap().status,
            DeliveryStatus::Queued
        );
    }
}
