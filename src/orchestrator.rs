//! Campaign event lifecycle: Draft → Scheduled → InProgress → Completed, with
//! Cancelled reachable from Draft or Scheduled.
//!
//! The orchestrator is the only writer of event status. Each transition runs
//! inside a per-event exclusive scope that covers the decision and the write
//! only; directory lookups and notification enqueues happen outside it.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::cohort::{CohortResolver, ResolvedClass};
use crate::db::{self, Pool};
use crate::error::{EngineError, EngineResult};
use crate::model::{
    CampaignEvent, ConsentStatus, DeliveryAlert, EventStatus, NewCampaignEvent, NotificationType,
    Readiness,
};
use crate::outbox::{DispatchSignal, NotificationDispatcher};
use crate::scheduling::{EventEvaluation, SchedulingCoordinator};

/// One async mutex per event id.
#[derive(Default)]
pub struct EventLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EventLocks {
    pub async fn acquire(&self, event_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(event_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTrigger {
    CutoffExpired,
    /// Administrator forces the cutoff to now.
    AdminOverride,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(EventEvaluation),
    /// Cutoff passed but every class closed; the event waits in Scheduled for
    /// an administrator.
    AllClosed(EventEvaluation),
    /// Cutoff not reached yet.
    NotDue,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub started: Vec<String>,
    pub evaluated: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventReport {
    pub event: CampaignEvent,
    pub evaluation: Option<EventEvaluation>,
    pub alerts: Vec<DeliveryAlert>,
}

pub struct CampaignOrchestrator {
    pool: Pool,
    clock: Arc<dyn Clock>,
    resolver: Arc<CohortResolver>,
    dispatcher: Arc<NotificationDispatcher>,
    coordinator: Arc<SchedulingCoordinator>,
    locks: EventLocks,
}

impl CampaignOrchestrator {
    pub fn new(
        pool: Pool,
        clock: Arc<dyn Clock>,
        resolver: Arc<CohortResolver>,
        dispatcher: Arc<NotificationDispatcher>,
        coordinator: Arc<SchedulingCoordinator>,
    ) -> Self {
        Self {
            pool,
            clock,
            resolver,
            dispatcher,
            coordinator,
            locks: EventLocks::default(),
        }
    }

    pub async fn event(&self, event_id: &str) -> EngineResult<CampaignEvent> {
        db::fetch_event(&self.pool, event_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("event {}", event_id)))
    }

    /// Status compare-and-set; caller holds the event lock.
    async fn write_status(
        &self,
        event_id: &str,
        from: EventStatus,
        to: EventStatus,
    ) -> EngineResult<()> {
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                event_id: event_id.to_string(),
                from,
                to,
            });
        }
        if db::transition_event_status(&self.pool, event_id, from, to, self.clock.now()).await? {
            info!(event_id, from = from.as_str(), to = to.as_str(), "event status changed");
            return Ok(());
        }
        let current = self.event(event_id).await?;
        Err(EngineError::InvalidTransition {
            event_id: event_id.to_string(),
            from: current.status,
            to,
        })
    }

    #[instrument(skip_all, fields(title = %new.title))]
    pub async fn create_event(&self, new: NewCampaignEvent) -> EngineResult<CampaignEvent> {
        if new.title.trim().is_empty() {
            return Err(EngineError::Invalid("title must be non-empty".into()));
        }
        if new.target_classes.is_empty() {
            return Err(EngineError::Invalid("at least one target class is required".into()));
        }
        let unique: HashSet<&String> = new.target_classes.iter().collect();
        if unique.len() != new.target_classes.len() {
            return Err(EngineError::Invalid("target classes must be unique".into()));
        }
        if new.window_start >= new.window_end {
            return Err(EngineError::Invalid("window start must precede window end".into()));
        }
        if new.cutoff_at > new.window_start {
            return Err(EngineError::Invalid("consent cutoff must not be after window start".into()));
        }
        if let Some(t) = new.consent_threshold {
            if !(t > 0.0 && t <= 1.0) {
                return Err(EngineError::Invalid("consent threshold must be in (0, 1]".into()));
            }
        }

        let now = self.clock.now();
        let event = CampaignEvent {
            id: Uuid::new_v4().to_string(),
            kind: new.kind,
            title: new.title.trim().to_string(),
            target_classes: new.target_classes,
            window_start: new.window_start,
            window_end: new.window_end,
            cutoff_at: new.cutoff_at,
            consent_threshold: new.consent_threshold,
            status: EventStatus::Draft,
            created_at: now,
            updated_at: now,
        };
        db::insert_event(&self.pool, &event).await?;
        info!(event_id = %event.id, "event created");
        Ok(event)
    }

    /// Draft → Scheduled: resolve rosters, queue the first consent request for
    /// every student, then flip the status. Any failure leaves the event in
    /// Draft and can be retried; enqueues are deduplicated.
    #[instrument(skip(self))]
    pub async fn schedule(&self, event_id: &str) -> EngineResult<CampaignEvent> {
        {
            let _guard = self.locks.acquire(event_id).await;
            let event = self.event(event_id).await?;
            if event.status != EventStatus::Draft {
                return Err(EngineError::InvalidTransition {
                    event_id: event_id.to_string(),
                    from: event.status,
                    to: EventStatus::Scheduled,
                });
            }
        }

        let resolved = self.resolver.resolve(event_id).await.map_err(|err| {
            warn!(event_id, ?err, "roster resolution failed; event stays in draft");
            err
        })?;
        let students = all_students(&resolved);
        self.dispatcher
            .enqueue_wave(event_id, &students, NotificationType::ConsentRequest)
            .await
            .map_err(|err| {
                warn!(event_id, ?err, "initial notification wave failed; event stays in draft");
                err
            })?;

        let _guard = self.locks.acquire(event_id).await;
        self.write_status(event_id, EventStatus::Draft, EventStatus::Scheduled)
            .await?;
        self.event(event_id).await
    }

    /// Re-resolves a Scheduled event and requests consent from every rostered
    /// student who has not decided and was never sent a request. This covers
    /// students who joined since the last snapshot as well as requests lost to
    /// an earlier failed attempt.
    #[instrument(skip(self))]
    pub async fn refresh_roster(&self, event_id: &str) -> EngineResult<Vec<ResolvedClass>> {
        let event = self.event(event_id).await?;
        if event.status != EventStatus::Scheduled {
            return Err(EngineError::EventNotOpen {
                event_id: event_id.to_string(),
                status: event.status,
            });
        }
        let resolved = self.resolver.resolve(event_id).await?;
        let decided = self.decided_students(event_id).await?;
        let requested =
            db::students_with_task(&self.pool, event_id, NotificationType::ConsentRequest).await?;
        let missing: Vec<String> = all_students(&resolved)
            .into_iter()
            .filter(|s| !decided.contains(s) && !requested.contains(s))
            .collect();
        if !missing.is_empty() {
            self.dispatcher
                .enqueue_wave(event_id, &missing, NotificationType::ConsentRequest)
                .await?;
        }
        Ok(resolved)
    }

    async fn decided_students(&self, event_id: &str) -> EngineResult<HashSet<String>> {
        Ok(db::list_consents(&self.pool, event_id)
            .await?
            .into_iter()
            .filter(|r| r.status != ConsentStatus::Pending)
            .map(|r| r.student_id)
            .collect())
    }

    /// Queues a reminder for every student of a Scheduled event whose consent
    /// is still pending.
    #[instrument(skip(self))]
    pub async fn send_reminders(&self, event_id: &str) -> EngineResult<usize> {
        let event = self.event(event_id).await?;
        if event.status != EventStatus::Scheduled || event.cutoff_passed(self.clock.now()) {
            return Err(EngineError::EventNotOpen {
                event_id: event_id.to_string(),
                status: event.status,
            });
        }
        let decided = self.decided_students(event_id).await?;
        let pending: Vec<String> = db::latest_rosters(&self.pool, event_id)
            .await?
            .into_iter()
            .flat_map(|r| r.students)
            .filter(|s| !decided.contains(s))
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        let ids = self
            .dispatcher
            .enqueue_wave(event_id, &pending, NotificationType::Reminder)
            .await?;
        Ok(ids.len())
    }

    /// Scheduled → InProgress. Every target class is evaluated and the
    /// verdicts persisted; the event moves only if some class can run.
    /// Guardians of closed classes are told once, whether or not the event
    /// started.
    #[instrument(skip(self))]
    pub async fn start(&self, event_id: &str, trigger: StartTrigger) -> EngineResult<StartOutcome> {
        let (outcome, closed) = {
            let _guard = self.locks.acquire(event_id).await;
            let event = self.event(event_id).await?;
            if event.status != EventStatus::Scheduled {
                return Err(EngineError::InvalidTransition {
                    event_id: event_id.to_string(),
                    from: event.status,
                    to: EventStatus::InProgress,
                });
            }
            let now = self.clock.now();
            if !event.cutoff_passed(now) {
                match trigger {
                    StartTrigger::CutoffExpired => return Ok(StartOutcome::NotDue),
                    StartTrigger::AdminOverride => {
                        db::override_cutoff(&self.pool, event_id, EventStatus::Scheduled, now, now)
                            .await?;
                        info!(event_id, "cutoff overridden by administrator");
                    }
                }
            }

            let evaluation = self.coordinator.evaluate_event(event_id).await?;
            let changed = self
                .coordinator
                .persist_if_changed(event_id, &evaluation.classes)
                .await?;
            if changed {
                for directive in &evaluation.directives {
                    warn!(
                        event_id,
                        class_id = %directive.class_id,
                        decided = directive.decided,
                        enrolled = directive.enrolled,
                        "class closed; needs rescheduling"
                    );
                }
            }
            let closed = closed_classes(&evaluation);
            if evaluation.any_runnable() {
                self.write_status(event_id, EventStatus::Scheduled, EventStatus::InProgress)
                    .await?;
                (StartOutcome::Started(evaluation), closed)
            } else {
                if changed {
                    warn!(event_id, "every class closed; event left scheduled");
                }
                (StartOutcome::AllClosed(evaluation), closed)
            }
        };

        self.notify_closed(event_id, &closed).await?;
        Ok(outcome)
    }

    /// Queues a ClassClosed notice for every student of the given classes who
    /// never had one. Safe to repeat; the periodic pass uses it to finish a
    /// wave that failed after the status change.
    async fn notify_closed(&self, event_id: &str, classes: &[String]) -> EngineResult<usize> {
        if classes.is_empty() {
            return Ok(0);
        }
        let notified =
            db::students_with_task(&self.pool, event_id, NotificationType::ClassClosed).await?;
        let mut seen = HashSet::new();
        let students: Vec<String> = db::latest_rosters(&self.pool, event_id)
            .await?
            .into_iter()
            .filter(|r| classes.contains(&r.class_id))
            .flat_map(|r| r.students)
            .filter(|s| !notified.contains(s) && seen.insert(s.clone()))
            .collect();
        if students.is_empty() {
            return Ok(0);
        }
        let ids = self
            .dispatcher
            .enqueue_wave(event_id, &students, NotificationType::ClassClosed)
            .await?;
        Ok(ids.len())
    }

    /// InProgress → Completed, confirming execution. Refused while any class is
    /// still Blocked.
    #[instrument(skip(self))]
    pub async fn complete(&self, event_id: &str) -> EngineResult<CampaignEvent> {
        let _guard = self.locks.acquire(event_id).await;
        let event = self.event(event_id).await?;
        if event.status != EventStatus::InProgress {
            return Err(EngineError::InvalidTransition {
                event_id: event_id.to_string(),
                from: event.status,
                to: EventStatus::Completed,
            });
        }
        let evaluation = self.coordinator.evaluate_event(event_id).await?;
        self.coordinator.persist(&evaluation.classes).await?;
        let blocked = evaluation.blocked();
        if !blocked.is_empty() {
            return Err(EngineError::ClassesBlocked {
                event_id: event_id.to_string(),
                classes: blocked,
            });
        }
        self.write_status(event_id, EventStatus::InProgress, EventStatus::Completed)
            .await?;
        self.event(event_id).await
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, event_id: &str) -> EngineResult<CampaignEvent> {
        let _guard = self.locks.acquire(event_id).await;
        let event = self.event(event_id).await?;
        self.write_status(event_id, event.status, EventStatus::Cancelled)
            .await?;
        self.event(event_id).await
    }

    /// Periodic pass over active events: starts those whose cutoff expired,
    /// refreshes cached readiness for the rest and re-queues any missing
    /// closed-class notices.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> EngineResult<TickReport> {
        let mut report = TickReport::default();
        let events =
            db::list_events_by_status(&self.pool, &[EventStatus::Scheduled, EventStatus::InProgress])
                .await?;
        let now = self.clock.now();
        for event in events {
            let res = if event.status == EventStatus::Scheduled && event.cutoff_passed(now) {
                self.start(&event.id, StartTrigger::CutoffExpired)
                    .await
                    .map(|outcome| {
                        if matches!(outcome, StartOutcome::Started(_)) {
                            report.started.push(event.id.clone());
                        }
                    })
            } else {
                self.refresh_event(&event.id).await.map(|refreshed| {
                    if refreshed {
                        report.evaluated.push(event.id.clone());
                    }
                })
            };
            if let Err(err) = res {
                error!(event_id = %event.id, ?err, "periodic evaluation failed");
                report.failed.push((event.id.clone(), err.to_string()));
            }
        }
        Ok(report)
    }

    async fn refresh_event(&self, event_id: &str) -> EngineResult<bool> {
        let Some(evaluation) = self.refresh_readiness(event_id).await? else {
            return Ok(false);
        };
        let queued = self
            .notify_closed(event_id, &closed_classes(&evaluation))
            .await?;
        if queued > 0 {
            info!(event_id, queued, "missing closed-class notices queued");
        }
        Ok(true)
    }

    /// Re-evaluates and caches verdicts if the event is still active. The
    /// status check and the write share the event lock so nothing is written
    /// after a cancellation.
    async fn refresh_readiness(&self, event_id: &str) -> EngineResult<Option<EventEvaluation>> {
        let _guard = self.locks.acquire(event_id).await;
        let event = self.event(event_id).await?;
        if !event.status.is_active() {
            return Ok(None);
        }
        let evaluation = self.coordinator.evaluate_event(event_id).await?;
        self.coordinator
            .persist_if_changed(event_id, &evaluation.classes)
            .await?;
        Ok(Some(evaluation))
    }

    /// Stores a `DeliveryExhausted` signal for administrators. Scheduling is
    /// unaffected.
    pub async fn record_signal(&self, signal: DispatchSignal) -> EngineResult<i64> {
        match signal {
            DispatchSignal::DeliveryExhausted { task, reason } => {
                let id = db::insert_alert(&self.pool, &task, &reason, self.clock.now()).await?;
                warn!(
                    task_id = task.id,
                    event_id = %task.event_id,
                    student_id = %task.student_id,
                    reason = %reason,
                    "delivery exhausted; alert recorded"
                );
                Ok(id)
            }
        }
    }

    pub async fn alerts(&self, event_id: Option<&str>) -> EngineResult<Vec<DeliveryAlert>> {
        Ok(db::list_alerts(&self.pool, event_id).await?)
    }

    /// Fresh readiness and outstanding alerts for an event.
    pub async fn report(&self, event_id: &str) -> EngineResult<EventReport> {
        let event = self.event(event_id).await?;
        let evaluation = match event.status {
            EventStatus::Draft => None,
            _ => Some(self.coordinator.evaluate_event(event_id).await?),
        };
        let alerts = db::list_alerts(&self.pool, Some(event_id)).await?;
        Ok(EventReport {
            event,
            evaluation,
            alerts,
        })
    }
}

fn all_students(resolved: &[ResolvedClass]) -> Vec<String> {
    let mut seen = HashSet::new();
    resolved
        .iter()
        .flat_map(|c| c.roster.students.iter())
        .filter(|s| seen.insert(s.to_string()))
        .cloned()
        .collect()
}

fn closed_classes(evaluation: &EventEvaluation) -> Vec<String> {
    evaluation
        .directives
        .iter()
        .map(|d| d.class_id.clone())
        .collect()
}

/// Number of classes per verdict, for log lines and reports.
pub fn verdict_counts(evaluation: &EventEvaluation) -> HashMap<Readiness, usize> {
    let mut counts = HashMap::new();
    for class in &evaluation.classes {
        *counts.entry(class.verdict).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test]
    async fn event_lock_serializes_same_event() {
        let locks = Arc::new(EventLocks::default());
        let guard = locks.acquire("evt-1").await;

        let other = locks.clone();
        let blocked = tokio::spawn(async move {
            let _g = other.acquire("evt-1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // A different event is not held up.
        let _g2 = tokio::time::timeout(Duration::from_millis(50), locks.acquire("evt-2"))
            .await
            .expect("independent event lock");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn all_students_dedups_across_classes() {
        let roster = |class: &str, students: &[&str]| ResolvedClass {
            roster: crate::model::ClassRoster {
                event_id: "e".into(),
                class_id: class.into(),
                students: students.iter().map(|s| s.to_string()).collect(),
                snapshot_at: Utc::now(),
            },
            change: crate::cohort::RosterChange::New,
        };
        let out = all_students(&[roster("1A", &["a", "b"]), roster("1B", &["b", "c"])]);
        assert_eq!(out, vec!["a", "b", "c"]);
    }
}
