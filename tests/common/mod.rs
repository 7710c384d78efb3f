#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;

use campaign_consent::clock::ManualClock;
use campaign_consent::db::{self, Pool};
use campaign_consent::delivery::{DeliveryError, NotificationDelivery, NotificationPayload};
use campaign_consent::directory::{GuardianContact, StudentDirectory};
use campaign_consent::model::{CampaignEvent, CampaignKind, Decision, NewCampaignEvent};
use campaign_consent::outbox::DispatchSignal;
use campaign_consent::{CampaignEngine, EngineSettings};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap()
}

pub fn students(class_id: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}-s{}", class_id, i)).collect()
}

#[derive(Clone, Default)]
pub struct FakeDirectory {
    classes: Arc<Mutex<HashMap<String, Vec<String>>>>,
    unavailable: Arc<Mutex<HashSet<String>>>,
    orphans: Arc<Mutex<HashSet<String>>>,
    enrollment_calls: Arc<Mutex<Vec<String>>>,
}

impl FakeDirectory {
    pub async fn set_class(&self, class_id: &str, students: Vec<String>) {
        self.classes.lock().await.insert(class_id.to_string(), students);
    }

    pub async fn fail_class(&self, class_id: &str) {
        self.unavailable.lock().await.insert(class_id.to_string());
    }

    pub async fn heal_class(&self, class_id: &str) {
        self.unavailable.lock().await.remove(class_id);
    }

    pub async fn without_guardian(&self, student_id: &str) {
        self.orphans.lock().await.insert(student_id.to_string());
    }

    pub async fn enrollment_calls(&self) -> Vec<String> {
        self.enrollment_calls.lock().await.clone()
    }
}

#[async_trait]
impl StudentDirectory for FakeDirectory {
    async fn enrollment(&self, class_id: &str, _as_of: DateTime<Utc>) -> Result<Vec<String>> {
        self.enrollment_calls.lock().await.push(class_id.to_string());
        if self.unavailable.lock().await.contains(class_id) {
            return Err(anyhow!("directory unavailable for {}", class_id));
        }
        Ok(self
            .classes
            .lock()
            .await
            .get(class_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn guardian_contact(&self, student_id: &str) -> Result<Option<GuardianContact>> {
        if self.orphans.lock().await.contains(student_id) {
            return Ok(None);
        }
        Ok(Some(GuardianContact {
            guardian_id: format!("g-{}", student_id),
            name: format!("Guardian of {}", student_id),
            contact: format!("{}@parents.example.org", student_id),
        }))
    }
}

#[derive(Clone, Default)]
pub struct RecordingDelivery {
    responses: Arc<Mutex<VecDeque<Result<(), DeliveryError>>>>,
    calls: Arc<Mutex<Vec<NotificationPayload>>>,
}

impl RecordingDelivery {
    pub fn with_responses(responses: Vec<Result<(), DeliveryError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<NotificationPayload> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl NotificationDelivery for RecordingDelivery {
    async fn deliver(&self, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        self.calls.lock().await.push(payload.clone());
        self.responses.lock().await.pop_front().unwrap_or(Ok(()))
    }
}

pub struct Harness {
    pub pool: Pool,
    pub clock: Arc<ManualClock>,
    pub directory: FakeDirectory,
    pub engine: CampaignEngine,
    pub signals: UnboundedReceiver<DispatchSignal>,
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        directory_timeout: Duration::from_millis(500),
        directory_attempts: 2,
        directory_retry_base: Duration::from_millis(1),
        delivery_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

pub async fn harness() -> Harness {
    let pool = db::init_memory_pool().await.unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let directory = FakeDirectory::default();
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = CampaignEngine::new(
        pool.clone(),
        clock.clone(),
        Arc::new(directory.clone()),
        settings(),
        Some(tx),
    );
    Harness {
        pool,
        clock,
        directory,
        engine,
        signals: rx,
    }
}

/// Consent closes two days after `t0`, the session runs on day three.
pub fn new_event(classes: &[&str]) -> NewCampaignEvent {
    NewCampaignEvent {
        kind: CampaignKind::Vaccine,
        title: "Flu vaccination".into(),
        target_classes: classes.iter().map(|c| c.to_string()).collect(),
        window_start: t0() + ChronoDuration::days(3),
        window_end: t0() + ChronoDuration::days(3) + ChronoDuration::hours(6),
        cutoff_at: t0() + ChronoDuration::days(2),
        consent_threshold: None,
    }
}

impl Harness {
    pub fn cutoff(&self) -> DateTime<Utc> {
        t0() + ChronoDuration::days(2)
    }

    /// Creates and schedules an event whose classes hold `n` students each.
    pub async fn scheduled(&self, classes: &[(&str, usize)]) -> CampaignEvent {
        self.scheduled_with(classes, None).await
    }

    pub async fn scheduled_with(
        &self,
        classes: &[(&str, usize)],
        threshold: Option<f64>,
    ) -> CampaignEvent {
        for (class_id, n) in classes {
            self.directory.set_class(class_id, students(class_id, *n)).await;
        }
        let ids: Vec<&str> = classes.iter().map(|(c, _)| *c).collect();
        let mut new = new_event(&ids);
        new.consent_threshold = threshold;
        let event = self.engine.orchestrator.create_event(new).await.unwrap();
        self.engine.orchestrator.schedule(&event.id).await.unwrap()
    }

    /// First `n` students of the class agree, alternating with a disagreement
    /// every third student.
    pub async fn decide(&self, event_id: &str, class_id: &str, n: usize) {
        for (i, student) in students(class_id, n).iter().enumerate() {
            let decision = if i % 3 == 2 {
                Decision::Disagree
            } else {
                Decision::Agree
            };
            self.engine
                .submit_decision(event_id, student, decision, &format!("g-{}", student), 0)
                .await
                .unwrap();
        }
    }
}
