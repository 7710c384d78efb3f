use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CampaignKind {
    Vaccine,
    HealthCheck,
}

impl CampaignKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignKind::Vaccine => "VACCINE",
            CampaignKind::HealthCheck => "HEALTH_CHECK",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "VACCINE" => Some(CampaignKind::Vaccine),
            "HEALTH_CHECK" => Some(CampaignKind::HealthCheck),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CampaignKind::Vaccine => "vaccination",
            CampaignKind::HealthCheck => "periodic health check",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventStatus {
    Draft,
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Draft => "DRAFT",
            EventStatus::Scheduled => "SCHEDULED",
            EventStatus::InProgress => "IN_PROGRESS",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DRAFT" => Some(EventStatus::Draft),
            "SCHEDULED" => Some(EventStatus::Scheduled),
            "IN_PROGRESS" => Some(EventStatus::InProgress),
            "COMPLETED" => Some(EventStatus::Completed),
            "CANCELLED" => Some(EventStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether readiness is still tracked for events in this status.
    pub fn is_active(&self) -> bool {
        matches!(self, EventStatus::Scheduled | EventStatus::InProgress)
    }

    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Draft, Cancelled)
                | (Scheduled, InProgress)
                | (Scheduled, Cancelled)
                | (InProgress, Completed)
        )
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConsentStatus {
    Pending,
    Agree,
    Disagree,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStatus::Pending => "PENDING",
            ConsentStatus::Agree => "AGREE",
            ConsentStatus::Disagree => "DISAGREE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(ConsentStatus::Pending),
            "AGREE" => Some(ConsentStatus::Agree),
            "DISAGREE" => Some(ConsentStatus::Disagree),
            _ => None,
        }
    }

    pub fn is_decided(&self) -> bool {
        !matches!(self, ConsentStatus::Pending)
    }
}

/// A guardian's answer. Pending is never a valid target of a decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Decision {
    Agree,
    Disagree,
}

impl From<Decision> for ConsentStatus {
    fn from(value: Decision) -> Self {
        match value {
            Decision::Agree => ConsentStatus::Agree,
            Decision::Disagree => ConsentStatus::Disagree,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Failed,
    Acknowledged,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "QUEUED",
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Acknowledged => "ACKNOWLEDGED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "QUEUED" => Some(DeliveryStatus::Queued),
            "SENT" => Some(DeliveryStatus::Sent),
            "FAILED" => Some(DeliveryStatus::Failed),
            "ACKNOWLEDGED" => Some(DeliveryStatus::Acknowledged),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Failed | DeliveryStatus::Acknowledged)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NotificationType {
    ConsentRequest,
    Reminder,
    DecisionReceipt,
    ClassClosed,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::ConsentRequest => "consent_request",
            NotificationType::Reminder => "reminder",
            NotificationType::DecisionReceipt => "decision_receipt",
            NotificationType::ClassClosed => "class_closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "consent_request" => Some(NotificationType::ConsentRequest),
            "reminder" => Some(NotificationType::Reminder),
            "decision_receipt" => Some(NotificationType::DecisionReceipt),
            "class_closed" => Some(NotificationType::ClassClosed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Readiness {
    Ready,
    PartiallyReady,
    Blocked,
    Closed,
}

impl Readiness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Readiness::Ready => "READY",
            Readiness::PartiallyReady => "PARTIALLY_READY",
            Readiness::Blocked => "BLOCKED",
            Readiness::Closed => "CLOSED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "READY" => Some(Readiness::Ready),
            "PARTIALLY_READY" => Some(Readiness::PartiallyReady),
            "BLOCKED" => Some(Readiness::Blocked),
            "CLOSED" => Some(Readiness::Closed),
            _ => None,
        }
    }

    /// Blocked is the only verdict that can still change on its own.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Readiness::Blocked)
    }

    pub fn can_run(&self) -> bool {
        matches!(self, Readiness::Ready | Readiness::PartiallyReady)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignEvent {
    pub id: String,
    pub kind: CampaignKind,
    pub title: String,
    pub target_classes: Vec<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub cutoff_at: DateTime<Utc>,
    /// Overrides the configured consent threshold for this event.
    pub consent_threshold: Option<f64>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignEvent {
    pub fn cutoff_passed(&self, now: DateTime<Utc>) -> bool {
        now >= self.cutoff_at
    }
}

/// Input for creating a Draft event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaignEvent {
    pub kind: CampaignKind,
    pub title: String,
    pub target_classes: Vec<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub cutoff_at: DateTime<Utc>,
    pub consent_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassRoster {
    pub event_id: String,
    pub class_id: String,
    pub students: Vec<String>,
    pub snapshot_at: DateTime<Utc>,
}

impl ClassRoster {
    pub fn contains(&self, student_id: &str) -> bool {
        self.students.iter().any(|s| s == student_id)
    }

    pub fn same_students(&self, other: &ClassRoster) -> bool {
        let mut a: Vec<&String> = self.students.iter().collect();
        let mut b: Vec<&String> = other.students.iter().collect();
        a.sort();
        b.sort();
        a == b
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsentRecord {
    pub event_id: String,
    pub student_id: String,
    pub status: ConsentStatus,
    pub acting_guardian_id: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub revision: i64,
}

impl ConsentRecord {
    /// The logical record for a key that has never been written.
    pub fn pending(event_id: &str, student_id: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            student_id: student_id.to_string(),
            status: ConsentStatus::Pending,
            acting_guardian_id: None,
            decided_at: None,
            revision: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsentTransition {
    pub from: ConsentStatus,
    pub to: ConsentStatus,
    pub guardian_id: String,
    pub revision: i64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationTask {
    pub id: TaskId,
    pub event_id: String,
    pub student_id: String,
    pub kind: NotificationType,
    pub status: DeliveryStatus,
    pub attempt: i32,
    pub last_error: Option<String>,
    pub due_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassReadiness {
    pub event_id: String,
    pub class_id: String,
    pub agree: u32,
    pub disagree: u32,
    pub pending: u32,
    pub verdict: Readiness,
    pub roster_snapshot_at: DateTime<Utc>,
}

impl ClassReadiness {
    pub fn enrolled(&self) -> u32 {
        self.agree + self.disagree + self.pending
    }

    pub fn decided(&self) -> u32 {
        self.agree + self.disagree
    }
}

/// Emitted for every class that closed without enough consent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RescheduleDirective {
    pub event_id: String,
    pub class_id: String,
    pub decided: u32,
    pub enrolled: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feedback {
    pub id: i64,
    pub student_id: String,
    pub event_id: Option<String>,
    pub guardian_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryAlert {
    pub id: i64,
    pub event_id: String,
    pub student_id: String,
    pub task_id: TaskId,
    pub kind: NotificationType,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}
