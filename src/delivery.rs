//! Notification delivery collaborator.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::model::{NotificationType, TaskId};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9][0-9 \-]{6,18}[0-9]$").expect("valid phone regex"));

/// Whether `contact` looks like an address we can deliver to.
pub fn is_valid_contact(contact: &str) -> bool {
    let contact = contact.trim();
    EMAIL_RE.is_match(contact) || PHONE_RE.is_match(contact)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Worth retrying later.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Retrying cannot help (invalid contact, rejected recipient).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Permanent(_))
    }
}

/// Rendered notification handed to the delivery collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub task_id: TaskId,
    pub kind: NotificationType,
    pub event_id: String,
    pub student_id: String,
    pub guardian_id: String,
    pub guardian_name: String,
    pub contact: String,
    pub summary: String,
    pub consent_deadline: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationDelivery: Send + Sync {
    async fn deliver(&self, payload: &NotificationPayload) -> Result<(), DeliveryError>;
}

/// Posts payloads as JSON to a webhook.
#[derive(Clone)]
pub struct WebhookDelivery {
    http: Client,
    url: Url,
}

impl fmt::Debug for WebhookDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookDelivery")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl WebhookDelivery {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let url = Url::parse(url)?;
        let http = Client::builder()
            .user_agent("campaign-consent/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self { http, url })
    }

    pub fn build_request(&self, payload: &NotificationPayload) -> reqwest::Result<reqwest::Request> {
        self.http
            .post(self.url.clone())
            .header("Idempotency-Key", format!("task-{}", payload.task_id))
            .json(payload)
            .build()
    }
}

/// Maps a webhook response status onto the retry policy.
pub fn classify_status(status: StatusCode) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::NOT_FOUND
        | StatusCode::GONE
        | StatusCode::UNPROCESSABLE_ENTITY => {
            Err(DeliveryError::Permanent(format!("recipient rejected: {}", status)))
        }
        _ => Err(DeliveryError::Transient(format!("webhook returned {}", status))),
    }
}

#[async_trait]
impl NotificationDelivery for WebhookDelivery {
    async fn deliver(&self, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        if !is_valid_contact(&payload.contact) {
            return Err(DeliveryError::Permanent(format!(
                "invalid contact for guardian {}",
                payload.guardian_id
            )));
        }
        let request = self
            .build_request(payload)
            .map_err(|e| DeliveryError::Permanent(e.to_string()))?;
        let resp = self
            .http
            .execute(request)
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;
        classify_status(resp.status())
    }
}
