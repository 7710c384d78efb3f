//! Student directory collaborator: class enrollment and guardian contacts.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianContact {
    pub guardian_id: String,
    pub name: String,
    /// E-mail address or phone number.
    pub contact: String,
}

#[async_trait]
pub trait StudentDirectory: Send + Sync {
    /// Student ids enrolled in `class_id` as of `as_of`, in roster order.
    async fn enrollment(&self, class_id: &str, as_of: DateTime<Utc>) -> Result<Vec<String>>;

    /// Primary guardian of the student, if the directory knows one.
    async fn guardian_contact(&self, student_id: &str) -> Result<Option<GuardianContact>>;
}

#[derive(Debug, Deserialize)]
struct EnrollmentResp {
    students: Vec<String>,
}

/// Directory reached over HTTP:
/// `GET {base}/classes/{class_id}/enrollment?as_of=...` and
/// `GET {base}/students/{student_id}/guardian`.
#[derive(Clone)]
pub struct HttpDirectory {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for HttpDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDirectory")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid directory base URL")?;
        let http = Client::builder()
            .user_agent("campaign-consent/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build directory HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub fn enrollment_url(&self, class_id: &str, as_of: DateTime<Utc>) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("classes/{}/enrollment", class_id))
            .context("invalid enrollment URL")?;
        url.query_pairs_mut()
            .append_pair("as_of", &as_of.to_rfc3339());
        Ok(url)
    }

    pub fn guardian_url(&self, student_id: &str) -> Result<Url> {
        self.base_url
            .join(&format!("students/{}/guardian", student_id))
            .context("invalid guardian URL")
    }
}

#[async_trait]
impl StudentDirectory for HttpDirectory {
    async fn enrollment(&self, class_id: &str, as_of: DateTime<Utc>) -> Result<Vec<String>> {
        let url = self.enrollment_url(class_id, as_of)?;
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!(
                "directory returned {} for class {}",
                status,
                class_id
            ));
        }
        let body: EnrollmentResp = resp.json().await.context("bad enrollment payload")?;
        Ok(body.students)
    }

    async fn guardian_contact(&self, student_id: &str) -> Result<Option<GuardianContact>> {
        let url = self.guardian_url(student_id)?;
        let resp = self.http.get(url).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(
                resp.json().await.context("bad guardian payload")?,
            )),
            s => Err(anyhow!("directory returned {} for student {}", s, student_id)),
        }
    }
}
