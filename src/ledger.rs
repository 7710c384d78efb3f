//! Consent ledger: one current record per (event, student), guarded by a
//! revision counter.
//!
//! A key that was never written reads as Pending with revision 0. Nothing is
//! stored until a guardian actually decides, so roster changes never need a
//! bulk insert before consent can be recorded.
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::db::{self, ConditionalWrite, Pool};
use crate::error::{EngineError, EngineResult};
use crate::model::{
    CampaignEvent, ConsentRecord, ConsentStatus, ConsentTransition, Decision, EventStatus, Feedback,
};

/// A Disagree decision together with whatever the guardian wrote about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisagreementReview {
    pub record: ConsentRecord,
    pub feedback: Vec<Feedback>,
}

#[derive(Clone)]
pub struct ConsentLedger {
    pool: Pool,
    clock: Arc<dyn Clock>,
}

impl ConsentLedger {
    pub fn new(pool: Pool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    async fn load_event(&self, event_id: &str) -> EngineResult<CampaignEvent> {
        db::fetch_event(&self.pool, event_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("event {}", event_id)))
    }

    async fn ensure_enrolled(&self, event_id: &str, student_id: &str) -> EngineResult<()> {
        let rosters = db::latest_rosters(&self.pool, event_id).await?;
        if rosters.iter().any(|r| r.contains(student_id)) {
            Ok(())
        } else {
            Err(EngineError::NotEnrolled {
                event_id: event_id.to_string(),
                student_id: student_id.to_string(),
            })
        }
    }

    /// Current record for the pair. Students dropped from the roster keep
    /// their stored record; unknown students with no record are rejected.
    #[instrument(skip(self))]
    pub async fn record(&self, event_id: &str, student_id: &str) -> EngineResult<ConsentRecord> {
        if let Some(stored) = db::fetch_consent(&self.pool, event_id, student_id).await? {
            return Ok(stored);
        }
        self.ensure_enrolled(event_id, student_id).await?;
        Ok(ConsentRecord::pending(event_id, student_id))
    }

    /// Records a guardian decision if `expected_revision` still matches the
    /// stored revision and the consent window is open.
    #[instrument(skip(self))]
    pub async fn record_decision(
        &self,
        event_id: &str,
        student_id: &str,
        decision: Decision,
        guardian_id: &str,
        expected_revision: i64,
    ) -> EngineResult<ConsentRecord> {
        if guardian_id.trim().is_empty() {
            return Err(EngineError::Invalid("guardian id must be non-empty".into()));
        }
        let event = self.load_event(event_id).await?;
        if !matches!(event.status, EventStatus::Scheduled | EventStatus::InProgress) {
            return Err(EngineError::EventNotOpen {
                event_id: event_id.to_string(),
                status: event.status,
            });
        }
        let now = self.clock.now();
        if event.cutoff_passed(now) {
            warn!(event_id, student_id, cutoff = %event.cutoff_at, "decision after cutoff rejected");
            return Err(EngineError::WindowClosed(event_id.to_string()));
        }

        let current = self.record(event_id, student_id).await?;
        if current.revision != expected_revision {
            return Err(EngineError::Conflict {
                student_id: student_id.to_string(),
                expected: expected_revision,
                actual: current.revision,
            });
        }

        let next = ConsentRecord {
            event_id: event_id.to_string(),
            student_id: student_id.to_string(),
            status: ConsentStatus::from(decision),
            acting_guardian_id: Some(guardian_id.to_string()),
            decided_at: Some(now),
            revision: expected_revision + 1,
        };
        match db::write_consent(&self.pool, &next, current.status, expected_revision, now).await? {
            ConditionalWrite::Applied => {
                info!(
                    event_id,
                    student_id,
                    from = current.status.as_str(),
                    to = next.status.as_str(),
                    revision = next.revision,
                    "consent recorded"
                );
                Ok(next)
            }
            ConditionalWrite::Stale { actual } => {
                warn!(event_id, student_id, expected_revision, actual, "stale consent write");
                Err(EngineError::Conflict {
                    student_id: student_id.to_string(),
                    expected: expected_revision,
                    actual,
                })
            }
            // The cutoff was overridden or the event moved on after the check above.
            ConditionalWrite::WindowClosed => {
                warn!(event_id, student_id, "consent window closed before write");
                Err(EngineError::WindowClosed(event_id.to_string()))
            }
        }
    }

    pub async fn history(
        &self,
        event_id: &str,
        student_id: &str,
    ) -> EngineResult<Vec<ConsentTransition>> {
        Ok(db::consent_history(&self.pool, event_id, student_id).await?)
    }

    /// Every Disagree decision of the event with its feedback, for review by
    /// administrators.
    #[instrument(skip(self))]
    pub async fn disagreements(&self, event_id: &str) -> EngineResult<Vec<DisagreementReview>> {
        let mut out = Vec::new();
        for record in db::list_consents(&self.pool, event_id).await? {
            if record.status != ConsentStatus::Disagree {
                continue;
            }
            let feedback = db::feedback_for(&self.pool, &record.student_id, event_id).await?;
            out.push(DisagreementReview { record, feedback });
        }
        Ok(out)
    }
}
