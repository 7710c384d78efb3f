//! Per-class readiness from consent coverage and the cutoff.
//!
//! Verdicts are always recomputed from the ledger and the current roster. The
//! `class_readiness` table is a cache for reporting and is never read back to
//! make a decision.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::db::{self, Pool};
use crate::error::{EngineError, EngineResult};
use crate::model::{
    CampaignEvent, ClassReadiness, ClassRoster, ConsentStatus, Readiness, RescheduleDirective,
};

pub const DEFAULT_CONSENT_THRESHOLD: f64 = 0.8;

/// Slack for comparing a coverage ratio against a decimal threshold.
const RATIO_EPSILON: f64 = 1e-9;

/// Whether `decided` out of `enrolled` meets `threshold`. The ratio is compared
/// instead of `threshold * enrolled`, which can round above a whole count.
fn meets_threshold(decided: u32, enrolled: u32, threshold: f64) -> bool {
    if enrolled == 0 {
        return true;
    }
    decided as f64 / enrolled as f64 >= threshold - RATIO_EPSILON
}

/// Readiness of one class.
///
/// Before the cutoff anything short of full coverage is Blocked (there is still
/// time). After the cutoff the threshold is a hard line between
/// PartiallyReady and Closed.
pub fn assess(
    roster: &ClassRoster,
    statuses: &HashMap<String, ConsentStatus>,
    threshold: f64,
    cutoff_passed: bool,
) -> ClassReadiness {
    let (mut agree, mut disagree, mut pending) = (0_u32, 0_u32, 0_u32);
    for student in &roster.students {
        match statuses.get(student).copied().unwrap_or(ConsentStatus::Pending) {
            ConsentStatus::Agree => agree += 1,
            ConsentStatus::Disagree => disagree += 1,
            ConsentStatus::Pending => pending += 1,
        }
    }
    let enrolled = agree + disagree + pending;
    let decided = agree + disagree;

    let verdict = if pending == 0 {
        Readiness::Ready
    } else if !cutoff_passed {
        Readiness::Blocked
    } else if meets_threshold(decided, enrolled, threshold) {
        Readiness::PartiallyReady
    } else {
        Readiness::Closed
    };

    ClassReadiness {
        event_id: roster.event_id.clone(),
        class_id: roster.class_id.clone(),
        agree,
        disagree,
        pending,
        verdict,
        roster_snapshot_at: roster.snapshot_at,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventEvaluation {
    pub classes: Vec<ClassReadiness>,
    pub directives: Vec<RescheduleDirective>,
    /// Students with a stored record who are on no current roster.
    pub inconsistent: Vec<String>,
}

impl EventEvaluation {
    pub fn blocked(&self) -> Vec<String> {
        self.classes
            .iter()
            .filter(|c| c.verdict == Readiness::Blocked)
            .map(|c| c.class_id.clone())
            .collect()
    }

    pub fn any_runnable(&self) -> bool {
        self.classes.iter().any(|c| c.verdict.can_run())
    }
}

#[derive(Clone)]
pub struct SchedulingCoordinator {
    pool: Pool,
    clock: Arc<dyn Clock>,
    default_threshold: f64,
}

impl SchedulingCoordinator {
    pub fn new(pool: Pool, clock: Arc<dyn Clock>, default_threshold: f64) -> Self {
        Self {
            pool,
            clock,
            default_threshold,
        }
    }

    fn threshold_for(&self, event: &CampaignEvent) -> f64 {
        event.consent_threshold.unwrap_or(self.default_threshold)
    }

    async fn load_event(&self, event_id: &str) -> EngineResult<CampaignEvent> {
        db::fetch_event(&self.pool, event_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("event {}", event_id)))
    }

    async fn statuses(&self, event_id: &str) -> EngineResult<HashMap<String, ConsentStatus>> {
        Ok(db::list_consents(&self.pool, event_id)
            .await?
            .into_iter()
            .map(|r| (r.student_id, r.status))
            .collect())
    }

    /// Pure read: no lock, no write.
    #[instrument(skip(self))]
    pub async fn evaluate_class(&self, event_id: &str, class_id: &str) -> EngineResult<ClassReadiness> {
        let event = self.load_event(event_id).await?;
        let roster = db::latest_roster(&self.pool, event_id, class_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("roster for class {} of event {}", class_id, event_id))
            })?;
        let statuses = self.statuses(event_id).await?;
        let readiness = assess(
            &roster,
            &statuses,
            self.threshold_for(&event),
            event.cutoff_passed(self.clock.now()),
        );
        debug!(event_id, class_id, verdict = readiness.verdict.as_str(), "class evaluated");
        Ok(readiness)
    }

    /// Evaluates every target class of the event and reports records that no
    /// longer belong to any roster.
    #[instrument(skip(self))]
    pub async fn evaluate_event(&self, event_id: &str) -> EngineResult<EventEvaluation> {
        let event = self.load_event(event_id).await?;
        let rosters: HashMap<String, ClassRoster> = db::latest_rosters(&self.pool, event_id)
            .await?
            .into_iter()
            .map(|r| (r.class_id.clone(), r))
            .collect();
        let statuses = self.statuses(event_id).await?;
        let threshold = self.threshold_for(&event);
        let cutoff_passed = event.cutoff_passed(self.clock.now());

        let mut classes = Vec::with_capacity(event.target_classes.len());
        for class_id in &event.target_classes {
            let roster = rosters.get(class_id).ok_or_else(|| {
                EngineError::NotFound(format!("roster for class {} of event {}", class_id, event_id))
            })?;
            classes.push(assess(roster, &statuses, threshold, cutoff_passed));
        }

        let enrolled: HashSet<&str> = rosters
            .values()
            .flat_map(|r| r.students.iter().map(String::as_str))
            .collect();
        let mut inconsistent: Vec<String> = statuses
            .keys()
            .filter(|s| !enrolled.contains(s.as_str()))
            .cloned()
            .collect();
        inconsistent.sort();
        for student_id in &inconsistent {
            warn!(
                event_id,
                student_id = %student_id,
                kind = "roster_inconsistency",
                "consent record has no current roster; excluded from readiness"
            );
        }

        let directives = classes
            .iter()
            .filter(|c| c.verdict == Readiness::Closed)
            .map(|c| RescheduleDirective {
                event_id: c.event_id.clone(),
                class_id: c.class_id.clone(),
                decided: c.decided(),
                enrolled: c.enrolled(),
            })
            .collect();

        Ok(EventEvaluation {
            classes,
            directives,
            inconsistent,
        })
    }

    /// Idempotent cache write.
    pub async fn persist(&self, readiness: &[ClassReadiness]) -> EngineResult<()> {
        let now = self.clock.now();
        for r in readiness {
            db::upsert_readiness(&self.pool, r, now).await?;
        }
        Ok(())
    }

    /// Writes the verdicts only if they differ from the cached ones. Returns
    /// whether anything was written.
    pub async fn persist_if_changed(
        &self,
        event_id: &str,
        readiness: &[ClassReadiness],
    ) -> EngineResult<bool> {
        let mut fresh = readiness.to_vec();
        fresh.sort_by(|a, b| a.class_id.cmp(&b.class_id));
        if self.cached(event_id).await? == fresh {
            debug!(event_id, "readiness unchanged");
            return Ok(false);
        }
        self.persist(&fresh).await?;
        Ok(true)
    }

    /// Re-evaluates the class of `student_id` after a decision. Returns None when
    /// the event is no longer tracked or the student is on no roster.
    #[instrument(skip(self))]
    pub async fn refresh_for_student(
        &self,
        event_id: &str,
        student_id: &str,
    ) -> EngineResult<Option<ClassReadiness>> {
        let event = self.load_event(event_id).await?;
        if !event.status.is_active() {
            return Ok(None);
        }
        let rosters = db::latest_rosters(&self.pool, event_id).await?;
        let Some(roster) = rosters.iter().find(|r| r.contains(student_id)) else {
            return Ok(None);
        };
        let statuses = self.statuses(event_id).await?;
        let readiness = assess(
            roster,
            &statuses,
            self.threshold_for(&event),
            event.cutoff_passed(self.clock.now()),
        );
        self.persist(std::slice::from_ref(&readiness)).await?;
        Ok(Some(readiness))
    }

    /// Last persisted verdicts, for reporting only.
    pub async fn cached(&self, event_id: &str) -> EngineResult<Vec<ClassReadiness>> {
        Ok(db::list_readiness(&self.pool, event_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn roster(n: usize) -> ClassRoster {
        ClassRoster {
            event_id: "evt".into(),
            class_id: "5A".into(),
            students: (0..n).map(|i| format!("s{}", i)).collect(),
            snapshot_at: Utc::now(),
        }
    }

    fn decided(n: usize) -> HashMap<String, ConsentStatus> {
        (0..n)
            .map(|i| {
                let status = if i % 3 == 0 {
                    ConsentStatus::Disagree
                } else {
                    ConsentStatus::Agree
                };
                (format!("s{}", i), status)
            })
            .collect()
    }

    #[test]
    fn nine_of_ten_after_cutoff_is_partially_ready() {
        let r = assess(&roster(10), &decided(9), 0.8, true);
        assert_eq!(r.verdict, Readiness::PartiallyReady);
        assert_eq!(r.pending, 1);
        assert_eq!(r.decided(), 9);
    }

    #[test]
    fn seven_of_ten_after_cutoff_is_closed() {
        let r = assess(&roster(10), &decided(7), 0.8, true);
        assert_eq!(r.verdict, Readiness::Closed);
    }

    #[test]
    fn exactly_at_threshold_is_partially_ready() {
        let r = assess(&roster(10), &decided(8), 0.8, true);
        assert_eq!(r.verdict, Readiness::PartiallyReady);
    }

    #[test]
    fn threshold_boundary_is_not_lost_to_rounding() {
        // 0.14 * 100.0 rounds to 14.000000000000002.
        let r = assess(&roster(100), &decided(14), 0.14, true);
        assert_eq!(r.verdict, Readiness::PartiallyReady);
        let r = assess(&roster(100), &decided(13), 0.14, true);
        assert_eq!(r.verdict, Readiness::Closed);

        for (n, threshold) in [(100, 0.07), (100, 0.28), (100, 0.57), (50, 0.14)] {
            let needed = (threshold * 100.0_f64).round() as usize * n / 100;
            assert!(meets_threshold(needed as u32, n as u32, threshold), "{n} {threshold}");
            assert!(!meets_threshold(needed as u32 - 1, n as u32, threshold), "{n} {threshold}");
        }
    }

    #[test]
    fn incomplete_before_cutoff_is_blocked() {
        assert_eq!(assess(&roster(10), &decided(7), 0.8, false).verdict, Readiness::Blocked);
        assert_eq!(assess(&roster(10), &decided(9), 0.8, false).verdict, Readiness::Blocked);
    }

    #[test]
    fn full_coverage_is_ready_either_side_of_cutoff() {
        assert_eq!(assess(&roster(10), &decided(10), 0.8, false).verdict, Readiness::Ready);
        assert_eq!(assess(&roster(10), &decided(10), 0.8, true).verdict, Readiness::Ready);
    }

    #[test]
    fn records_outside_roster_are_ignored() {
        let mut statuses = decided(2);
        statuses.insert("transferred".into(), ConsentStatus::Agree);
        let r = assess(&roster(2), &statuses, 0.8, false);
        assert_eq!(r.enrolled(), 2);
        assert_eq!(r.verdict, Readiness::Ready);
    }
}
