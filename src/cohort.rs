//! Resolves the target classes of an event into roster snapshots.
use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::db::{self, Pool};
use crate::directory::StudentDirectory;
use crate::error::{EngineError, EngineResult};
use crate::model::ClassRoster;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterChange {
    /// First snapshot for the class.
    New,
    /// Same student set as the current snapshot; nothing was stored.
    Unchanged,
    Changed {
        added: Vec<String>,
        removed: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClass {
    pub roster: ClassRoster,
    pub change: RosterChange,
}

impl ResolvedClass {
    /// Students who need a first consent request after this resolution.
    pub fn newly_enrolled(&self) -> Vec<String> {
        match &self.change {
            RosterChange::New => self.roster.students.clone(),
            RosterChange::Unchanged => Vec::new(),
            RosterChange::Changed { added, .. } => added.clone(),
        }
    }
}

pub struct CohortResolver {
    pool: Pool,
    directory: Arc<dyn StudentDirectory>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    max_attempts: u32,
    retry_base: Duration,
}

impl CohortResolver {
    pub fn new(pool: Pool, directory: Arc<dyn StudentDirectory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            directory,
            clock,
            call_timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_base: Duration::from_millis(200),
        }
    }

    pub fn with_retry(mut self, call_timeout: Duration, max_attempts: u32, retry_base: Duration) -> Self {
        self.call_timeout = call_timeout;
        self.max_attempts = max_attempts.max(1);
        self.retry_base = retry_base;
        self
    }

    /// Current roster of every target class of the event.
    pub async fn resolve_roster(&self, event_id: &str) -> EngineResult<Vec<ClassRoster>> {
        Ok(self
            .resolve(event_id)
            .await?
            .into_iter()
            .map(|c| c.roster)
            .collect())
    }

    /// Queries the directory for every target class and stores the snapshots
    /// whose student set changed. Nothing is stored unless every class
    /// resolved.
    #[instrument(skip(self))]
    pub async fn resolve(&self, event_id: &str) -> EngineResult<Vec<ResolvedClass>> {
        let event = db::fetch_event(&self.pool, event_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("event {}", event_id)))?;
        let as_of = self.clock.now();

        let fetched = try_join_all(
            event
                .target_classes
                .iter()
                .map(|class_id| self.fetch_class(class_id, as_of)),
        )
        .await?;

        let mut previous: HashMap<String, ClassRoster> = db::latest_rosters(&self.pool, event_id)
            .await?
            .into_iter()
            .map(|r| (r.class_id.clone(), r))
            .collect();

        let mut resolved = Vec::with_capacity(fetched.len());
        for (class_id, students) in event.target_classes.iter().zip(fetched) {
            let roster = ClassRoster {
                event_id: event_id.to_string(),
                class_id: class_id.clone(),
                students,
                snapshot_at: as_of,
            };
            let change = match previous.remove(class_id) {
                None => RosterChange::New,
                Some(prev) if prev.same_students(&roster) => RosterChange::Unchanged,
                Some(prev) => RosterChange::Changed {
                    added: roster
                        .students
                        .iter()
                        .filter(|s| !prev.contains(s))
                        .cloned()
                        .collect(),
                    removed: prev
                        .students
                        .iter()
                        .filter(|s| !roster.contains(s))
                        .cloned()
                        .collect(),
                },
            };
            resolved.push(ResolvedClass { roster, change });
        }

        let to_store: Vec<ClassRoster> = resolved
            .iter()
            .filter(|c| c.change != RosterChange::Unchanged)
            .map(|c| c.roster.clone())
            .collect();
        if !to_store.is_empty() {
            db::insert_rosters(&self.pool, &to_store).await?;
        }
        info!(
            event_id,
            classes = resolved.len(),
            stored = to_store.len(),
            "roster resolved"
        );
        Ok(resolved)
    }

    async fn fetch_class(&self, class_id: &str, as_of: DateTime<Utc>) -> EngineResult<Vec<String>> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match tokio::time::timeout(
                self.call_timeout,
                self.directory.enrollment(class_id, as_of),
            )
            .await
            {
                Ok(Ok(students)) => return Ok(dedup_preserving_order(students)),
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => last_error = format!("timed out after {:?}", self.call_timeout),
            }
            warn!(class_id, attempt, error = %last_error, "directory lookup failed");
            if attempt < self.max_attempts {
                tokio::time::sleep(retry_delay(self.retry_base, attempt)).await;
            }
        }
        Err(EngineError::DirectoryUnavailable(format!(
            "class {}: {}",
            class_id, last_error
        )))
    }
}

/// Delay after the `attempt`-th failed call: base * 2^(attempt-1), saturating.
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
}

fn dedup_preserving_order(students: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    students
        .into_iter()
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
