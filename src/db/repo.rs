use super::model::ConditionalWrite;
use crate::error::StorageError;
use crate::model::{
    CampaignEvent, CampaignKind, ClassReadiness, ClassRoster, ConsentRecord, ConsentStatus,
    ConsentTransition, DeliveryAlert, DeliveryStatus, EventStatus, Feedback, NotificationTask,
    NotificationType, Readiness, TaskId,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;
type Result<T> = std::result::Result<T, StorageError>;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// Single-connection in-memory database with migrations applied.
pub async fn init_memory_pool() -> Result<Pool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn corrupt(what: &str, value: &str) -> StorageError {
    StorageError::Corrupt(format!("unknown {} '{}'", what, value))
}

// ---------------------------------------------------------------------------
// Campaign events
// ---------------------------------------------------------------------------

fn event_from_row(row: &SqliteRow) -> Result<CampaignEvent> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let targets: String = row.try_get("target_classes")?;
    Ok(CampaignEvent {
        id: row.try_get("id")?,
        kind: CampaignKind::parse(&kind).ok_or_else(|| corrupt("campaign kind", &kind))?,
        title: row.try_get("title")?,
        target_classes: serde_json::from_str(&targets)?,
        window_start: row.try_get("window_start")?,
        window_end: row.try_get("window_end")?,
        cutoff_at: row.try_get("cutoff_at")?,
        consent_threshold: row.try_get("consent_threshold")?,
        status: EventStatus::parse(&status).ok_or_else(|| corrupt("event status", &status))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[instrument(skip_all, fields(event_id = %event.id))]
pub async fn insert_event(pool: &Pool, event: &CampaignEvent) -> Result<()> {
    sqlx::query(
        "INSERT INTO campaign_events (id, kind, title, target_classes, window_start, window_end, cutoff_at, consent_threshold, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&event.id)
    .bind(event.kind.as_str())
    .bind(&event.title)
    .bind(serde_json::to_string(&event.target_classes)?)
    .bind(event.window_start)
    .bind(event.window_end)
    .bind(event.cutoff_at)
    .bind(event.consent_threshold)
    .bind(event.status.as_str())
    .bind(event.created_at)
    .bind(event.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_event(pool: &Pool, event_id: &str) -> Result<Option<CampaignEvent>> {
    let row = sqlx::query("SELECT * FROM campaign_events WHERE id = ?")
        .bind(event_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(event_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_events_by_status(
    pool: &Pool,
    statuses: &[EventStatus],
) -> Result<Vec<CampaignEvent>> {
    let rows = sqlx::query("SELECT * FROM campaign_events ORDER BY datetime(cutoff_at) ASC, id")
        .fetch_all(pool)
        .await?;
    let mut events = Vec::new();
    for row in &rows {
        let event = event_from_row(row)?;
        if statuses.contains(&event.status) {
            events.push(event);
        }
    }
    Ok(events)
}

/// Compare-and-set on the event status. Returns false when the stored status
/// is no longer `from`.
#[instrument(skip_all)]
pub async fn transition_event_status(
    pool: &Pool,
    event_id: &str,
    from: EventStatus,
    to: EventStatus,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE campaign_events SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(now)
    .bind(event_id)
    .bind(from.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Pulls the consent cutoff forward to `cutoff` while the event is still in
/// `expected` status.
#[instrument(skip_all)]
pub async fn override_cutoff(
    pool: &Pool,
    event_id: &str,
    expected: EventStatus,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE campaign_events SET cutoff_at = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(cutoff)
    .bind(now)
    .bind(event_id)
    .bind(expected.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Class rosters
// ---------------------------------------------------------------------------

fn roster_from_row(row: &SqliteRow) -> Result<ClassRoster> {
    let students: String = row.try_get("students")?;
    Ok(ClassRoster {
        event_id: row.try_get("event_id")?,
        class_id: row.try_get("class_id")?,
        students: serde_json::from_str(&students)?,
        snapshot_at: row.try_get("snapshot_at")?,
    })
}

/// Current snapshot of every class of the event.
#[instrument(skip_all)]
pub async fn latest_rosters(pool: &Pool, event_id: &str) -> Result<Vec<ClassRoster>> {
    let rows = sqlx::query(
        "SELECT r.event_id, r.class_id, r.students, r.snapshot_at FROM class_rosters r \
         WHERE r.event_id = ? AND r.id = ( \
             SELECT MAX(id) FROM class_rosters WHERE event_id = r.event_id AND class_id = r.class_id) \
         ORDER BY r.class_id",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(roster_from_row).collect()
}

#[instrument(skip_all)]
pub async fn latest_roster(
    pool: &Pool,
    event_id: &str,
    class_id: &str,
) -> Result<Option<ClassRoster>> {
    let row = sqlx::query(
        "SELECT event_id, class_id, students, snapshot_at FROM class_rosters \
         WHERE event_id = ? AND class_id = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(event_id)
    .bind(class_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(roster_from_row).transpose()
}

/// Appends snapshots in a single transaction; all or nothing.
#[instrument(skip_all)]
pub async fn insert_rosters(pool: &Pool, rosters: &[ClassRoster]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for roster in rosters {
        sqlx::query(
            "INSERT INTO class_rosters (event_id, class_id, students, snapshot_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&roster.event_id)
        .bind(&roster.class_id)
        .bind(serde_json::to_string(&roster.students)?)
        .bind(roster.snapshot_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Consent ledger
// ---------------------------------------------------------------------------

fn consent_from_row(row: &SqliteRow) -> Result<ConsentRecord> {
    let status: String = row.try_get("status")?;
    Ok(ConsentRecord {
        event_id: row.try_get("event_id")?,
        student_id: row.try_get("student_id")?,
        status: ConsentStatus::parse(&status).ok_or_else(|| corrupt("consent status", &status))?,
        acting_guardian_id: row.try_get("acting_guardian_id")?,
        decided_at: row.try_get("decided_at")?,
        revision: row.try_get("revision")?,
    })
}

#[instrument(skip_all)]
pub async fn fetch_consent(
    pool: &Pool,
    event_id: &str,
    student_id: &str,
) -> Result<Option<ConsentRecord>> {
    let row = sqlx::query("SELECT * FROM consent_records WHERE event_id = ? AND student_id = ?")
        .bind(event_id)
        .bind(student_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(consent_from_row).transpose()
}

/// Stored records only; keys never written are absent.
#[instrument(skip_all)]
pub async fn list_consents(pool: &Pool, event_id: &str) -> Result<Vec<ConsentRecord>> {
    let rows = sqlx::query("SELECT * FROM consent_records WHERE event_id = ? ORDER BY student_id")
        .bind(event_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(consent_from_row).collect()
}

/// Event still accepting decisions; binds the event id then the decision time.
const WINDOW_OPEN: &str = "EXISTS (SELECT 1 FROM campaign_events WHERE id = ? \
     AND status IN ('SCHEDULED', 'IN_PROGRESS') AND julianday(cutoff_at) > julianday(?))";

/// Writes `next` only if the stored revision equals `expected_revision`
/// (0 meaning "no row yet") and the event's consent window is still open at
/// `now`, and appends the transition in the same transaction.
#[instrument(skip_all, fields(event_id = %next.event_id, student_id = %next.student_id))]
pub async fn write_consent(
    pool: &Pool,
    next: &ConsentRecord,
    from: ConsentStatus,
    expected_revision: i64,
    now: DateTime<Utc>,
) -> Result<ConditionalWrite> {
    let mut tx = pool.begin().await?;
    let affected = if expected_revision == 0 {
        sqlx::query(&format!(
            "INSERT OR IGNORE INTO consent_records (event_id, student_id, status, acting_guardian_id, decided_at, revision) \
             SELECT ?, ?, ?, ?, ?, ? WHERE {}",
            WINDOW_OPEN
        ))
        .bind(&next.event_id)
        .bind(&next.student_id)
        .bind(next.status.as_str())
        .bind(&next.acting_guardian_id)
        .bind(next.decided_at)
        .bind(next.revision)
        .bind(&next.event_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
    } else {
        sqlx::query(&format!(
            "UPDATE consent_records SET status = ?, acting_guardian_id = ?, decided_at = ?, revision = ? \
             WHERE event_id = ? AND student_id = ? AND revision = ? AND {}",
            WINDOW_OPEN
        ))
        .bind(next.status.as_str())
        .bind(&next.acting_guardian_id)
        .bind(next.decided_at)
        .bind(next.revision)
        .bind(&next.event_id)
        .bind(&next.student_id)
        .bind(expected_revision)
        .bind(&next.event_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
    };

    if affected == 0 {
        let open: bool = sqlx::query_scalar(&format!("SELECT {}", WINDOW_OPEN))
            .bind(&next.event_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        let actual: Option<i64> = sqlx::query_scalar(
            "SELECT revision FROM consent_records WHERE event_id = ? AND student_id = ?",
        )
        .bind(&next.event_id)
        .bind(&next.student_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.rollback().await?;
        if !open {
            return Ok(ConditionalWrite::WindowClosed);
        }
        return Ok(ConditionalWrite::Stale {
            actual: actual.unwrap_or(0),
        });
    }

    sqlx::query(
        "INSERT INTO consent_transitions (event_id, student_id, from_status, to_status, guardian_id, revision, recorded_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&next.event_id)
    .bind(&next.student_id)
    .bind(from.as_str())
    .bind(next.status.as_str())
    .bind(next.acting_guardian_id.as_deref().unwrap_or_default())
    .bind(next.revision)
    .bind(next.decided_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(ConditionalWrite::Applied)
}

#[instrument(skip_all)]
pub async fn consent_history(
    pool: &Pool,
    event_id: &str,
    student_id: &str,
) -> Result<Vec<ConsentTransition>> {
    let rows = sqlx::query(
        "SELECT from_status, to_status, guardian_id, revision, recorded_at FROM consent_transitions \
         WHERE event_id = ? AND student_id = ? ORDER BY revision ASC",
    )
    .bind(event_id)
    .bind(student_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            let from: String = row.try_get("from_status")?;
            let to: String = row.try_get("to_status")?;
            Ok(ConsentTransition {
                from: ConsentStatus::parse(&from).ok_or_else(|| corrupt("consent status", &from))?,
                to: ConsentStatus::parse(&to).ok_or_else(|| corrupt("consent status", &to))?,
                guardian_id: row.try_get("guardian_id")?,
                revision: row.try_get("revision")?,
                recorded_at: row.try_get("recorded_at")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Notification tasks
// ---------------------------------------------------------------------------

fn task_from_row(row: &SqliteRow) -> Result<NotificationTask> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(NotificationTask {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        student_id: row.try_get("student_id")?,
        kind: NotificationType::parse(&kind).ok_or_else(|| corrupt("notification type", &kind))?,
        status: DeliveryStatus::parse(&status)
            .ok_or_else(|| corrupt("delivery status", &status))?,
        attempt: row.try_get("attempt")?,
        last_error: row.try_get("last_error")?,
        due_at: row.try_get("due_at")?,
    })
}

/// Enqueue one task per student in a single transaction, reusing any
/// non-terminal task already open for the same key.
#[instrument(skip_all, fields(event_id = %event_id, count = students.len()))]
pub async fn enqueue_tasks(
    pool: &Pool,
    event_id: &str,
    students: &[String],
    kind: NotificationType,
    due_at: DateTime<Utc>,
) -> Result<Vec<TaskId>> {
    let mut tx = pool.begin().await?;
    let mut ids = Vec::with_capacity(students.len());
    for student_id in students {
        ids.push(enqueue_task_tx(&mut tx, event_id, student_id, kind, due_at).await?);
    }
    tx.commit().await?;
    Ok(ids)
}

async fn enqueue_task_tx(
    tx: &mut Transaction<'_, Sqlite>,
    event_id: &str,
    student_id: &str,
    kind: NotificationType,
    due_at: DateTime<Utc>,
) -> Result<TaskId> {
    // The partial unique index turns a duplicate open task into a no-op insert.
    let inserted: Option<TaskId> = sqlx::query_scalar(
        "INSERT OR IGNORE INTO notification_tasks (event_id, student_id, kind, status, attempt, due_at, created_at, updated_at) \
         VALUES (?, ?, ?, 'QUEUED', 0, ?, ?, ?) RETURNING id",
    )
    .bind(event_id)
    .bind(student_id)
    .bind(kind.as_str())
    .bind(due_at)
    .bind(due_at)
    .bind(due_at)
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(id) = inserted {
        return Ok(id);
    }
    let existing: TaskId = sqlx::query_scalar(
        "SELECT id FROM notification_tasks WHERE event_id = ? AND student_id = ? AND kind = ? \
         AND status IN ('QUEUED', 'SENT') ORDER BY id DESC LIMIT 1",
    )
    .bind(event_id)
    .bind(student_id)
    .bind(kind.as_str())
    .fetch_one(&mut **tx)
    .await?;
    Ok(existing)
}

#[instrument(skip_all)]
pub async fn fetch_task(pool: &Pool, task_id: TaskId) -> Result<Option<NotificationTask>> {
    let row = sqlx::query("SELECT * FROM notification_tasks WHERE id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(task_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn next_due_task(pool: &Pool, now: DateTime<Utc>) -> Result<Option<NotificationTask>> {
    let row = sqlx::query(
        "SELECT * FROM notification_tasks WHERE status = 'QUEUED' AND datetime(due_at) <= datetime(?) \
         ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .bind(now)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(task_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_tasks(pool: &Pool, event_id: &str) -> Result<Vec<NotificationTask>> {
    let rows = sqlx::query("SELECT * FROM notification_tasks WHERE event_id = ? ORDER BY id")
        .bind(event_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(task_from_row).collect()
}

/// Students that ever had a task of `kind` for the event, in any status.
#[instrument(skip_all)]
pub async fn students_with_task(
    pool: &Pool,
    event_id: &str,
    kind: NotificationType,
) -> Result<HashSet<String>> {
    let students: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT student_id FROM notification_tasks WHERE event_id = ? AND kind = ?",
    )
    .bind(event_id)
    .bind(kind.as_str())
    .fetch_all(pool)
    .await?;
    Ok(students.into_iter().collect())
}

#[instrument(skip_all)]
pub async fn open_tasks_for(
    pool: &Pool,
    event_id: &str,
    student_id: &str,
) -> Result<Vec<NotificationTask>> {
    let rows = sqlx::query(
        "SELECT * FROM notification_tasks WHERE event_id = ? AND student_id = ? \
         AND status IN ('QUEUED', 'SENT') ORDER BY id",
    )
    .bind(event_id)
    .bind(student_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(task_from_row).collect()
}

#[instrument(skip_all)]
pub async fn mark_task_sent(pool: &Pool, task_id: TaskId, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE notification_tasks SET status = 'SENT', attempt = attempt + 1, last_error = NULL, updated_at = ? \
         WHERE id = ? AND status = 'QUEUED'",
    )
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Records a failed attempt and puts the task back in the queue at `due_at`.
#[instrument(skip_all)]
pub async fn backoff_task(
    pool: &Pool,
    task_id: TaskId,
    attempt: i32,
    error: &str,
    due_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE notification_tasks SET status = 'QUEUED', attempt = ?, last_error = ?, due_at = ?, updated_at = ? \
         WHERE id = ? AND status IN ('QUEUED', 'SENT')",
    )
    .bind(attempt)
    .bind(error)
    .bind(due_at)
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn fail_task(
    pool: &Pool,
    task_id: TaskId,
    attempt: i32,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE notification_tasks SET status = 'FAILED', attempt = ?, last_error = ?, updated_at = ? \
         WHERE id = ? AND status IN ('QUEUED', 'SENT')",
    )
    .bind(attempt)
    .bind(error)
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn acknowledge_task(pool: &Pool, task_id: TaskId, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE notification_tasks SET status = 'ACKNOWLEDGED', updated_at = ? \
         WHERE id = ? AND status IN ('QUEUED', 'SENT')",
    )
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Readiness cache
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(event_id = %readiness.event_id, class_id = %readiness.class_id))]
pub async fn upsert_readiness(
    pool: &Pool,
    readiness: &ClassReadiness,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO class_readiness (event_id, class_id, agree, disagree, pending, verdict, roster_snapshot_at, evaluated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(event_id, class_id) DO UPDATE SET agree = excluded.agree, disagree = excluded.disagree, \
             pending = excluded.pending, verdict = excluded.verdict, \
             roster_snapshot_at = excluded.roster_snapshot_at, evaluated_at = excluded.evaluated_at",
    )
    .bind(&readiness.event_id)
    .bind(&readiness.class_id)
    .bind(readiness.agree)
    .bind(readiness.disagree)
    .bind(readiness.pending)
    .bind(readiness.verdict.as_str())
    .bind(readiness.roster_snapshot_at)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_readiness(pool: &Pool, event_id: &str) -> Result<Vec<ClassReadiness>> {
    let rows = sqlx::query(
        "SELECT event_id, class_id, agree, disagree, pending, verdict, roster_snapshot_at \
         FROM class_readiness WHERE event_id = ? ORDER BY class_id",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            let verdict: String = row.try_get("verdict")?;
            Ok(ClassReadiness {
                event_id: row.try_get("event_id")?,
                class_id: row.try_get("class_id")?,
                agree: row.try_get("agree")?,
                disagree: row.try_get("disagree")?,
                pending: row.try_get("pending")?,
                verdict: Readiness::parse(&verdict).ok_or_else(|| corrupt("verdict", &verdict))?,
                roster_snapshot_at: row.try_get("roster_snapshot_at")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Delivery alerts and feedback
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_alert(
    pool: &Pool,
    task: &NotificationTask,
    detail: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO delivery_alerts (event_id, student_id, task_id, kind, detail, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&task.event_id)
    .bind(&task.student_id)
    .bind(task.id)
    .bind(task.kind.as_str())
    .bind(detail)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn list_alerts(pool: &Pool, event_id: Option<&str>) -> Result<Vec<DeliveryAlert>> {
    let rows = sqlx::query(
        "SELECT * FROM delivery_alerts WHERE (? IS NULL OR event_id = ?) ORDER BY id",
    )
    .bind(event_id)
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            let kind: String = row.try_get("kind")?;
            Ok(DeliveryAlert {
                id: row.try_get("id")?,
                event_id: row.try_get("event_id")?,
                student_id: row.try_get("student_id")?,
                task_id: row.try_get("task_id")?,
                kind: NotificationType::parse(&kind)
                    .ok_or_else(|| corrupt("notification type", &kind))?,
                detail: row.try_get("detail")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Feedback for the student tied to this event, plus feedback not tied to any
/// event.
#[instrument(skip_all)]
pub async fn feedback_for(pool: &Pool, student_id: &str, event_id: &str) -> Result<Vec<Feedback>> {
    let rows = sqlx::query(
        "SELECT * FROM feedback WHERE student_id = ? AND (event_id = ? OR event_id IS NULL) \
         ORDER BY datetime(created_at) ASC, id ASC",
    )
    .bind(student_id)
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(Feedback {
                id: row.try_get("id")?,
                student_id: row.try_get("student_id")?,
                event_id: row.try_get("event_id")?,
                guardian_id: row.try_get("guardian_id")?,
                body: row.try_get("body")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}
