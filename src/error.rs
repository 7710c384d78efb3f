//! Error types shared by the engine components.
use crate::model::EventStatus;
use thiserror::Error;

/// Any failure of the persistence layer. Operations that hit one abort with no
/// partial effect (their transaction is rolled back).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(value: serde_json::Error) -> Self {
        StorageError::Corrupt(value.to_string())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("student directory unavailable: {0}")]
    DirectoryUnavailable(String),
    #[error("consent for student {student_id} changed concurrently (expected revision {expected}, found {actual})")]
    Conflict {
        student_id: String,
        expected: i64,
        actual: i64,
    },
    #[error("consent window for event {0} is closed")]
    WindowClosed(String),
    #[error("event {event_id} is {status} and does not accept this operation")]
    EventNotOpen {
        event_id: String,
        status: EventStatus,
    },
    #[error("student {student_id} is not enrolled in event {event_id}")]
    NotEnrolled { event_id: String, student_id: String },
    #[error("cannot move event {event_id} from {from} to {to}")]
    InvalidTransition {
        event_id: String,
        from: EventStatus,
        to: EventStatus,
    },
    #[error("event {event_id} has blocked classes: {classes:?}")]
    ClassesBlocked {
        event_id: String,
        classes: Vec<String>,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for EngineError {
    fn from(value: sqlx::Error) -> Self {
        EngineError::Storage(StorageError::Database(value))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
