//! Consent collection and session scheduling for school health and
//! vaccination campaigns.
pub mod clock;
pub mod cohort;
pub mod config;
pub mod db;
pub mod delivery;
pub mod directory;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod outbox;
pub mod scheduling;

pub use engine::{CampaignEngine, EngineSettings};
pub use error::{EngineError, EngineResult, StorageError};
