//! Database module: row view models and SQL repositories.
//!
//! - `model`: small result types returned by repositories.
//! - `repo`: SQL-only functions that map rows into domain entities.
//!
//! Callers import from `campaign_consent::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::ConditionalWrite;
