pub mod csv_file;
pub mod postgres;

use serde::Deserialize;
use usage_client::{ColumnSelector, EnergyUsageRecord, UsageRow};

use crate::error::PersistenceError;

pub use csv_file::CsvFileSink;
pub use postgres::PostgresUsageSink;

/// Durable store for usage records.
///
/// Shared between the sampling loop (writer) and anything that wants to look
/// at recent records, so every method takes `&self`.
#[async_trait::async_trait]
pub trait UsageSink: Send + Sync {
    async fn write(&self, record: EnergyUsageRecord) -> Result<(), PersistenceError>;

    /// The latest `limit` records, most recent first.
    async fn read(&self, limit: usize, columns: &ColumnSelector) -> Result<Vec<UsageRow>, PersistenceError>;

    /// Release the store. Safe to call more than once.
    async fn close(&self);
}

/// How the flat-file sink treats existing rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileMode {
    /// One row per write.
    #[default]
    Append,
    /// Only the most recent record is kept.
    Overwrite,
}
