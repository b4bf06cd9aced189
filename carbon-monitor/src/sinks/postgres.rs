use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::postgres::{PgPool, PgPoolOptions};
use usage_client::{
    db::energy_usage_queries::{create_table, insert_usage, latest_rows},
    ColumnSelector, EnergyUsageRecord, UsageRow,
};

use super::UsageSink;
use crate::error::PersistenceError;

/// `energy_usage` table in a Postgres-compatible store.
///
/// One insert per record, no batching and no retries: a failed write is
/// reported to the caller and the next record is attempted independently.
pub struct PostgresUsageSink {
    pool: PgPool,
    closed: AtomicBool,
}

impl PostgresUsageSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            closed: AtomicBool::new(false),
        }
    }

    /// Open a pool and make sure the table exists.
    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await?;
        create_table(&pool).await?;
        tracing::info!(max_connections, "connected usage sink to postgres");
        Ok(Self::new(pool))
    }

    fn ensure_open(&self) -> Result<(), PersistenceError> {
        if self.closed.load(Ordering::Acquire) {
            Err(PersistenceError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl UsageSink for PostgresUsageSink {
    async fn write(&self, record: EnergyUsageRecord) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        match insert_usage(&self.pool, &record).await {
            Ok(()) => {
                metrics::counter!("usage_records_written_total", "sink" => "postgres").increment(1);
                Ok(())
            }
            Err(e) => {
                metrics::counter!("usage_write_errors_total", "sink" => "postgres").increment(1);
                Err(e.into())
            }
        }
    }

    async fn read(&self, limit: usize, columns: &ColumnSelector) -> Result<Vec<UsageRow>, PersistenceError> {
        self.ensure_open()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(latest_rows(&self.pool, limit, columns).await?)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.pool.close().await;
            tracing::info!("postgres usage sink closed");
        }
    }
}
