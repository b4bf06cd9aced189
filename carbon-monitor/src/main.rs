use anyhow::Result;
use carbon_monitor::{
    config::{AppConfig, StorageConfig, StorageKind},
    error::PersistenceError,
    metrics_server, observability,
    pipeline::{LoopHandle, SamplingLoop},
    sinks::{CsvFileSink, PostgresUsageSink, UsageSink},
    sources::create_monitor,
};
use std::sync::Arc;
use usage_client::{ColumnSelector, EnergyUsageRecord, UsageRow};

const STATUS_RECORDS: usize = 10;

enum StorageSink {
    Postgres(PostgresUsageSink),
    File(CsvFileSink),
}

#[async_trait::async_trait]
impl UsageSink for StorageSink {
    async fn write(&self, record: EnergyUsageRecord) -> Result<(), PersistenceError> {
        match self {
            Self::Postgres(s) => s.write(record).await,
            Self::File(s) => s.write(record).await,
        }
    }

    async fn read(&self, limit: usize, columns: &ColumnSelector) -> Result<Vec<UsageRow>, PersistenceError> {
        match self {
            Self::Postgres(s) => s.read(limit, columns).await,
            Self::File(s) => s.read(limit, columns).await,
        }
    }

    async fn close(&self) {
        match self {
            Self::Postgres(s) => s.close().await,
            Self::File(s) => s.close().await,
        }
    }
}

async fn open_sink(cfg: &StorageConfig) -> Result<StorageSink> {
    Ok(match cfg.kind {
        StorageKind::Postgres => {
            let uri = cfg
                .uri
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("storage.uri is required for postgres storage"))?;
            StorageSink::Postgres(PostgresUsageSink::connect(uri, cfg.max_connections).await?)
        }
        StorageKind::File => StorageSink::File(CsvFileSink::open(&cfg.file_path, cfg.file_mode)?),
    })
}

/// Report progress until the loop stops, then surface its result.
async fn watch(
    handle: LoopHandle,
    sink: Arc<StorageSink>,
    interval: std::time::Duration,
    columns: ColumnSelector,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    while !handle.is_finished() {
        ticker.tick().await;
        if handle.is_finished() {
            break;
        }

        tracing::info!("sampling loop running");
        match sink.read(STATUS_RECORDS, &columns).await {
            Ok(rows) => {
                for row in rows {
                    tracing::info!(%row, "recent usage");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to read recent usage"),
        }
    }

    let summary = handle.join().await?;
    tracing::info!(
        ticks = summary.ticks,
        written = summary.records_written,
        "sampling loop completed"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let cfg = AppConfig::load()?;
    observability::init_tracing(&cfg.logging)?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let status_columns = cfg.status_columns()?;
    let sink = Arc::new(open_sink(&cfg.storage).await?);

    let options = cfg.monitor_options()?;
    let monitor = create_monitor(&cfg.monitor.device_type, &options)?;
    tracing::info!(
        device_type = %cfg.monitor.device_type,
        delay_secs = cfg.monitor.delay_secs,
        timeout_secs = ?cfg.monitor.timeout_secs,
        "starting sampling loop"
    );

    let handle = SamplingLoop::new(monitor, sink.clone(), cfg.delay(), cfg.timeout()).spawn();
    watch(handle, sink, cfg.status_interval(), status_columns).await
}
