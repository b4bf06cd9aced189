use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use usage_client::{Column, ColumnSelector, EnergyUsageRecord, UsageRow};

use super::{FileMode, UsageSink};
use crate::error::PersistenceError;

/// Usage records in a CSV file with a header row.
///
/// Columns, by header name:
/// - device
/// - timestamp (RFC3339)
/// - power_draw_watts
/// - avg_emitted_mgco2e (empty when unknown)
/// - grid_carbon_intensity_gco2perkwhr (empty when unknown)
pub struct CsvFileSink {
    path: PathBuf,
    mode: FileMode,
    // Serializes writers; readers go through it too so they never see a
    // half-written overwrite.
    lock: Mutex<()>,
}

fn header() -> Vec<&'static str> {
    Column::ALL.iter().map(|c| c.name()).collect()
}

fn write_rows(file: File, with_header: bool, record: Option<&EnergyUsageRecord>) -> Result<(), PersistenceError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    if with_header {
        writer.write_record(header())?;
    }
    if let Some(record) = record {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

impl CsvFileSink {
    /// Open the sink, creating the file with a header row if it is missing.
    pub fn open(path: impl Into<PathBuf>, mode: FileMode) -> Result<Self, PersistenceError> {
        let path = path.into();
        if !path.exists() {
            write_rows(File::create(&path)?, true, None)?;
            tracing::info!(path = %path.display(), "created usage file");
        }
        Ok(Self {
            path,
            mode,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, record: &EnergyUsageRecord) -> Result<(), PersistenceError> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let empty = file.metadata()?.len() == 0;
        write_rows(file, empty, Some(record))
    }

    fn overwrite(&self, record: &EnergyUsageRecord) -> Result<(), PersistenceError> {
        write_rows(File::create(&self.path)?, true, Some(record))
    }

    /// The last `limit` decodable rows, oldest first. Rows that fail to
    /// decode (a torn append, hand edits) are skipped.
    fn read_tail(&self, limit: usize) -> Result<VecDeque<EnergyUsageRecord>, PersistenceError> {
        let mut tail = VecDeque::with_capacity(limit.min(1024));
        if limit == 0 {
            return Ok(tail);
        }

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(tail),
            Err(e) => return Err(e.into()),
        };
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);

        for result in reader.deserialize::<EnergyUsageRecord>() {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    metrics::counter!("usage_file_parse_errors_total").increment(1);
                    tracing::warn!(error = %e, path = %self.path.display(), "skipping unreadable usage row");
                    continue;
                }
            };
            if tail.len() == limit {
                tail.pop_front();
            }
            tail.push_back(record);
        }

        Ok(tail)
    }
}

#[async_trait::async_trait]
impl UsageSink for CsvFileSink {
    async fn write(&self, record: EnergyUsageRecord) -> Result<(), PersistenceError> {
        let result = {
            let _guard = self.guard();
            match self.mode {
                FileMode::Append => self.append(&record),
                FileMode::Overwrite => self.overwrite(&record),
            }
        };

        match &result {
            Ok(()) => metrics::counter!("usage_records_written_total", "sink" => "file").increment(1),
            Err(_) => metrics::counter!("usage_write_errors_total", "sink" => "file").increment(1),
        }
        result
    }

    async fn read(&self, limit: usize, columns: &ColumnSelector) -> Result<Vec<UsageRow>, PersistenceError> {
        let records = {
            let _guard = self.guard();
            self.read_tail(limit)?
        };

        Ok(records
            .iter()
            .rev()
            .map(|record| record.project(columns))
            .collect())
    }

    async fn close(&self) {}
}
