use std::{sync::Arc, time::Duration};

use time::OffsetDateTime;
use tokio::{task::JoinHandle, time::Instant};

use crate::error::LoopError;
use crate::sinks::UsageSink;
use crate::sources::MeteringSource;
use crate::transform;

/// Counters for one run of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub records_written: u64,
    pub write_failures: u64,
}

/// Sample, attribute, persist, wait. Repeats until the timeout is reached or
/// authentication is exhausted.
pub struct SamplingLoop<M, K: ?Sized> {
    source: M,
    sink: Arc<K>,
    delay: Duration,
    timeout: Option<Duration>,
}

impl<M, K> SamplingLoop<M, K>
where
    M: MeteringSource + 'static,
    K: UsageSink + ?Sized + 'static,
{
    pub fn new(source: M, sink: Arc<K>, delay: Duration, timeout: Option<Duration>) -> Self {
        Self {
            source,
            sink,
            delay,
            timeout,
        }
    }

    /// Run to completion, then close the sink exactly once.
    ///
    /// Ticks run on their own task, so a panic inside a source or sink still
    /// ends with the sink closed.
    pub async fn run(self) -> Result<LoopSummary, LoopError> {
        let sink = Arc::clone(&self.sink);
        let ticks = tokio::spawn(async move {
            let mut this = self;
            this.run_ticks().await
        });
        let result = match ticks.await {
            Ok(result) => result,
            Err(e) => Err(LoopError::Task(e.to_string())),
        };
        sink.close().await;

        match &result {
            Ok(summary) => tracing::info!(
                ticks = summary.ticks,
                written = summary.records_written,
                write_failures = summary.write_failures,
                skipped = summary.skipped_ticks,
                "sampling loop finished"
            ),
            Err(e) => tracing::error!(error = %e, "sampling loop aborted"),
        }
        result
    }

    /// Run on a background task.
    pub fn spawn(self) -> LoopHandle {
        LoopHandle {
            inner: tokio::spawn(self.run()),
        }
    }

    async fn run_ticks(&mut self) -> Result<LoopSummary, LoopError> {
        let started = Instant::now();
        let mut summary = LoopSummary::default();

        loop {
            self.tick(&mut summary).await?;

            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    break;
                }
            }
            tokio::time::sleep(self.delay).await;
        }

        Ok(summary)
    }

    /// One sampling tick. Only exhausted authentication is returned as an
    /// error; everything else is logged and counted.
    pub async fn tick(&mut self, summary: &mut LoopSummary) -> Result<(), LoopError> {
        summary.ticks += 1;

        let samples = match self.source.sample_once().await {
            Ok(samples) => samples,
            Err(e) if e.is_fatal() => return Err(LoopError::Fatal(e)),
            Err(e) => {
                tracing::warn!(error = %e, "sampling failed, skipping tick");
                metrics::counter!("sample_errors_total").increment(1);
                summary.skipped_ticks += 1;
                return Ok(());
            }
        };
        metrics::counter!("samples_taken_total").increment(samples.len() as u64);

        let intensity = match self.source.carbon().current_intensity().await {
            Ok(intensity) => intensity,
            Err(e) => {
                tracing::warn!(error = %e, "carbon intensity lookup failed, recording without emission");
                None
            }
        };
        tracing::debug!(devices = samples.len(), intensity = ?intensity, "sampled");

        for (device, watts) in samples {
            let record = match transform::build_record(device, OffsetDateTime::now_utc(), watts, self.delay, intensity) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "discarding sample");
                    continue;
                }
            };

            let device = record.device.clone();
            match self.sink.write(record).await {
                Ok(()) => summary.records_written += 1,
                Err(e) => {
                    tracing::warn!(error = %e, %device, "failed to persist usage record");
                    summary.write_failures += 1;
                }
            }
        }

        Ok(())
    }
}

/// A sampling loop running on its own task.
pub struct LoopHandle {
    inner: JoinHandle<Result<LoopSummary, LoopError>>,
}

impl LoopHandle {
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub async fn join(self) -> Result<LoopSummary, LoopError> {
        self.inner
            .await
            .map_err(|e| LoopError::Task(e.to_string()))?
    }
}
