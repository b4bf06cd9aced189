use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use carbon_monitor::{
    carbon::{CarbonBinding, CarbonIntensityProvider, Location},
    error::{LoopError, PersistenceError, RemoteAccessError},
    sinks::{csv_file::CsvFileSink, FileMode, UsageSink},
    sources::{kasa_protocol::PlugTransport, DeviceSampleSet, KasaMonitor, MeteringSource},
    SamplingLoop,
};
use serde_json::{json, Value};
use usage_client::{CellValue, Column, ColumnSelector, EnergyUsageRecord, UsageRow};

/// Returns the same intensity every time and counts lookups.
struct CountingProvider {
    intensity: Result<Option<f64>, ()>,
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl CarbonIntensityProvider for CountingProvider {
    async fn get(&self, _location: &Location) -> Result<Option<f64>, RemoteAccessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.intensity.map_err(|()| RemoteAccessError::Status {
            endpoint: "carbon api".to_string(),
            status: 503,
            body: "unavailable".to_string(),
        })
    }
}

fn binding(intensity: Result<Option<f64>, ()>) -> (CarbonBinding, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let provider = CountingProvider {
        intensity,
        calls: calls.clone(),
    };
    (CarbonBinding::new(Location::Grid("DE".into()), Arc::new(provider)), calls)
}

/// Replays scripted samples, then keeps repeating `fallback`.
struct ScriptedSource {
    carbon: CarbonBinding,
    script: Vec<Result<DeviceSampleSet, RemoteAccessError>>,
    fallback: DeviceSampleSet,
}

#[async_trait::async_trait]
impl MeteringSource for ScriptedSource {
    async fn discover_devices(&mut self) -> Result<(), RemoteAccessError> {
        Ok(())
    }

    async fn sample_once(&mut self) -> Result<DeviceSampleSet, RemoteAccessError> {
        if self.script.is_empty() {
            Ok(self.fallback.clone())
        } else {
            self.script.remove(0)
        }
    }

    fn carbon(&self) -> &CarbonBinding {
        &self.carbon
    }
}

fn samples(pairs: &[(&str, f64)]) -> DeviceSampleSet {
    pairs.iter().map(|(d, w)| (d.to_string(), *w)).collect()
}

#[derive(Default)]
struct MemorySink {
    records: Mutex<Vec<EnergyUsageRecord>>,
    attempts: Mutex<Vec<String>>,
    fail_for: Option<String>,
    closes: AtomicUsize,
}

impl MemorySink {
    fn failing_for(device: &str) -> Self {
        Self {
            fail_for: Some(device.to_string()),
            ..Self::default()
        }
    }

    fn records(&self) -> Vec<EnergyUsageRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl UsageSink for MemorySink {
    async fn write(&self, record: EnergyUsageRecord) -> Result<(), PersistenceError> {
        self.attempts.lock().unwrap().push(record.device.clone());
        if self.fail_for.as_deref() == Some(record.device.as_str()) {
            return Err(PersistenceError::Io(std::io::Error::other("disk full")));
        }
        self.records.lock().unwrap().push(record);
        Ok(())
    }

    async fn read(&self, limit: usize, columns: &ColumnSelector) -> Result<Vec<UsageRow>, PersistenceError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(limit)
            .map(|r| r.project(columns))
            .collect())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn close_to(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-12
}

#[tokio::test(start_paused = true)]
async fn single_plug_reading_is_attributed_and_persisted() {
    let (carbon, _) = binding(Ok(Some(300.0)));
    let source = ScriptedSource {
        carbon,
        script: Vec::new(),
        fallback: samples(&[("Device", 100.0)]),
    };
    let sink = Arc::new(MemorySink::default());

    let summary = SamplingLoop::new(source, sink.clone(), Duration::from_secs(15), Some(Duration::ZERO))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.ticks, 1);
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].device, "Device");
    assert_eq!(records[0].power_draw_watts, 100.0);
    assert_eq!(records[0].grid_carbon_intensity_g_per_kwh, Some(300.0));
    assert!(close_to(records[0].avg_emitted_mg_co2e.unwrap(), 0.000125));
    assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn ticks_follow_the_delay_until_the_timeout() {
    let (carbon, lookups) = binding(Ok(Some(250.0)));
    let source = ScriptedSource {
        carbon,
        script: Vec::new(),
        fallback: samples(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]),
    };
    let sink = Arc::new(MemorySink::default());
    let started = tokio::time::Instant::now();

    let summary = SamplingLoop::new(source, sink.clone(), Duration::from_secs(15), Some(Duration::from_secs(40)))
        .run()
        .await
        .unwrap();

    // Ticks at 0s, 15s, 30s and 45s; the timeout is only checked after a tick.
    assert_eq!(summary.ticks, 4);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(45) && elapsed < Duration::from_secs(46));
    // One intensity lookup per tick, shared by every device.
    assert_eq!(lookups.load(Ordering::SeqCst), 4);
    assert_eq!(sink.records().len(), 12);
    assert_eq!(summary.records_written, 12);
}

#[tokio::test(start_paused = true)]
async fn failed_write_does_not_block_other_devices() {
    let (carbon, _) = binding(Ok(Some(300.0)));
    let source = ScriptedSource {
        carbon,
        script: Vec::new(),
        fallback: samples(&[("A", 10.0), ("B", 20.0)]),
    };
    let sink = Arc::new(MemorySink::failing_for("A"));

    let summary = SamplingLoop::new(source, sink.clone(), Duration::from_secs(15), Some(Duration::from_secs(15)))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.ticks, 2);
    assert_eq!(summary.write_failures, 2);
    assert_eq!(*sink.attempts.lock().unwrap(), vec!["A", "B", "A", "B"]);
    assert!(sink.records().iter().all(|r| r.device == "B"));
    assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn carbon_outage_records_usage_without_emission() {
    for intensity in [Err(()), Ok(None)] {
        let (carbon, _) = binding(intensity);
        let source = ScriptedSource {
            carbon,
            script: Vec::new(),
            fallback: samples(&[("Device", 100.0)]),
        };
        let sink = Arc::new(MemorySink::default());

        SamplingLoop::new(source, sink.clone(), Duration::from_secs(15), Some(Duration::ZERO))
            .run()
            .await
            .unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].power_draw_watts, 100.0);
        assert_eq!(records[0].grid_carbon_intensity_g_per_kwh, None);
        assert_eq!(records[0].avg_emitted_mg_co2e, None);
    }
}

#[tokio::test(start_paused = true)]
async fn transient_sampling_errors_do_not_stop_the_loop() {
    let (carbon, lookups) = binding(Ok(Some(300.0)));
    let source = ScriptedSource {
        carbon,
        script: vec![
            Err(RemoteAccessError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "plug timed out",
            ))),
            Ok(samples(&[("Device", 5.0)])),
        ],
        fallback: DeviceSampleSet::new(),
    };
    let sink = Arc::new(MemorySink::default());

    let summary = SamplingLoop::new(source, sink.clone(), Duration::from_secs(15), Some(Duration::from_secs(15)))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.ticks, 2);
    assert_eq!(summary.skipped_ticks, 1);
    assert_eq!(sink.records().len(), 1);
    // A skipped tick never reaches the carbon lookup.
    assert_eq!(lookups.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_authentication_stops_the_loop_and_closes_once() {
    let (carbon, _) = binding(Ok(Some(300.0)));
    let source = ScriptedSource {
        carbon,
        script: vec![
            Ok(samples(&[("23", 0.0), ("24", 4.0)])),
            Err(RemoteAccessError::Authentication("client credentials rejected".into())),
        ],
        fallback: samples(&[("24", 4.0)]),
    };
    let sink = Arc::new(MemorySink::default());

    let err = SamplingLoop::new(source, sink.clone(), Duration::from_secs(15), None)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, LoopError::Fatal(RemoteAccessError::Authentication(_))));
    assert_eq!(sink.records().len(), 2);
    assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
}

/// Reports one reading, then panics on the next poll.
struct PanickingSource {
    carbon: CarbonBinding,
    polls: usize,
}

#[async_trait::async_trait]
impl MeteringSource for PanickingSource {
    async fn discover_devices(&mut self) -> Result<(), RemoteAccessError> {
        Ok(())
    }

    async fn sample_once(&mut self) -> Result<DeviceSampleSet, RemoteAccessError> {
        self.polls += 1;
        if self.polls > 1 {
            panic!("token lifetime overflowed");
        }
        Ok(samples(&[("Device", 100.0)]))
    }

    fn carbon(&self) -> &CarbonBinding {
        &self.carbon
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_source_still_closes_the_sink() {
    let (carbon, _) = binding(Ok(Some(300.0)));
    let source = PanickingSource { carbon, polls: 0 };
    let sink = Arc::new(MemorySink::default());

    let err = SamplingLoop::new(source, sink.clone(), Duration::from_secs(15), None)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, LoopError::Task(_)));
    assert_eq!(sink.records().len(), 1);
    assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn spawned_loop_runs_in_the_background() {
    let (carbon, _) = binding(Ok(Some(300.0)));
    let source = ScriptedSource {
        carbon,
        script: Vec::new(),
        fallback: samples(&[("Device", 100.0)]),
    };
    let sink = Arc::new(MemorySink::default());

    let handle = SamplingLoop::new(source, sink.clone(), Duration::from_secs(15), Some(Duration::from_secs(30))).spawn();
    assert!(!handle.is_finished());

    tokio::time::sleep(Duration::from_secs(20)).await;
    let recent = sink.read(10, &ColumnSelector::Only(vec![Column::Device])).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].cells, vec![(Column::Device, CellValue::Text("Device".into()))]);

    let summary = handle.join().await.unwrap();
    assert_eq!(summary.ticks, 3);
    assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
}

/// One smart plug on a fake local network.
struct OnePlug;

#[async_trait::async_trait]
impl PlugTransport for OnePlug {
    async fn discover(&self) -> Result<Vec<IpAddr>, RemoteAccessError> {
        Ok(vec![IpAddr::from([192, 168, 1, 20])])
    }

    async fn query(&self, _host: IpAddr, request: &Value) -> Result<Value, RemoteAccessError> {
        if request.get("system").is_some() {
            Ok(json!({ "system": { "get_sysinfo": { "alias": "Device", "feature": "TIM:ENE", "err_code": 0 } } }))
        } else {
            Ok(json!({ "emeter": { "get_realtime": { "power": 100.0, "err_code": 0 } } }))
        }
    }
}

#[tokio::test(start_paused = true)]
async fn plug_readings_land_in_the_usage_file() {
    let dir = tempfile::tempdir().unwrap();
    let (carbon, _) = binding(Ok(Some(300.0)));
    let monitor = KasaMonitor::with_transport(carbon, OnePlug);
    let sink = Arc::new(CsvFileSink::open(dir.path().join("usage.csv"), FileMode::Append).unwrap());

    SamplingLoop::new(monitor, sink.clone(), Duration::from_secs(15), Some(Duration::from_secs(15)))
        .run()
        .await
        .unwrap();

    let rows = sink.read(10, &ColumnSelector::All).await.unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.get(Column::Device), Some(&CellValue::Text("Device".into())));
        assert_eq!(row.get(Column::PowerDrawWatts), Some(&CellValue::Float(100.0)));
        assert_eq!(row.get(Column::GridCarbonIntensity), Some(&CellValue::Float(300.0)));
        match row.get(Column::AvgEmittedMgCo2e) {
            Some(CellValue::Float(mg)) => assert!(close_to(*mg, 0.000125)),
            other => panic!("unexpected emission cell {other:?}"),
        }
    }
}
