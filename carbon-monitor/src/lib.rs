pub mod carbon;
pub mod config;
pub mod error;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod sinks;
pub mod sources;
pub mod transform;

pub use error::{ConfigError, LoopError, PersistenceError, RemoteAccessError};
pub use pipeline::{LoopHandle, LoopSummary, SamplingLoop};
pub use sinks::UsageSink;
pub use sources::{create_monitor, DeviceSampleSet, MeteringSource, Monitor, MonitorOptions};
