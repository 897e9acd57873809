//! Application telemetry: metric aggregation and the reverse-WebSocket reporter

pub mod meter;
pub mod reporter;

pub use meter::{AppTelemetryMeter, CounterKind, LatencyKind, ValueRecorder};
pub use reporter::AppTelemetryReporter;
