//! Aggregation of per-node/bucket latency histograms and counters
//!
//! Recorders are keyed by `(node_uuid, bucket_name)`. The report is an
//! OpenMetrics-style text document the reporter ships verbatim inside a
//! `GET_TELEMETRY` response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::topology::{Config, ServiceType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyKind {
    Unknown,
    KvRetrieval,
    KvMutationNondurable,
    KvMutationDurable,
    Query,
    Search,
    Analytics,
    Management,
    Eventing,
}

impl LatencyKind {
    pub const ALL: [LatencyKind; 9] = [
        LatencyKind::Unknown,
        LatencyKind::KvRetrieval,
        LatencyKind::KvMutationNondurable,
        LatencyKind::KvMutationDurable,
        LatencyKind::Query,
        LatencyKind::Search,
        LatencyKind::Analytics,
        LatencyKind::Management,
        LatencyKind::Eventing,
    ];

    pub fn for_service(service: ServiceType) -> LatencyKind {
        match service {
            ServiceType::KeyValue => LatencyKind::KvRetrieval,
            ServiceType::Query => LatencyKind::Query,
            ServiceType::Search => LatencyKind::Search,
            ServiceType::Analytics => LatencyKind::Analytics,
            ServiceType::Management => LatencyKind::Management,
            ServiceType::Eventing => LatencyKind::Eventing,
            ServiceType::Views => LatencyKind::Unknown,
        }
    }

    fn metric_name(self) -> &'static str {
        match self {
            LatencyKind::Unknown => "sdk_unknown_duration_milliseconds",
            LatencyKind::KvRetrieval => "sdk_kv_retrieval_duration_milliseconds",
            LatencyKind::KvMutationNondurable => {
                "sdk_kv_mutation_nondurable_duration_milliseconds"
            }
            LatencyKind::KvMutationDurable => "sdk_kv_mutation_durable_duration_milliseconds",
            LatencyKind::Query => "sdk_query_duration_milliseconds",
            LatencyKind::Search => "sdk_search_duration_milliseconds",
            LatencyKind::Analytics => "sdk_analytics_duration_milliseconds",
            LatencyKind::Management => "sdk_management_duration_milliseconds",
            LatencyKind::Eventing => "sdk_eventing_duration_milliseconds",
        }
    }

    /// Histogram bounds in milliseconds; `+Inf` is implicit.
    fn bounds(self) -> &'static [u64] {
        match self {
            LatencyKind::KvRetrieval
            | LatencyKind::KvMutationNondurable
            | LatencyKind::KvMutationDurable => &[1, 10, 100, 500, 1000, 2500],
            _ => &[100, 1000, 10_000, 30_000, 75_000],
        }
    }

    fn index(self) -> usize {
        LatencyKind::ALL.iter().position(|kind| *kind == self).unwrap()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterKind {
    pub service: ServiceType,
    pub counter: CounterName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterName {
    TimedOut,
    Canceled,
    Total,
}

impl CounterName {
    fn as_str(self) -> &'static str {
        match self {
            CounterName::TimedOut => "timedout",
            CounterName::Canceled => "canceled",
            CounterName::Total => "total",
        }
    }
}

const COUNTER_SERVICES: [ServiceType; 6] = [
    ServiceType::KeyValue,
    ServiceType::Query,
    ServiceType::Search,
    ServiceType::Analytics,
    ServiceType::Management,
    ServiceType::Eventing,
];

const COUNTER_NAMES: [CounterName; 3] =
    [CounterName::TimedOut, CounterName::Canceled, CounterName::Total];

impl CounterKind {
    pub fn timedout_for(service: ServiceType) -> CounterKind {
        CounterKind { service, counter: CounterName::TimedOut }
    }

    pub fn canceled_for(service: ServiceType) -> CounterKind {
        CounterKind { service, counter: CounterName::Canceled }
    }

    pub fn total_for(service: ServiceType) -> CounterKind {
        CounterKind { service, counter: CounterName::Total }
    }

    fn index(self) -> Option<usize> {
        let service = COUNTER_SERVICES.iter().position(|s| *s == self.service)?;
        let counter = COUNTER_NAMES.iter().position(|c| *c == self.counter)?;
        Some(service * COUNTER_NAMES.len() + counter)
    }

    fn service_label(self) -> &'static str {
        match self.service {
            ServiceType::KeyValue => "kv",
            ServiceType::Query => "query",
            ServiceType::Search => "search",
            ServiceType::Analytics => "analytics",
            ServiceType::Management => "management",
            ServiceType::Eventing => "eventing",
            ServiceType::Views => "views",
        }
    }
}

struct Histogram {
    bounds: &'static [u64],
    counts: Vec<AtomicU64>,
    sum_millis: AtomicU64,
    total: AtomicU64,
}

impl Histogram {
    fn new(bounds: &'static [u64]) -> Histogram {
        Histogram {
            bounds,
            counts: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_millis: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    fn record(&self, value: Duration) {
        let millis = value.as_millis() as u64;
        let slot = self
            .bounds
            .iter()
            .position(|bound| millis <= *bound)
            .unwrap_or(self.bounds.len());
        self.counts[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_millis.fetch_add(millis, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn is_empty(&self) -> bool {
        self.total.load(Ordering::Relaxed) == 0
    }
}

/// Latency/counter sink for one `(node_uuid, bucket)` pair.
pub struct ValueRecorder {
    histograms: Vec<Histogram>,
    counters: Vec<AtomicU64>,
}

impl ValueRecorder {
    fn new() -> Arc<ValueRecorder> {
        Arc::new(ValueRecorder {
            histograms: LatencyKind::ALL.iter().map(|kind| Histogram::new(kind.bounds())).collect(),
            counters: (0..COUNTER_SERVICES.len() * COUNTER_NAMES.len())
                .map(|_| AtomicU64::new(0))
                .collect(),
        })
    }

    pub fn record_latency(&self, kind: LatencyKind, interval: Duration) {
        self.histograms[kind.index()].record(interval);
    }

    pub fn update_counter(&self, kind: CounterKind) {
        if let Some(index) = kind.index() {
            self.counters[index].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn counter_value(&self, kind: CounterKind) -> u64 {
        kind.index().map_or(0, |index| self.counters[index].load(Ordering::Relaxed))
    }
}

struct MeterState {
    recorders: HashMap<(String, String), Arc<ValueRecorder>>,
}

pub struct AppTelemetryMeter {
    enabled: AtomicBool,
    agent: Mutex<String>,
    state: Mutex<MeterState>,
}

impl Default for AppTelemetryMeter {
    fn default() -> Self {
        AppTelemetryMeter {
            enabled: AtomicBool::new(true),
            agent: Mutex::new(format!("cellar-rust/{}", env!("CARGO_PKG_VERSION"))),
            state: Mutex::new(MeterState { recorders: HashMap::new() }),
        }
    }
}

impl AppTelemetryMeter {
    pub fn new() -> Arc<AppTelemetryMeter> {
        Arc::new(AppTelemetryMeter::default())
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Disabling also discards accumulated measurements.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.state.lock().unwrap().recorders.clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn update_agent(&self, extra: &str) {
        let mut agent = self.agent.lock().unwrap();
        *agent = format!("cellar-rust/{};{}", env!("CARGO_PKG_VERSION"), extra);
    }

    /// Drop recorders of nodes that left the topology.
    pub fn update_config(&self, config: &Config) {
        let mut state = self.state.lock().unwrap();
        state.recorders.retain(|(node_uuid, _), _| {
            config.nodes.iter().any(|node| node.node_uuid == *node_uuid)
        });
    }

    pub fn value_recorder(&self, node_uuid: &str, bucket_name: &str) -> Arc<ValueRecorder> {
        if !self.is_enabled() {
            // detached recorder; measurements go nowhere
            return ValueRecorder::new();
        }
        let mut state = self.state.lock().unwrap();
        state
            .recorders
            .entry((node_uuid.to_string(), bucket_name.to_string()))
            .or_insert_with(ValueRecorder::new)
            .clone()
    }

    /// Append the OpenMetrics report to `output`.
    pub fn generate_report(&self, output: &mut Vec<u8>) {
        use std::fmt::Write;

        if !self.is_enabled() {
            return;
        }
        let agent = self.agent.lock().unwrap().clone();
        let state = self.state.lock().unwrap();
        let mut report = String::new();
        let mut keys: Vec<&(String, String)> = state.recorders.keys().collect();
        keys.sort();
        for key in keys {
            let (node_uuid, bucket_name) = key;
            let recorder = &state.recorders[key];
            let labels =
                format!("agent=\"{agent}\",node_uuid=\"{node_uuid}\",bucket=\"{bucket_name}\"");

            for kind in LatencyKind::ALL {
                let histogram = &recorder.histograms[kind.index()];
                if histogram.is_empty() {
                    continue;
                }
                let name = kind.metric_name();
                let mut cumulative = 0u64;
                for (slot, bound) in histogram.bounds.iter().enumerate() {
                    cumulative += histogram.counts[slot].load(Ordering::Relaxed);
                    let _ = writeln!(report, "{name}_bucket{{le=\"{bound}\",{labels}}} {cumulative}");
                }
                cumulative += histogram.counts[histogram.bounds.len()].load(Ordering::Relaxed);
                let _ = writeln!(report, "{name}_bucket{{le=\"+Inf\",{labels}}} {cumulative}");
                let _ = writeln!(
                    report,
                    "{name}_sum{{{labels}}} {}",
                    histogram.sum_millis.load(Ordering::Relaxed)
                );
                let _ = writeln!(
                    report,
                    "{name}_count{{{labels}}} {}",
                    histogram.total.load(Ordering::Relaxed)
                );
            }

            for service in COUNTER_SERVICES {
                for counter in COUNTER_NAMES {
                    let kind = CounterKind { service, counter };
                    let value = recorder.counter_value(kind);
                    let _ = writeln!(
                        report,
                        "sdk_{}_r_{}_total{{{labels}}} {value}",
                        kind.service_label(),
                        counter.as_str()
                    );
                }
            }
        }
        output.extend_from_slice(report.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_node(uuid: &str) -> Config {
        let json = format!(
            "{{\"rev\": 1, \"nodes\": [{{\"hostname\": \"n1\", \"nodeUuid\": \"{uuid}\", \"services\": {{\"kv\": 11210, \"mgmt\": 8091}}}}]}}"
        );
        Config::parse(&json, "n1").unwrap()
    }

    #[test]
    fn report_contains_histogram_and_counter_lines() {
        let meter = AppTelemetryMeter::new();
        let recorder = meter.value_recorder("uuid-1", "travel");
        recorder.record_latency(LatencyKind::KvRetrieval, Duration::from_millis(7));
        recorder.record_latency(LatencyKind::KvRetrieval, Duration::from_millis(700));
        recorder.update_counter(CounterKind::total_for(ServiceType::KeyValue));

        let mut output = Vec::new();
        meter.generate_report(&mut output);
        let report = String::from_utf8(output).unwrap();

        assert!(report.contains(
            "sdk_kv_retrieval_duration_milliseconds_bucket{le=\"10\",agent=\"cellar-rust/"
        ));
        assert!(report.contains("node_uuid=\"uuid-1\",bucket=\"travel\"} 1"));
        assert!(report.contains("sdk_kv_retrieval_duration_milliseconds_count{"));
        assert!(report.contains("sdk_kv_retrieval_duration_milliseconds_sum{"));
        assert!(report.contains("sdk_kv_r_total_total{"));
        assert!(report.contains("sdk_query_r_timedout_total{"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let meter = AppTelemetryMeter::new();
        let recorder = meter.value_recorder("uuid-1", "b");
        for millis in [1u64, 5, 50, 400, 900, 2000, 30_000] {
            recorder.record_latency(LatencyKind::KvRetrieval, Duration::from_millis(millis));
        }
        let mut output = Vec::new();
        meter.generate_report(&mut output);
        let report = String::from_utf8(output).unwrap();
        let line_value = |needle: &str| -> u64 {
            report
                .lines()
                .find(|line| line.contains(needle))
                .and_then(|line| line.rsplit(' ').next())
                .and_then(|value| value.parse().ok())
                .unwrap()
        };
        assert_eq!(line_value("le=\"1\""), 1);
        assert_eq!(line_value("le=\"10\""), 2);
        assert_eq!(line_value("le=\"2500\""), 6);
        assert_eq!(line_value("le=\"+Inf\""), 7);
    }

    #[test]
    fn disabled_meter_produces_no_report() {
        let meter = AppTelemetryMeter::new();
        let recorder = meter.value_recorder("uuid-1", "b");
        recorder.record_latency(LatencyKind::Query, Duration::from_millis(10));
        meter.disable();

        let mut output = Vec::new();
        meter.generate_report(&mut output);
        assert!(output.is_empty());
    }

    #[test]
    fn update_config_prunes_departed_nodes() {
        let meter = AppTelemetryMeter::new();
        meter.value_recorder("uuid-stays", "b").update_counter(CounterKind::total_for(ServiceType::Query));
        meter.value_recorder("uuid-leaves", "b").update_counter(CounterKind::total_for(ServiceType::Query));

        meter.update_config(&config_with_node("uuid-stays"));

        let mut output = Vec::new();
        meter.generate_report(&mut output);
        let report = String::from_utf8(output).unwrap();
        assert!(report.contains("uuid-stays"));
        assert!(!report.contains("uuid-leaves"));
    }
}
