//! In-process run metrics.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Event counters and phase timings, shared by the appliers and the cutover
/// coordinator.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<HashMap<String, u64>>,
    timings: Mutex<HashMap<String, Duration>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment both the per-table counter (`name.table`) and the total.
    pub fn count(&self, name: &str, table: &str) {
        let Ok(mut counters) = self.counters.lock() else { return };
        *counters.entry(name.to_string()).or_insert(0) += 1;
        *counters.entry(format!("{name}.{table}")).or_insert(0) += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|counters| counters.get(name).copied())
            .unwrap_or(0)
    }

    pub fn record_duration(&self, name: &str, duration: Duration) {
        if let Ok(mut timings) = self.timings.lock() {
            timings.insert(name.to_string(), duration);
        }
    }

    pub fn duration(&self, name: &str) -> Option<Duration> {
        self.timings.lock().ok()?.get(name).copied()
    }

    /// Run a future and record how long it took under `name`.
    pub async fn measure<T>(&self, name: &str, fut: impl Future<Output = T>) -> T {
        let started = Instant::now();
        let output = fut.await;
        self.record_duration(name, started.elapsed());
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_table_and_total() {
        let metrics = Metrics::new();
        metrics.count("RowEvent", "users");
        metrics.count("RowEvent", "users");
        metrics.count("RowEvent", "orders");

        assert_eq!(metrics.counter("RowEvent"), 3);
        assert_eq!(metrics.counter("RowEvent.users"), 2);
        assert_eq!(metrics.counter("RowEvent.orders"), 1);
        assert_eq!(metrics.counter("SchemaEvent"), 0);
    }

    #[tokio::test]
    async fn test_measure_records_duration() {
        let metrics = Metrics::new();
        let out = metrics.measure("Phase", async { 42 }).await;
        assert_eq!(out, 42);
        assert!(metrics.duration("Phase").is_some());
        assert!(metrics.duration("OtherPhase").is_none());
    }
}
