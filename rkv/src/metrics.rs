//! Metrics collection for the key-value node
//!
//! Command counters and latencies are exposed in the Prometheus text format on
//! the metrics listener.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts, Registry};
use std::time::Duration;

/// Label used for anything that is not a known command, so that arbitrary
/// client input cannot grow the label set.
const UNKNOWN_COMMAND: &str = "unknown";

const KNOWN_COMMANDS: [&str; 7] = ["echo", "set", "get", "del", "keys", "flushdb", "shutdown"];

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    pub static ref COMMAND_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("command_counter", "commands received"),
        &["command"]
    )
    .unwrap();

    pub static ref COMMAND_ERROR_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("command_error_counter", "commands answered with an error"),
        &["command"]
    )
    .unwrap();

    pub static ref COMMAND_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("command_cost", "command cost"),
        &["command"]
    )
    .unwrap();

    pub static ref CONNECTION_GAUGE: IntGauge =
        IntGauge::new("open_connections", "open client connections").unwrap();

    pub static ref SNAPSHOT_COUNTER: IntCounter =
        IntCounter::new("snapshot_counter", "snapshots written").unwrap();
}

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(COMMAND_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(COMMAND_ERROR_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(COMMAND_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(CONNECTION_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOT_COUNTER.clone()));
}

pub fn command_label(name: &str) -> &'static str {
    KNOWN_COMMANDS
        .iter()
        .find(|known| **known == name)
        .copied()
        .unwrap_or(UNKNOWN_COMMAND)
}

/// Records one executed command.
pub fn record_command(name: &str, elapsed: Duration, failed: bool) {
    let label = command_label(name);
    COMMAND_COUNTER_VEC.with_label_values(&[label]).inc();
    COMMAND_HISTOGRAM_VEC
        .with_label_values(&[label])
        .observe(elapsed.as_secs_f64());
    if failed {
        COMMAND_ERROR_COUNTER_VEC.with_label_values(&[label]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_label() {
        assert_eq!(command_label("get"), "get");
        assert_eq!(command_label("flushdb"), "flushdb");
        assert_eq!(command_label("hset"), UNKNOWN_COMMAND);
        assert_eq!(command_label(""), UNKNOWN_COMMAND);
    }

    #[test]
    fn test_record_command() {
        let before = COMMAND_COUNTER_VEC.with_label_values(&["keys"]).get();
        let errors_before = COMMAND_ERROR_COUNTER_VEC.with_label_values(&["keys"]).get();

        record_command("keys", Duration::from_millis(2), false);
        record_command("keys", Duration::from_millis(3), true);

        // Other tests may record concurrently; counters only grow.
        assert!(COMMAND_COUNTER_VEC.with_label_values(&["keys"]).get() - before >= 2.0);
        assert!(COMMAND_ERROR_COUNTER_VEC.with_label_values(&["keys"]).get() - errors_before >= 1.0);
    }
}
