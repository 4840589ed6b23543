//! Telemetry counters
//!
//! The four collaborator counters (missed closes per transport and UDP send
//! accounting) plus counters kept by the engine itself. Everything is a
//! monotonic `AtomicU64` so handlers on different threads can bump them
//! without coordination.

use crate::events::LibraryTag;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters incremented by collaborating components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryCounter {
    MissedTcpClose,
    MissedUdpClose,
    UdpSendProcessed,
    UdpSendMissed,
}

impl TelemetryCounter {
    pub const ALL: [TelemetryCounter; 4] = [
        TelemetryCounter::MissedTcpClose,
        TelemetryCounter::MissedUdpClose,
        TelemetryCounter::UdpSendProcessed,
        TelemetryCounter::UdpSendMissed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryCounter::MissedTcpClose => "missed_tcp_close",
            TelemetryCounter::MissedUdpClose => "missed_udp_close",
            TelemetryCounter::UdpSendProcessed => "udp_send_processed",
            TelemetryCounter::UdpSendMissed => "udp_send_missed",
        }
    }
}

/// Collaborator counters
#[derive(Debug, Default)]
pub struct Telemetry {
    pub missed_tcp_close: AtomicU64,
    pub missed_udp_close: AtomicU64,
    pub udp_send_processed: AtomicU64,
    pub udp_send_missed: AtomicU64,
}

impl Telemetry {
    fn counter(&self, which: TelemetryCounter) -> &AtomicU64 {
        match which {
            TelemetryCounter::MissedTcpClose => &self.missed_tcp_close,
            TelemetryCounter::MissedUdpClose => &self.missed_udp_close,
            TelemetryCounter::UdpSendProcessed => &self.udp_send_processed,
            TelemetryCounter::UdpSendMissed => &self.udp_send_missed,
        }
    }

    pub fn increment(&self, which: TelemetryCounter) {
        self.add(which, 1);
    }

    pub fn add(&self, which: TelemetryCounter, n: u64) {
        self.counter(which).fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, which: TelemetryCounter) -> u64 {
        self.counter(which).load(Ordering::Relaxed)
    }
}

/// Engine counters
#[derive(Debug, Default)]
pub struct CaptureMetrics {
    pub native_ssl_events: AtomicU64,
    pub gnutls_events: AtomicU64,
    pub go_tls_events: AtomicU64,
    pub plaintext_events: AtomicU64,
    pub bytes_observed: AtomicU64,
    pub connections_closed: AtomicU64,
    pub library_loads: AtomicU64,
    /// Handle or correlation key absent at exit
    pub lookup_misses: AtomicU64,
    /// Argument or output value could not be read
    pub read_failures: AtomicU64,
    /// Exit reported zero bytes, an error code or an error value
    pub failed_calls: AtomicU64,
    pub packets_filtered: AtomicU64,
    pub pid_filtered: AtomicU64,
    /// Sink refused an event
    pub dropped: AtomicU64,
}

impl CaptureMetrics {
    pub fn record_observed(&self, tag: LibraryTag, len: usize) {
        let counter = match tag {
            LibraryTag::NativeSsl => &self.native_ssl_events,
            LibraryTag::GnutlsStyle => &self.gnutls_events,
            LibraryTag::ManagedRuntime => &self.go_tls_events,
            LibraryTag::Plaintext => &self.plaintext_events,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_observed.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn observed(&self, tag: LibraryTag) -> u64 {
        match tag {
            LibraryTag::NativeSsl => self.native_ssl_events.load(Ordering::Relaxed),
            LibraryTag::GnutlsStyle => self.gnutls_events.load(Ordering::Relaxed),
            LibraryTag::ManagedRuntime => self.go_tls_events.load(Ordering::Relaxed),
            LibraryTag::Plaintext => self.plaintext_events.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one bounded table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub name: String,
    pub len: usize,
    pub capacity: usize,
    pub inserts: u64,
    pub overwrites: u64,
    pub evictions: u64,
}

/// All counters of one engine
#[derive(Debug)]
pub struct MetricsCollector {
    start_time: Instant,
    pub telemetry: Telemetry,
    pub capture: CaptureMetrics,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            telemetry: Telemetry::default(),
            capture: CaptureMetrics::default(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export in Prometheus text format
    pub fn to_prometheus(&self, tables: &[TableSnapshot]) -> String {
        let mut output = String::new();

        output.push_str("# HELP httpwatch_uptime_seconds Time since engine started\n");
        output.push_str("# TYPE httpwatch_uptime_seconds gauge\n");
        output.push_str(&format!(
            "httpwatch_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        output.push_str("# HELP httpwatch_telemetry_total Collaborator counters\n");
        output.push_str("# TYPE httpwatch_telemetry_total counter\n");
        for which in TelemetryCounter::ALL {
            output.push_str(&format!(
                "httpwatch_telemetry_total{{counter=\"{}\"}} {}\n",
                which.as_str(),
                self.telemetry.get(which)
            ));
        }
        output.push('\n');

        output.push_str("# HELP httpwatch_observed_events_total Observed-bytes events emitted\n");
        output.push_str("# TYPE httpwatch_observed_events_total counter\n");
        for tag in LibraryTag::ALL {
            output.push_str(&format!(
                "httpwatch_observed_events_total{{library=\"{}\"}} {}\n",
                tag,
                self.capture.observed(tag)
            ));
        }
        output.push('\n');

        let plain = [
            (
                "httpwatch_observed_bytes_total",
                "Bytes reported by observed calls",
                &self.capture.bytes_observed,
            ),
            (
                "httpwatch_connections_closed_total",
                "Connection-closed events emitted",
                &self.capture.connections_closed,
            ),
            (
                "httpwatch_library_loads_total",
                "Library-load events emitted",
                &self.capture.library_loads,
            ),
            (
                "httpwatch_lookup_misses_total",
                "Exits dropped on a missing handle or correlation entry",
                &self.capture.lookup_misses,
            ),
            (
                "httpwatch_read_failures_total",
                "Exits dropped on an unreadable argument",
                &self.capture.read_failures,
            ),
            (
                "httpwatch_failed_calls_total",
                "Exits that reported nothing observed",
                &self.capture.failed_calls,
            ),
            (
                "httpwatch_packets_filtered_total",
                "Packets rejected by the plaintext filter",
                &self.capture.packets_filtered,
            ),
            (
                "httpwatch_pid_filtered_total",
                "Hook invocations skipped by the process filter",
                &self.capture.pid_filtered,
            ),
            (
                "httpwatch_dropped_total",
                "Events refused by the sink",
                &self.capture.dropped,
            ),
        ];
        for (name, help, value) in plain {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n\n", name, value.load(Ordering::Relaxed)));
        }

        if !tables.is_empty() {
            output.push_str("# HELP httpwatch_table_entries Live entries per table\n");
            output.push_str("# TYPE httpwatch_table_entries gauge\n");
            for t in tables {
                output.push_str(&format!(
                    "httpwatch_table_entries{{table=\"{}\"}} {}\n",
                    t.name, t.len
                ));
            }
            output.push('\n');

            output.push_str("# HELP httpwatch_table_evictions_total Entries evicted at capacity\n");
            output.push_str("# TYPE httpwatch_table_evictions_total counter\n");
            for t in tables {
                output.push_str(&format!(
                    "httpwatch_table_evictions_total{{table=\"{}\"}} {}\n",
                    t.name, t.evictions
                ));
            }
            output.push('\n');
        }

        output
    }

    /// Export as JSON
    pub fn to_json(&self, tables: &[TableSnapshot]) -> serde_json::Value {
        let c = &self.capture;
        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "telemetry": {
                "missed_tcp_close": self.telemetry.get(TelemetryCounter::MissedTcpClose),
                "missed_udp_close": self.telemetry.get(TelemetryCounter::MissedUdpClose),
                "udp_send_processed": self.telemetry.get(TelemetryCounter::UdpSendProcessed),
                "udp_send_missed": self.telemetry.get(TelemetryCounter::UdpSendMissed),
            },
            "capture": {
                "native_ssl_events": c.native_ssl_events.load(Ordering::Relaxed),
                "gnutls_events": c.gnutls_events.load(Ordering::Relaxed),
                "go_tls_events": c.go_tls_events.load(Ordering::Relaxed),
                "plaintext_events": c.plaintext_events.load(Ordering::Relaxed),
                "bytes_observed": c.bytes_observed.load(Ordering::Relaxed),
                "connections_closed": c.connections_closed.load(Ordering::Relaxed),
                "library_loads": c.library_loads.load(Ordering::Relaxed),
                "lookup_misses": c.lookup_misses.load(Ordering::Relaxed),
                "read_failures": c.read_failures.load(Ordering::Relaxed),
                "failed_calls": c.failed_calls.load(Ordering::Relaxed),
                "packets_filtered": c.packets_filtered.load(Ordering::Relaxed),
                "pid_filtered": c.pid_filtered.load(Ordering::Relaxed),
                "dropped": c.dropped.load(Ordering::Relaxed),
            },
            "tables": tables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_counters_are_independent() {
        let t = Telemetry::default();
        t.increment(TelemetryCounter::MissedTcpClose);
        t.increment(TelemetryCounter::MissedTcpClose);
        t.add(TelemetryCounter::UdpSendMissed, 5);

        assert_eq!(t.get(TelemetryCounter::MissedTcpClose), 2);
        assert_eq!(t.get(TelemetryCounter::MissedUdpClose), 0);
        assert_eq!(t.get(TelemetryCounter::UdpSendProcessed), 0);
        assert_eq!(t.get(TelemetryCounter::UdpSendMissed), 5);
    }

    #[test]
    fn test_record_observed() {
        let m = CaptureMetrics::default();
        m.record_observed(LibraryTag::GnutlsStyle, 100);
        m.record_observed(LibraryTag::NativeSsl, 14);
        assert_eq!(m.observed(LibraryTag::GnutlsStyle), 1);
        assert_eq!(m.observed(LibraryTag::ManagedRuntime), 0);
        assert_eq!(m.bytes_observed.load(Ordering::Relaxed), 114);
    }

    #[test]
    fn test_prometheus_output() {
        let m = MetricsCollector::new();
        m.telemetry.increment(TelemetryCounter::MissedUdpClose);
        m.capture.record_observed(LibraryTag::NativeSsl, 3);
        let tables = vec![TableSnapshot {
            name: "ssl_read_args".to_string(),
            len: 2,
            capacity: 1024,
            inserts: 5,
            overwrites: 1,
            evictions: 0,
        }];

        let text = m.to_prometheus(&tables);
        assert!(text.contains("httpwatch_telemetry_total{counter=\"missed_udp_close\"} 1"));
        assert!(text.contains("httpwatch_observed_events_total{library=\"native-ssl\"} 1"));
        assert!(text.contains("httpwatch_table_entries{table=\"ssl_read_args\"} 2"));
    }

    #[test]
    fn test_json_output() {
        let m = MetricsCollector::new();
        m.capture.lookup_misses.fetch_add(3, Ordering::Relaxed);
        let json = m.to_json(&[]);
        assert_eq!(json["capture"]["lookup_misses"], 3);
        assert_eq!(json["telemetry"]["udp_send_processed"], 0);
        assert!(json["tables"].as_array().unwrap().is_empty());
    }
}
