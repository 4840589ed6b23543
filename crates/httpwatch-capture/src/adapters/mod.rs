//! Library adapters
//!
//! One adapter per TLS family. Each translates its library's call shapes into
//! identity-table writes on setup, correlated entry/exit pairs on data calls,
//! and the uniform observed-bytes / connection-closed events.

pub mod gnutls;
pub mod gotls;
pub mod offsets;
pub mod openssl;

use crate::correlation::CallTable;
use crate::memory::ProcessMemory;
use httpwatch_core::config::TableSettings;
use httpwatch_core::{
    ConnTuple, ConnectionClosed, EventSink, LibraryTag, MetricsCollector, ObservedBytes,
    TableSnapshot,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

pub use gnutls::GnutlsAdapter;
pub use gotls::GoTlsAdapter;
pub use offsets::{GoTlsOffsets, Location, OffsetsRegistry};
pub use openssl::NativeSslAdapter;

/// Arguments captured at entry of a read/write style data call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SslCallArgs {
    /// Session handle
    pub handle: u64,
    /// User buffer
    pub buf: u64,
}

/// Read and write slots shared by the native SSL and GnuTLS adapters.
/// The two families never operate on the same handle, so sharing is safe.
#[derive(Debug)]
pub struct SslCallTables {
    pub read: CallTable<SslCallArgs>,
    pub write: CallTable<SslCallArgs>,
}

impl SslCallTables {
    pub fn new(tables: &TableSettings) -> Self {
        Self {
            read: CallTable::new("ssl_read_args", tables.calls),
            write: CallTable::new("ssl_write_args", tables.calls),
        }
    }

    pub fn snapshots(&self) -> Vec<TableSnapshot> {
        vec![self.read.snapshot(), self.write.snapshot()]
    }
}

/// Turns resolved calls into events
pub struct Emitter {
    memory: Arc<dyn ProcessMemory>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<MetricsCollector>,
    max_capture_bytes: usize,
}

impl Emitter {
    pub fn new(
        memory: Arc<dyn ProcessMemory>,
        sink: Arc<dyn EventSink>,
        metrics: Arc<MetricsCollector>,
        max_capture_bytes: usize,
    ) -> Self {
        Self {
            memory,
            sink,
            metrics,
            max_capture_bytes,
        }
    }

    pub fn memory(&self) -> &dyn ProcessMemory {
        self.memory.as_ref()
    }

    pub fn sink(&self) -> &dyn EventSink {
        self.sink.as_ref()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn max_capture_bytes(&self) -> usize {
        self.max_capture_bytes
    }

    /// Copy up to the capture size from `buf` and emit it. A buffer that
    /// cannot be read drops the event.
    pub fn observed(
        &self,
        pid: u32,
        tuple: ConnTuple,
        buf: u64,
        len: usize,
        tag: LibraryTag,
    ) -> bool {
        let captured = len.min(self.max_capture_bytes);
        let data = match self.memory.read_bytes(pid, buf, captured) {
            Ok(data) => data,
            Err(e) => {
                debug!("[{}] pid {}: buffer unreadable: {}", tag, pid, e);
                self.read_failure();
                return false;
            }
        };

        debug!("[{}] pid {} {} len={}", tag, pid, tuple, len);
        self.send_observed(ObservedBytes {
            pid,
            tuple,
            tag,
            len,
            data,
            tcp_seq: None,
            tcp_flags: None,
        })
    }

    /// Emit an already captured chunk
    pub fn send_observed(&self, event: ObservedBytes) -> bool {
        let (tag, len) = (event.tag, event.len);
        match self.sink.observed_bytes(event) {
            Ok(()) => {
                self.metrics.capture.record_observed(tag, len);
                true
            }
            Err(_) => {
                self.metrics.capture.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn closed(&self, pid: u32, tuple: ConnTuple, tag: LibraryTag) -> bool {
        debug!("[{}] pid {} closed {}", tag, pid, tuple);
        match self
            .sink
            .connection_closed(ConnectionClosed { pid, tuple, tag })
        {
            Ok(()) => {
                self.metrics
                    .capture
                    .connections_closed
                    .fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.metrics.capture.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn lookup_miss(&self) {
        self.metrics
            .capture
            .lookup_misses
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_failure(&self) {
        self.metrics
            .capture
            .read_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed_call(&self) {
        self.metrics
            .capture
            .failed_calls
            .fetch_add(1, Ordering::Relaxed);
    }
}
