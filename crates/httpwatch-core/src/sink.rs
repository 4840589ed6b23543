//! Reconstructor-facing output
//!
//! Handlers never block, so sinks accept events synchronously. The channel
//! sink drops on a full queue and counts the drop.

use crate::events::{CaptureEvent, ConnectionClosed, LibraryLoad, ObservedBytes};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Sink errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("Event queue is full")]
    Full,

    #[error("Event receiver has been dropped")]
    Closed,
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Consumer of engine output
pub trait EventSink: Send + Sync {
    /// Deliver one event
    fn emit(&self, event: CaptureEvent) -> SinkResult<()>;

    /// A chunk of plaintext for a connection
    fn observed_bytes(&self, event: ObservedBytes) -> SinkResult<()> {
        self.emit(CaptureEvent::ObservedBytes(event))
    }

    /// End of stream for a connection
    fn connection_closed(&self, event: ConnectionClosed) -> SinkResult<()> {
        self.emit(CaptureEvent::ConnectionClosed(event))
    }

    /// A process opened a shared library
    fn library_load(&self, event: LibraryLoad) -> SinkResult<()> {
        self.emit(CaptureEvent::LibraryLoad(event))
    }
}

/// Bounded channel to an async consumer
pub struct ChannelSink {
    tx: mpsc::Sender<CaptureEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<CaptureEvent>) -> Self {
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a sink and the receiving half of its queue
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CaptureEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Events dropped because the queue was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: CaptureEvent) -> SinkResult<()> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Queue full, dropping {}", event.event_type());
                Err(SinkError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SinkError::Closed)
            }
        }
    }
}

/// In-memory sink used by replay and tests
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<CaptureEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CaptureEvent> {
        self.events.lock().clone()
    }

    /// Remove and return everything collected so far
    pub fn drain(&self) -> Vec<CaptureEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn observed(&self) -> Vec<ObservedBytes> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::ObservedBytes(o) => Some(o.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self) -> Vec<ConnectionClosed> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::ConnectionClosed(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn loads(&self) -> Vec<LibraryLoad> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::LibraryLoad(l) => Some(l.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: CaptureEvent) -> SinkResult<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
