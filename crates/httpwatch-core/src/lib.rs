//! httpwatch core - connection identity, event model and configuration
//!
//! This crate provides the types shared by the capture engine and the sensor:
//!
//! - **Connection identity**: `ConnTuple` and endpoint normalization
//! - **Events**: the uniform observed-bytes / connection-closed / library-load model
//! - **Sinks**: the reconstructor-facing output seam
//! - **Metrics**: telemetry counters and table statistics
//! - **Config**: TOML configuration with env overrides

pub mod config;
pub mod conn;
pub mod events;
pub mod metrics;
pub mod sink;

// Re-export commonly used types
pub use config::{ConfigError, ConfigLoader, HttpwatchConfig};
pub use conn::{AddressFamily, ConnTuple, Initiator, PortRange, Protocol};
pub use events::{CaptureEvent, ConnectionClosed, LibraryLoad, LibraryTag, ObservedBytes};
pub use metrics::{MetricsCollector, TableSnapshot, Telemetry, TelemetryCounter};
pub use sink::{ChannelSink, CollectingSink, EventSink, SinkError};

/// Version of the httpwatch crates
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
