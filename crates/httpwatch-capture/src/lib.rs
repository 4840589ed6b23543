//! httpwatch capture - TLS and HTTP interception engine
//!
//! Turns hook invocations on TLS libraries and kernel functions into a
//! uniform stream of plaintext observations tagged with their connection:
//!
//! - **Identity Resolver**: opaque library handles to connection tuples
//! - **Call correlation**: arguments carried from function entry to return
//! - **Adapters**: native SSL, GnuTLS-style and Go crypto/tls
//! - **Plaintext path**: HTTP read directly off unencrypted packets
//! - **Library loads**: shared objects opened by monitored processes
//!
//! Attaching the probes is not done here. The attachment layer (or a
//! recorded trace) calls [`CaptureEngine::dispatch`] with a [`ProbeContext`].

pub mod adapters;
pub mod correlation;
pub mod engine;
pub mod filter;
pub mod identity;
pub mod libload;
pub mod memory;
pub mod plaintext;
pub mod probe;
pub mod socket;
pub mod table;

pub use adapters::{GoTlsOffsets, Location, OffsetsRegistry};
pub use correlation::{CallKey, CallTable};
pub use engine::CaptureEngine;
pub use filter::PidFilter;
pub use identity::{HandleKey, IdentityResolver};
pub use memory::{MemoryError, ProcessMemory, SnapshotMemory};
pub use probe::{HookKind, HookPoint, ProbeContext, Registers};
pub use socket::{SockResolver, SocketTable};
pub use table::BoundedTable;

#[cfg(target_os = "linux")]
pub use memory::ProcMemory;
#[cfg(target_os = "linux")]
pub use socket::ProcSocketResolver;
