//! Per-binary location tables for Go TLS probes
//!
//! Go's register ABI and struct layouts change between toolchain versions,
//! so every probed binary comes with a table describing where arguments,
//! return values, the goroutine id and the socket descriptor live. Tables are
//! produced by binary inspection outside the engine and registered per pid.

use crate::memory::{MemoryError, ProcessMemory};
use crate::probe::ProbeContext;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("Register {0} is not available in the probe context")]
    InvalidRegister(u16),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub type LocationResult<T> = Result<T, LocationError>;

/// Where a single word-sized value lives at a probe site
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    /// Not present in this build; reads as zero
    #[default]
    Absent,
    /// DWARF register number
    Register { reg: u16 },
    /// Offset from the stack pointer
    Stack { offset: i64 },
}

impl Location {
    pub fn register(reg: u16) -> Self {
        Location::Register { reg }
    }

    pub fn stack(offset: i64) -> Self {
        Location::Stack { offset }
    }
}

/// A Go slice argument
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceLocation {
    pub ptr: Location,
    pub len: Location,
    pub cap: Location,
}

/// How to find the current goroutine and its id
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoroutineIdMetadata {
    /// Offset of `goid` in `runtime.g`
    pub goroutine_id_offset: u64,
    /// Offset of the `g` pointer from the thread-local storage base
    pub runtime_g_tls_addr_offset: i64,
    /// Register holding `g` under the register ABI
    pub runtime_g_register: u16,
    pub runtime_g_in_register: bool,
}

/// Field offsets from `*tls.Conn` down to the socket descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnLayout {
    /// `tls.Conn.conn` (a `net.Conn` interface)
    pub tls_conn_inner_conn_offset: u64,
    /// Type word of the interface when the dynamic type is `*net.TCPConn`
    pub tcp_conn_interface_type: u64,
    /// `net.TCPConn.conn`
    pub tcp_conn_inner_conn_offset: u64,
    /// `net.conn.fd`
    pub conn_fd_offset: u64,
    /// `net.netFD.pfd`
    pub net_fd_pfd_offset: u64,
    /// `poll.FD.Sysfd`
    pub fd_sysfd_offset: u64,
}

/// Everything the Go adapter needs to know about one binary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoTlsOffsets {
    pub goroutine_id: GoroutineIdMetadata,
    pub conn_layout: ConnLayout,

    pub read_conn_pointer: Location,
    pub read_buffer: SliceLocation,
    pub read_return_bytes: Location,
    pub read_return_error: Location,

    pub write_conn_pointer: Location,
    pub write_buffer: SliceLocation,
    pub write_return_bytes: Location,
    pub write_return_error: Location,

    pub close_conn_pointer: Location,
}

/// Read one word from a register or the stack
pub fn read_location(
    memory: &dyn ProcessMemory,
    ctx: &ProbeContext,
    location: Location,
) -> LocationResult<u64> {
    match location {
        Location::Absent => Ok(0),
        Location::Register { reg } => ctx.regs.get(reg).ok_or(LocationError::InvalidRegister(reg)),
        Location::Stack { offset } => {
            let addr = ctx.sp().wrapping_add_signed(offset);
            Ok(memory.read_u64(ctx.pid(), addr)?)
        }
    }
}

/// Id of the goroutine running at the probe site
pub fn read_goroutine_id(
    memory: &dyn ProcessMemory,
    ctx: &ProbeContext,
    meta: &GoroutineIdMetadata,
) -> LocationResult<u64> {
    let g = if meta.runtime_g_in_register {
        ctx.regs
            .get(meta.runtime_g_register)
            .ok_or(LocationError::InvalidRegister(meta.runtime_g_register))?
    } else {
        let addr = ctx.tls_base.wrapping_add_signed(meta.runtime_g_tls_addr_offset);
        memory.read_u64(ctx.pid(), addr)?
    };
    Ok(memory.read_u64(ctx.pid(), g.wrapping_add(meta.goroutine_id_offset))?)
}

/// Offset tables of the Go processes currently probed
#[derive(Debug, Default)]
pub struct OffsetsRegistry {
    by_pid: DashMap<u32, Arc<GoTlsOffsets>>,
}

impl OffsetsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32, offsets: GoTlsOffsets) {
        self.by_pid.insert(pid, Arc::new(offsets));
    }

    pub fn unregister(&self, pid: u32) -> bool {
        self.by_pid.remove(&pid).is_some()
    }

    pub fn get(&self, pid: u32) -> Option<Arc<GoTlsOffsets>> {
        self.by_pid.get(&pid).map(|o| Arc::clone(o.value()))
    }

    pub fn len(&self) -> usize {
        self.by_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pid.is_empty()
    }
}
