//! Access to monitored-process memory
//!
//! Buffers, out-parameters and runtime structures all live in the traced
//! process. Reads either succeed completely or fail; a failed read aborts the
//! single event that needed it.

use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

/// Memory read errors
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Null pointer read of {len} bytes")]
    NullPointer { len: usize },

    #[error("Address {addr:#x} (+{len}) not readable in pid {pid}")]
    Unmapped { pid: u32, addr: u64, len: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// Reader for another process's address space
pub trait ProcessMemory: Send + Sync {
    /// Fill `buf` from `addr` in `pid`. Partial reads are errors.
    fn read(&self, pid: u32, addr: u64, buf: &mut [u8]) -> MemoryResult<()>;

    fn read_bytes(&self, pid: u32, addr: u64, len: usize) -> MemoryResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(pid, addr, &mut buf)?;
        Ok(buf)
    }

    fn read_u64(&self, pid: u32, addr: u64) -> MemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read(pid, addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_i32(&self, pid: u32, addr: u64) -> MemoryResult<i32> {
        let mut buf = [0u8; 4];
        self.read(pid, addr, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }
}

/// Live reader backed by `/proc/<pid>/mem`
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMemory;

#[cfg(target_os = "linux")]
impl ProcessMemory for ProcMemory {
    fn read(&self, pid: u32, addr: u64, buf: &mut [u8]) -> MemoryResult<()> {
        use std::os::unix::fs::FileExt;

        if addr == 0 {
            return Err(MemoryError::NullPointer { len: buf.len() });
        }
        let file = std::fs::File::open(format!("/proc/{}/mem", pid))?;
        file.read_exact_at(buf, addr).map_err(|_| MemoryError::Unmapped {
            pid,
            addr,
            len: buf.len(),
        })
    }
}

#[derive(Debug, Clone)]
struct Region {
    base: u64,
    bytes: Vec<u8>,
}

impl Region {
    fn slice(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let offset = addr.checked_sub(self.base)? as usize;
        let end = offset.checked_add(len)?;
        self.bytes.get(offset..end)
    }
}

/// Recorded memory regions, used by replay and tests
#[derive(Debug, Default)]
pub struct SnapshotMemory {
    regions: RwLock<HashMap<u32, Vec<Region>>>,
}

impl SnapshotMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `base` in `pid`
    pub fn insert(&self, pid: u32, base: u64, bytes: impl Into<Vec<u8>>) {
        self.regions.write().entry(pid).or_default().push(Region {
            base,
            bytes: bytes.into(),
        });
    }

    pub fn insert_u64(&self, pid: u32, addr: u64, value: u64) {
        self.insert(pid, addr, value.to_le_bytes());
    }

    pub fn insert_i32(&self, pid: u32, addr: u64, value: i32) {
        self.insert(pid, addr, value.to_le_bytes());
    }

    /// Drop every region of `pid`
    pub fn forget(&self, pid: u32) {
        self.regions.write().remove(&pid);
    }
}

impl ProcessMemory for SnapshotMemory {
    fn read(&self, pid: u32, addr: u64, buf: &mut [u8]) -> MemoryResult<()> {
        if addr == 0 {
            return Err(MemoryError::NullPointer { len: buf.len() });
        }
        let regions = self.regions.read();
        // Later regions shadow earlier ones
        let found = regions
            .get(&pid)
            .and_then(|rs| rs.iter().rev().find_map(|r| r.slice(addr, buf.len())));

        match found {
            Some(bytes) => {
                buf.copy_from_slice(bytes);
                Ok(())
            }
            None => Err(MemoryError::Unmapped {
                pid,
                addr,
                len: buf.len(),
            }),
        }
    }
}
