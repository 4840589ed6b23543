//! Library-load detector
//!
//! Watches `do_sys_open` / `do_sys_openat2`. The path argument is copied at
//! entry (it may be gone by the time the call returns) and checked against
//! the shared-object suffix once the open is known to have succeeded.

use crate::memory::ProcessMemory;
use crate::probe::ProbeContext;
use crate::table::BoundedTable;
use httpwatch_core::{EventSink, LibraryLoad, MetricsCollector, TableSnapshot};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// Bytes of path copied per open
pub const LIB_PATH_MAX_SIZE: usize = 120;

const SO_SUFFIX: &str = ".so";

/// Path captured at open entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPath {
    pub pid: u32,
    /// Fixed-size buffer, zeroed after the first NUL
    pub buf: [u8; LIB_PATH_MAX_SIZE],
    pub len: usize,
}

impl PendingPath {
    pub fn path(&self) -> String {
        String::from_utf8_lossy(&self.buf[..self.len]).into_owned()
    }
}

/// Copy a NUL-terminated path out of the traced process.
///
/// One bulk read is tried first; it may run past the end of the string, so
/// everything after the first NUL is zeroed. If the bulk read fails the
/// bytes are copied one at a time, an unreadable byte reading as NUL.
///
/// A path with no NUL inside the buffer does not fit and comes back with
/// length 0, as does an empty one.
pub fn copy_path(
    memory: &dyn ProcessMemory,
    pid: u32,
    addr: u64,
) -> ([u8; LIB_PATH_MAX_SIZE], usize) {
    let mut buf = [0u8; LIB_PATH_MAX_SIZE];

    if memory.read(pid, addr, &mut buf).is_err() {
        for (i, slot) in buf.iter_mut().enumerate() {
            let mut byte = [0u8; 1];
            if memory.read(pid, addr.wrapping_add(i as u64), &mut byte).is_err() {
                break;
            }
            *slot = byte[0];
            if byte[0] == 0 {
                break;
            }
        }
    }

    match buf.iter().position(|&b| b == 0) {
        Some(len) => {
            buf[len..].fill(0);
            (buf, len)
        }
        None => ([0u8; LIB_PATH_MAX_SIZE], 0),
    }
}

/// Whether a path names a shared object: the last component ends in `.so`
/// or carries a numeric version after it (`libssl.so.3`)
pub fn is_shared_library(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.match_indices(SO_SUFFIX).any(|(i, _)| {
        let rest = &name[i + SO_SUFFIX.len()..];
        match rest.strip_prefix('.') {
            None => rest.is_empty(),
            Some(version) => {
                !version.is_empty() && version.chars().all(|c| c.is_ascii_digit() || c == '.')
            }
        }
    })
}

pub struct LibraryLoadDetector {
    memory: Arc<dyn ProcessMemory>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<MetricsCollector>,
    open_at: BoundedTable<u64, PendingPath>,
}

impl LibraryLoadDetector {
    pub fn new(
        memory: Arc<dyn ProcessMemory>,
        sink: Arc<dyn EventSink>,
        metrics: Arc<MetricsCollector>,
        capacity: usize,
    ) -> Self {
        Self {
            memory,
            sink,
            metrics,
            open_at: BoundedTable::new("open_at_args", capacity),
        }
    }

    /// `long do_sys_open(int dfd, const char __user *filename, ...)`
    pub fn on_open(&self, ctx: &ProbeContext) {
        let (buf, len) = copy_path(self.memory.as_ref(), ctx.pid(), ctx.param(2));
        if len == 0 {
            trace!(
                "open: pid {} path empty or longer than {} bytes",
                ctx.pid(),
                LIB_PATH_MAX_SIZE
            );
            return;
        }
        self.open_at.insert(
            ctx.pid_tgid,
            PendingPath {
                pid: ctx.pid(),
                buf,
                len,
            },
        );
    }

    pub fn on_open_return(&self, ctx: &ProbeContext) {
        // The pending path is released on every branch
        let Some(pending) = self.open_at.take(&ctx.pid_tgid) else {
            return;
        };
        if (ctx.rc() as i64) < 0 {
            return;
        }

        let path = pending.path();
        if !is_shared_library(&path) {
            trace!("open: pid {} {} is not a library", pending.pid, path);
            return;
        }

        debug!("library load: pid {} {}", pending.pid, path);
        let load = LibraryLoad {
            pid: pending.pid,
            path,
        };
        match self.sink.library_load(load) {
            Ok(()) => {
                self.metrics
                    .capture
                    .library_loads
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.metrics.capture.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.open_at.len()
    }

    pub fn snapshot(&self) -> TableSnapshot {
        self.open_at.snapshot()
    }
}
