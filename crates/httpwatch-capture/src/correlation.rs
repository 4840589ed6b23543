//! Call correlation
//!
//! Exit hooks cannot trust argument registers, so entry hooks park the
//! arguments in a [`CallTable`] under the caller's (process, logical thread)
//! key. [`CallTable::end`] removes the entry as it returns it, which makes the
//! release unconditional for every branch the exit handler takes afterwards.

use crate::table::BoundedTable;
use httpwatch_core::TableSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process and logical thread of one in-flight call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallKey {
    pub pid: u32,
    /// OS thread id, or goroutine id for the managed runtime
    pub exec_id: u64,
}

impl CallKey {
    /// Key for a native caller from a `pid_tgid` value (tgid high, tid low)
    pub fn os_thread(pid_tgid: u64) -> Self {
        Self {
            pid: (pid_tgid >> 32) as u32,
            exec_id: pid_tgid & 0xffff_ffff,
        }
    }

    /// Key for a goroutine
    pub fn goroutine(pid: u32, goid: u64) -> Self {
        Self { pid, exec_id: goid }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pid, self.exec_id)
    }
}

/// Arguments of one operation kind, pending until the matching exit
#[derive(Debug)]
pub struct CallTable<A> {
    inner: BoundedTable<CallKey, A>,
}

impl<A> CallTable<A> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            inner: BoundedTable::new(name, capacity),
        }
    }

    /// Record arguments at entry. A stale entry for the same key belongs to a
    /// call that never returned through the exit hook and is replaced.
    pub fn begin(&self, key: CallKey, args: A) {
        if self.inner.insert(key, args).is_some() {
            tracing::trace!("{}: replaced abandoned call for {}", self.inner.name(), key);
        }
    }

    /// Claim the arguments for `key`. The entry is gone once this returns.
    pub fn end(&self, key: CallKey) -> Option<A> {
        self.inner.take(&key)
    }

    pub fn is_pending(&self, key: CallKey) -> bool {
        self.inner.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn snapshot(&self) -> TableSnapshot {
        self.inner.snapshot()
    }
}
