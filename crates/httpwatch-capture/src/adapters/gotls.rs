//! Go crypto/tls adapter
//!
//! Goroutines migrate between OS threads, so entry and return of a call are
//! correlated by (pid, goroutine id) instead of pid_tgid. Returns are probed
//! at each RET instruction. Connection identity comes from walking the
//! `*tls.Conn` object down to its socket descriptor.

use super::offsets::{
    read_goroutine_id, read_location, GoTlsOffsets, Location, LocationResult, OffsetsRegistry,
};
use super::Emitter;
use crate::correlation::{CallKey, CallTable};
use crate::identity::{HandleKey, IdentityResolver};
use crate::memory::{MemoryResult, ProcessMemory};
use crate::probe::ProbeContext;
use httpwatch_core::config::TableSettings;
use httpwatch_core::{ConnTuple, LibraryTag, TableSnapshot};
use std::sync::Arc;
use tracing::{debug, trace};

const TAG: LibraryTag = LibraryTag::ManagedRuntime;

/// `func (c *Conn) Read(b []byte) (int, error)` at entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoReadArgs {
    pub conn: u64,
    pub buf: u64,
}

/// `func (c *Conn) Write(b []byte) (int, error)` at entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoWriteArgs {
    pub conn: u64,
    pub buf: u64,
    pub len: u64,
}

pub struct GoTlsAdapter {
    identity: Arc<IdentityResolver>,
    emitter: Arc<Emitter>,
    offsets: Arc<OffsetsRegistry>,
    reads: CallTable<GoReadArgs>,
    writes: CallTable<GoWriteArgs>,
}

impl GoTlsAdapter {
    pub fn new(
        identity: Arc<IdentityResolver>,
        emitter: Arc<Emitter>,
        offsets: Arc<OffsetsRegistry>,
        tables: &TableSettings,
    ) -> Self {
        Self {
            identity,
            emitter,
            offsets,
            reads: CallTable::new("go_tls_read_args", tables.goroutines),
            writes: CallTable::new("go_tls_write_args", tables.goroutines),
        }
    }

    fn offsets_for(&self, pid: u32) -> Option<Arc<GoTlsOffsets>> {
        let offsets = self.offsets.get(pid);
        if offsets.is_none() {
            trace!("go tls: no offsets for pid {}", pid);
        }
        offsets
    }

    fn call_key(&self, ctx: &ProbeContext, offsets: &GoTlsOffsets) -> Option<CallKey> {
        match read_goroutine_id(self.emitter.memory(), ctx, &offsets.goroutine_id) {
            Ok(goid) => Some(CallKey::goroutine(ctx.pid(), goid)),
            Err(e) => {
                debug!("go tls: pid {} goroutine id unreadable: {}", ctx.pid(), e);
                self.emitter.read_failure();
                None
            }
        }
    }

    // Write

    pub fn on_write(&self, ctx: &ProbeContext) {
        let Some(offsets) = self.offsets_for(ctx.pid()) else {
            return;
        };
        let Some(key) = self.call_key(ctx, &offsets) else {
            return;
        };

        match write_args(self.emitter.memory(), ctx, &offsets) {
            Ok(args) => self.writes.begin(key, args),
            Err(e) => {
                debug!("go tls write: {} arguments unreadable: {}", key, e);
                self.emitter.read_failure();
            }
        }
    }

    pub fn on_write_return(&self, ctx: &ProbeContext) {
        let Some(offsets) = self.offsets_for(ctx.pid()) else {
            return;
        };
        let Some(key) = self.call_key(ctx, &offsets) else {
            return;
        };
        let Some(args) = self.writes.end(key) else {
            self.emitter.lookup_miss();
            return;
        };

        if self
            .completed_bytes(ctx, offsets.write_return_bytes, offsets.write_return_error)
            .is_none()
        {
            return;
        }

        let Some(tuple) = self.conn_tuple(ctx, &offsets, args.conn) else {
            self.emitter.lookup_miss();
            return;
        };
        // A successful Write consumed the whole slice
        self.emitter
            .observed(ctx.pid(), tuple, args.buf, args.len as usize, TAG);
    }

    // Read

    pub fn on_read(&self, ctx: &ProbeContext) {
        let Some(offsets) = self.offsets_for(ctx.pid()) else {
            return;
        };
        let Some(key) = self.call_key(ctx, &offsets) else {
            return;
        };

        match read_args(self.emitter.memory(), ctx, &offsets) {
            Ok(args) => self.reads.begin(key, args),
            Err(e) => {
                debug!("go tls read: {} arguments unreadable: {}", key, e);
                self.emitter.read_failure();
            }
        }
    }

    pub fn on_read_return(&self, ctx: &ProbeContext) {
        let Some(offsets) = self.offsets_for(ctx.pid()) else {
            return;
        };
        let Some(key) = self.call_key(ctx, &offsets) else {
            return;
        };
        let Some(args) = self.reads.end(key) else {
            self.emitter.lookup_miss();
            return;
        };

        let Some(bytes_read) =
            self.completed_bytes(ctx, offsets.read_return_bytes, offsets.read_return_error)
        else {
            return;
        };

        let Some(tuple) = self.conn_tuple(ctx, &offsets, args.conn) else {
            self.emitter.lookup_miss();
            return;
        };
        self.emitter
            .observed(ctx.pid(), tuple, args.buf, bytes_read as usize, TAG);
    }

    /// Byte count of a call that returned a positive count and a nil error
    fn completed_bytes(
        &self,
        ctx: &ProbeContext,
        bytes: Location,
        error: Location,
    ) -> Option<u64> {
        let memory = self.emitter.memory();
        let (count, err) = match (
            read_location(memory, ctx, bytes),
            read_location(memory, ctx, error),
        ) {
            (Ok(count), Ok(err)) => (count as i64, err),
            (Err(e), _) | (_, Err(e)) => {
                debug!("go tls: pid {} return values unreadable: {}", ctx.pid(), e);
                self.emitter.read_failure();
                return None;
            }
        };
        if count <= 0 || err != 0 {
            trace!("go tls: pid {} n={} err={:#x}", ctx.pid(), count, err);
            self.emitter.failed_call();
            return None;
        }
        Some(count as u64)
    }

    // Close

    pub fn on_close(&self, ctx: &ProbeContext) {
        let Some(offsets) = self.offsets_for(ctx.pid()) else {
            return;
        };
        let conn = match read_location(self.emitter.memory(), ctx, offsets.close_conn_pointer) {
            Ok(conn) => conn,
            Err(e) => {
                debug!("go tls close: pid {} conn unreadable: {}", ctx.pid(), e);
                self.emitter.read_failure();
                return;
            }
        };

        let tuple = self.conn_tuple(ctx, &offsets, conn);
        self.identity
            .forget_runtime_conn(HandleKey::new(ctx.pid(), conn));
        if let Some(tuple) = tuple {
            self.emitter.closed(ctx.pid(), tuple, TAG);
        }
    }

    /// Identity of a `*tls.Conn`, cached after the first walk
    fn conn_tuple(
        &self,
        ctx: &ProbeContext,
        offsets: &GoTlsOffsets,
        conn: u64,
    ) -> Option<ConnTuple> {
        let key = HandleKey::new(ctx.pid(), conn);
        if let Some(tuple) = self.identity.runtime_conn(key) {
            return Some(tuple);
        }

        let sysfd = match self.read_sysfd(ctx.pid(), offsets, conn) {
            Ok(Some(fd)) => fd,
            Ok(None) => return None,
            Err(e) => {
                debug!("go tls: {} layout walk failed: {}", key, e);
                self.emitter.read_failure();
                return None;
            }
        };

        let raw = self.identity.sockets().resolve(ctx.pid(), sysfd)?;
        Some(self.identity.bind_runtime_conn(key, raw))
    }

    /// `conn.(*net.TCPConn).conn.fd.pfd.Sysfd`
    fn read_sysfd(
        &self,
        pid: u32,
        offsets: &GoTlsOffsets,
        conn: u64,
    ) -> MemoryResult<Option<u32>> {
        let layout = &offsets.conn_layout;
        let memory = self.emitter.memory();

        let iface = conn.wrapping_add(layout.tls_conn_inner_conn_offset);
        let iface_type = memory.read_u64(pid, iface)?;
        if iface_type != layout.tcp_conn_interface_type {
            trace!("go tls: conn {:#x} is not a TCP connection", conn);
            return Ok(None);
        }
        let iface_data = memory.read_u64(pid, iface.wrapping_add(8))?;

        let fd_ptr = memory.read_u64(
            pid,
            iface_data
                .wrapping_add(layout.tcp_conn_inner_conn_offset)
                .wrapping_add(layout.conn_fd_offset),
        )?;
        let sysfd = memory.read_i32(
            pid,
            fd_ptr
                .wrapping_add(layout.net_fd_pfd_offset)
                .wrapping_add(layout.fd_sysfd_offset),
        )?;
        if sysfd < 0 {
            return Ok(None);
        }
        Ok(Some(sysfd as u32))
    }

    pub fn snapshots(&self) -> Vec<TableSnapshot> {
        vec![self.reads.snapshot(), self.writes.snapshot()]
    }
}

fn write_args(
    memory: &dyn ProcessMemory,
    ctx: &ProbeContext,
    offsets: &GoTlsOffsets,
) -> LocationResult<GoWriteArgs> {
    Ok(GoWriteArgs {
        conn: read_location(memory, ctx, offsets.write_conn_pointer)?,
        buf: read_location(memory, ctx, offsets.write_buffer.ptr)?,
        len: read_location(memory, ctx, offsets.write_buffer.len)?,
    })
}

fn read_args(
    memory: &dyn ProcessMemory,
    ctx: &ProbeContext,
    offsets: &GoTlsOffsets,
) -> LocationResult<GoReadArgs> {
    Ok(GoReadArgs {
        conn: read_location(memory, ctx, offsets.read_conn_pointer)?,
        buf: read_location(memory, ctx, offsets.read_buffer.ptr)?,
    })
}


#[cfg(test)]
mod tests {
    use super::fixture::*;
    use super::*;
    use crate::adapters::harness::Harness;
    use crate::probe::reg;

    const PID: u32 = 3131;

    fn adapter(h: &Harness) -> (GoTlsAdapter, Arc<OffsetsRegistry>) {
        let registry = Arc::new(OffsetsRegistry::new());
        registry.register(PID, offsets());
        let adapter = GoTlsAdapter::new(
            h.identity.clone(),
            h.emitter.clone(),
            registry.clone(),
            &h.tables,
        );
        (adapter, registry)
    }

    #[test]
    fn test_write_across_threads() {
        let h = Harness::new();
        let (go, _) = adapter(&h);
        h.connect(PID, 9, 45000);
        populate(&h.memory, PID, 12, 9);
        h.memory.insert(PID, 0xd000, b"GET /api HTTP/1.1".to_vec());

        // Goroutine migrates from thread 1 to thread 2 mid-call
        go.on_write(&entry(PID, PID + 1, CONN, 0xd000, 17));
        go.on_write_return(&ret(PID, PID + 2, 17, 0));

        let observed = h.sink.observed();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].tag, LibraryTag::ManagedRuntime);
        assert_eq!(observed[0].len, 17);
        assert_eq!(observed[0].data, b"GET /api HTTP/1.1");
        assert_eq!(observed[0].tuple.sport, 45000);
        assert!(go.writes.is_empty());
    }

    #[test]
    fn test_error_return_emits_nothing() {
        let h = Harness::new();
        let (go, _) = adapter(&h);
        h.connect(PID, 9, 45000);
        populate(&h.memory, PID, 12, 9);

        go.on_write(&entry(PID, PID, CONN, 0xd000, 17));
        go.on_write_return(&ret(PID, PID, 17, 0x0071_8000));

        go.on_read(&entry(PID, PID, CONN, 0xd000, 4096));
        go.on_read_return(&ret(PID, PID, 0, 0));

        assert!(h.sink.is_empty());
        assert!(go.writes.is_empty());
        assert!(go.reads.is_empty());
        assert_eq!(h.failed_calls(), 2);
    }

    #[test]
    fn test_read_emits_bytes_read() {
        let h = Harness::new();
        let (go, _) = adapter(&h);
        h.connect(PID, 9, 45000);
        populate(&h.memory, PID, 13, 9);
        h.memory.insert(PID, 0xe000, b"HTTP/1.1 204 No Content\r\n".to_vec());

        go.on_read(&entry(PID, PID, CONN, 0xe000, 4096));
        go.on_read_return(&ret(PID, PID, 25, 0));

        let observed = h.sink.observed();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].len, 25);
        assert_eq!(observed[0].data.len(), 25);
    }

    #[test]
    fn test_distinct_goroutines_do_not_collide() {
        let h = Harness::new();
        let (go, _) = adapter(&h);
        h.connect(PID, 9, 45000);
        populate(&h.memory, PID, 12, 9);
        h.memory.insert(PID, 0xd000, vec![b'a'; 4]);
        h.memory.insert(PID, 0xd100, vec![b'b'; 6]);

        let other_g = G + 0x1000;
        h.memory.insert_u64(PID, other_g + GOID_OFFSET, 99);

        go.on_write(&entry(PID, PID, CONN, 0xd000, 4));
        go.on_write(&entry(PID, PID, CONN, 0xd100, 6).with_reg(reg::R14, other_g));
        assert_eq!(go.writes.len(), 2);

        go.on_write_return(&ret(PID, PID, 6, 0).with_reg(reg::R14, other_g));
        go.on_write_return(&ret(PID, PID, 4, 0));

        let observed = h.sink.observed();
        assert_eq!(observed.len(), 2);
        assert_eq!(observed[0].data, b"bbbbbb");
        assert_eq!(observed[1].data, b"aaaa");
    }

    #[test]
    fn test_non_tcp_conn_is_not_resolved() {
        let h = Harness::new();
        let (go, _) = adapter(&h);
        populate(&h.memory, PID, 12, 9);
        h.connect(PID, 9, 45000);
        // Replace the interface type word with something else
        h.memory.insert_u64(PID, CONN, 0x0072_0000);
        h.memory.insert(PID, 0xd000, vec![b'a'; 4]);

        go.on_write(&entry(PID, PID, CONN, 0xd000, 4));
        go.on_write_return(&ret(PID, PID, 4, 0));

        assert!(h.sink.is_empty());
        assert!(go.writes.is_empty());
        assert_eq!(h.lookup_misses(), 1);
    }

    #[test]
    fn test_unknown_process_is_ignored() {
        let h = Harness::new();
        let (go, registry) = adapter(&h);
        registry.unregister(PID);

        go.on_write(&entry(PID, PID, CONN, 0xd000, 4));
        assert!(go.writes.is_empty());
    }

    #[test]
    fn test_close() {
        let h = Harness::new();
        let (go, _) = adapter(&h);
        h.connect(PID, 9, 45000);
        populate(&h.memory, PID, 12, 9);
        h.memory.insert(PID, 0xd000, vec![b'a'; 4]);

        go.on_write(&entry(PID, PID, CONN, 0xd000, 4));
        go.on_write_return(&ret(PID, PID, 4, 0));
        assert!(h.identity.runtime_conn(HandleKey::new(PID, CONN)).is_some());

        go.on_close(&ProbeContext::new(PID, PID).with_reg(reg::RAX, CONN));
        let closed = h.sink.closed();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].tag, LibraryTag::ManagedRuntime);
        assert!(h.identity.runtime_conn(HandleKey::new(PID, CONN)).is_none());
    }
}
