//! Native SSL adapter (OpenSSL, BoringSSL, LibreSSL)
//!
//! Probes:
//! - `SSL_do_handshake` / `SSL_connect`: handshake window for the calling thread
//! - `SSL_set_fd`: direct descriptor association
//! - `BIO_new_socket` + `SSL_set_bio`: descriptor association through a socket BIO
//! - `SSL_read` / `SSL_write`: byte count in the return value
//! - `SSL_read_ex` / `SSL_write_ex`: success code returned, byte count in `*written`
//! - `SSL_shutdown`: teardown

use super::{Emitter, SslCallArgs, SslCallTables};
use crate::correlation::{CallKey, CallTable};
use crate::identity::{HandleKey, IdentityResolver};
use crate::probe::ProbeContext;
use httpwatch_core::config::TableSettings;
use httpwatch_core::{LibraryTag, TableSnapshot};
use std::sync::Arc;
use tracing::{debug, trace};

const TAG: LibraryTag = LibraryTag::NativeSsl;

/// Arguments of an `_ex` data call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SslExCallArgs {
    pub handle: u64,
    pub buf: u64,
    /// `size_t *` receiving the byte count
    pub size_out: u64,
}

pub struct NativeSslAdapter {
    identity: Arc<IdentityResolver>,
    emitter: Arc<Emitter>,
    calls: Arc<SslCallTables>,
    read_ex: CallTable<SslExCallArgs>,
    write_ex: CallTable<SslExCallArgs>,
    bio_new_socket: CallTable<u32>,
}

impl NativeSslAdapter {
    pub fn new(
        identity: Arc<IdentityResolver>,
        emitter: Arc<Emitter>,
        calls: Arc<SslCallTables>,
        tables: &TableSettings,
    ) -> Self {
        Self {
            identity,
            emitter,
            calls,
            read_ex: CallTable::new("ssl_read_ex_args", tables.calls),
            write_ex: CallTable::new("ssl_write_ex_args", tables.calls),
            bio_new_socket: CallTable::new("bio_new_socket_args", tables.calls),
        }
    }

    // Handshake

    /// `int SSL_do_handshake(SSL *s)` and `int SSL_connect(SSL *s)`
    pub fn on_handshake(&self, ctx: &ProbeContext) {
        self.identity.begin_handshake(ctx.pid_tgid, ctx.param(1));
    }

    pub fn on_handshake_return(&self, ctx: &ProbeContext) {
        self.identity.end_handshake(ctx.pid_tgid);
    }

    // Descriptor association

    /// `int SSL_set_fd(SSL *s, int fd)`
    pub fn on_set_fd(&self, ctx: &ProbeContext) {
        let session = HandleKey::new(ctx.pid(), ctx.param(1));
        let fd = ctx.param(2) as u32;
        debug!("SSL_set_fd: ctx={} fd={}", session, fd);
        self.identity.bind_fd(session, fd);
    }

    /// `BIO *BIO_new_socket(int sock, int close_flag)`
    pub fn on_bio_new_socket(&self, ctx: &ProbeContext) {
        let fd = ctx.param(1) as u32;
        trace!("BIO_new_socket: pid_tgid={:#x} fd={}", ctx.pid_tgid, fd);
        self.bio_new_socket.begin(CallKey::os_thread(ctx.pid_tgid), fd);
    }

    pub fn on_bio_new_socket_return(&self, ctx: &ProbeContext) {
        let Some(fd) = self.bio_new_socket.end(CallKey::os_thread(ctx.pid_tgid)) else {
            return;
        };
        let bio = ctx.rc();
        if bio == 0 {
            return;
        }
        self.identity.track_bio(HandleKey::new(ctx.pid(), bio), fd);
    }

    /// `void SSL_set_bio(SSL *s, BIO *rbio, BIO *wbio)`
    pub fn on_set_bio(&self, ctx: &ProbeContext) {
        let session = HandleKey::new(ctx.pid(), ctx.param(1));
        let bio = HandleKey::new(ctx.pid(), ctx.param(2));
        if self.identity.attach_bio(session, bio) {
            debug!("SSL_set_bio: ctx={} bio={}", session, bio);
        }
    }

    // Data calls

    /// `int SSL_read(SSL *s, void *buf, int num)`
    pub fn on_read(&self, ctx: &ProbeContext) {
        self.calls
            .read
            .begin(CallKey::os_thread(ctx.pid_tgid), ssl_call_args(ctx));
    }

    pub fn on_read_return(&self, ctx: &ProbeContext) {
        let args = self.calls.read.end(CallKey::os_thread(ctx.pid_tgid));
        // int return value
        let len = ctx.rc() as i32 as i64;
        complete_ssl_call(&self.identity, &self.emitter, ctx.pid(), args, len, TAG);
    }

    /// `int SSL_write(SSL *s, const void *buf, int num)`
    pub fn on_write(&self, ctx: &ProbeContext) {
        self.calls
            .write
            .begin(CallKey::os_thread(ctx.pid_tgid), ssl_call_args(ctx));
    }

    pub fn on_write_return(&self, ctx: &ProbeContext) {
        let args = self.calls.write.end(CallKey::os_thread(ctx.pid_tgid));
        let len = ctx.rc() as i32 as i64;
        complete_ssl_call(&self.identity, &self.emitter, ctx.pid(), args, len, TAG);
    }

    /// `int SSL_read_ex(SSL *s, void *buf, size_t num, size_t *readbytes)`
    pub fn on_read_ex(&self, ctx: &ProbeContext) {
        self.read_ex
            .begin(CallKey::os_thread(ctx.pid_tgid), ssl_ex_call_args(ctx));
    }

    pub fn on_read_ex_return(&self, ctx: &ProbeContext) {
        let args = self.read_ex.end(CallKey::os_thread(ctx.pid_tgid));
        self.complete_ex_call(ctx, args);
    }

    /// `int SSL_write_ex(SSL *s, const void *buf, size_t num, size_t *written)`
    pub fn on_write_ex(&self, ctx: &ProbeContext) {
        self.write_ex
            .begin(CallKey::os_thread(ctx.pid_tgid), ssl_ex_call_args(ctx));
    }

    pub fn on_write_ex_return(&self, ctx: &ProbeContext) {
        let args = self.write_ex.end(CallKey::os_thread(ctx.pid_tgid));
        self.complete_ex_call(ctx, args);
    }

    fn complete_ex_call(&self, ctx: &ProbeContext, args: Option<SslExCallArgs>) {
        let pid = ctx.pid();
        let Some(args) = args else {
            self.emitter.lookup_miss();
            return;
        };

        let return_code = ctx.rc() as i32;
        if return_code != 1 {
            trace!("SSL_*_ex failed: pid={} ret={}", pid, return_code);
            self.emitter.failed_call();
            return;
        }

        if args.size_out == 0 {
            debug!("SSL_*_ex: pid={} size out param is null", pid);
            self.emitter.read_failure();
            return;
        }

        let count = match self.emitter.memory().read_u64(pid, args.size_out) {
            Ok(count) => count,
            Err(e) => {
                debug!("SSL_*_ex: pid={} size out param unreadable: {}", pid, e);
                self.emitter.read_failure();
                return;
            }
        };
        if count == 0 {
            trace!("SSL_*_ex: pid={} zero bytes", pid);
            self.emitter.failed_call();
            return;
        }

        let Some(tuple) = self.identity.resolve(HandleKey::new(pid, args.handle)) else {
            debug!("SSL_*_ex: pid={} ctx={:#x}: no conn tuple", pid, args.handle);
            self.emitter.lookup_miss();
            return;
        };

        self.emitter
            .observed(pid, tuple, args.buf, count as usize, TAG);
    }

    // Teardown

    /// `int SSL_shutdown(SSL *s)`
    pub fn on_shutdown(&self, ctx: &ProbeContext) {
        let session = HandleKey::new(ctx.pid(), ctx.param(1));
        debug!("SSL_shutdown: ctx={}", session);
        if let Some(tuple) = self.identity.close(session) {
            self.emitter.closed(ctx.pid(), tuple, TAG);
        }
    }

    pub fn snapshots(&self) -> Vec<TableSnapshot> {
        vec![
            self.read_ex.snapshot(),
            self.write_ex.snapshot(),
            self.bio_new_socket.snapshot(),
        ]
    }
}

fn ssl_call_args(ctx: &ProbeContext) -> SslCallArgs {
    SslCallArgs {
        handle: ctx.param(1),
        buf: ctx.param(2),
    }
}

fn ssl_ex_call_args(ctx: &ProbeContext) -> SslExCallArgs {
    SslExCallArgs {
        handle: ctx.param(1),
        buf: ctx.param(2),
        size_out: ctx.param(4),
    }
}

/// Exit half of a read/write call whose byte count is the return value.
/// The correlation entry has already been claimed by the caller.
pub(crate) fn complete_ssl_call(
    identity: &IdentityResolver,
    emitter: &Emitter,
    pid: u32,
    args: Option<SslCallArgs>,
    len: i64,
    tag: LibraryTag,
) {
    let Some(args) = args else {
        emitter.lookup_miss();
        return;
    };

    if len <= 0 {
        trace!("[{}] pid={} ret={}", tag, pid, len);
        emitter.failed_call();
        return;
    }

    let Some(tuple) = identity.resolve(HandleKey::new(pid, args.handle)) else {
        debug!("[{}] pid={} ctx={:#x}: no conn tuple", tag, pid, args.handle);
        emitter.lookup_miss();
        return;
    };

    emitter.observed(pid, tuple, args.buf, len as usize, tag);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::harness::Harness;
    use crate::correlation::CallKey;

    const PID: u32 = 4242;
    const TID: u32 = 4243;

    fn adapter(h: &Harness) -> NativeSslAdapter {
        NativeSslAdapter::new(h.identity.clone(), h.emitter.clone(), h.calls.clone(), &h.tables)
    }

    fn ctx() -> ProbeContext {
        ProbeContext::new(PID, TID)
    }

    #[test]
    fn test_set_fd_then_write() {
        let h = Harness::new();
        let ssl = adapter(&h);
        h.connect(PID, 7, 50000);
        h.memory.insert(PID, 0x5000, b"GET / HTTP/1.1".to_vec());

        ssl.on_set_fd(&ctx().with_params(&[0x10, 7]));
        ssl.on_write(&ctx().with_params(&[0x10, 0x5000, 14]));
        ssl.on_write_return(&ctx().with_rc(14));

        let observed = h.sink.observed();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].data, b"GET / HTTP/1.1");
        assert_eq!(observed[0].len, 14);
        assert_eq!(observed[0].tag, LibraryTag::NativeSsl);
        assert_eq!(observed[0].pid, PID);
        assert_eq!(observed[0].tuple.sport, 50000);
        assert!(!h.calls.write.is_pending(CallKey::os_thread(ctx().pid_tgid)));
    }

    #[test]
    fn test_failed_read_releases_entry() {
        let h = Harness::new();
        let ssl = adapter(&h);
        h.connect(PID, 7, 50000);
        ssl.on_set_fd(&ctx().with_params(&[0x10, 7]));

        ssl.on_read(&ctx().with_params(&[0x10, 0x5000, 100]));
        ssl.on_read_return(&ctx().with_rc(-1i64 as u64));

        assert!(h.sink.is_empty());
        assert!(h.calls.read.is_empty());
        assert_eq!(h.failed_calls(), 1);
    }

    #[test]
    fn test_unresolvable_handle_releases_entry() {
        let h = Harness::new();
        let ssl = adapter(&h);
        h.memory.insert(PID, 0x5000, vec![b'x'; 10]);

        ssl.on_read(&ctx().with_params(&[0x99, 0x5000, 10]));
        ssl.on_read_return(&ctx().with_rc(10));

        assert!(h.sink.is_empty());
        assert!(h.calls.read.is_empty());
        assert_eq!(h.lookup_misses(), 1);
    }

    #[test]
    fn test_exit_without_entry() {
        let h = Harness::new();
        let ssl = adapter(&h);
        ssl.on_write_return(&ctx().with_rc(14));
        ssl.on_read_ex_return(&ctx().with_rc(1));
        ssl.on_bio_new_socket_return(&ctx().with_rc(0xb10));

        assert!(h.sink.is_empty());
        assert_eq!(h.lookup_misses(), 2);
        assert_eq!(h.identity.bio_fd(HandleKey::new(PID, 0xb10)), None);
    }

    #[test]
    fn test_bio_route() {
        let h = Harness::new();
        let ssl = adapter(&h);
        h.connect(PID, 5, 51000);
        h.memory.insert(PID, 0x6000, b"HTTP/1.1 200 OK".to_vec());

        ssl.on_bio_new_socket(&ctx().with_params(&[5, 0]));
        ssl.on_bio_new_socket_return(&ctx().with_rc(0xb10));
        ssl.on_set_bio(&ctx().with_params(&[0x20, 0xb10, 0xb10]));
        assert_eq!(h.identity.bio_fd(HandleKey::new(PID, 0xb10)), None);

        ssl.on_read(&ctx().with_params(&[0x20, 0x6000, 4096]));
        ssl.on_read_return(&ctx().with_rc(15));

        let observed = h.sink.observed();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].tuple.sport, 51000);
    }

    #[test]
    fn test_null_bio_is_not_tracked() {
        let h = Harness::new();
        let ssl = adapter(&h);
        ssl.on_bio_new_socket(&ctx().with_params(&[5, 0]));
        ssl.on_bio_new_socket_return(&ctx().with_rc(0));
        assert!(!ssl.bio_new_socket.is_pending(CallKey::os_thread(ctx().pid_tgid)));
    }

    #[test]
    fn test_ex_variants() {
        let h = Harness::new();
        let ssl = adapter(&h);
        h.connect(PID, 7, 50000);
        h.memory.insert(PID, 0x5000, b"POST /x HTTP/1.1".to_vec());
        h.memory.insert_u64(PID, 0x7000, 16);
        ssl.on_set_fd(&ctx().with_params(&[0x10, 7]));

        ssl.on_write_ex(&ctx().with_params(&[0x10, 0x5000, 16, 0x7000]));
        ssl.on_write_ex_return(&ctx().with_rc(1));

        let observed = h.sink.observed();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].len, 16);
        assert_eq!(observed[0].data, b"POST /x HTTP/1.1");
    }

    #[test]
    fn test_ex_zero_count_emits_nothing() {
        let h = Harness::new();
        let ssl = adapter(&h);
        h.connect(PID, 7, 50000);
        h.memory.insert(PID, 0x5000, vec![0u8; 32]);
        h.memory.insert_u64(PID, 0x7000, 0);
        ssl.on_set_fd(&ctx().with_params(&[0x10, 7]));

        ssl.on_read_ex(&ctx().with_params(&[0x10, 0x5000, 32, 0x7000]));
        ssl.on_read_ex_return(&ctx().with_rc(1));

        assert!(h.sink.is_empty());
        assert!(ssl.read_ex.is_empty());
    }

    #[test]
    fn test_ex_failure_code_and_null_out_param() {
        let h = Harness::new();
        let ssl = adapter(&h);
        h.connect(PID, 7, 50000);
        h.memory.insert_u64(PID, 0x7000, 8);
        ssl.on_set_fd(&ctx().with_params(&[0x10, 7]));

        ssl.on_read_ex(&ctx().with_params(&[0x10, 0x5000, 32, 0x7000]));
        ssl.on_read_ex_return(&ctx().with_rc(0));

        ssl.on_read_ex(&ctx().with_params(&[0x10, 0x5000, 32, 0]));
        ssl.on_read_ex_return(&ctx().with_rc(1));

        assert!(h.sink.is_empty());
        assert!(ssl.read_ex.is_empty());
    }

    #[test]
    fn test_shutdown_closes_once() {
        let h = Harness::new();
        let ssl = adapter(&h);
        h.connect(PID, 7, 50000);
        ssl.on_set_fd(&ctx().with_params(&[0x10, 7]));

        ssl.on_shutdown(&ctx().with_params(&[0x10]));
        ssl.on_shutdown(&ctx().with_params(&[0x10]));

        assert_eq!(h.sink.closed().len(), 1);
        assert!(h.identity.resolve(HandleKey::new(PID, 0x10)).is_none());
    }

    #[test]
    fn test_handshake_window() {
        let h = Harness::new();
        let ssl = adapter(&h);
        ssl.on_handshake(&ctx().with_params(&[0x30]));
        assert_eq!(h.identity.handshake_in_progress(ctx().pid_tgid), Some(0x30));
        ssl.on_handshake_return(&ctx());
        assert_eq!(h.identity.handshake_in_progress(ctx().pid_tgid), None);
    }

    #[test]
    fn test_truncates_to_capture_size() {
        let h = Harness::new();
        let ssl = adapter(&h);
        h.connect(PID, 7, 50000);
        h.memory.insert(PID, 0x5000, vec![b'a'; 1000]);
        ssl.on_set_fd(&ctx().with_params(&[0x10, 7]));

        ssl.on_write(&ctx().with_params(&[0x10, 0x5000, 1000]));
        ssl.on_write_return(&ctx().with_rc(1000));

        let observed = h.sink.observed();
        assert_eq!(observed[0].len, 1000);
        assert_eq!(observed[0].data.len(), 160);
        assert!(observed[0].is_truncated());
    }
}
