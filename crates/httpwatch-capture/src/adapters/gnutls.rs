//! GnuTLS-style adapter
//!
//! Same shape as the native SSL adapter with different entry points. The
//! transport descriptor is announced through `gnutls_transport_set_*`; the
//! plain `gnutls_transport_set_int` is a macro over `set_int2` and needs no
//! probe of its own.

use super::openssl::complete_ssl_call;
use super::{Emitter, SslCallArgs, SslCallTables};
use crate::correlation::CallKey;
use crate::identity::{HandleKey, IdentityResolver};
use crate::probe::ProbeContext;
use httpwatch_core::LibraryTag;
use std::sync::Arc;
use tracing::debug;

const TAG: LibraryTag = LibraryTag::GnutlsStyle;

pub struct GnutlsAdapter {
    identity: Arc<IdentityResolver>,
    emitter: Arc<Emitter>,
    calls: Arc<SslCallTables>,
}

impl GnutlsAdapter {
    pub fn new(
        identity: Arc<IdentityResolver>,
        emitter: Arc<Emitter>,
        calls: Arc<SslCallTables>,
    ) -> Self {
        Self {
            identity,
            emitter,
            calls,
        }
    }

    /// `int gnutls_handshake(gnutls_session_t session)`
    pub fn on_handshake(&self, ctx: &ProbeContext) {
        self.identity.begin_handshake(ctx.pid_tgid, ctx.param(1));
    }

    pub fn on_handshake_return(&self, ctx: &ProbeContext) {
        self.identity.end_handshake(ctx.pid_tgid);
    }

    /// `void gnutls_transport_set_int2(gnutls_session_t session, int recv_fd, int send_fd)`
    ///
    /// Also covers `set_ptr` and `set_ptr2`: the transport pointer is the
    /// descriptor cast to a pointer, and the receive side is taken.
    pub fn on_transport_set(&self, ctx: &ProbeContext) {
        let session = HandleKey::new(ctx.pid(), ctx.param(1));
        let fd = ctx.param(2) as i32;
        if fd < 0 {
            debug!("gnutls transport: session {} negative fd {}", session, fd);
            return;
        }
        debug!("gnutls transport: session {} fd {}", session, fd);
        self.identity.bind_fd(session, fd as u32);
    }

    /// `ssize_t gnutls_record_recv(gnutls_session_t session, void *data, size_t data_size)`
    pub fn on_record_recv(&self, ctx: &ProbeContext) {
        self.calls
            .read
            .begin(CallKey::os_thread(ctx.pid_tgid), record_args(ctx));
    }

    pub fn on_record_recv_return(&self, ctx: &ProbeContext) {
        let args = self.calls.read.end(CallKey::os_thread(ctx.pid_tgid));
        let len = ctx.rc() as i64;
        complete_ssl_call(&self.identity, &self.emitter, ctx.pid(), args, len, TAG);
    }

    /// `ssize_t gnutls_record_send(gnutls_session_t session, const void *data, size_t data_size)`
    pub fn on_record_send(&self, ctx: &ProbeContext) {
        self.calls
            .write
            .begin(CallKey::os_thread(ctx.pid_tgid), record_args(ctx));
    }

    pub fn on_record_send_return(&self, ctx: &ProbeContext) {
        let args = self.calls.write.end(CallKey::os_thread(ctx.pid_tgid));
        let len = ctx.rc() as i64;
        complete_ssl_call(&self.identity, &self.emitter, ctx.pid(), args, len, TAG);
    }

    /// `gnutls_bye` and `gnutls_deinit` both end the session
    pub fn on_goodbye(&self, ctx: &ProbeContext) {
        let session = HandleKey::new(ctx.pid(), ctx.param(1));
        debug!("gnutls goodbye: session {}", session);
        if let Some(tuple) = self.identity.close(session) {
            self.emitter.closed(ctx.pid(), tuple, TAG);
        }
    }
}

fn record_args(ctx: &ProbeContext) -> SslCallArgs {
    SslCallArgs {
        handle: ctx.param(1),
        buf: ctx.param(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::harness::Harness;

    const PID: u32 = 777;

    fn adapter(h: &Harness) -> GnutlsAdapter {
        GnutlsAdapter::new(h.identity.clone(), h.emitter.clone(), h.calls.clone())
    }

    fn ctx() -> ProbeContext {
        ProbeContext::new(PID, PID)
    }

    #[test]
    fn test_set_ptr2_then_recv() {
        let h = Harness::new();
        let tls = adapter(&h);
        h.connect(PID, 5, 40000);
        h.memory.insert(PID, 0x9000, vec![b'r'; 100]);

        tls.on_transport_set(&ctx().with_params(&[0xabc, 5, 5]));
        tls.on_record_recv(&ctx().with_params(&[0xabc, 0x9000, 4096]));
        tls.on_record_recv_return(&ctx().with_rc(100));

        let observed = h.sink.observed();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].len, 100);
        assert_eq!(observed[0].data.len(), 100);
        assert_eq!(observed[0].tag, LibraryTag::GnutlsStyle);
        assert_eq!(observed[0].tuple.sport, 40000);
        assert!(h.calls.read.is_empty());
    }

    #[test]
    fn test_negative_return_is_dropped() {
        let h = Harness::new();
        let tls = adapter(&h);
        h.connect(PID, 5, 40000);
        tls.on_transport_set(&ctx().with_params(&[0xabc, 5]));

        // GNUTLS_E_AGAIN
        tls.on_record_send(&ctx().with_params(&[0xabc, 0x9000, 10]));
        tls.on_record_send_return(&ctx().with_rc(-28i64 as u64));

        assert!(h.sink.is_empty());
        assert!(h.calls.write.is_empty());
        assert_eq!(h.failed_calls(), 1);
    }

    #[test]
    fn test_negative_fd_is_ignored() {
        let h = Harness::new();
        let tls = adapter(&h);
        tls.on_transport_set(&ctx().with_params(&[0xabc, -1i64 as u64]));
        assert!(h.identity.session(HandleKey::new(PID, 0xabc)).is_none());
    }

    #[test]
    fn test_goodbye_then_deinit() {
        let h = Harness::new();
        let tls = adapter(&h);
        h.connect(PID, 5, 40000);
        tls.on_transport_set(&ctx().with_params(&[0xabc, 5]));

        tls.on_goodbye(&ctx().with_params(&[0xabc]));
        tls.on_goodbye(&ctx().with_params(&[0xabc]));

        let closed = h.sink.closed();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].tag, LibraryTag::GnutlsStyle);
        assert!(h.identity.session(HandleKey::new(PID, 0xabc)).is_none());
    }

    #[test]
    fn test_handshake_window() {
        let h = Harness::new();
        let tls = adapter(&h);
        tls.on_handshake(&ctx().with_params(&[0xabc]));
        assert_eq!(h.identity.handshake_in_progress(ctx().pid_tgid), Some(0xabc));
        tls.on_handshake_return(&ctx());
        assert!(h.identity.handshake_in_progress(ctx().pid_tgid).is_none());
    }
}
