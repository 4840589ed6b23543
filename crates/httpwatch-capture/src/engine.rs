//! Capture engine
//!
//! Owns the shared tables and the adapters, and routes each hook invocation
//! delivered by the attachment layer to its handler.

use crate::adapters::{
    Emitter, GnutlsAdapter, GoTlsAdapter, GoTlsOffsets, NativeSslAdapter, OffsetsRegistry,
    SslCallTables,
};
use crate::filter::PidFilter;
use crate::identity::IdentityResolver;
use crate::libload::LibraryLoadDetector;
use crate::memory::ProcessMemory;
use crate::plaintext::PlaintextCapture;
use crate::probe::{HookPoint, ProbeContext};
use crate::socket::SockResolver;
use httpwatch_core::config::CaptureSettings;
use httpwatch_core::{
    ConnTuple, EventSink, HttpwatchConfig, MetricsCollector, TableSnapshot, Telemetry,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, trace};

pub struct CaptureEngine {
    settings: CaptureSettings,
    filter: PidFilter,
    metrics: Arc<MetricsCollector>,
    identity: Arc<IdentityResolver>,
    calls: Arc<SslCallTables>,
    offsets: Arc<OffsetsRegistry>,
    native_ssl: NativeSslAdapter,
    gnutls: GnutlsAdapter,
    go_tls: GoTlsAdapter,
    plaintext: PlaintextCapture,
    libload: LibraryLoadDetector,
}

impl CaptureEngine {
    pub fn new(
        config: &HttpwatchConfig,
        memory: Arc<dyn ProcessMemory>,
        sockets: Arc<dyn SockResolver>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let ephemeral = config.ports.range();
        let tables = &config.tables;

        let identity = Arc::new(IdentityResolver::new(sockets, ephemeral, tables));
        let emitter = Arc::new(Emitter::new(
            memory.clone(),
            sink.clone(),
            metrics.clone(),
            config.capture.max_capture_bytes,
        ));
        let calls = Arc::new(SslCallTables::new(tables));
        let offsets = Arc::new(OffsetsRegistry::new());

        info!(
            "Capture engine: native_ssl={} gnutls={} go_tls={} plaintext={} library_loads={}",
            config.capture.native_ssl,
            config.capture.gnutls,
            config.capture.go_tls,
            config.capture.plaintext,
            config.capture.library_loads
        );

        Self {
            settings: config.capture.clone(),
            filter: PidFilter::from_include(&config.capture.pid_filter),
            native_ssl: NativeSslAdapter::new(
                identity.clone(),
                emitter.clone(),
                calls.clone(),
                tables,
            ),
            gnutls: GnutlsAdapter::new(identity.clone(), emitter.clone(), calls.clone()),
            go_tls: GoTlsAdapter::new(identity.clone(), emitter.clone(), offsets.clone(), tables),
            plaintext: PlaintextCapture::new(emitter, ephemeral, config.capture.https_port),
            libload: LibraryLoadDetector::new(memory, sink, metrics.clone(), tables.open_at),
            metrics,
            identity,
            calls,
            offsets,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Counters shared with the socket tracer
    pub fn telemetry(&self) -> &Telemetry {
        &self.metrics.telemetry
    }

    pub fn identity(&self) -> &Arc<IdentityResolver> {
        &self.identity
    }

    pub fn filter(&self) -> &PidFilter {
        &self.filter
    }

    /// Make a Go binary's layout known before its probes fire
    pub fn register_go_offsets(&self, pid: u32, offsets: GoTlsOffsets) {
        info!("Registered Go TLS offsets for pid {}", pid);
        self.offsets.register(pid, offsets);
    }

    pub fn unregister_go_offsets(&self, pid: u32) -> bool {
        self.offsets.unregister(pid)
    }

    fn enabled(&self, hook: HookPoint) -> bool {
        use HookPoint::*;
        match hook {
            SslDoHandshake | SslDoHandshakeReturn | SslConnect | SslConnectReturn | SslSetFd
            | BioNewSocket | BioNewSocketReturn | SslSetBio | SslRead | SslReadReturn
            | SslWrite | SslWriteReturn | SslReadEx | SslReadExReturn | SslWriteEx
            | SslWriteExReturn | SslShutdown => self.settings.native_ssl,
            GnutlsHandshake | GnutlsHandshakeReturn | GnutlsTransportSetInt2
            | GnutlsTransportSetPtr | GnutlsTransportSetPtr2 | GnutlsRecordRecv
            | GnutlsRecordRecvReturn | GnutlsRecordSend | GnutlsRecordSendReturn | GnutlsBye
            | GnutlsDeinit => self.settings.gnutls,
            GoTlsWrite | GoTlsWriteReturn | GoTlsRead | GoTlsReadReturn | GoTlsClose => {
                self.settings.go_tls
            }
            DoSysOpen | DoSysOpenReturn | DoSysOpenat2 | DoSysOpenat2Return => {
                self.settings.library_loads
            }
        }
    }

    /// Run the handler for one hook invocation
    pub fn dispatch(&self, hook: HookPoint, ctx: &ProbeContext) {
        if !self.enabled(hook) {
            return;
        }
        if !self.filter.should_trace(ctx.pid()) {
            self.metrics
                .capture
                .pid_filtered
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        trace!("{} pid_tgid={:#x}", hook, ctx.pid_tgid);

        use HookPoint::*;
        match hook {
            SslDoHandshake | SslConnect => self.native_ssl.on_handshake(ctx),
            SslDoHandshakeReturn | SslConnectReturn => self.native_ssl.on_handshake_return(ctx),
            SslSetFd => self.native_ssl.on_set_fd(ctx),
            BioNewSocket => self.native_ssl.on_bio_new_socket(ctx),
            BioNewSocketReturn => self.native_ssl.on_bio_new_socket_return(ctx),
            SslSetBio => self.native_ssl.on_set_bio(ctx),
            SslRead => self.native_ssl.on_read(ctx),
            SslReadReturn => self.native_ssl.on_read_return(ctx),
            SslWrite => self.native_ssl.on_write(ctx),
            SslWriteReturn => self.native_ssl.on_write_return(ctx),
            SslReadEx => self.native_ssl.on_read_ex(ctx),
            SslReadExReturn => self.native_ssl.on_read_ex_return(ctx),
            SslWriteEx => self.native_ssl.on_write_ex(ctx),
            SslWriteExReturn => self.native_ssl.on_write_ex_return(ctx),
            SslShutdown => self.native_ssl.on_shutdown(ctx),

            GnutlsHandshake => self.gnutls.on_handshake(ctx),
            GnutlsHandshakeReturn => self.gnutls.on_handshake_return(ctx),
            GnutlsTransportSetInt2 | GnutlsTransportSetPtr | GnutlsTransportSetPtr2 => {
                self.gnutls.on_transport_set(ctx)
            }
            GnutlsRecordRecv => self.gnutls.on_record_recv(ctx),
            GnutlsRecordRecvReturn => self.gnutls.on_record_recv_return(ctx),
            GnutlsRecordSend => self.gnutls.on_record_send(ctx),
            GnutlsRecordSendReturn => self.gnutls.on_record_send_return(ctx),
            GnutlsBye | GnutlsDeinit => self.gnutls.on_goodbye(ctx),

            GoTlsWrite => self.go_tls.on_write(ctx),
            GoTlsWriteReturn => self.go_tls.on_write_return(ctx),
            GoTlsRead => self.go_tls.on_read(ctx),
            GoTlsReadReturn => self.go_tls.on_read_return(ctx),
            GoTlsClose => self.go_tls.on_close(ctx),

            DoSysOpen | DoSysOpenat2 => self.libload.on_open(ctx),
            DoSysOpenReturn | DoSysOpenat2Return => self.libload.on_open_return(ctx),
        }
    }

    /// `tcp_sendmsg` on a thread: binds a session that is mid-handshake
    pub fn tcp_sendmsg(&self, pid_tgid: u64, tuple: ConnTuple) -> bool {
        if !self.filter.should_trace((pid_tgid >> 32) as u32) {
            return false;
        }
        self.identity.bind_from_handshake(pid_tgid, tuple)
    }

    /// Feed one captured frame to the plaintext path
    pub fn handle_packet(&self, frame: &[u8]) -> bool {
        if !self.settings.plaintext {
            return false;
        }
        self.plaintext.handle_packet(frame)
    }

    pub fn table_snapshots(&self) -> Vec<TableSnapshot> {
        let mut tables = self.identity.snapshots();
        tables.extend(self.calls.snapshots());
        tables.extend(self.native_ssl.snapshots());
        tables.extend(self.go_tls.snapshots());
        tables.push(self.libload.snapshot());
        tables
    }

    pub fn to_prometheus(&self) -> String {
        self.metrics.to_prometheus(&self.table_snapshots())
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.metrics.to_json(&self.table_snapshots())
    }
}
