//! End-to-end behavior of the capture engine driven through hook dispatch

use httpwatch_capture::adapters::offsets::{ConnLayout, GoroutineIdMetadata, SliceLocation};
use httpwatch_capture::probe::reg;
use httpwatch_capture::{
    CaptureEngine, GoTlsOffsets, HandleKey, HookPoint, Location, ProbeContext, SnapshotMemory,
    SocketTable,
};
use httpwatch_core::{
    CaptureEvent, ChannelSink, CollectingSink, ConfigLoader, ConnTuple, HttpwatchConfig,
    LibraryTag,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

const PID: u32 = 2000;
const TID: u32 = 2001;

struct Rig {
    memory: Arc<SnapshotMemory>,
    sockets: Arc<SocketTable>,
    sink: Arc<CollectingSink>,
    engine: CaptureEngine,
}

fn rig() -> Rig {
    rig_with(HttpwatchConfig::default())
}

fn rig_with(config: HttpwatchConfig) -> Rig {
    let memory = Arc::new(SnapshotMemory::new());
    let sockets = Arc::new(SocketTable::new());
    let sink = Arc::new(CollectingSink::new());
    let engine = CaptureEngine::new(&config, memory.clone(), sockets.clone(), sink.clone());
    Rig {
        memory,
        sockets,
        sink,
        engine,
    }
}

fn client(sport: u16) -> ConnTuple {
    ConnTuple::tcp(
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
        sport,
        IpAddr::V4(Ipv4Addr::new(151, 101, 1, 69)),
        443,
    )
}

fn ctx() -> ProbeContext {
    ProbeContext::new(PID, TID)
}

#[test]
fn test_native_ssl_write_after_set_fd() {
    let rig = rig();
    rig.sockets.bind(PID, 7, client(50123));
    rig.memory.insert(PID, 0x7f00_0000, b"GET / HTTP/1.1".to_vec());

    rig.engine
        .dispatch(HookPoint::SslSetFd, &ctx().with_params(&[0x10, 7]));
    rig.engine.dispatch(
        HookPoint::SslWrite,
        &ctx().with_params(&[0x10, 0x7f00_0000, 14]),
    );
    rig.engine
        .dispatch(HookPoint::SslWriteReturn, &ctx().with_rc(14));

    let observed = rig.sink.observed();
    assert_eq!(observed.len(), 1);
    let event = &observed[0];
    assert_eq!(event.tag, LibraryTag::NativeSsl);
    assert_eq!(event.len, 14);
    assert_eq!(event.data, b"GET / HTTP/1.1");
    assert_eq!(event.tuple, client(50123));
}

#[test]
fn test_ex_variant_zero_count() {
    let rig = rig();
    rig.sockets.bind(PID, 7, client(50123));
    rig.memory.insert(PID, 0x7f00_0000, vec![0u8; 64]);
    rig.memory.insert_u64(PID, 0x7f00_1000, 0);

    rig.engine
        .dispatch(HookPoint::SslSetFd, &ctx().with_params(&[0x10, 7]));
    rig.engine.dispatch(
        HookPoint::SslReadEx,
        &ctx().with_params(&[0x10, 0x7f00_0000, 64, 0x7f00_1000]),
    );
    rig.engine
        .dispatch(HookPoint::SslReadExReturn, &ctx().with_rc(1));

    assert!(rig.sink.is_empty());
}

#[test]
fn test_gnutls_pointer_pair_then_recv() {
    let rig = rig();
    rig.sockets.bind(PID, 5, client(50200));
    rig.memory.insert(PID, 0x5500_0000, vec![b'h'; 100]);

    rig.engine.dispatch(
        HookPoint::GnutlsTransportSetPtr2,
        &ctx().with_params(&[0xabc0, 5, 5]),
    );
    rig.engine.dispatch(
        HookPoint::GnutlsRecordRecv,
        &ctx().with_params(&[0xabc0, 0x5500_0000, 16384]),
    );
    rig.engine
        .dispatch(HookPoint::GnutlsRecordRecvReturn, &ctx().with_rc(100));

    let observed = rig.sink.observed();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].tag, LibraryTag::GnutlsStyle);
    assert_eq!(observed[0].len, 100);
    assert_eq!(observed[0].tuple, client(50200));
}

const G: u64 = 0xc000_0000;
const CONN: u64 = 0xc000_8000;
const ITAB: u64 = 0x0080_0000;

fn go_offsets() -> GoTlsOffsets {
    GoTlsOffsets {
        goroutine_id: GoroutineIdMetadata {
            goroutine_id_offset: 152,
            runtime_g_register: reg::R14,
            runtime_g_in_register: true,
            ..Default::default()
        },
        conn_layout: ConnLayout {
            tcp_conn_interface_type: ITAB,
            fd_sysfd_offset: 16,
            ..Default::default()
        },
        write_conn_pointer: Location::register(reg::RAX),
        write_buffer: SliceLocation {
            ptr: Location::register(reg::RBX),
            len: Location::register(reg::RCX),
            cap: Location::register(reg::RDI),
        },
        write_return_bytes: Location::register(reg::RAX),
        write_return_error: Location::register(reg::RBX),
        close_conn_pointer: Location::register(reg::RAX),
        ..Default::default()
    }
}

fn go_rig() -> Rig {
    let rig = rig();
    rig.engine.register_go_offsets(PID, go_offsets());
    rig.sockets.bind(PID, 11, client(50300));
    rig.memory.insert_u64(PID, G + 152, 41);
    rig.memory.insert_u64(PID, CONN, ITAB);
    rig.memory.insert_u64(PID, CONN + 8, 0xc000_9000);
    rig.memory.insert_u64(PID, 0xc000_9000, 0xc000_a000);
    rig.memory.insert_i32(PID, 0xc000_a000 + 16, 11);
    rig.memory.insert(PID, 0xc001_0000, b"POST /v1/chat HTTP/1.1".to_vec());
    rig
}

fn go_write_entry() -> ProbeContext {
    ctx()
        .with_reg(reg::R14, G)
        .with_reg(reg::RAX, CONN)
        .with_reg(reg::RBX, 0xc001_0000)
        .with_reg(reg::RCX, 22)
}

#[test]
fn test_go_write_with_error_emits_nothing() {
    let rig = go_rig();
    rig.engine.dispatch(HookPoint::GoTlsWrite, &go_write_entry());
    rig.engine.dispatch(
        HookPoint::GoTlsWriteReturn,
        &ctx()
            .with_reg(reg::R14, G)
            .with_reg(reg::RAX, 22)
            .with_reg(reg::RBX, 0x0090_0000),
    );
    assert!(rig.sink.is_empty());
}

#[test]
fn test_go_write_then_close() {
    let rig = go_rig();
    rig.engine.dispatch(HookPoint::GoTlsWrite, &go_write_entry());
    rig.engine.dispatch(
        HookPoint::GoTlsWriteReturn,
        &ctx().with_reg(reg::R14, G).with_reg(reg::RAX, 22),
    );
    rig.engine.dispatch(
        HookPoint::GoTlsClose,
        &ctx().with_reg(reg::RAX, CONN),
    );

    let events = rig.sink.events();
    assert_eq!(events.len(), 2);
    match &events[0] {
        CaptureEvent::ObservedBytes(ev) => {
            assert_eq!(ev.tag, LibraryTag::ManagedRuntime);
            assert_eq!(ev.data, b"POST /v1/chat HTTP/1.1");
            assert_eq!(ev.tuple, client(50300));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(events[1], CaptureEvent::ConnectionClosed(_)));
    assert!(rig
        .engine
        .identity()
        .runtime_conn(HandleKey::new(PID, CONN))
        .is_none());
}

#[test]
fn test_library_load() {
    let rig = rig();
    let mut path = b"/usr/lib/libfoo.so\0".to_vec();
    path.resize(256, 0);
    rig.memory.insert(PID, 0x4000, path);
    let mut other = b"/etc/resolv.conf\0".to_vec();
    other.resize(256, 0);
    rig.memory.insert(PID, 0x8000, other);

    for (hook, ret, addr) in [
        (HookPoint::DoSysOpenat2, HookPoint::DoSysOpenat2Return, 0x4000),
        (HookPoint::DoSysOpen, HookPoint::DoSysOpenReturn, 0x8000),
    ] {
        rig.engine
            .dispatch(hook, &ctx().with_params(&[-100i64 as u64, addr]));
        rig.engine.dispatch(ret, &ctx().with_rc(4));
    }

    let loads = rig.sink.loads();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].path, "/usr/lib/libfoo.so");
    assert_eq!(loads[0].family(), None);
}

#[test]
fn test_exit_without_entry_changes_nothing() {
    let rig = rig();
    let before = rig.engine.table_snapshots();

    for hook in HookPoint::ALL {
        if hook.kind() == httpwatch_capture::HookKind::Return {
            rig.engine.dispatch(hook, &ctx().with_rc(100));
        }
    }

    assert!(rig.sink.is_empty());
    let after = rig.engine.table_snapshots();
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.len, a.len, "table {}", a.name);
        assert_eq!(b.inserts, a.inserts, "table {}", a.name);
    }
}

#[test]
fn test_teardown_emits_once_and_unresolves() {
    let rig = rig();
    rig.sockets.bind(PID, 7, client(50123));
    rig.memory.insert(PID, 0x7f00_0000, vec![b'x'; 8]);
    rig.engine
        .dispatch(HookPoint::SslSetFd, &ctx().with_params(&[0x10, 7]));

    rig.engine
        .dispatch(HookPoint::SslShutdown, &ctx().with_params(&[0x10]));
    assert_eq!(rig.sink.closed().len(), 1);

    // Data calls on the torn-down handle resolve to nothing
    rig.engine.dispatch(
        HookPoint::SslRead,
        &ctx().with_params(&[0x10, 0x7f00_0000, 8]),
    );
    rig.engine
        .dispatch(HookPoint::SslReadReturn, &ctx().with_rc(8));
    assert!(rig.sink.observed().is_empty());
    assert!(rig
        .engine
        .identity()
        .resolve(HandleKey::new(PID, 0x10))
        .is_none());
}

#[test]
fn test_correlation_keys_are_released() {
    let rig = rig();
    rig.sockets.bind(PID, 7, client(50123));
    rig.engine
        .dispatch(HookPoint::SslSetFd, &ctx().with_params(&[0x10, 7]));

    // Success, failure, and unresolvable handle all release the entry
    rig.memory.insert(PID, 0x7f00_0000, vec![b'x'; 8]);
    let cases: [(u64, u64); 3] = [(0x10, 8), (0x10, -1i64 as u64), (0x99, 8)];
    for (handle, rc) in cases {
        rig.engine.dispatch(
            HookPoint::SslWrite,
            &ctx().with_params(&[handle, 0x7f00_0000, 8]),
        );
        rig.engine
            .dispatch(HookPoint::SslWriteReturn, &ctx().with_rc(rc));
    }

    let pending: usize = rig
        .engine
        .table_snapshots()
        .iter()
        .filter(|t| t.name.ends_with("_args"))
        .map(|t| t.len)
        .sum();
    assert_eq!(pending, 0);
    assert_eq!(rig.sink.observed().len(), 1);

    // A second exit finds nothing
    rig.engine
        .dispatch(HookPoint::SslWriteReturn, &ctx().with_rc(8));
    assert_eq!(rig.sink.observed().len(), 1);
    assert_eq!(
        rig.engine
            .metrics()
            .capture
            .lookup_misses
            .load(Ordering::Relaxed),
        2
    );
}

#[test]
fn test_resolve_is_idempotent() {
    let rig = rig();
    rig.sockets.bind(PID, 7, client(50123));
    rig.engine
        .dispatch(HookPoint::SslSetFd, &ctx().with_params(&[0x10, 7]));

    let key = HandleKey::new(PID, 0x10);
    let first = rig.engine.identity().resolve(key);
    let second = rig.engine.identity().resolve(key);
    assert!(first.is_some());
    assert_eq!(first, second);
}

#[test]
fn test_config_file_drives_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[capture]\nnative_ssl = false\nmax_capture_bytes = 4\n",
    )
    .unwrap();
    let config = ConfigLoader::load_from_file(&path).unwrap();

    let rig = rig_with(config);
    rig.sockets.bind(PID, 5, client(50200));
    rig.memory.insert(PID, 0x5500_0000, b"HTTP/1.1 200 OK".to_vec());

    rig.engine
        .dispatch(HookPoint::SslSetFd, &ctx().with_params(&[0x10, 5]));
    rig.engine.dispatch(
        HookPoint::GnutlsTransportSetInt2,
        &ctx().with_params(&[0x20, 5, 5]),
    );
    rig.engine.dispatch(
        HookPoint::GnutlsRecordRecv,
        &ctx().with_params(&[0x20, 0x5500_0000, 100]),
    );
    rig.engine
        .dispatch(HookPoint::GnutlsRecordRecvReturn, &ctx().with_rc(15));

    let observed = rig.sink.observed();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].data, b"HTTP");
    assert_eq!(observed[0].len, 15);
    assert!(rig
        .engine
        .identity()
        .session(HandleKey::new(PID, 0x10))
        .is_none());
}

#[tokio::test]
async fn test_events_stream_through_channel() {
    let memory = Arc::new(SnapshotMemory::new());
    let sockets = Arc::new(SocketTable::new());
    let (sink, mut rx) = ChannelSink::channel(8);
    let engine = CaptureEngine::new(
        &HttpwatchConfig::default(),
        memory.clone(),
        sockets.clone(),
        Arc::new(sink),
    );

    sockets.bind(PID, 7, client(50123));
    memory.insert(PID, 0x7f00_0000, b"GET /health HTTP/1.1".to_vec());
    engine.dispatch(HookPoint::SslSetFd, &ctx().with_params(&[0x10, 7]));
    engine.dispatch(
        HookPoint::SslWrite,
        &ctx().with_params(&[0x10, 0x7f00_0000, 20]),
    );
    engine.dispatch(HookPoint::SslWriteReturn, &ctx().with_rc(20));
    engine.dispatch(HookPoint::SslShutdown, &ctx().with_params(&[0x10]));

    let first = rx.recv().await.unwrap();
    assert_eq!(first.event_type(), "observed_bytes");
    assert_eq!(first.pid(), PID);
    let second = rx.recv().await.unwrap();
    assert_eq!(second.event_type(), "connection_closed");
}
