//! Replay of recorded probe traces
//!
//! A trace is JSONL, one record per line, in the order the attachment layer
//! saw things happen. Memory and socket records set up the world the hooks
//! read from; hook, packet and send records drive the engine. Every event
//! the engine emits is written out as one JSONL line.

use chrono::{DateTime, Utc};
use httpwatch_capture::probe::reg;
use httpwatch_capture::{
    CaptureEngine, GoTlsOffsets, HookPoint, ProbeContext, SnapshotMemory, SocketTable,
};
use httpwatch_core::{CaptureEvent, CollectingSink, ConnTuple, HttpwatchConfig, TelemetryCounter};
use serde::{Deserialize, Deserializer};
use std::io::{BufRead, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },

    #[error("Line {line}: unknown hook section '{section}'")]
    UnknownHook { line: usize, section: String },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type ReplayResult<T> = Result<T, ReplayError>;

/// One hook invocation as recorded
#[derive(Debug, Clone, Deserialize)]
pub struct HookRecord {
    /// Section name, e.g. `uretprobe/SSL_write`
    pub hook: String,
    pub pid: u32,
    #[serde(default)]
    pub tid: Option<u32>,
    /// Integer arguments in calling-convention order
    #[serde(default)]
    pub params: Vec<u64>,
    /// Return value; negative values are accepted
    #[serde(default)]
    pub rc: Option<i64>,
    /// Additional registers as `[dwarf_number, value]` pairs
    #[serde(default)]
    pub regs: Vec<(u16, u64)>,
    #[serde(default)]
    pub sp: Option<u64>,
    #[serde(default)]
    pub tls_base: u64,
}

impl HookRecord {
    pub fn context(&self) -> ProbeContext {
        let mut ctx = ProbeContext::new(self.pid, self.tid.unwrap_or(self.pid))
            .with_params(&self.params)
            .with_tls_base(self.tls_base);
        for &(regnum, value) in &self.regs {
            ctx = ctx.with_reg(regnum, value);
        }
        if let Some(rc) = self.rc {
            ctx = ctx.with_reg(reg::RAX, rc as u64);
        }
        if let Some(sp) = self.sp {
            ctx = ctx.with_sp(sp);
        }
        ctx
    }
}

/// A line of a trace
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum ReplayRecord {
    /// Bytes present in a process at an address
    Memory {
        pid: u32,
        addr: u64,
        #[serde(deserialize_with = "from_hex")]
        bytes: Vec<u8>,
    },
    /// Socket descriptor bound to a connection
    Socket { pid: u32, fd: u32, tuple: ConnTuple },
    /// Go TLS layout of a process
    GoOffsets { pid: u32, offsets: GoTlsOffsets },
    Hook(HookRecord),
    /// Ethernet frame seen by the packet socket
    Packet {
        #[serde(deserialize_with = "from_hex")]
        frame: Vec<u8>,
    },
    /// `tcp_sendmsg` from a thread
    TcpSendmsg { pid: u32, tid: u32, tuple: ConnTuple },
    /// Collaborator counter bump
    Counter {
        counter: TelemetryCounter,
        #[serde(default = "one")]
        n: u64,
    },
}

fn one() -> u64 {
    1
}

fn from_hex<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(d)?;
    hex::decode(s.trim()).map_err(serde::de::Error::custom)
}

/// Output line: the event's own fields plus an id and a timestamp
pub fn output_record(
    event: &CaptureEvent,
    timestamp: DateTime<Utc>,
) -> serde_json::Result<serde_json::Value> {
    let mut value = serde_json::to_value(event)?;
    if let Some(fields) = value.as_object_mut() {
        fields.insert("id".into(), ulid::Ulid::new().to_string().into());
        fields.insert("timestamp".into(), serde_json::to_value(timestamp)?);
    }
    Ok(value)
}

/// Counts from one replay run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub records: usize,
    pub hooks: usize,
    pub events: usize,
}

/// Engine plus the in-memory world it reads from
pub struct Replayer {
    memory: Arc<SnapshotMemory>,
    sockets: Arc<SocketTable>,
    sink: Arc<CollectingSink>,
    engine: CaptureEngine,
}

impl Replayer {
    pub fn new(config: &HttpwatchConfig) -> Self {
        let memory = Arc::new(SnapshotMemory::new());
        let sockets = Arc::new(SocketTable::new());
        let sink = Arc::new(CollectingSink::new());
        let engine = CaptureEngine::new(config, memory.clone(), sockets.clone(), sink.clone());
        Self {
            memory,
            sockets,
            sink,
            engine,
        }
    }

    pub fn engine(&self) -> &CaptureEngine {
        &self.engine
    }

    /// Apply one record. Returns whether it was a hook invocation.
    pub fn apply(&self, line: usize, record: ReplayRecord) -> ReplayResult<bool> {
        match record {
            ReplayRecord::Memory { pid, addr, bytes } => {
                debug!("memory pid={} addr={:#x} len={}", pid, addr, bytes.len());
                self.memory.insert(pid, addr, bytes);
            }
            ReplayRecord::Socket { pid, fd, tuple } => self.sockets.bind(pid, fd, tuple),
            ReplayRecord::GoOffsets { pid, offsets } => {
                self.engine.register_go_offsets(pid, offsets)
            }
            ReplayRecord::Hook(hook) => {
                let point = HookPoint::from_section(&hook.hook).ok_or_else(|| {
                    ReplayError::UnknownHook {
                        line,
                        section: hook.hook.clone(),
                    }
                })?;
                self.engine.dispatch(point, &hook.context());
                return Ok(true);
            }
            ReplayRecord::Packet { frame } => {
                self.engine.handle_packet(&frame);
            }
            ReplayRecord::TcpSendmsg { pid, tid, tuple } => {
                self.engine
                    .tcp_sendmsg(((pid as u64) << 32) | tid as u64, tuple);
            }
            ReplayRecord::Counter { counter, n } => self.engine.telemetry().add(counter, n),
        }
        Ok(false)
    }

    /// Events emitted since the last call
    pub fn drain(&self) -> Vec<CaptureEvent> {
        self.sink.drain()
    }

    /// Replay a whole trace, writing events to `out`
    pub fn run<R: BufRead, W: Write>(
        &self,
        input: R,
        mut out: W,
    ) -> ReplayResult<ReplaySummary> {
        let mut summary = ReplaySummary::default();

        for (idx, line) in input.lines().enumerate() {
            let line = line?;
            let line_no = idx + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let record: ReplayRecord = serde_json::from_str(trimmed).map_err(|source| {
                ReplayError::Parse {
                    line: line_no,
                    source,
                }
            })?;
            summary.records += 1;
            if self.apply(line_no, record)? {
                summary.hooks += 1;
            }

            for event in self.drain() {
                let record = output_record(&event, Utc::now())?;
                serde_json::to_writer(&mut out, &record)?;
                out.write_all(b"\n")?;
                summary.events += 1;
            }
        }
        out.flush()?;

        if summary.records == 0 {
            warn!("Trace contained no records");
        }
        info!(
            "Replayed {} records ({} hooks), {} events",
            summary.records, summary.hooks, summary.events
        );
        Ok(summary)
    }
}
