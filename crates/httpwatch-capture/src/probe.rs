//! Probe invocation context and the hook manifest
//!
//! The attachment layer hands every handler a [`ProbeContext`]: the calling
//! task's `pid_tgid`, its register file and its thread-local storage base.
//! Registers use DWARF numbering for x86-64, which is also how managed-runtime
//! offset tables name register locations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// DWARF register numbers (x86-64)
pub mod reg {
    pub const RAX: u16 = 0;
    pub const RDX: u16 = 1;
    pub const RCX: u16 = 2;
    pub const RBX: u16 = 3;
    pub const RSI: u16 = 4;
    pub const RDI: u16 = 5;
    pub const RBP: u16 = 6;
    pub const RSP: u16 = 7;
    pub const R8: u16 = 8;
    pub const R9: u16 = 9;
    pub const R10: u16 = 10;
    pub const R11: u16 = 11;
    pub const R12: u16 = 12;
    pub const R13: u16 = 13;
    pub const R14: u16 = 14;
    pub const R15: u16 = 15;

    /// System V argument registers, in order
    pub const PARAMS: [u16; 6] = [RDI, RSI, RDX, RCX, R8, R9];
}

pub const NUM_REGISTERS: usize = 16;

/// General purpose registers of the probed thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers(pub [u64; NUM_REGISTERS]);

impl Registers {
    pub fn get(&self, regnum: u16) -> Option<u64> {
        self.0.get(regnum as usize).copied()
    }

    pub fn set(&mut self, regnum: u16, value: u64) {
        if let Some(slot) = self.0.get_mut(regnum as usize) {
            *slot = value;
        }
    }
}

/// Everything a handler may read about the current invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeContext {
    /// Thread group id in the high half, thread id in the low half
    pub pid_tgid: u64,
    pub regs: Registers,
    /// Thread-local storage base (`fsbase`) of the calling thread
    #[serde(default)]
    pub tls_base: u64,
}

impl ProbeContext {
    pub fn new(pid: u32, tid: u32) -> Self {
        Self {
            pid_tgid: ((pid as u64) << 32) | tid as u64,
            ..Default::default()
        }
    }

    pub fn pid(&self) -> u32 {
        (self.pid_tgid >> 32) as u32
    }

    pub fn tid(&self) -> u32 {
        self.pid_tgid as u32
    }

    /// `n`th integer argument (1-based, System V order)
    pub fn param(&self, n: usize) -> u64 {
        n.checked_sub(1)
            .and_then(|i| reg::PARAMS.get(i))
            .and_then(|&r| self.regs.get(r))
            .unwrap_or(0)
    }

    /// Return value register
    pub fn rc(&self) -> u64 {
        self.regs.0[reg::RAX as usize]
    }

    pub fn sp(&self) -> u64 {
        self.regs.0[reg::RSP as usize]
    }

    pub fn with_params(mut self, params: &[u64]) -> Self {
        for (value, &r) in params.iter().zip(reg::PARAMS.iter()) {
            self.regs.set(r, *value);
        }
        self
    }

    pub fn with_rc(mut self, rc: u64) -> Self {
        self.regs.set(reg::RAX, rc);
        self
    }

    pub fn with_reg(mut self, regnum: u16, value: u64) -> Self {
        self.regs.set(regnum, value);
        self
    }

    pub fn with_sp(self, sp: u64) -> Self {
        self.with_reg(reg::RSP, sp)
    }

    pub fn with_tls_base(mut self, tls_base: u64) -> Self {
        self.tls_base = tls_base;
        self
    }
}

/// Whether a hook runs at function entry or at its return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    Entry,
    Return,
}

/// Every code location the engine handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPoint {
    // Native SSL
    SslDoHandshake,
    SslDoHandshakeReturn,
    SslConnect,
    SslConnectReturn,
    SslSetFd,
    BioNewSocket,
    BioNewSocketReturn,
    SslSetBio,
    SslRead,
    SslReadReturn,
    SslWrite,
    SslWriteReturn,
    SslReadEx,
    SslReadExReturn,
    SslWriteEx,
    SslWriteExReturn,
    SslShutdown,

    // GnuTLS
    GnutlsHandshake,
    GnutlsHandshakeReturn,
    GnutlsTransportSetInt2,
    GnutlsTransportSetPtr,
    GnutlsTransportSetPtr2,
    GnutlsRecordRecv,
    GnutlsRecordRecvReturn,
    GnutlsRecordSend,
    GnutlsRecordSendReturn,
    GnutlsBye,
    GnutlsDeinit,

    // Go crypto/tls
    GoTlsWrite,
    GoTlsWriteReturn,
    GoTlsRead,
    GoTlsReadReturn,
    GoTlsClose,

    // Kernel
    DoSysOpen,
    DoSysOpenReturn,
    DoSysOpenat2,
    DoSysOpenat2Return,
}

impl HookPoint {
    pub const ALL: [HookPoint; 37] = [
        HookPoint::SslDoHandshake,
        HookPoint::SslDoHandshakeReturn,
        HookPoint::SslConnect,
        HookPoint::SslConnectReturn,
        HookPoint::SslSetFd,
        HookPoint::BioNewSocket,
        HookPoint::BioNewSocketReturn,
        HookPoint::SslSetBio,
        HookPoint::SslRead,
        HookPoint::SslReadReturn,
        HookPoint::SslWrite,
        HookPoint::SslWriteReturn,
        HookPoint::SslReadEx,
        HookPoint::SslReadExReturn,
        HookPoint::SslWriteEx,
        HookPoint::SslWriteExReturn,
        HookPoint::SslShutdown,
        HookPoint::GnutlsHandshake,
        HookPoint::GnutlsHandshakeReturn,
        HookPoint::GnutlsTransportSetInt2,
        HookPoint::GnutlsTransportSetPtr,
        HookPoint::GnutlsTransportSetPtr2,
        HookPoint::GnutlsRecordRecv,
        HookPoint::GnutlsRecordRecvReturn,
        HookPoint::GnutlsRecordSend,
        HookPoint::GnutlsRecordSendReturn,
        HookPoint::GnutlsBye,
        HookPoint::GnutlsDeinit,
        HookPoint::GoTlsWrite,
        HookPoint::GoTlsWriteReturn,
        HookPoint::GoTlsRead,
        HookPoint::GoTlsReadReturn,
        HookPoint::GoTlsClose,
        HookPoint::DoSysOpen,
        HookPoint::DoSysOpenReturn,
        HookPoint::DoSysOpenat2,
        HookPoint::DoSysOpenat2Return,
    ];

    /// Symbol (or kernel function) the hook attaches to
    pub fn symbol(&self) -> &'static str {
        use HookPoint::*;
        match self {
            SslDoHandshake | SslDoHandshakeReturn => "SSL_do_handshake",
            SslConnect | SslConnectReturn => "SSL_connect",
            SslSetFd => "SSL_set_fd",
            BioNewSocket | BioNewSocketReturn => "BIO_new_socket",
            SslSetBio => "SSL_set_bio",
            SslRead | SslReadReturn => "SSL_read",
            SslWrite | SslWriteReturn => "SSL_write",
            SslReadEx | SslReadExReturn => "SSL_read_ex",
            SslWriteEx | SslWriteExReturn => "SSL_write_ex",
            SslShutdown => "SSL_shutdown",
            GnutlsHandshake | GnutlsHandshakeReturn => "gnutls_handshake",
            GnutlsTransportSetInt2 => "gnutls_transport_set_int2",
            GnutlsTransportSetPtr => "gnutls_transport_set_ptr",
            GnutlsTransportSetPtr2 => "gnutls_transport_set_ptr2",
            GnutlsRecordRecv | GnutlsRecordRecvReturn => "gnutls_record_recv",
            GnutlsRecordSend | GnutlsRecordSendReturn => "gnutls_record_send",
            GnutlsBye => "gnutls_bye",
            GnutlsDeinit => "gnutls_deinit",
            GoTlsWrite | GoTlsWriteReturn => "crypto/tls.(*Conn).Write",
            GoTlsRead | GoTlsReadReturn => "crypto/tls.(*Conn).Read",
            GoTlsClose => "crypto/tls.(*Conn).Close",
            DoSysOpen | DoSysOpenReturn => "do_sys_open",
            DoSysOpenat2 | DoSysOpenat2Return => "do_sys_openat2",
        }
    }

    pub fn kind(&self) -> HookKind {
        use HookPoint::*;
        match self {
            SslDoHandshakeReturn | SslConnectReturn | BioNewSocketReturn | SslReadReturn
            | SslWriteReturn | SslReadExReturn | SslWriteExReturn | GnutlsHandshakeReturn
            | GnutlsRecordRecvReturn | GnutlsRecordSendReturn | GoTlsWriteReturn
            | GoTlsReadReturn | DoSysOpenReturn | DoSysOpenat2Return => HookKind::Return,
            _ => HookKind::Entry,
        }
    }

    pub fn is_kernel(&self) -> bool {
        matches!(
            self,
            HookPoint::DoSysOpen
                | HookPoint::DoSysOpenReturn
                | HookPoint::DoSysOpenat2
                | HookPoint::DoSysOpenat2Return
        )
    }

    fn is_go(&self) -> bool {
        matches!(
            self,
            HookPoint::GoTlsWrite
                | HookPoint::GoTlsWriteReturn
                | HookPoint::GoTlsRead
                | HookPoint::GoTlsReadReturn
                | HookPoint::GoTlsClose
        )
    }

    /// Attachment section name, e.g. `uretprobe/SSL_read`
    pub fn section(&self) -> String {
        let symbol = self.symbol();
        match (self.kind(), self.is_kernel(), self.is_go()) {
            (HookKind::Entry, true, _) => format!("kprobe/{}", symbol),
            (HookKind::Return, true, _) => format!("kretprobe/{}", symbol),
            // Go functions are probed at each RET instruction, not via uretprobe
            (HookKind::Return, false, true) => format!("uprobe/{}/return", symbol),
            (HookKind::Entry, false, _) => format!("uprobe/{}", symbol),
            (HookKind::Return, false, false) => format!("uretprobe/{}", symbol),
        }
    }

    /// Look a hook up by its section name
    pub fn from_section(section: &str) -> Option<HookPoint> {
        HookPoint::ALL.into_iter().find(|h| h.section() == section)
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.section())
    }
}

/// Kernel-side hooks that are not function probes on a TLS library
pub const TCP_SENDMSG_SECTION: &str = "kprobe/tcp_sendmsg";
pub const SOCKET_FILTER_SECTION: &str = "socket/http_filter";
