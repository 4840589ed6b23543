//! Identity Resolver
//!
//! Passive tables mapping opaque library handles to connection identities.
//! Adapters write them during session setup; every data call reads them.
//! The resolver never guesses: a miss is returned as `None` and the caller
//! drops its event.

use crate::socket::SockResolver;
use crate::table::BoundedTable;
use httpwatch_core::config::TableSettings;
use httpwatch_core::{ConnTuple, PortRange, TableSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// A handle value scoped to the process it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleKey {
    pub pid: u32,
    pub handle: u64,
}

impl HandleKey {
    pub fn new(pid: u32, handle: u64) -> Self {
        Self { pid, handle }
    }
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.pid, self.handle)
    }
}

/// What is known about one library session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionEntry {
    /// Descriptor attached during setup, if the library told us one
    pub fd: Option<u32>,
    /// Normalized identity, filled on first successful resolution
    pub tuple: Option<ConnTuple>,
}

/// Handle-to-identity tables shared by all adapters
pub struct IdentityResolver {
    /// Session handle currently in a handshake, per OS thread
    handshakes: BoundedTable<u64, u64>,
    /// Descriptor of each socket BIO not yet attached to a session
    bio_fds: BoundedTable<HandleKey, u32>,
    /// Native SSL and GnuTLS sessions
    sessions: BoundedTable<HandleKey, SessionEntry>,
    /// Go `*tls.Conn` objects
    runtime_conns: BoundedTable<HandleKey, ConnTuple>,
    sockets: Arc<dyn SockResolver>,
    ephemeral: PortRange,
}

impl IdentityResolver {
    pub fn new(
        sockets: Arc<dyn SockResolver>,
        ephemeral: PortRange,
        tables: &TableSettings,
    ) -> Self {
        Self {
            handshakes: BoundedTable::new("ssl_ctx_by_pid_tgid", tables.handles),
            bio_fds: BoundedTable::new("fd_by_ssl_bio", tables.handles),
            sessions: BoundedTable::new("ssl_sock_by_ctx", tables.handles),
            runtime_conns: BoundedTable::new("conn_tup_by_tls_conn", tables.go_conns),
            sockets,
            ephemeral,
        }
    }

    pub fn ephemeral(&self) -> &PortRange {
        &self.ephemeral
    }

    pub fn sockets(&self) -> &Arc<dyn SockResolver> {
        &self.sockets
    }

    /// Canonical form of a socket-derived tuple: normalized once, with the
    /// process and namespace cleared so it matches the packet path
    pub fn canonical(&self, tuple: ConnTuple) -> ConnTuple {
        tuple.normalized(&self.ephemeral).without_process()
    }

    // Handshake window

    pub fn begin_handshake(&self, pid_tgid: u64, handle: u64) {
        trace!("handshake start: pid_tgid={:#x} handle={:#x}", pid_tgid, handle);
        self.handshakes.insert(pid_tgid, handle);
    }

    pub fn end_handshake(&self, pid_tgid: u64) {
        self.handshakes.remove(&pid_tgid);
    }

    pub fn handshake_in_progress(&self, pid_tgid: u64) -> Option<u64> {
        self.handshakes.get(&pid_tgid)
    }

    /// A TCP send on a thread that is inside a handshake binds that thread's
    /// session directly to the sending socket
    pub fn bind_from_handshake(&self, pid_tgid: u64, tuple: ConnTuple) -> bool {
        let Some(handle) = self.handshakes.get(&pid_tgid) else {
            return false;
        };
        let key = HandleKey::new((pid_tgid >> 32) as u32, handle);
        let tuple = self.canonical(tuple);
        debug!("handshake bind {} -> {}", key, tuple);
        self.sessions.insert(
            key,
            SessionEntry {
                fd: None,
                tuple: Some(tuple),
            },
        );
        true
    }

    // Descriptor association

    /// Associate a session with a socket descriptor
    pub fn bind_fd(&self, key: HandleKey, fd: u32) {
        // Re-announcing the same descriptor keeps an already resolved identity
        if let Some(existing) = self.sessions.get(&key) {
            if existing.fd == Some(fd) && existing.tuple.is_some() {
                return;
            }
        }
        debug!("bind {} -> fd {}", key, fd);
        self.sessions.insert(
            key,
            SessionEntry {
                fd: Some(fd),
                tuple: None,
            },
        );
    }

    /// Remember the descriptor behind a freshly created socket BIO
    pub fn track_bio(&self, bio: HandleKey, fd: u32) {
        trace!("bio {} wraps fd {}", bio, fd);
        self.bio_fds.insert(bio, fd);
    }

    /// Attach a tracked BIO to a session. The BIO entry is consumed.
    pub fn attach_bio(&self, session: HandleKey, bio: HandleKey) -> bool {
        match self.bio_fds.take(&bio) {
            Some(fd) => {
                self.bind_fd(session, fd);
                true
            }
            None => false,
        }
    }

    pub fn bio_fd(&self, bio: HandleKey) -> Option<u32> {
        self.bio_fds.get(&bio)
    }

    // Read path

    /// Connection identity of a session handle.
    ///
    /// The first successful call resolves the attached descriptor through the
    /// socket resolver and caches the canonical tuple; later calls return the
    /// cached value unchanged.
    pub fn resolve(&self, key: HandleKey) -> Option<ConnTuple> {
        let entry = self.sessions.get(&key)?;
        if let Some(tuple) = entry.tuple {
            return Some(tuple);
        }

        let fd = entry.fd?;
        let Some(raw) = self.sockets.resolve(key.pid, fd) else {
            trace!("{}: no socket for fd {}", key, fd);
            return None;
        };
        let tuple = self.canonical(raw);

        let mut stored = tuple;
        let present = self.sessions.update(&key, |e| match e.tuple {
            Some(existing) => stored = existing,
            None => e.tuple = Some(tuple),
        });
        if !present {
            // Torn down while we were resolving
            return None;
        }
        debug!("resolved {} -> {}", key, stored);
        Some(stored)
    }

    pub fn session(&self, key: HandleKey) -> Option<SessionEntry> {
        self.sessions.get(&key)
    }

    /// Resolve then forget a session. The mapping is removed even when it
    /// never resolved.
    pub fn close(&self, key: HandleKey) -> Option<ConnTuple> {
        let tuple = self.resolve(key);
        self.sessions.remove(&key);
        tuple
    }

    // Managed runtime connections

    pub fn runtime_conn(&self, key: HandleKey) -> Option<ConnTuple> {
        self.runtime_conns.get(&key)
    }

    pub fn bind_runtime_conn(&self, key: HandleKey, tuple: ConnTuple) -> ConnTuple {
        let tuple = self.canonical(tuple);
        debug!("runtime conn {} -> {}", key, tuple);
        self.runtime_conns.insert(key, tuple);
        tuple
    }

    pub fn forget_runtime_conn(&self, key: HandleKey) -> bool {
        self.runtime_conns.remove(&key)
    }

    pub fn snapshots(&self) -> Vec<TableSnapshot> {
        vec![
            self.handshakes.snapshot(),
            self.bio_fds.snapshot(),
            self.sessions.snapshot(),
            self.runtime_conns.snapshot(),
        ]
    }
}
