//! Socket resolution
//!
//! Maps a (process, file descriptor) pair to the connection the descriptor
//! refers to. The socket tracer feeds a [`SocketTable`]; on a live host the
//! [`ProcSocketResolver`] reads the same answer out of `/proc`.

use dashmap::DashMap;
use httpwatch_core::{ConnTuple, Protocol};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::trace;

/// (pid, fd) to connection lookup
pub trait SockResolver: Send + Sync {
    fn resolve(&self, pid: u32, fd: u32) -> Option<ConnTuple>;
}

/// Socket bindings reported by the socket tracer
#[derive(Debug, Default)]
pub struct SocketTable {
    sockets: DashMap<(u32, u32), ConnTuple>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `fd` in `pid` is connected as `tuple` (local endpoint first)
    pub fn bind(&self, pid: u32, fd: u32, tuple: ConnTuple) {
        self.sockets.insert((pid, fd), tuple.with_pid(pid));
    }

    pub fn unbind(&self, pid: u32, fd: u32) -> Option<ConnTuple> {
        self.sockets.remove(&(pid, fd)).map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

impl SockResolver for SocketTable {
    fn resolve(&self, pid: u32, fd: u32) -> Option<ConnTuple> {
        self.sockets.get(&(pid, fd)).map(|t| *t)
    }
}

/// Resolver backed by `/proc/<pid>/fd` and `/proc/<pid>/net/{tcp,udp}{,6}`
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcSocketResolver;

#[cfg(target_os = "linux")]
impl SockResolver for ProcSocketResolver {
    fn resolve(&self, pid: u32, fd: u32) -> Option<ConnTuple> {
        let link = std::fs::read_link(format!("/proc/{}/fd/{}", pid, fd)).ok()?;
        let inode = parse_socket_inode(&link.to_string_lossy())?;

        let tables = [
            ("tcp", Protocol::Tcp, false),
            ("tcp6", Protocol::Tcp, true),
            ("udp", Protocol::Udp, false),
            ("udp6", Protocol::Udp, true),
        ];
        for (name, protocol, v6) in tables {
            // The per-process view follows the process's network namespace
            let Ok(content) = std::fs::read_to_string(format!("/proc/{}/net/{}", pid, name))
            else {
                continue;
            };
            for line in content.lines().skip(1) {
                if let Some(entry) = parse_net_line(line, v6) {
                    if entry.inode == inode {
                        trace!("pid {} fd {} -> inode {} ({})", pid, fd, inode, name);
                        let tuple = match protocol {
                            Protocol::Tcp => ConnTuple::tcp(
                                entry.local_addr,
                                entry.local_port,
                                entry.remote_addr,
                                entry.remote_port,
                            ),
                            Protocol::Udp => ConnTuple::udp(
                                entry.local_addr,
                                entry.local_port,
                                entry.remote_addr,
                                entry.remote_port,
                            ),
                        };
                        return Some(tuple.with_pid(pid));
                    }
                }
            }
        }
        None
    }
}

/// Inode from a `socket:[12345]` link target
pub fn parse_socket_inode(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// One row of `/proc/net/{tcp,udp}{,6}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetEntry {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub inode: u64,
}

/// Parse a single line
/// Format: sl local_address rem_address st tx_queue rx_queue tr tm->when retrnsmt uid timeout inode ...
pub fn parse_net_line(line: &str, v6: bool) -> Option<NetEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }

    let (local_addr, local_port) = parse_hex_addr(parts[1], v6)?;
    let (remote_addr, remote_port) = parse_hex_addr(parts[2], v6)?;
    let inode: u64 = parts[9].parse().ok()?;

    Some(NetEntry {
        local_addr,
        local_port,
        remote_addr,
        remote_port,
        inode,
    })
}

/// Parse `HEXIP:HEXPORT`. Addresses are printed as host-order 32-bit words.
fn parse_hex_addr(hex: &str, v6: bool) -> Option<(IpAddr, u16)> {
    let (ip_hex, port_hex) = hex.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    let ip = if v6 {
        if ip_hex.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in bytes.chunks_mut(4).enumerate() {
            let word = u32::from_str_radix(ip_hex.get(i * 8..i * 8 + 8)?, 16).ok()?;
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        IpAddr::V6(Ipv6Addr::from(bytes))
    } else {
        let word = u32::from_str_radix(ip_hex, 16).ok()?;
        IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
    };

    Some((ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_table() {
        let table = SocketTable::new();
        let tuple = ConnTuple::tcp(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            50000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            443,
        );
        table.bind(42, 7, tuple);

        let resolved = table.resolve(42, 7).unwrap();
        assert_eq!(resolved.pid, 42);
        assert_eq!(resolved.dport, 443);
        assert!(table.resolve(42, 8).is_none());
        assert!(table.resolve(43, 7).is_none());

        assert!(table.unbind(42, 7).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_parse_socket_inode() {
        assert_eq!(parse_socket_inode("socket:[12345]"), Some(12345));
        assert_eq!(parse_socket_inode("pipe:[12345]"), None);
        assert_eq!(parse_socket_inode("/dev/null"), None);
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn test_parse_net_line_v4() {
        let line = "   1: 0100007F:1F90 0100007F:C350 01 00000000:00000000 00:00000000 00000000  1000        0 54321 1 0000000000000000 20 4 30 10 -1";
        let entry = parse_net_line(line, false).unwrap();
        assert_eq!(entry.local_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(entry.local_port, 8080);
        assert_eq!(entry.remote_port, 50000);
        assert_eq!(entry.inode, 54321);
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn test_parse_net_line_v6() {
        let line = "   0: 00000000000000000000000001000000:01BB 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 777 1 0000000000000000 100 0 0 10 0";
        let entry = parse_net_line(line, true).unwrap();
        assert_eq!(entry.local_addr, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(entry.local_port, 443);
        assert_eq!(entry.inode, 777);
    }

    #[test]
    fn test_parse_net_line_rejects_garbage() {
        assert!(parse_net_line("sl local_address rem_address", false).is_none());
        assert!(parse_net_line("1: zz:1 00:00 01 0 0 0 0 0 0 5", false).is_none());
    }
}
