//! Plaintext capture path
//!
//! Reads HTTP straight off unencrypted TCP packets. Runs in two stages: a
//! cheap filter that rejects anything that cannot carry or end an HTTP
//! exchange, then a processing stage that copies the payload window and
//! forwards it. The packet tuple is self-describing, so the Identity
//! Resolver is not involved.

use crate::adapters::Emitter;
use httpwatch_core::{ConnTuple, LibraryTag, ObservedBytes, PortRange};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::trace;

const ETH_HLEN: usize = 14;
const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPV6_HLEN: usize = 40;
const UDP_HLEN: usize = 8;

pub const TCPHDR_FIN: u8 = 0x01;
pub const TCPHDR_SYN: u8 = 0x02;
pub const TCPHDR_RST: u8 = 0x04;
pub const TCPHDR_PSH: u8 = 0x08;
pub const TCPHDR_ACK: u8 = 0x10;

/// Addressing and payload position of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// Endpoints as they appear on the wire, not yet normalized
    pub tuple: ConnTuple,
    /// Offset of the first payload byte
    pub data_off: usize,
    /// End of the IP datagram; link-layer padding lies past it
    pub len: usize,
    pub tcp_seq: u32,
    pub tcp_flags: u8,
}

impl PacketInfo {
    pub fn payload_len(&self) -> usize {
        self.len.saturating_sub(self.data_off)
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.tcp_flags & flag != 0
    }
}

/// Parse an Ethernet frame carrying IPv4 or IPv6 with TCP or UDP
pub fn parse_frame(frame: &[u8]) -> Option<PacketInfo> {
    if frame.len() < ETH_HLEN {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);

    let (saddr, daddr, protocol, l4_off, ip_end) = match ethertype {
        ETH_P_IP => {
            let ip = frame.get(ETH_HLEN..)?;
            if ip.len() < 20 || (ip[0] >> 4) != 4 {
                return None;
            }
            let ihl = ((ip[0] & 0x0F) as usize) * 4;
            if ihl < 20 || ip.len() < ihl {
                return None;
            }
            // A zero total length comes from segmentation offload; trust the frame
            let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
            let ip_end = match total_len {
                0 => frame.len(),
                n if n < ihl => return None,
                n => (ETH_HLEN + n).min(frame.len()),
            };
            let saddr = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
            let daddr = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
            (
                IpAddr::V4(saddr),
                IpAddr::V4(daddr),
                ip[9],
                ETH_HLEN + ihl,
                ip_end,
            )
        }
        ETH_P_IPV6 => {
            let ip = frame.get(ETH_HLEN..ETH_HLEN + IPV6_HLEN)?;
            if (ip[0] >> 4) != 6 {
                return None;
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&ip[8..24]);
            dst.copy_from_slice(&ip[24..40]);
            let payload_len = u16::from_be_bytes([ip[4], ip[5]]) as usize;
            let ip_end = match payload_len {
                0 => frame.len(),
                n => (ETH_HLEN + IPV6_HLEN + n).min(frame.len()),
            };
            (
                IpAddr::V6(Ipv6Addr::from(src)),
                IpAddr::V6(Ipv6Addr::from(dst)),
                ip[6],
                ETH_HLEN + IPV6_HLEN,
                ip_end,
            )
        }
        _ => return None,
    };

    match protocol {
        IPPROTO_TCP => {
            let tcp = frame.get(l4_off..l4_off + 20)?;
            let sport = u16::from_be_bytes([tcp[0], tcp[1]]);
            let dport = u16::from_be_bytes([tcp[2], tcp[3]]);
            let tcp_seq = u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]);
            let doff = ((tcp[12] >> 4) as usize) * 4;
            if doff < 20 {
                return None;
            }
            let data_off = l4_off + doff;
            if data_off > ip_end {
                return None;
            }
            Some(PacketInfo {
                tuple: ConnTuple::tcp(saddr, sport, daddr, dport),
                data_off,
                len: ip_end,
                tcp_seq,
                tcp_flags: tcp[13],
            })
        }
        IPPROTO_UDP => {
            let udp = frame.get(l4_off..l4_off + UDP_HLEN)?;
            let sport = u16::from_be_bytes([udp[0], udp[1]]);
            let dport = u16::from_be_bytes([udp[2], udp[3]]);
            Some(PacketInfo {
                tuple: ConnTuple::udp(saddr, sport, daddr, dport),
                data_off: (l4_off + UDP_HLEN).min(ip_end),
                len: ip_end,
                tcp_seq: 0,
                tcp_flags: 0,
            })
        }
        _ => None,
    }
}

/// Packet-level HTTP capture
pub struct PlaintextCapture {
    emitter: Arc<Emitter>,
    ephemeral: PortRange,
    https_port: u16,
}

impl PlaintextCapture {
    pub fn new(emitter: Arc<Emitter>, ephemeral: PortRange, https_port: u16) -> Self {
        Self {
            emitter,
            ephemeral,
            https_port,
        }
    }

    /// Filter stage. TCP only; packets with no payload or on the TLS port
    /// pass only when they end the connection.
    pub fn filter(&self, info: &PacketInfo) -> bool {
        if !info.tuple.is_tcp() {
            return false;
        }
        let empty_payload = info.payload_len() == 0;
        let tls_port = info.tuple.sport == self.https_port || info.tuple.dport == self.https_port;
        if (empty_payload || tls_port) && !info.has_flag(TCPHDR_FIN | TCPHDR_RST) {
            return false;
        }
        true
    }

    /// Processing stage: normalize the tuple and forward the payload window
    pub fn process(&self, frame: &[u8], info: &PacketInfo) -> bool {
        // initiator records which side sent this packet before normalization
        let tuple = info.tuple.normalized(&self.ephemeral);
        let payload = frame.get(info.data_off..info.len).unwrap_or_default();
        let window = &payload[..payload.len().min(self.emitter.max_capture_bytes())];

        trace!(
            "plaintext {} owner={} seq={} flags={:#04x} len={}",
            tuple,
            tuple.owner_port(),
            info.tcp_seq,
            info.tcp_flags,
            payload.len()
        );

        self.emitter.send_observed(ObservedBytes {
            pid: 0,
            tuple,
            tag: LibraryTag::Plaintext,
            len: payload.len(),
            data: window.to_vec(),
            tcp_seq: Some(info.tcp_seq),
            tcp_flags: Some(info.tcp_flags),
        })
    }

    /// Run one frame through both stages
    pub fn handle_packet(&self, frame: &[u8]) -> bool {
        let Some(info) = parse_frame(frame) else {
            self.count_filtered();
            return false;
        };
        if !self.filter(&info) {
            self.count_filtered();
            return false;
        }
        self.process(frame, &info)
    }

    fn count_filtered(&self) {
        self.emitter
            .metrics()
            .capture
            .packets_filtered
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Frame builders shared by unit and scenario tests
#[cfg(test)]
pub(crate) mod frames {
    use super::*;

    pub fn tcp_v4(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; ETH_HLEN];
        frame[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());

        let total_len = (20 + 20 + payload.len()) as u16;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[8] = 64;
        ip[9] = IPPROTO_TCP;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        frame.extend_from_slice(&ip);

        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&sport.to_be_bytes());
        tcp[2..4].copy_from_slice(&dport.to_be_bytes());
        tcp[4..8].copy_from_slice(&1000u32.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = flags;
        frame.extend_from_slice(&tcp);

        frame.extend_from_slice(payload);
        frame
    }

    pub fn udp_v4(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; ETH_HLEN];
        frame[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());
        let total_len = (20 + UDP_HLEN + payload.len()) as u16;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[9] = IPPROTO_UDP;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        frame.extend_from_slice(&ip);
        let mut udp = vec![0u8; UDP_HLEN];
        udp[0..2].copy_from_slice(&sport.to_be_bytes());
        udp[2..4].copy_from_slice(&dport.to_be_bytes());
        frame.extend_from_slice(&udp);
        frame.extend_from_slice(payload);
        frame
    }

    pub fn tcp_v6(src: Ipv6Addr, sport: u16, dst: Ipv6Addr, dport: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; ETH_HLEN];
        frame[12..14].copy_from_slice(&ETH_P_IPV6.to_be_bytes());
        let mut ip = vec![0u8; IPV6_HLEN];
        ip[0] = 0x60;
        ip[4..6].copy_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
        ip[6] = IPPROTO_TCP;
        ip[8..24].copy_from_slice(&src.octets());
        ip[24..40].copy_from_slice(&dst.octets());
        frame.extend_from_slice(&ip);
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&sport.to_be_bytes());
        tcp[2..4].copy_from_slice(&dport.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = flags;
        frame.extend_from_slice(&tcp);
        frame.extend_from_slice(payload);
        frame
    }
}
