//! Uniform event model
//!
//! All three TLS families and the plaintext path reduce what they see to the
//! same three events. The family that produced a chunk travels alongside it as
//! a [`LibraryTag`].

use crate::conn::ConnTuple;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Source family of observed bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LibraryTag {
    /// OpenSSL / BoringSSL / LibreSSL style API
    NativeSsl,
    /// GnuTLS style API
    GnutlsStyle,
    /// Go `crypto/tls`
    ManagedRuntime,
    /// Unencrypted packet capture
    Plaintext,
}

impl LibraryTag {
    pub const ALL: [LibraryTag; 4] = [
        LibraryTag::NativeSsl,
        LibraryTag::GnutlsStyle,
        LibraryTag::ManagedRuntime,
        LibraryTag::Plaintext,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryTag::NativeSsl => "native-ssl",
            LibraryTag::GnutlsStyle => "gnutls-style",
            LibraryTag::ManagedRuntime => "managed-runtime",
            LibraryTag::Plaintext => "plaintext",
        }
    }

    /// Static tag bit attached to reconstructed transactions
    pub fn bit(&self) -> u64 {
        match self {
            LibraryTag::GnutlsStyle => 1 << 0,
            LibraryTag::NativeSsl => 1 << 1,
            LibraryTag::ManagedRuntime => 1 << 2,
            LibraryTag::Plaintext => 0,
        }
    }

    /// Static tag string, `None` for plaintext
    pub fn static_tag(&self) -> Option<&'static str> {
        match self {
            LibraryTag::GnutlsStyle => Some("tls.library:gnutls"),
            LibraryTag::NativeSsl => Some("tls.library:openssl"),
            LibraryTag::ManagedRuntime => Some("tls.library:go"),
            LibraryTag::Plaintext => None,
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, LibraryTag::Plaintext)
    }
}

impl fmt::Display for LibraryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk of plaintext application data for one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedBytes {
    /// Process that made the call (0 for packet capture)
    pub pid: u32,
    pub tuple: ConnTuple,
    pub tag: LibraryTag,
    /// Byte count reported by the call
    pub len: usize,
    /// Captured prefix of the buffer, at most the configured capture size
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    /// TCP sequence number, packet path only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_seq: Option<u32>,
    /// TCP flags, packet path only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_flags: Option<u8>,
}

impl ObservedBytes {
    pub fn is_truncated(&self) -> bool {
        self.data.len() < self.len
    }

    /// Captured bytes as lossy UTF-8 (for logs and the CLI)
    pub fn preview(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// End of stream for one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionClosed {
    pub pid: u32,
    pub tuple: ConnTuple,
    pub tag: LibraryTag,
}

/// A monitored process opened a shared object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryLoad {
    pub pid: u32,
    pub path: String,
}

impl LibraryLoad {
    /// File name component of the path
    pub fn file_name(&self) -> &str {
        Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.path)
    }

    /// Adapter family this library would attach, if any
    pub fn family(&self) -> Option<LibraryTag> {
        let name = self.file_name();
        if name.starts_with("libssl") || name.starts_with("libcrypto") {
            Some(LibraryTag::NativeSsl)
        } else if name.starts_with("libgnutls") {
            Some(LibraryTag::GnutlsStyle)
        } else {
            None
        }
    }
}

/// Everything the engine hands to the reconstructor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptureEvent {
    ObservedBytes(ObservedBytes),
    ConnectionClosed(ConnectionClosed),
    LibraryLoad(LibraryLoad),
}

impl CaptureEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            CaptureEvent::ObservedBytes(_) => "observed_bytes",
            CaptureEvent::ConnectionClosed(_) => "connection_closed",
            CaptureEvent::LibraryLoad(_) => "library_load",
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            CaptureEvent::ObservedBytes(e) => e.pid,
            CaptureEvent::ConnectionClosed(e) => e.pid,
            CaptureEvent::LibraryLoad(e) => e.pid,
        }
    }

    pub fn tuple(&self) -> Option<&ConnTuple> {
        match self {
            CaptureEvent::ObservedBytes(e) => Some(&e.tuple),
            CaptureEvent::ConnectionClosed(e) => Some(&e.tuple),
            CaptureEvent::LibraryLoad(_) => None,
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
