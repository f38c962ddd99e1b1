//! Raw IP packets exchanged with the host packet flow

use std::fmt;

use bytes::Bytes;

/// Protocol family of a packet, as tagged by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// `AF_INET` on every supported host
    pub const AF_INET: u32 = 2;

    /// `AF_INET6` on Linux
    pub const AF_INET6_LINUX: u32 = 10;

    /// `AF_INET6` on Darwin
    pub const AF_INET6_DARWIN: u32 = 30;

    /// Map a raw `AF_*` value to a family
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            Self::AF_INET => Some(Self::Ipv4),
            Self::AF_INET6_LINUX | Self::AF_INET6_DARWIN => Some(Self::Ipv6),
            _ => None,
        }
    }

    /// Infer the family from the version nibble of an IP datagram
    pub fn from_version_nibble(data: &[u8]) -> Option<Self> {
        match data.first()? >> 4 {
            4 => Some(Self::Ipv4),
            6 => Some(Self::Ipv6),
            _ => None,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "ipv4"),
            Self::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// An IP datagram read from or written to the tunnel interface.
///
/// The buffer is never mutated once wrapped; replies are built from a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    family: AddressFamily,
    data: Bytes,
}

impl Packet {
    /// Wrap a buffer
    pub fn new(family: AddressFamily, data: impl Into<Bytes>) -> Self {
        Self {
            family,
            data: data.into(),
        }
    }

    /// Wrap an IPv4 datagram
    pub fn ipv4(data: impl Into<Bytes>) -> Self {
        Self::new(AddressFamily::Ipv4, data)
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Upper-case, space separated hex of the whole buffer
    pub fn hex_dump(&self) -> String {
        let mut out = String::with_capacity(self.data.len() * 3);
        for (i, byte) in self.data.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&format!("{:02X}", byte));
        }
        out
    }
}
