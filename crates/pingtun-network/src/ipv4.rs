//! IPv4 header decoding
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version|  IHL  |Type of Service|          Total Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Identification        |Flags|      Fragment Offset    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Time to Live |    Protocol   |         Header Checksum       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Source Address                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Destination Address                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Options                    |    Padding    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::net::Ipv4Addr;

use crate::checksum;
use crate::packet::{AddressFamily, Packet};
use crate::processor::Ignored;

/// Header length without options
pub const MIN_HEADER_LEN: usize = 20;

/// Header length with the maximum amount of options
pub const MAX_HEADER_LEN: usize = 60;

pub const PROTOCOL_OFFSET: usize = 9;
pub const CHECKSUM_OFFSET: usize = 10;
pub const SOURCE_OFFSET: usize = 12;
pub const DESTINATION_OFFSET: usize = 16;

/// Transport protocols recognized in the protocol field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IpProtocol {
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
    Icmpv6 = 58,
}

impl IpProtocol {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Icmp),
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            58 => Some(Self::Icmpv6),
            _ => None,
        }
    }
}

/// Validated view of an IPv4 header inside a packet buffer
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header<'a> {
    bytes: &'a [u8],
}

impl<'a> Ipv4Header<'a> {
    /// Decode and validate the header at the start of `packet`.
    ///
    /// Rejects are reported as [`Ignored`] and are an ordinary outcome.
    pub fn parse(packet: &'a Packet) -> Result<Self, Ignored> {
        if packet.family() != AddressFamily::Ipv4 {
            return Err(Ignored::UnsupportedFamily(packet.family()));
        }

        let data = packet.data().as_ref();
        if data.len() < MIN_HEADER_LEN {
            return Err(Ignored::Truncated {
                needed: MIN_HEADER_LEN,
                actual: data.len(),
            });
        }

        let version = data[0] >> 4;
        if version != 4 {
            return Err(Ignored::UnsupportedVersion(version));
        }

        let header_len = usize::from(data[0] & 0x0F) * 4;
        if header_len < MIN_HEADER_LEN {
            return Err(Ignored::BadHeaderLength(header_len));
        }
        if data.len() < header_len {
            return Err(Ignored::Truncated {
                needed: header_len,
                actual: data.len(),
            });
        }

        let bytes = &data[..header_len];
        if !checksum::is_valid(bytes) {
            return Err(Ignored::BadIpChecksum);
        }

        Ok(Self { bytes })
    }

    pub fn version(&self) -> u8 {
        self.bytes[0] >> 4
    }

    /// Header length in bytes, options included
    pub fn header_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn protocol_raw(&self) -> u8 {
        self.bytes[PROTOCOL_OFFSET]
    }

    pub fn protocol(&self) -> Option<IpProtocol> {
        IpProtocol::from_u8(self.protocol_raw())
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.bytes[CHECKSUM_OFFSET], self.bytes[CHECKSUM_OFFSET + 1]])
    }

    pub fn source(&self) -> Ipv4Addr {
        read_addr(self.bytes, SOURCE_OFFSET)
    }

    pub fn destination(&self) -> Ipv4Addr {
        read_addr(self.bytes, DESTINATION_OFFSET)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

fn read_addr(bytes: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    )
}

/// Exchange the source and destination address fields in place.
///
/// No other field is touched, checksums included.
pub fn swap_addresses(datagram: &mut [u8]) {
    let (head, tail) = datagram.split_at_mut(DESTINATION_OFFSET);
    head[SOURCE_OFFSET..SOURCE_OFFSET + 4].swap_with_slice(&mut tail[..4]);
}
