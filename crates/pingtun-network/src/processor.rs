//! Decoder chain: IPv4 header, then the handler for its protocol

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::icmp::{IcmpType, PingResponder};
use crate::ipv4::{IpProtocol, Ipv4Header};
use crate::packet::{AddressFamily, Packet};

/// Why a packet was left unconsumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignored {
    UnsupportedFamily(AddressFamily),
    Truncated { needed: usize, actual: usize },
    UnsupportedVersion(u8),
    BadHeaderLength(usize),
    BadIpChecksum,
    UnhandledProtocol(IpProtocol),
    UnknownProtocol(u8),
    BadIcmpChecksum,
    UnhandledIcmpType(IcmpType),
    UnknownIcmpType(u8),
}

impl fmt::Display for Ignored {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedFamily(family) => write!(f, "unsupported family {}", family),
            Self::Truncated { needed, actual } => {
                write!(f, "truncated: need {} bytes, got {}", needed, actual)
            }
            Self::UnsupportedVersion(version) => write!(f, "unsupported IP version {}", version),
            Self::BadHeaderLength(len) => write!(f, "bad IPv4 header length {}", len),
            Self::BadIpChecksum => write!(f, "bad IPv4 header checksum"),
            Self::UnhandledProtocol(protocol) => write!(f, "unhandled protocol {:?}", protocol),
            Self::UnknownProtocol(protocol) => write!(f, "unknown protocol {}", protocol),
            Self::BadIcmpChecksum => write!(f, "bad ICMP checksum"),
            Self::UnhandledIcmpType(icmp_type) => write!(f, "unhandled ICMP type {:?}", icmp_type),
            Self::UnknownIcmpType(icmp_type) => write!(f, "unknown ICMP type {}", icmp_type),
        }
    }
}

/// Outcome of running a packet through the decoder chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Consumed; the packet to write back to the host
    Reply(Packet),
    /// Not consumed
    Ignored(Ignored),
}

impl Verdict {
    pub fn is_consumed(&self) -> bool {
        matches!(self, Verdict::Reply(_))
    }
}

/// Processor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub packets_received: u64,
    pub packets_replied: u64,
    pub packets_ignored: u64,
}

/// Runs inbound packets through IPv4 decoding and protocol dispatch
#[derive(Debug, Default)]
pub struct PacketProcessor {
    responder: PingResponder,
    packets_received: AtomicU64,
    packets_replied: AtomicU64,
    packets_ignored: AtomicU64,
}

impl PacketProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide what to do with one inbound packet
    pub fn process(&self, packet: &Packet) -> Verdict {
        self.packets_received.fetch_add(1, Ordering::Relaxed);

        let verdict = match Ipv4Header::parse(packet) {
            Ok(header) => self.dispatch(packet, &header),
            Err(reason) => Verdict::Ignored(reason),
        };

        match &verdict {
            Verdict::Reply(reply) => {
                self.packets_replied.fetch_add(1, Ordering::Relaxed);
                trace!("Replying with {} bytes", reply.len());
            }
            Verdict::Ignored(reason) => {
                self.packets_ignored.fetch_add(1, Ordering::Relaxed);
                trace!("Ignoring {} byte packet: {}", packet.len(), reason);
            }
        }

        verdict
    }

    fn dispatch(&self, packet: &Packet, header: &Ipv4Header<'_>) -> Verdict {
        match header.protocol() {
            Some(IpProtocol::Icmp) => self.responder.handle(packet, header.header_len()),
            Some(protocol @ (IpProtocol::Tcp | IpProtocol::Udp | IpProtocol::Icmpv6)) => {
                Verdict::Ignored(Ignored::UnhandledProtocol(protocol))
            }
            None => Verdict::Ignored(Ignored::UnknownProtocol(header.protocol_raw())),
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_replied: self.packets_replied.load(Ordering::Relaxed),
            packets_ignored: self.packets_ignored.load(Ordering::Relaxed),
        }
    }
}
