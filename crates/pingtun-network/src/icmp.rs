//! ICMPv4 handling
//!
//! Only echo requests are answered. The reply is the request itself with the
//! type rewritten, the addresses exchanged and both checksums recomputed.
//! Identifier, sequence, payload and IP options pass through untouched;
//! record-route and timestamp options are not updated.
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |     Code      |          Checksum             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Identifier          |        Sequence Number        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Data ...
//! +-+-+-+-+-
//! ```

use bytes::BytesMut;
use tracing::debug;

use crate::checksum;
use crate::ipv4;
use crate::packet::Packet;
use crate::processor::{Ignored, Verdict};

/// Type, code and checksum
pub const MIN_HEADER_LEN: usize = 4;

/// Echo header adds identifier and sequence number
pub const ECHO_HEADER_LEN: usize = 8;

pub const CHECKSUM_OFFSET: usize = 2;

/// ICMP message types the endpoint knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IcmpType {
    EchoReply = 0,
    EchoRequest = 8,
}

impl IcmpType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::EchoReply),
            8 => Some(Self::EchoRequest),
            _ => None,
        }
    }
}

/// Checksum-validated view of the ICMP segment following an IPv4 header
#[derive(Debug, Clone, Copy)]
pub struct IcmpSegment<'a> {
    bytes: &'a [u8],
}

impl<'a> IcmpSegment<'a> {
    /// View the segment starting at `header_len` in `datagram`
    pub fn parse(datagram: &'a [u8], header_len: usize) -> Result<Self, Ignored> {
        let needed = header_len + MIN_HEADER_LEN;
        if datagram.len() < needed {
            return Err(Ignored::Truncated {
                needed,
                actual: datagram.len(),
            });
        }

        let bytes = &datagram[header_len..];
        if !checksum::is_valid(bytes) {
            return Err(Ignored::BadIcmpChecksum);
        }

        Ok(Self { bytes })
    }

    pub fn type_raw(&self) -> u8 {
        self.bytes[0]
    }

    pub fn icmp_type(&self) -> Option<IcmpType> {
        IcmpType::from_u8(self.type_raw())
    }

    pub fn code(&self) -> u8 {
        self.bytes[1]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.bytes[CHECKSUM_OFFSET], self.bytes[CHECKSUM_OFFSET + 1]])
    }

    /// Echo identifier, if the segment is long enough to carry one
    pub fn identifier(&self) -> Option<u16> {
        self.echo_field(4)
    }

    /// Echo sequence number, if the segment is long enough to carry one
    pub fn sequence(&self) -> Option<u16> {
        self.echo_field(6)
    }

    /// Bytes after the echo header
    pub fn payload(&self) -> &'a [u8] {
        self.bytes.get(ECHO_HEADER_LEN..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn echo_field(&self, offset: usize) -> Option<u16> {
        let field = self.bytes.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([field[0], field[1]]))
    }
}

/// Answers ICMPv4 echo requests
#[derive(Debug, Clone, Copy, Default)]
pub struct PingResponder;

impl PingResponder {
    pub fn new() -> Self {
        Self
    }

    /// Handle the ICMP segment of an already validated IPv4 packet
    pub fn handle(&self, packet: &Packet, header_len: usize) -> Verdict {
        let segment = match IcmpSegment::parse(packet.data(), header_len) {
            Ok(segment) => segment,
            Err(reason) => return Verdict::Ignored(reason),
        };

        match segment.icmp_type() {
            Some(IcmpType::EchoRequest) => self.handle_echo_request(packet, &segment, header_len),
            Some(other) => Verdict::Ignored(Ignored::UnhandledIcmpType(other)),
            None => Verdict::Ignored(Ignored::UnknownIcmpType(segment.type_raw())),
        }
    }

    fn handle_echo_request(&self, packet: &Packet, segment: &IcmpSegment<'_>, header_len: usize) -> Verdict {
        if segment.len() < ECHO_HEADER_LEN {
            return Verdict::Ignored(Ignored::Truncated {
                needed: header_len + ECHO_HEADER_LEN,
                actual: packet.len(),
            });
        }

        debug!(
            "tunnel data in: ping request id={:?} seq={:?}",
            segment.identifier(),
            segment.sequence()
        );
        let reply = build_echo_reply(packet, header_len);
        debug!("tunnel data out: ping reply");

        Verdict::Reply(reply)
    }
}

/// Turn an echo request into its reply.
///
/// The caller guarantees `packet` holds a validated IPv4 header of
/// `header_len` bytes followed by at least an echo header.
pub fn build_echo_reply(packet: &Packet, header_len: usize) -> Packet {
    let mut data = BytesMut::from(packet.data().as_ref());

    data[header_len] = IcmpType::EchoReply as u8;
    ipv4::swap_addresses(&mut data);

    checksum::rewrite(&mut data[..header_len], ipv4::CHECKSUM_OFFSET);
    checksum::rewrite(&mut data[header_len..], CHECKSUM_OFFSET);

    Packet::new(packet.family(), data.freeze())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ipv4::tests::datagram;
    use crate::ipv4::Ipv4Header;

    /// Build an ICMP segment with a valid checksum
    pub(crate) fn segment(icmp_type: u8, identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![icmp_type, 0, 0, 0];
        data.extend_from_slice(&identifier.to_be_bytes());
        data.extend_from_slice(&sequence.to_be_bytes());
        data.extend_from_slice(payload);
        checksum::rewrite(&mut data, CHECKSUM_OFFSET);
        data
    }

    pub(crate) fn echo_request(payload: &[u8]) -> Packet {
        Packet::ipv4(datagram(1, &[], &segment(8, 0x1234, 7, payload)))
    }

    #[test]
    fn test_echo_request_produces_reply() {
        let request = echo_request(b"abcdefghijklmnop");
        let verdict = PingResponder::new().handle(&request, 20);

        let reply = match verdict {
            Verdict::Reply(reply) => reply,
            other => panic!("expected reply, got {:?}", other),
        };

        let request_header = Ipv4Header::parse(&request).unwrap();
        let reply_header = Ipv4Header::parse(&reply).expect("reply IP checksum must be valid");
        assert_eq!(reply_header.source(), request_header.destination());
        assert_eq!(reply_header.destination(), request_header.source());

        let request_icmp = IcmpSegment::parse(request.data(), 20).unwrap();
        let reply_icmp = IcmpSegment::parse(reply.data(), 20).expect("reply ICMP checksum must be valid");
        assert_eq!(reply_icmp.icmp_type(), Some(IcmpType::EchoReply));
        assert_eq!(reply_icmp.code(), 0);
        assert_eq!(reply_icmp.identifier(), request_icmp.identifier());
        assert_eq!(reply_icmp.sequence(), request_icmp.sequence());
        assert_eq!(reply_icmp.payload(), request_icmp.payload());
        assert_eq!(reply.family(), request.family());
        assert_eq!(reply.len(), request.len());
    }

    #[test]
    fn test_reply_preserves_ip_options() {
        let options = [0x94, 0x04, 0x00, 0x00];
        let request = Packet::ipv4(datagram(1, &options, &segment(8, 1, 1, b"xyz")));
        let reply = match PingResponder::new().handle(&request, 24) {
            Verdict::Reply(reply) => reply,
            other => panic!("expected reply, got {:?}", other),
        };

        assert_eq!(&reply.data()[20..24], &options);
        assert!(Ipv4Header::parse(&reply).is_ok());
        assert!(IcmpSegment::parse(reply.data(), 24).is_ok());
    }

    #[test]
    fn test_request_buffer_is_not_modified() {
        let request = echo_request(b"ping");
        let before = request.data().clone();
        let _ = PingResponder::new().handle(&request, 20);
        assert_eq!(request.data(), &before);
    }

    #[test]
    fn test_odd_payload_length() {
        let request = echo_request(b"odd");
        assert!(matches!(PingResponder::new().handle(&request, 20), Verdict::Reply(_)));
    }

    #[test]
    fn test_echo_reply_is_not_consumed() {
        let packet = Packet::ipv4(datagram(1, &[], &segment(0, 1, 1, b"pong")));
        assert_eq!(
            PingResponder::new().handle(&packet, 20),
            Verdict::Ignored(Ignored::UnhandledIcmpType(IcmpType::EchoReply))
        );
    }

    #[test]
    fn test_unknown_type_is_not_consumed() {
        let packet = Packet::ipv4(datagram(1, &[], &segment(3, 0, 0, &[])));
        assert_eq!(
            PingResponder::new().handle(&packet, 20),
            Verdict::Ignored(Ignored::UnknownIcmpType(3))
        );
    }

    #[test]
    fn test_segment_too_short_for_header() {
        let packet = Packet::ipv4(datagram(1, &[], &[8, 0, 0]));
        assert_eq!(
            PingResponder::new().handle(&packet, 20),
            Verdict::Ignored(Ignored::Truncated { needed: 24, actual: 23 })
        );
    }

    #[test]
    fn test_echo_request_without_identifier() {
        // Type, code and checksum only: valid segment but no echo header.
        let mut icmp = vec![8, 0, 0, 0, 0, 0];
        checksum::rewrite(&mut icmp, CHECKSUM_OFFSET);
        let packet = Packet::ipv4(datagram(1, &[], &icmp));

        assert_eq!(
            PingResponder::new().handle(&packet, 20),
            Verdict::Ignored(Ignored::Truncated { needed: 28, actual: 26 })
        );
    }

    #[test]
    fn test_bad_icmp_checksum() {
        let mut icmp = segment(8, 1, 1, b"data");
        icmp[5] ^= 0x01;
        let packet = Packet::ipv4(datagram(1, &[], &icmp));
        assert_eq!(
            PingResponder::new().handle(&packet, 20),
            Verdict::Ignored(Ignored::BadIcmpChecksum)
        );
    }
}
