//! pingtun Network Layer
//!
//! Provides the packet path of the tunnel endpoint:
//! - Internet checksum computation and validation
//! - IPv4 header decoding
//! - ICMPv4 echo responder
//! - Packet ingest loop driven by the host packet flow
//! - TUN adapters for capturing traffic

pub mod checksum;
pub mod error;
pub mod icmp;
pub mod ingest;
pub mod ipv4;
pub mod packet;
pub mod processor;
pub mod tun;

pub use error::{NetworkError, NetworkResult};
pub use icmp::{IcmpType, PingResponder};
pub use ingest::{DiagnosticSink, IngestHandle, PacketIngestLoop, TracingSink};
pub use ipv4::{IpProtocol, Ipv4Header};
pub use packet::{AddressFamily, Packet};
pub use processor::{Ignored, PacketProcessor, ProcessorStats, Verdict};
pub use tun::{FlowFactory, PacketFlow, SystemTun, TunConfig};
