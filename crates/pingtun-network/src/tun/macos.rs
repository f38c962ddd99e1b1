//! macOS TUN device implementation

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{PacketFlow, TunConfig};
use crate::error::{NetworkError, NetworkResult};
use crate::packet::{AddressFamily, Packet};

/// Size of the utun protocol family prefix
const FAMILY_HEADER_LEN: usize = 4;

/// macOS TUN device
pub struct MacOsTun {
    reader: tokio::sync::Mutex<tokio::io::ReadHalf<tun::AsyncDevice>>,
    writer: tokio::sync::Mutex<tokio::io::WriteHalf<tun::AsyncDevice>>,
    name: String,
    mtu: u16,
}

impl MacOsTun {
    /// Create a new macOS TUN device
    pub async fn create(config: TunConfig) -> NetworkResult<Self> {
        let mut tun_config = tun::Configuration::default();

        tun_config
            .name(&config.name)
            .address(config.address)
            .destination(config.address)
            .netmask(config.netmask)
            .mtu(i32::from(config.mtu))
            .up();

        let device = tun::create_as_async(&tun_config).map_err(|e| {
            NetworkError::TunError(format!("Failed to create TUN device: {}", e))
        })?;

        let name = config.name.clone();
        info!("Created TUN device: {} with IP {}/{}", name, config.address, config.netmask);

        let (reader, writer) = tokio::io::split(device);
        let tun = Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            name,
            mtu: config.mtu,
        };
        tun.setup_routing(&config).await?;

        Ok(tun)
    }

    /// Route the included networks through the device
    async fn setup_routing(&self, config: &TunConfig) -> NetworkResult<()> {
        use tokio::process::Command;

        for route in &config.included_routes {
            let target = format!("{}/{}", route.destination, route.prefix_len());
            let output = Command::new("route")
                .args(["-n", "add", "-net", &target, "-interface", &self.name])
                .output()
                .await?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!("Route add for {} failed: {}", target, stderr.trim());
            } else {
                debug!("Routed {} through {}", target, self.name);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl PacketFlow for MacOsTun {
    async fn read_packets(&self) -> NetworkResult<Vec<Packet>> {
        let mut buf = vec![0u8; usize::from(self.mtu) + FAMILY_HEADER_LEN];
        let mut reader = self.reader.lock().await;

        loop {
            let n = reader.read(&mut buf).await.map_err(|e| {
                NetworkError::TunError(format!("Failed to read from TUN: {}", e))
            })?;

            if n == 0 {
                return Err(NetworkError::FlowClosed);
            }
            if n <= FAMILY_HEADER_LEN {
                continue;
            }

            // utun prefixes every frame with the protocol family in network order
            let raw = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            match AddressFamily::from_raw(raw) {
                Some(family) => {
                    return Ok(vec![Packet::new(family, buf[FAMILY_HEADER_LEN..n].to_vec())]);
                }
                None => debug!("Dropping frame with unknown protocol family {}", raw),
            }
        }
    }

    async fn write_packet(&self, packet: Packet) -> NetworkResult<()> {
        let family = match packet.family() {
            AddressFamily::Ipv4 => AddressFamily::AF_INET,
            AddressFamily::Ipv6 => AddressFamily::AF_INET6_DARWIN,
        };

        let mut buf = Vec::with_capacity(packet.len() + FAMILY_HEADER_LEN);
        buf.extend_from_slice(&family.to_be_bytes());
        buf.extend_from_slice(packet.data());

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await.map_err(|e| {
            NetworkError::TunError(format!("Failed to write to TUN: {}", e))
        })?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
