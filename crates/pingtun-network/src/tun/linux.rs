//! Linux TUN device implementation

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{PacketFlow, TunConfig};
use crate::error::{NetworkError, NetworkResult};
use crate::packet::{AddressFamily, Packet};

/// Linux TUN device
pub struct LinuxTun {
    reader: tokio::sync::Mutex<tokio::io::ReadHalf<tun::AsyncDevice>>,
    writer: tokio::sync::Mutex<tokio::io::WriteHalf<tun::AsyncDevice>>,
    name: String,
    mtu: u16,
}

impl LinuxTun {
    /// Create a new Linux TUN device
    pub async fn create(config: TunConfig) -> NetworkResult<Self> {
        let mut tun_config = tun::Configuration::default();

        tun_config
            .name(&config.name)
            .address(config.address)
            .netmask(config.netmask)
            .mtu(i32::from(config.mtu))
            .up();

        // Raw IP datagrams, no packet information prefix
        tun_config.platform(|platform| {
            platform.packet_information(false);
        });

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
            let output = Command::new("ip")
                .args(["route", "replace", &target, "dev", &self.name])
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
impl PacketFlow for LinuxTun {
    async fn read_packets(&self) -> NetworkResult<Vec<Packet>> {
        let mut buf = vec![0u8; usize::from(self.mtu) + 4];
        let mut reader = self.reader.lock().await;

        loop {
            let n = reader.read(&mut buf).await.map_err(|e| {
                NetworkError::TunError(format!("Failed to read from TUN: {}", e))
            })?;

            if n == 0 {
                return Err(NetworkError::FlowClosed);
            }

            match AddressFamily::from_version_nibble(&buf[..n]) {
                Some(family) => return Ok(vec![Packet::new(family, buf[..n].to_vec())]),
                None => debug!("Dropping {} byte frame with unknown IP version", n),
            }
        }
    }

    async fn write_packet(&self, packet: Packet) -> NetworkResult<()> {
        let mut writer = self.writer.lock().await;

        writer.write_all(packet.data()).await.map_err(|e| {
            NetworkError::TunError(format!("Failed to write to TUN: {}", e))
        })?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
