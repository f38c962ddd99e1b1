//! Host packet flow
//!
//! The ingest loop only sees the [`PacketFlow`] trait. Platform TUN devices
//! implement it for:
//! - Linux (using tun crate)
//! - macOS (using tun crate)

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::NetworkResult;
use crate::packet::Packet;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::MacOsTun;

/// IPv4 route sent through the tunnel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Route {
    pub destination: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl Ipv4Route {
    pub fn new(destination: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            destination,
            netmask,
        }
    }

    /// Prefix length of the netmask
    pub fn prefix_len(&self) -> u32 {
        u32::from(self.netmask).count_ones()
    }
}

/// Tunnel interface settings
#[derive(Clone, Debug)]
pub struct TunConfig {
    /// Device name (e.g., "pingtun0")
    pub name: String,

    /// Interface address
    pub address: Ipv4Addr,

    /// Interface netmask
    pub netmask: Ipv4Addr,

    /// Routes sent through the interface
    pub included_routes: Vec<Ipv4Route>,

    /// Maximum transmission unit
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: "pingtun0".to_string(),
            address: Ipv4Addr::new(192, 168, 123, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 255),
            included_routes: vec![Ipv4Route::new(
                Ipv4Addr::new(192, 168, 123, 0),
                Ipv4Addr::new(255, 255, 255, 0),
            )],
            mtu: 1500,
        }
    }
}

impl TunConfig {
    /// Validate settings
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Interface name must not be empty".into());
        }
        if self.mtu < 576 {
            return Err(format!("MTU {} is below the IPv4 minimum of 576", self.mtu));
        }
        for route in &self.included_routes {
            let mask = u32::from(route.netmask);
            if mask.leading_ones() != mask.count_ones() {
                return Err(format!("Route netmask {} is not contiguous", route.netmask));
            }
        }
        Ok(())
    }
}

/// Packet I/O with the host networking stack
#[async_trait]
pub trait PacketFlow: Send + Sync {
    /// Wait until at least one inbound packet is available and return them all
    async fn read_packets(&self) -> NetworkResult<Vec<Packet>>;

    /// Hand a packet back to the host
    async fn write_packet(&self, packet: Packet) -> NetworkResult<()>;

    /// Interface name
    fn name(&self) -> &str;
}

/// Opens packet flows for a tunnel session
#[async_trait]
pub trait FlowFactory: Send + Sync {
    async fn open(&self, config: &TunConfig) -> NetworkResult<Arc<dyn PacketFlow>>;
}

/// Opens a TUN device on the current platform
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTun;

#[async_trait]
impl FlowFactory for SystemTun {
    async fn open(&self, config: &TunConfig) -> NetworkResult<Arc<dyn PacketFlow>> {
        create_flow(config.clone()).await
    }
}

/// Create a TUN device for the current platform
pub async fn create_flow(config: TunConfig) -> NetworkResult<Arc<dyn PacketFlow>> {
    config
        .validate()
        .map_err(crate::error::NetworkError::ConfigError)?;

    #[cfg(target_os = "linux")]
    {
        let tun = LinuxTun::create(config).await?;
        Ok(Arc::new(tun))
    }

    #[cfg(target_os = "macos")]
    {
        let tun = MacOsTun::create(config).await?;
        Ok(Arc::new(tun))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(crate::error::NetworkError::PlatformNotSupported)
    }
}
