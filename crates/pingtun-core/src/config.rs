//! Core configuration

use serde::{Deserialize, Serialize};

use crate::store::{ProtocolKind, TunnelProfile};

/// Settings the coordinator uses when it has to create a configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Name shown for the tunnel
    pub description: String,

    /// Identifier of the packet tunnel provider
    pub provider_id: String,

    /// Nominal server address; required by the store but not used for routing
    pub server_address: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            description: "Ping Tunnel".to_string(),
            provider_id: "pingtun.provider".to_string(),
            server_address: "TunnelServer".to_string(),
        }
    }
}

impl CoreConfig {
    /// Profile saved when no usable configuration exists
    pub fn profile(&self) -> TunnelProfile {
        TunnelProfile {
            description: self.description.clone(),
            provider_id: self.provider_id.clone(),
            server_address: self.server_address.clone(),
            protocol: ProtocolKind::PacketTunnel,
            enabled: true,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.description.trim().is_empty() {
            return Err("Tunnel description must not be empty".into());
        }
        if self.provider_id.trim().is_empty() {
            return Err("Provider identifier must not be empty".into());
        }
        if self.server_address.trim().is_empty() {
            return Err("Server address must not be empty".into());
        }
        Ok(())
    }
}
