//! Public tunnel state

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::ConnectionStatus;

/// Caller intent waiting for the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelRequest {
    #[default]
    None,
    Detect,
    Start,
    Stop,
}

/// State published to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    #[default]
    Detecting,
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Detecting => "detecting",
            TunnelState::Disconnected => "disconnected",
            TunnelState::Connecting => "connecting",
            TunnelState::Connected => "connected",
            TunnelState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

impl TunnelState {
    /// Derive the public state from the live status and the unconsumed request.
    ///
    /// While the connection is moving, a pending start or stop wins over the
    /// raw status so the direction of travel is shown.
    pub fn derive(status: ConnectionStatus, pending: TunnelRequest) -> Self {
        if status.is_transitional() {
            match pending {
                TunnelRequest::Start => return TunnelState::Connecting,
                TunnelRequest::Stop => return TunnelState::Disconnecting,
                TunnelRequest::None | TunnelRequest::Detect => {}
            }
        }

        match status {
            ConnectionStatus::Invalid | ConnectionStatus::Disconnected => TunnelState::Disconnected,
            ConnectionStatus::Connecting | ConnectionStatus::Reasserting => TunnelState::Connecting,
            ConnectionStatus::Connected => TunnelState::Connected,
            ConnectionStatus::Disconnecting => TunnelState::Disconnecting,
        }
    }

    /// Whether a toggle bound to this state shows "on"
    pub fn is_on(self) -> bool {
        matches!(self, TunnelState::Connecting | TunnelState::Connected)
    }
}
