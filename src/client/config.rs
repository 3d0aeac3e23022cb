//! Scene client configuration

use crate::error::Result;
use crate::transport::TransportConfig;
use crate::types::ParticipantIdentifier;

/// Scene client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity announced to renderers
    pub identity: ParticipantIdentifier,

    /// Transport settings
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identity: ParticipantIdentifier::unresolved(2, "client"),
            transport: TransportConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(identity: ParticipantIdentifier) -> Self {
        Self {
            identity,
            ..Default::default()
        }
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.transport.validate()
    }
}
