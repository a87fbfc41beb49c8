//! Transport trait for generic message passing
//!
//! The transport layer moves opaque multipart messages over named channels
//! and knows nothing about message semantics. Wire framing, signing and
//! heartbeat echo belong to the implementation behind this trait.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Generic transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport type (e.g., "inprocess", "tcp")
    pub transport_type: String,
    /// Base address, where the transport has one
    pub base_address: String,
    /// Channel to endpoint mapping
    pub channels: HashMap<String, ChannelConfig>,
}

impl TransportConfig {
    /// Configuration for the standard kernel channel set on one transport type
    pub fn standard(transport_type: &str) -> Self {
        let mut channels = HashMap::new();
        for name in [
            crate::message::channel::SHELL,
            crate::message::channel::CONTROL,
            crate::message::channel::IOPUB,
            crate::message::channel::STDIN,
            crate::message::channel::HEARTBEAT,
        ] {
            channels.insert(
                name.to_string(),
                ChannelConfig {
                    endpoint: String::new(),
                    pattern: String::new(),
                },
            );
        }
        Self {
            transport_type: transport_type.to_string(),
            base_address: String::new(),
            channels,
        }
    }
}

/// Configuration for a single channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Port number or endpoint suffix
    pub endpoint: String,
    /// Socket pattern (e.g., "router", "pub")
    pub pattern: String,
}

/// Generic transport for sending/receiving multipart messages
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind to the configured endpoints (kernel side)
    async fn bind(&mut self, config: &TransportConfig) -> Result<()>;

    /// Connect to the configured endpoints (client side)
    async fn connect(&mut self, config: &TransportConfig) -> Result<()>;

    /// Receive a multipart message from a channel.
    /// Returns `None` if no message is available (non-blocking).
    async fn recv(&self, channel: &str) -> Result<Option<Vec<Vec<u8>>>>;

    /// Send a multipart message to a channel
    async fn send(&self, channel: &str, parts: Vec<Vec<u8>>) -> Result<()>;

    /// Check whether a channel exists and is ready
    fn has_channel(&self, channel: &str) -> bool;

    /// List available channels
    fn channels(&self) -> Vec<String>;

    /// Shut the transport down gracefully
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Clone the transport for multi-threaded usage
    fn box_clone(&self) -> Box<dyn Transport>;
}

/// Boxed transport for dynamic dispatch
pub type BoxedTransport = Box<dyn Transport>;

/// Create a transport by type name
///
/// # Errors
///
/// Returns an error if the transport type is unknown.
pub fn create_transport(transport_type: &str) -> Result<BoxedTransport> {
    match transport_type {
        "inprocess" | "inproc" => Ok(Box::new(crate::inprocess::InProcessTransport::new())),
        "null" => Ok(Box::new(crate::null::NullTransport::new())),
        _ => Err(anyhow::anyhow!(
            "Unknown transport type: {}",
            transport_type
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_config_covers_kernel_channels() {
        let config = TransportConfig::standard("inprocess");
        for name in ["shell", "control", "iopub", "stdin", "heartbeat"] {
            assert!(config.channels.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn test_create_transport_rejects_unknown() {
        assert!(create_transport("carrier-pigeon").is_err());
        assert!(create_transport("inprocess").is_ok());
        assert!(create_transport("null").is_ok());
    }
}
