//! Null transport for testing
//!
//! Accepts every send and never produces a message, so individual components
//! can be tested without a full transport in place.

use anyhow::Result;
use async_trait::async_trait;

use crate::transport::{Transport, TransportConfig};

/// Null transport - does nothing but succeeds
#[derive(Default)]
pub struct NullTransport {
    channels: Vec<String>,
}

impl NullTransport {
    /// Create a null transport
    pub const fn new() -> Self {
        Self { channels: vec![] }
    }
}

#[async_trait]
impl Transport for NullTransport {
    async fn bind(&mut self, config: &TransportConfig) -> Result<()> {
        self.channels = config.channels.keys().cloned().collect();
        Ok(())
    }

    async fn connect(&mut self, config: &TransportConfig) -> Result<()> {
        self.channels = config.channels.keys().cloned().collect();
        Ok(())
    }

    async fn recv(&self, _channel: &str) -> Result<Option<Vec<Vec<u8>>>> {
        Ok(None)
    }

    async fn send(&self, _channel: &str, _parts: Vec<Vec<u8>>) -> Result<()> {
        Ok(())
    }

    fn has_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    fn channels(&self) -> Vec<String> {
        self.channels.clone()
    }

    fn box_clone(&self) -> Box<dyn Transport> {
        Box::new(Self {
            channels: self.channels.clone(),
        })
    }
}
