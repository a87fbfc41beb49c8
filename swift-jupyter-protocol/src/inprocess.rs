//! In-process transport for embedded kernel mode
//!
//! Uses tokio channels for communication between a kernel and a client in
//! the same process. The paired constructor wires two transports so that
//! what one sends on a channel, the other receives on the same channel.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::transport::{Transport, TransportConfig};

/// One direction of a channel
struct ChannelPair {
    sender: mpsc::UnboundedSender<Vec<Vec<u8>>>,
    receiver: Arc<RwLock<mpsc::UnboundedReceiver<Vec<Vec<u8>>>>>,
}

impl ChannelPair {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: tx,
            receiver: Arc::new(RwLock::new(rx)),
        }
    }
}

/// In-process transport using tokio channels
#[derive(Clone, Default)]
pub struct InProcessTransport {
    /// Channels this transport sends on
    outgoing: Arc<RwLock<HashMap<String, Arc<ChannelPair>>>>,
    /// Channels this transport receives on
    incoming: Arc<RwLock<HashMap<String, Arc<ChannelPair>>>>,
}

impl InProcessTransport {
    /// Create a new, unconnected in-process transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connected (kernel, client) transport pair for the channels in
    /// `config`
    pub fn create_pair(config: &TransportConfig) -> (Self, Self) {
        let kernel = Self::new();
        let client = Self::new();
        for name in config.channels.keys() {
            Self::pair_channel(&kernel, &client, name);
        }
        (kernel, client)
    }

    /// Wire one named channel between two transports
    fn pair_channel(a: &Self, b: &Self, name: &str) {
        let a_to_b = Arc::new(ChannelPair::new());
        let b_to_a = Arc::new(ChannelPair::new());

        a.outgoing.write().insert(name.to_string(), a_to_b.clone());
        b.incoming.write().insert(name.to_string(), a_to_b);
        b.outgoing.write().insert(name.to_string(), b_to_a.clone());
        a.incoming.write().insert(name.to_string(), b_to_a);

        trace!("paired in-process channel '{}'", name);
    }

    /// Set up a loopback channel (send and receive on the same transport)
    fn setup_loopback(&self, name: &str) {
        if self.outgoing.read().contains_key(name) {
            return;
        }
        let pair = Arc::new(ChannelPair::new());
        self.outgoing.write().insert(name.to_string(), pair.clone());
        self.incoming.write().insert(name.to_string(), pair);
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn bind(&mut self, config: &TransportConfig) -> Result<()> {
        debug!(
            "binding in-process transport to {} channels",
            config.channels.len()
        );
        for name in config.channels.keys() {
            if !self.has_channel(name) {
                self.setup_loopback(name);
            }
        }
        Ok(())
    }

    async fn connect(&mut self, config: &TransportConfig) -> Result<()> {
        debug!(
            "connecting in-process transport to {} channels",
            config.channels.len()
        );
        for name in config.channels.keys() {
            if !self.has_channel(name) {
                self.setup_loopback(name);
            }
        }
        Ok(())
    }

    async fn recv(&self, channel: &str) -> Result<Option<Vec<Vec<u8>>>> {
        let pair = self.incoming.read().get(channel).cloned();
        let Some(pair) = pair else {
            return Ok(None);
        };
        let mut receiver = pair.receiver.write();
        match receiver.try_recv() {
            Ok(message) => {
                trace!(
                    "received message on channel {}: {} parts",
                    channel,
                    message.len()
                );
                Ok(Some(message))
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(anyhow::anyhow!("channel {} disconnected", channel))
            }
        }
    }

    async fn send(&self, channel: &str, parts: Vec<Vec<u8>>) -> Result<()> {
        let pair = self.outgoing.read().get(channel).cloned();
        let Some(pair) = pair else {
            return Err(anyhow::anyhow!("channel {} not found", channel));
        };
        pair.sender
            .send(parts)
            .map_err(|_| anyhow::anyhow!("channel {} closed", channel))
    }

    fn has_channel(&self, channel: &str) -> bool {
        self.outgoing.read().contains_key(channel)
    }

    fn channels(&self) -> Vec<String> {
        self.outgoing.read().keys().cloned().collect()
    }

    async fn shutdown(&mut self) -> Result<()> {
        debug!("shutting down in-process transport");
        Ok(())
    }

    fn box_clone(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_paired_transports_exchange_messages() {
        let config = TransportConfig::standard("inprocess");
        let (kernel, client) = InProcessTransport::create_pair(&config);

        let message = vec![b"test".to_vec(), b"message".to_vec()];
        client.send("shell", message.clone()).await.unwrap();

        let received = kernel.recv("shell").await.unwrap();
        assert_eq!(received, Some(message));

        let reply = vec![b"reply".to_vec()];
        kernel.send("shell", reply.clone()).await.unwrap();
        let received = client.recv("shell").await.unwrap();
        assert_eq!(received, Some(reply));
    }

    #[tokio::test]
    async fn test_recv_is_non_blocking() {
        let config = TransportConfig::standard("inprocess");
        let (kernel, _client) = InProcessTransport::create_pair(&config);
        assert_eq!(kernel.recv("shell").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bind_creates_missing_channels() {
        let mut transport = InProcessTransport::new();
        let config = TransportConfig::standard("inprocess");
        transport.bind(&config).await.unwrap();

        assert!(transport.has_channel("shell"));
        assert!(transport.has_channel("iopub"));
        assert!(!transport.has_channel("unknown"));
        assert_eq!(transport.channels().len(), 5);
    }
}
