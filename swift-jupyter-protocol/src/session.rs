//! Session object: message creation and the IOPub publish surface
//!
//! The `KernelSession` is the single place that creates outbound messages, so
//! every message carries the session identity and, where one is active, the
//! parent header of the request being serviced. All sends go through one FIFO
//! queue, which keeps the ordering guarantee that stream output published
//! during an execution reaches the transport before the execute reply that
//! follows it.
//!
//! The publish surface is synchronous and thread-safe: background threads
//! (the stdout drain) call it directly while the event loop owns everything
//! else.

use anyhow::Result;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};

use crate::message::{channel, MessageHeader, WireMessage};
use crate::transport::Transport;

/// Stream name for `stream` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamName {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl StreamName {
    /// Protocol name of the stream
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// An outbound message queued for the transport
#[derive(Debug)]
pub struct Outbound {
    /// Channel to send on
    pub channel: &'static str,
    /// The message itself
    pub message: WireMessage,
}

/// Session object shared between the event loop and background publishers
#[derive(Clone)]
pub struct KernelSession {
    session_id: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    current_parent: Arc<RwLock<Option<MessageHeader>>>,
}

impl KernelSession {
    /// Create a session and the receiving end of its outbound queue
    pub fn new(session_id: &str) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                session_id: session_id.to_string(),
                outbound: tx,
                current_parent: Arc::new(RwLock::new(None)),
            },
            rx,
        )
    }

    /// Session identifier
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Set the parent header for subsequent broadcasts
    #[instrument(level = "trace", skip_all)]
    pub fn set_parent_header(&self, parent: MessageHeader) {
        trace!("setting parent header: msg_id={}", parent.msg_id);
        *self.current_parent.write() = Some(parent);
    }

    /// Clear the current parent header
    pub fn clear_parent_header(&self) {
        *self.current_parent.write() = None;
    }

    /// Parent header of the request currently being serviced, if any
    pub fn current_parent(&self) -> Option<MessageHeader> {
        self.current_parent.read().clone()
    }

    fn enqueue(&self, channel: &'static str, message: WireMessage) -> Result<()> {
        self.outbound
            .send(Outbound { channel, message })
            .map_err(|_| anyhow::anyhow!("outbound queue closed"))
    }

    /// Send a message with an explicit parent header
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound queue has been closed.
    pub fn send(
        &self,
        channel: &'static str,
        msg_type: &str,
        content: Value,
        parent: Option<&MessageHeader>,
    ) -> Result<()> {
        let message = WireMessage {
            header: MessageHeader::new(msg_type, &self.session_id),
            parent_header: parent.cloned(),
            metadata: json!({}),
            content,
        };
        self.enqueue(channel, message)
    }

    /// Send a reply to a request on the channel the request arrived on
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound queue has been closed.
    pub fn reply(&self, channel: &'static str, request: &WireMessage, content: Value) -> Result<()> {
        self.send(
            channel,
            &request.reply_type(),
            content,
            Some(&request.header),
        )
    }

    fn publish(&self, msg_type: &str, content: Value) -> Result<()> {
        let parent = self.current_parent();
        self.send(channel::IOPUB, msg_type, content, parent.as_ref())
    }

    /// Publish stream output under the current parent header
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound queue has been closed.
    #[instrument(level = "trace", skip(self, text))]
    pub fn publish_stream(&self, name: StreamName, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        trace!("publishing {} bytes to {}", text.len(), name.as_str());
        self.publish(
            "stream",
            json!({ "name": name.as_str(), "text": text }),
        )
    }

    /// Publish a kernel status update (`busy`, `idle`, `starting`)
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound queue has been closed.
    pub fn publish_status(&self, state: &str) -> Result<()> {
        debug!("publishing status: {}", state);
        self.publish("status", json!({ "execution_state": state }))
    }

    /// Re-broadcast submitted code before running it
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound queue has been closed.
    pub fn publish_execute_input(&self, code: &str, execution_count: u32) -> Result<()> {
        self.publish(
            "execute_input",
            json!({ "code": code, "execution_count": execution_count }),
        )
    }

    /// Publish the result value of an execution
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound queue has been closed.
    pub fn publish_execute_result(
        &self,
        execution_count: u32,
        data: Map<String, Value>,
    ) -> Result<()> {
        self.publish(
            "execute_result",
            json!({
                "execution_count": execution_count,
                "data": data,
                "metadata": {},
            }),
        )
    }

    /// Publish display data
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound queue has been closed.
    pub fn publish_display_data(&self, data: Map<String, Value>) -> Result<()> {
        self.publish("display_data", json!({ "data": data, "metadata": {} }))
    }

    /// Publish a structured error
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound queue has been closed.
    pub fn publish_error(&self, ename: &str, evalue: &str, traceback: &[String]) -> Result<()> {
        self.publish(
            "error",
            json!({ "ename": ename, "evalue": evalue, "traceback": traceback }),
        )
    }

    /// Forward queued outbound messages to the transport until the queue closes
    ///
    /// Runs as a background task for the lifetime of the kernel. Forwarding is
    /// strictly FIFO across all channels.
    pub async fn pump(
        mut rx: mpsc::UnboundedReceiver<Outbound>,
        transport: Arc<dyn Transport>,
    ) {
        while let Some(out) = rx.recv().await {
            let parts = match out.message.to_parts() {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("dropping unencodable outbound message: {}", e);
                    continue;
                }
            };
            if let Err(e) = transport.send(out.channel, parts).await {
                warn!("transport send on {} failed: {}", out.channel, e);
            }
        }
        debug!("outbound queue closed, pump exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stream_message_carries_parent() {
        let (session, mut rx) = KernelSession::new("s1");
        let parent = MessageHeader::new("execute_request", "client");
        session.set_parent_header(parent.clone());
        session.publish_stream(StreamName::Stdout, "hi\n").unwrap();

        let out = rx.try_recv().unwrap();
        assert_eq!(out.channel, channel::IOPUB);
        assert_eq!(out.message.msg_type(), "stream");
        assert_eq!(
            out.message.parent_header.as_ref().unwrap().msg_id,
            parent.msg_id
        );
        assert_eq!(out.message.content["text"], "hi\n");
    }

    #[test]
    fn test_empty_stream_text_is_not_published() {
        let (session, mut rx) = KernelSession::new("s1");
        session.publish_stream(StreamName::Stdout, "").unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reply_goes_to_request_channel_with_parent() {
        let (session, mut rx) = KernelSession::new("s1");
        let request = WireMessage::request("kernel_info_request", json!({}), "client");
        session
            .reply(channel::SHELL, &request, json!({"status": "ok"}))
            .unwrap();

        let out = rx.try_recv().unwrap();
        assert_eq!(out.channel, channel::SHELL);
        assert_eq!(out.message.msg_type(), "kernel_info_reply");
        assert_eq!(
            out.message.parent_header.as_ref().unwrap().msg_id,
            request.header.msg_id
        );
    }

    #[test]
    fn test_queue_is_fifo_across_channels() {
        let (session, mut rx) = KernelSession::new("s1");
        session.publish_stream(StreamName::Stdout, "A").unwrap();
        session.publish_stream(StreamName::Stdout, "B").unwrap();
        let request = WireMessage::request("execute_request", json!({}), "client");
        session
            .reply(channel::SHELL, &request, json!({"status": "ok"}))
            .unwrap();

        assert_eq!(rx.try_recv().unwrap().message.content["text"], "A");
        assert_eq!(rx.try_recv().unwrap().message.content["text"], "B");
        assert_eq!(rx.try_recv().unwrap().message.msg_type(), "execute_reply");
    }
}
