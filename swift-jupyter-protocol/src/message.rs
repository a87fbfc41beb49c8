//! Jupyter message envelope
//!
//! The envelope format of messaging protocol 5.4: a header identifying the
//! message, an optional parent header correlating it to the request that
//! caused it, free-form metadata, and a typed content payload.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Channel names used by the kernel
pub mod channel {
    /// Request/reply channel for execution and introspection
    pub const SHELL: &str = "shell";
    /// Out-of-band channel for interrupt and shutdown
    pub const CONTROL: &str = "control";
    /// Broadcast channel for streams, results and status
    pub const IOPUB: &str = "iopub";
    /// Reverse channel for input requests
    pub const STDIN: &str = "stdin";
    /// Liveness channel, echoed verbatim by the transport
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Message header for identification and correlation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Message ID
    pub msg_id: String,
    /// Session ID
    pub session: String,
    /// Username
    pub username: String,
    /// Message type
    pub msg_type: String,
    /// Protocol version
    pub version: String,
    /// Timestamp
    pub date: String,
}

impl MessageHeader {
    /// Create a new message header
    pub fn new(msg_type: &str, session: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            session: session.to_string(),
            username: "kernel".to_string(),
            msg_type: msg_type.to_string(),
            version: crate::PROTOCOL_VERSION.to_string(),
            date: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// A complete protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message header
    pub header: MessageHeader,
    /// Header of the request this message answers or accompanies
    pub parent_header: Option<MessageHeader>,
    /// Free-form metadata
    pub metadata: Value,
    /// Typed content payload
    pub content: Value,
}

impl WireMessage {
    /// Create a request message, as a client would
    pub fn request(msg_type: &str, content: Value, session: &str) -> Self {
        Self {
            header: MessageHeader::new(msg_type, session),
            parent_header: None,
            metadata: json!({}),
            content,
        }
    }

    /// Message type of this message
    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Reply type for a request (`execute_request` → `execute_reply`)
    pub fn reply_type(&self) -> String {
        match self.header.msg_type.strip_suffix("_request") {
            Some(base) => format!("{base}_reply"),
            None => format!("{}_reply", self.header.msg_type),
        }
    }

    /// Encode into multipart form for a transport
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_parts(&self) -> Result<Vec<Vec<u8>>> {
        Ok(vec![serde_json::to_vec(self)?])
    }

    /// Decode from multipart form received from a transport
    ///
    /// # Errors
    ///
    /// Returns an error if the parts do not form a valid message.
    pub fn from_parts(parts: &[Vec<u8>]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty multipart message"))?;
        Ok(serde_json::from_slice(first)?)
    }
}
