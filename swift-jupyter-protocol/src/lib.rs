//! # Swift Jupyter Protocol
//!
//! Message model, session object and transport seam consumed by the Swift
//! kernel core. This crate owns everything the kernel needs from the Jupyter
//! messaging layer:
//! - the message envelope (header, parent header, metadata, content),
//! - a `KernelSession` that creates correctly-attributed messages, tracks the
//!   current parent header for background publishers, and exposes a
//!   thread-safe IOPub publish surface,
//! - the `Transport` abstraction with an in-process implementation for
//!   embedded use and tests.
//!
//! Wire-level concerns (ZeroMQ sockets, HMAC signatures, heartbeat) live in
//! the transport implementations, never in the kernel core.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod inprocess;
pub mod message;
pub mod null;
pub mod session;
pub mod transport;

pub use inprocess::InProcessTransport;
pub use message::{channel, MessageHeader, WireMessage};
pub use null::NullTransport;
pub use session::{KernelSession, Outbound, StreamName};
pub use transport::{create_transport, BoxedTransport, ChannelConfig, Transport, TransportConfig};

/// Jupyter wire protocol version spoken by this crate
pub const PROTOCOL_VERSION: &str = "5.4";
