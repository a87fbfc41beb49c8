//! Shared harness: a kernel over an in-process transport pair, driven by a
//! scripted debugger backend, plus a small client for the other side.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use swift_jupyter_kernel::debugger::scripted::{Script, ScriptedBackend};
use swift_jupyter_kernel::debugger::DebuggerBackend;
use swift_jupyter_kernel::supervisor::BackendFactory;
use swift_jupyter_kernel::{Kernel, KernelConfig};
use swift_jupyter_protocol::{
    channel, InProcessTransport, Transport, TransportConfig, WireMessage,
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestClient {
    transport: InProcessTransport,
}

impl TestClient {
    pub async fn send(&self, chan: &str, msg_type: &str, content: Value) -> WireMessage {
        let message = WireMessage::request(msg_type, content, "test-client");
        self.transport
            .send(chan, message.to_parts().unwrap())
            .await
            .unwrap();
        message
    }

    pub async fn execute(&self, code: &str) -> WireMessage {
        self.send(
            channel::SHELL,
            "execute_request",
            json!({ "code": code, "silent": false, "store_history": true }),
        )
        .await
    }

    pub async fn try_recv_on(&self, chan: &str, timeout: Duration) -> Option<WireMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(parts)) = self.transport.recv(chan).await {
                return Some(WireMessage::from_parts(&parts).unwrap());
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    pub async fn recv_on(&self, chan: &str) -> WireMessage {
        self.try_recv_on(chan, RECV_TIMEOUT)
            .await
            .unwrap_or_else(|| panic!("timed out waiting for a message on {chan}"))
    }

    /// Receive until the reply correlated to `request` arrives on `chan`
    pub async fn reply_for(&self, chan: &str, request: &WireMessage) -> WireMessage {
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for a reply to {}",
                request.msg_type()
            );
            let Some(message) = self.try_recv_on(chan, RECV_TIMEOUT).await else {
                continue;
            };
            let matches = message
                .parent_header
                .as_ref()
                .is_some_and(|parent| parent.msg_id == request.header.msg_id);
            if matches && message.msg_type().ends_with("_reply") {
                return message;
            }
        }
    }

    /// Collect IOPub traffic for `request` until its `idle` status, exclusive
    pub async fn iopub_until_idle(&self, request: &WireMessage) -> Vec<WireMessage> {
        let mut collected = Vec::new();
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for idle after {}",
                request.msg_type()
            );
            let Some(message) = self.try_recv_on(channel::IOPUB, RECV_TIMEOUT).await else {
                continue;
            };
            let ours = message
                .parent_header
                .as_ref()
                .is_some_and(|parent| parent.msg_id == request.header.msg_id);
            if !ours {
                continue;
            }
            if message.msg_type() == "status"
                && message.content["execution_state"] == "idle"
            {
                return collected;
            }
            collected.push(message);
        }
    }

    /// Concatenated text of the stream messages in `messages`
    pub fn stream_text(messages: &[WireMessage]) -> String {
        messages
            .iter()
            .filter(|m| m.msg_type() == "stream")
            .filter_map(|m| m.content["text"].as_str())
            .collect()
    }

    /// Execute `code` and return (reply, iopub traffic until idle)
    pub async fn run_cell(&self, code: &str) -> (WireMessage, Vec<WireMessage>) {
        let request = self.execute(code).await;
        let iopub = self.iopub_until_idle(&request).await;
        let reply = self.reply_for(channel::SHELL, &request).await;
        (reply, iopub)
    }
}

pub fn scripted_factory(script: Script) -> BackendFactory {
    Box::new(move |_config| {
        let backend: Box<dyn DebuggerBackend> =
            Box::new(ScriptedBackend::from_script(script.clone()));
        Ok(backend)
    })
}

pub async fn start_kernel_with(script: Script, config: KernelConfig) -> TestClient {
    start_kernel_with_factory(scripted_factory(script), config).await
}

pub async fn start_kernel_with_factory(
    factory: BackendFactory,
    config: KernelConfig,
) -> TestClient {
    swift_jupyter_kernel::logging::init();
    let transport_config = TransportConfig::standard("inprocess");
    let (kernel_side, client_side) = InProcessTransport::create_pair(&transport_config);
    let kernel = Kernel::new(config, Arc::new(kernel_side), factory);
    tokio::spawn(kernel.run());
    TestClient {
        transport: client_side,
    }
}

pub async fn start_kernel(script: Script) -> TestClient {
    start_kernel_with(script, KernelConfig::default()).await
}
