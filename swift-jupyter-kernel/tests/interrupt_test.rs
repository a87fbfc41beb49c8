//! Interrupt delivery: control-channel liveness during execution, interrupted
//! execute replies, recovery afterwards, and the no-process error.

mod common;

use common::{start_kernel, start_kernel_with_factory, TestClient};
use serde_json::json;
use std::time::{Duration, Instant};
use swift_jupyter_kernel::debugger::scripted::{Script, ScriptedReply};
use swift_jupyter_kernel::KernelConfig;
use swift_jupyter_protocol::channel;

#[tokio::test]
async fn test_interrupt_liveness_and_interrupted_reply() {
    let script = Script::new().on("while true {}", ScriptedReply::BlockUntilInterrupt);
    let client = start_kernel(script).await;

    let execute = client.execute("while true {}").await;
    // Give the evaluation time to enter its loop.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let interrupt = client
        .send(channel::CONTROL, "interrupt_request", json!({}))
        .await;
    let interrupt_reply = client.reply_for(channel::CONTROL, &interrupt).await;
    let latency = started.elapsed();

    assert_eq!(interrupt_reply.content["status"], "ok");
    assert!(
        latency <= Duration::from_millis(250),
        "interrupt_reply took {latency:?}"
    );

    let reply = client.reply_for(channel::SHELL, &execute).await;
    assert_eq!(reply.content["status"], "error");
    assert_eq!(reply.content["ename"], "Interrupted");

    // The kernel answers normally afterwards.
    let (reply, iopub) = client.run_cell("print(1)").await;
    assert_eq!(reply.content["status"], "ok");
    assert_eq!(TestClient::stream_text(&iopub), "1\n");
}

#[tokio::test]
async fn test_interrupt_without_process_reports_no_process() {
    let failing: swift_jupyter_kernel::BackendFactory =
        Box::new(|_config: &KernelConfig| Err(anyhow::anyhow!("repl_swift not found")));
    let client = start_kernel_with_factory(failing, KernelConfig::default()).await;

    let interrupt = client
        .send(channel::CONTROL, "interrupt_request", json!({}))
        .await;
    let reply = client.reply_for(channel::CONTROL, &interrupt).await;
    assert_eq!(reply.content["status"], "error");
    assert_eq!(reply.content["ename"], "NoProcess");
}

#[tokio::test]
async fn test_degraded_kernel_reports_startup_failure_on_execute() {
    let failing: swift_jupyter_kernel::BackendFactory =
        Box::new(|_config: &KernelConfig| Err(anyhow::anyhow!("repl_swift not found")));
    let client = start_kernel_with_factory(failing, KernelConfig::default()).await;

    let (reply, _) = client.run_cell("print(1)").await;
    assert_eq!(reply.content["status"], "error");
    assert_eq!(reply.content["ename"], "FatalError");
    assert!(reply.content["evalue"]
        .as_str()
        .unwrap()
        .contains("repl_swift not found"));
}

#[tokio::test]
async fn test_interrupt_is_idempotent() {
    let script = Script::new().on("while true {}", ScriptedReply::BlockUntilInterrupt);
    let client = start_kernel(script).await;

    let execute = client.execute("while true {}").await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    for _ in 0..3 {
        let interrupt = client
            .send(channel::CONTROL, "interrupt_request", json!({}))
            .await;
        let reply = client.reply_for(channel::CONTROL, &interrupt).await;
        assert_eq!(reply.content["status"], "ok");
    }

    let reply = client.reply_for(channel::SHELL, &execute).await;
    assert_eq!(reply.content["ename"], "Interrupted");

    let (reply, _) = client.run_cell("print(2)").await;
    assert_eq!(reply.content["status"], "ok");
}
