//! Package install: the five-phase protocol against a stub builder, the
//! install-ordering invariant, build failure modes, timeout, and load
//! failure diagnostics.

mod common;

use common::{start_kernel_with, TestClient};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use swift_jupyter_kernel::debugger::scripted::{Script, ScriptedReply};
use swift_jupyter_kernel::KernelConfig;

/// Write an executable stub builder script
fn write_builder(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("stub-swift-build");
    let script = format!("#!/bin/sh\n{body}\n");
    std::fs::write(&path, script).unwrap();
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();
    path
}

fn install_config(dir: &Path, builder_body: &str) -> KernelConfig {
    let mut config = KernelConfig::default();
    config.install_root = dir.join("cache");
    config.swift_build_path = write_builder(dir, builder_body);
    config
}

const GOOD_BUILDER: &str = r#"mkdir -p .build/debug
touch .build/build.db
touch .build/debug/F.swiftmodule
touch .build/debug/F.swiftdoc
echo "Compiling F"
"#;

#[tokio::test]
async fn test_install_then_use() {
    let dir = tempfile::tempdir().unwrap();
    let config = install_config(dir.path(), GOOD_BUILDER);
    let script = Script::new().on(
        "import F",
        ScriptedReply::StdoutBytes(b"hello from F\n".to_vec()),
    );
    let client = start_kernel_with(script, config).await;

    let (reply, iopub) = client
        .run_cell("%install '.package(path: \"/tmp/pkg\")' F")
        .await;
    assert_eq!(reply.content["status"], "ok");

    let text = TestClient::stream_text(&iopub);
    for phase in 1..=5 {
        assert!(
            text.contains(&format!("[{phase}/5]")),
            "missing phase {phase} banner in {text:?}"
        );
    }
    assert!(text.contains("Compiling F"));

    // Module artifacts were relocated where the REPL searches.
    let modules = dir.path().join("cache").join("modules");
    assert!(modules.join("F.swiftmodule").is_file());
    assert!(modules.join("F.swiftdoc").is_file());

    // The product resolves in the next cell.
    let (reply, iopub) = client.run_cell("import F\nprint(F.hello())").await;
    assert_eq!(reply.content["status"], "ok");
    assert!(TestClient::stream_text(&iopub).contains("hello from F"));
}

#[tokio::test]
async fn test_install_rejected_after_swift_ran() {
    let dir = tempfile::tempdir().unwrap();
    let config = install_config(dir.path(), GOOD_BUILDER);
    let client = start_kernel_with(Script::new(), config).await;

    let (reply, _) = client.run_cell("print(\"warm\")").await;
    assert_eq!(reply.content["status"], "ok");

    let (reply, _) = client
        .run_cell("%install '.package(path: \"/tmp/pkg\")' F")
        .await;
    assert_eq!(reply.content["status"], "error");
    assert_eq!(reply.content["ename"], "InstallError");
    assert!(reply.content["evalue"]
        .as_str()
        .unwrap()
        .contains("%install must come before"));
    let traceback = reply.content["traceback"].to_string();
    assert!(traceback.contains("%reset"));
}

#[tokio::test]
async fn test_reset_reopens_the_install_window() {
    let dir = tempfile::tempdir().unwrap();
    let config = install_config(dir.path(), GOOD_BUILDER);
    let client = start_kernel_with(Script::new(), config).await;

    client.run_cell("print(\"warm\")").await;
    let (reply, _) = client
        .run_cell("%install '.package(path: \"/tmp/pkg\")' F")
        .await;
    assert_eq!(reply.content["status"], "error");

    client.run_cell("%reset").await;
    let (reply, _) = client
        .run_cell("%install '.package(path: \"/tmp/pkg\")' F")
        .await;
    assert_eq!(reply.content["status"], "ok");
}

#[tokio::test]
async fn test_build_failure_with_build_db() {
    let dir = tempfile::tempdir().unwrap();
    let config = install_config(
        dir.path(),
        "mkdir -p .build\ntouch .build/build.db\necho \"error: no such package\" >&2\nexit 1",
    );
    let client = start_kernel_with(Script::new(), config).await;

    let (reply, iopub) = client
        .run_cell("%install '.package(path: \"/tmp/missing\")' F")
        .await;
    assert_eq!(reply.content["status"], "error");
    assert_eq!(reply.content["ename"], "InstallError");
    assert!(reply.content["evalue"]
        .as_str()
        .unwrap()
        .contains("no usable artifacts"));
    // Builder stderr was forwarded.
    let stderr: String = iopub
        .iter()
        .filter(|m| m.msg_type() == "stream")
        .filter(|m| m.content["name"] == "stderr")
        .filter_map(|m| m.content["text"].as_str())
        .collect();
    assert!(stderr.contains("no such package"));
}

#[tokio::test]
async fn test_successful_exit_without_build_db_is_invariant_violation() {
    let dir = tempfile::tempdir().unwrap();
    let config = install_config(dir.path(), "mkdir -p .build/debug");
    let client = start_kernel_with(Script::new(), config).await;

    let (reply, _) = client
        .run_cell("%install '.package(path: \"/tmp/pkg\")' F")
        .await;
    assert_eq!(reply.content["status"], "error");
    assert!(reply.content["evalue"]
        .as_str()
        .unwrap()
        .contains("no build database"));
}

#[tokio::test]
async fn test_build_timeout_kills_builder() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = install_config(dir.path(), "sleep 30");
    config.build_timeout = Duration::from_millis(300);
    let client = start_kernel_with(Script::new(), config).await;

    let (reply, _) = client
        .run_cell("%install '.package(path: \"/tmp/pkg\")' F")
        .await;
    assert_eq!(reply.content["status"], "error");
    assert!(reply.content["evalue"].as_str().unwrap().contains("timed out"));
    let traceback = reply.content["traceback"].to_string();
    assert!(traceback.contains("SWIFT_INSTALL_TIMEOUT"));
}

#[tokio::test]
async fn test_load_failure_lists_common_causes() {
    let dir = tempfile::tempdir().unwrap();
    // Produce a file that looks like a shared library but is not loadable.
    let builder = format!(
        "mkdir -p .build/debug\ntouch .build/build.db\necho not-an-elf > .build/debug/libF{}",
        swift_jupyter_kernel::config::library_suffix()
    );
    let config = install_config(dir.path(), &builder);
    let client = start_kernel_with(Script::new(), config).await;

    let (reply, _) = client
        .run_cell("%install '.package(path: \"/tmp/pkg\")' F")
        .await;
    assert_eq!(reply.content["status"], "error");
    assert_eq!(reply.content["ename"], "InstallError");
    let traceback = reply.content["traceback"].to_string();
    assert!(traceback.contains("architecture mismatch"));
}

#[tokio::test]
async fn test_two_installs_in_one_cell_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = install_config(dir.path(), GOOD_BUILDER);
    let client = start_kernel_with(Script::new(), config).await;

    let (reply, _) = client
        .run_cell(
            "%install '.package(path: \"/a\")' A\n%install '.package(path: \"/b\")' B",
        )
        .await;
    assert_eq!(reply.content["status"], "error");
    assert_eq!(reply.content["ename"], "PreprocessorError");
}

#[tokio::test]
async fn test_unresolvable_link_symbol_fails_install() {
    let dir = tempfile::tempdir().unwrap();
    let config = install_config(dir.path(), GOOD_BUILDER);
    let client = start_kernel_with(Script::new(), config).await;

    let (reply, _) = client
        .run_cell("%swift_link blas_gemm\n%install '.package(path: \"/tmp/pkg\")' F")
        .await;
    // The stub build produces no libraries, so the symbol cannot resolve.
    assert_eq!(reply.content["status"], "error");
    assert!(reply.content["evalue"]
        .as_str()
        .unwrap()
        .contains("blas_gemm"));
}
