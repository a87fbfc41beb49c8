//! LLDB-backed debugger backend
//!
//! Drives the prebuilt Swift REPL executable through the LLDB scripting API:
//! one debugger handle, one target, one long-lived process. Evaluation goes
//! through `EvaluateExpression` on the target; interruption is delivered as
//! SIGINT to the hosted process; stdout is read through the process's
//! non-blocking stdout buffer, which LLDB documents as safe to call while an
//! evaluation is in flight.
//!
//! Compiled only with `--features lldb`.

use anyhow::{Context, Result};
use lldb::{
    LaunchFlags, SBDebugger, SBExpressionOptions, SBLaunchInfo, SBProcess, SBTarget,
};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::raw::c_char;
use tracing::{debug, info, warn};

use super::{
    Completions, DebuggerBackend, FrameInfo, InterruptHandle, ProcessState, RawEvalResult,
    StdoutSource, ValueNode,
};
use crate::config::KernelConfig;

const MAX_CHILD_SCAN: usize = 101;

/// LLDB-backed implementation of the debugger seam
pub struct LldbBackend {
    /// Held for the session lifetime; dropped at shutdown
    _debugger: SBDebugger,
    target: SBTarget,
    process: SBProcess,
}

// The debugger handle is only ever driven from one thread at a time; the
// stdout read goes through a separate raw handle.
#[allow(unsafe_code)]
unsafe impl Send for LldbBackend {}

impl LldbBackend {
    /// Create a debugger, a target for the configured REPL executable, and
    /// launch the hosted process.
    pub fn launch(config: &KernelConfig) -> Result<Self> {
        SBDebugger::initialize();
        let debugger = SBDebugger::create(false);
        debugger.set_asynchronous(false);

        let repl = config.repl_path.to_string_lossy().into_owned();
        let target = debugger
            .create_target_simple(&repl)
            .with_context(|| format!("creating target for {repl} ({})", config.arch))?;

        let launch_info = SBLaunchInfo::new();
        launch_info.set_launch_flags(LaunchFlags::NONE);
        let process = target
            .launch(launch_info)
            .map_err(|e| anyhow::anyhow!("launching {repl}: {e:?}"))?;

        info!("launched Swift REPL {} under LLDB", repl);
        Ok(Self {
            _debugger: debugger,
            target,
            process,
        })
    }

    fn value_tree(value: &lldb::SBValue, depth: usize) -> ValueNode {
        let mut node = ValueNode {
            name: value.name().unwrap_or_default().to_string(),
            type_name: value.type_name().unwrap_or_default().to_string(),
            summary: value
                .summary()
                .or_else(|| value.value())
                .unwrap_or_default()
                .to_string(),
            children: Vec::new(),
        };
        if depth > 0 {
            for child in value.children().take(MAX_CHILD_SCAN) {
                node.children.push(Self::value_tree(&child, depth - 1));
            }
        }
        node
    }
}

impl DebuggerBackend for LldbBackend {
    fn evaluate(&mut self, source: &str) -> Result<RawEvalResult> {
        let options = SBExpressionOptions::new();
        let value = self.target.evaluate_expression(source, &options);

        let error = value.error();
        if error.is_failure() {
            return Ok(RawEvalResult {
                error: Some(format!("{error:?}")),
                value: None,
            });
        }
        if value.type_name().unwrap_or_default().is_empty() {
            return Ok(RawEvalResult::default());
        }
        Ok(RawEvalResult {
            error: None,
            value: Some(Self::value_tree(&value, 2)),
        })
    }

    fn process_state(&mut self) -> ProcessState {
        if !self.process.is_alive() {
            return ProcessState::Exited(i64::from(self.process.exit_status()));
        }
        if self.process.is_stopped() {
            let description = self
                .process
                .selected_thread()
                .stop_description();
            return ProcessState::Stopped(description);
        }
        ProcessState::Running
    }

    fn resume(&mut self) -> Result<()> {
        self.process
            .continue_execution()
            .map_err(|e| anyhow::anyhow!("resuming process: {e:?}"))
    }

    fn stack_frames(&mut self) -> Vec<FrameInfo> {
        let thread = self.process.selected_thread();
        let mut frames = Vec::new();
        for frame in thread.frames() {
            let line_entry = frame.line_entry();
            let Some(line_entry) = line_entry else {
                continue;
            };
            let line = line_entry.line();
            if line == 0 {
                continue;
            }
            frames.push(FrameInfo {
                function: frame.display_function_name().unwrap_or("<unknown>").to_string(),
                file: line_entry.filespec().filename().to_string(),
                line,
                column: line_entry.column(),
            });
        }
        frames
    }

    fn complete(&mut self, _prefix: &str) -> Result<Completions> {
        // The binding does not expose the REPL completion interface; callers
        // treat an empty set as "no suggestions".
        Ok(Completions::default())
    }

    fn interrupt_handle(&self) -> Box<dyn InterruptHandle> {
        Box::new(LldbInterrupt {
            pid: self.process.process_id(),
        })
    }

    fn stdout_source(&self) -> Box<dyn StdoutSource> {
        Box::new(LldbStdout {
            raw: self.process.raw,
        })
    }

    fn shutdown(&mut self) -> Result<()> {
        debug!("terminating LLDB session");
        if self.process.is_alive() {
            if let Err(e) = self.process.kill() {
                warn!("killing hosted process failed: {e:?}");
            }
        }
        SBDebugger::terminate();
        Ok(())
    }
}

struct LldbInterrupt {
    pid: u64,
}

impl InterruptHandle for LldbInterrupt {
    fn interrupt(&self) -> Result<()> {
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let pid = Pid::from_raw(self.pid as i32);
        signal::kill(pid, Signal::SIGINT).context("delivering SIGINT to the REPL process")
    }
}

struct LldbStdout {
    raw: lldb::sys::SBProcessRef,
}

// LLDB documents the stdout read as safe concurrently with evaluation.
#[allow(unsafe_code)]
unsafe impl Send for LldbStdout {}

impl StdoutSource for LldbStdout {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        #[allow(unsafe_code)]
        let n = unsafe {
            lldb::sys::SBProcessGetSTDOUT(
                self.raw,
                buf.as_mut_ptr().cast::<c_char>(),
                buf.len(),
            )
        };
        Ok(n)
    }
}
