//! Scripted debugger backend
//!
//! A deterministic stand-in for the native debugger, used by the test suite
//! and for development on machines without a Swift toolchain. A `Script`
//! maps source fragments to canned behaviors; anything unmatched succeeds
//! quietly, with `print("...")` literals echoed to the captured stdout so
//! simple cells behave like a real REPL.

use anyhow::Result;
use parking_lot::Mutex;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use super::{
    Completions, DebuggerBackend, FrameInfo, InterruptHandle, ProcessState, RawEvalResult,
    StdoutSource, ValueNode,
};

/// Error description produced when an evaluation is interrupted
pub const INTERRUPT_DESCRIPTION: &str =
    "error: Execution was interrupted, reason: signal SIGINT.";

static PRINT_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"print\("([^"]*)"\)"#).expect("print literal pattern")
});

/// Canned behavior for one matched source fragment
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Succeed without a value
    Plain,
    /// Succeed with a result value
    Value(ValueNode),
    /// Write raw bytes to stdout, then succeed without a value
    StdoutBytes(Vec<u8>),
    /// Report a compile-style error description
    CompileError(String),
    /// Stop the process without exiting, with the given stop description and
    /// stack frames
    SignalStop {
        /// Stop reason shown to the user
        description: String,
        /// Frames of the stopped thread
        frames: Vec<FrameInfo>,
    },
    /// Exit the process with a status code
    Exit(i64),
    /// Busy-wait until an interrupt is delivered, then report interruption
    BlockUntilInterrupt,
    /// Sleep for the given duration, then succeed without a value
    SleepMs(u64),
}

/// Source-fragment to behavior mapping for a [`ScriptedBackend`]
#[derive(Debug, Clone, Default)]
pub struct Script {
    rules: Vec<(String, ScriptedReply)>,
    completions: Vec<(String, Completions)>,
}

impl Script {
    /// Empty script: every evaluation succeeds, prints are echoed
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `reply` when the evaluated source contains `needle`
    #[must_use]
    pub fn on(mut self, needle: &str, reply: ScriptedReply) -> Self {
        self.rules.push((needle.to_string(), reply));
        self
    }

    /// Complete prefixes ending in `suffix` with the given candidates
    #[must_use]
    pub fn on_complete(mut self, suffix: &str, common_prefix: &str, matches: &[&str]) -> Self {
        self.completions.push((
            suffix.to_string(),
            Completions {
                common_prefix: common_prefix.to_string(),
                matches: matches.iter().map(|m| (*m).to_string()).collect(),
            },
        ));
        self
    }
}

/// Deterministic debugger backend driven by a [`Script`]
pub struct ScriptedBackend {
    script: Script,
    state: ProcessState,
    frames: Vec<FrameInfo>,
    stdout: Arc<Mutex<Vec<u8>>>,
    interrupt_flag: Arc<AtomicBool>,
}

impl ScriptedBackend {
    /// Backend with an empty script
    pub fn new() -> Self {
        Self::from_script(Script::new())
    }

    /// Backend driven by `script`
    pub fn from_script(script: Script) -> Self {
        Self {
            script,
            state: ProcessState::Running,
            frames: Vec::new(),
            stdout: Arc::new(Mutex::new(Vec::new())),
            interrupt_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    fn write_stdout(&self, bytes: &[u8]) {
        self.stdout.lock().extend_from_slice(bytes);
    }

    fn echo_prints(&self, source: &str) {
        for capture in PRINT_LITERAL.captures_iter(source) {
            self.write_stdout(capture[1].as_bytes());
            self.write_stdout(b"\n");
        }
    }

    /// Strip the injected source-location directive so rules match the code
    /// the user wrote.
    fn user_source(source: &str) -> String {
        source
            .lines()
            .filter(|line| !line.trim_start().starts_with("#sourceLocation"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DebuggerBackend for ScriptedBackend {
    fn evaluate(&mut self, source: &str) -> Result<RawEvalResult> {
        if matches!(self.state, ProcessState::Exited(_)) {
            return Err(anyhow::anyhow!("process has exited"));
        }

        let source = Self::user_source(source);
        let reply = self
            .script
            .rules
            .iter()
            .find(|(needle, _)| source.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone());

        let Some(reply) = reply else {
            self.echo_prints(&source);
            return Ok(RawEvalResult::default());
        };

        match reply {
            ScriptedReply::Plain => Ok(RawEvalResult::default()),
            ScriptedReply::Value(node) => Ok(RawEvalResult {
                error: None,
                value: Some(node),
            }),
            ScriptedReply::StdoutBytes(bytes) => {
                self.write_stdout(&bytes);
                Ok(RawEvalResult::default())
            }
            ScriptedReply::CompileError(text) => Ok(RawEvalResult {
                error: Some(text),
                value: None,
            }),
            ScriptedReply::SignalStop {
                description,
                frames,
            } => {
                self.state = ProcessState::Stopped(description);
                self.frames = frames;
                Ok(RawEvalResult::default())
            }
            ScriptedReply::Exit(code) => {
                self.state = ProcessState::Exited(code);
                Ok(RawEvalResult::default())
            }
            ScriptedReply::BlockUntilInterrupt => {
                let started = Instant::now();
                loop {
                    if self.interrupt_flag.swap(false, Ordering::SeqCst) {
                        return Ok(RawEvalResult {
                            error: Some(INTERRUPT_DESCRIPTION.to_string()),
                            value: None,
                        });
                    }
                    if started.elapsed() > Duration::from_secs(30) {
                        return Err(anyhow::anyhow!(
                            "scripted evaluation timed out waiting for an interrupt"
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
            ScriptedReply::SleepMs(ms) => {
                std::thread::sleep(Duration::from_millis(ms));
                Ok(RawEvalResult::default())
            }
        }
    }

    fn process_state(&mut self) -> ProcessState {
        self.state.clone()
    }

    fn resume(&mut self) -> Result<()> {
        if matches!(self.state, ProcessState::Stopped(_)) {
            self.state = ProcessState::Running;
            self.frames.clear();
        }
        Ok(())
    }

    fn stack_frames(&mut self) -> Vec<FrameInfo> {
        self.frames.clone()
    }

    fn complete(&mut self, prefix: &str) -> Result<Completions> {
        Ok(self
            .script
            .completions
            .iter()
            .find(|(suffix, _)| prefix.ends_with(suffix.as_str()))
            .map(|(_, completions)| completions.clone())
            .unwrap_or_default())
    }

    fn interrupt_handle(&self) -> Box<dyn InterruptHandle> {
        Box::new(ScriptedInterrupt {
            flag: Arc::clone(&self.interrupt_flag),
        })
    }

    fn stdout_source(&self) -> Box<dyn StdoutSource> {
        Box::new(ScriptedStdout {
            buffer: Arc::clone(&self.stdout),
        })
    }

    fn shutdown(&mut self) -> Result<()> {
        self.state = ProcessState::Exited(0);
        Ok(())
    }
}

struct ScriptedInterrupt {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle for ScriptedInterrupt {
    fn interrupt(&self) -> Result<()> {
        self.flag.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedStdout {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl StdoutSource for ScriptedStdout {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut pending = self.buffer.lock();
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.drain(..n);
        Ok(n)
    }
}
