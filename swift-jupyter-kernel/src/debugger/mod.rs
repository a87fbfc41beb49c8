//! Debugger seam
//!
//! The kernel drives one long-lived Swift REPL process through a native
//! debugger. Everything the kernel needs from that debugger is captured by
//! the [`DebuggerBackend`] trait: synchronous expression evaluation with a
//! structured result, process state queries, stack-frame enumeration,
//! asynchronous interruption, code completion, and a non-blocking read of the
//! hosted process's stdout.
//!
//! Two implementations ship here: [`scripted::ScriptedBackend`], a
//! deterministic double used by the test suite and for offline development,
//! and (behind the `lldb` feature) an LLDB-backed production backend.

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod scripted;

#[cfg(feature = "lldb")]
pub mod lldb;

use crate::config::KernelConfig;

/// State of the hosted Swift process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is alive and serviceable
    Running,
    /// Process stopped without exiting (signal, exception)
    Stopped(String),
    /// Process exited or crashed; the handle is dead
    Exited(i64),
}

/// A node in the debugger's value tree
#[derive(Debug, Clone, Default)]
pub struct ValueNode {
    /// Field name, dictionary key or element index ("" for the root)
    pub name: String,
    /// Swift type name
    pub type_name: String,
    /// Display string for the value itself
    pub summary: String,
    /// Child values (elements, entries, fields)
    pub children: Vec<ValueNode>,
}

impl ValueNode {
    /// A leaf value with no children
    pub fn scalar(type_name: &str, summary: &str) -> Self {
        Self {
            name: String::new(),
            type_name: type_name.to_string(),
            summary: summary.to_string(),
            children: Vec::new(),
        }
    }

    /// A named child of a larger value
    pub fn child(name: &str, type_name: &str, summary: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            summary: summary.to_string(),
            children: Vec::new(),
        }
    }
}

/// Raw result of one expression evaluation
#[derive(Debug, Clone, Default)]
pub struct RawEvalResult {
    /// Error description, when the debugger reported one
    pub error: Option<String>,
    /// Result value, when the expression produced one
    pub value: Option<ValueNode>,
}

/// One stack frame of the stopped thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    /// Display name of the function
    pub function: String,
    /// Source file basename
    pub file: String,
    /// 1-based line
    pub line: u32,
    /// 1-based column
    pub column: u32,
}

/// Completion candidates plus the common prefix the debugger computed
#[derive(Debug, Clone, Default)]
pub struct Completions {
    /// Longest prefix shared by every candidate
    pub common_prefix: String,
    /// Candidate insertion texts
    pub matches: Vec<String>,
}

/// Interrupt delivery handle, callable from any thread
pub trait InterruptHandle: Send + Sync {
    /// Issue the debugger's asynchronous interrupt. Returns once the request
    /// is delivered; the stop itself may lag by seconds.
    fn interrupt(&self) -> Result<()>;
}

/// Non-blocking read handle on the hosted process's stdout
///
/// The debugger documents this read as safe to call concurrently with an
/// in-flight evaluation, which is what lets the drain thread run while the
/// event loop waits on `evaluate`.
pub trait StdoutSource: Send {
    /// Read whatever bytes are available, up to `buf.len()`. Returns 0 when
    /// nothing is pending.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Debugger seam driving the hosted Swift REPL process
pub trait DebuggerBackend: Send {
    /// Evaluate a source fragment synchronously. Blocks until the debugger
    /// returns; an interrupt delivered through the [`InterruptHandle`] makes
    /// it return early with an interruption error description.
    fn evaluate(&mut self, source: &str) -> Result<RawEvalResult>;

    /// Current state of the hosted process
    fn process_state(&mut self) -> ProcessState;

    /// Resume a stopped process so the REPL stays usable
    fn resume(&mut self) -> Result<()>;

    /// Frames of the stopped thread, innermost first
    fn stack_frames(&mut self) -> Vec<FrameInfo>;

    /// Code completion for a source prefix
    fn complete(&mut self, prefix: &str) -> Result<Completions>;

    /// Handle for asynchronous interruption from other threads
    fn interrupt_handle(&self) -> Box<dyn InterruptHandle>;

    /// Handle for the stdout drain thread
    fn stdout_source(&self) -> Box<dyn StdoutSource>;

    /// Terminate the debugger session and the hosted process
    fn shutdown(&mut self) -> Result<()>;
}

/// Create the configured debugger backend
///
/// # Errors
///
/// Returns an error if the backend kind is unknown or not compiled in; the
/// kernel then stays up in degraded mode and reports the failure on every
/// execute.
pub fn create_backend(config: &KernelConfig) -> Result<Box<dyn DebuggerBackend>> {
    match config.backend.as_str() {
        "lldb" => {
            #[cfg(feature = "lldb")]
            {
                Ok(Box::new(lldb::LldbBackend::launch(config)?))
            }
            #[cfg(not(feature = "lldb"))]
            {
                Err(anyhow::anyhow!(
                    "LLDB backend support not compiled in (build with --features lldb)"
                ))
            }
        }
        "scripted" => Ok(Box::new(scripted::ScriptedBackend::new())),
        other => Err(anyhow::anyhow!("Unknown debugger backend: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_backend_rejects_unknown() {
        let mut config = KernelConfig::default();
        config.backend = "gdb".to_string();
        assert!(create_backend(&config).is_err());
    }

    #[test]
    fn test_create_scripted_backend() {
        let mut config = KernelConfig::default();
        config.backend = "scripted".to_string();
        assert!(create_backend(&config).is_ok());
    }
}
