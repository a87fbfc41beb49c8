//! REPL supervisor
//!
//! Owns the single long-lived Swift process through the debugger seam:
//! launches it, feeds it source, classifies raw results into execution
//! outcomes, renders result values, captures Swift-level stack traces on
//! runtime errors (then resumes the process so the REPL stays usable), and
//! relaunches it for `%reset`.
//!
//! If the process cannot be launched, or exits, the supervisor degrades: the
//! kernel stays up and every execution returns the fatal diagnostic.

use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::config::KernelConfig;
use crate::debugger::{Completions, DebuggerBackend, ProcessState};
use crate::diagnostics::{is_interrupt_error, Diagnostic, DiagnosticFormatter};
use crate::iobridge::IoBridge;
use crate::render::{render, RenderedValue};

/// Factory relaunching the debugger backend (`startup`, `%reset`)
pub type BackendFactory =
    Box<dyn Fn(&KernelConfig) -> anyhow::Result<Box<dyn DebuggerBackend>> + Send>;

/// Outcome of one evaluation
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// The last expression produced a value
    Value(RenderedValue),
    /// Success without an expression result
    Quiet,
    /// The debugger reported a compile diagnostic
    CompileError(Diagnostic),
    /// The process stopped (non-fatal) or exited (fatal)
    RuntimeError {
        /// Formatted diagnostic
        diagnostic: Diagnostic,
        /// Whether the process is gone and the supervisor degraded
        fatal: bool,
    },
    /// A pending interrupt intercepted the evaluation
    Interrupted(Diagnostic),
}

impl ExecutionOutcome {
    /// Whether the evaluation succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Value(_) | Self::Quiet)
    }

    /// The diagnostic carried by a failed outcome
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            Self::Value(_) | Self::Quiet => None,
            Self::CompileError(d) | Self::Interrupted(d) => Some(d),
            Self::RuntimeError { diagnostic, .. } => Some(diagnostic),
        }
    }
}

/// Wall-clock statistics from `%timeit`
#[derive(Debug, Clone)]
pub struct TimeitResult {
    /// Number of completed runs
    pub runs: u32,
    /// Fastest run
    pub min: Duration,
    /// Mean run
    pub mean: Duration,
    /// Slowest run
    pub max: Duration,
}

impl TimeitResult {
    /// One-line report
    pub fn render(&self) -> String {
        format!(
            "{} runs: min {}, mean {}, max {}\n",
            self.runs,
            format_duration(self.min),
            format_duration(self.mean),
            format_duration(self.max)
        )
    }
}

fn format_duration(d: Duration) -> String {
    if d >= Duration::from_secs(1) {
        format!("{:.3} s", d.as_secs_f64())
    } else {
        format!("{:.3} ms", d.as_secs_f64() * 1e3)
    }
}

/// Outcome of a `%timeit` request
#[derive(Debug)]
pub enum TimeitOutcome {
    /// All runs completed
    Timed(TimeitResult),
    /// A run failed or was interrupted
    Failed(ExecutionOutcome),
}

/// Supervisor of the hosted Swift REPL process
pub struct ReplSupervisor {
    backend: Option<Box<dyn DebuggerBackend>>,
    bridge: IoBridge,
    formatter: DiagnosticFormatter,
    fatal_reason: Option<String>,
}

impl ReplSupervisor {
    /// Launch the backend and attach its I/O handles to the bridge
    pub fn start(factory: &BackendFactory, config: &KernelConfig, bridge: IoBridge) -> Self {
        let mut supervisor = Self {
            backend: None,
            bridge,
            formatter: DiagnosticFormatter::new(),
            fatal_reason: None,
        };
        supervisor.relaunch(factory, config);
        supervisor
    }

    /// Tear down the current process and launch a fresh one (`%reset`)
    pub fn reset(&mut self, factory: &BackendFactory, config: &KernelConfig) {
        if let Some(mut backend) = self.backend.take() {
            if let Err(e) = backend.shutdown() {
                warn!("shutting down old process failed: {}", e);
            }
        }
        self.bridge.detach();
        self.relaunch(factory, config);
    }

    fn relaunch(&mut self, factory: &BackendFactory, config: &KernelConfig) {
        match factory(config) {
            Ok(backend) => {
                self.bridge
                    .attach(backend.stdout_source(), backend.interrupt_handle());
                self.backend = Some(backend);
                self.fatal_reason = None;
                info!("Swift process launched ({})", config.arch);
            }
            Err(e) => {
                warn!("Swift REPL startup failed: {}", e);
                self.backend = None;
                self.fatal_reason = Some(e.to_string());
            }
        }
    }

    /// Whether the supervisor has lost its process
    pub fn is_degraded(&self) -> bool {
        self.backend.is_none()
    }

    /// Fatal diagnostic reported while degraded
    pub fn degraded_diagnostic(&self) -> Diagnostic {
        let reason = self
            .fatal_reason
            .as_deref()
            .unwrap_or("the Swift process is not running");
        self.formatter.startup_failure(reason)
    }

    /// Evaluate one prepared source fragment and classify the outcome
    ///
    /// Blocks until the debugger returns. Outstanding stdout is drained
    /// before classification so stream output always precedes the reply.
    #[instrument(level = "debug", skip_all)]
    pub fn execute(&mut self, source: &str) -> ExecutionOutcome {
        let Some(backend) = self.backend.as_mut() else {
            return ExecutionOutcome::RuntimeError {
                diagnostic: self.degraded_diagnostic(),
                fatal: true,
            };
        };

        if self.bridge.take_interrupt() {
            return ExecutionOutcome::Interrupted(self.formatter.interrupted());
        }

        let result = backend.evaluate(source);
        self.bridge.drain_now();

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                return ExecutionOutcome::RuntimeError {
                    diagnostic: self.formatter.runtime_error(&e.to_string(), Vec::new()),
                    fatal: false,
                };
            }
        };

        match backend.process_state() {
            ProcessState::Exited(status) => {
                self.fatal_reason =
                    Some(format!("the Swift process exited with status {status}"));
                self.backend = None;
                self.bridge.detach();
                ExecutionOutcome::RuntimeError {
                    diagnostic: self.formatter.process_exited(status),
                    fatal: true,
                }
            }
            ProcessState::Stopped(description) => {
                let frames = backend.stack_frames();
                if let Err(e) = backend.resume() {
                    warn!("resuming stopped process failed: {}", e);
                }
                self.bridge.take_interrupt();
                ExecutionOutcome::RuntimeError {
                    diagnostic: self.formatter.runtime_error(&description, frames),
                    fatal: false,
                }
            }
            ProcessState::Running => {
                if let Some(error) = raw.error {
                    if is_interrupt_error(&error) {
                        self.bridge.take_interrupt();
                        ExecutionOutcome::Interrupted(self.formatter.interrupted())
                    } else {
                        // Non-interrupt error descriptions carry the compile
                        // diagnostic prefix in practice; classify them all as
                        // compile-side so the message is cleaned either way.
                        ExecutionOutcome::CompileError(self.formatter.compile_error(&error))
                    }
                } else if let Some(value) = raw.value {
                    if value.type_name.is_empty() || value.type_name == "()" {
                        ExecutionOutcome::Quiet
                    } else {
                        ExecutionOutcome::Value(render(&value))
                    }
                } else {
                    ExecutionOutcome::Quiet
                }
            }
        }
    }

    /// Run a body repeatedly and report wall-clock statistics
    ///
    /// The first run sizes the loop so the total approaches `target`, capped
    /// at `max_runs`. The interrupt latch is checked between iterations.
    pub fn timeit(&mut self, body: &str, target: Duration, max_runs: u32) -> TimeitOutcome {
        let first_started = Instant::now();
        let outcome = self.execute(body);
        let first = first_started.elapsed();
        if !outcome.is_success() {
            return TimeitOutcome::Failed(outcome);
        }

        let per_run = first.max(Duration::from_micros(1));
        #[allow(clippy::cast_possible_truncation)]
        let wanted = (target.as_nanos() / per_run.as_nanos()).max(1) as u32;
        let runs = wanted.min(max_runs).max(1);

        let mut durations = vec![first];
        for _ in 1..runs {
            if self.bridge.interrupt_pending() {
                self.bridge.take_interrupt();
                return TimeitOutcome::Failed(ExecutionOutcome::Interrupted(
                    self.formatter.interrupted(),
                ));
            }
            let started = Instant::now();
            let outcome = self.execute(body);
            let elapsed = started.elapsed();
            if !outcome.is_success() {
                return TimeitOutcome::Failed(outcome);
            }
            durations.push(elapsed);
        }

        let min = durations.iter().min().copied().unwrap_or_default();
        let max = durations.iter().max().copied().unwrap_or_default();
        let total: Duration = durations.iter().sum();
        #[allow(clippy::cast_possible_truncation)]
        let count = durations.len() as u32;
        TimeitOutcome::Timed(TimeitResult {
            runs: count,
            min,
            mean: total / count,
            max,
        })
    }

    /// Ask the debugger for completions of a source prefix
    ///
    /// Failures are swallowed into an empty set.
    pub fn complete(&mut self, prefix: &str) -> Completions {
        match self.backend.as_mut() {
            Some(backend) => backend.complete(prefix).unwrap_or_default(),
            None => Completions::default(),
        }
    }

    /// Terminate the debugger session
    pub fn shutdown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            if let Err(e) = backend.shutdown() {
                warn!("debugger shutdown failed: {}", e);
            }
        }
        self.bridge.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::scripted::{Script, ScriptedBackend, ScriptedReply};
    use crate::debugger::{FrameInfo, ValueNode};
    use pretty_assertions::assert_eq;
    use swift_jupyter_protocol::KernelSession;

    fn factory_for(script: Script) -> BackendFactory {
        Box::new(move |_config| Ok(Box::new(ScriptedBackend::from_script(script.clone()))))
    }

    type Rx = tokio::sync::mpsc::UnboundedReceiver<swift_jupyter_protocol::Outbound>;

    fn supervisor_for(script: Script) -> (ReplSupervisor, IoBridge, Rx) {
        let (session, rx) = KernelSession::new("supervisor-test");
        let bridge = IoBridge::new(session);
        let supervisor = ReplSupervisor::start(
            &factory_for(script),
            &KernelConfig::default(),
            bridge.clone(),
        );
        (supervisor, bridge, rx)
    }

    #[test]
    fn test_value_outcome_is_rendered() {
        let script = Script::new().on("x", ScriptedReply::Value(ValueNode::scalar("Int", "42")));
        let (mut supervisor, _bridge, _rx) = supervisor_for(script);
        match supervisor.execute("x") {
            ExecutionOutcome::Value(rendered) => {
                assert_eq!(rendered.text, "42");
                assert_eq!(rendered.type_name, "Int");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_statement_outcome_is_quiet() {
        let (mut supervisor, _bridge, _rx) = supervisor_for(Script::new());
        assert!(matches!(
            supervisor.execute("let x = 1"),
            ExecutionOutcome::Quiet
        ));
    }

    #[test]
    fn test_compile_error_is_classified_and_cleaned() {
        let script = Script::new().on(
            "let y: Int = x",
            ScriptedReply::CompileError(
                "expression failed to parse:\nerror: cannot convert value of type 'String' to specified type 'Int'".to_string(),
            ),
        );
        let (mut supervisor, _bridge, _rx) = supervisor_for(script);
        match supervisor.execute("let x = \"s\"; let y: Int = x") {
            ExecutionOutcome::CompileError(diag) => {
                assert!(diag.message.contains("cannot convert value of type"));
                assert!(!diag.message.contains("expression failed to parse"));
                assert!(diag.frames.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_runtime_error_captures_frames_and_recovers() {
        let script = Script::new().on(
            "f()",
            ScriptedReply::SignalStop {
                description: "Fatal error: Index out of range".to_string(),
                frames: vec![FrameInfo {
                    function: "f".to_string(),
                    file: "<cell 1>".to_string(),
                    line: 1,
                    column: 30,
                }],
            },
        );
        let (mut supervisor, _bridge, _rx) = supervisor_for(script);
        match supervisor.execute("f()") {
            ExecutionOutcome::RuntimeError { diagnostic, fatal } => {
                assert!(!fatal);
                assert_eq!(diagnostic.frames.len(), 1);
                assert!(diagnostic.message.contains("Index out of range"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        // The process was resumed; the next cell evaluates normally.
        assert!(supervisor.execute("print(1)").is_success());
    }

    #[test]
    fn test_process_exit_degrades_supervisor() {
        let script = Script::new().on("exit(1)", ScriptedReply::Exit(1));
        let (mut supervisor, _bridge, _rx) = supervisor_for(script);
        match supervisor.execute("exit(1)") {
            ExecutionOutcome::RuntimeError { fatal, .. } => assert!(fatal),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(supervisor.is_degraded());

        // Degraded mode keeps answering with the fatal diagnostic.
        match supervisor.execute("print(1)") {
            ExecutionOutcome::RuntimeError { fatal, diagnostic } => {
                assert!(fatal);
                assert!(diagnostic.hints.iter().any(|h| h.contains("re-registration")
                    || h.contains("re-register")));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_pending_interrupt_intercepts_evaluation() {
        let (mut supervisor, bridge, _rx) = supervisor_for(Script::new());
        bridge.interrupt();
        assert!(matches!(
            supervisor.execute("print(1)"),
            ExecutionOutcome::Interrupted(_)
        ));
        // Latch was consumed.
        assert!(supervisor.execute("print(1)").is_success());
    }

    #[test]
    fn test_startup_failure_degrades_not_crashes() {
        let (session, _rx) = KernelSession::new("supervisor-test");
        let bridge = IoBridge::new(session);
        let failing: BackendFactory =
            Box::new(|_config| Err(anyhow::anyhow!("repl_swift not found")));
        let mut supervisor =
            ReplSupervisor::start(&failing, &KernelConfig::default(), bridge);
        assert!(supervisor.is_degraded());
        match supervisor.execute("print(1)") {
            ExecutionOutcome::RuntimeError { fatal, diagnostic } => {
                assert!(fatal);
                assert!(diagnostic.message.contains("repl_swift not found"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_reset_recovers_a_degraded_supervisor() {
        let script = Script::new().on("exit(9)", ScriptedReply::Exit(9));
        let (mut supervisor, _bridge, _rx) = supervisor_for(script.clone());
        supervisor.execute("exit(9)");
        assert!(supervisor.is_degraded());

        supervisor.reset(&factory_for(script), &KernelConfig::default());
        assert!(!supervisor.is_degraded());
        assert!(supervisor.execute("print(1)").is_success());
    }

    #[test]
    fn test_timeit_reports_statistics() {
        let (mut supervisor, _bridge, _rx) = supervisor_for(Script::new());
        match supervisor.timeit("1 + 1", Duration::from_millis(5), 10) {
            TimeitOutcome::Timed(result) => {
                assert!(result.runs >= 1 && result.runs <= 10);
                assert!(result.min <= result.mean && result.mean <= result.max);
                assert!(result.render().contains("runs"));
            }
            TimeitOutcome::Failed(outcome) => panic!("unexpected failure: {outcome:?}"),
        }
    }

    #[test]
    fn test_timeit_stops_on_interrupt_latch() {
        let script = Script::new().on("slow", ScriptedReply::SleepMs(20));
        let (mut supervisor, bridge, _rx) = supervisor_for(script);
        let interrupter = std::thread::spawn({
            let bridge = bridge.clone();
            move || {
                std::thread::sleep(Duration::from_millis(30));
                bridge.interrupt();
            }
        });
        let outcome = supervisor.timeit("slow", Duration::from_secs(10), 1000);
        interrupter.join().unwrap();
        assert!(matches!(
            outcome,
            TimeitOutcome::Failed(ExecutionOutcome::Interrupted(_))
        ));
    }
}
