//! Kernel: protocol adapter and event loop
//!
//! Binds the protocol session to the internal components and routes
//! `execute_request`, `complete_request`, `interrupt_request`,
//! `shutdown_request` and `kernel_info_request`.
//!
//! The loop itself never blocks: evaluation and `%timeit` runs are offloaded
//! to a blocking task while the loop keeps servicing the control channel
//! (interrupts stay live mid-execution) and answers completion requests
//! immediately with an empty set. Execute requests arriving while a cell is
//! in flight queue up and run in order.

use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use swift_jupyter_protocol::{
    channel, KernelSession, Outbound, StreamName, Transport, WireMessage,
};

use crate::config::KernelConfig;
use crate::diagnostics::{Diagnostic, DiagnosticFormatter, Severity};
use crate::install::{InstallError, InstallRequest, PackageInstaller};
use crate::magics::MagicDirective;
use crate::preprocess::{preprocess, PreprocessError, SessionOp};
use crate::session::SessionState;
use crate::supervisor::{
    BackendFactory, ExecutionOutcome, ReplSupervisor, TimeitOutcome,
};

const IDLE_POLL: Duration = Duration::from_millis(2);

/// One blocking unit of work for the supervisor
enum Job {
    Execute(String),
    Timeit(String),
}

enum JobResult {
    Execute(ExecutionOutcome),
    Timeit(TimeitOutcome),
}

/// A cell currently being serviced
struct CellInFlight {
    request: WireMessage,
    execution_count: u32,
    silent: bool,
    store_history: bool,
    /// Residual user Swift, without the source-location directive
    user_source: Option<String>,
    jobs: VecDeque<Job>,
    task: Option<tokio::task::JoinHandle<(ReplSupervisor, JobResult)>>,
    failed: Option<Diagnostic>,
}

/// The Swift Jupyter kernel
pub struct Kernel {
    config: KernelConfig,
    state: SessionState,
    session: KernelSession,
    outbound_rx: Option<tokio::sync::mpsc::UnboundedReceiver<Outbound>>,
    transport: Arc<dyn Transport>,
    bridge: crate::iobridge::IoBridge,
    factory: BackendFactory,
    supervisor: Option<ReplSupervisor>,
    installer: PackageInstaller,
    formatter: DiagnosticFormatter,
    swift_version: Option<String>,
    cell: Option<CellInFlight>,
    backlog: VecDeque<WireMessage>,
    shutdown_requested: bool,
    reader: Option<std::thread::JoinHandle<()>>,
    watcher: Option<std::thread::JoinHandle<()>>,
}

impl Kernel {
    /// Create a kernel over a bound transport with an explicit backend factory
    pub fn new(
        config: KernelConfig,
        transport: Arc<dyn Transport>,
        factory: BackendFactory,
    ) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (session, outbound_rx) = KernelSession::new(&session_id);
        let bridge = crate::iobridge::IoBridge::new(session.clone());
        let swift_version = probe_swift_version(&config);
        Self {
            config,
            state: SessionState::new(),
            session,
            outbound_rx: Some(outbound_rx),
            transport,
            bridge,
            factory,
            supervisor: None,
            installer: PackageInstaller::new(),
            formatter: DiagnosticFormatter::new(),
            swift_version,
            cell: None,
            backlog: VecDeque::new(),
            shutdown_requested: false,
            reader: None,
            watcher: None,
        }
    }

    /// Create a kernel using the configured debugger backend
    pub fn with_default_backend(config: KernelConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            config,
            transport,
            Box::new(crate::debugger::create_backend),
        )
    }

    /// Run the kernel until shutdown
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable protocol plumbing failures;
    /// user-code errors become structured replies.
    #[instrument(level = "info", skip_all)]
    pub async fn run(mut self) -> anyhow::Result<()> {
        let outbound_rx = self
            .outbound_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("kernel already running"))?;
        tokio::spawn(KernelSession::pump(
            outbound_rx,
            Arc::clone(&self.transport),
        ));

        self.supervisor = Some(ReplSupervisor::start(
            &self.factory,
            &self.config,
            self.bridge.clone(),
        ));
        self.reader = Some(self.bridge.start_reader());

        let mut signal_watcher = crate::signals::SignalWatcher::new();
        match signal_watcher.install() {
            Ok(()) => self.watcher = Some(signal_watcher.spawn(self.bridge.clone())),
            Err(e) => warn!("signal interrupt path unavailable: {}", e),
        }

        info!("kernel event loop starting (session {})", self.session.session_id());
        loop {
            // Control channel stays live even while a cell executes.
            match self.transport.recv(channel::CONTROL).await {
                Ok(Some(parts)) => {
                    self.dispatch(parts, channel::CONTROL).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("control channel closed: {}", e);
                    break;
                }
            }

            if self.poll_cell().await {
                continue;
            }

            match self.transport.recv(channel::SHELL).await {
                Ok(Some(parts)) => {
                    self.dispatch(parts, channel::SHELL).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("shell channel closed: {}", e);
                    break;
                }
            }

            if self.shutdown_requested && self.cell.is_none() {
                break;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }

        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        info!("kernel shutting down");
        if let Some(mut supervisor) = self.supervisor.take() {
            supervisor.shutdown();
        }
        self.bridge.signal_teardown();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }

    async fn dispatch(&mut self, parts: Vec<Vec<u8>>, origin: &'static str) {
        let message = match WireMessage::from_parts(&parts) {
            Ok(message) => message,
            Err(e) => {
                warn!("undecodable message on {}: {}", origin, e);
                return;
            }
        };
        debug!("{} <- {}", origin, message.msg_type());

        match message.msg_type() {
            "execute_request" => {
                if self.cell.is_some() {
                    self.backlog.push_back(message);
                } else {
                    self.start_execute(message).await;
                }
            }
            "complete_request" => self.handle_complete(&message, origin),
            "kernel_info_request" => self.handle_kernel_info(&message, origin),
            "interrupt_request" => self.handle_interrupt(&message, origin),
            "shutdown_request" => self.handle_shutdown(&message, origin),
            other => warn!("unhandled message type: {}", other),
        }
    }

    // ---- execute ----------------------------------------------------------

    async fn start_execute(&mut self, request: WireMessage) {
        let content = request.content.clone();
        let code = content["code"].as_str().unwrap_or("").to_string();
        let silent = content["silent"].as_bool().unwrap_or(false);
        let store_history = content["store_history"].as_bool().unwrap_or(!silent);

        let execution_count = if silent {
            self.state.execution_count()
        } else {
            self.state.next_execution_count()
        };

        self.session.set_parent_header(request.header.clone());
        let _ = self.session.publish_status("busy");
        if !silent {
            let _ = self.session.publish_execute_input(&code, execution_count);
        }

        let preprocessed =
            match preprocess(&code, execution_count, &mut self.config, &mut self.state) {
                Ok(preprocessed) => preprocessed,
                Err(e) => {
                    self.fail_cell_now(&request, execution_count, &preprocess_diagnostic(&e));
                    return;
                }
            };

        let mut cell = CellInFlight {
            request,
            execution_count,
            silent,
            store_history,
            user_source: preprocessed
                .cell
                .swift_source
                .as_deref()
                .map(strip_source_location),
            jobs: VecDeque::new(),
            task: None,
            failed: None,
        };

        // Session operators short-circuit, except %timeit which needs the
        // supervisor and runs as a blocking job.
        for op in preprocessed.ops {
            match op {
                SessionOp::Timeit(body) => cell.jobs.push_back(Job::Timeit(body)),
                other => {
                    if let Err(diagnostic) = self.run_session_op(&other) {
                        self.fail_cell_now(&cell.request, execution_count, &diagnostic);
                        return;
                    }
                }
            }
        }

        if let Some(install) = preprocessed.install {
            if let Err(diagnostic) = self.run_install(&install).await {
                self.fail_cell_now(&cell.request, execution_count, &diagnostic);
                return;
            }
        }

        if let Some(source) = preprocessed.cell.swift_source {
            cell.jobs.push_back(Job::Execute(source));
        }

        self.cell = Some(cell);
        self.start_next_job();
        // A cell with no jobs (pure magics) completes immediately.
        self.try_finish_cell();
    }

    fn start_next_job(&mut self) {
        let Some(cell) = self.cell.as_mut() else {
            return;
        };
        if cell.failed.is_some() || cell.task.is_some() {
            return;
        }
        let Some(job) = cell.jobs.pop_front() else {
            return;
        };
        let Some(mut supervisor) = self.supervisor.take() else {
            cell.failed = Some(self.formatter.startup_failure("supervisor unavailable"));
            return;
        };

        let bridge = self.bridge.clone();
        let target = self.config.timeit_target;
        let max_runs = self.config.timeit_max_runs;
        cell.task = Some(tokio::task::spawn_blocking(move || {
            bridge.begin_execution();
            let result = match job {
                Job::Execute(source) => JobResult::Execute(supervisor.execute(&source)),
                Job::Timeit(body) => {
                    JobResult::Timeit(supervisor.timeit(&body, target, max_runs))
                }
            };
            bridge.end_execution();
            (supervisor, result)
        }));
    }

    /// Reap a finished blocking job. Returns true when progress was made.
    async fn poll_cell(&mut self) -> bool {
        let finished = self
            .cell
            .as_ref()
            .and_then(|cell| cell.task.as_ref())
            .is_some_and(tokio::task::JoinHandle::is_finished);
        if !finished {
            return false;
        }

        let Some(cell) = self.cell.as_mut() else {
            return false;
        };
        let Some(task) = cell.task.take() else {
            return false;
        };
        match task.await {
            Ok((supervisor, result)) => {
                self.supervisor = Some(supervisor);
                self.apply_job_result(result);
            }
            Err(e) => {
                warn!("evaluation task failed: {}", e);
                let diagnostic = self
                    .formatter
                    .startup_failure(&format!("evaluation task panicked: {e}"));
                if let Some(cell) = self.cell.as_mut() {
                    cell.failed = Some(diagnostic);
                }
            }
        }

        self.start_next_job();
        self.try_finish_cell();
        self.advance_backlog().await;
        true
    }

    /// Start queued execute requests once the current cell is done
    async fn advance_backlog(&mut self) {
        while self.cell.is_none() && !self.shutdown_requested {
            let Some(message) = self.backlog.pop_front() else {
                break;
            };
            self.start_execute(message).await;
        }
    }

    fn apply_job_result(&mut self, result: JobResult) {
        let Some(cell) = self.cell.as_mut() else {
            return;
        };
        match result {
            JobResult::Execute(outcome) => match outcome {
                ExecutionOutcome::Value(rendered) => {
                    self.state.mark_swift_executed();
                    if cell.store_history && !cell.silent {
                        if let Some(source) = &cell.user_source {
                            self.state.record_cell(cell.execution_count, source);
                        }
                    }
                    if !cell.silent {
                        let _ = self
                            .session
                            .publish_execute_result(cell.execution_count, rendered.mime_bundle());
                    }
                }
                ExecutionOutcome::Quiet => {
                    self.state.mark_swift_executed();
                    if cell.store_history && !cell.silent {
                        if let Some(source) = &cell.user_source {
                            self.state.record_cell(cell.execution_count, source);
                        }
                    }
                }
                ExecutionOutcome::CompileError(diagnostic)
                | ExecutionOutcome::Interrupted(diagnostic) => {
                    let _ = self.session.publish_error(
                        &diagnostic.name,
                        &diagnostic.message,
                        &diagnostic.traceback(),
                    );
                    cell.failed = Some(diagnostic);
                    cell.jobs.clear();
                }
                ExecutionOutcome::RuntimeError { diagnostic, fatal } => {
                    if fatal {
                        warn!("Swift process lost; kernel degraded");
                    }
                    let _ = self.session.publish_error(
                        &diagnostic.name,
                        &diagnostic.message,
                        &diagnostic.traceback(),
                    );
                    cell.failed = Some(diagnostic);
                    cell.jobs.clear();
                }
            },
            JobResult::Timeit(outcome) => match outcome {
                TimeitOutcome::Timed(result) => {
                    let _ = self
                        .session
                        .publish_stream(StreamName::Stdout, &result.render());
                }
                TimeitOutcome::Failed(outcome) => {
                    let diagnostic = outcome
                        .diagnostic()
                        .cloned()
                        .unwrap_or_else(|| self.formatter.interrupted());
                    let _ = self.session.publish_error(
                        &diagnostic.name,
                        &diagnostic.message,
                        &diagnostic.traceback(),
                    );
                    cell.failed = Some(diagnostic);
                    cell.jobs.clear();
                }
            },
        }
    }

    fn try_finish_cell(&mut self) {
        let done = self
            .cell
            .as_ref()
            .is_some_and(|cell| cell.task.is_none() && (cell.jobs.is_empty() || cell.failed.is_some()));
        if !done {
            return;
        }
        let Some(cell) = self.cell.take() else {
            return;
        };

        let content = match &cell.failed {
            Some(diagnostic) => error_reply(cell.execution_count, diagnostic),
            None => json!({
                "status": "ok",
                "execution_count": cell.execution_count,
                "payload": [],
                "user_expressions": {},
            }),
        };
        let _ = self.session.reply(channel::SHELL, &cell.request, content);

        // A late interrupt that lost the race with completion must not leak
        // into the next cell.
        self.bridge.take_interrupt();
        let _ = self.session.publish_status("idle");
        self.session.clear_parent_header();
    }

    /// Reply with an error before any job ran (preprocess/install/session-op
    /// failures).
    fn fail_cell_now(&mut self, request: &WireMessage, execution_count: u32, diagnostic: &Diagnostic) {
        self.publish_diagnostic(diagnostic);
        let _ = self.session.reply(
            channel::SHELL,
            request,
            error_reply(execution_count, diagnostic),
        );
        let _ = self.session.publish_status("idle");
        self.session.clear_parent_header();
        self.cell = None;
    }

    fn publish_diagnostic(&self, diagnostic: &Diagnostic) {
        let _ = self.session.publish_error(
            &diagnostic.name,
            &diagnostic.message,
            &diagnostic.traceback(),
        );
    }

    // ---- session operators ------------------------------------------------

    fn run_session_op(&mut self, op: &SessionOp) -> Result<(), Diagnostic> {
        let output = match op {
            SessionOp::Help => MagicDirective::help_text(),
            SessionOp::LsMagic => MagicDirective::lsmagic_text(),
            SessionOp::Who => {
                let names = self.state.declarations();
                if names.is_empty() {
                    "(no declarations seen in this session)\n".to_string()
                } else {
                    format!("{}\n", names.join("  "))
                }
            }
            SessionOp::Reset => {
                let Some(supervisor) = self.supervisor.as_mut() else {
                    return Err(self.formatter.startup_failure("supervisor unavailable"));
                };
                supervisor.reset(&self.factory, &self.config);
                self.state.reset_counter();
                "Swift process relaunched; execution counter reset (history kept)\n".to_string()
            }
            SessionOp::Timeit(_) => unreachable!("timeit runs as a blocking job"),
            SessionOp::Env(None) => {
                if self.config.env.is_empty() {
                    "(no build environment overrides)\n".to_string()
                } else {
                    let mut pairs: Vec<String> = self
                        .config
                        .env
                        .iter()
                        .map(|(name, value)| format!("{name}={value}"))
                        .collect();
                    pairs.sort();
                    format!("{}\n", pairs.join("\n"))
                }
            }
            SessionOp::Env(Some((name, value))) => {
                self.config.env.insert(name.clone(), value.clone());
                format!("{name}={value}\n")
            }
            SessionOp::SwiftVersion => match &self.swift_version {
                Some(version) => format!("Swift version {version}\n"),
                None => "Swift version unknown\n".to_string(),
            },
            SessionOp::SwiftConfig => self.render_config_summary(),
            SessionOp::Save(path) => {
                self.state.save_history(path).map_err(|e| {
                    self.formatter
                        .preprocessor_error(&format!("cannot save history: {e}"))
                })?;
                format!(
                    "saved {} cells to {}\n",
                    self.state.history().len(),
                    path.display()
                )
            }
            SessionOp::History => {
                let mut text = String::new();
                for entry in self.state.history() {
                    text.push_str(&format!(
                        "In[{}]: {}\n",
                        entry.execution_count, entry.source
                    ));
                }
                if text.is_empty() {
                    text.push_str("(history is empty)\n");
                }
                text
            }
            SessionOp::EnableCompletion => {
                self.state.set_completion_enabled(true);
                "completion enabled\n".to_string()
            }
            SessionOp::DisableCompletion => {
                self.state.set_completion_enabled(false);
                "completion disabled\n".to_string()
            }
        };
        let _ = self.session.publish_stream(StreamName::Stdout, &output);
        Ok(())
    }

    fn render_config_summary(&self) -> String {
        format!(
            "install root:   {}\nbuilder:        {}\nbuild timeout:  {}s\nswiftpm flags:  {}\nswift flags:    {}\nlibrary paths:  {}\nmodule paths:   {}\n",
            self.config.install_root.display(),
            self.config.swift_build_path.display(),
            self.config.build_timeout.as_secs(),
            self.config.swiftpm_flags.join(" "),
            self.config.swift_flags.join(" "),
            join_paths(&self.config.library_paths),
            join_paths(&self.config.module_paths),
        )
    }

    // ---- install ----------------------------------------------------------

    async fn run_install(&mut self, request: &InstallRequest) -> Result<(), Diagnostic> {
        match self
            .installer
            .install(request, &self.config, &mut self.state, &self.session)
            .await
        {
            Ok(record) => {
                let _ = self.session.publish_stream(
                    StreamName::Stdout,
                    &format!("installed products: {}\n", record.products.join(", ")),
                );
                Ok(())
            }
            Err(error) => Err(install_diagnostic(&error)),
        }
    }

    // ---- completion -------------------------------------------------------

    fn handle_complete(&mut self, request: &WireMessage, origin: &'static str) {
        let code = request.content["code"].as_str().unwrap_or("");
        let code_points = code.chars().count();
        #[allow(clippy::cast_possible_truncation)]
        let cursor_pos = request.content["cursor_pos"]
            .as_u64()
            .map_or(code_points, |v| v as usize)
            .min(code_points);

        let busy = self.cell.is_some() || self.bridge.execution_in_progress();
        let degraded = self
            .supervisor
            .as_ref()
            .is_none_or(ReplSupervisor::is_degraded);

        let (matches, cursor_start, cursor_end) =
            if busy || degraded || !self.state.completion_enabled() {
                (Vec::new(), cursor_pos, cursor_pos)
            } else {
                // All position arithmetic is in Unicode code points.
                let prefix: String = code.chars().take(cursor_pos).collect();
                let completions = self
                    .supervisor
                    .as_mut()
                    .map(|supervisor| supervisor.complete(&prefix))
                    .unwrap_or_default();
                let common = completions.common_prefix.chars().count();
                (
                    completions.matches,
                    cursor_pos.saturating_sub(common),
                    cursor_pos,
                )
            };

        let _ = self.session.reply(
            origin,
            request,
            json!({
                "status": "ok",
                "matches": matches,
                "cursor_start": cursor_start,
                "cursor_end": cursor_end,
                "metadata": {},
            }),
        );
    }

    // ---- kernel_info ------------------------------------------------------

    fn handle_kernel_info(&mut self, request: &WireMessage, origin: &'static str) {
        // Status goes out under this request's header without touching the
        // current parent, which may belong to an executing cell.
        let _ = self.session.send(
            channel::IOPUB,
            "status",
            json!({ "execution_state": "busy" }),
            Some(&request.header),
        );

        let version = self.swift_version.as_deref().unwrap_or("unknown");
        let _ = self.session.reply(
            origin,
            request,
            json!({
                "status": "ok",
                "protocol_version": swift_jupyter_protocol::PROTOCOL_VERSION,
                "implementation": "swift-jupyter-kernel",
                "implementation_version": version,
                "language_info": {
                    "name": "swift",
                    "version": version,
                    "mimetype": "text/x-swift",
                    "file_extension": ".swift",
                    "pygments_lexer": "swift",
                },
                "banner": format!("Swift kernel {}", env!("CARGO_PKG_VERSION")),
            }),
        );

        let _ = self.session.send(
            channel::IOPUB,
            "status",
            json!({ "execution_state": "idle" }),
            Some(&request.header),
        );
    }

    // ---- interrupt / shutdown --------------------------------------------

    fn handle_interrupt(&mut self, request: &WireMessage, origin: &'static str) {
        let delivered = self.bridge.interrupt();
        if self.cell.is_none() {
            // Nothing is executing, so there is nothing for the latch to
            // intercept.
            self.bridge.take_interrupt();
        }
        let content = if delivered {
            json!({ "status": "ok" })
        } else {
            json!({
                "status": "error",
                "ename": "NoProcess",
                "evalue": "no Swift process is running",
            })
        };
        let _ = self.session.reply(origin, request, content);
    }

    fn handle_shutdown(&mut self, request: &WireMessage, origin: &'static str) {
        let restart = request.content["restart"].as_bool().unwrap_or(false);
        info!("shutdown requested (restart={})", restart);
        let _ = self.session.reply(
            origin,
            request,
            json!({ "status": "ok", "restart": restart }),
        );
        self.shutdown_requested = true;
    }
}

fn join_paths(paths: &[std::path::PathBuf]) -> String {
    if paths.is_empty() {
        return "(none)".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

fn strip_source_location(source: &str) -> String {
    source
        .lines()
        .filter(|line| !line.trim_start().starts_with("#sourceLocation"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn error_reply(execution_count: u32, diagnostic: &Diagnostic) -> Value {
    json!({
        "status": "error",
        "execution_count": execution_count,
        "ename": diagnostic.name,
        "evalue": diagnostic.message,
        "traceback": diagnostic.traceback(),
    })
}

fn preprocess_diagnostic(error: &PreprocessError) -> Diagnostic {
    Diagnostic {
        name: "PreprocessorError".to_string(),
        severity: Severity::Error,
        message: error.to_string(),
        frames: Vec::new(),
        excerpt: None,
        install_kind: None,
        hints: Vec::new(),
    }
}

fn install_diagnostic(error: &InstallError) -> Diagnostic {
    Diagnostic {
        name: "InstallError".to_string(),
        severity: Severity::Error,
        message: error.to_string(),
        frames: Vec::new(),
        excerpt: None,
        install_kind: Some(error.kind()),
        hints: vec![error.remediation().to_string()],
    }
}

/// Best-effort `swift --version` probe; a dotted version or nothing
fn probe_swift_version(config: &KernelConfig) -> Option<String> {
    let output = std::process::Command::new(&config.swift_path)
        .arg("--version")
        .output()
        .ok()?;
    let text = crate::diagnostics::decode_bytes(&output.stdout);
    let pattern = regex::Regex::new(r"\d+(\.\d+)+").ok()?;
    pattern.find(&text).map(|m| m.as_str().to_string())
}
