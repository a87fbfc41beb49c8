//! Async I/O bridge
//!
//! Three concerns share this module: draining the hosted process's stdout to
//! the client, delivering interrupts, and serializing completion queries
//! against execution.
//!
//! The stdout drain runs on a dedicated reader thread that polls the
//! debugger's non-blocking stdout read while an execution is in progress and
//! publishes decoded text under the current parent header. Bytes are decoded
//! as UTF-8 with replacement characters for invalid sequences; a split
//! multi-byte sequence at a chunk boundary is held back until its tail
//! arrives.
//!
//! The interrupt latch and the execution-in-progress flag live behind a
//! single mutex; the latch is additionally observed by `%timeit` loops so
//! they can stop between iterations.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use swift_jupyter_protocol::{KernelSession, StreamName};

use crate::debugger::{InterruptHandle, StdoutSource};

const READ_CHUNK: usize = 4096;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Flags {
    executing: bool,
    interrupt_pending: bool,
}

#[derive(Default)]
struct Drain {
    source: Option<Box<dyn StdoutSource>>,
    pending: Vec<u8>,
}

struct Shared {
    session: KernelSession,
    flags: Mutex<Flags>,
    interrupter: Mutex<Option<Box<dyn InterruptHandle>>>,
    stdout: Mutex<Drain>,
    interrupts_delivered: AtomicU64,
    teardown: AtomicBool,
}

/// Bridge between the debugger's I/O surfaces and the protocol session
#[derive(Clone)]
pub struct IoBridge {
    shared: Arc<Shared>,
}

impl IoBridge {
    /// Create a bridge publishing through `session`
    pub fn new(session: KernelSession) -> Self {
        Self {
            shared: Arc::new(Shared {
                session,
                flags: Mutex::new(Flags::default()),
                interrupter: Mutex::new(None),
                stdout: Mutex::new(Drain::default()),
                interrupts_delivered: AtomicU64::new(0),
                teardown: AtomicBool::new(false),
            }),
        }
    }

    /// Attach the I/O handles of a freshly launched process
    pub fn attach(
        &self,
        source: Box<dyn StdoutSource>,
        interrupter: Box<dyn InterruptHandle>,
    ) {
        let mut drain = self.shared.stdout.lock();
        drain.source = Some(source);
        drain.pending.clear();
        drop(drain);
        *self.shared.interrupter.lock() = Some(interrupter);
        self.shared.flags.lock().interrupt_pending = false;
    }

    /// Detach the handles of a dead process
    pub fn detach(&self) {
        self.shared.stdout.lock().source = None;
        *self.shared.interrupter.lock() = None;
    }

    /// Raise the execution-in-progress flag
    pub fn begin_execution(&self) {
        self.shared.flags.lock().executing = true;
    }

    /// Lower the execution-in-progress flag
    pub fn end_execution(&self) {
        self.shared.flags.lock().executing = false;
    }

    /// Whether an evaluation is currently in flight
    pub fn execution_in_progress(&self) -> bool {
        self.shared.flags.lock().executing
    }

    /// Deliver an interrupt to the hosted process
    ///
    /// Sets the latch observed by `%timeit` loops and, when a process is
    /// attached, issues the debugger's asynchronous interrupt. Idempotent and
    /// safe to call with no process (no-op plus a warning). Returns whether
    /// the interrupt reached a live process.
    pub fn interrupt(&self) -> bool {
        self.shared.flags.lock().interrupt_pending = true;
        let guard = self.shared.interrupter.lock();
        match guard.as_ref() {
            Some(handle) => {
                if let Err(e) = handle.interrupt() {
                    warn!("interrupt delivery failed: {}", e);
                    false
                } else {
                    let n = self.shared.interrupts_delivered.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!("interrupt delivered (total {})", n);
                    true
                }
            }
            None => {
                warn!("interrupt requested but no Swift process is attached");
                false
            }
        }
    }

    /// Consume the interrupt latch, returning whether it was set
    pub fn take_interrupt(&self) -> bool {
        let mut flags = self.shared.flags.lock();
        std::mem::take(&mut flags.interrupt_pending)
    }

    /// Observe the interrupt latch without consuming it
    pub fn interrupt_pending(&self) -> bool {
        self.shared.flags.lock().interrupt_pending
    }

    /// Number of interrupts delivered to a live process
    pub fn interrupts_delivered(&self) -> u64 {
        self.shared.interrupts_delivered.load(Ordering::SeqCst)
    }

    /// Signal helper threads to exit at their next poll
    pub fn signal_teardown(&self) {
        self.shared.teardown.store(true, Ordering::SeqCst);
    }

    /// Whether teardown has been signalled
    pub fn teardown_signalled(&self) -> bool {
        self.shared.teardown.load(Ordering::SeqCst)
    }

    /// Read and publish everything currently pending, then flush any held
    /// incomplete byte sequence. Called by the supervisor before an outcome
    /// is classified so replies always follow the output they caused.
    pub fn drain_now(&self) {
        while Self::pump_once(&self.shared) > 0 {}
        let mut drain = self.shared.stdout.lock();
        if !drain.pending.is_empty() {
            let text = String::from_utf8_lossy(&drain.pending).into_owned();
            drain.pending.clear();
            if let Err(e) = self.shared.session.publish_stream(StreamName::Stdout, &text) {
                warn!("dropping trailing stdout: {}", e);
            }
        }
    }

    /// Spawn the stdout reader thread
    pub fn start_reader(&self) -> std::thread::JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("stdout-drain".to_string())
            .spawn(move || {
                trace!("stdout drain thread started");
                loop {
                    if shared.teardown.load(Ordering::SeqCst) {
                        break;
                    }
                    if shared.flags.lock().executing {
                        Self::pump_once(&shared);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                trace!("stdout drain thread stopped");
            })
            .expect("spawning stdout drain thread")
    }

    /// Read available bytes once and publish whatever decodes completely.
    /// Returns the number of bytes read. The stdout lock is held across the
    /// read and the publish so drain ordering is total.
    fn pump_once(shared: &Shared) -> usize {
        let mut drain = shared.stdout.lock();
        let Drain { source, pending } = &mut *drain;
        let Some(source) = source.as_mut() else {
            return 0;
        };

        let mut buf = [0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            match source.read_available(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    total += n;
                }
                Err(e) => {
                    warn!("stdout read failed: {}", e);
                    break;
                }
            }
        }

        if total > 0 {
            let text = decode_stream(pending);
            if !text.is_empty() {
                if let Err(e) = shared.session.publish_stream(StreamName::Stdout, &text) {
                    warn!("dropping stdout batch: {}", e);
                }
            }
        }
        total
    }
}

/// Decode the complete prefix of `pending` as UTF-8, replacing invalid
/// sequences and holding back a trailing incomplete sequence for the next
/// chunk.
fn decode_stream(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(s) => {
                out.push_str(s);
                pending.clear();
                break;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push('\u{FFFD}');
                        pending.drain(..valid + bad);
                    }
                    None => {
                        // Incomplete tail; keep it for the next read.
                        pending.drain(..valid);
                        break;
                    }
                }
            }
        }
    }
    out
}
