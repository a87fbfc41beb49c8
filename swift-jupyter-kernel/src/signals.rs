//! Legacy signal-based interrupt path
//!
//! Kernels registered with `interrupt_mode = "message"` receive interrupts on
//! the control channel, but older frontends deliver SIGINT to the kernel
//! process instead. A handler records the signal in an atomic flag and a
//! dedicated watcher thread converts it into the same bridge interrupt the
//! message path uses. The handler itself only touches the atomic; nothing
//! async-signal-unsafe runs in signal context.

use anyhow::{Context, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::iobridge::IoBridge;

/// Set by the handler when SIGINT arrives
pub static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

const WATCH_INTERVAL: Duration = Duration::from_millis(50);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    SIGINT_RECEIVED.store(true, Ordering::SeqCst);
}

/// Installs the SIGINT handler and runs the watcher thread
pub struct SignalWatcher {
    installed: bool,
}

impl SignalWatcher {
    /// Create a watcher; nothing is installed yet
    pub fn new() -> Self {
        Self { installed: false }
    }

    /// Install the SIGINT handler
    ///
    /// # Errors
    ///
    /// Returns an error if the handler cannot be installed.
    #[allow(unsafe_code)]
    pub fn install(&mut self) -> Result<()> {
        if self.installed {
            return Ok(());
        }
        let action = SigAction::new(
            SigHandler::Handler(handle_sigint),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            signal::sigaction(Signal::SIGINT, &action)
                .context("failed to install SIGINT handler")?;
        }
        self.installed = true;
        info!("signal interrupt handler installed");
        Ok(())
    }

    /// Consume a pending SIGINT, if one arrived
    pub fn take_pending(&self) -> bool {
        SIGINT_RECEIVED.swap(false, Ordering::SeqCst)
    }

    /// Reset the signal flag
    pub fn reset(&self) {
        SIGINT_RECEIVED.store(false, Ordering::SeqCst);
    }

    /// Spawn the watcher thread: polls the signal flag and forwards each
    /// SIGINT to the bridge until teardown is signalled.
    pub fn spawn(self, bridge: IoBridge) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("sigint-watch".to_string())
            .spawn(move || {
                trace!("signal watcher thread started");
                loop {
                    if bridge.teardown_signalled() {
                        break;
                    }
                    if self.take_pending() {
                        debug!("SIGINT received, forwarding as interrupt");
                        bridge.interrupt();
                    }
                    std::thread::sleep(WATCH_INTERVAL);
                }
                trace!("signal watcher thread stopped");
            })
            .expect("spawning signal watcher thread")
    }
}

impl Default for SignalWatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swift_jupyter_protocol::KernelSession;

    #[test]
    fn test_pending_flag_is_consumed_once() {
        let watcher = SignalWatcher::new();
        watcher.reset();
        SIGINT_RECEIVED.store(true, Ordering::SeqCst);
        assert!(watcher.take_pending());
        assert!(!watcher.take_pending());
    }

    #[test]
    fn test_watcher_forwards_signal_to_bridge() {
        let watcher = SignalWatcher::new();
        watcher.reset();

        let (session, _rx) = KernelSession::new("signal-test");
        let bridge = IoBridge::new(session);

        let handle = watcher.spawn(bridge.clone());
        SIGINT_RECEIVED.store(true, Ordering::SeqCst);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !bridge.interrupt_pending() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(bridge.interrupt_pending());

        bridge.signal_teardown();
        handle.join().unwrap();
    }
}
