//! Tracing setup for kernel hosts
//!
//! Log output goes to stderr so it never mixes with the stdout the kernel
//! captures from the hosted process. Filtering follows `RUST_LOG` with a
//! caller-supplied default.

use tracing_subscriber::EnvFilter;

/// Initialize tracing at the default `info` level. Safe to call repeatedly;
/// later calls are no-ops.
pub fn init() {
    init_with_default("info");
}

/// Initialize tracing with a default filter used when `RUST_LOG` is unset
pub fn init_with_default(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
