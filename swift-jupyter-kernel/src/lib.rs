//! # Swift Jupyter Kernel
//!
//! An interactive Swift execution kernel speaking the Jupyter messaging
//! protocol. One persistent debugger-hosted Swift REPL process serves every
//! submission; around it sit:
//! - the cell preprocessor (magics, include splicing, source-location
//!   directives),
//! - the REPL supervisor (evaluation, outcome classification, value
//!   rendering, stack traces, lifecycle),
//! - the async I/O bridge (stdout drain thread, interrupt delivery,
//!   completion serialization),
//! - the package installer (synthetic package build, artifact relocation,
//!   dynamic load),
//! - the diagnostic formatter (prefix stripping, severity, hints).
//!
//! Wire transport and message signing come from `swift-jupyter-protocol`;
//! the native debugger is reached through the seam in [`debugger`], with an
//! LLDB-backed implementation behind the `lldb` feature and a deterministic
//! scripted backend for tests and offline development.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod debugger;
pub mod diagnostics;
pub mod install;
pub mod iobridge;
pub mod kernel;
pub mod logging;
pub mod magics;
pub mod preprocess;
pub mod render;
pub mod session;
pub mod signals;
pub mod supervisor;

pub use config::KernelConfig;
pub use diagnostics::{Diagnostic, DiagnosticFormatter, Severity};
pub use install::{InstallError, InstallRequest, InstalledPackage, PackageInstaller};
pub use kernel::Kernel;
pub use magics::{MagicDirective, MAGIC_TABLE};
pub use preprocess::{preprocess, Cell, PreprocessError, Preprocessed, SessionOp};
pub use session::SessionState;
pub use supervisor::{BackendFactory, ExecutionOutcome, ReplSupervisor, TimeitOutcome};

/// Kernel version
pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constant() {
        assert!(!KERNEL_VERSION.is_empty());
    }
}
