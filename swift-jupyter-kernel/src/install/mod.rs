//! Package installer
//!
//! Installing a package while the REPL is running takes five phases, each
//! announced to the client so long builds stay visible:
//!
//! 1. synthesize a throwaway package that depends on the requested packages,
//! 2. fetch and resolve dependencies through the external builder,
//! 3. build, then inspect the builder's `build.db` for consistency,
//! 4. copy fresh Swift module artifacts into the module directory the REPL
//!    already searches,
//! 5. load the produced shared libraries into the running process with lazy
//!    binding and global symbol visibility.
//!
//! Installs must precede any successful Swift evaluation in the session: the
//! synthetic build copies flags and search paths the REPL received at
//! launch, and mixing orders aliases symbols. A failed install leaves no
//! record and does not disturb previously installed packages; loaded
//! libraries are never unloaded.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use swift_jupyter_protocol::{KernelSession, StreamName};

use crate::config::{library_suffix, KernelConfig};
use crate::session::SessionState;

pub mod manifest;

/// A parsed `%install` directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    /// Dependency specification (a `.package(...)` expression)
    pub spec: String,
    /// Product names to link
    pub products: Vec<String>,
}

/// A shared library loaded into the running process; never closed
#[derive(Debug)]
pub struct LoadedLibrary {
    /// On-disk path the library was loaded from
    pub path: PathBuf,
    handle: libloading::os::unix::Library,
}

impl LoadedLibrary {
    /// Whether `symbol` resolves in this library
    pub fn resolves(&self, symbol: &str) -> bool {
        #[allow(unsafe_code)]
        unsafe {
            self.handle
                .get::<*const std::os::raw::c_void>(symbol.as_bytes())
                .is_ok()
        }
    }
}

/// Record of a completed install, kept for the process lifetime
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    /// Products linked by this install
    pub products: Vec<String>,
    /// Dependency specification that produced them
    pub spec: String,
    /// Digest over the copied module artifacts
    pub fingerprint: String,
    /// Include paths resolved by the extra-include commands
    pub include_paths: Vec<PathBuf>,
    /// Libraries loaded for this install
    pub libraries: Vec<Arc<LoadedLibrary>>,
}

/// Install failure taxonomy; every kind carries fixed remediation text
#[derive(Debug, Error)]
pub enum InstallError {
    /// Configuration or filesystem preconditions missing
    #[error("install configuration is unusable: {0}")]
    MissingConfig(String),
    /// The dependency specification is malformed
    #[error("invalid package specification: {0}")]
    BadSpec(String),
    /// Swift source already ran in this session
    #[error("%install must come before any Swift code has executed in this session")]
    OrderedAfterExecution,
    /// The external builder failed
    #[error("package build failed: {0}")]
    BuildFailure(String),
    /// The build exceeded its wall-clock budget
    #[error("package build timed out after {0} seconds")]
    Timeout(u64),
    /// Artifact relocation failed
    #[error("copying build artifacts failed: {0}")]
    ArtifactCopy(String),
    /// The dynamic loader rejected a produced library
    #[error("loading a built library failed: {0}")]
    LoadFailure(String),
}

impl InstallError {
    /// Stable sub-kind name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingConfig(_) => "missing-config",
            Self::BadSpec(_) => "bad-spec",
            Self::OrderedAfterExecution => "install-ordering",
            Self::BuildFailure(_) => "build-failure",
            Self::Timeout(_) => "timeout",
            Self::ArtifactCopy(_) => "artifact-copy-failure",
            Self::LoadFailure(_) => "load-failure",
        }
    }

    /// Fixed remediation advice for this kind
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::MissingConfig(_) => {
                "set SWIFT_BUILD_PATH to a working builder and check that the install location is writable"
            }
            Self::BadSpec(_) => {
                "the specification must be a .package(...) expression; see %help for the %install syntax"
            }
            Self::OrderedAfterExecution => {
                "run %reset (or restart the kernel) and put %install cells before any Swift code"
            }
            Self::BuildFailure(_) => {
                "inspect the build output above, or run the build by hand under package_base/ in the install location"
            }
            Self::Timeout(_) => {
                "raise SWIFT_INSTALL_TIMEOUT, check network connectivity, or pre-warm the build cache"
            }
            Self::ArtifactCopy(_) => {
                "check permissions and free space under the install location, then retry"
            }
            Self::LoadFailure(_) => {
                "common causes: missing system libraries, an incompatible Swift runtime, stale artifacts, or an architecture mismatch; clear the install location and retry"
            }
        }
    }
}

/// The package installer
#[derive(Debug, Default)]
pub struct PackageInstaller;

impl PackageInstaller {
    /// Create an installer
    pub fn new() -> Self {
        Self
    }

    /// Run the five install phases for one request
    ///
    /// # Errors
    ///
    /// Returns an [`InstallError`]; on failure no record is stored and
    /// previously installed packages are untouched.
    #[instrument(level = "info", skip_all, fields(products = ?request.products))]
    pub async fn install(
        &self,
        request: &InstallRequest,
        config: &KernelConfig,
        state: &mut SessionState,
        session: &KernelSession,
    ) -> Result<InstalledPackage, InstallError> {
        if state.swift_executed() {
            return Err(InstallError::OrderedAfterExecution);
        }
        if !request.spec.contains(".package(") {
            return Err(InstallError::BadSpec(request.spec.clone()));
        }
        if request.products.is_empty() {
            return Err(InstallError::BadSpec(
                "no products named after the package specification".to_string(),
            ));
        }

        // Phase 1: manifest synthesis.
        progress(session, 1, "synthesizing package manifest");
        let package_dir = self.synthesize_package(request, config, state)?;

        // Phase 2: fetch and resolve through the external builder.
        progress(session, 2, "fetching and resolving dependencies");
        let include_paths = self.resolve_extra_includes(config, session).await?;
        let status = self
            .run_builder(config, &package_dir, &include_paths, session)
            .await?;

        // Phase 3: inspect the build database.
        progress(session, 3, "checking build products");
        let build_dir = package_dir.join(".build");
        self.check_build(&build_dir, status)?;

        // Phase 4: artifact relocation.
        progress(session, 4, "copying Swift module artifacts");
        let fingerprint = self.copy_modules(&build_dir, &config.modules_dir())?;

        // Phase 5: dynamic load.
        progress(session, 5, "loading shared libraries");
        let libraries = self.load_libraries(&build_dir, &config.libs_dir())?;
        self.check_link_symbols(state, &libraries)?;

        let record = InstalledPackage {
            products: request.products.clone(),
            spec: request.spec.clone(),
            fingerprint,
            include_paths,
            libraries,
        };
        state.record_install(record.clone());
        info!(
            "installed products {:?} ({} libraries loaded)",
            record.products,
            record.libraries.len()
        );
        Ok(record)
    }

    fn synthesize_package(
        &self,
        request: &InstallRequest,
        config: &KernelConfig,
        state: &SessionState,
    ) -> Result<PathBuf, InstallError> {
        let package_dir = config.package_base_dir().join(manifest::PACKAGE_NAME);
        for dir in [&package_dir, &config.modules_dir(), &config.libs_dir()] {
            std::fs::create_dir_all(dir).map_err(|e| {
                InstallError::MissingConfig(format!("cannot create {}: {e}", dir.display()))
            })?;
        }

        let mut specs = state.installed_specs();
        if !specs.contains(&request.spec) {
            specs.push(request.spec.clone());
        }
        let mut products: Vec<String> = state.installed().keys().cloned().collect();
        products.sort();
        for product in &request.products {
            if !products.contains(product) {
                products.push(product.clone());
            }
        }

        let manifest_text = manifest::render_manifest(&specs, &products);
        std::fs::write(package_dir.join("Package.swift"), manifest_text).map_err(|e| {
            InstallError::MissingConfig(format!("cannot write Package.swift: {e}"))
        })?;
        std::fs::write(
            package_dir.join(manifest::STUB_SOURCE_NAME),
            manifest::STUB_SOURCE,
        )
        .map_err(|e| InstallError::MissingConfig(format!("cannot write stub source: {e}")))?;
        Ok(package_dir)
    }

    /// Run the configured extra-include commands; their stdout tokens become
    /// builder flags, and `-I` paths are kept on the install record.
    async fn resolve_extra_includes(
        &self,
        config: &KernelConfig,
        session: &KernelSession,
    ) -> Result<Vec<PathBuf>, InstallError> {
        let mut paths = Vec::new();
        for command in &config.extra_include_commands {
            let output = Command::new("sh")
                .arg("-c")
                .arg(command)
                .output()
                .await
                .map_err(|e| {
                    InstallError::MissingConfig(format!(
                        "extra include command {command:?} failed to run: {e}"
                    ))
                })?;
            if !output.status.success() {
                return Err(InstallError::MissingConfig(format!(
                    "extra include command {command:?} exited with {}",
                    output.status
                )));
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            for token in stdout.split_whitespace() {
                if let Some(path) = token.strip_prefix("-I") {
                    paths.push(PathBuf::from(path));
                }
            }
            let _ = session.publish_stream(
                StreamName::Stdout,
                &format!("resolved include flags: {}\n", stdout.trim()),
            );
        }
        Ok(paths)
    }

    async fn run_builder(
        &self,
        config: &KernelConfig,
        package_dir: &Path,
        include_paths: &[PathBuf],
        session: &KernelSession,
    ) -> Result<std::process::ExitStatus, InstallError> {
        let mut command = Command::new(&config.swift_build_path);
        command
            .arg("-c")
            .arg("debug")
            .args(&config.swiftpm_flags)
            .current_dir(package_dir)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for path in include_paths {
            command.arg("-Xcc").arg(format!("-I{}", path.display()));
        }

        let mut child = command.spawn().map_err(|e| {
            InstallError::MissingConfig(format!(
                "cannot run builder {}: {e}",
                config.swift_build_path.display()
            ))
        })?;

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_lines(
                stdout,
                session.clone(),
                StreamName::Stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_lines(
                stderr,
                session.clone(),
                StreamName::Stderr,
            )));
        }

        let waited = tokio::time::timeout(config.build_timeout, child.wait()).await;
        if waited.is_err() {
            if let Err(e) = child.kill().await {
                warn!("killing timed-out builder failed: {}", e);
            }
        }
        // The pipes close with the child; let the forwarders flush before the
        // outcome is reported.
        for forwarder in forwarders {
            let _ = forwarder.await;
        }

        match waited {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(InstallError::BuildFailure(format!(
                "waiting for the builder failed: {e}"
            ))),
            Err(_) => Err(InstallError::Timeout(config.build_timeout.as_secs())),
        }
    }

    fn check_build(
        &self,
        build_dir: &Path,
        status: std::process::ExitStatus,
    ) -> Result<(), InstallError> {
        let build_db = build_dir.join("build.db");
        if status.success() {
            if build_db.is_file() {
                Ok(())
            } else {
                Err(InstallError::BuildFailure(
                    "builder reported success but left no build database; the build tree is inconsistent"
                        .to_string(),
                ))
            }
        } else if build_db.is_file() {
            Err(InstallError::BuildFailure(format!(
                "builder exited with {status} after the build ran; no usable artifacts were produced"
            )))
        } else {
            Err(InstallError::BuildFailure(format!(
                "builder exited with {status}"
            )))
        }
    }

    /// Copy fresh module artifacts into the REPL's module directory.
    /// Existing files are overwritten; any error aborts the phase.
    fn copy_modules(&self, build_dir: &Path, modules_dir: &Path) -> Result<String, InstallError> {
        const MODULE_EXTENSIONS: &[&str] = &["swiftmodule", "swiftdoc", "swiftinterface"];
        let debug_dir = build_dir.join("debug");
        let mut digest = Sha256::new();
        let mut copied = 0usize;

        let mut entries: Vec<PathBuf> = WalkDir::new(&debug_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| MODULE_EXTENSIONS.contains(&ext))
            })
            .collect();
        entries.sort();

        for path in entries {
            let Some(file_name) = path.file_name() else {
                continue;
            };
            let target = modules_dir.join(file_name);
            std::fs::copy(&path, &target).map_err(|e| {
                InstallError::ArtifactCopy(format!(
                    "{} -> {}: {e}",
                    path.display(),
                    target.display()
                ))
            })?;
            digest.update(file_name.to_string_lossy().as_bytes());
            let contents = std::fs::read(&path).map_err(|e| {
                InstallError::ArtifactCopy(format!("{}: {e}", path.display()))
            })?;
            digest.update(&contents);
            copied += 1;
        }

        debug!("copied {} module artifacts", copied);
        Ok(hex::encode(digest.finalize()))
    }

    /// Load every produced shared library with lazy binding and global
    /// symbol visibility. Handles stay open for the process lifetime.
    fn load_libraries(
        &self,
        build_dir: &Path,
        libs_dir: &Path,
    ) -> Result<Vec<Arc<LoadedLibrary>>, InstallError> {
        let debug_dir = build_dir.join("debug");
        let mut libraries = Vec::new();

        let mut produced: Vec<PathBuf> = WalkDir::new(&debug_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| {
                        name.starts_with("lib") && name.ends_with(library_suffix())
                    })
            })
            .collect();
        produced.sort();

        for path in produced {
            let Some(file_name) = path.file_name() else {
                continue;
            };
            let target = libs_dir.join(file_name);
            std::fs::copy(&path, &target).map_err(|e| {
                InstallError::ArtifactCopy(format!(
                    "{} -> {}: {e}",
                    path.display(),
                    target.display()
                ))
            })?;

            #[allow(unsafe_code)]
            let handle = unsafe {
                libloading::os::unix::Library::open(
                    Some(&target),
                    libc::RTLD_LAZY | libc::RTLD_GLOBAL,
                )
            }
            .map_err(|e| InstallError::LoadFailure(format!("{}: {e}", target.display())))?;

            info!("loaded {}", target.display());
            libraries.push(Arc::new(LoadedLibrary {
                path: target,
                handle,
            }));
        }
        Ok(libraries)
    }

    /// Verify every `%swift_link` symbol resolves in some loaded library
    fn check_link_symbols(
        &self,
        state: &mut SessionState,
        libraries: &[Arc<LoadedLibrary>],
    ) -> Result<(), InstallError> {
        let symbols = std::mem::take(&mut state.pending_link_symbols);
        for symbol in &symbols {
            let resolved = libraries.iter().any(|lib| lib.resolves(symbol));
            if !resolved {
                // Put the symbols back so a retry still checks them.
                state.pending_link_symbols = symbols.clone();
                return Err(InstallError::LoadFailure(format!(
                    "required symbol '{symbol}' did not resolve in any loaded library"
                )));
            }
        }
        Ok(())
    }
}

fn progress(session: &KernelSession, phase: u8, message: &str) {
    let line = format!("[{phase}/5] {message}\n");
    if let Err(e) = session.publish_stream(StreamName::Stdout, &line) {
        warn!("dropping install progress message: {}", e);
    }
}

async fn forward_lines(
    stream: impl tokio::io::AsyncRead + Unpin,
    session: KernelSession,
    name: StreamName,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if session.publish_stream(name, &format!("{line}\n")).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_every_kind_has_remediation() {
        let errors = [
            InstallError::MissingConfig("x".to_string()),
            InstallError::BadSpec("x".to_string()),
            InstallError::OrderedAfterExecution,
            InstallError::BuildFailure("x".to_string()),
            InstallError::Timeout(600),
            InstallError::ArtifactCopy("x".to_string()),
            InstallError::LoadFailure("x".to_string()),
        ];
        for error in errors {
            assert!(!error.kind().is_empty());
            assert!(!error.remediation().is_empty());
        }
    }

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(InstallError::Timeout(1).kind(), "timeout");
        assert_eq!(
            InstallError::OrderedAfterExecution.kind(),
            "install-ordering"
        );
        assert_eq!(
            InstallError::LoadFailure(String::new()).kind(),
            "load-failure"
        );
    }

    #[tokio::test]
    async fn test_install_rejected_after_execution() {
        let (session, _rx) = KernelSession::new("install-test");
        let mut state = SessionState::new();
        state.mark_swift_executed();
        let installer = PackageInstaller::new();
        let request = InstallRequest {
            spec: ".package(path: \"/x\")".to_string(),
            products: vec!["X".to_string()],
        };
        let err = installer
            .install(&request, &KernelConfig::default(), &mut state, &session)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::OrderedAfterExecution));
        assert!(state.installed().is_empty());
    }

    #[tokio::test]
    async fn test_install_rejects_non_package_spec() {
        let (session, _rx) = KernelSession::new("install-test");
        let mut state = SessionState::new();
        let installer = PackageInstaller::new();
        let request = InstallRequest {
            spec: "https://github.com/e/F".to_string(),
            products: vec!["F".to_string()],
        };
        let err = installer
            .install(&request, &KernelConfig::default(), &mut state, &session)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::BadSpec(_)));
    }
}
