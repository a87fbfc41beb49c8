//! Kernel configuration
//!
//! One record assembled at startup from environment variables, then mutated
//! at runtime by the configuration magics (`%install-location`,
//! `%install-swiftpm-flags`, `%swift_library_path`, ...). Path-shaped magics
//! take effect at the next process (re)launch; builder-shaped ones at the
//! next install.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the prebuilt Swift REPL executable
pub const ENV_REPL_PATH: &str = "REPL_SWIFT_PATH";
/// Environment variable naming the package builder executable
pub const ENV_SWIFT_BUILD: &str = "SWIFT_BUILD_PATH";
/// Environment variable naming the package tool executable
pub const ENV_SWIFT_PACKAGE: &str = "SWIFT_PACKAGE_PATH";
/// Environment variable with the build timeout in seconds
pub const ENV_INSTALL_TIMEOUT: &str = "SWIFT_INSTALL_TIMEOUT";
/// Environment variable with colon-separated `%include` search directories
pub const ENV_INCLUDE_DIRS: &str = "SWIFT_INCLUDE_DIRS";
/// Environment variable with an extra Swift module search path
pub const ENV_IMPORT_SEARCH_PATH: &str = "SWIFT_IMPORT_SEARCH_PATH";

const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 600;

/// Shared-library suffix used by the platform dynamic loader
pub const fn library_suffix() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else {
        ".so"
    }
}

/// Kernel-wide configuration record
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Debugger backend to create at startup ("lldb")
    pub backend: String,
    /// Prebuilt Swift REPL executable the debugger hosts
    pub repl_path: PathBuf,
    /// `swift` executable, used for version probing
    pub swift_path: PathBuf,
    /// Package builder executable
    pub swift_build_path: PathBuf,
    /// Package tool executable
    pub swift_package_path: PathBuf,
    /// Dynamic-loader search path prepended at process launch
    pub ld_library_path: Option<String>,
    /// Host architecture descriptor handed to the debugger target
    pub arch: String,
    /// Root of the on-disk install layout (package_base/, modules/, libs/)
    pub install_root: PathBuf,
    /// Wall-clock budget shared by the fetch/resolve and build phases
    pub build_timeout: Duration,
    /// Search directories for `%include`
    pub include_dirs: Vec<PathBuf>,
    /// Extra flags handed to the package builder
    pub swiftpm_flags: Vec<String>,
    /// Shell commands whose stdout yields extra include flags
    pub extra_include_commands: Vec<String>,
    /// Environment applied to the REPL at launch and to builder children
    pub env: HashMap<String, String>,
    /// Dynamic-loader paths declared with `%swift_library_path`
    pub library_paths: Vec<PathBuf>,
    /// Module search paths declared with `%swift_module_path`
    pub module_paths: Vec<PathBuf>,
    /// Framework search paths declared with `%swift_framework_path`
    pub framework_paths: Vec<PathBuf>,
    /// Compiler flags declared with `%swift_flags`
    pub swift_flags: Vec<String>,
    /// Total wall-clock time `%timeit` aims for
    pub timeit_target: Duration,
    /// Upper bound on `%timeit` iterations
    pub timeit_max_runs: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let install_root = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("swift-jupyter");
        Self {
            backend: "lldb".to_string(),
            repl_path: PathBuf::from("repl_swift"),
            swift_path: PathBuf::from("swift"),
            swift_build_path: PathBuf::from("swift-build"),
            swift_package_path: PathBuf::from("swift-package"),
            ld_library_path: None,
            arch: std::env::consts::ARCH.to_string(),
            install_root,
            build_timeout: Duration::from_secs(DEFAULT_BUILD_TIMEOUT_SECS),
            include_dirs: vec![PathBuf::from(".")],
            swiftpm_flags: Vec::new(),
            extra_include_commands: Vec::new(),
            env: HashMap::new(),
            library_paths: Vec::new(),
            module_paths: Vec::new(),
            framework_paths: Vec::new(),
            swift_flags: Vec::new(),
            timeit_target: Duration::from_millis(200),
            timeit_max_runs: 1000,
        }
    }
}

impl KernelConfig {
    /// Build a configuration from the process environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var(ENV_REPL_PATH) {
            config.repl_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var(ENV_SWIFT_BUILD) {
            config.swift_build_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var(ENV_SWIFT_PACKAGE) {
            config.swift_package_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("LD_LIBRARY_PATH") {
            config.ld_library_path = Some(path);
        }
        if let Ok(secs) = std::env::var(ENV_INSTALL_TIMEOUT) {
            match secs.parse::<u64>() {
                Ok(secs) => config.build_timeout = Duration::from_secs(secs),
                Err(_) => tracing::warn!(
                    "ignoring non-integer {}={:?}",
                    ENV_INSTALL_TIMEOUT,
                    secs
                ),
            }
        }
        if let Ok(dirs) = std::env::var(ENV_INCLUDE_DIRS) {
            config
                .include_dirs
                .extend(std::env::split_paths(&dirs));
        }
        if let Ok(path) = std::env::var(ENV_IMPORT_SEARCH_PATH) {
            config.module_paths.push(PathBuf::from(path));
        }
        config
    }

    /// Directory of synthesized throwaway packages
    pub fn package_base_dir(&self) -> PathBuf {
        self.install_root.join("package_base")
    }

    /// Consolidated Swift module directory the REPL searches
    pub fn modules_dir(&self) -> PathBuf {
        self.install_root.join("modules")
    }

    /// Directory of shared libraries loaded into the REPL
    pub fn libs_dir(&self) -> PathBuf {
        self.install_root.join("libs")
    }

    /// Resolve a `%include` name against the configured search directories
    pub fn find_include(&self, name: &str) -> Option<PathBuf> {
        if Path::new(name).is_absolute() {
            let path = PathBuf::from(name);
            return path.is_file().then_some(path);
        }
        self.include_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_under_install_root() {
        let config = KernelConfig::default();
        assert!(config.package_base_dir().starts_with(&config.install_root));
        assert!(config.modules_dir().ends_with("modules"));
        assert!(config.libs_dir().ends_with("libs"));
        assert_eq!(config.build_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_find_include_searches_configured_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("helper.swift");
        std::fs::write(&file, "func helper() {}\n").unwrap();

        let mut config = KernelConfig::default();
        config.include_dirs = vec![dir.path().to_path_buf()];
        assert_eq!(config.find_include("helper.swift"), Some(file));
        assert_eq!(config.find_include("missing.swift"), None);
    }

    #[test]
    fn test_library_suffix_is_platform_shaped() {
        let suffix = library_suffix();
        assert!(suffix == ".so" || suffix == ".dylib");
    }
}
