//! Magic directive definitions and parsing
//!
//! Magics are `%`-prefixed lines handled by the kernel instead of the Swift
//! REPL. The set is a closed dispatch table: adding a magic means adding a
//! table entry and a parse arm. Arguments follow shell-like token splitting,
//! except for the few magics that consume the rest of their line verbatim.

use std::path::PathBuf;
use thiserror::Error;

/// Parse failure for a magic line
#[derive(Debug, Error)]
pub enum MagicError {
    /// The name is not in the dispatch table
    #[error("unknown magic: {0} (see %lsmagic)")]
    Unknown(String),
    /// The arguments do not match the magic's usage
    #[error("usage: {usage}")]
    Usage {
        /// Usage line from the dispatch table
        usage: &'static str,
    },
    /// The arguments could not be token-split
    #[error("unbalanced quoting in arguments to {0}")]
    BadQuoting(String),
}

/// One entry of the magic dispatch table
#[derive(Debug, Clone, Copy)]
pub struct MagicSpec {
    /// Magic name, with the leading `%`
    pub name: &'static str,
    /// Usage line
    pub usage: &'static str,
    /// One-line description
    pub summary: &'static str,
}

/// The closed dispatch table of recognized magics
pub const MAGIC_TABLE: &[MagicSpec] = &[
    MagicSpec { name: "%install", usage: "%install '<package spec>' <Product> [Product ...]", summary: "build a package and load its products into the session" },
    MagicSpec { name: "%install-swiftpm-flags", usage: "%install-swiftpm-flags <flag> [flag ...]", summary: "append extra flags for the package builder" },
    MagicSpec { name: "%install-extra-include-command", usage: "%install-extra-include-command <shell command>", summary: "run a command whose stdout yields extra include flags" },
    MagicSpec { name: "%install-location", usage: "%install-location <path>", summary: "override the package build artifact root" },
    MagicSpec { name: "%include", usage: "%include <file>", summary: "splice a helper file into the cell" },
    MagicSpec { name: "%swift_library_path", usage: "%swift_library_path <path>", summary: "prepend a dynamic-loader search path" },
    MagicSpec { name: "%swift_module_path", usage: "%swift_module_path <path>", summary: "prepend a Swift module search path" },
    MagicSpec { name: "%swift_framework_path", usage: "%swift_framework_path <path>", summary: "prepend a framework search path" },
    MagicSpec { name: "%swift_link", usage: "%swift_link <symbol>", summary: "require a symbol to resolve after the next install" },
    MagicSpec { name: "%swift_flags", usage: "%swift_flags <flag> [flag ...]", summary: "append compiler flags for the session" },
    MagicSpec { name: "%swift_env", usage: "%swift_env NAME=VALUE", summary: "set an environment variable for the REPL and builds" },
    MagicSpec { name: "%swift_config", usage: "%swift_config", summary: "show the effective session configuration" },
    MagicSpec { name: "%swiftir_setup", usage: "%swiftir_setup <toolchain-root>", summary: "add library, module and framework paths under a toolchain root" },
    MagicSpec { name: "%help", usage: "%help", summary: "show this help" },
    MagicSpec { name: "%lsmagic", usage: "%lsmagic", summary: "list available magics" },
    MagicSpec { name: "%who", usage: "%who", summary: "list declarations seen this session (textual, best-effort)" },
    MagicSpec { name: "%reset", usage: "%reset", summary: "relaunch the Swift process; history is kept" },
    MagicSpec { name: "%timeit", usage: "%timeit <swift code>", summary: "time a statement over repeated runs" },
    MagicSpec { name: "%env", usage: "%env [NAME=VALUE]", summary: "show or set build environment variables" },
    MagicSpec { name: "%swift-version", usage: "%swift-version", summary: "show the toolchain version" },
    MagicSpec { name: "%load", usage: "%load <file>", summary: "splice a Swift file into the cell" },
    MagicSpec { name: "%save", usage: "%save <file>", summary: "write the session history to a file" },
    MagicSpec { name: "%history", usage: "%history", summary: "show the session history" },
    MagicSpec { name: "%enable_completion", usage: "%enable_completion", summary: "enable completion queries" },
    MagicSpec { name: "%disable_completion", usage: "%disable_completion", summary: "disable completion queries" },
];

fn usage_of(name: &str) -> &'static str {
    MAGIC_TABLE
        .iter()
        .find(|spec| spec.name == name)
        .map_or("", |spec| spec.usage)
}

/// Parsed magic directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MagicDirective {
    /// `%install`: package dependency spec plus products to link
    Install {
        /// Dependency specification (a `.package(...)` expression)
        spec: String,
        /// Product names to link
        products: Vec<String>,
    },
    /// `%install-swiftpm-flags`
    InstallSwiftPmFlags(Vec<String>),
    /// `%install-extra-include-command`
    InstallExtraIncludeCommand(String),
    /// `%install-location`
    InstallLocation(PathBuf),
    /// `%include`
    Include(String),
    /// `%swift_library_path`
    SwiftLibraryPath(PathBuf),
    /// `%swift_module_path`
    SwiftModulePath(PathBuf),
    /// `%swift_framework_path`
    SwiftFrameworkPath(PathBuf),
    /// `%swift_link`
    SwiftLink(String),
    /// `%swift_flags`
    SwiftFlags(Vec<String>),
    /// `%swift_env`
    SwiftEnv {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// `%swift_config`
    SwiftConfig,
    /// `%swiftir_setup`
    SwiftIrSetup(PathBuf),
    /// `%help`
    Help,
    /// `%lsmagic`
    LsMagic,
    /// `%who`
    Who,
    /// `%reset`
    Reset,
    /// `%timeit`
    Timeit(String),
    /// `%env`
    Env(Option<(String, String)>),
    /// `%swift-version`
    SwiftVersion,
    /// `%load`
    Load(PathBuf),
    /// `%save`
    Save(PathBuf),
    /// `%history`
    History,
    /// `%enable_completion`
    EnableCompletion,
    /// `%disable_completion`
    DisableCompletion,
}

impl MagicDirective {
    /// Magic name of a line whose first token is `%`-prefixed, if any
    pub fn line_magic_name(line: &str) -> Option<&str> {
        let token = line.trim_start().split_whitespace().next()?;
        token.starts_with('%').then_some(token)
    }

    /// Parse one magic line
    ///
    /// # Errors
    ///
    /// Returns [`MagicError`] for unknown names, bad quoting or argument
    /// mismatches.
    pub fn parse(line: &str) -> Result<Self, MagicError> {
        let trimmed = line.trim();
        let name = Self::line_magic_name(trimmed)
            .ok_or_else(|| MagicError::Unknown(trimmed.to_string()))?;
        let rest = trimmed[name.len()..].trim();

        if !MAGIC_TABLE.iter().any(|spec| spec.name == name) {
            return Err(MagicError::Unknown(name.to_string()));
        }

        // Verbatim-argument magics skip token splitting.
        match name {
            "%install-extra-include-command" => {
                return if rest.is_empty() {
                    Err(MagicError::Usage { usage: usage_of(name) })
                } else {
                    Ok(Self::InstallExtraIncludeCommand(rest.to_string()))
                };
            }
            "%timeit" => {
                return if rest.is_empty() {
                    Err(MagicError::Usage { usage: usage_of(name) })
                } else {
                    Ok(Self::Timeit(rest.to_string()))
                };
            }
            _ => {}
        }

        let args =
            shlex::split(rest).ok_or_else(|| MagicError::BadQuoting(name.to_string()))?;
        let usage = || MagicError::Usage { usage: usage_of(name) };

        match name {
            "%install" => {
                if args.len() < 2 {
                    return Err(usage());
                }
                Ok(Self::Install {
                    spec: args[0].clone(),
                    products: args[1..].to_vec(),
                })
            }
            "%install-swiftpm-flags" => {
                if args.is_empty() {
                    return Err(usage());
                }
                Ok(Self::InstallSwiftPmFlags(args))
            }
            "%install-location" => one_path(&args, usage).map(Self::InstallLocation),
            "%include" => one_arg(&args, usage).map(Self::Include),
            "%swift_library_path" => one_path(&args, usage).map(Self::SwiftLibraryPath),
            "%swift_module_path" => one_path(&args, usage).map(Self::SwiftModulePath),
            "%swift_framework_path" => one_path(&args, usage).map(Self::SwiftFrameworkPath),
            "%swift_link" => one_arg(&args, usage).map(Self::SwiftLink),
            "%swift_flags" => {
                if args.is_empty() {
                    return Err(usage());
                }
                Ok(Self::SwiftFlags(args))
            }
            "%swift_env" => {
                let assignment = args.first().ok_or_else(usage)?;
                let (name, value) = assignment.split_once('=').ok_or_else(usage)?;
                Ok(Self::SwiftEnv {
                    name: name.to_string(),
                    value: value.to_string(),
                })
            }
            "%swift_config" => no_args(&args, usage).map(|()| Self::SwiftConfig),
            "%swiftir_setup" => one_path(&args, usage).map(Self::SwiftIrSetup),
            "%help" => no_args(&args, usage).map(|()| Self::Help),
            "%lsmagic" => no_args(&args, usage).map(|()| Self::LsMagic),
            "%who" => no_args(&args, usage).map(|()| Self::Who),
            "%reset" => no_args(&args, usage).map(|()| Self::Reset),
            "%env" => match args.first() {
                None => Ok(Self::Env(None)),
                Some(assignment) => {
                    let (name, value) = assignment.split_once('=').ok_or_else(usage)?;
                    Ok(Self::Env(Some((name.to_string(), value.to_string()))))
                }
            },
            "%swift-version" => no_args(&args, usage).map(|()| Self::SwiftVersion),
            "%load" => one_path(&args, usage).map(Self::Load),
            "%save" => one_path(&args, usage).map(Self::Save),
            "%history" => no_args(&args, usage).map(|()| Self::History),
            "%enable_completion" => no_args(&args, usage).map(|()| Self::EnableCompletion),
            "%disable_completion" => no_args(&args, usage).map(|()| Self::DisableCompletion),
            _ => Err(MagicError::Unknown(name.to_string())),
        }
    }

    /// Whether this directive starts a package install
    pub fn is_install(&self) -> bool {
        matches!(self, Self::Install { .. })
    }

    /// Help text rendered from the dispatch table
    pub fn help_text() -> String {
        let width = MAGIC_TABLE
            .iter()
            .map(|spec| spec.usage.len())
            .max()
            .unwrap_or(0);
        let mut text = String::from("Available magics:\n");
        for spec in MAGIC_TABLE {
            text.push_str(&format!("  {:width$}  {}\n", spec.usage, spec.summary));
        }
        text
    }

    /// Magic names rendered from the dispatch table
    pub fn lsmagic_text() -> String {
        let names: Vec<&str> = MAGIC_TABLE.iter().map(|spec| spec.name).collect();
        format!("{}\n", names.join("  "))
    }
}

fn one_arg(
    args: &[String],
    usage: impl Fn() -> MagicError,
) -> Result<String, MagicError> {
    if args.len() == 1 {
        Ok(args[0].clone())
    } else {
        Err(usage())
    }
}

fn one_path(
    args: &[String],
    usage: impl Fn() -> MagicError,
) -> Result<PathBuf, MagicError> {
    one_arg(args, usage).map(PathBuf::from)
}

fn no_args(args: &[String], usage: impl Fn() -> MagicError) -> Result<(), MagicError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(usage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_install_parses_spec_and_products() {
        let magic = MagicDirective::parse(
            "%install '.package(url: \"https://github.com/e/F\", from: \"1.0.0\")' F FExtras",
        )
        .unwrap();
        match magic {
            MagicDirective::Install { spec, products } => {
                assert!(spec.contains("github.com/e/F"));
                assert_eq!(products, vec!["F".to_string(), "FExtras".to_string()]);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_install_requires_a_product() {
        let err = MagicDirective::parse("%install '.package(path: \"/x\")'").unwrap_err();
        assert!(matches!(err, MagicError::Usage { .. }));
    }

    #[test]
    fn test_unknown_magic_is_rejected() {
        let err = MagicDirective::parse("%frobnicate now").unwrap_err();
        assert!(matches!(err, MagicError::Unknown(_)));
    }

    #[test]
    fn test_timeit_takes_rest_of_line_verbatim() {
        let magic = MagicDirective::parse("%timeit var s = 0; for i in 1...100 { s += i }").unwrap();
        assert_eq!(
            magic,
            MagicDirective::Timeit("var s = 0; for i in 1...100 { s += i }".to_string())
        );
    }

    #[test]
    fn test_swift_env_requires_assignment() {
        assert!(MagicDirective::parse("%swift_env FOO").is_err());
        let magic = MagicDirective::parse("%swift_env FOO=bar").unwrap();
        assert_eq!(
            magic,
            MagicDirective::SwiftEnv {
                name: "FOO".to_string(),
                value: "bar".to_string()
            }
        );
    }

    #[test]
    fn test_help_lists_every_table_entry() {
        let help = MagicDirective::help_text();
        for spec in MAGIC_TABLE {
            assert!(help.contains(spec.name), "help missing {}", spec.name);
        }
    }

    #[test]
    fn test_line_magic_name_detection() {
        assert_eq!(
            MagicDirective::line_magic_name("  %include helper.swift"),
            Some("%include")
        );
        assert_eq!(MagicDirective::line_magic_name("let x = 1"), None);
        assert_eq!(MagicDirective::line_magic_name("   "), None);
    }
}
