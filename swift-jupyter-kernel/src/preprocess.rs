//! Cell preprocessing
//!
//! Splits a raw submission into magic directives and residual Swift source.
//! Magic lines are consumed and never reach the REPL; configuration magics
//! mutate the kernel configuration in place, session operators short-circuit
//! into [`SessionOp`]s the kernel renders itself, `%include`/`%load` splice
//! file contents into the cell, and `%install` becomes an install request.
//!
//! The residual Swift gets a `#sourceLocation` directive naming the cell's
//! synthetic file, once per cell, so compiler diagnostics point at the cell
//! coordinate the user sees.

use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

use crate::config::KernelConfig;
use crate::install::InstallRequest;
use crate::magics::{MagicDirective, MagicError};
use crate::session::SessionState;

/// Failure detected before any code reaches the debugger
#[derive(Debug, Error)]
pub enum PreprocessError {
    /// Magic line did not parse
    #[error(transparent)]
    Magic(#[from] MagicError),
    /// `%include`/`%load` file not found
    #[error("include file {name:?} not found (searched: {searched})")]
    MissingInclude {
        /// Requested file name
        name: String,
        /// Directories searched, for the diagnostic
        searched: String,
    },
    /// File read failed
    #[error("cannot read {path}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// More than one `%install` in a single cell
    #[error("at most one %install directive is allowed per cell")]
    MultipleInstalls,
}

/// One submission, identified by its execution counter
#[derive(Debug, Clone)]
pub struct Cell {
    /// Execution counter assigned to this cell
    pub execution_count: u32,
    /// Raw text as submitted
    pub raw: String,
    /// Extracted magic directives, in order
    pub magics: Vec<MagicDirective>,
    /// Residual Swift with the source-location directive prepended, if any
    /// non-blank Swift remains
    pub swift_source: Option<String>,
    /// Synthetic file name used in diagnostics, `<cell N>`
    pub synthetic_file: String,
}

/// Session operator short-circuited by the preprocessor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOp {
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
    /// `%swift_config`
    SwiftConfig,
    /// `%save`
    Save(PathBuf),
    /// `%history`
    History,
    /// `%enable_completion`
    EnableCompletion,
    /// `%disable_completion`
    DisableCompletion,
}

/// Preprocessor output for one cell
#[derive(Debug)]
pub struct Preprocessed {
    /// The cell record, retained in history by the caller
    pub cell: Cell,
    /// Session operators to run, in order
    pub ops: Vec<SessionOp>,
    /// Install request, when the cell carried `%install`
    pub install: Option<InstallRequest>,
}

/// Split a submission into magics and residual Swift
///
/// Configuration magics are applied to `config` and `session` as a side
/// effect.
///
/// # Errors
///
/// Returns a [`PreprocessError`] for unknown magics, argument mismatches and
/// missing include files; the cell is then not executed.
pub fn preprocess(
    raw: &str,
    execution_count: u32,
    config: &mut KernelConfig,
    session: &mut SessionState,
) -> Result<Preprocessed, PreprocessError> {
    let synthetic_file = format!("<cell {execution_count}>");
    let mut magics = Vec::new();
    let mut ops = Vec::new();
    let mut install: Option<InstallRequest> = None;
    let mut swift_lines: Vec<String> = Vec::new();

    for line in raw.lines() {
        let Some(_name) = MagicDirective::line_magic_name(line) else {
            swift_lines.push(line.to_string());
            continue;
        };
        let magic = MagicDirective::parse(line)?;
        debug!("cell {} magic: {:?}", execution_count, magic);

        match &magic {
            MagicDirective::Install { spec, products } => {
                if install.is_some() {
                    return Err(PreprocessError::MultipleInstalls);
                }
                install = Some(InstallRequest {
                    spec: spec.clone(),
                    products: products.clone(),
                });
            }
            MagicDirective::InstallSwiftPmFlags(flags) => {
                config.swiftpm_flags.extend(flags.iter().cloned());
            }
            MagicDirective::InstallExtraIncludeCommand(command) => {
                config.extra_include_commands.push(command.clone());
            }
            MagicDirective::InstallLocation(path) => {
                config.install_root.clone_from(path);
            }
            MagicDirective::Include(name) => {
                let path = config.find_include(name).ok_or_else(|| {
                    PreprocessError::MissingInclude {
                        name: name.clone(),
                        searched: searched_dirs(config),
                    }
                })?;
                swift_lines.push(read_spliced(&path)?);
            }
            MagicDirective::Load(path) => {
                if !path.is_file() {
                    return Err(PreprocessError::MissingInclude {
                        name: path.display().to_string(),
                        searched: path.display().to_string(),
                    });
                }
                swift_lines.push(read_spliced(path)?);
            }
            MagicDirective::SwiftLibraryPath(path) => {
                config.library_paths.insert(0, path.clone());
            }
            MagicDirective::SwiftModulePath(path) => {
                config.module_paths.insert(0, path.clone());
            }
            MagicDirective::SwiftFrameworkPath(path) => {
                config.framework_paths.insert(0, path.clone());
            }
            MagicDirective::SwiftLink(symbol) => {
                session.pending_link_symbols.push(symbol.clone());
            }
            MagicDirective::SwiftFlags(flags) => {
                config.swift_flags.extend(flags.iter().cloned());
            }
            MagicDirective::SwiftEnv { name, value } => {
                config.env.insert(name.clone(), value.clone());
            }
            MagicDirective::SwiftIrSetup(root) => {
                config.library_paths.insert(0, root.join("usr/lib"));
                config.module_paths.insert(0, root.join("usr/lib/swift"));
                config
                    .framework_paths
                    .insert(0, root.join("System/Library/Frameworks"));
            }
            MagicDirective::Help => ops.push(SessionOp::Help),
            MagicDirective::LsMagic => ops.push(SessionOp::LsMagic),
            MagicDirective::Who => ops.push(SessionOp::Who),
            MagicDirective::Reset => ops.push(SessionOp::Reset),
            MagicDirective::Timeit(code) => ops.push(SessionOp::Timeit(code.clone())),
            MagicDirective::Env(assignment) => ops.push(SessionOp::Env(assignment.clone())),
            MagicDirective::SwiftVersion => ops.push(SessionOp::SwiftVersion),
            MagicDirective::SwiftConfig => ops.push(SessionOp::SwiftConfig),
            MagicDirective::Save(path) => ops.push(SessionOp::Save(path.clone())),
            MagicDirective::History => ops.push(SessionOp::History),
            MagicDirective::EnableCompletion => ops.push(SessionOp::EnableCompletion),
            MagicDirective::DisableCompletion => ops.push(SessionOp::DisableCompletion),
        }
        magics.push(magic);
    }

    let residual = swift_lines.join("\n");
    let swift_source = if residual.trim().is_empty() {
        None
    } else {
        Some(format!(
            "#sourceLocation(file: \"{synthetic_file}\", line: 1)\n{residual}"
        ))
    };

    Ok(Preprocessed {
        cell: Cell {
            execution_count,
            raw: raw.to_string(),
            magics,
            swift_source,
            synthetic_file,
        },
        ops,
        install,
    })
}

fn searched_dirs(config: &KernelConfig) -> String {
    config
        .include_dirs
        .iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_spliced(path: &std::path::Path) -> Result<String, PreprocessError> {
    std::fs::read_to_string(path).map_err(|source| PreprocessError::Io {
        path: path.to_path_buf(),
        source,
    })
}
