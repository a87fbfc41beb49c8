//! Diagnostic formatting
//!
//! Turns raw debugger error strings and stop descriptions into structured
//! diagnostics: known debugger prefixes stripped, severity classified by
//! substring, stack frames serialized in the `  at f (<file>:<line>:<col>)`
//! shape, and a small catalog of common Swift mistakes matched to advisory
//! hints. Hints never replace or alter the underlying message.

use regex::Regex;
use std::sync::LazyLock;

use crate::debugger::FrameInfo;

/// Debugger preamble on expressions that failed to compile
pub const COMPILE_PREAMBLE: &str = "expression failed to parse:";
/// Debugger preamble on interrupted evaluations
pub const INTERRUPT_MARKER: &str = "Execution was interrupted";

/// Leading markers stripped from error descriptions before display
const STRIP_PREFIXES: &[&str] = &[COMPILE_PREAMBLE, "error: <EXPR>:", "repl.swift:"];

/// Severity of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Hard error
    Error,
    /// Warning
    Warning,
    /// Informational note
    Note,
}

/// Structured, user-facing diagnostic
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Short name used as the reply's `ename`
    pub name: String,
    /// Classified severity
    pub severity: Severity,
    /// Cleaned message body
    pub message: String,
    /// Swift-level stack frames, innermost first
    pub frames: Vec<FrameInfo>,
    /// Offending source excerpt, where one is known
    pub excerpt: Option<String>,
    /// Install-error sub-kind, for install failures only
    pub install_kind: Option<&'static str>,
    /// Advisory remediation hints
    pub hints: Vec<String>,
}

impl Diagnostic {
    /// Render the traceback lines for an error reply: the message, then the
    /// formatted frames, then hints (marked so strict tooling can strip them).
    pub fn traceback(&self) -> Vec<String> {
        let mut lines = vec![self.message.clone()];
        if let Some(excerpt) = &self.excerpt {
            lines.push(excerpt.clone());
        }
        lines.extend(self.frames.iter().map(format_frame));
        lines.extend(self.hints.iter().map(|h| format!("hint: {h}")));
        lines
    }
}

/// `  at <fn> (<file>:<line>:<col>)`
pub fn format_frame(frame: &FrameInfo) -> String {
    format!(
        "  at {} ({}:{}:{})",
        frame.function, frame.file, frame.line, frame.column
    )
}

/// True when the error description carries the compile-diagnostic prefix
pub fn is_compile_error(raw: &str) -> bool {
    let trimmed = raw.trim_start();
    trimmed.starts_with(COMPILE_PREAMBLE) || trimmed.starts_with("error:")
}

/// True when the error description reports an interrupted evaluation
pub fn is_interrupt_error(raw: &str) -> bool {
    raw.contains(INTERRUPT_MARKER)
}

/// Classify severity by substring, defaulting to error
pub fn classify_severity(text: &str) -> Severity {
    if text.contains("error:") {
        Severity::Error
    } else if text.contains("warning:") {
        Severity::Warning
    } else if text.contains("note:") {
        Severity::Note
    } else {
        Severity::Error
    }
}

/// Strip known debugger prefixes from an error description
pub fn strip_prefixes(raw: &str) -> String {
    let mut text = raw.trim_start();
    let mut changed = true;
    while changed {
        changed = false;
        for prefix in STRIP_PREFIXES {
            if let Some(rest) = text.strip_prefix(prefix) {
                text = rest.trim_start();
                changed = true;
            }
        }
    }
    text.to_string()
}

/// Decode raw bytes defensively: strict UTF-8 where possible, replacement
/// characters for anything invalid. Never fails.
pub fn decode_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

static HINT_CATALOG: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"cannot convert value of type",
            "if the conversion is intentional, use an explicit initializer such as Int(...) or String(...)",
        ),
        (
            r"[Ii]ndex out of range",
            "check collection bounds before subscripting; Swift arrays trap on out-of-range indices",
        ),
        (
            r"no such module",
            "install the package with %install before any Swift has run in this session (use %reset first if needed)",
        ),
        (
            r"cannot find '[^']+' in scope",
            "run the cell that declares this name first; names live only in this session",
        ),
        (
            r"[Uu]nexpectedly found nil",
            "use optional binding (if let / guard let) instead of force-unwrapping",
        ),
    ]
    .into_iter()
    .map(|(pattern, hint)| (Regex::new(pattern).expect("hint pattern"), hint))
    .collect()
});

/// Diagnostic formatter
#[derive(Debug, Clone, Default)]
pub struct DiagnosticFormatter;

impl DiagnosticFormatter {
    /// Create a formatter
    pub fn new() -> Self {
        Self
    }

    fn hints_for(message: &str) -> Vec<String> {
        HINT_CATALOG
            .iter()
            .filter(|(pattern, _)| pattern.is_match(message))
            .map(|(_, hint)| (*hint).to_string())
            .collect()
    }

    /// Format a compile-diagnostic error description
    pub fn compile_error(&self, raw: &str) -> Diagnostic {
        let message = strip_prefixes(raw);
        Diagnostic {
            name: "CompileError".to_string(),
            severity: classify_severity(&message),
            hints: Self::hints_for(&message),
            message,
            frames: Vec::new(),
            excerpt: None,
            install_kind: None,
        }
    }

    /// Format a runtime error for a stopped (non-exited) process
    pub fn runtime_error(&self, description: &str, frames: Vec<FrameInfo>) -> Diagnostic {
        let message = strip_prefixes(description);
        Diagnostic {
            name: "RuntimeError".to_string(),
            severity: Severity::Error,
            hints: Self::hints_for(&message),
            message,
            frames,
            excerpt: None,
            install_kind: None,
        }
    }

    /// Format the fatal diagnostic for a process that exited or crashed
    pub fn process_exited(&self, status: i64) -> Diagnostic {
        Diagnostic {
            name: "FatalError".to_string(),
            severity: Severity::Error,
            message: format!(
                "The Swift process exited with status {status} and cannot be recovered."
            ),
            frames: Vec::new(),
            excerpt: None,
            install_kind: None,
            hints: vec![
                "restart the kernel; if the problem persists, re-registration may be required"
                    .to_string(),
            ],
        }
    }

    /// Format the fatal diagnostic for a REPL that never started
    pub fn startup_failure(&self, reason: &str) -> Diagnostic {
        Diagnostic {
            name: "FatalError".to_string(),
            severity: Severity::Error,
            message: format!("The Swift REPL is not available: {reason}"),
            frames: Vec::new(),
            excerpt: None,
            install_kind: None,
            hints: vec![
                "verify the Swift toolchain installation and re-register the kernel".to_string(),
            ],
        }
    }

    /// Format an interrupted evaluation
    pub fn interrupted(&self) -> Diagnostic {
        Diagnostic {
            name: "Interrupted".to_string(),
            severity: Severity::Error,
            message: "Execution interrupted.".to_string(),
            frames: Vec::new(),
            excerpt: None,
            install_kind: None,
            hints: Vec::new(),
        }
    }

    /// Format a preprocessor failure
    pub fn preprocessor_error(&self, message: &str) -> Diagnostic {
        Diagnostic {
            name: "PreprocessorError".to_string(),
            severity: Severity::Error,
            message: message.to_string(),
            frames: Vec::new(),
            excerpt: None,
            install_kind: None,
            hints: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_strip_known_prefixes() {
        let raw = "expression failed to parse:\nerror: <EXPR>:1:5: cannot convert value of type 'String' to 'Int'";
        let cleaned = strip_prefixes(raw);
        assert!(cleaned.starts_with("1:5: cannot convert"));
    }

    #[test]
    fn test_compile_error_detection() {
        assert!(is_compile_error("expression failed to parse:\nerror: ..."));
        assert!(is_compile_error("error: something"));
        assert!(!is_compile_error("warning only"));
    }

    #[test]
    fn test_severity_classification() {
        assert_eq!(classify_severity("x error: y"), Severity::Error);
        assert_eq!(classify_severity("warning: unused"), Severity::Warning);
        assert_eq!(classify_severity("note: declared here"), Severity::Note);
        assert_eq!(classify_severity("anything else"), Severity::Error);
    }

    #[test]
    fn test_frame_format() {
        let frame = FrameInfo {
            function: "f()".to_string(),
            file: "<cell 3>".to_string(),
            line: 1,
            column: 27,
        };
        assert_eq!(format_frame(&frame), "  at f() (<cell 3>:1:27)");
    }

    #[test]
    fn test_conversion_hint_attached_without_altering_message() {
        let formatter = DiagnosticFormatter::new();
        let diag = formatter
            .compile_error("error: cannot convert value of type 'String' to specified type 'Int'");
        assert!(diag.message.contains("cannot convert value of type"));
        assert_eq!(diag.hints.len(), 1);
        assert!(diag.hints[0].contains("explicit initializer"));

        let traceback = diag.traceback();
        assert!(traceback.last().unwrap().starts_with("hint: "));
    }

    #[test]
    fn test_interrupt_marker() {
        assert!(is_interrupt_error(
            "error: Execution was interrupted, reason: signal SIGINT."
        ));
        assert!(!is_interrupt_error("error: other"));
    }

    #[test]
    fn test_decode_bytes_never_fails() {
        assert_eq!(decode_bytes(b"ok"), "ok");
        let decoded = decode_bytes(&[b'a', 0xFF, b'b']);
        assert!(decoded.contains('a') && decoded.contains('b'));
        assert!(decoded.contains('\u{FFFD}'));
    }
}
