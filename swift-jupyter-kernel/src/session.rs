//! Session state
//!
//! Process-wide mutable state of one kernel session: the monotonic execution
//! counter, the ordered history of submitted Swift cells, the best-effort
//! textual declaration tracker behind `%who`, installed-package records, and
//! the completion toggle. Written only from the event loop.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::install::InstalledPackage;

static DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(?:public\s+|private\s+|internal\s+|fileprivate\s+|final\s+|static\s+)*(?:let|var|func|struct|class)\s+([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("declaration pattern")
});

/// One retained Swift cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Execution counter the cell ran under
    pub execution_count: u32,
    /// Residual Swift source (magics removed)
    pub source: String,
    /// Submission time
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Mutable session state
#[derive(Debug, Default)]
pub struct SessionState {
    execution_count: u32,
    history: Vec<HistoryEntry>,
    declarations: Vec<String>,
    installed: HashMap<String, InstalledPackage>,
    swift_executed: bool,
    completion_disabled: bool,
    /// Symbols declared with `%swift_link`, checked after the next install
    pub pending_link_symbols: Vec<String>,
}

impl SessionState {
    /// Fresh session state
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the execution counter
    pub fn next_execution_count(&mut self) -> u32 {
        self.execution_count += 1;
        self.execution_count
    }

    /// Current value of the execution counter
    pub fn execution_count(&self) -> u32 {
        self.execution_count
    }

    /// Reset the counter (`%reset`); history is retained
    pub fn reset_counter(&mut self) {
        self.execution_count = 0;
        self.swift_executed = false;
    }

    /// Record a successfully submitted Swift cell
    pub fn record_cell(&mut self, execution_count: u32, source: &str) {
        for capture in DECLARATION.captures_iter(source) {
            let name = capture[1].to_string();
            if !self.declarations.contains(&name) {
                self.declarations.push(name);
            }
        }
        self.history.push(HistoryEntry {
            execution_count,
            source: source.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    /// Ordered history of retained cells
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Write the numbered history to a file (`%save`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_history(&self, path: &Path) -> anyhow::Result<()> {
        let mut content = String::new();
        for entry in &self.history {
            content.push_str(&format!("// In[{}]\n{}\n", entry.execution_count, entry.source));
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Names observed by the textual declaration tracker (`%who`)
    pub fn declarations(&self) -> &[String] {
        &self.declarations
    }

    /// Mark that Swift source has been evaluated successfully; package
    /// installs are rejected from this point until the next `%reset`.
    pub fn mark_swift_executed(&mut self) {
        self.swift_executed = true;
    }

    /// Whether Swift source has been evaluated successfully
    pub fn swift_executed(&self) -> bool {
        self.swift_executed
    }

    /// Installed-package records, keyed by product name
    pub fn installed(&self) -> &HashMap<String, InstalledPackage> {
        &self.installed
    }

    /// Store an installed-package record under each of its product names
    pub fn record_install(&mut self, package: InstalledPackage) {
        for product in &package.products {
            self.installed.insert(product.clone(), package.clone());
        }
    }

    /// Dependency specifications of every completed install, in order
    pub fn installed_specs(&self) -> Vec<String> {
        let mut specs: Vec<String> = Vec::new();
        for package in self.installed.values() {
            if !specs.contains(&package.spec) {
                specs.push(package.spec.clone());
            }
        }
        specs
    }

    /// Toggle completion queries (`%enable_completion` / `%disable_completion`)
    pub fn set_completion_enabled(&mut self, enabled: bool) {
        self.completion_disabled = !enabled;
    }

    /// Whether completion queries may touch the debugger
    pub fn completion_enabled(&self) -> bool {
        !self.completion_disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_counter_is_monotonic_and_resettable() {
        let mut state = SessionState::new();
        assert_eq!(state.next_execution_count(), 1);
        assert_eq!(state.next_execution_count(), 2);
        assert_eq!(state.execution_count(), 2);
        state.reset_counter();
        assert_eq!(state.execution_count(), 0);
        assert_eq!(state.next_execution_count(), 1);
    }

    #[test]
    fn test_reset_keeps_history() {
        let mut state = SessionState::new();
        let n = state.next_execution_count();
        state.record_cell(n, "let x = 1");
        state.reset_counter();
        assert_eq!(state.history().len(), 1);
    }

    #[test]
    fn test_declaration_tracker_sees_common_forms() {
        let mut state = SessionState::new();
        state.record_cell(
            1,
            "let x = 1\nvar y = 2\nfunc f() {}\nstruct S {}\nclass C {}\npublic let z = 3",
        );
        let names = state.declarations();
        for expected in ["x", "y", "f", "S", "C", "z"] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn test_declaration_tracker_dedupes() {
        let mut state = SessionState::new();
        state.record_cell(1, "let x = 1");
        state.record_cell(2, "let x = 2");
        assert_eq!(state.declarations().iter().filter(|n| *n == "x").count(), 1);
    }

    #[test]
    fn test_save_history_is_numbered() {
        let mut state = SessionState::new();
        let n = state.next_execution_count();
        state.record_cell(n, "print(1)");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.swift");
        state.save_history(&path).unwrap();
        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("// In[1]"));
        assert!(saved.contains("print(1)"));
    }
}
