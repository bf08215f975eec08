//! Leveled diagnostic sink.
//!
//! Every warning or error the engine swallows (evaluation failures, duplicate
//! list keys, circular computed properties, teardown failures) is forwarded to
//! `tracing` and kept in an in-memory log so the embedding application can
//! inspect what happened during a pass. Logging never affects control flow.

use std::cell::RefCell;

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: Level,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: RefCell<Vec<Diagnostic>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debug(&self, message: impl Into<String>) {
        tracing::debug!("{}", message.into());
    }

    pub fn info(&self, code: &'static str, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(code, "{}", message);
        self.push(Level::Info, code, message);
    }

    pub fn warn(&self, code: &'static str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(code, "{}", message);
        self.push(Level::Warn, code, message);
    }

    pub fn error(&self, code: &'static str, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(code, "{}", message);
        self.push(Level::Error, code, message);
    }

    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.borrow().clone()
    }

    pub fn count(&self, code: &str) -> usize {
        self.entries
            .borrow()
            .iter()
            .filter(|d| d.code == code)
            .count()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    fn push(&self, level: Level, code: &'static str, message: String) {
        self.entries.borrow_mut().push(Diagnostic {
            level,
            code,
            message,
        });
    }
}

/// Install a fmt subscriber. `RUST_LOG` wins over `default_filter` when set.
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_by_code() {
        let diagnostics = Diagnostics::new();
        diagnostics.warn("Z-WARN-A", "first");
        diagnostics.error("Z-ERR-B", "second");
        diagnostics.warn("Z-WARN-A", "third");
        diagnostics.debug("not recorded");

        assert_eq!(diagnostics.count("Z-WARN-A"), 2);
        assert_eq!(diagnostics.count("Z-ERR-B"), 1);
        assert_eq!(diagnostics.entries()[1].level, Level::Error);

        diagnostics.clear();
        assert!(diagnostics.entries().is_empty());
    }
}
