use serde::{Deserialize, Serialize};

use crate::error::CompileError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delimiters {
    pub open: String,
    pub close: String,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            open: "{{".to_string(),
            close: "}}".to_string(),
        }
    }
}

/// Application-level options. Every field has a default so a partial JSON
/// document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Interpolation markers for text nodes.
    pub delimiters: Delimiters,
    /// Attribute prefix for named directives (`v-if`, `v-for`, ...).
    pub directive_prefix: String,
    /// Upper bound on consecutive passes drained by one `run_microtasks` call.
    pub max_passes_per_flush: usize,
    /// Log prefixed attributes no directive parser claims.
    pub warn_on_unknown_directive: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            delimiters: Delimiters::default(),
            directive_prefix: "v-".to_string(),
            max_passes_per_flush: 100,
            warn_on_unknown_directive: true,
        }
    }
}

impl AppConfig {
    pub fn from_json(json: &str) -> Result<Self, CompileError> {
        serde_json::from_str(json).map_err(|e| CompileError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = AppConfig::from_json(r#"{ "delimiters": { "open": "[[", "close": "]]" } }"#)
            .unwrap();
        assert_eq!(config.delimiters.open, "[[");
        assert_eq!(config.directive_prefix, "v-");
        assert_eq!(config.max_passes_per_flush, 100);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(AppConfig::from_json(r#"{ "maxPassesPerFlush": "many" }"#).is_err());
    }
}
