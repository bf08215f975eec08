use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// DIAGNOSTIC CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_SYNTAX: &str = "Z-ERR-SYNTAX-001";
pub const ERR_UNSUPPORTED: &str = "Z-ERR-SYNTAX-002";
pub const ERR_ORPHAN_CONDITIONAL: &str = "Z-ERR-COND-001";
pub const ERR_INVALID_FOR: &str = "Z-ERR-FOR-001";
pub const ERR_TEMPLATE: &str = "Z-ERR-TEMPLATE-001";
pub const ERR_MISSING_SCOPE: &str = "Z-ERR-SCOPE-003";
pub const ERR_INVALID_DIRECTIVE: &str = "Z-ERR-DIRECTIVE-001";
pub const ERR_CONFIG: &str = "Z-ERR-CONFIG-001";

pub const ERR_EVALUATION: &str = "Z-ERR-EVAL-001";
pub const ERR_TEARDOWN: &str = "Z-ERR-TEARDOWN-001";
pub const ERR_PASS_LIMIT: &str = "Z-ERR-SCHED-001";
pub const WARN_DUPLICATE_KEY: &str = "Z-WARN-DUPLICATE-KEY";
pub const WARN_CIRCULAR_COMPUTED: &str = "Z-WARN-CIRCULAR-COMPUTED";
pub const WARN_CIRCULAR_FUNCTION: &str = "Z-WARN-CIRCULAR-FUNCTION";
pub const WARN_UNKNOWN_DIRECTIVE: &str = "Z-WARN-UNKNOWN-DIRECTIVE";

/// Failures raised while building the render tree. These abort construction of
/// the subtree they occur in.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("invalid expression syntax in `{expression}`: {message}")]
    Syntax { expression: String, message: String },

    #[error("unsupported construct `{construct}` in `{expression}`")]
    Unsupported { expression: String, construct: String },

    #[error("`{directive}` has no preceding v-if or v-else-if sibling")]
    OrphanConditional { directive: String },

    #[error("invalid v-for expression `{0}`")]
    InvalidFor(String),

    #[error("failed to parse template: {0}")]
    Template(String),

    #[error("no binding scope available for <{0}>")]
    MissingScope(String),

    #[error("invalid directive `{name}`: {reason}")]
    InvalidDirective { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CompileError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Syntax { .. } => ERR_SYNTAX,
            Self::Unsupported { .. } => ERR_UNSUPPORTED,
            Self::OrphanConditional { .. } => ERR_ORPHAN_CONDITIONAL,
            Self::InvalidFor(_) => ERR_INVALID_FOR,
            Self::Template(_) => ERR_TEMPLATE,
            Self::MissingScope(_) => ERR_MISSING_SCOPE,
            Self::InvalidDirective { .. } => ERR_INVALID_DIRECTIVE,
            Self::Config(_) => ERR_CONFIG,
        }
    }

    pub(crate) fn unsupported(expression: &str, construct: impl Into<String>) -> Self {
        Self::Unsupported {
            expression: expression.to_string(),
            construct: construct.into(),
        }
    }
}

/// Failures raised while evaluating an expression during a pass. Caught per
/// unit of work and reported as diagnostics.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("type error: {0}")]
    Type(String),

    #[error("`{0}` is not a function")]
    NotCallable(String),

    #[error("invalid assignment target: {0}")]
    InvalidAssignment(String),

    #[error("{0}")]
    Custom(String),
}

pub type EvalResult<T> = Result<T, EvalError>;
