// floodroute/src/error.rs
//
// Error taxonomy for the core. Routing outcomes (impassable, no_safe_route)
// are NOT errors — they are RouteResult::status values (see router.rs);
// route() always returns Ok(RouteResult).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("busy: {0}")]
    Busy(String),

    #[error("upstream failure: {source} — {reason}")]
    UpstreamFailure { source: String, reason: String },

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// The taxonomy kind string, as used in the logical `{kind, message, details}`
    /// error shape returned by the Query Surface (spec §7).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::Busy(_) => "busy",
            Self::UpstreamFailure { .. } => "upstream_failure",
            Self::Fatal(_) => "fatal",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Typed error shape handed back across the Query Surface boundary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryError {
    pub kind: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl From<&CoreError> for QueryError {
    fn from(e: &CoreError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            details: None,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
