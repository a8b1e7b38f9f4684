//! Engine error taxonomy
//!
//! Tool-level failures are recovered locally and recorded as issues;
//! cross-cutting failures degrade functionality and raise alerts. Only
//! orchestrator bugs surface as a terminal `error` event. The categories
//! here drive that routing plus the status class reported by the API
//! surface.

use thiserror::Error;

/// Error category for structured logging and status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input shape, unknown domain (400-class).
    Validation,
    /// Disallowed tool/table/egress (403-class).
    Policy,
    /// Upstream tool failure; non-fatal for the request.
    Tool,
    /// DB locked beyond retry, embedding backend unreachable.
    Resource,
    /// Unexpected orchestrator bug.
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Policy => "POLICY_ERROR",
            Self::Tool => "TOOL_ERROR",
            Self::Resource => "RESOURCE_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

/// Engine error with category and context.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("policy error: {message}")]
    Policy { message: String },

    #[error("tool error: {message}")]
    Tool {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("resource error: {message}")]
    Resource {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Policy { .. } => ErrorCategory::Policy,
            Self::Tool { .. } => ErrorCategory::Tool,
            Self::Resource { .. } => ErrorCategory::Resource,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::Policy {
            message: message.into(),
        }
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::Tool {
            message: message.into(),
            source: None,
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
            source: None,
        }
    }

    pub fn resource_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Resource {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Opaque wire code for terminal error events; internal detail never
    /// leaves the process.
    pub fn wire_code(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Validation => "bad_request",
            ErrorCategory::Policy => "policy_denied",
            ErrorCategory::Tool => "tool_failed",
            ErrorCategory::Resource => "degraded",
            ErrorCategory::Internal => "server_error",
        }
    }

    /// Message safe to emit to clients.
    pub fn safe_message(&self) -> String {
        match self {
            Self::Validation { message } | Self::Policy { message } => message.clone(),
            Self::Tool { message, .. } => message.clone(),
            Self::Resource { .. } => "temporarily degraded".to_string(),
            Self::Internal { .. } => "internal error".to_string(),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::resource_with_source("sqlite", e)
    }
}

impl From<r2d2::Error> for EngineError {
    fn from(e: r2d2::Error) -> Self {
        Self::resource_with_source("connection pool", e)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_errors_are_opaque_on_the_wire() {
        let err = EngineError::internal("refinement loop index out of bounds");
        assert_eq!(err.wire_code(), "server_error");
        assert_eq!(err.safe_message(), "internal error");
    }

    #[test]
    fn test_validation_errors_pass_message_through() {
        let err = EngineError::validation("question must be non-empty");
        assert_eq!(err.wire_code(), "bad_request");
        assert!(err.safe_message().contains("non-empty"));
    }
}
