//! Retrieval error types
//!
//! Retrieval failures never abort a request: the engine degrades to an
//! empty pack and reports `missing_evidence`. The categories here exist so
//! callers can log the degradation precisely.

use thiserror::Error;

/// Retrieval error with category and context.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("index error: {message}")]
    Index {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("vector backend error: {message}")]
    Vector {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("embedding error: {message}")]
    Embedding {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl RetrievalError {
    pub fn index(message: impl Into<String>) -> Self {
        Self::Index {
            message: message.into(),
            source: None,
        }
    }

    pub fn index_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Index {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn vector(message: impl Into<String>) -> Self {
        Self::Vector {
            message: message.into(),
            source: None,
        }
    }

    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding {
            message: message.into(),
            source: None,
        }
    }
}

/// Result type for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;
