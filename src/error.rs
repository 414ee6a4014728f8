//! Error types for the dependency graph engine

use thiserror::Error;

/// Result type alias using DepGraphError
pub type Result<T> = std::result::Result<T, DepGraphError>;

/// Errors that can occur while compiling schemas or evaluating the graph
#[derive(Debug, Error)]
pub enum DepGraphError {
    /// Parse failure on a user-supplied key or pattern
    #[error("invalid expression: {expression}")]
    InvalidExpression {
        /// The text that failed to parse
        expression: String,
    },

    /// Variable coverage violated, duplicate variable, or other local schema defect
    #[error("invalid schema for output '{schema_output}': {message}")]
    InvalidSchema {
        /// The output pattern of the offending schema
        schema_output: String,
        /// Human-readable description of the defect
        message: String,
    },

    /// Two output patterns can match one concrete key
    #[error("schema overlap between '{}' and '{}'", patterns.0, patterns.1)]
    SchemaOverlap {
        /// The two overlapping output patterns
        patterns: (String, String),
    },

    /// Pattern-level cycle, including a self-cycle via specialization
    #[error("schema cycle: {}", cycle.join(" -> "))]
    SchemaCycle {
        /// Output patterns forming the cycle, in order
        cycle: Vec<String>,
    },

    /// Concrete key has no matching schema (head/arity/literal/repeated-var mismatch)
    #[error("no schema matches node '{key}'")]
    InvalidNode {
        /// The offending key
        key: String,
    },

    /// Key contains free variables where a concrete key is required
    #[error("node key is not concrete: '{key}'")]
    NonConcreteNode {
        /// The offending key
        key: String,
    },

    /// `set` targets a non-source node
    #[error("cannot set non-source node '{key}'")]
    InvalidSet {
        /// The offending key
        key: String,
    },

    /// Freshness `up-to-date` but value absent (store corruption)
    #[error("node '{key}' is up-to-date but has no stored value")]
    MissingValue {
        /// The offending key
        key: String,
    },

    /// Computor returned `Unchanged` at first materialization
    #[error("computor for '{key}' returned Unchanged on first materialization")]
    InvalidComputorResult {
        /// The offending key
        key: String,
    },

    /// Underlying key-value store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DepGraphError {
    /// Build a storage error from any displayable backend failure
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}
