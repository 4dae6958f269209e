//! Error types for perception.
//!
//! All errors in perception are strongly typed using thiserror.
//! Configuration problems are accumulated rather than raised; see
//! [`crate::config::ParseOutcome`].

use std::path::PathBuf;

use thiserror::Error;

use crate::config::GeneratorCategory;
use crate::graph::ResourceType;

/// Recoverable problems found in one generator definition.
///
/// Each error only disqualifies the entry (or parameter) it was raised for.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{category} definition #{index} has no name")]
    MissingName {
        category: GeneratorCategory,
        index: usize,
    },

    #[error("{category} definition name '{name}' is already used")]
    DuplicateName {
        category: GeneratorCategory,
        name: String,
    },

    #[error("{category} definition #{index} has no type")]
    MissingType {
        category: GeneratorCategory,
        index: usize,
    },

    #[error("primitive definition #{index} has an invalid runtime: {reason}")]
    InvalidRuntime {
        index: usize,
        reason: String,
    },

    #[error("{category} definition #{index} has a parameter without type")]
    MissingParamType {
        category: GeneratorCategory,
        index: usize,
    },

    #[error("{category} definition #{index} has malformed parameters: {reason}")]
    InvalidParams {
        category: GeneratorCategory,
        index: usize,
        reason: String,
    },

    #[error("configuration document is structurally invalid: {reason}")]
    InvalidStructure {
        reason: String,
    },
}

impl ConfigError {
    /// Returns true if the error rejects the whole document.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(self, Self::InvalidStructure { .. })
    }
}

/// Fatal problems with the configuration source itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FileError {
    #[error("configuration file not found: {path}")]
    NotFound {
        path: PathBuf,
    },

    #[error("configuration file {path} is unreadable: {message}")]
    Unreadable {
        path: PathBuf,
        message: String,
    },
}

/// Errors raised while instantiating generators from valid definitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("generator '{name}' has unknown {category} type '{type_name}'")]
    UnknownType {
        name: String,
        category: GeneratorCategory,
        type_name: String,
    },

    #[error("generator '{name}' parameter #{position} is invalid: {reason}")]
    InvalidParam {
        name: String,
        position: usize,
        reason: String,
    },

    #[error("generator '{name}' has an invalid refresh interval: {reason}")]
    InvalidInterval {
        name: String,
        reason: String,
    },

    #[error("pattern '{pattern}' is invalid: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: String,
    },
}

/// A resource-to-event mapping that failed.
///
/// Mapping failures never stop a generator; they are logged and counted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("generator '{generator}' failed on {resource_type} '{resource}': {reason}")]
    Failed {
        generator: String,
        resource: String,
        resource_type: ResourceType,
        reason: String,
    },

    #[error("generator '{generator}' panicked on {resource_type} '{resource}': {message}")]
    Panicked {
        generator: String,
        resource: String,
        resource_type: ResourceType,
        message: String,
    },
}

/// Errors that occur while the pipeline is running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Backlog on {target}: delivery blocked for {waited_ms}ms")]
    Backlog {
        target: String,
        waited_ms: u64,
    },

    #[error("Failed to spawn worker '{name}': {message}")]
    Spawn {
        name: String,
        message: String,
    },
}

/// Top-level error type for perception.
#[derive(Debug, Error)]
pub enum PerceptionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl PerceptionError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a file error.
    #[must_use]
    pub const fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::Backlog { .. }
            ),
            _ => false,
        }
    }
}

/// Result type alias for perception operations.
pub type PerceptionResult<T> = Result<T, PerceptionError>;
