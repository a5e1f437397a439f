use thiserror::Error;

/// Unified error type for the prompt executor
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Malformed or cyclic graph, rejected before any node runs
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        node_id: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A node's executable raised
    #[error("Node {node_id} ({class_type}) failed: {message}")]
    NodeExecution {
        node_id: String,
        class_type: String,
        message: String,
    },

    /// The interrupt flag was observed mid-graph
    #[error("Processing interrupted{}", node_suffix(.node_id))]
    Interrupted { node_id: Option<String> },

    /// A job was completed twice; the queue and worker disagree
    #[error("Duplicate completion for prompt {prompt_id}")]
    DuplicateCompletion { prompt_id: String },

    #[error("Prompt {prompt_id} is already queued or running")]
    DuplicateJob { prompt_id: String },

    #[error("Unknown prompt: {prompt_id}")]
    UnknownJob { prompt_id: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn node_suffix(node_id: &Option<String>) -> String {
    match node_id {
        Some(id) => format!(" at node {}", id),
        None => String::new(),
    }
}

impl ExecutorError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            node_id: None,
            source: None,
        }
    }

    /// Create a validation error attributed to a node
    pub fn validation_node<S: Into<String>, N: Into<String>>(message: S, node_id: N) -> Self {
        Self::Validation {
            message: message.into(),
            node_id: Some(node_id.into()),
            source: None,
        }
    }

    pub fn node_execution<N, C, M>(node_id: N, class_type: C, message: M) -> Self
    where
        N: Into<String>,
        C: Into<String>,
        M: Into<String>,
    {
        Self::NodeExecution {
            node_id: node_id.into(),
            class_type: class_type.into(),
            message: message.into(),
        }
    }

    pub fn interrupted(node_id: Option<String>) -> Self {
        Self::Interrupted { node_id }
    }

    pub fn duplicate_completion<S: Into<String>>(prompt_id: S) -> Self {
        Self::DuplicateCompletion {
            prompt_id: prompt_id.into(),
        }
    }

    pub fn duplicate_job<S: Into<String>>(prompt_id: S) -> Self {
        Self::DuplicateJob {
            prompt_id: prompt_id.into(),
        }
    }

    pub fn unknown_job<S: Into<String>>(prompt_id: S) -> Self {
        Self::UnknownJob {
            prompt_id: prompt_id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error for a named field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The node an error is attributed to, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::Validation { node_id, .. } | Self::Interrupted { node_id } => node_id.as_deref(),
            Self::NodeExecution { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// Errors that mean the queue and the worker have lost track of each other.
    /// The worker cannot continue after one of these.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DuplicateCompletion { .. } | Self::Internal { .. })
    }

    /// Check if a caller may retry the same request
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NodeExecution { .. } | Self::Interrupted { .. } | Self::Io { .. } => true,
            Self::DuplicateJob { .. } => true,
            Self::Validation { .. } | Self::Configuration { .. } => false,
            _ => false,
        }
    }

    /// Get error category for status messages and logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::NodeExecution { .. } => "node_execution",
            Self::Interrupted { .. } => "interrupted",
            Self::DuplicateCompletion { .. } => "duplicate_completion",
            Self::DuplicateJob { .. } => "duplicate_job",
            Self::UnknownJob { .. } => "unknown_job",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ExecutorError>;

impl From<std::io::Error> for ExecutorError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for ExecutorError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for ExecutorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}
