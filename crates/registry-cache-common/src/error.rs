//! Error types for the registry cache extension
//!
//! Errors carry enough context (extension, step, field) to be useful both in
//! logs and in the Extension's `status.lastError`.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Error code reported to the host platform for configuration problems
pub const ERR_CONFIGURATION_PROBLEM: &str = "ERR_CONFIGURATION_PROBLEM";

/// Main error type for registry cache operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Provider configuration failed validation
    #[error("validation error for {extension}: {message}")]
    Validation {
        /// Extension whose configuration is invalid
        extension: String,
        /// Aggregated description of what's invalid
        message: String,
        /// The first invalid field path, if known
        field: Option<String>,
    },

    /// Provider configuration or a referenced resource could not be decoded
    #[error("decode error: {message}")]
    Decode {
        /// Description of what failed
        message: String,
    },

    /// Shoot-side objects are not (yet) in the expected state
    #[error("not ready: {message}")]
    NotReady {
        /// Description of what is missing
        message: String,
    },

    /// A bounded wait elapsed
    #[error("timed out waiting for {operation}: {message}")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// Last observed state
        message: String,
    },

    /// Certificate generation or parsing failed
    #[error("certificate error: {message}")]
    Certificate {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A reconcile step failed
    #[error("failed to {step}: {source}")]
    Step {
        /// Human readable step, e.g. "deploy the registry caches component"
        step: String,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "actuator", "webhook")
        context: String,
    },
}

impl Error {
    /// Create a validation error without extension context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            extension: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for an extension, pointing at a field
    pub fn validation_for_field(
        extension: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            extension: extension.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a validation error for an extension
    pub fn validation_for(extension: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            extension: extension.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    /// Create a not-ready error
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady {
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a certificate error
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error without context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Wrap this error with the reconcile step that produced it
    pub fn in_step(self, step: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through step wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, decode and serialization errors need a configuration fix.
    /// Kubernetes 4xx errors are permanent except conflicts and throttling.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Validation { .. } => false,
            Error::Decode { .. } => false,
            Error::Serialization { .. } => false,
            Error::NotReady { .. } => true,
            Error::Timeout { .. } => true,
            Error::Certificate { .. } => true,
            Error::Step { source, .. } => source.is_retryable(),
            Error::Internal { .. } => true,
        }
    }

    /// Error codes reported alongside `status.lastError`
    pub fn codes(&self) -> Vec<String> {
        match self.root() {
            Error::Validation { .. } | Error::Decode { .. } => {
                vec![ERR_CONFIGURATION_PROBLEM.to_string()]
            }
            _ => Vec::new(),
        }
    }

    /// Short classification used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Error::Kube { .. } => "kube",
            Error::Validation { .. } => "validation",
            Error::Decode { .. } => "decode",
            Error::NotReady { .. } => "not_ready",
            Error::Timeout { .. } => "timeout",
            Error::Certificate { .. } => "certificate",
            Error::Serialization { .. } => "serialization",
            Error::Step { .. } | Error::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
