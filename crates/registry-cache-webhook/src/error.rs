//! Webhook error type

use registry_cache_api::{DecodeError, ErrorList};

/// Error type for admission and mutation handling
///
/// Every variant ends up as a denial; the message is what the API server
/// shows to the user.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// The registry configuration violates field rules
    #[error("{0}")]
    Invalid(ErrorList),

    /// A provider config or status could not be decoded
    #[error("failed to decode {what}: {source}")]
    Decode {
        /// What was being decoded
        what: &'static str,
        /// Underlying decode failure
        source: DecodeError,
    },

    /// An object the webhook depends on does not exist
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Object kind
        kind: &'static str,
        /// `<namespace>/<name>` of the object
        name: String,
    },

    /// The extension has not published a status yet
    #[error("extension {extension:?} has no provider status yet")]
    MissingStatus {
        /// `<namespace>/<name>` of the extension
        extension: String,
    },

    /// A lookup did not finish in time
    #[error("timed out {0}")]
    Timeout(String),

    /// An error occurred while communicating with the Kubernetes API
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// An error occurred during JSON serialization/deserialization
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A host-platform object could not be read
    #[error(transparent)]
    Platform(#[from] registry_cache_common::Error),

    /// The HTTPS server failed
    #[error("webhook server error: {0}")]
    Server(String),

    /// Rendering node configuration failed
    #[error("failed to render {what}: {message}")]
    Render {
        /// What was being rendered
        what: &'static str,
        /// Failure detail
        message: String,
    },
}

impl From<ErrorList> for WebhookError {
    fn from(errs: ErrorList) -> Self {
        WebhookError::Invalid(errs)
    }
}

impl WebhookError {
    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            WebhookError::InvalidReview(_) => "invalid_review",
            WebhookError::Invalid(_) => "invalid",
            WebhookError::Decode { .. } => "decode",
            WebhookError::NotFound { .. } => "not_found",
            WebhookError::MissingStatus { .. } => "missing_status",
            WebhookError::Timeout(_) => "timeout",
            WebhookError::Kube(_) => "kube",
            WebhookError::Serialization(_) => "serialization",
            WebhookError::Platform(e) => e.kind(),
            WebhookError::Server(_) => "server",
            WebhookError::Render { .. } => "render",
        }
    }
}
