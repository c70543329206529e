//! Error types for hubble-ctl

use thiserror::Error;

use crate::status::InstallationStatus;
use crate::values::redact::redact_text;

/// Main error type for Hubble lifecycle operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Malformed or unreadable configuration input
    #[error("configuration error: {0}")]
    Config(String),

    /// CA generation or parse failure
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Cluster mutation or chart render failure
    #[error("install error: {0}")]
    Install(String),

    /// Requested object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Components did not become ready before the deadline
    #[error("timed out waiting for Hubble to become ready (last status: {status})")]
    Timeout {
        /// Last observed status
        status: InstallationStatus,
    },

    /// A component reported a failed state while waiting
    #[error("component {component} failed: {reason} (last status: {status})")]
    ComponentFailed {
        /// Name of the failed component
        component: String,
        /// Reason reported by the component
        reason: String,
        /// Last observed status
        status: InstallationStatus,
    },

    /// Tunnel dial or listen failure
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Operation was cancelled before it completed
    #[error("operation cancelled")]
    Cancelled,

    /// Local IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error. Any key material in the message is redacted.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(redact_text(&msg.into()))
    }

    /// Create a certificate error. Any key material in the message is redacted.
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(redact_text(&msg.into()))
    }

    /// Create an install error. Any key material in the message is redacted.
    pub fn install(msg: impl Into<String>) -> Self {
        Self::Install(redact_text(&msg.into()))
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a tunnel error
    pub fn tunnel(msg: impl Into<String>) -> Self {
        Self::Tunnel(msg.into())
    }

    /// Whether this error means the object is absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }
}
