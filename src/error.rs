//! Error types shared by the backends and the chat controller.

use thiserror::Error;

/// Failure reported by an inference backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend could not be reached or the connection dropped.
    #[error("failed to reach {backend}: {source}")]
    Connection {
        backend: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The backend answered with a non-success HTTP status.
    #[error("{backend} request failed with status {status}: {body}")]
    Status {
        backend: &'static str,
        status: u16,
        body: String,
    },

    /// The backend sent a payload we could not decode.
    #[error("invalid response from {backend}: {message}")]
    Decode {
        backend: &'static str,
        message: String,
    },

    /// The backend reported an error inside an otherwise healthy response.
    #[error("{0}")]
    Remote(String),

    /// Missing credentials or other local misconfiguration.
    #[error("{0}")]
    Config(String),
}

impl BackendError {
    pub fn decode(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Decode {
            backend,
            message: message.into(),
        }
    }
}

/// Which stage of the chat lifecycle a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatErrorKind {
    /// Listing models failed.
    ModelDiscovery,
    /// The target model is missing or not downloaded.
    ModelUnavailable,
    /// The backend refused or failed to load the model.
    ModelLoad,
    /// Streaming failed mid-flight.
    Generation,
}

impl ChatErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatErrorKind::ModelDiscovery => "model_discovery",
            ChatErrorKind::ModelUnavailable => "model_unavailable",
            ChatErrorKind::ModelLoad => "model_load",
            ChatErrorKind::Generation => "generation",
        }
    }

    /// Whether running initialization again could help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ChatErrorKind::Generation)
    }
}

/// Error returned by controller operations. The same failure is also written
/// to the transcript as a human-readable message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ChatError {
    pub kind: ChatErrorKind,
    pub message: String,
}

impl ChatError {
    pub fn new(kind: ChatErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
