use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified adapter failure, always tagged with the adapter that raised it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Retryable within the adapter's own retry budget
    #[error("{adapter}: transient network error: {message}")]
    TransientNetwork {
        adapter: String,
        message: String,
        status: Option<u16>,
    },
    #[error("{adapter}: parse error: {message}")]
    Parse { adapter: String, message: String },
    #[error("{adapter}: cancelled while waiting for a request slot")]
    WaitCancelled { adapter: String },
}

/// Discriminant without payload, for counters and JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorKind {
    TransientNetwork,
    Parse,
    WaitCancelled,
}

impl SourceError {
    pub fn transient(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            adapter: adapter.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn http_status(adapter: impl Into<String>, status: u16) -> Self {
        Self::TransientNetwork {
            adapter: adapter.into(),
            message: format!("HTTP {status}"),
            status: Some(status),
        }
    }

    pub fn parse(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            adapter: adapter.into(),
            message: message.into(),
        }
    }

    pub fn cancelled(adapter: impl Into<String>) -> Self {
        Self::WaitCancelled {
            adapter: adapter.into(),
        }
    }

    pub fn adapter(&self) -> &str {
        match self {
            Self::TransientNetwork { adapter, .. }
            | Self::Parse { adapter, .. }
            | Self::WaitCancelled { adapter } => adapter,
        }
    }

    pub fn kind(&self) -> SourceErrorKind {
        match self {
            Self::TransientNetwork { .. } => SourceErrorKind::TransientNetwork,
            Self::Parse { .. } => SourceErrorKind::Parse,
            Self::WaitCancelled { .. } => SourceErrorKind::WaitCancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::WaitCancelled { .. })
    }
}

/// Parser failure before it is tagged with an adapter name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ParseFailure(pub String);

impl ParseFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn into_source_error(self, adapter: &str) -> SourceError {
        SourceError::parse(adapter, self.0)
    }
}
