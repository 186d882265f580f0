use thiserror::Error;

use crate::store::Entry;

/// Errors raised by the local record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("entry not found: {0}")]
    NotFound(i64),

    #[error("analysis '{method}' not found on entry {id}")]
    AnalysisNotFound { id: i64, method: String },

    #[error("invalid import document: {0}")]
    InvalidDocument(String),

    #[error("persistence area unavailable")]
    Unavailable,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Message safe to show in a notification.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::NotFound(_) => "entry not found".to_string(),
            Self::AnalysisNotFound { method, .. } => format!("analysis not found: {method}"),
            Self::InvalidDocument(msg) => format!("invalid data format: {msg}"),
            Self::Unavailable => "local storage is not available".to_string(),
            Self::Io(_) | Self::Serialization(_) => "failed to access local storage".to_string(),
        }
    }
}

/// Which length bound a text violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthBound {
    Min(usize),
    Max(usize),
}

/// Errors on the proxy call path. Every variant is terminal for its request.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("text length {actual} violates {bound:?}")]
    TextLength { bound: LengthBound, actual: usize },

    #[error("invalid analysis method: {0}")]
    InvalidMethod(String),

    #[error("invalid audio upload: {0}")]
    InvalidAudio(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// HTTP status the proxy answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_)
            | Self::TextLength { .. }
            | Self::InvalidMethod(_)
            | Self::InvalidAudio(_) => 400,
            Self::RateLimited => 429,
            Self::Upstream { .. }
            | Self::MalformedResponse(_)
            | Self::Transport(_)
            | Self::Config(_) => 500,
        }
    }

    /// True for errors the caller may fix by retrying later by hand.
    /// Nothing in this crate retries automatically.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Upstream { .. } | Self::Transport(_)
        )
    }

    /// Sanitized message for the response envelope. Does not leak the
    /// credential or internal URLs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::TextLength {
                bound: LengthBound::Min(min),
                ..
            } => format!("text too short (minimum {min} characters)"),
            Self::TextLength {
                bound: LengthBound::Max(max),
                ..
            } => format!("text too long (maximum {max} characters)"),
            Self::InvalidMethod(method) => format!("invalid analysis method: {method}"),
            Self::InvalidAudio(msg) => format!("invalid audio upload: {msg}"),
            Self::RateLimited => "rate limit reached, please try again later".to_string(),
            Self::Upstream { status, message } => {
                format!("upstream API error ({status}): {message}")
            }
            Self::MalformedResponse(_) => "invalid response from upstream API".to_string(),
            Self::Transport(msg) => format!("request to upstream API failed: {msg}"),
            Self::Config(_) => "API key not configured".to_string(),
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Transport("timed out".to_string())
        } else if e.is_connect() {
            Self::Transport("connection failed".to_string())
        } else {
            Self::Transport(e.without_url().to_string())
        }
    }
}

/// Errors surfaced by the client-side journal service.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("analysis '{method}' already exists for entry {id}")]
    AlreadyAnalyzed { id: i64, method: String },

    /// Transcription failed. `saved` is the draft queued during the capture,
    /// if it was persisted unchanged.
    #[error("transcription failed: {source}")]
    Transcription {
        source: ProxyError,
        saved: Option<Box<Entry>>,
    },
}

impl JournalError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Store(e) => e.user_message(),
            Self::Proxy(e) => e.user_message(),
            Self::AlreadyAnalyzed { method, .. } => format!("{method} analysis already exists"),
            Self::Transcription { source, saved } => match saved {
                Some(_) => format!("{} (your dream was saved)", source.user_message()),
                None => source.user_message(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(ProxyError::Validation("x".into()).status_code(), 400);
        assert_eq!(ProxyError::InvalidMethod("x".into()).status_code(), 400);
        assert_eq!(ProxyError::RateLimited.status_code(), 429);
        assert_eq!(ProxyError::Config("x".into()).status_code(), 500);
        assert_eq!(
            ProxyError::Upstream {
                status: 503,
                message: "down".into()
            }
            .status_code(),
            500
        );
    }

    #[test]
    fn length_message_names_the_bound() {
        let e = ProxyError::TextLength {
            bound: LengthBound::Min(10),
            actual: 5,
        };
        assert!(e.user_message().contains("minimum 10"));
        let e = ProxyError::TextLength {
            bound: LengthBound::Max(8000),
            actual: 9000,
        };
        assert!(e.user_message().contains("maximum 8000"));
    }

    #[test]
    fn config_message_hides_details() {
        let e = ProxyError::Config("OPENAI_API_KEY missing from /etc/secret".into());
        assert!(!e.user_message().contains("/etc"));
    }
}
