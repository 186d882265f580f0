use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ProxyError;

/// JSON envelope shared by both proxy endpoints.
///
/// Exactly one of `result` (analysis), `text` (transcription) or `error` is
/// present.
#[derive(Debug, Serialize)]
pub struct ProxyResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `YYYY-MM-DD HH:MM:SS`, UTC.
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

fn serialize_timestamp<S: serde::Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(&ts.format("%Y-%m-%d %H:%M:%S"))
}

impl ProxyResponse {
    fn base(success: bool) -> Self {
        Self {
            success,
            result: None,
            text: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn analysis(result: String) -> Self {
        Self {
            result: Some(result),
            ..Self::base(true)
        }
    }

    pub fn transcript(text: String) -> Self {
        Self {
            text: Some(text),
            ..Self::base(true)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::base(false)
        }
    }

    pub fn from_error(e: &ProxyError) -> Self {
        Self::error(e.user_message())
    }
}
