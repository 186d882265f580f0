use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{LengthBound, ProxyError};
use crate::tools::enums::AnalysisMethod;

static MARKUP_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<[^>]*>").unwrap_or_else(|e| panic!("markup regex must compile: {e}"))
});

/// Body of `POST /analyze`. Fields are optional here so that a missing field
/// surfaces as a validation error rather than a decode error.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AnalyzeRequest {
    pub dream_text: Option<String>,
    pub analysis_method: Option<String>,
    pub context: Option<String>,
}

/// An analysis request that passed validation, with sanitized inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedAnalysis {
    pub text: String,
    pub context: Option<String>,
    pub method: AnalysisMethod,
}

impl ValidatedAnalysis {
    pub fn prompt(&self) -> String {
        build_prompt(self.method, &self.text, self.context.as_deref())
    }
}

impl AnalyzeRequest {
    pub fn new(text: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            dream_text: Some(text.into()),
            analysis_method: Some(method.into()),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Check required fields, length bounds (inclusive, in chars, measured
    /// after sanitizing) and the method name.
    pub fn validate(&self, min_len: usize, max_len: usize) -> Result<ValidatedAnalysis, ProxyError> {
        let (Some(text), Some(method)) = (&self.dream_text, &self.analysis_method) else {
            return Err(ProxyError::Validation(
                "required fields missing: dream_text, analysis_method".to_string(),
            ));
        };

        let text = sanitize(text);
        let actual = text.chars().count();
        if actual < min_len {
            return Err(ProxyError::TextLength {
                bound: LengthBound::Min(min_len),
                actual,
            });
        }
        if actual > max_len {
            return Err(ProxyError::TextLength {
                bound: LengthBound::Max(max_len),
                actual,
            });
        }

        let method: AnalysisMethod = method.parse()?;
        let context = self
            .context
            .as_deref()
            .map(sanitize)
            .filter(|c| !c.is_empty());

        Ok(ValidatedAnalysis {
            text,
            context,
            method,
        })
    }
}

/// Strip markup tags and surrounding whitespace.
pub fn sanitize(input: &str) -> String {
    MARKUP_TAG.replace_all(input, "").trim().to_string()
}

/// Template, optional context clause, then the dream itself.
pub fn build_prompt(method: AnalysisMethod, text: &str, context: Option<&str>) -> String {
    let context_clause = context
        .filter(|c| !c.is_empty())
        .map(|c| format!("\nMood before sleep: {c}"))
        .unwrap_or_default();
    format!("{}{context_clause}\n\nDream: {text}", method.instruction())
}
