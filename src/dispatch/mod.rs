pub mod http;

use async_trait::async_trait;

use crate::error::ProxyError;
use crate::tools::transcribe::AudioUpload;

/// Internal request type for text generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Sent as a separate `system` message.
    pub system_prompt: String,
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
    /// Sampling temperature (0 = deterministic, 1 = creative).
    pub temperature: f64,
}

/// The external model API. One attempt per call; callers never retry.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Returns the generated text.
    async fn generate(&self, req: &GenerationRequest) -> Result<String, ProxyError>;

    /// Returns the transcript.
    async fn transcribe(&self, audio: AudioUpload) -> Result<String, ProxyError>;
}
