use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;

use crate::config::{GenerationConfig, TranscriptionConfig};
use crate::dispatch::{GenerationRequest, Upstream};
use crate::error::ProxyError;
use crate::tools::transcribe::AudioUpload;

const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// reqwest-backed client for the chat-completion and transcription endpoints.
pub struct HttpUpstream {
    client: Client,
    api_key: String,
    generation: GenerationConfig,
    transcription: TranscriptionConfig,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Transcript {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl HttpUpstream {
    pub fn new(
        api_key: impl Into<String>,
        generation: GenerationConfig,
        transcription: TranscriptionConfig,
    ) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            generation,
            transcription,
        })
    }

    /// Map status, enforce the size cap, and hand back the raw body.
    async fn read_body(response: Response) -> Result<bytes::Bytes, ProxyError> {
        let status = response.status();

        // Cap error body reads to MAX_RESPONSE_BYTES
        if !status.is_success() {
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(MAX_RESPONSE_BYTES)];
            return Err(ProxyError::Upstream {
                status: status.as_u16(),
                message: upstream_message(truncated, status),
            });
        }

        let bytes = response.bytes().await.map_err(|e| {
            ProxyError::Transport(format!("failed to read response body: {}", e.without_url()))
        })?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(ProxyError::MalformedResponse(format!(
                "response too large: {} bytes (max {})",
                bytes.len(),
                MAX_RESPONSE_BYTES
            )));
        }
        Ok(bytes)
    }
}

/// Prefer the upstream's own `error.message`, else the status reason.
fn upstream_message(body: &[u8], status: reqwest::StatusCode) -> String {
    serde_json::from_slice::<ErrorEnvelope>(body)
        .ok()
        .and_then(|e| e.error.message)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        })
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn generate(&self, req: &GenerationRequest) -> Result<String, ProxyError> {
        let start = Instant::now();

        let body = serde_json::json!({
            "model": req.model,
            "messages": [
                {"role": "system", "content": req.system_prompt},
                {"role": "user", "content": req.prompt}
            ],
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });

        let response = self
            .client
            .post(&self.generation.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(self.generation.timeout)
            .json(&body)
            .send()
            .await?;

        let bytes = Self::read_body(response).await?;
        let completion: ChatCompletion = serde_json::from_slice(&bytes)
            .map_err(|e| ProxyError::MalformedResponse(format!("failed to parse response: {e}")))?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                ProxyError::MalformedResponse("empty choices or null content".to_string())
            })?;

        tracing::debug!(
            model = %req.model,
            latency_ms = start.elapsed().as_millis() as u64,
            "generation completed"
        );
        Ok(text)
    }

    async fn transcribe(&self, audio: AudioUpload) -> Result<String, ProxyError> {
        let start = Instant::now();
        let size = audio.bytes.len();

        let part = Part::bytes(audio.bytes)
            .file_name(audio.file_name)
            .mime_str(&audio.content_type)
            .map_err(|_| {
                ProxyError::InvalidAudio(format!("unusable content type: {}", audio.content_type))
            })?;
        let form = Form::new()
            .part("file", part)
            .text("model", self.transcription.model.clone())
            .text("language", self.transcription.language.clone())
            .text("response_format", "json");

        let response = self
            .client
            .post(&self.transcription.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(self.transcription.timeout)
            .multipart(form)
            .send()
            .await?;

        let bytes = Self::read_body(response).await?;
        let transcript: Transcript = serde_json::from_slice(&bytes)
            .map_err(|e| ProxyError::MalformedResponse(format!("failed to parse response: {e}")))?;
        let text = transcript
            .text
            .ok_or_else(|| ProxyError::MalformedResponse("missing transcript text".to_string()))?;

        tracing::debug!(
            bytes = size,
            latency_ms = start.elapsed().as_millis() as u64,
            "transcription completed"
        );
        Ok(text)
    }
}
