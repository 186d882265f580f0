use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use crate::error::ProxyError;
use crate::journal::AnalysisBackend;
use crate::tools::analyze::AnalyzeRequest;
use crate::tools::enums::AnalysisMethod;
use crate::tools::transcribe::AudioUpload;

const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Talks to a running proxy over its HTTP surface.
pub struct ProxyClient {
    client: Client,
    base_url: String,
}

/// Mirror of the proxy's response envelope.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    result: Option<String>,
    text: Option<String>,
    error: Option<String>,
}

impl ProxyClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            // upstream transcription may take up to a minute behind the proxy
            .timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn envelope(response: reqwest::Response) -> Result<Envelope, ProxyError> {
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| {
            ProxyError::Transport(format!("failed to read response body: {}", e.without_url()))
        })?;
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(ProxyError::MalformedResponse(format!(
                "response too large: {} bytes",
                bytes.len()
            )));
        }
        let parsed = serde_json::from_slice::<Envelope>(&bytes);

        if !status.is_success() {
            let message = parsed
                .ok()
                .and_then(|e| e.error)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            return Err(match status.as_u16() {
                400 => ProxyError::Validation(message),
                429 => ProxyError::RateLimited,
                code => ProxyError::Upstream {
                    status: code,
                    message,
                },
            });
        }

        let envelope = parsed
            .map_err(|e| ProxyError::MalformedResponse(format!("failed to parse response: {e}")))?;
        if !envelope.success {
            return Err(ProxyError::MalformedResponse(
                envelope
                    .error
                    .unwrap_or_else(|| "request reported failure".to_string()),
            ));
        }
        Ok(envelope)
    }
}

#[async_trait]
impl AnalysisBackend for ProxyClient {
    async fn analyze(
        &self,
        text: &str,
        context: Option<&str>,
        method: AnalysisMethod,
    ) -> Result<String, ProxyError> {
        let mut body = AnalyzeRequest::new(text, method.as_str());
        body.context = context.map(str::to_string);

        let response = self
            .client
            .post(format!("{}/analyze", self.base_url))
            .json(&body)
            .send()
            .await?;

        Self::envelope(response)
            .await?
            .result
            .ok_or_else(|| ProxyError::MalformedResponse("missing result".to_string()))
    }

    async fn transcribe(&self, audio: AudioUpload) -> Result<String, ProxyError> {
        let part = Part::bytes(audio.bytes)
            .file_name(audio.file_name)
            .mime_str(&audio.content_type)
            .map_err(|_| {
                ProxyError::InvalidAudio(format!("unusable content type: {}", audio.content_type))
            })?;
        let form = Form::new().part("audio", part);

        let response = self
            .client
            .post(format!("{}/transcribe", self.base_url))
            .multipart(form)
            .send()
            .await?;

        Self::envelope(response)
            .await?
            .text
            .ok_or_else(|| ProxyError::MalformedResponse("missing text".to_string()))
    }
}
