//! Rate-limited request flow from a validated client request to one upstream
//! call. Every failure is terminal for its request; nothing is retried.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::clock::Clock;
use crate::config::{Config, GenerationConfig, LimitsConfig};
use crate::dispatch::http::HttpUpstream;
use crate::dispatch::{GenerationRequest, Upstream};
use crate::error::ProxyError;
use crate::limiter::RateLimiter;
use crate::tools::analyze::AnalyzeRequest;
use crate::tools::transcribe::AudioUpload;

pub const ANALYZE_LEDGER_FILE: &str = "analyze_rate_limit.json";
pub const TRANSCRIBE_LEDGER_FILE: &str = "transcribe_rate_limit.json";

/// Where a request is in its lifecycle. Logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Validating,
    RateChecking,
    Calling,
    Succeeded,
    Failed,
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validating => "validating",
            Self::RateChecking => "rate_checking",
            Self::Calling => "calling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub struct AnalysisProxy {
    /// None when no credential is configured; every request then fails.
    upstream: Option<Arc<dyn Upstream>>,
    generation: GenerationConfig,
    limits: LimitsConfig,
    analyze_limiter: Arc<RateLimiter>,
    transcribe_limiter: Arc<RateLimiter>,
}

impl AnalysisProxy {
    pub fn new(
        upstream: Option<Arc<dyn Upstream>>,
        generation: GenerationConfig,
        limits: LimitsConfig,
        analyze_limiter: Arc<RateLimiter>,
        transcribe_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            upstream,
            generation,
            limits,
            analyze_limiter,
            transcribe_limiter,
        }
    }

    /// Wire the HTTP upstream and both limiters from configuration. Ledgers
    /// are persisted under `state_dir` when one is configured.
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, ProxyError> {
        let upstream: Option<Arc<dyn Upstream>> = match &config.api_key {
            Some(key) => Some(Arc::new(HttpUpstream::new(
                key.clone(),
                config.generation.clone(),
                config.transcription.clone(),
            )?)),
            None => None,
        };

        let analyze = limiter(
            "analyze",
            config.limits.analyze_per_hour,
            clock.clone(),
            config.state_dir.as_deref(),
            ANALYZE_LEDGER_FILE,
        );
        let transcribe = limiter(
            "transcribe",
            config.limits.transcribe_per_hour,
            clock,
            config.state_dir.as_deref(),
            TRANSCRIBE_LEDGER_FILE,
        );

        Ok(Self::new(
            upstream,
            config.generation.clone(),
            config.limits,
            Arc::new(analyze),
            Arc::new(transcribe),
        ))
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    pub fn analyze_limiter(&self) -> &Arc<RateLimiter> {
        &self.analyze_limiter
    }

    pub fn transcribe_limiter(&self) -> &Arc<RateLimiter> {
        &self.transcribe_limiter
    }

    /// Validate, rate-check, then issue exactly one generation call.
    ///
    /// The allowance is checked before the call and the request is counted
    /// after it, so N concurrent in-flight requests from one client can
    /// overshoot the hourly threshold by up to N.
    pub async fn analyze(
        &self,
        client_id: &str,
        request: AnalyzeRequest,
    ) -> Result<String, ProxyError> {
        let upstream = self.credentialed_upstream()?;

        phase("analyze", client_id, RequestPhase::Validating);
        let validated =
            request.validate(self.limits.min_text_len, self.limits.max_text_len)?;

        phase("analyze", client_id, RequestPhase::RateChecking);
        if !self.analyze_limiter.is_allowed(client_id) {
            tracing::warn!(client = client_id, "analyze: rate limit exceeded");
            return Err(ProxyError::RateLimited);
        }

        phase("analyze", client_id, RequestPhase::Calling);
        let start = Instant::now();
        let request = GenerationRequest {
            system_prompt: self.generation.system_prompt.clone(),
            prompt: validated.prompt(),
            model: self.generation.model.clone(),
            max_tokens: self.generation.max_tokens,
            temperature: self.generation.temperature,
        };
        let result = upstream.generate(&request).await;
        self.analyze_limiter.record_async(client_id).await;

        finish("analyze", client_id, validated.method.as_str(), start, result)
    }

    /// Validate the payload, rate-check, then issue exactly one transcription
    /// call. Counted the same way as `analyze`.
    pub async fn transcribe(
        &self,
        client_id: &str,
        audio: AudioUpload,
    ) -> Result<String, ProxyError> {
        let upstream = self.credentialed_upstream()?;

        phase("transcribe", client_id, RequestPhase::Validating);
        audio.validate(self.limits.max_audio_bytes)?;

        phase("transcribe", client_id, RequestPhase::RateChecking);
        if !self.transcribe_limiter.is_allowed(client_id) {
            tracing::warn!(client = client_id, "transcribe: rate limit exceeded");
            return Err(ProxyError::RateLimited);
        }

        phase("transcribe", client_id, RequestPhase::Calling);
        let start = Instant::now();
        let result = upstream.transcribe(audio).await;
        self.transcribe_limiter.record_async(client_id).await;

        finish("transcribe", client_id, "whisper", start, result)
    }

    /// Fails with `Config` when no credential is configured.
    pub fn ensure_configured(&self) -> Result<(), ProxyError> {
        self.credentialed_upstream().map(|_| ())
    }

    fn credentialed_upstream(&self) -> Result<&Arc<dyn Upstream>, ProxyError> {
        self.upstream.as_ref().ok_or_else(|| {
            tracing::error!("request refused: OPENAI_API_KEY is not configured");
            ProxyError::Config("OPENAI_API_KEY not configured".to_string())
        })
    }
}

fn limiter(
    name: &str,
    threshold: u32,
    clock: Arc<dyn Clock>,
    state_dir: Option<&Path>,
    file: &str,
) -> RateLimiter {
    let limiter = RateLimiter::new(name, threshold, clock);
    match state_dir {
        Some(dir) => limiter.with_ledger_path(dir.join(file)),
        None => limiter,
    }
}

fn phase(endpoint: &str, client_id: &str, phase: RequestPhase) {
    tracing::debug!(endpoint, client = client_id, %phase, "request phase");
}

fn finish(
    endpoint: &str,
    client_id: &str,
    label: &str,
    start: Instant,
    result: Result<String, ProxyError>,
) -> Result<String, ProxyError> {
    let latency_ms = start.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => {
            phase(endpoint, client_id, RequestPhase::Succeeded);
            tracing::info!(endpoint, label, latency_ms, "upstream call succeeded");
        }
        Err(e) => {
            phase(endpoint, client_id, RequestPhase::Failed);
            tracing::error!(endpoint, label, latency_ms, error = %e, "upstream call failed");
        }
    }
    result
}
