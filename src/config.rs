use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Default config file name, looked up in the working directory.
const DEFAULT_CONFIG_FILE: &str = "dreamlog.toml";

pub const DEFAULT_GENERATION_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_TRANSCRIPTION_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an experienced dream analyst and psychologist. \
Answer empathetically and helpfully.";

pub const DEFAULT_LANGUAGE: &str = "de";

/// Default system prompt, asking for answers in the configured language.
pub fn default_system_prompt(language: &str) -> String {
    format!("{DEFAULT_SYSTEM_PROMPT} Respond in {}.", language_name(language))
}

/// English name of an ISO 639-1 code. Unknown codes are passed through.
fn language_name(code: &str) -> &str {
    match code {
        "de" => "German",
        "en" => "English",
        "fr" => "French",
        "es" => "Spanish",
        "it" => "Italian",
        "nl" => "Dutch",
        "pt" => "Portuguese",
        _ => code,
    }
}

/// On-disk TOML shape. Every key is optional; missing keys fall back to defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub openai_api_key: Option<String>,
    pub bind: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub generation_url: Option<String>,
    pub generation_model: Option<String>,
    pub transcription_url: Option<String>,
    pub transcription_model: Option<String>,
    pub language: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub generation_timeout_secs: Option<u64>,
    pub transcription_timeout_secs: Option<u64>,
    pub min_text_len: Option<usize>,
    pub max_text_len: Option<usize>,
    pub analyze_per_hour: Option<u32>,
    pub transcribe_per_hour: Option<u32>,
    pub max_audio_bytes: Option<usize>,
}

/// Upstream generation settings.
#[derive(Clone)]
pub struct GenerationConfig {
    pub url: String,
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout: Duration,
}

/// Upstream transcription settings.
#[derive(Clone)]
pub struct TranscriptionConfig {
    pub url: String,
    pub model: String,
    pub language: String,
    pub timeout: Duration,
}

/// Limits enforced by the proxy.
#[derive(Debug, Clone, Copy)]
pub struct LimitsConfig {
    pub min_text_len: usize,
    pub max_text_len: usize,
    pub analyze_per_hour: u32,
    pub transcribe_per_hour: u32,
    pub max_audio_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_text_len: 10,
            max_text_len: 8000,
            analyze_per_hour: 100,
            transcribe_per_hour: 50,
            max_audio_bytes: 25 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct Config {
    /// `None` means every proxied request fails with a config error.
    pub api_key: Option<String>,
    pub bind: String,
    /// Where rate-limit ledgers are persisted. `None` keeps them in memory.
    pub state_dir: Option<PathBuf>,
    pub generation: GenerationConfig,
    pub transcription: TranscriptionConfig,
    pub limits: LimitsConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field(
                "api_key",
                &self.api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("bind", &self.bind)
            .field("state_dir", &self.state_dir)
            .field("generation_url", &self.generation.url)
            .field("generation_model", &self.generation.model)
            .field("transcription_url", &self.transcription.url)
            .field("transcription_model", &self.transcription.model)
            .field("limits", &self.limits)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_sources(FileConfig::default(), |_| None)
    }
}

impl Config {
    /// Load from the TOML file (`DREAMLOG_CONFIG` or `./dreamlog.toml`) and the
    /// process environment. Environment wins over the file.
    pub fn load() -> Self {
        let path = env::var("DREAMLOG_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        let file = read_file_config(&path);
        let config = Self::from_sources(file, |key| env::var(key).ok());
        if config.api_key.is_none() {
            tracing::warn!("OPENAI_API_KEY not set and no openai_api_key in config file, proxy requests will fail");
        }
        config
    }

    /// Build a config from a parsed file and an environment lookup.
    pub fn from_sources(file: FileConfig, env_lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env_str = |key: &str| env_lookup(key).filter(|v| !v.trim().is_empty());
        let env_parse = |key: &str| env_str(key).and_then(|v| v.trim().parse::<u64>().ok());

        let api_key = env_str("OPENAI_API_KEY")
            .or(file.openai_api_key)
            .filter(|k| !k.trim().is_empty());

        // one language for transcription and for analysis answers
        let language = env_str("DREAMLOG_LANGUAGE")
            .or(file.language)
            .map(|l| l.trim().to_lowercase())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

        let defaults = LimitsConfig::default();
        let limits = LimitsConfig {
            min_text_len: file.min_text_len.unwrap_or(defaults.min_text_len),
            max_text_len: file.max_text_len.unwrap_or(defaults.max_text_len),
            analyze_per_hour: env_parse("DREAMLOG_ANALYZE_PER_HOUR")
                .map(|v| v as u32)
                .or(file.analyze_per_hour)
                .unwrap_or(defaults.analyze_per_hour),
            transcribe_per_hour: env_parse("DREAMLOG_TRANSCRIBE_PER_HOUR")
                .map(|v| v as u32)
                .or(file.transcribe_per_hour)
                .unwrap_or(defaults.transcribe_per_hour),
            max_audio_bytes: file.max_audio_bytes.unwrap_or(defaults.max_audio_bytes),
        };

        Config {
            api_key,
            bind: env_str("DREAMLOG_BIND")
                .or(file.bind)
                .unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            state_dir: env_str("DREAMLOG_STATE_DIR")
                .map(PathBuf::from)
                .or(file.state_dir),
            generation: GenerationConfig {
                url: env_str("DREAMLOG_GENERATION_URL")
                    .or(file.generation_url)
                    .unwrap_or_else(|| DEFAULT_GENERATION_URL.to_string()),
                model: file
                    .generation_model
                    .unwrap_or_else(|| "gpt-4.1-mini".to_string()),
                system_prompt: file
                    .system_prompt
                    .unwrap_or_else(|| default_system_prompt(&language)),
                max_tokens: file.max_tokens.unwrap_or(5000),
                temperature: file.temperature.unwrap_or(0.7),
                timeout: Duration::from_secs(file.generation_timeout_secs.unwrap_or(30)),
            },
            transcription: TranscriptionConfig {
                url: env_str("DREAMLOG_TRANSCRIPTION_URL")
                    .or(file.transcription_url)
                    .unwrap_or_else(|| DEFAULT_TRANSCRIPTION_URL.to_string()),
                model: file
                    .transcription_model
                    .unwrap_or_else(|| "whisper-1".to_string()),
                language,
                timeout: Duration::from_secs(file.transcription_timeout_secs.unwrap_or(60)),
            },
            limits,
        }
    }
}

/// Missing file is normal; a malformed one is logged and ignored.
fn read_file_config(path: &Path) -> FileConfig {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return FileConfig::default(),
        Err(e) => {
            tracing::warn!("config: failed to read {}: {e}", path.display());
            return FileConfig::default();
        }
    };
    match toml::from_str(&content) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("config: failed to parse {}: {e}", path.display());
            FileConfig::default()
        }
    }
}
