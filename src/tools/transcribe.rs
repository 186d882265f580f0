use crate::error::ProxyError;

/// MIME types browsers are known to record in. Others are logged, not refused,
/// since browsers disagree on what they send.
pub const EXPECTED_AUDIO_TYPES: &[&str] = &[
    "audio/webm",
    "audio/mp4",
    "audio/mpeg",
    "audio/wav",
    "audio/ogg",
    "audio/x-m4a",
];

pub const DEFAULT_AUDIO_FILE_NAME: &str = "recording.webm";

/// A binary audio payload to be transcribed.
#[derive(Clone)]
pub struct AudioUpload {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub content_type: String,
}

impl std::fmt::Debug for AudioUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioUpload")
            .field("bytes", &self.bytes.len())
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl AudioUpload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            file_name: DEFAULT_AUDIO_FILE_NAME.to_string(),
            content_type: "audio/webm".to_string(),
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Size must be in `1..=max_bytes`.
    pub fn validate(&self, max_bytes: usize) -> Result<(), ProxyError> {
        if self.bytes.is_empty() {
            return Err(ProxyError::InvalidAudio("file is empty".to_string()));
        }
        if self.bytes.len() > max_bytes {
            let limit = if max_bytes >= 1024 * 1024 {
                format!("{} MB", max_bytes / (1024 * 1024))
            } else {
                format!("{max_bytes} bytes")
            };
            return Err(ProxyError::InvalidAudio(format!(
                "file too large (maximum {limit})"
            )));
        }
        let base_type = self
            .content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        if !EXPECTED_AUDIO_TYPES.contains(&base_type) {
            tracing::warn!(
                "transcribe: unexpected audio type '{}', forwarding anyway",
                self.content_type
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_audio_is_rejected() {
        assert!(matches!(
            AudioUpload::new(vec![]).validate(1024),
            Err(ProxyError::InvalidAudio(_))
        ));
    }

    #[test]
    fn oversized_audio_is_rejected() {
        let err = AudioUpload::new(vec![0; 2 * 1024 * 1024 + 1])
            .validate(2 * 1024 * 1024)
            .unwrap_err();
        assert!(err.user_message().contains("2 MB"));
    }

    #[test]
    fn unexpected_type_is_allowed() {
        let upload = AudioUpload::new(vec![1, 2, 3]).with_content_type("application/octet-stream");
        assert!(upload.validate(1024).is_ok());
    }

    #[test]
    fn codec_suffix_is_ignored() {
        let upload = AudioUpload::new(vec![1]).with_content_type("audio/webm;codecs=opus");
        assert!(upload.validate(1024).is_ok());
    }
}
