//! Journal service: the user-facing actions, written against contracts only
//! (record store, analysis backend, notifier).

pub mod client;

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{JournalError, ProxyError, StoreError};
use crate::store::{Entry, EntryDraft, RecordStore};
use crate::tools::enums::AnalysisMethod;
use crate::tools::transcribe::AudioUpload;

pub use client::ProxyClient;

/// Something that can analyze and transcribe on the journal's behalf.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    async fn analyze(
        &self,
        text: &str,
        context: Option<&str>,
        method: AnalysisMethod,
    ) -> Result<String, ProxyError>;

    async fn transcribe(&self, audio: AudioUpload) -> Result<String, ProxyError>;
}

/// User-facing feedback channel.
pub trait Notifier: Send + Sync {
    fn success(&self, message: &str);
    fn error(&self, message: &str);
    fn show_loading(&self, message: &str);
    fn hide_loading(&self);

    /// Ask the user to confirm. A dropped sender counts as declined.
    fn confirm(&self, prompt: &str) -> oneshot::Receiver<bool>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(Entry),
    /// Queued until the running transcription completes.
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionOutcome {
    /// No save was queued: the editor text with the transcript appended.
    Text(String),
    /// A queued save ran with the transcript appended to its text.
    Saved(Entry),
}

#[derive(Default)]
struct CaptureState {
    in_flight: usize,
    pending: Option<EntryDraft>,
}

/// Shows the loading indicator for its lifetime.
struct LoadingGuard<'a> {
    notifier: &'a dyn Notifier,
}

impl<'a> LoadingGuard<'a> {
    fn show(notifier: &'a dyn Notifier, message: &str) -> Self {
        notifier.show_loading(message);
        Self { notifier }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.notifier.hide_loading();
    }
}

/// Marks a transcription in flight. Dropping it without `finish` (the
/// transcription future was cancelled) ends the capture and saves any queued
/// draft as is.
struct CaptureGuard<'a> {
    journal: &'a Journal,
    active: bool,
}

impl<'a> CaptureGuard<'a> {
    fn begin(journal: &'a Journal) -> Self {
        journal.capture().in_flight += 1;
        Self {
            journal,
            active: true,
        }
    }

    /// End the capture and hand back the queued draft, if this was the last
    /// transcription in flight.
    fn finish(mut self) -> Option<EntryDraft> {
        self.active = false;
        self.journal.end_capture()
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(draft) = self.journal.end_capture() {
            tracing::warn!("journal: transcription abandoned, saving queued draft");
            if let Ok(entry) = self.journal.persist(draft) {
                tracing::debug!("journal: queued draft saved as entry {}", entry.id);
            }
        }
    }
}

pub struct Journal {
    store: Arc<RecordStore>,
    backend: Arc<dyn AnalysisBackend>,
    notifier: Arc<dyn Notifier>,
    capture: Mutex<CaptureState>,
}

impl Journal {
    pub fn new(
        store: Arc<RecordStore>,
        backend: Arc<dyn AnalysisBackend>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            backend,
            notifier,
            capture: Mutex::new(CaptureState::default()),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Save a draft, or queue it while a transcription is running.
    /// A later queued draft replaces an earlier one.
    pub async fn save(&self, draft: EntryDraft) -> Result<SaveOutcome, JournalError> {
        let mut capture = self.capture();
        if capture.in_flight > 0 {
            tracing::debug!("journal: save deferred until transcription completes");
            capture.pending = Some(draft);
            return Ok(SaveOutcome::Deferred);
        }
        let saved = self.persist(draft)?;
        Ok(SaveOutcome::Saved(saved))
    }

    /// Transcribe a recording. A save queued meanwhile runs afterwards, with
    /// the transcript appended on success and untouched on failure or
    /// cancellation. On failure the error carries the saved entry, if any.
    pub async fn transcribe(
        &self,
        audio: AudioUpload,
        draft_text: &str,
    ) -> Result<TranscriptionOutcome, JournalError> {
        let guard = CaptureGuard::begin(self);

        let result = {
            let _loading = LoadingGuard::show(self.notifier.as_ref(), "Transcribing...");
            self.backend.transcribe(audio).await
        };

        let pending = guard.finish();

        match (result, pending) {
            (Ok(transcript), Some(mut draft)) => {
                draft.text = append_transcript(&draft.text, &transcript);
                Ok(TranscriptionOutcome::Saved(self.persist(draft)?))
            }
            (Ok(transcript), None) => Ok(TranscriptionOutcome::Text(append_transcript(
                draft_text,
                &transcript,
            ))),
            (Err(e), pending) => {
                // the queued save still runs; a failure there is reported by `persist`
                let saved = pending
                    .and_then(|draft| self.persist(draft).ok())
                    .map(Box::new);
                Err(self.report(JournalError::Transcription { source: e, saved }))
            }
        }
    }

    /// Request one analysis for a stored entry and persist the result.
    pub async fn analyze_entry(
        &self,
        id: i64,
        method: AnalysisMethod,
    ) -> Result<Entry, JournalError> {
        let entry = self
            .store
            .get_entry(id)
            .ok_or_else(|| self.report(StoreError::NotFound(id).into()))?;
        if entry.analyses.contains_key(method.as_str()) {
            return Err(self.report(JournalError::AlreadyAnalyzed {
                id,
                method: method.as_str().to_string(),
            }));
        }

        let result = {
            let _loading = LoadingGuard::show(
                self.notifier.as_ref(),
                &format!("{} in progress...", method.title()),
            );
            self.backend
                .analyze(&entry.text, entry.context.as_deref(), method)
                .await
        };
        let text = result.map_err(|e| self.report(e.into()))?;

        let updated = self
            .store
            .upsert_analysis(id, method.as_str(), text)
            .map_err(|e| self.report(e.into()))?;
        self.notifier
            .success(&format!("{} completed", method.title()));
        Ok(updated)
    }

    /// Returns `Ok(false)` when the user declines.
    pub async fn delete_entry(&self, id: i64) -> Result<bool, JournalError> {
        if !self.confirm("Really delete this dream?").await {
            return Ok(false);
        }
        self.store
            .delete_entry(id)
            .map_err(|e| self.report(e.into()))?;
        self.notifier.success("Dream deleted");
        Ok(true)
    }

    pub async fn delete_analysis(&self, id: i64, method: &str) -> Result<bool, JournalError> {
        if !self.confirm("Really delete this analysis?").await {
            return Ok(false);
        }
        self.store
            .remove_analysis(id, method)
            .map_err(|e| self.report(e.into()))?;
        self.notifier.success("Analysis deleted");
        Ok(true)
    }

    pub async fn delete_all_analyses(&self, id: i64) -> Result<bool, JournalError> {
        if !self.confirm("Really delete all analyses of this dream?").await {
            return Ok(false);
        }
        self.store
            .remove_all_analyses(id)
            .map_err(|e| self.report(e.into()))?;
        self.notifier.success("All analyses deleted");
        Ok(true)
    }

    pub async fn clear_all(&self) -> Result<bool, JournalError> {
        if !self
            .confirm("Really delete all dreams and settings? This cannot be undone.")
            .await
        {
            return Ok(false);
        }
        self.store.clear_all().map_err(|e| self.report(e.into()))?;
        self.notifier.success("All data deleted");
        Ok(true)
    }

    fn capture(&self) -> MutexGuard<'_, CaptureState> {
        self.capture
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn end_capture(&self) -> Option<EntryDraft> {
        let mut capture = self.capture();
        capture.in_flight = capture.in_flight.saturating_sub(1);
        if capture.in_flight == 0 {
            capture.pending.take()
        } else {
            None
        }
    }

    fn persist(&self, draft: EntryDraft) -> Result<Entry, JournalError> {
        let entry = self
            .store
            .save_entry(draft)
            .map_err(|e| self.report(e.into()))?;
        self.notifier.success("Dream saved");
        Ok(entry)
    }

    async fn confirm(&self, prompt: &str) -> bool {
        self.notifier.confirm(prompt).await.unwrap_or(false)
    }

    fn report(&self, e: JournalError) -> JournalError {
        tracing::warn!("journal: {e}");
        self.notifier.error(&e.user_message());
        e
    }
}

/// Space-separated append, without a leading space on empty text.
pub fn append_transcript(existing: &str, transcript: &str) -> String {
    let existing = existing.trim_end();
    let transcript = transcript.trim();
    match (existing.is_empty(), transcript.is_empty()) {
        (_, true) => existing.to_string(),
        (true, false) => transcript.to_string(),
        (false, false) => format!("{existing} {transcript}"),
    }
}
