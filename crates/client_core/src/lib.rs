use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{DocumentDescriptor, Message, MessageId, MessageRole, MessageState, Phase},
    error::BackendError,
    protocol::{AskRequest, DocumentSummary},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod transport;

/// The only media type the upload flow accepts.
pub const ACCEPTED_MEDIA_TYPE: &str = "application/pdf";

pub const PROGRESS_TICK: Duration = Duration::from_millis(200);
pub const PROGRESS_STEP: u8 = 5;
/// Simulated progress never reaches completion on its own; it is forced to
/// 100 only when the upload response actually arrives.
pub const PROGRESS_CAP: u8 = 90;
pub const READY_DELAY: Duration = Duration::from_secs(1);
pub const ERROR_AUTO_DISMISS: Duration = Duration::from_secs(5);

const MSG_NO_FILE: &str = "Please select a PDF file first.";
const MSG_NOT_PDF: &str = "Please upload a PDF file.";
const MSG_EMPTY_QUESTION: &str = "Please enter a question.";
const MSG_NO_DOCUMENT: &str = "No PDF content available. Please upload a PDF first.";
const MSG_NO_SELECTION: &str = "Please select at least one document.";
const WELCOME_MESSAGE: &str = "PDF processed successfully! Ask a question about your document.";

const FALLBACK_UPLOAD_ERROR: &str = "Error uploading PDF";
const FALLBACK_ASK_ERROR: &str = "Error getting answer";
const FALLBACK_REGISTRY_ERROR: &str = "Error loading documents";
const FALLBACK_DELETE_ERROR: &str = "Error deleting document";

/// Local precondition failure or an aborted destructive action. Backend and
/// transport failures never surface here; they are absorbed into session
/// state and the error banner at the flow boundary.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),
    #[error("confirmation declined")]
    ConfirmationDeclined,
}

#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub file_name: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Returns the extracted document text on success.
    async fn upload_document(&self, upload: DocumentUpload) -> Result<String, BackendError>;
    /// Returns the answer text on success.
    async fn ask(&self, request: AskRequest) -> Result<String, BackendError>;
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>, BackendError>;
    async fn load_document(&self, file_name: &str) -> Result<(), BackendError>;
    async fn delete_document(&self, file_name: &str) -> Result<(), BackendError>;
}

pub struct MissingBackend;

#[async_trait]
impl DocumentBackend for MissingBackend {
    async fn upload_document(&self, _upload: DocumentUpload) -> Result<String, BackendError> {
        Err(BackendError::transport("document backend is unavailable"))
    }

    async fn ask(&self, _request: AskRequest) -> Result<String, BackendError> {
        Err(BackendError::transport("document backend is unavailable"))
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>, BackendError> {
        Err(BackendError::transport("document backend is unavailable"))
    }

    async fn load_document(&self, _file_name: &str) -> Result<(), BackendError> {
        Err(BackendError::transport("document backend is unavailable"))
    }

    async fn delete_document(&self, _file_name: &str) -> Result<(), BackendError> {
        Err(BackendError::transport("document backend is unavailable"))
    }
}

/// Seam for destructive-action confirmation. The shell decides how to ask;
/// the controller only cares about the verdict.
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

pub struct DeclineConfirmation;

#[async_trait]
impl ConfirmationGate for DeclineConfirmation {
    async fn confirm(&self, _prompt: &str) -> bool {
        false
    }
}

/// Render signals emitted by the controller. `TranscriptAppended` doubles as
/// the cue to scroll the transcript view to its end; `PhaseChanged` tells the
/// view which affordances to enable (the ask input is active exactly in
/// `Ready`, the upload form exactly in `Idle`).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged(Phase),
    TranscriptCleared,
    TranscriptAppended(Message),
    MessageResolved {
        message_id: MessageId,
        state: MessageState,
        text: String,
    },
    UploadProgress(u8),
    UploadProgressHidden,
    ErrorShown(String),
    ErrorCleared,
    DocumentsUpdated(Vec<DocumentDescriptor>),
}

/// Timer durations, injectable so tests can run the timer-driven paths in
/// milliseconds. Defaults match the production cadence.
#[derive(Debug, Clone)]
pub struct SessionTimings {
    pub progress_tick: Duration,
    pub ready_delay: Duration,
    pub error_dismiss: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            progress_tick: PROGRESS_TICK,
            ready_delay: READY_DELAY,
            error_dismiss: ERROR_AUTO_DISMISS,
        }
    }
}

struct SessionState {
    /// Bumped by every reset; completion handlers re-check it after each
    /// await so a response from a superseded session is dropped instead of
    /// resurrecting stale state.
    epoch: u64,
    phase: Phase,
    document_text: Option<String>,
    active_documents: Vec<String>,
    transcript: Vec<Message>,
    next_message_id: i64,
    pending_answer: Option<MessageId>,
    upload_progress: Option<u8>,
    banner: Option<String>,
    /// Bumped whenever the banner changes owner, so an auto-dismiss timer
    /// from an older banner can never clear a newer one.
    banner_seq: u64,
    documents: Vec<DocumentDescriptor>,
}

impl SessionState {
    fn initial(epoch: u64, banner_seq: u64) -> Self {
        Self {
            epoch,
            phase: Phase::Idle,
            document_text: None,
            active_documents: Vec::new(),
            transcript: Vec::new(),
            next_message_id: 0,
            pending_answer: None,
            upload_progress: None,
            banner: None,
            banner_seq,
            documents: Vec::new(),
        }
    }

    fn push_message(&mut self, role: MessageRole, text: &str, state: MessageState) -> Message {
        self.next_message_id += 1;
        let message = Message {
            message_id: MessageId(self.next_message_id),
            role,
            text: text.to_string(),
            sent_at: Utc::now(),
            state,
        };
        self.transcript.push(message.clone());
        message
    }

    fn has_document_context(&self) -> bool {
        self.document_text.is_some() || !self.active_documents.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub document_text: Option<String>,
    pub active_documents: Vec<String>,
    pub transcript: Vec<Message>,
    pub upload_progress: Option<u8>,
    pub banner: Option<String>,
    pub documents: Vec<DocumentDescriptor>,
}

impl SessionSnapshot {
    pub fn selected_file_names(&self) -> Vec<String> {
        self.documents
            .iter()
            .filter(|doc| doc.selected)
            .map(|doc| doc.file_name.clone())
            .collect()
    }

    /// Whether the "selected actions" affordance should be visible.
    pub fn has_selection(&self) -> bool {
        self.documents.iter().any(|doc| doc.selected)
    }

    /// Derived select-all state: true iff every row is individually selected.
    pub fn all_selected(&self) -> bool {
        !self.documents.is_empty() && self.documents.iter().all(|doc| doc.selected)
    }
}

pub struct SessionController {
    backend: Arc<dyn DocumentBackend>,
    confirmation: Arc<dyn ConfirmationGate>,
    timings: SessionTimings,
    inner: Mutex<SessionState>,
    progress_task: Mutex<Option<JoinHandle<()>>>,
    dismiss_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Arc<Self> {
        Self::new_with_dependencies(
            backend,
            Arc::new(DeclineConfirmation),
            SessionTimings::default(),
        )
    }

    pub fn new_with_dependencies(
        backend: Arc<dyn DocumentBackend>,
        confirmation: Arc<dyn ConfirmationGate>,
        timings: SessionTimings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            backend,
            confirmation,
            timings,
            inner: Mutex::new(SessionState::initial(0, 0)),
            progress_task: Mutex::new(None),
            dismiss_task: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.lock().await;
        SessionSnapshot {
            phase: state.phase,
            document_text: state.document_text.clone(),
            active_documents: state.active_documents.clone(),
            transcript: state.transcript.clone(),
            upload_progress: state.upload_progress,
            banner: state.banner.clone(),
            documents: state.documents.clone(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn fail_validation(self: &Arc<Self>, message: &str) -> Result<(), SessionError> {
        self.show_error(message).await;
        Err(SessionError::Validation(message.to_string()))
    }

    pub async fn submit_upload(self: &Arc<Self>, upload: DocumentUpload) -> Result<(), SessionError> {
        if upload.file_name.is_empty() || upload.bytes.is_empty() {
            return self.fail_validation(MSG_NO_FILE).await;
        }
        if upload.media_type != ACCEPTED_MEDIA_TYPE {
            return self.fail_validation(MSG_NOT_PDF).await;
        }

        let epoch = {
            let mut state = self.inner.lock().await;
            if state.phase != Phase::Idle {
                warn!(phase = ?state.phase, "upload: submit ignored outside idle");
                return Ok(());
            }
            state.phase = Phase::Uploading;
            state.upload_progress = Some(0);
            state.epoch
        };
        self.hide_error().await;
        self.emit(SessionEvent::PhaseChanged(Phase::Uploading));
        self.emit(SessionEvent::UploadProgress(0));
        self.start_progress_ticker(epoch).await;

        info!(
            file_name = %upload.file_name,
            size_bytes = upload.bytes.len(),
            "upload: submitting document"
        );
        let file_name = upload.file_name.clone();
        let result = self.backend.upload_document(upload).await;
        self.stop_progress_ticker().await;

        match result {
            Ok(text) => self.finish_upload_success(epoch, file_name, text).await,
            Err(err) => self.finish_upload_failure(epoch, err).await,
        }
        Ok(())
    }

    async fn finish_upload_success(self: &Arc<Self>, epoch: u64, file_name: String, text: String) {
        {
            let mut state = self.inner.lock().await;
            if state.epoch != epoch {
                debug!("upload: stale success dropped after reset");
                return;
            }
            state.upload_progress = Some(100);
            self.emit(SessionEvent::UploadProgress(100));
        }

        // Keep the completed bar visible briefly before switching views.
        tokio::time::sleep(self.timings.ready_delay).await;

        let welcome = {
            let mut state = self.inner.lock().await;
            if state.epoch != epoch {
                debug!("upload: stale success dropped after reset");
                return;
            }
            state.upload_progress = None;
            state.document_text = Some(text);
            state.phase = Phase::Ready;
            state.transcript.clear();
            state.push_message(MessageRole::System, WELCOME_MESSAGE, MessageState::Final)
        };
        self.emit(SessionEvent::UploadProgressHidden);
        self.emit(SessionEvent::TranscriptCleared);
        self.emit(SessionEvent::TranscriptAppended(welcome));
        self.emit(SessionEvent::PhaseChanged(Phase::Ready));
        info!(file_name = %file_name, "upload: document ready");

        // Re-uploading a known file replaces its chunks server-side, so the
        // registry metadata may have changed.
        match self.backend.list_documents().await {
            Ok(summaries) => self.apply_document_list(epoch, summaries).await,
            Err(err) => debug!(error = %err, "registry: post-upload refresh unavailable"),
        }
    }

    async fn finish_upload_failure(self: &Arc<Self>, epoch: u64, err: BackendError) {
        {
            let mut state = self.inner.lock().await;
            if state.epoch != epoch {
                debug!("upload: stale failure dropped after reset");
                return;
            }
            state.upload_progress = None;
            state.phase = Phase::Idle;
        }
        self.emit(SessionEvent::UploadProgressHidden);
        self.emit(SessionEvent::PhaseChanged(Phase::Idle));
        warn!(error = %err, "upload: failed");
        self.show_error(&err.user_message(FALLBACK_UPLOAD_ERROR)).await;
    }

    async fn start_progress_ticker(self: &Arc<Self>, epoch: u64) {
        let controller = Arc::clone(self);
        let tick = self.timings.progress_tick;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                // Event is sent while the lock is held so progress events
                // can never be observed out of write order.
                let mut state = controller.inner.lock().await;
                if state.epoch != epoch || state.phase != Phase::Uploading {
                    break;
                }
                let Some(current) = state.upload_progress else {
                    break;
                };
                if current >= PROGRESS_CAP {
                    break;
                }
                let next = (current + PROGRESS_STEP).min(PROGRESS_CAP);
                state.upload_progress = Some(next);
                let _ = controller.events.send(SessionEvent::UploadProgress(next));
            }
        });
        let mut guard = self.progress_task.lock().await;
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
    }

    async fn stop_progress_ticker(&self) {
        if let Some(handle) = self.progress_task.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn submit_question(self: &Arc<Self>, text: &str) -> Result<(), SessionError> {
        let question = text.trim().to_string();
        if question.is_empty() {
            return self.fail_validation(MSG_EMPTY_QUESTION).await;
        }

        let (epoch, placeholder_id, pdf_text, user_message, placeholder) = {
            let mut state = self.inner.lock().await;
            match state.phase {
                Phase::AwaitingAnswer => {
                    warn!("ask: a question is already in flight; ignoring");
                    return Ok(());
                }
                Phase::Uploading => {
                    warn!("ask: submit ignored while a document is uploading");
                    return Ok(());
                }
                Phase::Idle | Phase::Ready => {}
            }
            if !state.has_document_context() {
                drop(state);
                return self.fail_validation(MSG_NO_DOCUMENT).await;
            }
            state.phase = Phase::AwaitingAnswer;
            let user_message = state.push_message(MessageRole::User, &question, MessageState::Final);
            let placeholder = state.push_message(MessageRole::Assistant, "", MessageState::Pending);
            state.pending_answer = Some(placeholder.message_id);
            (
                state.epoch,
                placeholder.message_id,
                state.document_text.clone(),
                user_message,
                placeholder,
            )
        };
        self.hide_error().await;
        self.emit(SessionEvent::PhaseChanged(Phase::AwaitingAnswer));
        self.emit(SessionEvent::TranscriptAppended(user_message));
        self.emit(SessionEvent::TranscriptAppended(placeholder));

        info!(question_chars = question.len(), "ask: submitting question");
        let result = self.backend.ask(AskRequest { question, pdf_text }).await;

        let (resolved_state, resolved_text) = match result {
            Ok(answer) => (MessageState::Final, answer),
            Err(err) => {
                warn!(error = %err, "ask: failed");
                (MessageState::Failed, err.user_message(FALLBACK_ASK_ERROR))
            }
        };

        {
            let mut state = self.inner.lock().await;
            if state.epoch != epoch || state.pending_answer != Some(placeholder_id) {
                debug!("ask: stale completion dropped");
                return Ok(());
            }
            state.pending_answer = None;
            state.phase = Phase::Ready;
            if let Some(message) = state
                .transcript
                .iter_mut()
                .find(|message| message.message_id == placeholder_id)
            {
                message.state = resolved_state;
                message.text = resolved_text.clone();
            }
        }
        self.emit(SessionEvent::MessageResolved {
            message_id: placeholder_id,
            state: resolved_state,
            text: resolved_text,
        });
        self.emit(SessionEvent::PhaseChanged(Phase::Ready));
        Ok(())
    }

    /// Unconditional return to the initial state. Any response still in
    /// flight will find the epoch changed and drop itself.
    pub async fn reset(&self) {
        self.stop_progress_ticker().await;
        if let Some(handle) = self.dismiss_task.lock().await.take() {
            handle.abort();
        }
        let (had_progress, had_banner) = {
            let mut state = self.inner.lock().await;
            let had_progress = state.upload_progress.is_some();
            let had_banner = state.banner.is_some();
            *state = SessionState::initial(state.epoch + 1, state.banner_seq + 1);
            (had_progress, had_banner)
        };
        if had_progress {
            self.emit(SessionEvent::UploadProgressHidden);
        }
        if had_banner {
            self.emit(SessionEvent::ErrorCleared);
        }
        self.emit(SessionEvent::TranscriptCleared);
        self.emit(SessionEvent::PhaseChanged(Phase::Idle));
        info!("session reset");
    }

    /// Replaces any banner currently showing and restarts the auto-dismiss
    /// timer. Banners never stack.
    pub async fn show_error(self: &Arc<Self>, message: &str) {
        let seq = {
            let mut state = self.inner.lock().await;
            state.banner_seq += 1;
            state.banner = Some(message.to_string());
            state.banner_seq
        };
        self.emit(SessionEvent::ErrorShown(message.to_string()));

        let controller = Arc::clone(self);
        let dismiss_after = self.timings.error_dismiss;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(dismiss_after).await;
            {
                let mut state = controller.inner.lock().await;
                if state.banner_seq != seq {
                    return;
                }
                state.banner = None;
            }
            let _ = controller.events.send(SessionEvent::ErrorCleared);
        });
        let mut guard = self.dismiss_task.lock().await;
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
    }

    pub async fn hide_error(&self) {
        if let Some(handle) = self.dismiss_task.lock().await.take() {
            handle.abort();
        }
        let had_banner = {
            let mut state = self.inner.lock().await;
            state.banner_seq += 1;
            state.banner.take().is_some()
        };
        if had_banner {
            self.emit(SessionEvent::ErrorCleared);
        }
    }

    pub async fn refresh_documents(self: &Arc<Self>) -> Result<(), SessionError> {
        let epoch = { self.inner.lock().await.epoch };
        self.hide_error().await;
        match self.backend.list_documents().await {
            Ok(summaries) => {
                info!(count = summaries.len(), "registry: document list fetched");
                self.apply_document_list(epoch, summaries).await;
            }
            Err(err) => {
                warn!(error = %err, "registry: list failed");
                self.show_error(&err.user_message(FALLBACK_REGISTRY_ERROR)).await;
            }
        }
        Ok(())
    }

    async fn apply_document_list(&self, epoch: u64, summaries: Vec<DocumentSummary>) {
        let documents = {
            let mut state = self.inner.lock().await;
            if state.epoch != epoch {
                debug!("registry: stale list dropped after reset");
                return;
            }
            let keep_selected: HashSet<String> = state
                .documents
                .iter()
                .filter(|doc| doc.selected)
                .map(|doc| doc.file_name.clone())
                .collect();
            state.documents = summaries
                .into_iter()
                .map(|summary| DocumentDescriptor {
                    selected: keep_selected.contains(&summary.file_name),
                    file_name: summary.file_name,
                    chunk_count: summary.chunk_count,
                    upload_time: summary.upload_time,
                })
                .collect();
            state.documents.clone()
        };
        self.emit(SessionEvent::DocumentsUpdated(documents));
    }

    pub async fn toggle_select(&self, file_name: &str) {
        let documents = {
            let mut state = self.inner.lock().await;
            let Some(doc) = state
                .documents
                .iter_mut()
                .find(|doc| doc.file_name == file_name)
            else {
                warn!(file_name = %file_name, "registry: toggle for unknown document");
                return;
            };
            doc.selected = !doc.selected;
            state.documents.clone()
        };
        self.emit(SessionEvent::DocumentsUpdated(documents));
    }

    pub async fn select_all(&self, selected: bool) {
        let documents = {
            let mut state = self.inner.lock().await;
            for doc in &mut state.documents {
                doc.selected = selected;
            }
            state.documents.clone()
        };
        self.emit(SessionEvent::DocumentsUpdated(documents));
    }

    pub async fn load_document(self: &Arc<Self>, file_name: &str) -> Result<(), SessionError> {
        self.load_documents(vec![file_name.to_string()]).await
    }

    pub async fn load_selected(self: &Arc<Self>) -> Result<(), SessionError> {
        let selected = {
            let state = self.inner.lock().await;
            state
                .documents
                .iter()
                .filter(|doc| doc.selected)
                .map(|doc| doc.file_name.clone())
                .collect::<Vec<_>>()
        };
        if selected.is_empty() {
            return self.fail_validation(MSG_NO_SELECTION).await;
        }
        self.load_documents(selected).await
    }

    async fn load_documents(self: &Arc<Self>, file_names: Vec<String>) -> Result<(), SessionError> {
        let epoch = { self.inner.lock().await.epoch };
        self.hide_error().await;
        for file_name in &file_names {
            if let Err(err) = self.backend.load_document(file_name).await {
                warn!(file_name = %file_name, error = %err, "registry: load failed");
                self.show_error(&err.user_message(FALLBACK_REGISTRY_ERROR)).await;
                return Ok(());
            }
        }

        let system_message = {
            let mut state = self.inner.lock().await;
            if state.epoch != epoch {
                debug!("registry: stale load dropped after reset");
                return Ok(());
            }
            // Context is resolved server-side for registry documents; the
            // client holds no extracted text of its own.
            state.document_text = None;
            state.active_documents = file_names.clone();
            state.phase = Phase::Ready;
            state.transcript.clear();
            let text = format!("Now answering questions about: {}", file_names.join(", "));
            state.push_message(MessageRole::System, &text, MessageState::Final)
        };
        self.emit(SessionEvent::TranscriptCleared);
        self.emit(SessionEvent::TranscriptAppended(system_message));
        self.emit(SessionEvent::PhaseChanged(Phase::Ready));
        info!(documents = ?file_names, "registry: documents loaded for chat");
        Ok(())
    }

    pub async fn delete_document(self: &Arc<Self>, file_name: &str) -> Result<(), SessionError> {
        let prompt = format!("Delete {file_name}? This cannot be undone.");
        if !self.confirmation.confirm(&prompt).await {
            debug!(file_name = %file_name, "registry: delete declined");
            return Err(SessionError::ConfirmationDeclined);
        }
        self.hide_error().await;
        match self.backend.delete_document(file_name).await {
            Ok(()) => {
                info!(file_name = %file_name, "registry: document deleted");
                self.refresh_documents().await
            }
            Err(err) => {
                warn!(file_name = %file_name, error = %err, "registry: delete failed");
                self.show_error(&err.user_message(FALLBACK_DELETE_ERROR)).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
