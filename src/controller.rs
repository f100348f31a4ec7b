use std::path::Path;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::{ChatBackend, ChatReply, ChatRequest};
use crate::citations::Citation;
use crate::error::ClientError;
use crate::session::{Exchange, ExchangeId, InFlight, SessionState, UploadRecord};
use crate::settings::SourceMode;
use crate::stream::{StreamEvent, TextStream};

pub const SEND_FAILED: &str = "Failed to send message. Please try again.";
pub const UPLOAD_FAILED: &str = "Failed to upload file. Please try again.";

pub const SUGGESTED_QUERIES: [&str; 5] = [
    "What are the key mining safety regulations in India?",
    "Explain the process for mining lease renewal",
    "What are the environmental clearance requirements?",
    "Latest DGMS circulars for coal mines",
    "Mining safety officer qualifications",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Ignored,
    Completed(ExchangeId),
    Stopped(ExchangeId),
    /// The exchange was rolled back; the message is also in `SessionState::error`.
    Failed(String),
}

enum StreamEnd {
    Done(Option<Vec<Citation>>),
    Aborted,
}

pub struct ChatSession<B: ChatBackend> {
    backend: B,
    state: watch::Sender<SessionState>,
}

impl<B: ChatBackend> ChatSession<B> {
    pub fn new(backend: B, source: SourceMode) -> Self {
        let (state, _) = watch::channel(SessionState::new(source));
        Self { backend, state }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn set_source(&self, source: SourceMode) {
        self.state.send_if_modified(|s| {
            let changed = s.source != source;
            s.source = source;
            changed
        });
    }

    pub fn set_input(&self, text: impl Into<String>) {
        let text = text.into();
        self.state.send_modify(|s| s.input = text);
    }

    pub async fn submit_input(&self) -> SubmitOutcome {
        let draft = self.state.borrow().input.clone();
        self.submit(&draft).await
    }

    pub async fn submit(&self, text: &str) -> SubmitOutcome {
        let query = text.trim();
        if query.is_empty() {
            return SubmitOutcome::Ignored;
        }

        let exchange = Exchange::new(query);
        let id = exchange.id;
        let token = CancellationToken::new();
        let mut source = SourceMode::default();
        self.state.send_modify(|s| {
            if let Some(prev) = s.in_flight.as_ref().map(|f| f.exchange_id) {
                tracing::debug!(previous = %prev, "stopping previous stream");
            }
            s.stop_in_flight();
            s.error = None;
            s.input.clear();
            s.exchanges.push(exchange);
            s.in_flight = Some(InFlight { exchange_id: id, token: token.clone() });
            source = s.source;
        });
        tracing::debug!(exchange = %id, %source, "submitting question");

        let request = ChatRequest { query: query.to_string(), source };
        let result = self.run_exchange(id, &request, &token).await;

        let outcome = match result {
            Ok(StreamEnd::Done(fallback)) => {
                self.state.send_modify(|s| {
                    s.finish(id, fallback);
                    s.release(id);
                });
                tracing::info!(exchange = %id, "answer complete");
                SubmitOutcome::Completed(id)
            }
            Ok(StreamEnd::Aborted) => self.finish_stopped(id),
            // errors raised while tearing down a cancelled request are still a stop
            Err(e) if token.is_cancelled() => {
                tracing::debug!(exchange = %id, error = %e, "error after cancellation");
                self.finish_stopped(id)
            }
            Err(e) => {
                tracing::warn!(exchange = %id, error = %e, "chat request failed");
                self.state.send_modify(|s| {
                    s.remove(id);
                    s.error = Some(SEND_FAILED.to_string());
                    s.release(id);
                });
                SubmitOutcome::Failed(SEND_FAILED.to_string())
            }
        };
        metrics::counter!("niti_chat_exchanges_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    fn finish_stopped(&self, id: ExchangeId) -> SubmitOutcome {
        self.state.send_modify(|s| {
            s.mark_stopped(id);
            s.release(id);
        });
        tracing::info!(exchange = %id, "generation stopped");
        SubmitOutcome::Stopped(id)
    }

    async fn run_exchange(&self, id: ExchangeId, request: &ChatRequest, token: &CancellationToken) -> Result<StreamEnd, ClientError> {
        let reply = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(StreamEnd::Aborted),
            reply = self.backend.open_chat(request) => reply?,
        };
        match reply {
            ChatReply::Complete { text, sources } => {
                self.apply_chunk(id, &text);
                Ok(StreamEnd::Done(sources))
            }
            ChatReply::Streaming(body) => {
                let mut reader = TextStream::new(body);
                loop {
                    match reader.next_chunk(token).await? {
                        StreamEvent::Chunk(chunk) => {
                            if !self.apply_chunk(id, &chunk) {
                                // stopped or cleared underneath us
                                return Ok(StreamEnd::Aborted);
                            }
                        }
                        StreamEvent::Done => return Ok(StreamEnd::Done(None)),
                        StreamEvent::Aborted => return Ok(StreamEnd::Aborted),
                    }
                }
            }
        }
    }

    fn apply_chunk(&self, id: ExchangeId, chunk: &str) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|s| {
            applied = s.append_chunk(id, chunk);
            applied
        });
        applied
    }

    pub fn cancel(&self) -> bool {
        self.state.send_if_modified(|s| s.stop_in_flight())
    }

    pub fn clear(&self) {
        self.state.send_modify(|s| {
            s.stop_in_flight();
            s.exchanges.clear();
            s.error = None;
        });
    }

    /// On failure the user-facing message is also stored in `SessionState::error`.
    pub async fn upload(&self, path: &Path) -> Result<UploadRecord, String> {
        self.state.send_modify(|s| {
            s.uploading = true;
            s.error = None;
        });
        let result = self.backend.upload(path).await;
        let outcome = match result {
            Ok(receipt) => {
                let record = UploadRecord {
                    name: receipt.filename,
                    uploaded_at: chrono::Utc::now(),
                    chunk_count: receipt.chunk_count,
                    message: receipt.message,
                };
                tracing::info!(file = %record.name, chunks = record.chunk_count, "document indexed");
                self.state.send_modify(|s| {
                    s.uploads.push(record.clone());
                    s.uploading = false;
                });
                Ok(record)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "upload failed");
                let message = upload_error_message(&e);
                self.state.send_modify(|s| {
                    s.error = Some(message.clone());
                    s.uploading = false;
                });
                Err(message)
            }
        };
        let label = if outcome.is_ok() { "ok" } else { "error" };
        metrics::counter!("niti_chat_uploads_total", "outcome" => label).increment(1);
        outcome
    }
}

fn upload_error_message(e: &ClientError) -> String {
    match e {
        ClientError::UnsupportedFile(name) => format!("Only PDF documents can be uploaded ({name})."),
        other => match other.detail() {
            Some(detail) => format!("Upload failed: {detail}"),
            None => UPLOAD_FAILED.to_string(),
        },
    }
}

impl SubmitOutcome {
    fn label(&self) -> &'static str {
        match self {
            SubmitOutcome::Ignored => "ignored",
            SubmitOutcome::Completed(_) => "completed",
            SubmitOutcome::Stopped(_) => "stopped",
            SubmitOutcome::Failed(_) => "failed",
        }
    }
}
