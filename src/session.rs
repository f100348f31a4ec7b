use crate::citations::{parse_response, Citation};
use crate::settings::SourceMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const STOP_MARKER: &str = "\n\n[Generation stopped]";

pub type ExchangeId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Exchange {
    pub id: ExchangeId,
    pub user_message: String,
    pub assistant_text: String,
    pub sources: Vec<Citation>,
    pub created_at: DateTime<Utc>,
    pub is_streaming: bool,
    pub stopped: bool,
}

impl Exchange {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_message: user_message.into(),
            assistant_text: String::new(),
            sources: Vec::new(),
            created_at: Utc::now(),
            is_streaming: true,
            stopped: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadRecord {
    pub name: String,
    pub uploaded_at: DateTime<Utc>,
    pub chunk_count: u64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Sending,
    Streaming,
    Uploading,
    Error,
}

#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub exchange_id: ExchangeId,
    pub token: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub exchanges: Vec<Exchange>,
    pub source: SourceMode,
    pub input: String,
    pub error: Option<String>,
    pub uploads: Vec<UploadRecord>,
    pub uploading: bool,
    pub(crate) in_flight: Option<InFlight>,
}

impl SessionState {
    pub fn new(source: SourceMode) -> Self {
        Self { source, ..Default::default() }
    }

    pub fn status(&self) -> SessionStatus {
        if let Some(ex) = self.exchanges.iter().rev().find(|e| e.is_streaming) {
            return if ex.assistant_text.is_empty() { SessionStatus::Sending } else { SessionStatus::Streaming };
        }
        if self.uploading {
            SessionStatus::Uploading
        } else if self.error.is_some() {
            SessionStatus::Error
        } else {
            SessionStatus::Idle
        }
    }

    pub fn exchange(&self, id: ExchangeId) -> Option<&Exchange> {
        self.exchanges.iter().find(|e| e.id == id)
    }

    fn streaming_mut(&mut self, id: ExchangeId) -> Option<&mut Exchange> {
        self.exchanges.iter_mut().find(|e| e.id == id && e.is_streaming)
    }

    pub(crate) fn append_chunk(&mut self, id: ExchangeId, chunk: &str) -> bool {
        match self.streaming_mut(id) {
            Some(ex) => {
                ex.assistant_text.push_str(chunk);
                true
            }
            None => false,
        }
    }

    /// `fallback` is used when the text carries no citation trailer.
    pub(crate) fn finish(&mut self, id: ExchangeId, fallback: Option<Vec<Citation>>) -> bool {
        let Some(ex) = self.streaming_mut(id) else { return false };
        let parsed = parse_response(&ex.assistant_text);
        ex.assistant_text = parsed.content;
        ex.sources = match fallback {
            Some(sources) if parsed.sources.is_empty() => sources,
            _ => parsed.sources,
        };
        ex.is_streaming = false;
        true
    }

    /// Idempotent: an exchange is annotated at most once. A trailer that
    /// already arrived is parsed off before the marker goes on.
    pub(crate) fn mark_stopped(&mut self, id: ExchangeId) -> bool {
        let Some(ex) = self.streaming_mut(id) else { return false };
        let parsed = parse_response(&ex.assistant_text);
        ex.assistant_text = parsed.content;
        ex.assistant_text.push_str(STOP_MARKER);
        ex.sources = parsed.sources;
        ex.is_streaming = false;
        ex.stopped = true;
        true
    }

    pub(crate) fn remove(&mut self, id: ExchangeId) -> bool {
        let before = self.exchanges.len();
        self.exchanges.retain(|e| e.id != id);
        self.exchanges.len() != before
    }

    pub(crate) fn stop_in_flight(&mut self) -> bool {
        let Some(flight) = self.in_flight.take() else { return false };
        flight.token.cancel();
        self.mark_stopped(flight.exchange_id);
        true
    }

    pub(crate) fn release(&mut self, id: ExchangeId) {
        if self.in_flight.as_ref().is_some_and(|f| f.exchange_id == id) {
            self.in_flight = None;
        }
    }

    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_streaming(text: &str) -> (SessionState, ExchangeId) {
        let mut state = SessionState::new(SourceMode::Both);
        let ex = Exchange::new("q");
        let id = ex.id;
        state.exchanges.push(ex);
        state.append_chunk(id, text);
        (state, id)
    }

    #[test]
    fn status_follows_exchange_lifecycle() {
        let mut state = SessionState::default();
        assert_eq!(state.status(), SessionStatus::Idle);
        let ex = Exchange::new("q");
        let id = ex.id;
        state.exchanges.push(ex);
        assert_eq!(state.status(), SessionStatus::Sending);
        state.append_chunk(id, "a");
        assert_eq!(state.status(), SessionStatus::Streaming);
        state.finish(id, None);
        assert_eq!(state.status(), SessionStatus::Idle);
        state.error = Some("boom".into());
        assert_eq!(state.status(), SessionStatus::Error);
    }

    #[test]
    fn finish_parses_trailer_and_freezes_exchange() {
        let (mut state, id) = state_with_streaming("Answer text\n\n[SOURCES][{\"file\":\"a.pdf\",\"page\":3}]");
        assert!(state.finish(id, None));
        let ex = state.exchange(id).unwrap();
        assert_eq!(ex.assistant_text, "Answer text");
        assert_eq!(ex.sources, vec![Citation { file: "a.pdf".into(), page: 3 }]);
        assert!(!ex.is_streaming);
        assert!(!state.append_chunk(id, "late"));
        assert!(!state.mark_stopped(id));
        assert_eq!(state.exchange(id).unwrap().assistant_text, "Answer text");
    }

    #[test]
    fn fallback_sources_only_without_trailer() {
        let fallback = vec![Citation { file: "b.pdf".into(), page: 1 }];
        let (mut state, id) = state_with_streaming("plain");
        state.finish(id, Some(fallback.clone()));
        assert_eq!(state.exchange(id).unwrap().sources, fallback);

        let (mut state, id) = state_with_streaming("x\n\n[SOURCES][{\"file\":\"a.pdf\",\"page\":2}]");
        state.finish(id, Some(fallback));
        assert_eq!(state.exchange(id).unwrap().sources[0].file, "a.pdf");
    }

    #[test]
    fn stop_marker_applied_once() {
        let (mut state, id) = state_with_streaming("partial");
        assert!(state.mark_stopped(id));
        assert!(!state.mark_stopped(id));
        let ex = state.exchange(id).unwrap();
        assert_eq!(ex.assistant_text, format!("partial{STOP_MARKER}"));
        assert!(ex.stopped);
    }

    #[test]
    fn stop_after_trailer_keeps_citations_out_of_text() {
        let (mut state, id) = state_with_streaming("Answer\n\n[SOURCES][{\"file\":\"dgms.pdf\",\"page\":7}]");
        assert!(state.mark_stopped(id));
        let ex = state.exchange(id).unwrap();
        assert_eq!(ex.assistant_text, format!("Answer{STOP_MARKER}"));
        assert_eq!(ex.sources, vec![Citation { file: "dgms.pdf".into(), page: 7 }]);

        let (mut state, id) = state_with_streaming("Answer\n\n[SOURCES][{\"fi");
        state.mark_stopped(id);
        let ex = state.exchange(id).unwrap();
        assert_eq!(ex.assistant_text, format!("Answer\n\n[SOURCES][{{\"fi{STOP_MARKER}"));
        assert!(ex.sources.is_empty());
    }

    #[test]
    fn release_only_clears_own_handle() {
        let (mut state, id) = state_with_streaming("");
        state.in_flight = Some(InFlight { exchange_id: id, token: CancellationToken::new() });
        state.release(Uuid::now_v7());
        assert!(state.is_busy());
        state.release(id);
        assert!(!state.is_busy());
    }
}
