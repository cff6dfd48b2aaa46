//! Test doubles for the external services plus store setup helpers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::database::{Database, NewChunk, TranscriptStatus};
use crate::llm::{ChatModel, ChatRequest, LlmError};
use crate::transcription::{ListenOptions, SpeechToText, SttError, WordEvent, WordSink};

pub fn setup_test_db() -> (Arc<Database>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(&db_path).unwrap();
    (Arc::new(db), temp_dir)
}

pub fn seed_episode(db: &Database, description: Option<&str>) -> i64 {
    db.create_episode("Test Episode", "https://cdn.example.com/episode.mp3", description)
        .unwrap()
}

/// Store a complete transcript made of `words` (text, speaker) pairs.
pub fn seed_complete_transcript(db: &Database, episode_id: i64, words: &[(&str, i64)]) -> i64 {
    let transcript_id = db.create_transcript(episode_id).unwrap();
    let chunks: Vec<NewChunk> = words
        .iter()
        .enumerate()
        .map(|(i, (text, speaker))| NewChunk {
            position: i as i64,
            speaker_index: *speaker,
            start_time: i as f64,
            end_time: i as f64 + 0.5,
            text: text.to_string(),
        })
        .collect();
    db.save_chunks(transcript_id, &chunks).unwrap();
    db.update_transcript_status(transcript_id, TranscriptStatus::Complete, None)
        .unwrap();
    transcript_id
}

// ============================================================================
// Speech-to-text
// ============================================================================

/// Replays a fixed word list, optionally failing once the words run out.
pub struct ScriptedStt {
    words: Vec<WordEvent>,
    failure: Option<(u16, String)>,
    calls: AtomicUsize,
}

impl ScriptedStt {
    pub fn new(words: Vec<WordEvent>) -> Self {
        Self {
            words,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_after(words: Vec<WordEvent>, status: u16, body: &str) -> Self {
        Self {
            failure: Some((status, body.to_string())),
            ..Self::new(words)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn stream(
        &self,
        _audio_url: &str,
        _options: &ListenOptions,
        cancel: &CancellationToken,
        on_event: &mut WordSink<'_>,
    ) -> Result<(), SttError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        for word in &self.words {
            if cancel.is_cancelled() {
                return Err(SttError::Cancelled);
            }
            if on_event(word.clone()).is_break() {
                return Err(SttError::SinkClosed);
            }
        }

        match &self.failure {
            Some((status, body)) => Err(SttError::Status {
                status: *status,
                body: body.clone(),
            }),
            None => Ok(()),
        }
    }
}

// ============================================================================
// LLM
// ============================================================================

type Responder = dyn Fn(&ChatRequest) -> Result<String, LlmError> + Send + Sync;

/// Answers chat requests from a closure and keeps every request it saw.
pub struct ScriptedLlm {
    responder: Box<Responder>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new(
        responder: impl Fn(&ChatRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always reply with `text`.
    pub fn reply(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_| Ok(text.clone()))
    }

    /// Always fail with an upstream status error.
    pub fn failing() -> Self {
        Self::new(|_| {
            Err(LlmError::Status {
                status: 503,
                body: "unavailable".to_string(),
            })
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedLlm {
    async fn chat(&self, request: ChatRequest) -> Result<String, LlmError> {
        let reply = (self.responder)(&request);
        self.requests.lock().unwrap().push(request);
        reply
    }
}

/// Last user message of a request, the part tests usually match on.
pub fn user_prompt(request: &ChatRequest) -> &str {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .unwrap_or("")
}
