//! Streaming speech-to-text integration
//!
//! Posts an audio URL to a Deepgram-style `/listen` endpoint and re-emits the
//! reply as one [`WordEvent`] per word, in upstream order. The body is read
//! incrementally so the caller sees words while the response is still
//! arriving, and the read is aborted as soon as the caller's cancellation
//! token fires.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Deadline for the upstream to accept the request and send headers.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum SttError {
    #[error("transcription request failed: {0}")]
    Request(String),

    #[error("transcription service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode transcription frame: {0}")]
    Decode(String),

    #[error("transcription cancelled")]
    Cancelled,

    /// The consumer stopped accepting events.
    #[error("event sink closed")]
    SinkClosed,
}

impl SttError {
    /// Aborts caused by our side going away rather than the upstream failing.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Cancelled | Self::SinkClosed)
    }
}

/// Query options sent to the `/listen` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListenOptions {
    pub model: String,
    pub language: String,
    pub diarize: bool,
    pub punctuate: bool,
    pub utterances: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            model: "nova-2".to_string(),
            language: "en".to_string(),
            diarize: true,
            punctuate: true,
            utterances: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WordEvent {
    pub word: String,
    pub punctuated_word: String,
    pub start: f64,
    pub end: f64,
    pub speaker_index: i64,
}

impl WordEvent {
    pub fn new(word: &str, start: f64, end: f64, speaker_index: i64) -> Self {
        Self {
            word: word.to_string(),
            punctuated_word: word.to_string(),
            start,
            end,
            speaker_index,
        }
    }
}

/// Event callback. Returning `Break` stops the stream with [`SttError::SinkClosed`].
pub type WordSink<'a> = dyn FnMut(WordEvent) -> ControlFlow<()> + Send + 'a;

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn stream(
        &self,
        audio_url: &str,
        options: &ListenOptions,
        cancel: &CancellationToken,
        on_event: &mut WordSink<'_>,
    ) -> Result<(), SttError>;
}

// ============================================================================
// HTTP client
// ============================================================================

pub struct ListenClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ListenClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl SpeechToText for ListenClient {
    async fn stream(
        &self,
        audio_url: &str,
        options: &ListenOptions,
        cancel: &CancellationToken,
        on_event: &mut WordSink<'_>,
    ) -> Result<(), SttError> {
        let url = format!("{}/listen", self.base_url);
        log::info!(
            "Requesting transcription: model={}, diarize={}, url={}",
            options.model,
            options.diarize,
            audio_url
        );

        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .query(options)
            .json(&serde_json::json!({ "url": audio_url }))
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SttError::Cancelled),
            result = tokio::time::timeout(CONNECT_TIMEOUT, request) => match result {
                Err(_) => return Err(SttError::Request(format!(
                    "no response within {}s", CONNECT_TIMEOUT.as_secs()
                ))),
                Ok(Err(e)) => return Err(SttError::Request(e.to_string())),
                Ok(Ok(response)) => response,
            },
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SttError::Status {
                status,
                body: crate::llm::truncate_chars(&body, MAX_ERROR_BODY).to_string(),
            });
        }

        let mut decoder = FrameDecoder::default();
        let mut body = Box::pin(response.bytes_stream());
        let mut words = 0usize;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(SttError::Cancelled),
                next = body.next() => next,
            };
            let Some(bytes) = next else { break };
            let bytes = bytes.map_err(|e| SttError::Request(e.to_string()))?;

            for event in decoder.push(&bytes)? {
                words += 1;
                if on_event(event).is_break() {
                    return Err(SttError::SinkClosed);
                }
            }
        }

        for event in decoder.finish()? {
            words += 1;
            if on_event(event).is_break() {
                return Err(SttError::SinkClosed);
            }
        }

        log::info!("Transcription stream finished: {} words", words);
        Ok(())
    }
}

// ============================================================================
// Frame decoding
// ============================================================================

/// Incremental decoder for the upstream body.
///
/// Each complete line that parses as a frame is decoded right away
/// (newline-delimited streaming). Lines that don't parse are kept, and at the
/// end of the body everything kept is parsed as one document, which covers
/// the pretty-printed single-response shape.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    line: Vec<u8>,
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<WordEvent>, SttError> {
        let mut events = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                self.take_line(line, &mut events);
            } else {
                self.line.push(byte);
            }
        }
        Ok(events)
    }

    pub fn finish(mut self) -> Result<Vec<WordEvent>, SttError> {
        let mut events = Vec::new();
        let line = std::mem::take(&mut self.line);
        self.take_line(line, &mut events);

        if self.pending.iter().all(u8::is_ascii_whitespace) {
            return Ok(events);
        }

        let frame: Frame = serde_json::from_slice(&self.pending)
            .map_err(|e| SttError::Decode(e.to_string()))?;
        events.extend(frame.into_words());
        Ok(events)
    }

    fn take_line(&mut self, line: Vec<u8>, events: &mut Vec<WordEvent>) {
        if line.iter().all(u8::is_ascii_whitespace) {
            self.pending.extend_from_slice(&line);
            self.pending.push(b'\n');
            return;
        }

        // Once a document has started spanning lines, keep collecting it
        if self.pending.iter().all(u8::is_ascii_whitespace) {
            if let Ok(frame) = serde_json::from_slice::<Frame>(&line) {
                self.pending.clear();
                events.extend(frame.into_words());
                return;
            }
        }
        self.pending.extend_from_slice(&line);
        self.pending.push(b'\n');
    }
}

/// One upstream frame in either the batch (`results.channels`) or the live
/// (`channel`) shape.
#[derive(Debug, Default, Deserialize)]
struct Frame {
    #[serde(default)]
    results: Option<FrameResults>,
    #[serde(default)]
    channel: Option<Channel>,
}

#[derive(Debug, Default, Deserialize)]
struct FrameResults {
    #[serde(default)]
    channels: Vec<Channel>,
}

#[derive(Debug, Default, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Default, Deserialize)]
struct Alternative {
    #[serde(default)]
    words: Vec<RawWord>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWord {
    #[serde(default)]
    word: String,
    #[serde(default)]
    punctuated_word: Option<String>,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    speaker: Option<i64>,
}

impl Frame {
    fn into_words(self) -> Vec<WordEvent> {
        let channel = self
            .results
            .and_then(|r| r.channels.into_iter().next())
            .or(self.channel);

        // Only the first alternative is used; empty frames yield nothing
        let Some(alternative) = channel.and_then(|c| c.alternatives.into_iter().next()) else {
            return Vec::new();
        };

        alternative
            .words
            .into_iter()
            .map(|w| {
                let punctuated_word = w
                    .punctuated_word
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| w.word.clone());
                WordEvent {
                    word: w.word,
                    punctuated_word,
                    start: w.start,
                    end: w.end.max(w.start),
                    speaker_index: w.speaker.unwrap_or(0).max(0),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BATCH_RESPONSE: &str = r#"{
  "metadata": {"request_id": "abc"},
  "results": {
    "channels": [{
      "alternatives": [{
        "transcript": "hello world hi",
        "words": [
          {"word": "hello", "punctuated_word": "Hello", "start": 0.0, "end": 0.5, "confidence": 0.9, "speaker": 0},
          {"word": "world", "punctuated_word": "world.", "start": 0.5, "end": 1.0, "confidence": 0.9, "speaker": 0},
          {"word": "hi", "start": 1.0, "end": 1.3, "confidence": 0.8, "speaker": 1, "speaker_confidence": 0.7}
        ]
      }, {
        "words": [{"word": "ignored", "start": 0.0, "end": 0.1}]
      }]
    }]
  }
}"#;

    #[test]
    fn test_decodes_pretty_printed_document() {
        let mut decoder = FrameDecoder::default();
        let mut events = Vec::new();
        // Split mid-token to exercise buffering
        for piece in BATCH_RESPONSE.as_bytes().chunks(37) {
            events.extend(decoder.push(piece).unwrap());
        }
        events.extend(decoder.finish().unwrap());

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].punctuated_word, "Hello");
        assert_eq!(events[1].punctuated_word, "world.");
        assert_eq!(events[2].word, "hi");
        assert_eq!(events[2].punctuated_word, "hi");
        assert_eq!(events[2].speaker_index, 1);
    }

    #[test]
    fn test_decodes_newline_delimited_frames_incrementally() {
        let mut decoder = FrameDecoder::default();
        let first = decoder
            .push(b"{\"channel\":{\"alternatives\":[{\"words\":[{\"word\":\"a\",\"start\":0.0,\"end\":0.2,\"speaker\":2}]}]}}\n")
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].speaker_index, 2);

        let empty = decoder
            .push(b"{\"channel\":{\"alternatives\":[]}}\n{\"channel\":{\"alternatives\":[{\"words\":[{\"word\":\"b\"}]}]}}")
            .unwrap();
        assert!(empty.is_empty());

        let rest = decoder.finish().unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].word, "b");
        assert_eq!(rest[0].speaker_index, 0);
        assert_eq!(rest[0].start, 0.0);
    }

    #[test]
    fn test_missing_alternatives_are_skipped() {
        let mut decoder = FrameDecoder::default();
        decoder.push(br#"{"results":{"channels":[]}}"#).unwrap();
        assert!(decoder.finish().unwrap().is_empty());

        let decoder = FrameDecoder::default();
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_body_is_decode_error() {
        let mut decoder = FrameDecoder::default();
        decoder.push(b"{\"results\": {\"channels\": [").unwrap();
        assert!(matches!(decoder.finish(), Err(SttError::Decode(_))));
    }

    #[test]
    fn test_listen_options_query() {
        let options = ListenOptions::default();
        let value = serde_json::to_value(&options).unwrap();
        assert_eq!(value["model"], "nova-2");
        assert_eq!(value["diarize"], true);
        assert_eq!(value["utterances"], false);
    }
}
