//! Server-sent events for transcript streams
//!
//! Frames are `event: <name>\ndata: <json>\n\n`, rendered by axum's
//! [`Sse`] responder. Each frame goes out in the order it was sent.

use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkPayload {
    pub position: i64,
    pub speaker_index: i64,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeakerPayload {
    pub index: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Chunk(ChunkPayload),
    Speaker(SpeakerPayload),
    Error(String),
    Complete,
}

impl SseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chunk(_) => "chunk",
            Self::Speaker(_) => "speaker",
            Self::Error(_) => "error",
            Self::Complete => "complete",
        }
    }

    /// JSON for the `data:` line. Error messages are folded onto one line.
    pub fn data(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Chunk(payload) => serde_json::to_string(payload),
            Self::Speaker(payload) => serde_json::to_string(payload),
            Self::Error(message) => {
                let single_line = message.split_whitespace().collect::<Vec<_>>().join(" ");
                serde_json::to_string(&serde_json::json!({ "error": single_line }))
            }
            Self::Complete => Ok("{}".to_string()),
        }
    }
}

/// An encoded event waiting in the channel.
#[derive(Debug)]
struct Frame {
    name: &'static str,
    data: String,
}

impl Frame {
    fn into_event(self) -> Event {
        Event::default().event(self.name).data(self.data)
    }
}

/// The client side of the stream has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event stream closed")]
pub struct StreamClosed;

/// Cloneable write half of one client stream.
///
/// The channel is unbounded: the ingest callback cannot wait, and every
/// frame it sends is already held by the ingest accumulator until the
/// transcript is saved.
#[derive(Debug, Clone)]
pub struct SseEmitter {
    tx: mpsc::UnboundedSender<Frame>,
}

/// Read half, turned into the response.
#[derive(Debug)]
pub struct SseStream {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl SseEmitter {
    pub fn channel() -> (SseEmitter, SseStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SseEmitter { tx }, SseStream { rx })
    }

    pub fn send(&self, event: &SseEvent) -> Result<(), StreamClosed> {
        let data = match event.data() {
            Ok(data) => data,
            Err(e) => {
                log::error!("Failed to encode {} event: {}", event.name(), e);
                return Ok(());
            }
        };
        self.tx
            .send(Frame {
                name: event.name(),
                data,
            })
            .map_err(|_| StreamClosed)
    }

    pub fn chunk(&self, payload: ChunkPayload) -> Result<(), StreamClosed> {
        self.send(&SseEvent::Chunk(payload))
    }

    pub fn speaker(&self, index: i64, name: &str) -> Result<(), StreamClosed> {
        self.send(&SseEvent::Speaker(SpeakerPayload {
            index,
            name: name.to_string(),
        }))
    }

    pub fn error(&self, message: &str) -> Result<(), StreamClosed> {
        self.send(&SseEvent::Error(message.to_string()))
    }

    pub fn complete(&self) -> Result<(), StreamClosed> {
        self.send(&SseEvent::Complete)
    }

    /// Resolves once the client stops reading.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

impl SseStream {
    /// Next frame rendered as text, or `None` once every emitter is dropped.
    #[cfg(test)]
    pub async fn next_frame(&mut self) -> Option<String> {
        self.rx
            .recv()
            .await
            .map(|frame| format!("event: {}\ndata: {}\n\n", frame.name, frame.data))
    }

    /// Drain every frame sent so far and still to come.
    #[cfg(test)]
    pub async fn collect_frames(mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame().await {
            frames.push(frame);
        }
        frames
    }
}

/// Serve a stream as a `text/event-stream` response.
pub fn sse_response(stream: SseStream) -> Response {
    let events = futures_util::stream::unfold(stream.rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(frame.into_event()), rx))
    });
    Sse::new(events).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;

    async fn body_text(stream: SseStream) -> String {
        let response = sse_response(stream);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_frames_are_bit_exact() {
        let (emitter, stream) = SseEmitter::channel();
        emitter
            .chunk(ChunkPayload {
                position: 0,
                speaker_index: 0,
                start: 0.0,
                end: 0.5,
                text: "Hello".to_string(),
            })
            .unwrap();
        emitter.speaker(1, "Speaker 1").unwrap();
        emitter.complete().unwrap();
        drop(emitter);

        assert_eq!(
            body_text(stream).await,
            "event: chunk\ndata: {\"position\":0,\"speaker_index\":0,\"start\":0.0,\"end\":0.5,\"text\":\"Hello\"}\n\n\
             event: speaker\ndata: {\"index\":1,\"name\":\"Speaker 1\"}\n\n\
             event: complete\ndata: {}\n\n"
        );
    }

    #[tokio::test]
    async fn test_error_message_is_single_line() {
        let (emitter, stream) = SseEmitter::channel();
        emitter
            .error("upstream\nreturned 502\r\n bad gateway")
            .unwrap();
        drop(emitter);

        assert_eq!(
            body_text(stream).await,
            "event: error\ndata: {\"error\":\"upstream returned 502 bad gateway\"}\n\n"
        );
    }

    #[tokio::test]
    async fn test_emitter_preserves_order_and_detects_close() {
        let (emitter, mut stream) = SseEmitter::channel();
        emitter.speaker(0, "Speaker 0").unwrap();
        emitter.complete().unwrap();

        assert!(stream.next_frame().await.unwrap().starts_with("event: speaker"));
        assert!(stream.next_frame().await.unwrap().starts_with("event: complete"));

        drop(stream);
        emitter.closed().await;
        assert_eq!(emitter.complete(), Err(StreamClosed));
    }

    #[tokio::test]
    async fn test_response_is_event_stream() {
        let (emitter, stream) = SseEmitter::channel();
        drop(emitter);

        let response = sse_response(stream);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    }
}
