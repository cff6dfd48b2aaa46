//! Transcript ingestion and replay
//!
//! A stream request either replays a finished transcript from the store or
//! runs a fresh ingest: words from the STT stream go straight to the client
//! and into an in-memory accumulator, and once the upstream finishes the
//! chunks are persisted and every speaker gets an LLM-inferred name.

mod speakers;


use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::database::{Database, NewChunk, TranscriptStatus};
use crate::error::AppError;
use crate::llm::ChatModel;
use crate::sse::{ChunkPayload, SseEmitter};
use crate::transcription::{ListenOptions, SpeechToText, WordEvent};

pub use speakers::provisional_name;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub listen: ListenOptions,
    /// Per-speaker naming deadline.
    pub speaker_timeout: Duration,
    /// Words of each speaker shown to the naming prompt.
    pub speaker_sample_words: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            listen: ListenOptions::default(),
            speaker_timeout: Duration::from_secs(25),
            speaker_sample_words: 400,
        }
    }
}

/// What a stream request will do, decided before any bytes are sent.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPlan {
    Replay {
        transcript_id: i64,
    },
    Ingest {
        transcript_id: i64,
        audio_url: String,
        description: Option<String>,
    },
}

impl StreamPlan {
    pub fn transcript_id(&self) -> i64 {
        match self {
            Self::Replay { transcript_id } | Self::Ingest { transcript_id, .. } => *transcript_id,
        }
    }
}

pub struct TranscriptPipeline {
    db: Arc<Database>,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn ChatModel>,
    config: PipelineConfig,
}

impl TranscriptPipeline {
    pub fn new(
        db: Arc<Database>,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn ChatModel>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            db,
            stt,
            llm,
            config,
        }
    }

    /// Resolve an episode to a replay or an ingest.
    ///
    /// Starting an ingest creates (or resets) the transcript row, so this is
    /// the last point where the request can still fail with a plain HTTP error.
    pub fn prepare(&self, episode_id: i64) -> Result<StreamPlan, AppError> {
        if let Some(transcript) = self.db.get_transcript_by_episode(episode_id)? {
            if transcript.status == TranscriptStatus::Complete {
                return Ok(StreamPlan::Replay {
                    transcript_id: transcript.id,
                });
            }
        }

        let episode = self
            .db
            .get_episode(episode_id)?
            .ok_or_else(|| AppError::NotFound(format!("episode {}", episode_id)))?;

        let transcript_id = self.db.create_transcript(episode_id)?;
        log::info!(
            "Starting ingest of episode {} as transcript {}",
            episode_id,
            transcript_id
        );

        Ok(StreamPlan::Ingest {
            transcript_id,
            audio_url: episode.audio_url,
            description: episode.description,
        })
    }

    /// Drive a plan to completion, writing events to `emitter`.
    ///
    /// A failure is reported to the client as a terminal `error` event and
    /// also returned.
    pub async fn run(
        &self,
        plan: StreamPlan,
        emitter: SseEmitter,
        cancel: CancellationToken,
    ) -> Result<(), AppError> {
        let result = match plan {
            StreamPlan::Replay { transcript_id } => self.replay(transcript_id, &emitter),
            StreamPlan::Ingest {
                transcript_id,
                audio_url,
                description,
            } => {
                self.ingest(transcript_id, &audio_url, description, &emitter, &cancel)
                    .await
            }
        };

        if let Err(e) = &result {
            log::error!("Transcript stream failed: {}", e);
            let _ = emitter.error(&e.to_string());
        }
        result
    }

    fn replay(&self, transcript_id: i64, emitter: &SseEmitter) -> Result<(), AppError> {
        let speakers = self.db.get_speakers(transcript_id)?;
        let chunks = self.db.get_chunks(transcript_id)?;
        log::info!(
            "Replaying transcript {}: {} speakers, {} chunks",
            transcript_id,
            speakers.len(),
            chunks.len()
        );

        let sent = (|| {
            for speaker in &speakers {
                emitter.speaker(speaker.speaker_index, &speaker.speaker_name)?;
            }
            for chunk in chunks {
                emitter.chunk(ChunkPayload {
                    position: chunk.position,
                    speaker_index: chunk.speaker_index,
                    start: chunk.start_time,
                    end: chunk.end_time,
                    text: chunk.text,
                })?;
            }
            emitter.complete()
        })();

        if sent.is_err() {
            log::info!("Client left during replay of transcript {}", transcript_id);
        }
        Ok(())
    }

    async fn ingest(
        &self,
        transcript_id: i64,
        audio_url: &str,
        description: Option<String>,
        emitter: &SseEmitter,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let mut state = IngestState::default();

        let mut on_word = |word: WordEvent| {
            let (chunk, new_speaker) = state.push(word);

            if let Some(index) = new_speaker {
                if emitter.speaker(index, &provisional_name(index)).is_err() {
                    return ControlFlow::Break(());
                }
            }
            match emitter.chunk(chunk) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        };

        let streamed = self
            .stt
            .stream(audio_url, &self.config.listen, cancel, &mut on_word)
            .await;

        match streamed {
            Ok(()) => {}
            Err(e) if e.is_abort() => {
                // Leave it processing so the next request starts over
                log::info!(
                    "Ingest of transcript {} aborted after {} words: {}",
                    transcript_id,
                    state.chunks.len(),
                    e
                );
                return Ok(());
            }
            Err(e) => {
                self.mark_failed(transcript_id, &e.to_string());
                return Err(e.into());
            }
        }

        let IngestState {
            chunks,
            speakers_seen,
            speaker_words,
        } = state;

        if let Err(e) = self.db.save_chunks(transcript_id, &chunks) {
            let message = format!("failed to save transcript chunks: {:#}", e);
            self.mark_failed(transcript_id, &message);
            return Err(AppError::Database(message));
        }

        // Provisional rows first, so every chunk's speaker has a name even if
        // inference fails
        for &index in &speakers_seen {
            if let Err(e) = speakers::upsert_speaker_with_retry(
                &self.db,
                transcript_id,
                index,
                &provisional_name(index),
            )
            .await
            {
                log::warn!(
                    "Failed to store provisional name for speaker {} of transcript {}: {:#}",
                    index,
                    transcript_id,
                    e
                );
            }
        }

        speakers::name_speakers(
            speakers::NamingContext {
                db: self.db.clone(),
                llm: self.llm.clone(),
                transcript_id,
                description,
                timeout: self.config.speaker_timeout,
                sample_words: self.config.speaker_sample_words,
            },
            speaker_words,
            emitter.clone(),
        )
        .await;

        self.db
            .update_transcript_status(transcript_id, TranscriptStatus::Complete, None)?;
        log::info!(
            "Transcript {} complete: {} chunks, {} speakers",
            transcript_id,
            chunks.len(),
            speakers_seen.len()
        );

        let _ = emitter.complete();
        Ok(())
    }

    fn mark_failed(&self, transcript_id: i64, message: &str) {
        if let Err(e) =
            self.db
                .update_transcript_status(transcript_id, TranscriptStatus::Failed, Some(message))
        {
            log::error!(
                "Failed to mark transcript {} as failed: {:#}",
                transcript_id,
                e
            );
        }
    }
}

// ============================================================================
// Ingest accumulator
// ============================================================================

/// Per-request accumulator. Owned by the ingest call and only touched from
/// the word callback, one word at a time.
#[derive(Debug, Default)]
struct IngestState {
    chunks: Vec<NewChunk>,
    speakers_seen: BTreeSet<i64>,
    speaker_words: BTreeMap<i64, Vec<String>>,
}

impl IngestState {
    /// Record a word. Returns its chunk payload and, the first time a speaker
    /// shows up, that speaker's index.
    fn push(&mut self, word: WordEvent) -> (ChunkPayload, Option<i64>) {
        let position = self.chunks.len() as i64;
        let chunk = NewChunk {
            position,
            speaker_index: word.speaker_index,
            start_time: word.start,
            end_time: word.end,
            text: word.punctuated_word,
        };

        self.speaker_words
            .entry(chunk.speaker_index)
            .or_default()
            .push(chunk.text.clone());
        let new_speaker = self
            .speakers_seen
            .insert(chunk.speaker_index)
            .then_some(chunk.speaker_index);

        let payload = ChunkPayload {
            position,
            speaker_index: chunk.speaker_index,
            start: chunk.start_time,
            end: chunk.end_time,
            text: chunk.text.clone(),
        };
        self.chunks.push(chunk);
        (payload, new_speaker)
    }
}
