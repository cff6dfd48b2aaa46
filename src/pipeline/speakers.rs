//! Speaker naming
//!
//! Runs after the STT stream ends, against a snapshot of each speaker's words.
//! Every speaker gets its own task on the runtime, detached from the client
//! connection, so a disconnect never interrupts the store update.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::database::Database;
use crate::llm::{self, ChatMessage, ChatModel, ChatRequest, LlmError};
use crate::sse::SseEmitter;

const UPSERT_ATTEMPTS: u32 = 3;
const UPSERT_BACKOFF: Duration = Duration::from_millis(100);
const NAME_MAX_TOKENS: u32 = 50;
const MAX_DESCRIPTION_CHARS: usize = 2000;

pub(crate) const SPEAKER_SYSTEM_PROMPT: &str = "You identify speakers in podcast transcripts. \
Given an episode description and a sample of what one diarized speaker said, reply with the \
speaker's real name. Hosts and guests are usually named in the description or introduce \
themselves. Respond with JSON only: {\"name\": \"<name>\"}. If you cannot tell, respond with \
{\"name\": \"unknown\"}.";

pub fn provisional_name(speaker_index: i64) -> String {
    format!("Speaker {}", speaker_index)
}

/// Everything a naming task needs, owned so it can move onto the runtime.
#[derive(Clone)]
pub(crate) struct NamingContext {
    pub db: Arc<Database>,
    pub llm: Arc<dyn ChatModel>,
    pub transcript_id: i64,
    pub description: Option<String>,
    pub timeout: Duration,
    pub sample_words: usize,
}

/// Upsert a speaker name, retrying with linear backoff.
pub(crate) async fn upsert_speaker_with_retry(
    db: &Database,
    transcript_id: i64,
    speaker_index: i64,
    name: &str,
) -> anyhow::Result<()> {
    retry_with_backoff(|| db.upsert_speaker(transcript_id, speaker_index, name)).await
}

/// Run `op` up to [`UPSERT_ATTEMPTS`] times, sleeping `UPSERT_BACKOFF * attempt`
/// between failures.
async fn retry_with_backoff<F>(mut op: F) -> anyhow::Result<()>
where
    F: FnMut() -> anyhow::Result<()>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) if attempt < UPSERT_ATTEMPTS => {
                let delay = UPSERT_BACKOFF * attempt;
                log::warn!(
                    "Speaker upsert attempt {} failed, retrying in {:?}: {:#}",
                    attempt,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Name every speaker concurrently and wait for all of them.
///
/// Failures are logged and leave the provisional name in place.
pub(crate) async fn name_speakers(
    ctx: NamingContext,
    speaker_words: BTreeMap<i64, Vec<String>>,
    emitter: SseEmitter,
) {
    if speaker_words.is_empty() {
        return;
    }

    let handles: Vec<_> = speaker_words
        .into_iter()
        .map(|(index, words)| {
            let ctx = ctx.clone();
            let emitter = emitter.clone();
            tokio::spawn(async move { name_one_speaker(ctx, index, words, emitter).await })
        })
        .collect();

    for joined in futures_util::future::join_all(handles).await {
        if let Err(e) = joined {
            log::error!("Speaker naming task panicked: {}", e);
        }
    }
}

async fn name_one_speaker(
    ctx: NamingContext,
    speaker_index: i64,
    words: Vec<String>,
    emitter: SseEmitter,
) {
    let name = match infer_speaker_name(&ctx, speaker_index, &words).await {
        Ok(Some(name)) => name,
        Ok(None) => {
            log::info!(
                "No name inferred for speaker {} of transcript {}",
                speaker_index,
                ctx.transcript_id
            );
            return;
        }
        Err(e) => {
            log::warn!(
                "Speaker naming failed for speaker {} of transcript {}: {}",
                speaker_index,
                ctx.transcript_id,
                e
            );
            return;
        }
    };

    if let Err(e) =
        upsert_speaker_with_retry(&ctx.db, ctx.transcript_id, speaker_index, &name).await
    {
        log::warn!(
            "Failed to store name {:?} for speaker {} of transcript {}: {:#}",
            name,
            speaker_index,
            ctx.transcript_id,
            e
        );
        return;
    }

    log::info!(
        "Speaker {} of transcript {} is {:?}",
        speaker_index,
        ctx.transcript_id,
        name
    );
    // The client may be gone by now
    let _ = emitter.speaker(speaker_index, &name);
}

#[derive(Debug, Deserialize)]
struct NameReply {
    #[serde(default)]
    name: String,
}

/// Ask the LLM who this speaker is. `Ok(None)` means it could not tell.
pub(crate) async fn infer_speaker_name(
    ctx: &NamingContext,
    speaker_index: i64,
    words: &[String],
) -> Result<Option<String>, LlmError> {
    let sample = words
        .iter()
        .take(ctx.sample_words)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");

    let description = ctx
        .description
        .as_deref()
        .map(|d| llm::truncate_chars(d.trim(), MAX_DESCRIPTION_CHARS))
        .filter(|d| !d.is_empty())
        .unwrap_or("(no description)");

    let prompt = format!(
        "EPISODE DESCRIPTION:\n{}\n\nSPEAKER: {}\nSAMPLE OF WHAT THIS SPEAKER SAID:\n{}",
        description,
        provisional_name(speaker_index),
        sample
    );

    let request = ChatRequest::classification(
        vec![
            ChatMessage::system(SPEAKER_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ],
        NAME_MAX_TOKENS,
    );

    let reply = llm::chat_with_timeout(ctx.llm.as_ref(), request, ctx.timeout).await?;
    let parsed: NameReply = llm::decode_json(&reply)?;
    Ok(clean_name(&parsed.name, speaker_index))
}

fn clean_name(raw: &str, speaker_index: i64) -> Option<String> {
    let name = raw.trim().trim_matches('"').trim();
    let unusable = name.is_empty()
        || name.eq_ignore_ascii_case("unknown")
        || name.eq_ignore_ascii_case(&provisional_name(speaker_index))
        || name.chars().count() > 100;
    (!unusable).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("  Alice ", 0).as_deref(), Some("Alice"));
        assert_eq!(clean_name("Unknown", 0), None);
        assert_eq!(clean_name("", 0), None);
        assert_eq!(clean_name("Speaker 3", 3), None);
    }

    /// Fails the first `failures` calls, then succeeds.
    fn flaky(failures: u32, calls: &std::cell::Cell<u32>) -> impl FnMut() -> anyhow::Result<()> + '_ {
        move || {
            calls.set(calls.get() + 1);
            if calls.get() <= failures {
                Err(anyhow::anyhow!("database is locked"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_later_attempts() {
        for (failures, waited_ms) in [(0, 0), (1, 100), (2, 300)] {
            let calls = std::cell::Cell::new(0);
            let started = tokio::time::Instant::now();

            retry_with_backoff(flaky(failures, &calls)).await.unwrap();

            assert_eq!(calls.get(), failures + 1);
            assert_eq!(started.elapsed(), Duration::from_millis(waited_ms));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_three_attempts() {
        let calls = std::cell::Cell::new(0);
        let started = tokio::time::Instant::now();

        let err = retry_with_backoff(flaky(10, &calls)).await.unwrap_err();

        assert_eq!(calls.get(), UPSERT_ATTEMPTS);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert!(err.to_string().contains("database is locked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_for_missing_transcript_exhausts_retries() {
        let (db, _temp) = crate::testing::setup_test_db();
        let started = tokio::time::Instant::now();

        // No such transcript: the foreign key rejects every attempt
        let result = upsert_speaker_with_retry(&db, 999, 0, "Alice").await;

        assert!(result.is_err());
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert!(db.get_speakers(999).unwrap().is_empty());
    }

    #[test]
    fn test_provisional_name() {
        assert_eq!(provisional_name(0), "Speaker 0");
        assert_eq!(provisional_name(12), "Speaker 12");
    }
}
