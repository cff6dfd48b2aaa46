//! LLM question generation from a finished transcript

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::database::{Database, Question, QuestionType, TranscriptStatus};
use crate::error::AppError;
use crate::llm::{self, ChatMessage, ChatModel, ChatRequest};

/// Transcript characters sent with a generation request.
pub(crate) const GENERATION_TRANSCRIPT_CHARS: usize = 24_000;
pub(crate) const TRUNCATION_MARKER: &str = "\n\n[Transcript truncated]";

const GENERATION_MAX_TOKENS: u32 = 1500;

pub(crate) const GENERATION_SYSTEM_PROMPT: &str = r#"You write comprehension quizzes for podcast episodes.
Using only the transcript you are given, write exactly three questions:
1. one "multiple_choice" question with exactly 4 options, exactly one of them correct;
2. one "true_false" question with exactly 2 options, "True" and "False", exactly one of them correct;
3. one "open_ended" question with no options.

Respond with a JSON object only, no prose, in this shape:
{
  "questions": [
    {
      "question_text": "...",
      "type": "multiple_choice",
      "options": [
        {"option_text": "...", "is_correct": false},
        {"option_text": "...", "is_correct": true},
        {"option_text": "...", "is_correct": false},
        {"option_text": "...", "is_correct": false}
      ]
    },
    {
      "question_text": "...",
      "type": "true_false",
      "options": [
        {"option_text": "True", "is_correct": true},
        {"option_text": "False", "is_correct": false}
      ]
    },
    {
      "question_text": "...",
      "type": "open_ended",
      "options": []
    }
  ]
}"#;

#[derive(Debug, Deserialize)]
struct GeneratedQuiz {
    #[serde(default)]
    questions: Vec<GeneratedQuestion>,
}

#[derive(Debug, Deserialize)]
struct GeneratedQuestion {
    #[serde(default, alias = "question")]
    question_text: String,
    #[serde(default, rename = "type")]
    question_type: String,
    #[serde(default)]
    options: Vec<GeneratedOption>,
}

#[derive(Debug, Deserialize)]
struct GeneratedOption {
    #[serde(default, alias = "text")]
    option_text: String,
    #[serde(default)]
    is_correct: bool,
}

/// Full text of the episode's transcript if it is complete: chunk texts
/// joined by single spaces.
pub(crate) fn transcript_text(db: &Database, episode_id: i64) -> Result<Option<String>> {
    let Some(transcript) = db.get_transcript_by_episode(episode_id)? else {
        return Ok(None);
    };
    if transcript.status != TranscriptStatus::Complete {
        return Ok(None);
    }

    let text = db
        .get_chunks(transcript.id)?
        .into_iter()
        .map(|chunk| chunk.text)
        .collect::<Vec<_>>()
        .join(" ");
    Ok(Some(text))
}

/// Cut long transcripts on a char boundary and mark the cut.
pub(crate) fn truncate_transcript(text: &str, max_chars: usize) -> String {
    let truncated = llm::truncate_chars(text, max_chars);
    if truncated.len() < text.len() {
        format!("{}{}", truncated, TRUNCATION_MARKER)
    } else {
        text.to_string()
    }
}

/// Replace the episode's questions with a freshly generated set.
///
/// Returns the persisted questions in position order.
pub(crate) async fn generate_questions(
    db: &Database,
    model: &dyn ChatModel,
    timeout: Duration,
    episode_id: i64,
) -> Result<Vec<Question>, AppError> {
    let text = transcript_text(db, episode_id)?
        .ok_or_else(|| AppError::Validation("transcript must be complete".to_string()))?;

    // Regeneration is destructive
    let removed = db.delete_questions_by_episode(episode_id)?;
    if removed > 0 {
        log::info!(
            "Removed {} old questions for episode {} before regenerating",
            removed,
            episode_id
        );
    }

    log::info!(
        "Generating questions for episode {} from {} transcript chars",
        episode_id,
        text.len()
    );

    let request = ChatRequest::generation(
        vec![
            ChatMessage::system(GENERATION_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "---\nTRANSCRIPT:\n{}\n---",
                truncate_transcript(&text, GENERATION_TRANSCRIPT_CHARS)
            )),
        ],
        GENERATION_MAX_TOKENS,
    );
    let reply = llm::chat_with_timeout(model, request, timeout).await?;
    let quiz: GeneratedQuiz = llm::decode_json(&reply)?;

    let mut position = 0i64;
    for generated in quiz.questions {
        let question_text = generated.question_text.trim();
        let Some(question_type) = QuestionType::parse(&generated.question_type) else {
            log::warn!(
                "Skipping generated question with unknown type {:?}",
                generated.question_type
            );
            continue;
        };
        if question_text.is_empty() {
            log::warn!("Skipping generated {} question with no text", question_type);
            continue;
        }
        if let Err(reason) = check_options(question_type, &generated.options) {
            log::warn!("Skipping generated {} question: {}", question_type, reason);
            continue;
        }

        let question_id = db.create_question(episode_id, question_text, question_type, position)?;
        position += 1;

        if !question_type.has_options() {
            continue;
        }
        for (i, option) in generated.options.iter().enumerate() {
            if let Err(e) = db.create_question_option(
                question_id,
                option.option_text.trim(),
                i as i64,
                option.is_correct,
            ) {
                log::warn!(
                    "Failed to save option {} of question {}: {:#}",
                    i,
                    question_id,
                    e
                );
            }
        }
    }

    if position == 0 {
        return Err(AppError::Upstream(
            "LLM returned no usable questions".to_string(),
        ));
    }

    log::info!("Saved {} questions for episode {}", position, episode_id);
    Ok(db.get_questions_by_episode(episode_id)?)
}

/// Option-set rules per question type. Open-ended options are ignored.
fn check_options(question_type: QuestionType, options: &[GeneratedOption]) -> Result<(), String> {
    let correct = options.iter().filter(|o| o.is_correct).count();
    let blank = options.iter().any(|o| o.option_text.trim().is_empty());

    match question_type {
        QuestionType::OpenEnded => Ok(()),
        QuestionType::MultipleChoice if options.len() < 2 => {
            Err(format!("needs at least 2 options, got {}", options.len()))
        }
        QuestionType::TrueFalse if options.len() != 2 => {
            Err(format!("needs exactly 2 options, got {}", options.len()))
        }
        _ if correct != 1 => Err(format!("needs exactly one correct option, got {}", correct)),
        _ if blank => Err("has a blank option".to_string()),
        _ => Ok(()),
    }
}
