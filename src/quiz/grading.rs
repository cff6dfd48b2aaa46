//! Answer grading
//!
//! Option questions are graded by the stored `is_correct` flag; the LLM only
//! writes the feedback. Open-ended answers are judged by the LLM outright.

use std::time::Duration;

use serde::Deserialize;

use super::generation::truncate_transcript;
use crate::database::{Question, QuestionOption};
use crate::llm::{self, ChatMessage, ChatModel, ChatRequest, LlmError};

/// Transcript characters given to the open-ended grader.
pub(crate) const GRADING_TRANSCRIPT_CHARS: usize = 12_000;

const FEEDBACK_MAX_TOKENS: u32 = 150;
const JUDGE_MAX_TOKENS: u32 = 300;

pub(crate) const CORRECT_FALLBACK: &str = "Correct answer!";
pub(crate) const INCORRECT_FALLBACK: &str = "Incorrect answer!";
pub(crate) const GRADING_UNAVAILABLE: &str =
    "Sorry, we couldn't evaluate your answer right now, so it was marked incorrect.";

const FEEDBACK_SYSTEM_PROMPT: &str = "You give short, friendly feedback on quiz answers about a \
podcast episode. In one or two sentences, tell the learner whether they were right and briefly \
explain the correct answer. Reply with plain text only.";

const JUDGE_SYSTEM_PROMPT: &str = "You grade open-ended quiz answers about a podcast episode. \
Judge whether the learner's answer is substantially correct given the question and the \
transcript. Be lenient with wording but strict with facts. Respond with JSON only: \
{\"is_correct\": true or false, \"feedback\": \"one or two sentences for the learner\"}.";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Grade {
    pub is_correct: bool,
    pub feedback: String,
}

/// Grade a selected option. Never fails: LLM trouble only costs the feedback.
pub(crate) async fn grade_choice(
    model: &dyn ChatModel,
    timeout: Duration,
    question: &Question,
    selected: &QuestionOption,
) -> Grade {
    let is_correct = selected.is_correct;
    let correct_text = question
        .options
        .iter()
        .find(|o| o.is_correct)
        .map(|o| o.option_text.as_str())
        .unwrap_or("(none)");

    let prompt = format!(
        "QUESTION: {}\nLEARNER'S ANSWER: {}\nCORRECT ANSWER: {}\nThe learner's answer is {}.",
        question.question_text,
        selected.option_text,
        correct_text,
        if is_correct { "correct" } else { "incorrect" }
    );
    let request = ChatRequest::classification(
        vec![
            ChatMessage::system(FEEDBACK_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ],
        FEEDBACK_MAX_TOKENS,
    );

    let feedback = match llm::chat_with_timeout(model, request, timeout).await {
        Ok(reply) if !llm::strip_code_fence(&reply).is_empty() => {
            llm::strip_code_fence(&reply).to_string()
        }
        Ok(_) => fallback_feedback(is_correct).to_string(),
        Err(e) => {
            log::warn!(
                "Feedback generation failed for question {}, using fallback: {}",
                question.id,
                e
            );
            fallback_feedback(is_correct).to_string()
        }
    };

    Grade {
        is_correct,
        feedback,
    }
}

fn fallback_feedback(is_correct: bool) -> &'static str {
    if is_correct {
        CORRECT_FALLBACK
    } else {
        INCORRECT_FALLBACK
    }
}

#[derive(Debug, Deserialize)]
struct Judgement {
    is_correct: bool,
    #[serde(default)]
    feedback: String,
}

/// Let the LLM judge a free-text answer. On any LLM failure the answer is
/// marked incorrect with an apology.
pub(crate) async fn grade_open_ended(
    model: &dyn ChatModel,
    timeout: Duration,
    question: &Question,
    answer: &str,
    transcript: Option<&str>,
) -> Grade {
    match judge(model, timeout, question, answer, transcript).await {
        Ok(judgement) => {
            let feedback = judgement.feedback.trim();
            Grade {
                is_correct: judgement.is_correct,
                feedback: if feedback.is_empty() {
                    fallback_feedback(judgement.is_correct).to_string()
                } else {
                    feedback.to_string()
                },
            }
        }
        Err(e) => {
            log::warn!("Open-ended grading failed for question {}: {}", question.id, e);
            Grade {
                is_correct: false,
                feedback: GRADING_UNAVAILABLE.to_string(),
            }
        }
    }
}

async fn judge(
    model: &dyn ChatModel,
    timeout: Duration,
    question: &Question,
    answer: &str,
    transcript: Option<&str>,
) -> Result<Judgement, LlmError> {
    let context = transcript
        .map(|t| truncate_transcript(t, GRADING_TRANSCRIPT_CHARS))
        .unwrap_or_else(|| "(transcript unavailable)".to_string());

    let prompt = format!(
        "---\nTRANSCRIPT:\n{}\n---\n\nQUESTION: {}\nLEARNER'S ANSWER: {}",
        context, question.question_text, answer
    );
    let request = ChatRequest::classification(
        vec![
            ChatMessage::system(JUDGE_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ],
        JUDGE_MAX_TOKENS,
    );

    let reply = llm::chat_with_timeout(model, request, timeout).await?;
    llm::decode_json(&reply)
}
