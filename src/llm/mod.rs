//! Chat-completion LLM integration
//!
//! Calls an OpenAI-compatible `/chat/completions` endpoint and hands back the
//! first choice's content. Replies are untrusted text: callers decode them
//! with [`decode_json`], which tolerates code fences and surrounding prose.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Temperature for classification-style calls (naming, grading).
pub const CLASSIFICATION_TEMPERATURE: f32 = 0.3;
/// Temperature for open-ended generation (questions).
pub const GENERATION_TEMPERATURE: f32 = 0.7;

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("LLM returned no response")]
    NoResponse,

    #[error("failed to decode LLM reply: {0}")]
    Decode(String),

    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn classification(messages: Vec<ChatMessage>, max_tokens: u32) -> Self {
        Self {
            messages,
            max_tokens,
            temperature: CLASSIFICATION_TEMPERATURE,
        }
    }

    pub fn generation(messages: Vec<ChatMessage>, max_tokens: u32) -> Self {
        Self {
            messages,
            max_tokens,
            temperature: GENERATION_TEMPERATURE,
        }
    }
}

/// Anything that can answer a chat request with a completion string.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<String, LlmError>;
}

/// Run a chat call under a deadline.
pub async fn chat_with_timeout(
    model: &dyn ChatModel,
    request: ChatRequest,
    timeout: Duration,
) -> Result<String, LlmError> {
    tokio::time::timeout(timeout, model.chat(request))
        .await
        .map_err(|_| LlmError::Timeout(timeout))?
}

// ============================================================================
// HTTP client
// ============================================================================

pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn chat(&self, request: ChatRequest) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        log::debug!(
            "Sending chat request: model={}, messages={}, max_tokens={}",
            self.model,
            request.messages.len(),
            request.max_tokens
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status,
                body: truncate_chars(&body, MAX_ERROR_BODY).to_string(),
            });
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(LlmError::NoResponse)?;

        log::debug!("Chat response received: {} chars", content.len());
        Ok(content)
    }
}

// ============================================================================
// Reply decoding
// ============================================================================

/// Strip surrounding whitespace and a ```` ``` ```` / ```` ```json ```` fence.
pub fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    // Drop the info string ("json", "JSON", ...) up to the first newline
    let body = match rest.find('\n') {
        Some(newline) if !rest[..newline].contains('{') => &rest[newline + 1..],
        _ => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Decode a JSON reply into `T`.
///
/// Tries the fence-stripped reply first, then the first balanced `{...}`
/// object embedded in it.
pub fn decode_json<T: DeserializeOwned>(reply: &str) -> Result<T, LlmError> {
    let stripped = strip_code_fence(reply);

    let first_err = match serde_json::from_str::<T>(stripped) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    if let Some(object) = find_json_object(stripped) {
        if let Ok(value) = serde_json::from_str::<T>(object) {
            return Ok(value);
        }
    }

    Err(LlmError::Decode(first_err.to_string()))
}

/// Locate the first balanced JSON object, skipping braces inside strings.
fn find_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Named {
        name: String,
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```\n"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json{\"a\":1}```"), "{\"a\":1}");
    }

    #[test]
    fn test_decode_json_variants() {
        let direct: Named = decode_json(r#"{"name": "Alice"}"#).unwrap();
        assert_eq!(direct.name, "Alice");

        let fenced: Named = decode_json("```json\n{\"name\": \"Bob\"}\n```").unwrap();
        assert_eq!(fenced.name, "Bob");

        let embedded: Named =
            decode_json(r#"Sure! Here it is: {"name": "Carol {the host}"} Hope that helps."#)
                .unwrap();
        assert_eq!(embedded.name, "Carol {the host}");
    }

    #[test]
    fn test_decode_json_rejects_garbage() {
        let result: Result<Named, _> = decode_json("I could not tell who this is.");
        assert!(matches!(result, Err(LlmError::Decode(_))));

        let wrong_shape: Result<Named, _> = decode_json(r#"{"title": "x"}"#);
        assert!(wrong_shape.is_err());
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_completion_request_shape() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let body = CompletionRequest {
            model: DEFAULT_MODEL,
            messages: &messages,
            temperature: CLASSIFICATION_TEMPERATURE,
            max_tokens: 50,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hi");
        assert_eq!(value["max_tokens"], 50);
    }

    #[test]
    fn test_empty_choices_decode() {
        let parsed: CompletionResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(parsed.choices.is_empty());
    }

    struct Slow;

    #[async_trait]
    impl ChatModel for Slow {
        async fn chat(&self, _request: ChatRequest) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_chat_with_timeout_expires() {
        let request = ChatRequest::classification(vec![ChatMessage::user("hi")], 10);
        let result = chat_with_timeout(&Slow, request, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(LlmError::Timeout(_))));
    }
}
