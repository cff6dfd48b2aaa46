//! Service configuration
//!
//! Values come from the process environment first and fall back to a `.env`
//! file in the working directory.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

const DEFAULT_DATABASE_URL: &str = "sqlite://data/podquiz.db";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_TRANSCRIPTION_BASE_URL: &str = "https://api.deepgram.com/v1";
const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub transcription_api_key: String,
    pub transcription_api_base_url: String,
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let project_dir = Path::new(".");
        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .or_else(|| load_env_value(project_dir, key))
        })
    }

    /// Build a config from any key lookup (environment, `.env`, test maps).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| lookup(key).ok_or_else(|| anyhow!("{} is not set", key));

        let port = match lookup("PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("PORT must be a valid port number, got {:?}", raw))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            port,
            transcription_api_key: required("TRANSCRIPTION_API_KEY")?,
            transcription_api_base_url: base_url(
                lookup("TRANSCRIPTION_API_BASE_URL"),
                DEFAULT_TRANSCRIPTION_BASE_URL,
            ),
            llm_api_key: required("LLM_API_KEY")?,
            llm_api_base_url: base_url(lookup("LLM_API_BASE_URL"), DEFAULT_LLM_BASE_URL),
            llm_model: lookup("LLM_MODEL").unwrap_or_else(|| crate::llm::DEFAULT_MODEL.to_string()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

fn base_url(value: Option<String>, default: &str) -> String {
    value
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Load a value from the .env file by key name
pub fn load_env_value(project_dir: &Path, key: &str) -> Option<String> {
    let env_path = project_dir.join(".env");
    let prefix = format!("{}=", key);
    let content = std::fs::read_to_string(env_path).ok()?;
    content.lines().find_map(|line| {
        let value = line
            .trim()
            .strip_prefix(&prefix)?
            .trim()
            .trim_matches('"')
            .trim_matches('\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}
