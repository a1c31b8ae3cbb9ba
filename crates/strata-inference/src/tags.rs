//! Best-effort tag extraction over capture content.
//!
//! Tagging runs inside the finalize step of the import pipeline but is
//! never allowed to fail it: every provider or parse failure is folded
//! into a [`TagOutcome`] warning and the step carries on.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use strata_core::{defaults, Error, Result, TagExtractor, TagOutcome};

/// Configuration for the Ollama-backed tag extractor.
#[derive(Debug, Clone)]
pub struct TagConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Tags kept from one extraction; anything past this is dropped.
    pub max_tags: usize,
    /// Messages sampled into the prompt, from the front of the capture.
    pub sample_messages: usize,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::OLLAMA_URL.to_string(),
            model: defaults::TAG_MODEL.to_string(),
            timeout_secs: defaults::TAG_TIMEOUT_SECS,
            max_tags: defaults::TAG_MAX_COUNT,
            sample_messages: defaults::TAG_SAMPLE_MESSAGES,
        }
    }
}

impl TagConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("OLLAMA_BASE").unwrap_or(defaults.base_url),
            model: std::env::var("STRATA_TAG_MODEL").unwrap_or(defaults.model),
            timeout_secs: std::env::var("STRATA_TAG_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            max_tags: defaults.max_tags,
            sample_messages: defaults.sample_messages,
        }
    }
}

/// Ollama-backed tag extractor.
pub struct OllamaTagExtractor {
    client: Client,
    config: TagConfig,
}

impl OllamaTagExtractor {
    pub fn new(config: TagConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(TagConfig::from_env())
    }

    fn build_prompt(&self, title: Option<&str>, messages: &[String]) -> String {
        let mut prompt = String::new();
        if let Some(title) = title {
            prompt.push_str(&format!("Title: {}\n\n", title));
        }
        prompt.push_str("Transcript sample:\n");
        for message in messages.iter().take(self.config.sample_messages) {
            // Long messages blow the prompt budget without adding topics.
            let excerpt: String = message.chars().take(500).collect();
            prompt.push_str(&excerpt);
            prompt.push('\n');
        }
        prompt.push_str(&format!(
            "\nExtract up to {} short topical tags for this conversation. \
             Respond with JSON: {{\"tags\": [...], \"suggestions\": [...]}} where \
             \"tags\" are confident topic labels and \"suggestions\" are tentative ones.",
            self.config.max_tags
        ));
        prompt
    }

    async fn try_extract(&self, title: Option<&str>, messages: &[String]) -> Result<TagOutcome> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "You label conversation transcripts with short lowercase topic tags."
                        .to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: self.build_prompt(title, messages),
                },
            ],
            stream: false,
            format: serde_json::json!("json"),
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.config.base_url))
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::ExternalService(format!("tag request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ExternalService(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::ExternalService(format!("failed to parse chat response: {}", e)))?;

        let payload: TagPayload = serde_json::from_str(&result.message.content)
            .map_err(|e| Error::ExternalService(format!("model returned non-JSON tags: {}", e)))?;

        Ok(TagOutcome {
            tags: normalize_tags(payload.tags, self.config.max_tags),
            suggestions: normalize_tags(payload.suggestions, self.config.max_tags),
            warning: None,
        })
    }
}

/// Lowercase, kebab-case and dedupe raw model labels, dropping empties
/// and truncating to `max`.
pub fn normalize_tags(raw: Vec<String>, max: usize) -> Vec<String> {
    let mut seen = Vec::new();
    for tag in raw {
        let cleaned: String = tag
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_whitespace() { '-' } else { c })
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        let cleaned = cleaned.trim_matches('-').to_string();
        if !cleaned.is_empty() && !seen.contains(&cleaned) {
            seen.push(cleaned);
        }
        if seen.len() >= max {
            break;
        }
    }
    seen
}

#[async_trait]
impl TagExtractor for OllamaTagExtractor {
    #[instrument(skip(self, title, messages), fields(subsystem = "inference", component = "tags", op = "extract", model = %self.config.model, message_count = messages.len()))]
    async fn extract(&self, title: Option<&str>, messages: &[String]) -> TagOutcome {
        if title.is_none() && messages.is_empty() {
            return TagOutcome::default();
        }

        match self.try_extract(title, messages).await {
            Ok(outcome) => {
                debug!(
                    tag_count = outcome.tags.len(),
                    suggestion_count = outcome.suggestions.len(),
                    "Tag extraction complete"
                );
                outcome
            }
            Err(e) => {
                warn!(error = %e, "Tag extraction failed; continuing without tags");
                TagOutcome {
                    warning: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct TagPayload {
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
}
