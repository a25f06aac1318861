//! Conversational reply generation.
//!
//! Posts the running conversation to Gemini's generateContent endpoint.
//! The conversation buffer is owned here; a failed turn is rolled back so
//! the next request still alternates user/model roles.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::ChatConfig;
use crate::error::ChatError;

#[async_trait]
pub trait ChatService: Send {
    async fn respond(&mut self, message: &str) -> Result<String, ChatError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

impl Content {
    fn new(role: &str, text: &str) -> Self {
        Self {
            role: role.to_string(),
            parts: vec![Part { text: text.to_string() }],
        }
    }
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

pub struct GeminiChat {
    config: ChatConfig,
    api_key: String,
    client: Client,
    history: Vec<Content>,
}

impl GeminiChat {
    /// Reads the API key from the environment variable named in the config.
    pub fn from_env(config: ChatConfig) -> Result<Self, ChatError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ChatError::MissingApiKey(config.api_key_env.clone()))?;
        Ok(Self::new(config, api_key))
    }

    pub fn new(config: ChatConfig, api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            config,
            api_key,
            client,
            history: Vec::new(),
        }
    }

    pub fn turns(&self) -> usize {
        self.history.len()
    }

    async fn generate(&self) -> Result<String, ChatError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.host.trim_end_matches('/'),
            self.config.model
        );
        let body = json!({ "contents": self.history });

        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ChatError::Status(resp.status().as_u16()));
        }

        let data: GenerateResponse = resp.json().await?;
        let text = data
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyReply);
        }
        Ok(text.to_string())
    }
}

#[async_trait]
impl ChatService for GeminiChat {
    async fn respond(&mut self, message: &str) -> Result<String, ChatError> {
        debug!("Sending to Gemini model '{}': {message}", self.config.model);
        self.history.push(Content::new("user", message));

        match self.generate().await {
            Ok(reply) => {
                debug!("Gemini reply: '{reply}'");
                self.history.push(Content::new("model", &reply));
                Ok(reply)
            }
            Err(e) => {
                warn!("Gemini request failed: {e}");
                self.history.pop();
                Err(e)
            }
        }
    }
}
