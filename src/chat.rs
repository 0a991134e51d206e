//! Text chat with a rolling history window
//!
//! Each request carries the most recent turns of the conversation plus the
//! new user message. The reply is appended to history only if the request
//! succeeds.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::ChatConfig;
use crate::{Error, Result};

/// Generative Language REST base URL
pub const API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The person chatting
    User,
    /// The assistant
    Model,
}

/// One message in the conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    /// Author of the turn
    pub role: Role,
    /// Plain text of the turn
    pub text: String,
}

impl Turn {
    /// A turn written by the user
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    /// A turn written by the assistant
    #[must_use]
    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// Produces a reply for a list of turns
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Generate the next model turn
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the reply has no text
    async fn generate(&self, system_instruction: Option<&str>, turns: &[Turn]) -> Result<String>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<RequestContent<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
    parts: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<crate::session::Content>,
}

impl GenerateResponse {
    /// Concatenated text of the first candidate
    fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect();
        (!text.trim().is_empty()).then_some(text)
    }
}

fn build_request<'a>(
    system_instruction: Option<&'a str>,
    turns: &'a [Turn],
) -> GenerateRequest<'a> {
    GenerateRequest {
        contents: turns
            .iter()
            .map(|turn| RequestContent {
                role: Some(turn.role),
                parts: [TextPart { text: &turn.text }],
            })
            .collect(),
        system_instruction: system_instruction.map(|text| RequestContent {
            role: None,
            parts: [TextPart { text }],
        }),
    }
}

/// `generateContent` over HTTPS
pub struct GeminiChat {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
}

impl GeminiChat {
    /// Create a backend for `model`
    #[must_use]
    pub fn new(api_key: &SecretString, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key.expose_secret().to_string()),
            base_url: API_BASE_URL.to_string(),
            model: model.into(),
        }
    }

    /// Override the REST base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        let model = self.model.trim_start_matches("models/");
        format!(
            "{}/models/{model}:generateContent",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatBackend for GeminiChat {
    async fn generate(&self, system_instruction: Option<&str>, turns: &[Turn]) -> Result<String> {
        let body = build_request(system_instruction, turns);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Chat(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            tracing::debug!(%status, %detail, "chat request rejected");
            return Err(Error::Chat(format!("service returned {status}")));
        }

        let reply: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::Chat(format!("invalid response: {e}")))?;

        reply
            .text()
            .ok_or_else(|| Error::Chat("reply contained no text".to_string()))
    }
}

/// A text conversation
pub struct ChatSession<B> {
    backend: B,
    system_instruction: Option<String>,
    history: Vec<Turn>,
    window: usize,
}

impl<B: ChatBackend> ChatSession<B> {
    /// Start an empty conversation
    #[must_use]
    pub fn new(backend: B, config: &ChatConfig, system_instruction: Option<String>) -> Self {
        Self {
            backend,
            system_instruction,
            history: Vec::new(),
            window: config.history_turns,
        }
    }

    /// Send a user message and return the reply
    ///
    /// # Errors
    ///
    /// Returns `Error::Chat` if the message is blank or the backend fails;
    /// history is unchanged in that case
    pub async fn send(&mut self, message: &str) -> Result<String> {
        let message = message.trim();
        if message.is_empty() {
            return Err(Error::Chat("message is empty".to_string()));
        }

        let mut turns = self.recent().to_vec();
        turns.push(Turn::user(message));

        tracing::debug!(
            turns = turns.len(),
            history = self.history.len(),
            "sending chat request"
        );
        let reply = self
            .backend
            .generate(self.system_instruction.as_deref(), &turns)
            .await?;

        self.history.push(Turn::user(message));
        self.history.push(Turn::model(reply.clone()));
        Ok(reply)
    }

    /// Turns that accompany the next request
    #[must_use]
    pub fn recent(&self) -> &[Turn] {
        let skip = self.history.len().saturating_sub(self.window);
        &self.history[skip..]
    }

    /// Full conversation so far
    #[must_use]
    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// Forget the conversation
    pub fn clear(&mut self) {
        self.history.clear();
    }
}
