use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{BalerError, Result};
use crate::models::{ChatRequest, ChatResponse, Message, ScoredFragment};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrativeStyle {
    #[default]
    Plain,
    Pretentious,
}

impl NarrativeStyle {
    fn system_prompt(self) -> &'static str {
        match self {
            Self::Plain => {
                "You are Baler, a music recommendation assistant. Recommend albums using ONLY \
                 the provided review excerpts and cite the excerpt behind each suggestion. \
                 Keep it short and concrete."
            }
            Self::Pretentious => {
                "You are Baler, a music critic in the style of a Pitchfork reviewer. You are \
                 knowledgeable, a little bit pretentious, and have a distinctive voice. Your \
                 recommendations must be based ONLY on the provided review excerpts. Justify \
                 your suggestions by directly referencing the context. Be concise but opinionated."
            }
        }
    }
}

/// Turns retrieved evidence into a short prose answer. Best effort: callers
/// treat every error as "no narrative".
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(
        &self,
        query: &str,
        fragments: &[ScoredFragment],
        style: NarrativeStyle,
    ) -> Result<String>;
}

/// Chat-completions client for an OpenAI-compatible gateway such as LiteLLM.
pub struct ChatNarrator {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl ChatNarrator {
    pub fn new(base_url: String, api_key: Option<String>, model: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BalerError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }

    pub fn build_request(&self, query: &str, fragments: &[ScoredFragment], style: NarrativeStyle) -> ChatRequest {
        let context = fragments
            .iter()
            .map(|f| {
                format!(
                    "From a review of '{}' by {}:\n...{}...",
                    f.metadata.album_title, f.metadata.artist, f.metadata.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: style.system_prompt().to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: format!("CONTEXT FROM REVIEWS:\n{}\n\nUSER'S QUERY: '{}'", context, query),
                },
            ],
            temperature: Some(0.7),
            max_tokens: Some(600),
        }
    }

    pub async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut req = self.client.post(&url).json(&request);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| BalerError::transient("chat completion", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &error_text));
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| BalerError::transient("chat completion decode", e))
    }
}

fn classify_status(status: StatusCode, body: &str) -> BalerError {
    let message = format!("{} - {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        BalerError::transient("chat completion", message)
    } else {
        BalerError::config(format!("chat completion rejected: {}", message))
    }
}

#[async_trait]
impl Narrator for ChatNarrator {
    async fn narrate(
        &self,
        query: &str,
        fragments: &[ScoredFragment],
        style: NarrativeStyle,
    ) -> Result<String> {
        let request = self.build_request(query, fragments, style);
        tracing::debug!(model = %request.model, fragments = fragments.len(), "requesting narrative");
        let response = self.chat_completion(request).await?;
        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| BalerError::transient("chat completion", "empty response"))
    }
}
