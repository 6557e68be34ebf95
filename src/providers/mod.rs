//! Response generation backends.
//!
//! The engine treats reply production as an opaque capability behind the
//! [`ResponseGenerator`] trait: it hands over the merged turn text plus
//! conversation history and gets back either a reply or `None`, where
//! `None` means "stay silent" and is a valid outcome, not a failure. The
//! bundled implementation speaks the OpenAI-compatible chat completions
//! API that most inference providers expose.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::GeneratorConfig;
use crate::engine::event::MediaRef;

/// A single message in a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Raw token counts reported by the provider, if available.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Media the generator wants sent alongside its text.
#[derive(Debug, Clone)]
pub struct OutboundMedia {
    pub url: String,
    pub caption: Option<String>,
}

/// A produced reply.
#[derive(Debug, Clone)]
pub struct GeneratedReply {
    pub text: String,
    pub media: Vec<OutboundMedia>,
    pub usage: TokenUsage,
    pub model_id: String,
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Produce a reply for one merged turn. `Ok(None)` means the generator
    /// chose not to answer.
    async fn generate(
        &self,
        turn_text: &str,
        history: &[ChatMessage],
    ) -> anyhow::Result<Option<GeneratedReply>>;

    /// Turn a media attachment into a short textual description that can
    /// stand in for it inside the turn text.
    async fn describe_media(&self, media: &MediaRef) -> anyhow::Result<String>;
}

// ── OpenAI-compatible implementation ──────────────────────────────

/// Speaks the `/v1/chat/completions` wire format shared by most providers.
pub struct OpenAiCompatibleGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: String,
    temperature: f64,
}

#[derive(Serialize)]
struct CompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    temperature: f64,
}

#[derive(Deserialize)]
struct CompletionsResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageBody>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

impl OpenAiCompatibleGenerator {
    pub fn new(cfg: &GeneratorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: cfg.api_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            system_prompt: cfg.system_prompt.clone(),
            temperature: cfg.temperature,
        }
    }

    /// Build the completions URL, tolerating base URLs that already carry
    /// the full endpoint path.
    fn completions_url(&self) -> String {
        if self.base_url.ends_with("/chat/completions") {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    async fn post_completions(
        &self,
        messages: Vec<serde_json::Value>,
    ) -> anyhow::Result<CompletionsResponse> {
        let request = CompletionsRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };
        let mut builder = self.client.post(self.completions_url()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "completions request failed: {status} — {}",
                crate::util::truncate_with_ellipsis(&body, 200)
            );
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ResponseGenerator for OpenAiCompatibleGenerator {
    async fn generate(
        &self,
        turn_text: &str,
        history: &[ChatMessage],
    ) -> anyhow::Result<Option<GeneratedReply>> {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": self.system_prompt,
        })];
        for entry in history {
            messages.push(serde_json::json!({
                "role": entry.role,
                "content": entry.content,
            }));
        }
        messages.push(serde_json::json!({
            "role": "user",
            "content": turn_text,
        }));

        let body = self.post_completions(messages).await?;
        let content = body
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        // An empty completion is the provider's way of declining.
        if content.trim().is_empty() {
            return Ok(None);
        }

        let usage = body.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        });
        Ok(Some(GeneratedReply {
            text: content,
            media: Vec::new(),
            usage,
            model_id: body.model.unwrap_or_else(|| self.model.clone()),
        }))
    }

    async fn describe_media(&self, media: &MediaRef) -> anyhow::Result<String> {
        let messages = vec![serde_json::json!({
            "role": "user",
            "content": [
                {"type": "image_url", "image_url": {"url": media.url}},
                {"type": "text", "text": "Describe this attachment in one short sentence."}
            ],
        })];
        let body = self.post_completions(messages).await?;
        Ok(body
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}
