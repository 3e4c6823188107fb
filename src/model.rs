//! Chat-model clients.
//!
//! The extractor talks to an abstract [`GenerativeModel`], so tests can
//! substitute a canned model and the production binary can point at OpenAI or
//! any compatible gateway (LiteLLM, Ollama, etc.).

use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
};
use tokio::time;

use crate::prelude::*;

/// A chat model that turns a prompt into text.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Run one system + user exchange and return the raw completion text.
    async fn invoke(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String>;
}

/// A [`GenerativeModel`] backed by the OpenAI chat API, or any compatible
/// gateway.
pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl OpenAiModel {
    /// Create a client for `model`. `OPENAI_API_KEY` must be set;
    /// `OPENAI_API_BASE` optionally points at a compatible gateway.
    pub fn new(model: &str, timeout: Duration) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY must be set to call the model API")?;
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
            config = config.with_api_base(api_base);
        }
        Ok(Self {
            client: Client::with_config(config),
            model: model.to_owned(),
            timeout,
        })
    }
}

#[async_trait]
impl GenerativeModel for OpenAiModel {
    #[instrument(level = "debug", skip_all, fields(model = %self.model))]
    async fn invoke(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system)
                .build()
                .context("error building system message")?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(user)
                .build()
                .context("error building user message")?
                .into(),
        ];
        let req = CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .messages(messages)
            .max_completion_tokens(max_tokens)
            .temperature(temperature)
            .build()
            .context("error building chat request")?;
        trace!(?req, "Chat request");

        let response = time::timeout(self.timeout, self.client.chat().create(req))
            .await
            .map_err(|_| {
                anyhow!("model call timed out after {}s", self.timeout.as_secs())
            })?
            .context("chat completion failed")?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no choices in model response"))?;
        choice
            .message
            .content
            .ok_or_else(|| anyhow!("model response had no content"))
    }
}
