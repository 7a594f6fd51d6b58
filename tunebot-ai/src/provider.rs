use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::models::ProviderConfig;
use crate::traits::{ChatMessage, ChatResponder};

/// OpenAI-compatible chat completion provider
pub struct OpenAIProvider {
    config: ProviderConfig,
    client: Client,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider with the given configuration
    pub fn new(config: ProviderConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { config, client }
    }

    fn build_payload(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let mut all_messages = Vec::new();

        // Add system message from config if not already present
        let has_system_message = messages.iter().any(|msg| msg.role == "system");
        if !has_system_message {
            if let Some(system_prompt) = &self.config.system_prompt {
                all_messages.push(json!({
                    "role": "system",
                    "content": system_prompt
                }));
            }
        }

        all_messages.extend(messages.iter().map(|msg| {
            json!({
                "role": msg.role,
                "content": msg.content
            })
        }));

        json!({
            "model": self.config.default_model,
            "messages": all_messages,
            "max_tokens": self.config.max_tokens,
        })
    }
}

/// Pulls the first choice's content out of a chat completion body.
pub fn extract_content(data: &serde_json::Value) -> anyhow::Result<String> {
    // Check for API errors
    if let Some(error) = data.get("error") {
        tracing::error!("API returned error: {:?}", error);
        let error_message = error.get("message").and_then(|m| m.as_str()).unwrap_or("Unknown error");
        return Err(anyhow::anyhow!("API error: {}", error_message));
    }

    let choices = data
        .get("choices")
        .and_then(|c| c.as_array())
        .ok_or_else(|| anyhow::anyhow!("Response missing 'choices' array"))?;

    let first = choices
        .first()
        .ok_or_else(|| anyhow::anyhow!("No completions returned"))?;

    let message = first
        .get("message")
        .ok_or_else(|| anyhow::anyhow!("Response choice missing 'message'"))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Response message missing 'content'"))?
        .trim()
        .to_string();

    Ok(content)
}

#[async_trait]
impl ChatResponder for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> anyhow::Result<String> {
        let api_base = self.config.api_base();
        let request_payload = self.build_payload(&messages);

        tracing::debug!("Making API call to {}/chat/completions", api_base);

        let response = self.client
            .post(format!("{}/chat/completions", api_base))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request_payload)
            .send()
            .await?;

        // Get the raw response text first for better error handling
        let response_text = response.text().await?;
        tracing::trace!("Raw API response: {}", response_text);

        let data = match serde_json::from_str::<serde_json::Value>(&response_text) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to parse API response as JSON: {:?}", e);
                return Err(anyhow::anyhow!("API returned non-JSON response: {}", e));
            }
        };

        extract_content(&data)
    }
}
