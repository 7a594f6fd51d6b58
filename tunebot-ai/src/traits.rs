use async_trait::async_trait;
use serde::{Serialize, Deserialize};

/// One turn of a chat conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }
}

/// Anything that can answer a `chat <text>` command.
#[async_trait]
pub trait ChatResponder: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, messages: Vec<ChatMessage>) -> anyhow::Result<String>;

    /// Single-prompt convenience wrapper around [`ChatResponder::chat`].
    async fn reply(&self, prompt: &str) -> anyhow::Result<String> {
        self.chat(vec![ChatMessage::user(prompt)]).await
    }
}
