pub mod claude;
pub mod openai;
mod sse;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// An image sent alongside the last user message (captioning).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAttachment {
    pub media_type: String,
    pub data_base64: String,
}

impl ImageAttachment {
    pub fn png(data_base64: String) -> Self {
        Self {
            media_type: "image/png".to_string(),
            data_base64,
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data_base64)
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub image: Option<ImageAttachment>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            max_tokens: None,
            image: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
}

/// One step of a streamed completion. `delta` is `None` for role-only or
/// keep-alive events; consumers treat `None` and `""` alike.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub delta: Option<String>,
    pub done: bool,
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            delta: None,
            done: true,
        }
    }
}

/// Anything that can answer a chat request, either in one piece or as a
/// stream of deltas handed to `on_chunk`.
#[allow(async_fn_in_trait)]
pub trait CompletionService {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Returns the full text once the stream is exhausted. Deltas already
    /// handed to `on_chunk` stay delivered when this returns an error.
    async fn complete_stream<F>(
        &self,
        request: &ChatRequest,
        on_chunk: F,
    ) -> Result<String, LlmError>
    where
        F: FnMut(StreamChunk);
}

/// Chat backends. OpenAI-compatible servers (including Ollama) share one client.
#[derive(Debug, Clone)]
pub enum Provider {
    OpenAi(openai::OpenAiConfig),
    Claude(claude::ClaudeConfig),
    Ollama(openai::OpenAiConfig),
}

impl Provider {
    pub fn openai(api_key: String) -> Self {
        Provider::OpenAi(openai::OpenAiConfig {
            api_key,
            base_url: openai::DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn claude(api_key: String) -> Self {
        Provider::Claude(claude::ClaudeConfig {
            api_key,
            base_url: claude::DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn ollama(host: &str) -> Self {
        Provider::Ollama(openai::OpenAiConfig::ollama(host))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAi(_) => "openai",
            Provider::Claude(_) => "claude",
            Provider::Ollama(_) => "ollama",
        }
    }
}

impl CompletionService for Provider {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        match self {
            Provider::OpenAi(config) | Provider::Ollama(config) => {
                openai::chat(config, request).await
            }
            Provider::Claude(config) => claude::chat(config, request).await,
        }
    }

    async fn complete_stream<F>(
        &self,
        request: &ChatRequest,
        on_chunk: F,
    ) -> Result<String, LlmError>
    where
        F: FnMut(StreamChunk),
    {
        match self {
            Provider::OpenAi(config) | Provider::Ollama(config) => {
                openai::chat_stream(config, request, on_chunk).await
            }
            Provider::Claude(config) => claude::chat_stream(config, request, on_chunk).await,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
}
