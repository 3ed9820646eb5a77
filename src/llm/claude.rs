use super::sse::SseBuffer;
use super::{ChatRequest, ChatResponse, LlmError, Role, StreamChunk};
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Serialize)]
struct ClaudeRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ClaudeMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Serialize)]
struct ClaudeMessage {
    role: String,
    content: ClaudeContentIn,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum ClaudeContentIn {
    Text(String),
    Blocks(Vec<ClaudeBlock>),
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeBlock {
    Image { source: ClaudeImageSource },
    Text { text: String },
}

#[derive(Serialize, Debug)]
struct ClaudeImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContent>,
}

#[derive(Deserialize)]
struct ClaudeContent {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ClaudeStreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: ClaudeDelta },
    #[serde(rename = "message_stop")]
    MessageStop {},
    #[serde(rename = "error")]
    Error { error: ClaudeStreamError },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ClaudeDelta {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ClaudeStreamError {
    message: String,
}

/// Claude takes system prompts out of band, so every system message
/// (including retrieved context) is folded into the `system` field.
fn build_request(request: &ChatRequest, stream: bool) -> ClaudeRequest {
    let system_parts: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };

    let last_user = request.messages.iter().rposition(|m| m.role == Role::User);

    let messages: Vec<ClaudeMessage> = request
        .messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role != Role::System)
        .map(|(i, m)| ClaudeMessage {
            role: m.role.as_str().to_string(),
            content: match (&request.image, Some(i) == last_user) {
                (Some(image), true) => ClaudeContentIn::Blocks(vec![
                    ClaudeBlock::Image {
                        source: ClaudeImageSource {
                            kind: "base64",
                            media_type: image.media_type.clone(),
                            data: image.data_base64.clone(),
                        },
                    },
                    ClaudeBlock::Text {
                        text: m.content.clone(),
                    },
                ]),
                _ => ClaudeContentIn::Text(m.content.clone()),
            },
        })
        .collect();

    ClaudeRequest {
        model: request.model.clone(),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        stream,
        system,
    }
}

async fn post(config: &ClaudeConfig, body: &ClaudeRequest) -> Result<reqwest::Response, LlmError> {
    let client = Client::new();
    let resp = client
        .post(format!("{}/v1/messages", config.base_url))
        .header("Content-Type", "application/json")
        .header("x-api-key", &config.api_key)
        .header("anthropic-version", "2023-06-01")
        .json(body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status,
            message: text,
        });
    }
    Ok(resp)
}

pub async fn chat(config: &ClaudeConfig, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
    let body = build_request(request, false);
    let resp = post(config, &body).await?;

    let data: ClaudeResponse = resp
        .json()
        .await
        .map_err(|e| LlmError::Parse(e.to_string()))?;
    let content = data
        .content
        .into_iter()
        .map(|c| c.text)
        .collect::<Vec<_>>()
        .join("");

    Ok(ChatResponse {
        content,
        model: request.model.clone(),
    })
}

/// Drain an SSE body. Only `message_stop` completes the answer; a body
/// that closes before it is an error.
async fn read_stream<S, B, E, F>(stream: S, mut on_chunk: F) -> Result<String, LlmError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    LlmError: From<E>,
    F: FnMut(StreamChunk),
{
    let mut stream = std::pin::pin!(stream);
    let mut full_content = String::new();
    let mut sse = SseBuffer::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;

        for data in sse.push(chunk.as_ref()) {
            let Ok(event) = serde_json::from_str::<ClaudeStreamEvent>(&data) else {
                continue;
            };
            match event {
                ClaudeStreamEvent::ContentBlockDelta { delta } => {
                    if let Some(text) = &delta.text {
                        full_content.push_str(text);
                    }
                    on_chunk(StreamChunk {
                        delta: delta.text,
                        done: false,
                    });
                }
                ClaudeStreamEvent::MessageStop {} => {
                    on_chunk(StreamChunk::done());
                    return Ok(full_content);
                }
                ClaudeStreamEvent::Error { error } => {
                    return Err(LlmError::Api {
                        status: 0,
                        message: error.message,
                    });
                }
                ClaudeStreamEvent::Other => {}
            }
        }
    }

    Err(LlmError::Parse("stream ended before completion".into()))
}

pub async fn chat_stream<F>(
    config: &ClaudeConfig,
    request: &ChatRequest,
    on_chunk: F,
) -> Result<String, LlmError>
where
    F: FnMut(StreamChunk),
{
    let body = build_request(request, true);
    let resp = post(config, &body).await?;
    read_stream(resp.bytes_stream(), on_chunk).await
}
