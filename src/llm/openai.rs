use super::sse::SseBuffer;
use super::{ChatMessage, ChatRequest, ChatResponse, LlmError, StreamChunk};
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

impl OpenAiConfig {
    /// Ollama serves the OpenAI wire format under `/v1` and needs no key.
    pub fn ollama(host: &str) -> Self {
        Self {
            api_key: String::new(),
            base_url: format!("{}/v1", host.trim_end_matches('/')),
        }
    }
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: String,
    content: OpenAiContent,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiPart>),
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAiPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
}

#[derive(Serialize, Debug, PartialEq)]
struct OpenAiImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamResponse {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

/// Build the wire body. The image, if any, rides on the last user message.
fn build_request(request: &ChatRequest, stream: bool) -> OpenAiRequest {
    let last_user = request
        .messages
        .iter()
        .rposition(|m| m.role == super::Role::User);

    let messages = request
        .messages
        .iter()
        .enumerate()
        .map(|(i, m)| OpenAiMessage {
            role: m.role.as_str().to_string(),
            content: match (&request.image, Some(i) == last_user) {
                (Some(image), true) => content_with_image(m, image.data_url()),
                _ => OpenAiContent::Text(m.content.clone()),
            },
        })
        .collect();

    OpenAiRequest {
        model: request.model.clone(),
        messages,
        stream,
        max_tokens: request.max_tokens,
    }
}

fn content_with_image(message: &ChatMessage, url: String) -> OpenAiContent {
    OpenAiContent::Parts(vec![
        OpenAiPart::Text {
            text: message.content.clone(),
        },
        OpenAiPart::ImageUrl {
            image_url: OpenAiImageUrl { url },
        },
    ])
}

async fn post(
    config: &OpenAiConfig,
    body: &OpenAiRequest,
) -> Result<reqwest::Response, LlmError> {
    let client = Client::new();
    let mut req = client
        .post(format!("{}/chat/completions", config.base_url))
        .header("Content-Type", "application/json")
        .json(body);

    if !config.api_key.is_empty() {
        req = req.header("Authorization", format!("Bearer {}", config.api_key));
    }

    let resp = req.send().await?;

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

pub async fn chat(config: &OpenAiConfig, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
    let body = build_request(request, false);
    let resp = post(config, &body).await?;

    let data: OpenAiResponse = resp
        .json()
        .await
        .map_err(|e| LlmError::Parse(e.to_string()))?;
    let content = data
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();

    Ok(ChatResponse {
        content,
        model: request.model.clone(),
    })
}

#[derive(Deserialize)]
struct OpenAiStreamError {
    error: OpenAiErrorBody,
}

#[derive(Deserialize)]
struct OpenAiErrorBody {
    message: String,
}

/// What one SSE payload means for the caller.
#[derive(Debug, PartialEq)]
enum StreamEvent {
    Delta(Option<String>),
    Finished(Option<String>),
    Done,
    /// In-band error reported after the response headers were sent.
    Failed(String),
    Skip,
}

fn parse_stream_payload(data: &str) -> StreamEvent {
    if data == "[DONE]" {
        return StreamEvent::Done;
    }
    match serde_json::from_str::<OpenAiStreamResponse>(data) {
        Ok(parsed) => match parsed.choices.into_iter().next() {
            Some(choice) if choice.finish_reason.is_some() => {
                StreamEvent::Finished(choice.delta.content)
            }
            Some(choice) => StreamEvent::Delta(choice.delta.content),
            None => StreamEvent::Skip,
        },
        Err(e) => match serde_json::from_str::<OpenAiStreamError>(data) {
            Ok(failure) => StreamEvent::Failed(failure.error.message),
            Err(_) => {
                debug!("skipping unparseable stream payload: {}", e);
                StreamEvent::Skip
            }
        },
    }
}

/// Feed one payload through; `Some` once the stream has reached its end.
fn apply_payload<F>(
    data: &str,
    full_content: &mut String,
    on_chunk: &mut F,
) -> Option<Result<(), LlmError>>
where
    F: FnMut(StreamChunk),
{
    match parse_stream_payload(data) {
        StreamEvent::Delta(delta) => {
            if let Some(content) = &delta {
                full_content.push_str(content);
            }
            on_chunk(StreamChunk { delta, done: false });
            None
        }
        StreamEvent::Finished(delta) => {
            if let Some(content) = &delta {
                full_content.push_str(content);
                on_chunk(StreamChunk { delta, done: false });
            }
            on_chunk(StreamChunk::done());
            Some(Ok(()))
        }
        StreamEvent::Done => {
            on_chunk(StreamChunk::done());
            Some(Ok(()))
        }
        StreamEvent::Failed(message) => Some(Err(LlmError::Api { status: 0, message })),
        StreamEvent::Skip => None,
    }
}

/// Drain an SSE body. A body that closes before `finish_reason` or
/// `[DONE]` is an error: the answer is incomplete.
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
            if let Some(end) = apply_payload(&data, &mut full_content, &mut on_chunk) {
                return end.map(|()| full_content);
            }
        }
    }

    if let Some(data) = sse.finish() {
        if let Some(end) = apply_payload(&data, &mut full_content, &mut on_chunk) {
            return end.map(|()| full_content);
        }
    }
    Err(LlmError::Parse("stream ended before completion".into()))
}

pub async fn chat_stream<F>(
    config: &OpenAiConfig,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ImageAttachment;

    #[test]
    fn test_plain_request_serializes_text_content() {
        let request = ChatRequest::new(
            vec![ChatMessage::system("be brief"), ChatMessage::user("hello")],
            "gpt-4.1-nano",
        );
        let body = serde_json::to_value(build_request(&request, true)).unwrap();
        assert_eq!(body["model"], "gpt-4.1-nano");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_image_attaches_to_last_user_message() {
        let mut request = ChatRequest::new(
            vec![
                ChatMessage::user("first"),
                ChatMessage::user("Describe this image from the PDF:"),
            ],
            "gpt-4.1-nano",
        );
        request.max_tokens = Some(300);
        request.image = Some(ImageAttachment::png("AAAA".into()));

        let body = serde_json::to_value(build_request(&request, false)).unwrap();
        assert_eq!(body["max_tokens"], 300);
        assert_eq!(body["messages"][0]["content"], "first");
        let parts = &body["messages"][1]["content"];
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_parse_stream_payloads() {
        assert_eq!(parse_stream_payload("[DONE]"), StreamEvent::Done);
        let hi = r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        assert_eq!(parse_stream_payload(hi), StreamEvent::Delta(Some("Hi".into())));
        let role = r#"{"choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#;
        assert_eq!(parse_stream_payload(role), StreamEvent::Delta(None));
        assert_eq!(
            parse_stream_payload(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            StreamEvent::Finished(None)
        );
        assert_eq!(parse_stream_payload("not json"), StreamEvent::Skip);
        assert_eq!(parse_stream_payload(r#"{"choices":[]}"#), StreamEvent::Skip);
        let failure = r#"{"error":{"message":"server_error","type":"server_error"}}"#;
        assert_eq!(parse_stream_payload(failure), StreamEvent::Failed("server_error".into()));
    }

    fn body(chunks: &[&'static str]) -> impl Stream<Item = Result<&'static [u8], LlmError>> {
        let chunks: Vec<_> = chunks.iter().map(|&c| Ok(c.as_bytes())).collect();
        futures::stream::iter(chunks)
    }

    const PARTIAL: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n";
    const SERVER_ERROR: &str = "data: {\"error\":{\"message\":\"server_error\"}}\n\n";

    #[tokio::test]
    async fn test_read_stream_until_done() {
        let sent = body(&[
            PARTIAL,
            r#"data: {"choices":[{"delta":{"content":"tial"},"#,
            "\"finish_reason\":null}]}\n\ndata: [DONE]\n\n",
        ]);
        let mut chunks = Vec::new();
        let result = read_stream(sent, |chunk| chunks.push(chunk)).await;
        assert_eq!(result.unwrap(), "partial");
        assert_eq!(chunks.last(), Some(&StreamChunk::done()));
    }

    #[tokio::test]
    async fn test_in_band_error_fails_the_stream() {
        let sent = body(&[PARTIAL, SERVER_ERROR]);
        let mut deltas = Vec::new();
        let result = read_stream(sent, |chunk| deltas.extend(chunk.delta)).await;
        match result {
            Err(LlmError::Api { message, .. }) => assert_eq!(message, "server_error"),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(deltas, vec!["par".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_closed_early_is_an_error() {
        let result = read_stream(body(&[PARTIAL]), |_| {}).await;
        assert!(matches!(result, Err(LlmError::Parse(_))));
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream() {
        let chunks = vec![
            Ok(PARTIAL.as_bytes()),
            Err(LlmError::Parse("connection reset".into())),
        ];
        let result = read_stream(futures::stream::iter(chunks), |_| {}).await;
        assert!(matches!(result, Err(LlmError::Parse(m)) if m == "connection reset"));
    }

    #[tokio::test]
    async fn test_unterminated_final_payload_still_finishes() {
        let last = r#"data: {"choices":[{"delta":{"content":"ok"},"finish_reason":"stop"}]}"#;
        let result = read_stream(body(&[last]), |_| {}).await;
        assert_eq!(result.unwrap(), "ok");
    }
}
