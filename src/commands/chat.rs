use crate::config::{PartialResponsePolicy, TRUNCATION_MARKER};
use crate::embedding::EmbeddingService;
use crate::llm::{ChatMessage, ChatRequest, CompletionService, Role};
use crate::session::{AppContext, Session};
use crate::ui::ChatView;
use tracing::{debug, warn};

pub const NEEDS_UPLOAD: &str = "Please upload and process a PDF first.";

/// How a chat turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The full response, now in history.
    Answered(String),
    /// Retrieval was required but nothing is indexed yet.
    NeedsUpload,
    /// The user-facing error text.
    Failed(String),
}

fn retrieval_context(contents: &[&str]) -> ChatMessage {
    ChatMessage::system(format!("Relevant content:\n{}", contents.join("\n\n")))
}

/// Answer one user message.
///
/// The request is the history so far, then the retrieved context as a
/// system message, then the question. History only changes once the
/// stream has finished, except for what `PartialResponsePolicy` keeps
/// after a failure.
pub async fn send_message<C, E, V>(
    ctx: &AppContext<C, E>,
    session: &mut Session,
    view: &mut V,
    content: &str,
) -> TurnOutcome
where
    C: CompletionService,
    E: EmbeddingService,
    V: ChatView,
{
    let mut messages = session.history.clone();

    if !ctx.settings.plain {
        if !session.has_index() {
            view.error(NEEDS_UPLOAD);
            return TurnOutcome::NeedsUpload;
        }
        let hits = match ctx
            .index
            .search(session.vector_store.as_ref(), content, ctx.settings.top_k)
            .await
        {
            Ok(hits) => hits,
            Err(e) => return fail(view, e.to_string()),
        };
        debug!("retrieved {} chunks for the question", hits.len());
        let contents: Vec<&str> = hits.iter().map(|h| h.document.content.as_str()).collect();
        messages.push(retrieval_context(&contents));
    }
    messages.push(ChatMessage::user(content));

    let request = ChatRequest::new(messages, ctx.settings.chat_model.clone());

    let mut response = String::new();
    view.begin_response();
    let result = ctx
        .completion
        .complete_stream(&request, |chunk| {
            if let Some(delta) = chunk.delta.as_deref().filter(|d| !d.is_empty()) {
                response.push_str(delta);
                view.update_response(&response);
            }
        })
        .await;
    view.end_response();

    match result {
        Ok(_) => {
            session.history.push(ChatMessage::user(content));
            session.history.push(ChatMessage::assistant(response.clone()));
            TurnOutcome::Answered(response)
        }
        Err(e) => {
            if ctx.settings.partial_policy == PartialResponsePolicy::CommitTruncated
                && !response.is_empty()
            {
                session.history.push(ChatMessage::user(content));
                let truncated = format!("{}{}", response, TRUNCATION_MARKER);
                session.history.push(ChatMessage::assistant(truncated));
            }
            fail(view, e.to_string())
        }
    }
}

fn fail<V: ChatView>(view: &mut V, error: String) -> TurnOutcome {
    warn!("chat turn failed: {}", error);
    let message = format!("Error generating response: {}", error);
    view.error(&message);
    TurnOutcome::Failed(message)
}

/// Show every message after the system instruction.
pub fn display_conversation<V: ChatView>(session: &Session, view: &mut V) {
    for message in session.history.iter().filter(|m| m.role != Role::System) {
        view.show_message(message);
    }
}
