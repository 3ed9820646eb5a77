//! Scripted completion backend for handler tests.

use super::{ChatRequest, ChatResponse, CompletionService, LlmError, StreamChunk};
use std::cell::RefCell;

#[derive(Debug, Default)]
pub struct ScriptedCompletion {
    /// Deltas replayed by every streamed call.
    pub deltas: Vec<Option<String>>,
    /// Fail after replaying the deltas.
    pub fail_with: Option<String>,
    /// Answer for non-streamed calls (captions).
    pub caption: String,
    pub requests: RefCell<Vec<ChatRequest>>,
}

impl ScriptedCompletion {
    pub fn streaming(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| Some(d.to_string())).collect(),
            caption: "an image".into(),
            ..Self::default()
        }
    }

    pub fn failing_after(deltas: &[&str], message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::streaming(deltas)
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.borrow().last().cloned()
    }
}

impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.requests.borrow_mut().push(request.clone());
        Ok(ChatResponse {
            content: self.caption.clone(),
            model: request.model.clone(),
        })
    }

    async fn complete_stream<F>(
        &self,
        request: &ChatRequest,
        mut on_chunk: F,
    ) -> Result<String, LlmError>
    where
        F: FnMut(StreamChunk),
    {
        self.requests.borrow_mut().push(request.clone());
        let mut full = String::new();
        for delta in &self.deltas {
            if let Some(text) = delta {
                full.push_str(text);
            }
            on_chunk(StreamChunk {
                delta: delta.clone(),
                done: false,
            });
        }
        if let Some(message) = &self.fail_with {
            return Err(LlmError::Api {
                status: 500,
                message: message.clone(),
            });
        }
        on_chunk(StreamChunk::done());
        Ok(full)
    }
}
