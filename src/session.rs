//! Per-run state: the conversation, the current index and the services the
//! commands run against.

use crate::config::{Settings, PDF_SYSTEM_PROMPT};
use crate::doc_processor::{Fragment, PdfExtractor};
use crate::embedding::EmbeddingService;
use crate::llm::{ChatMessage, CompletionService};
use crate::vector_store::{VectorStore, VectorStoreManager};

/// One user's conversation. Lives in memory for a single run.
#[derive(Debug, Clone)]
pub struct Session {
    /// Starts with the system instruction; user/assistant turns follow.
    pub history: Vec<ChatMessage>,
    /// `None` until a PDF has been processed.
    pub vector_store: Option<VectorStore>,
    /// Fragments of the last processed PDF.
    pub pdf_data: Vec<Fragment>,
}

impl Session {
    pub fn new(system_prompt: &str) -> Self {
        Self {
            history: vec![ChatMessage::system(system_prompt)],
            vector_store: None,
            pdf_data: Vec::new(),
        }
    }

    pub fn has_index(&self) -> bool {
        self.vector_store.is_some()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(PDF_SYSTEM_PROMPT)
    }
}

/// Services shared by every command. Generic over the completion and
/// embedding backends so tests can script them.
pub struct AppContext<C, E> {
    pub completion: C,
    pub index: VectorStoreManager<E>,
    pub extractor: PdfExtractor,
    pub settings: Settings,
}

impl<C: CompletionService, E: EmbeddingService> AppContext<C, E> {
    pub fn new(completion: C, embedder: E, settings: Settings) -> Self {
        Self {
            completion,
            index: VectorStoreManager::new(embedder),
            extractor: PdfExtractor::new(&settings),
            settings,
        }
    }

    pub fn new_session(&self) -> Session {
        Session::new(self.settings.system_prompt())
    }
}
