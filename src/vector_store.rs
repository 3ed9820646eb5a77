//! In-memory similarity index over extracted fragments.

use crate::doc_processor::Fragment;
use crate::embedding::{search_similar, EmbeddingError, EmbeddingService};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentMetadata {
    pub page: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub metadata: DocumentMetadata,
}

impl Document {
    fn new(content: impl Into<String>, page: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            metadata: DocumentMetadata { page },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub document: Document,
    pub score: f32,
}

/// Documents with one embedding each, positions aligned.
#[derive(Debug, Clone, Default)]
pub struct VectorStore {
    documents: Vec<Document>,
    embeddings: Vec<Vec<f32>>,
}

impl VectorStore {
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error("No content to index")]
    NoContent,
    #[error("Got {embeddings} embeddings for {documents} documents")]
    Mismatch { documents: usize, embeddings: usize },
}

/// Decide what gets indexed for one upload.
///
/// Table fragments are indexed one document each. Without tables the raw
/// text carries the index, joined by the image descriptions when there are
/// any (or when there is no text at all).
pub fn documents_for(fragments: &[Fragment], text: &str) -> Result<Vec<Document>, IndexError> {
    let has_text = !text.trim().is_empty();

    let documents: Vec<Document> = if fragments.iter().any(Fragment::is_table) {
        fragments
            .iter()
            .map(|f| Document::new(f.combined_content.clone(), f.page.unwrap_or(1)))
            .collect()
    } else {
        let mut documents = Vec::new();
        if has_text {
            documents.push(Document::new(text, 1));
        }
        documents.extend(
            fragments
                .iter()
                .filter(|f| f.has_descriptions() || !has_text)
                .map(|f| Document::new(f.combined_content.clone(), f.page.unwrap_or(1))),
        );
        documents
    };

    if documents.iter().all(|d| d.content.trim().is_empty()) {
        return Err(IndexError::NoContent);
    }
    Ok(documents)
}

pub struct VectorStoreManager<E> {
    embedder: E,
}

impl<E: EmbeddingService> VectorStoreManager<E> {
    pub fn new(embedder: E) -> Self {
        Self { embedder }
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    /// Build a fresh index. Embedding failures abort the build.
    pub async fn create_vector_store(
        &self,
        fragments: &[Fragment],
        text: &str,
    ) -> Result<VectorStore, IndexError> {
        let documents = documents_for(fragments, text)?;
        let contents: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let embeddings = self.embedder.embed(&contents).await?;
        if embeddings.len() != documents.len() {
            return Err(IndexError::Mismatch {
                documents: documents.len(),
                embeddings: embeddings.len(),
            });
        }
        info!("indexed {} documents", documents.len());
        Ok(VectorStore {
            documents,
            embeddings,
        })
    }

    /// Top `k` documents by cosine similarity. No index means no hits.
    pub async fn search(
        &self,
        store: Option<&VectorStore>,
        query: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let Some(store) = store.filter(|s| !s.is_empty()) else {
            debug!("search without an index");
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_embeddings = self.embedder.embed(&[query.to_string()]).await?;
        let query_emb = query_embeddings.first().ok_or(IndexError::Mismatch {
            documents: 1,
            embeddings: 0,
        })?;

        Ok(search_similar(query_emb, &store.embeddings, k)
            .into_iter()
            .map(|(i, score)| SearchHit {
                document: store.documents[i].clone(),
                score,
            })
            .collect())
    }
}
