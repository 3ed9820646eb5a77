use crate::embedding::EmbeddingService;
use crate::llm::CompletionService;
use crate::session::{AppContext, Session};
use crate::ui::ChatView;
use crate::vector_store::IndexError;
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

pub const UPLOAD_SUCCESS: &str = "PDF processed successfully! You can now ask questions.";

#[derive(Debug, Serialize)]
pub struct ChunkInfo {
    pub id: String,
    pub content: String,
    pub page: u32,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadSummary {
    pub fragments: usize,
    pub documents: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("{0}")]
    Read(#[from] std::io::Error),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Extract a PDF and make it the session's knowledge base.
///
/// Extraction problems only produce warnings. A read or indexing failure
/// leaves the previous index in place.
pub async fn upload_document<C, E, V>(
    ctx: &AppContext<C, E>,
    session: &mut Session,
    view: &mut V,
    file_path: &Path,
) -> Result<UploadSummary, KnowledgeError>
where
    C: CompletionService,
    E: EmbeddingService,
    V: ChatView,
{
    let result = index_document(ctx, session, view, file_path).await;
    match &result {
        Ok(summary) => {
            info!(
                "{} processed into {} documents",
                file_path.display(),
                summary.documents
            );
            view.notice(UPLOAD_SUCCESS);
        }
        Err(e) => {
            warn!("upload of {} failed: {}", file_path.display(), e);
            view.error(&format!("Error processing PDF: {}", e));
        }
    }
    result
}

async fn index_document<C, E, V>(
    ctx: &AppContext<C, E>,
    session: &mut Session,
    view: &mut V,
    file_path: &Path,
) -> Result<UploadSummary, KnowledgeError>
where
    C: CompletionService,
    E: EmbeddingService,
    V: ChatView,
{
    let bytes = std::fs::read(file_path)?;

    let output = ctx
        .extractor
        .extract_tables_and_text(&bytes, &ctx.completion)
        .await;
    for warning in &output.warnings {
        view.warning(warning);
    }

    let store = ctx
        .index
        .create_vector_store(&output.fragments, &output.text)
        .await?;

    let summary = UploadSummary {
        fragments: output.fragments.len(),
        documents: store.len(),
        warnings: output.warnings,
    };
    session.vector_store = Some(store);
    session.pdf_data = output.fragments;
    Ok(summary)
}

/// Search the current index for chunks relevant to a query
pub async fn search_knowledge_base<C, E>(
    ctx: &AppContext<C, E>,
    session: &Session,
    query: &str,
    top_k: Option<usize>,
) -> Result<Vec<ChunkInfo>, IndexError>
where
    C: CompletionService,
    E: EmbeddingService,
{
    let top_k = top_k.unwrap_or(ctx.settings.top_k);
    let hits = ctx
        .index
        .search(session.vector_store.as_ref(), query, top_k)
        .await?;

    Ok(hits
        .into_iter()
        .map(|hit| ChunkInfo {
            id: hit.document.id,
            content: hit.document.content,
            page: hit.document.metadata.page,
            score: hit.score,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::chat::{send_message, TurnOutcome};
    use crate::config::Settings;
    use crate::doc_processor::testing::{build_pdf, pdf_bytes, ruled_table, text_at};
    use crate::doc_processor::{LATTICE_EMPTY_WARNING, NO_TABLES_WARNING};
    use crate::llm::testing::ScriptedCompletion;
    use crate::ui::testing::RecordingView;
    use crate::vector_store::testing::KeywordEmbedder;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn context_in(
        dir: &Path,
        completion: ScriptedCompletion,
        embedder: KeywordEmbedder,
    ) -> AppContext<ScriptedCompletion, KeywordEmbedder> {
        let settings = Settings {
            scratch_dir: dir.to_path_buf(),
            ..Settings::default()
        };
        AppContext::new(completion, embedder, settings)
    }

    fn indexing_context(dir: &Path) -> AppContext<ScriptedCompletion, KeywordEmbedder> {
        context_in(dir, ScriptedCompletion::streaming(&[]), KeywordEmbedder::new())
    }

    fn write_pdf(dir: &Path, name: &str, pages: Vec<Vec<lopdf::content::Operation>>) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, pdf_bytes(build_pdf(pages))).unwrap();
        path
    }

    fn price_table_pdf(dir: &Path) -> PathBuf {
        write_pdf(
            dir,
            "prices.pdf",
            vec![ruled_table(
                100,
                700,
                &[&["Product", "Unit"], &["name", "price"], &["A-100", "12.50"]],
            )],
        )
    }

    #[tokio::test]
    async fn test_upload_then_ask_end_to_end() {
        let files = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let ctx = context_in(
            scratch.path(),
            ScriptedCompletion::streaming(&["It costs 12.50."]),
            KeywordEmbedder::new(),
        );
        let mut session = Session::default();
        let mut view = RecordingView::default();

        let summary = upload_document(&ctx, &mut session, &mut view, &price_table_pdf(files.path()))
            .await
            .unwrap();
        assert_eq!(summary.fragments, 1);
        assert_eq!(summary.documents, 1);
        assert_eq!(view.notices, vec![UPLOAD_SUCCESS]);

        let markdown = session.pdf_data[0].markdown.clone().unwrap();
        let lines: Vec<&str> = markdown.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("Product name"));
        assert!(lines[2].contains("A-100"));

        let outcome = send_message(&ctx, &mut session, &mut view, "What is the unit price?").await;
        assert_eq!(outcome, TurnOutcome::Answered("It costs 12.50.".into()));
        let request = ctx.completion.last_request().unwrap();
        assert!(request.messages[1].content.contains("| A-100"));
        assert_eq!(session.history.len(), 3);
    }

    #[tokio::test]
    async fn test_upload_without_tables_still_indexes() {
        let files = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let ctx = indexing_context(scratch.path());
        let path = write_pdf(files.path(), "prose.pdf", vec![text_at(100, 700, "Only some text")]);
        let mut session = Session::default();
        let mut view = RecordingView::default();

        let summary = upload_document(&ctx, &mut session, &mut view, &path)
            .await
            .unwrap();

        assert_eq!(view.warnings, vec![LATTICE_EMPTY_WARNING, NO_TABLES_WARNING]);
        assert_eq!(summary.fragments, 1);
        assert!(summary.documents >= 1);
        assert!(session.has_index());
    }

    #[tokio::test]
    async fn test_missing_file_is_reported() {
        let scratch = TempDir::new().unwrap();
        let ctx = indexing_context(scratch.path());
        let mut session = Session::default();
        let mut view = RecordingView::default();

        let result = upload_document(
            &ctx,
            &mut session,
            &mut view,
            &scratch.path().join("missing.pdf"),
        )
        .await;

        assert!(matches!(result, Err(KnowledgeError::Read(_))));
        assert!(view.errors[0].starts_with("Error processing PDF: "));
        assert!(!session.has_index());
    }

    #[tokio::test]
    async fn test_failed_reindex_keeps_previous_index() {
        let files = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let good = indexing_context(scratch.path());
        let mut session = Session::default();
        let mut view = RecordingView::default();
        let path = price_table_pdf(files.path());
        upload_document(&good, &mut session, &mut view, &path)
            .await
            .unwrap();
        let first_ids: Vec<String> = session
            .vector_store
            .as_ref()
            .unwrap()
            .documents()
            .iter()
            .map(|d| d.id.clone())
            .collect();

        let broken = context_in(
            scratch.path(),
            ScriptedCompletion::streaming(&[]),
            KeywordEmbedder::failing(),
        );
        let result = upload_document(&broken, &mut session, &mut view, &path).await;

        assert!(matches!(result, Err(KnowledgeError::Index(IndexError::Embedding(_)))));
        let kept_ids: Vec<String> = session
            .vector_store
            .as_ref()
            .unwrap()
            .documents()
            .iter()
            .map(|d| d.id.clone())
            .collect();
        assert_eq!(kept_ids, first_ids);
    }

    #[tokio::test]
    async fn test_search_knowledge_base() {
        let files = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let ctx = indexing_context(scratch.path());
        let mut session = Session::default();

        assert!(search_knowledge_base(&ctx, &session, "price", None)
            .await
            .unwrap()
            .is_empty());

        let mut view = RecordingView::default();
        upload_document(&ctx, &mut session, &mut view, &price_table_pdf(files.path()))
            .await
            .unwrap();
        let chunks = search_knowledge_base(&ctx, &session, "price", Some(5))
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page, 1);
        assert!(chunks[0].content.starts_with("Table (Page 1):"));
    }
}
