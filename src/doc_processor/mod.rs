//! PDF extraction: text, tables and image captions, assembled into the
//! fragments that get indexed for retrieval.

pub mod detect;
pub mod images;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::{Settings, TableHeuristics};
use crate::llm::CompletionService;
use detect::{DetectionStrategy, LayoutTableDetector, TableDetector};
use lopdf::Document;
use std::collections::BTreeMap;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const LATTICE_EMPTY_WARNING: &str =
    "No tables detected in lattice mode. Trying stream mode...";
pub const NO_TABLES_WARNING: &str = "No tables detected.";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Unsupported image: {0}")]
    UnsupportedImage(String),
}

/// One indexable unit of extracted content.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Page the table came from; `None` for the no-tables fallback.
    pub page: Option<u32>,
    /// Markdown rendering of the table; `None` for the no-tables fallback.
    pub markdown: Option<String>,
    pub combined_content: String,
}

impl Fragment {
    fn table(page: u32, markdown: String, descriptions: &str, text: &str) -> Self {
        let combined_content = format!(
            "Table (Page {}):\n{}\n\nImage Descriptions:\n{}\n\nPDF Text:\n{}",
            page, markdown, descriptions, text
        );
        Self {
            page: Some(page),
            markdown: Some(markdown),
            combined_content,
        }
    }

    fn descriptions_only(descriptions: &str) -> Self {
        Self {
            page: None,
            markdown: None,
            combined_content: format!("Image Descriptions:\n{}", descriptions),
        }
    }

    pub fn is_table(&self) -> bool {
        self.markdown.is_some()
    }

    /// Whether this no-tables fragment actually carries captions.
    pub fn has_descriptions(&self) -> bool {
        self.combined_content
            .strip_prefix("Image Descriptions:")
            .map(|rest| !rest.trim().is_empty())
            .unwrap_or(true)
    }
}

#[derive(Debug, Default, Clone)]
pub struct ExtractionOutput {
    pub fragments: Vec<Fragment>,
    /// Plain text of the whole document.
    pub text: String,
    /// User-facing notices, in the order they were raised.
    pub warnings: Vec<String>,
}

/// Scratch copies of the upload. Both files are removed when this drops,
/// whichever way extraction ends.
struct ScratchFiles {
    upload: NamedTempFile,
    no_images: NamedTempFile,
}

impl ScratchFiles {
    fn create(dir: &Path, bytes: &[u8]) -> Result<Self, ExtractError> {
        let mut upload = tempfile::Builder::new()
            .prefix("pdf-chat-upload-")
            .suffix(".pdf")
            .tempfile_in(dir)?;
        upload.write_all(bytes)?;
        upload.flush()?;
        let no_images = tempfile::Builder::new()
            .prefix("pdf-chat-no-images-")
            .suffix(".pdf")
            .tempfile_in(dir)?;
        Ok(Self { upload, no_images })
    }
}

/// Plain text via pdf-extract, falling back to lopdf when pdf-extract
/// errors out or panics on an unusual font.
fn extract_text(path: &Path) -> Result<String, ExtractError> {
    match panic::catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text(path))) {
        Ok(Ok(text)) => return Ok(text),
        Ok(Err(e)) => warn!("pdf-extract failed, falling back to lopdf: {}", e),
        Err(_) => warn!("pdf-extract panicked, falling back to lopdf"),
    }
    let doc = Document::load(path)?;
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    Ok(doc.extract_text(&pages)?)
}

pub struct PdfExtractor<D = LayoutTableDetector> {
    detector: D,
    heuristics: TableHeuristics,
    scratch_dir: PathBuf,
    caption_model: String,
    caption_max_tokens: u32,
}

impl PdfExtractor<LayoutTableDetector> {
    pub fn new(settings: &Settings) -> Self {
        Self::with_detector(LayoutTableDetector, settings)
    }
}

impl<D: TableDetector> PdfExtractor<D> {
    pub fn with_detector(detector: D, settings: &Settings) -> Self {
        Self {
            detector,
            heuristics: settings.heuristics.clone(),
            scratch_dir: settings.scratch_dir.clone(),
            caption_model: settings.caption_model.clone(),
            caption_max_tokens: settings.caption_max_tokens,
        }
    }

    /// Extract everything from an uploaded PDF.
    ///
    /// Never fails outright: an error part-way through is reported as a
    /// warning, with no fragments and whatever text was already read.
    pub async fn extract_tables_and_text<C: CompletionService>(
        &self,
        pdf_bytes: &[u8],
        captioner: &C,
    ) -> ExtractionOutput {
        let mut output = ExtractionOutput::default();
        if let Err(e) = self.extract_into(pdf_bytes, captioner, &mut output).await {
            warn!("extraction failed: {}", e);
            output.fragments.clear();
            output
                .warnings
                .push(format!("Error extracting tables: {}", e));
        }
        output
    }

    async fn extract_into<C: CompletionService>(
        &self,
        pdf_bytes: &[u8],
        captioner: &C,
        output: &mut ExtractionOutput,
    ) -> Result<(), ExtractError> {
        let mut scratch = ScratchFiles::create(&self.scratch_dir, pdf_bytes)?;

        let mut doc = Document::load(scratch.upload.path())?;
        let pdf_images = images::collect_images(&doc);
        let removed = images::remove_images(&mut doc, &pdf_images);
        doc.save_to(&mut scratch.no_images)?;
        scratch.no_images.flush()?;
        debug!("removed {} image draws before table detection", removed);

        let descriptions = images::describe_images(
            &pdf_images,
            captioner,
            &self.caption_model,
            self.caption_max_tokens,
        )
        .await;

        output.text = extract_text(scratch.no_images.path())?;

        let tables = self.detect_tables(scratch.no_images.path(), output)?;
        if tables.is_empty() {
            output.warnings.push(NO_TABLES_WARNING.to_string());
            let all: Vec<&str> = descriptions.values().flatten().map(String::as_str).collect();
            output
                .fragments
                .push(Fragment::descriptions_only(&all.join("\n")));
            return Ok(());
        }

        for raw in &tables {
            let markdown = table::reconstruct(raw, &self.heuristics).to_markdown();
            let page_descriptions = page_descriptions(&descriptions, raw.page);
            output.fragments.push(Fragment::table(
                raw.page,
                markdown,
                &page_descriptions,
                &output.text,
            ));
        }
        info!(
            "extracted {} tables and {} image descriptions",
            tables.len(),
            pdf_images.len()
        );
        Ok(())
    }

    /// Lattice first; stream only when lattice finds nothing.
    fn detect_tables(
        &self,
        path: &Path,
        output: &mut ExtractionOutput,
    ) -> Result<Vec<table::RawTable>, ExtractError> {
        let tables = self
            .detector
            .detect(path, &DetectionStrategy::lattice(&self.heuristics))?;
        if !tables.is_empty() {
            return Ok(tables);
        }
        output.warnings.push(LATTICE_EMPTY_WARNING.to_string());
        self.detector
            .detect(path, &DetectionStrategy::stream(&self.heuristics))
    }
}

fn page_descriptions(descriptions: &BTreeMap<u32, Vec<String>>, page: u32) -> String {
    descriptions
        .get(&page)
        .map(|lines| lines.join("\n"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::table::RawTable;
    use super::testing::{
        attach_image, build_pdf, draw_image, pdf_bytes, red_square, ruled_table, text_at,
    };
    use crate::llm::{ChatRequest, ChatResponse, LlmError, StreamChunk};
    use std::cell::Cell;

    struct FixedCaption;

    impl CompletionService for FixedCaption {
        async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
            Ok(ChatResponse {
                content: "A red square".into(),
                model: request.model.clone(),
            })
        }

        async fn complete_stream<F>(
            &self,
            _request: &ChatRequest,
            _on_chunk: F,
        ) -> Result<String, LlmError>
        where
            F: FnMut(StreamChunk),
        {
            unreachable!("captioning never streams")
        }
    }

    /// Hands out canned tables per strategy and counts the calls.
    struct ScriptedDetector {
        lattice: Vec<RawTable>,
        stream: Vec<RawTable>,
        calls: Cell<usize>,
    }

    impl TableDetector for ScriptedDetector {
        fn detect(
            &self,
            _pdf_path: &Path,
            strategy: &DetectionStrategy,
        ) -> Result<Vec<RawTable>, ExtractError> {
            self.calls.set(self.calls.get() + 1);
            Ok(match strategy {
                DetectionStrategy::Lattice { .. } => self.lattice.clone(),
                DetectionStrategy::Stream { .. } => self.stream.clone(),
            })
        }
    }

    fn settings_in(dir: &Path) -> Settings {
        Settings {
            scratch_dir: dir.to_path_buf(),
            ..Settings::default()
        }
    }

    fn scratch_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_ruled_table_becomes_fragment() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut page = text_at(100, 780, "Quarterly prices");
        page.extend(ruled_table(
            100,
            700,
            &[&["Product", "Unit"], &["name", "price"], &["A-100", "12.50"]],
        ));
        let bytes = pdf_bytes(build_pdf(vec![page]));

        let extractor = PdfExtractor::new(&settings_in(dir.path()));
        let output = extractor.extract_tables_and_text(&bytes, &FixedCaption).await;

        assert!(output.warnings.is_empty(), "{:?}", output.warnings);
        assert_eq!(output.fragments.len(), 1);
        let fragment = &output.fragments[0];
        assert_eq!(fragment.page, Some(1));
        let markdown = fragment.markdown.as_deref().unwrap();
        assert!(markdown.contains("Product name"));
        assert!(markdown.contains("Unit price"));
        assert!(fragment
            .combined_content
            .starts_with("Table (Page 1):\n| Product name"));
        assert!(fragment.combined_content.contains("\n\nImage Descriptions:\n\n\nPDF Text:\n"));
        assert!(output.text.contains("Quarterly"));
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_no_tables_falls_back_to_descriptions() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut page = text_at(100, 700, "Just prose here.");
        page.extend(draw_image("Im1"));
        let mut doc = build_pdf(vec![page]);
        attach_image(&mut doc, 1, "Im1", red_square());

        let extractor = PdfExtractor::new(&settings_in(dir.path()));
        let output = extractor
            .extract_tables_and_text(&pdf_bytes(doc), &FixedCaption)
            .await;

        assert_eq!(output.warnings, vec![LATTICE_EMPTY_WARNING, NO_TABLES_WARNING]);
        assert_eq!(
            output.fragments,
            vec![Fragment {
                page: None,
                markdown: None,
                combined_content: "Image Descriptions:\nPage 1 Image: A red square".into(),
            }]
        );
        assert!(output.text.contains("prose"));
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_stream_runs_only_after_empty_lattice() {
        let dir = tempfile::TempDir::new().unwrap();
        let bytes = pdf_bytes(build_pdf(vec![text_at(100, 700, "x")]));
        let grid = vec![
            vec!["Year".to_string(), "Total".to_string()],
            vec!["2024".to_string(), "7".to_string()],
        ];

        let lattice_hit = ScriptedDetector {
            lattice: vec![RawTable::new(1, grid.clone())],
            stream: Vec::new(),
            calls: Cell::new(0),
        };
        let extractor = PdfExtractor::with_detector(lattice_hit, &settings_in(dir.path()));
        let output = extractor.extract_tables_and_text(&bytes, &FixedCaption).await;
        assert_eq!(extractor.detector.calls.get(), 1);
        assert!(output.warnings.is_empty());

        let stream_hit = ScriptedDetector {
            lattice: Vec::new(),
            stream: vec![RawTable::new(1, grid)],
            calls: Cell::new(0),
        };
        let extractor = PdfExtractor::with_detector(stream_hit, &settings_in(dir.path()));
        let output = extractor.extract_tables_and_text(&bytes, &FixedCaption).await;
        assert_eq!(extractor.detector.calls.get(), 2);
        assert_eq!(output.warnings, vec![LATTICE_EMPTY_WARNING]);
        assert_eq!(output.fragments.len(), 1);
    }

    #[tokio::test]
    async fn test_descriptions_follow_their_page() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut doc = build_pdf(vec![text_at(100, 700, "one"), draw_image("Im1")]);
        attach_image(&mut doc, 2, "Im1", red_square());
        let detector = ScriptedDetector {
            lattice: vec![
                RawTable::new(1, vec![vec!["a".into(), "b".into()]]),
                RawTable::new(2, vec![vec!["c".into(), "d".into()]]),
            ],
            stream: Vec::new(),
            calls: Cell::new(0),
        };
        let extractor = PdfExtractor::with_detector(detector, &settings_in(dir.path()));
        let output = extractor
            .extract_tables_and_text(&pdf_bytes(doc), &FixedCaption)
            .await;

        assert_eq!(output.fragments.len(), 2);
        assert!(!output.fragments[0]
            .combined_content
            .contains("Page 2 Image"));
        assert!(output.fragments[1]
            .combined_content
            .contains("Image Descriptions:\nPage 2 Image: A red square\n\nPDF Text:"));
    }

    #[tokio::test]
    async fn test_garbage_input_reports_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let extractor = PdfExtractor::new(&settings_in(dir.path()));
        let output = extractor
            .extract_tables_and_text(b"definitely not a pdf", &FixedCaption)
            .await;

        assert!(output.fragments.is_empty());
        assert!(output.text.is_empty());
        assert_eq!(output.warnings.len(), 1);
        assert!(output.warnings[0].starts_with("Error extracting tables: "));
        assert!(scratch_is_empty(dir.path()));
    }

    #[test]
    fn test_fragment_has_descriptions() {
        assert!(!Fragment::descriptions_only("").has_descriptions());
        assert!(Fragment::descriptions_only("Page 1 Image: x").has_descriptions());
        assert!(Fragment::table(1, "| a |".into(), "", "text").has_descriptions());
    }
}
