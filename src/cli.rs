//! Command-line arguments and their mapping onto `Settings`.
//!
//! Every flag also reads an environment variable, so a `.env` file can
//! carry the whole configuration.

use crate::config::{PartialResponsePolicy, ProviderKind, Settings};
use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for pdf-chat
#[derive(Parser, Debug, Clone)]
#[command(name = "pdf-chat", about = "Ask questions about the tables, images and text in a PDF")]
pub struct CliArgs {
    /// PDF to process on startup
    #[arg(long, value_name = "PATH")]
    pub pdf: Option<PathBuf>,
    /// Chat without retrieval (no PDF needed)
    #[arg(long)]
    pub plain: bool,
    /// Backend used for chat and image captions
    #[arg(long, value_enum, default_value_t = ProviderKind::Openai, env = "PDF_CHAT_PROVIDER")]
    pub provider: ProviderKind,
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,
    #[arg(long, env = "OPENAI_BASE_URL")]
    pub openai_base_url: Option<String>,
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub claude_api_key: Option<String>,
    #[arg(long, env = "ANTHROPIC_BASE_URL")]
    pub claude_base_url: Option<String>,
    #[arg(long, env = "OLLAMA_HOST")]
    pub ollama_host: Option<String>,
    /// Model answering questions
    #[arg(long, value_name = "MODEL", env = "PDF_CHAT_MODEL")]
    pub model: Option<String>,
    /// Model describing embedded images (defaults to the chat model)
    #[arg(long, value_name = "MODEL", env = "PDF_CHAT_CAPTION_MODEL")]
    pub caption_model: Option<String>,
    #[arg(long, value_name = "MODEL", env = "PDF_CHAT_EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,
    /// Chunks retrieved per question
    #[arg(long, value_name = "INT", env = "PDF_CHAT_TOP_K")]
    pub top_k: Option<usize>,
    #[arg(long, value_name = "INT", env = "PDF_CHAT_EMBEDDING_BATCH_SIZE")]
    pub embedding_batch_size: Option<usize>,
    /// Directory for temporary copies of uploads
    #[arg(long, value_name = "DIR", env = "PDF_CHAT_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,
    /// What to keep when a streamed answer breaks off
    #[arg(long, value_enum, env = "PDF_CHAT_PARTIAL_POLICY")]
    pub partial_policy: Option<PartialResponsePolicy>,
    /// Share of alphabetic characters that makes a row a header
    #[arg(long, value_name = "RATIO", env = "PDF_CHAT_HEADER_TEXT_RATIO")]
    pub header_text_ratio: Option<f64>,
    /// Leading rows that may be merged into a table header
    #[arg(long, value_name = "INT", env = "PDF_CHAT_MAX_HEADER_ROWS")]
    pub max_header_rows: Option<usize>,
    /// Share of filled cells below which a row continues the previous one
    #[arg(long, value_name = "RATIO", env = "PDF_CHAT_MIN_FILLED_FRACTION")]
    pub min_filled_fraction: Option<f64>,
    /// Distance (points) within which ruling lines count as one in lattice mode
    #[arg(long, value_name = "POINTS", env = "PDF_CHAT_LINE_TOLERANCE")]
    pub line_tolerance: Option<f32>,
    /// Vertical tolerance (points) for grouping text into rows in stream mode
    #[arg(long, value_name = "POINTS", env = "PDF_CHAT_ROW_TOL")]
    pub row_tol: Option<f32>,
    /// Horizontal tolerance (points) for aligning columns in stream mode
    #[arg(long, value_name = "POINTS", env = "PDF_CHAT_COLUMN_TOLERANCE")]
    pub column_tolerance: Option<f32>,
    /// Log filter, e.g. `info` or `pdf_chat_lib=debug`
    #[arg(long, value_name = "FILTER", env = "RUST_LOG", default_value = "warn")]
    pub log: String,
}

impl CliArgs {
    /// Apply the launch overrides on top of the defaults.
    pub fn to_settings(&self) -> Settings {
        let mut settings = Settings {
            provider: self.provider,
            openai_api_key: self.openai_api_key.clone().filter(|k| !k.is_empty()),
            claude_api_key: self.claude_api_key.clone().filter(|k| !k.is_empty()),
            plain: self.plain,
            ..Settings::default()
        };
        if let Some(url) = &self.openai_base_url {
            settings.openai_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = &self.claude_base_url {
            settings.claude_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(host) = &self.ollama_host {
            settings.ollama_host = host.clone();
        }
        if let Some(model) = &self.model {
            settings.chat_model = model.clone();
            settings.caption_model = model.clone();
        }
        if let Some(model) = &self.caption_model {
            settings.caption_model = model.clone();
        }
        if let Some(model) = &self.embedding_model {
            settings.embedding_model = model.clone();
        }
        if let Some(top_k) = self.top_k {
            settings.top_k = top_k;
        }
        if let Some(size) = self.embedding_batch_size {
            settings.embedding_batch_size = size;
        }
        if let Some(dir) = &self.scratch_dir {
            settings.scratch_dir = dir.clone();
        }
        if let Some(policy) = self.partial_policy {
            settings.partial_policy = policy;
        }
        let heuristics = &mut settings.heuristics;
        if let Some(ratio) = self.header_text_ratio {
            heuristics.header_text_ratio = ratio;
        }
        if let Some(rows) = self.max_header_rows {
            heuristics.max_header_rows = rows;
        }
        if let Some(fraction) = self.min_filled_fraction {
            heuristics.min_filled_fraction = fraction;
        }
        if let Some(tolerance) = self.line_tolerance {
            heuristics.line_tolerance = tolerance;
        }
        if let Some(row_tol) = self.row_tol {
            heuristics.row_tol = row_tol;
        }
        if let Some(tolerance) = self.column_tolerance {
            heuristics.column_tolerance = tolerance;
        }
        settings
    }
}
