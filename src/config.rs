//! Runtime settings: provider credentials, model choices and the table
//! reconstruction thresholds.

use crate::embedding::OpenAiEmbedder;
use crate::llm::{claude, openai, Provider};
use std::path::PathBuf;

pub const PDF_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that answers questions based on tables and text extracted from a PDF.";
pub const PLAIN_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

pub const DEFAULT_CHAT_MODEL: &str = "gpt-4.1-nano";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    Openai,
    Claude,
    Ollama,
}

/// What to do with a streamed answer that failed part-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PartialResponsePolicy {
    /// Drop the turn; history stays as it was before the question.
    #[default]
    Discard,
    /// Keep the question and the partial answer, marked as interrupted.
    CommitTruncated,
}

pub const TRUNCATION_MARKER: &str = " [response interrupted]";

/// Thresholds used when rebuilding tables out of detector output.
#[derive(Debug, Clone, PartialEq)]
pub struct TableHeuristics {
    /// A leading row is header-like when more than this share of its
    /// characters are alphabetic or whitespace.
    pub header_text_ratio: f64,
    /// How many leading rows may be merged into the header.
    pub max_header_rows: usize,
    /// A row starts a new record when at least `floor(ncols * fraction)`
    /// cells are non-blank; otherwise it continues the previous record.
    pub min_filled_fraction: f64,
    /// Lattice: ruling lines closer than this (points) are the same line.
    pub line_tolerance: f32,
    /// Stream: text within this vertical distance (points) shares a row.
    pub row_tol: f32,
    /// Stream: cell starts within this horizontal distance share a column.
    pub column_tolerance: f32,
}

impl Default for TableHeuristics {
    fn default() -> Self {
        Self {
            header_text_ratio: 0.6,
            max_header_rows: 3,
            min_filled_fraction: 0.5,
            line_tolerance: 2.0,
            row_tol: 15.0,
            column_tolerance: 10.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub provider: ProviderKind,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub claude_api_key: Option<String>,
    pub claude_base_url: String,
    pub ollama_host: String,
    pub chat_model: String,
    pub caption_model: String,
    pub embedding_model: String,
    pub caption_max_tokens: u32,
    pub top_k: usize,
    pub embedding_batch_size: usize,
    pub scratch_dir: PathBuf,
    pub partial_policy: PartialResponsePolicy,
    /// Chat without retrieval (no upload required).
    pub plain: bool,
    pub heuristics: TableHeuristics,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Openai,
            openai_api_key: None,
            openai_base_url: openai::DEFAULT_BASE_URL.to_string(),
            claude_api_key: None,
            claude_base_url: claude::DEFAULT_BASE_URL.to_string(),
            ollama_host: DEFAULT_OLLAMA_HOST.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            caption_model: DEFAULT_CHAT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            caption_max_tokens: 300,
            top_k: 3,
            embedding_batch_size: 20,
            scratch_dir: std::env::temp_dir(),
            partial_policy: PartialResponsePolicy::Discard,
            plain: false,
            heuristics: TableHeuristics::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} API key not configured")]
    MissingApiKey(&'static str),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("Unknown setting key: {0}")]
    UnknownKey(String),
}

impl Settings {
    pub fn system_prompt(&self) -> &'static str {
        if self.plain {
            PLAIN_SYSTEM_PROMPT
        } else {
            PDF_SYSTEM_PROMPT
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let h = &self.heuristics;
        if !(0.0..=1.0).contains(&h.header_text_ratio) {
            return Err(ConfigError::Invalid {
                key: "header_text_ratio",
                reason: format!("{} is outside 0..=1", h.header_text_ratio),
            });
        }
        if !(0.0..=1.0).contains(&h.min_filled_fraction) {
            return Err(ConfigError::Invalid {
                key: "min_filled_fraction",
                reason: format!("{} is outside 0..=1", h.min_filled_fraction),
            });
        }
        if self.top_k == 0 {
            return Err(ConfigError::Invalid {
                key: "top_k",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    fn openai_config(&self) -> Result<openai::OpenAiConfig, ConfigError> {
        let api_key = self
            .openai_api_key
            .clone()
            .ok_or(ConfigError::MissingApiKey("OpenAI"))?;
        Ok(openai::OpenAiConfig {
            api_key,
            base_url: self.openai_base_url.clone(),
        })
    }

    /// Resolve the chat/captioning backend.
    pub fn provider(&self) -> Result<Provider, ConfigError> {
        match self.provider {
            ProviderKind::Openai => Ok(Provider::OpenAi(self.openai_config()?)),
            ProviderKind::Claude => {
                let api_key = self
                    .claude_api_key
                    .clone()
                    .ok_or(ConfigError::MissingApiKey("Claude"))?;
                Ok(Provider::Claude(claude::ClaudeConfig {
                    api_key,
                    base_url: self.claude_base_url.clone(),
                }))
            }
            ProviderKind::Ollama => Ok(Provider::ollama(&self.ollama_host)),
        }
    }

    /// Anthropic has no embeddings endpoint, so Claude chat still embeds
    /// through OpenAI; Ollama embeds locally. Plain mode never embeds, so a
    /// missing OpenAI key is tolerated there.
    pub fn embedder(&self) -> Result<OpenAiEmbedder, ConfigError> {
        let config = match self.provider {
            ProviderKind::Openai | ProviderKind::Claude => match self.openai_config() {
                Ok(config) => config,
                Err(_) if self.plain => openai::OpenAiConfig {
                    api_key: String::new(),
                    base_url: self.openai_base_url.clone(),
                },
                Err(e) => return Err(e),
            },
            ProviderKind::Ollama => openai::OpenAiConfig::ollama(&self.ollama_host),
        };
        Ok(OpenAiEmbedder::new(
            config,
            self.embedding_model.clone(),
            self.embedding_batch_size,
        ))
    }
}
