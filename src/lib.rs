pub mod cli;
pub mod commands;
pub mod config;
pub mod doc_processor;
pub mod embedding;
pub mod llm;
pub mod repl;
pub mod session;
pub mod ui;
pub mod vector_store;

use clap::Parser;
use cli::CliArgs;
use config::ConfigError;
use session::AppContext;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    // Logs go to stderr so they stay out of the conversation on stdout.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run() -> Result<(), AppError> {
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    init_tracing(&args.log);

    let settings = args.to_settings();
    settings.validate()?;
    let provider = settings.provider()?;
    let embedder = settings.embedder()?;
    info!(
        "using {} with chat model {}",
        provider.name(),
        settings.chat_model
    );

    let ctx = AppContext::new(provider, embedder, settings);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(repl::run(ctx, args.pdf))
}
