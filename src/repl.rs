//! Interactive terminal loop.

use crate::commands::{chat, knowledge, settings};
use crate::embedding::EmbeddingService;
use crate::llm::CompletionService;
use crate::session::AppContext;
use crate::ui::{ChatView, TerminalView};
use crate::AppError;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

const HELP: &str = "\
Commands:
  /upload <path>      process a PDF and make it the knowledge base
  /search <query>     show the chunks retrieved for a query
  /history            show the conversation so far
  /settings           show the current settings
  /set <key> <value>  change chat_model, top_k or partial_policy
  /reset              start a new conversation
  /help               show this help
  /quit               exit
Anything else is sent as a question.";

const SEARCH_PREVIEW_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Empty,
    Chat(String),
    Upload(PathBuf),
    Search(String),
    History,
    Settings,
    Set { key: String, value: String },
    Reset,
    Help,
    Quit,
    Usage(&'static str),
    Unknown(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Chat(line.to_string());
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    match name {
        "upload" if arg.is_empty() => Command::Usage("/upload <path>"),
        "upload" => Command::Upload(PathBuf::from(arg)),
        "search" if arg.is_empty() => Command::Usage("/search <query>"),
        "search" => Command::Search(arg.to_string()),
        "history" => Command::History,
        "settings" => Command::Settings,
        "set" => match arg.split_once(char::is_whitespace) {
            Some((key, value)) => Command::Set {
                key: key.to_string(),
                value: value.trim().to_string(),
            },
            None => Command::Usage("/set <key> <value>"),
        },
        "reset" => Command::Reset,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    }
}

fn preview(content: &str) -> String {
    let mut text: String = content.chars().take(SEARCH_PREVIEW_CHARS).collect();
    if content.chars().count() > SEARCH_PREVIEW_CHARS {
        text.push_str("...");
    }
    text
}

/// Read commands from stdin until `/quit` or end of input.
pub async fn run<C, E>(
    mut ctx: AppContext<C, E>,
    startup_pdf: Option<PathBuf>,
) -> Result<(), AppError>
where
    C: CompletionService,
    E: EmbeddingService,
{
    let mut session = ctx.new_session();
    let mut view = TerminalView::new();
    view.notice("pdf-chat: type /help for commands.");

    if let Some(path) = startup_pdf {
        let _ = knowledge::upload_document(&ctx, &mut session, &mut view, &path).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        view.prompt();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let command = parse_command(&line);
        debug!("command: {:?}", command);

        match command {
            Command::Empty => {}
            Command::Chat(question) => {
                chat::send_message(&ctx, &mut session, &mut view, &question).await;
            }
            Command::Upload(path) => {
                let _ = knowledge::upload_document(&ctx, &mut session, &mut view, &path).await;
            }
            Command::Search(query) => {
                match knowledge::search_knowledge_base(&ctx, &session, &query, None).await {
                    Ok(chunks) if chunks.is_empty() => view.notice("No results."),
                    Ok(chunks) => {
                        for chunk in chunks {
                            view.notice(&format!(
                                "[page {}, score {:.3}]\n{}\n",
                                chunk.page,
                                chunk.score,
                                preview(&chunk.content)
                            ));
                        }
                    }
                    Err(e) => view.error(&format!("Search failed: {}", e)),
                }
            }
            Command::History => chat::display_conversation(&session, &mut view),
            Command::Settings => {
                for (key, value) in settings::get_settings(&ctx.settings) {
                    view.notice(&format!("{} = {}", key, value));
                }
            }
            Command::Set { key, value } => {
                match settings::set_setting(&mut ctx.settings, &key, &value) {
                    Ok(()) => view.notice(&format!("{} = {}", key, value)),
                    Err(e) => view.error(&e.to_string()),
                }
            }
            Command::Reset => {
                session = ctx.new_session();
                view.notice("Started a new conversation.");
            }
            Command::Help => view.notice(HELP),
            Command::Quit => break,
            Command::Usage(usage) => view.error(&format!("usage: {}", usage)),
            Command::Unknown(name) => {
                view.error(&format!("unknown command /{} (try /help)", name))
            }
        }
    }
    Ok(())
}
