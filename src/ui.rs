//! Rendering seam between the commands and the terminal.

use crate::llm::{ChatMessage, Role};
use std::io::{self, Write};

/// What the commands need from a front end.
pub trait ChatView {
    fn show_message(&mut self, message: &ChatMessage);
    /// An assistant response is about to stream.
    fn begin_response(&mut self);
    /// Called after every non-empty delta with everything received so far.
    fn update_response(&mut self, partial: &str);
    fn end_response(&mut self);
    fn notice(&mut self, text: &str);
    fn warning(&mut self, text: &str);
    fn error(&mut self, text: &str);
}

/// Plain stdout rendering. Partial responses are printed incrementally.
#[derive(Debug, Default)]
pub struct TerminalView {
    printed: usize,
}

impl TerminalView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prompt(&mut self) {
        self.write("> ");
    }

    fn write(&mut self, text: &str) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

fn label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "you",
        Role::Assistant => "assistant",
    }
}

impl ChatView for TerminalView {
    fn show_message(&mut self, message: &ChatMessage) {
        self.write(&format!("{}> {}\n", label(message.role), message.content));
    }

    fn begin_response(&mut self) {
        self.printed = 0;
        self.write("assistant> ");
    }

    fn update_response(&mut self, partial: &str) {
        // Partials only ever grow; print the unseen tail.
        if let Some(tail) = partial.get(self.printed..) {
            self.write(tail);
        }
        self.printed = partial.len();
    }

    fn end_response(&mut self) {
        self.write("\n");
    }

    fn notice(&mut self, text: &str) {
        self.write(&format!("{}\n", text));
    }

    fn warning(&mut self, text: &str) {
        self.write(&format!("warning: {}\n", text));
    }

    fn error(&mut self, text: &str) {
        self.write(&format!("error: {}\n", text));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records every call for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingView {
        pub messages: Vec<ChatMessage>,
        pub partials: Vec<String>,
        pub responses_started: usize,
        pub notices: Vec<String>,
        pub warnings: Vec<String>,
        pub errors: Vec<String>,
    }

    impl ChatView for RecordingView {
        fn show_message(&mut self, message: &ChatMessage) {
            self.messages.push(message.clone());
        }

        fn begin_response(&mut self) {
            self.responses_started += 1;
        }

        fn update_response(&mut self, partial: &str) {
            self.partials.push(partial.to_string());
        }

        fn end_response(&mut self) {}

        fn notice(&mut self, text: &str) {
            self.notices.push(text.to_string());
        }

        fn warning(&mut self, text: &str) {
            self.warnings.push(text.to_string());
        }

        fn error(&mut self, text: &str) {
            self.errors.push(text.to_string());
        }
    }
}
