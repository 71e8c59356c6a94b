//! Prompts and confirmations.
//!
//! Anything that needs an answer from the person running opta goes through
//! [`UserInteraction`], so processors and lifecycle commands can be driven by
//! scripted answers in tests and fail fast in CI.

use std::collections::VecDeque;
use std::io::{BufRead, Write};

use parking_lot::Mutex;

use crate::error::{OptaError, OptaResult};

#[cfg_attr(test, mockall::automock)]
pub trait UserInteraction: Send + Sync {
    /// Ask a yes/no question.
    fn confirm(&self, message: &str, default: bool) -> OptaResult<bool>;

    /// Ask for a line of text.
    fn prompt(&self, message: &str) -> OptaResult<String>;

    /// Print something meant for the user rather than the log.
    fn show(&self, message: &str);
}

/// Reads answers from stdin.
pub struct TerminalInteraction {
    non_interactive: bool,
}

impl TerminalInteraction {
    pub fn new(non_interactive: bool) -> Self {
        Self { non_interactive }
    }

    fn read_line(&self, message: &str) -> OptaResult<String> {
        if self.non_interactive {
            return Err(OptaError::user(format!(
                "Cannot ask \"{}\" in a non-interactive run",
                message
            )));
        }
        let mut stdout = std::io::stdout();
        write!(stdout, "{} ", message)?;
        stdout.flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

impl UserInteraction for TerminalInteraction {
    fn confirm(&self, message: &str, default: bool) -> OptaResult<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let answer = self.read_line(&format!("{} {}", message, hint))?;
        Ok(match answer.to_lowercase().as_str() {
            "" => default,
            "y" | "yes" => true,
            _ => false,
        })
    }

    fn prompt(&self, message: &str) -> OptaResult<String> {
        self.read_line(message)
    }

    fn show(&self, message: &str) {
        println!("{}", message);
    }
}

/// Replays canned answers in order and records what was asked and shown.
#[derive(Default)]
pub struct ScriptedInteraction {
    confirms: Mutex<VecDeque<bool>>,
    answers: Mutex<VecDeque<String>>,
    questions: Mutex<Vec<String>>,
    shown: Mutex<Vec<String>>,
}

impl ScriptedInteraction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every confirmation with yes.
    pub fn approving(count: usize) -> Self {
        let script = Self::new();
        script.confirms.lock().extend(std::iter::repeat(true).take(count));
        script
    }

    pub fn confirm_with(self, answer: bool) -> Self {
        self.confirms.lock().push_back(answer);
        self
    }

    pub fn answer_with(self, answer: impl Into<String>) -> Self {
        self.answers.lock().push_back(answer.into());
        self
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().clone()
    }

    pub fn shown(&self) -> Vec<String> {
        self.shown.lock().clone()
    }
}

impl UserInteraction for ScriptedInteraction {
    fn confirm(&self, message: &str, _default: bool) -> OptaResult<bool> {
        self.questions.lock().push(message.to_string());
        self.confirms
            .lock()
            .pop_front()
            .ok_or_else(|| OptaError::user(format!("No scripted answer for \"{}\"", message)))
    }

    fn prompt(&self, message: &str) -> OptaResult<String> {
        self.questions.lock().push(message.to_string());
        self.answers
            .lock()
            .pop_front()
            .ok_or_else(|| OptaError::user(format!("No scripted answer for \"{}\"", message)))
    }

    fn show(&self, message: &str) {
        self.shown.lock().push(message.to_string());
    }
}
