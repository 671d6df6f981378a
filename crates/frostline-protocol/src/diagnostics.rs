//! Structured diagnostics produced by runtimes and by the host.
//!
//! Diagnostics travel as JSON so tooling (for example a dev-mode overlay) can
//! re-render them, and are restored to colorized terminal text before printing.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildError {
    pub title: String,
    #[serde(default)]
    pub path: String,
    pub message: Vec<MessagePart>,
    #[serde(default)]
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePart {
    Plain(String),
    Styled {
        string: String,
        #[serde(default)]
        color: Option<Color>,
        #[serde(default)]
        bold: bool,
        #[serde(default)]
        underline: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Red,
    Yellow,
    Green,
    Cyan,
    Blue,
    Magenta,
    Black,
    White,
}

impl Color {
    fn ansi_code(self) -> u8 {
        match self {
            Color::Black => 30,
            Color::Red => 31,
            Color::Green => 32,
            Color::Yellow => 33,
            Color::Blue => 34,
            Color::Magenta => 35,
            Color::Cyan => 36,
            Color::White => 37,
        }
    }
}

impl MessagePart {
    pub fn text(&self) -> &str {
        match self {
            MessagePart::Plain(text) => text,
            MessagePart::Styled { string, .. } => string,
        }
    }
}

impl BuildError {
    pub fn new(title: impl Into<String>, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            path: path.into(),
            message: vec![MessagePart::Plain(message.into())],
            fatal: false,
        }
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    fn header(&self) -> String {
        let rule = "-".repeat(self.title.len().clamp(8, 60));
        if self.path.is_empty() {
            format!("-- {} {rule}", self.title.to_uppercase())
        } else {
            format!("-- {} {rule} {}", self.title.to_uppercase(), self.path)
        }
    }

    /// Terminal rendering with ANSI styling.
    pub fn to_ansi(&self) -> String {
        let mut out = format!("\x1b[36m{}\x1b[0m\n\n", self.header());
        for part in &self.message {
            match part {
                MessagePart::Plain(text) => out.push_str(text),
                MessagePart::Styled {
                    string,
                    color,
                    bold,
                    underline,
                } => {
                    let mut codes = Vec::new();
                    if let Some(color) = color {
                        codes.push(color.ansi_code().to_string());
                    }
                    if *bold {
                        codes.push("1".to_string());
                    }
                    if *underline {
                        codes.push("4".to_string());
                    }
                    if codes.is_empty() {
                        out.push_str(string);
                    } else {
                        let _ = write!(out, "\x1b[{}m{string}\x1b[0m", codes.join(";"));
                    }
                }
            }
        }
        out
    }

    /// Rendering without escape codes, for logs and HTTP bodies.
    pub fn to_plain(&self) -> String {
        let mut out = format!("{}\n\n", self.header());
        for part in &self.message {
            out.push_str(part.text());
        }
        out
    }
}
