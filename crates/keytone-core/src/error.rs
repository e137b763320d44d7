//! Error types for keytone-core

use std::time::Duration;
use thiserror::Error;

/// Result type alias for keytone-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while requesting, dispatching or playing
#[derive(Debug, Error)]
pub enum Error {
    /// A required argument was absent
    #[error("<'{name}' | {} argument> is required", ordinal(.index))]
    MissingArgument { name: &'static str, index: usize },

    /// An argument had the wrong type or shape
    #[error("<'{name}' | {} argument> must be {expected}", ordinal(.index))]
    NotAcceptable {
        name: &'static str,
        index: usize,
        expected: &'static str,
    },

    /// The command path does not resolve to a known command
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// The background timing context is gone
    #[error("Command channel closed")]
    ChannelClosed,

    /// No matching reply arrived before the deadline
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// The voice backend could not start a voice
    #[error("Voice error: {0}")]
    Voice(String),

    /// A reply payload did not decode
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Render a 1-based argument position the way error messages expect ("1st", "2nd", ...)
fn ordinal(index: &usize) -> String {
    let suffix = match (index % 10, index % 100) {
        (1, n) if n != 11 => "st",
        (2, n) if n != 12 => "nd",
        (3, n) if n != 13 => "rd",
        _ => "th",
    };
    format!("{}{}", index, suffix)
}
