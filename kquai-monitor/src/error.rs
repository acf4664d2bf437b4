//! Common error types for kquai-monitor.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.

use std::time::Duration;

use thiserror::Error;

/// Main error type for kquai-monitor operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Network failures, malformed response bodies
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Node answered with a non-success HTTP status
    #[error("HTTP {status} from node ({context})")]
    HttpStatus {
        status: reqwest::StatusCode,
        context: String,
    },

    /// Call did not complete before its deadline
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// JSON-RPC `error` member in a response
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Response shape violates JSON-RPC expectations
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Every slice of a split batch failed
    #[error("All {slices} batch slices failed, first: {first}")]
    BatchFailed { slices: usize, first: String },

    /// Rebuild produced no entries
    #[error("No blocks in window {start}..={end}")]
    EmptyWindow { start: u64, end: u64 },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// True for failures of the HTTP exchange itself, as opposed to a
    /// well-formed answer the node rejected.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::HttpStatus { .. } | Error::Timeout(_)
        )
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
