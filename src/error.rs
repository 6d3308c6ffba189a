//! Error types for OrionKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

use crate::protocol::FrameError;

/// Result type alias using OrionError
pub type Result<T> = std::result::Result<T, OrionError>;

/// Unified error type for OrionKV operations
#[derive(Debug, Error)]
pub enum OrionError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("wrong number of arguments for '{0}'")]
    WrongArity(&'static str),

    #[error("value is not a valid number")]
    ParseNumber,

    // -------------------------------------------------------------------------
    // Durability Errors
    // -------------------------------------------------------------------------
    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("log error: {0}")]
    Wal(String),

    // -------------------------------------------------------------------------
    // Network Errors
    // -------------------------------------------------------------------------
    #[error("network error: {0}")]
    Network(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),
}
