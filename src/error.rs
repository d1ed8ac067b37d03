//! Error types for the collator.
//!
//! All errors are strongly typed using thiserror. Configuration problems are
//! reported before any collective traffic happens; I/O and protocol problems
//! come out of the gather-and-store paths.

use std::io;

use thiserror::Error;

use crate::group::{Lane, Rank};

/// Configuration errors: invalid buffer budget or malformed request parameters.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid buffer size: {reason}")]
    InvalidBufferSize {
        reason: String,
    },

    #[error("Invalid write request: {reason}")]
    InvalidRequest {
        reason: String,
    },

    #[error("Invalid worker name: {reason}")]
    InvalidWorkerName {
        reason: String,
    },

    #[error("Group size must be at least 1 (got {size})")]
    EmptyGroup {
        size: usize,
    },
}

/// Protocol errors: a participant diverged from the collective call order,
/// disappeared, or sent something other than what was announced.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Rank {rank} disconnected on {lane:?} lane")]
    Disconnected {
        rank: Rank,
        lane: Lane,
    },

    #[error("Receive from rank {rank} on {lane:?} lane stalled after {timeout_ms}ms")]
    Stalled {
        rank: Rank,
        lane: Lane,
        timeout_ms: u64,
    },

    #[error("Invalid rank {rank}: group size is {size}")]
    InvalidRank {
        rank: Rank,
        size: usize,
    },

    #[error("Rank {rank} sent {actual} bytes, expected {expected}")]
    SizeMismatch {
        rank: Rank,
        expected: u64,
        actual: u64,
    },

    #[error("Malformed control message from rank {rank}: {reason}")]
    MalformedControl {
        rank: Rank,
        reason: String,
    },

    #[error("Size gather returned {actual} entries for a group of {expected}")]
    SizeCount {
        expected: usize,
        actual: usize,
    },
}

/// Top-level error type for the collator.
#[derive(Debug, Error)]
pub enum CollatorError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl CollatorError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid-request config error.
    #[must_use]
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::Config(ConfigError::InvalidRequest {
            reason: reason.into(),
        })
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a protocol error.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Returns true if this is an I/O error.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

/// Result type alias for collator operations.
pub type CollatorResult<T> = Result<T, CollatorError>;
