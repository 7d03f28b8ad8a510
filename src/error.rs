// src/error.rs

//! Typed error taxonomy for the memory subsystem.
//!
//! `Unavailable` is an expected steady state (no embedding backend), never a
//! failure; `CorruptState` and `WriteFailure` are surfaced to callers as
//! typed results rather than uncontrolled faults.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// No embedding backend could produce a vector. Callers fall back to
    /// tag/keyword matching; this never escalates past the retrieval layer.
    #[error("embedding backend unavailable")]
    Unavailable,

    /// A stored document failed to parse. The previous valid state is gone
    /// for this unit; callers should take the forced-rebuild path.
    #[error("corrupt memory document at {path}")]
    CorruptState { path: PathBuf },

    /// The unit's exclusive lock could not be acquired within the configured
    /// wait. The caller retries or queues.
    #[error("memory unit {unit} is busy")]
    LockContention { unit: String },

    /// An atomic write could not complete. On-disk state is guaranteed to
    /// remain at its last valid version.
    #[error("atomic write to {path} failed")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error")]
    Io(#[from] std::io::Error),

    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
