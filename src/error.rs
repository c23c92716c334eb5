//! Error types for docstash
//!
//! This module defines the error hierarchy covering:
//! - Raw document framing (truncation vs. clean end, size bounds)
//! - Archive parsing/writing (corruption, checksums, multiplexer faults)
//! - Document-store collaborator errors
//! - Configuration and CLI errors
//! - Worker thread errors
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Corruption errors state what was expected vs. what was found
//! - Clean end-of-input is never an error; truncation always is
//! - Scheduler misuse (Put after Finalize, etc.) panics instead of
//!   returning an error: a broken caller must not limp on

use crate::intent::Namespace;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the docstash toolchain
#[derive(Error, Debug)]
pub enum StashError {
    /// Archive framing/parsing/writing errors
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Document-store collaborator errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker/concurrency errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Dump-directory discovery errors
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Metadata JSON errors
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interrupted by signal
    #[error("Operation interrupted by signal")]
    Interrupted,
}

/// Raw document framing errors
///
/// Clean end-of-input is not represented here: the framer reports it as
/// `Ok(None)` so read loops can terminate normally.
#[derive(Error, Debug)]
pub enum FramingError {
    /// Declared document length is out of bounds or exceeds the buffer
    #[error("invalid document size {size}: must be between {min} and {max} bytes")]
    InvalidSize { size: i32, min: i32, max: i32 },

    /// Stream ended in the middle of a document (or its length prefix)
    #[error("truncated document: declared {declared} bytes, stream ended after {read}")]
    Truncated { declared: i32, read: usize },

    /// Document does not end with the mandatory zero byte
    #[error("malformed document: final byte is {found:#04x}, expected 0x00")]
    Unterminated { found: u8 },

    /// An element inside a document could not be walked
    #[error("malformed document element: {reason}")]
    BadElement { reason: String },

    /// Underlying read failed
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// True for errors that indicate corrupt input rather than an I/O fault
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            FramingError::InvalidSize { .. }
                | FramingError::Truncated { .. }
                | FramingError::Unterminated { .. }
        )
    }
}

/// Archive stream errors (parser, demultiplexer, multiplexer)
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Document-level framing failure inside the archive
    #[error("framing: {0}")]
    Framing(#[from] FramingError),

    /// Grammar-level corruption (bad block structure, undecodable header)
    #[error("corrupt archive: {reason}")]
    Corrupt { reason: String },

    /// EOF-header checksum does not match the accumulated body checksum
    #[error("checksum mismatch for {ns}: header carries {expected:#018x}, computed {actual:#018x}")]
    ChecksumMismatch {
        ns: Namespace,
        expected: u64,
        actual: u64,
    },

    /// Stream ended while namespaces were still open (no EOF header seen)
    #[error("archive ended without EOF header for: {namespaces}")]
    UnterminatedNamespaces { namespaces: String },

    /// Body bytes arrived with no namespace header preceding them
    #[error("body document with no current namespace")]
    OrphanBody,

    /// The multiplexer dispatch thread is gone
    #[error("multiplexer stopped before this input completed")]
    MuxStopped,

    /// Write to the archive output failed
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    /// Convenience constructor for grammar-level corruption
    pub fn corrupt(reason: impl Into<String>) -> Self {
        ArchiveError::Corrupt {
            reason: reason.into(),
        }
    }
}

/// Document-store collaborator errors
///
/// Produced by `StoreClient`/`StoreSession` implementations; the core
/// treats these as opaque capability failures.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Session/connection acquisition failed
    #[error("failed to acquire session: {0}")]
    Session(String),

    /// A command was rejected by the store
    #[error("command '{command}' failed: {reason}")]
    Command { command: String, reason: String },

    /// Namespace does not exist
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    /// A write (insert/remove/drop) failed
    #[error("write to '{ns}' failed: {reason}")]
    WriteFailed { ns: String, reason: String },

    /// Cursor iteration failed mid-scan
    #[error("cursor failed on '{ns}': {reason}")]
    Cursor { ns: String, reason: String },
}

/// Dump-directory discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Root directory missing or unreadable
    #[error("cannot read dump root '{path}': {reason}")]
    RootUnreadable { path: PathBuf, reason: String },

    /// Directory entry could not be examined
    #[error("cannot stat '{path}': {reason}")]
    EntryUnreadable { path: PathBuf, reason: String },
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid parallel job count
    #[error("invalid job count {count}: must be between 1 and {max}")]
    InvalidJobs { count: usize, max: usize },

    /// Input/output path problem
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// Oplog limit string did not parse
    #[error("invalid oplog limit '{value}': expected <seconds>[:ordinal]")]
    InvalidOplogLimit { value: String },
}

/// Worker thread errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Worker initialization failed
    #[error("failed to start worker {id}: {reason}")]
    SpawnFailed { id: usize, reason: String },

    /// Worker panicked
    #[error("worker {id} panicked")]
    Panicked { id: usize },

    /// One collection's restore/dump failed
    #[error("{ns}: {source}")]
    IntentFailed {
        ns: Namespace,
        #[source]
        source: Box<StashError>,
    },
}

/// Result type alias for StashError
pub type Result<T> = std::result::Result<T, StashError>;

/// Result type alias for FramingError
pub type FramingResult<T> = std::result::Result<T, FramingError>;

/// Result type alias for ArchiveError
pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;

/// Result type alias for StoreError
pub type StoreResult<T> = std::result::Result<T, StoreError>;
