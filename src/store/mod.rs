//! Document-store collaborator interface
//!
//! The engine never talks a wire protocol itself. Everything it needs
//! from a live document store is expressed as the capability traits in
//! this module, and any conforming implementation satisfies it - the
//! [`mem`] module provides the in-memory one the test suite uses.
//!
//! Workers never share a connection: each acquires its own
//! [`StoreSession`] from the [`StoreClient`] and returns it by dropping
//! it. Pooling, topology detection, and authentication are the
//! implementation's business.
//!
//! Commands, collection options, and index definitions travel as JSON
//! values; documents travel as raw framed bytes (see [`crate::docio`]).

pub mod mem;

use crate::error::StoreResult;
use crate::intent::Namespace;
use serde_json::Value;
use std::time::Duration;

/// A raw framed document, owned.
pub type RawDoc = Vec<u8>;

/// Where reads are directed when the store is a replicated topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    #[default]
    Primary,
    Nearest,
    SecondaryPreferred,
}

/// Session acquisition knobs.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub read_preference: ReadPreference,
    pub timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_preference: ReadPreference::Primary,
            timeout: Duration::from_secs(30),
        }
    }
}

/// One collection as the store enumerates it.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,

    /// Creation options (capped, validators, collation, ...), opaque to
    /// the engine.
    pub options: Value,

    /// Approximate data size in bytes; drives largest-task-first
    /// scheduling.
    pub size: u64,
}

/// Options for [`StoreSession::find_one`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub skip: u64,

    /// Sort specification, e.g. `{"$natural": -1}`.
    pub sort: Option<Value>,
}

/// Streaming cursor over one collection's documents.
pub trait DocCursor: Send {
    fn next_doc(&mut self) -> StoreResult<Option<RawDoc>>;
}

/// Session factory; the only thing the orchestrators hold long-term.
pub trait StoreClient: Send + Sync {
    fn session(&self, options: &SessionOptions) -> StoreResult<Box<dyn StoreSession>>;

    /// Server version string for archive provenance.
    fn server_version(&self) -> String {
        "unknown".to_string()
    }
}

/// One worker's private channel to the store.
pub trait StoreSession: Send {
    fn list_databases(&mut self) -> StoreResult<Vec<String>>;

    fn list_collections(&mut self, db: &str) -> StoreResult<Vec<CollectionInfo>>;

    fn list_indexes(&mut self, ns: &Namespace) -> StoreResult<Vec<Value>>;

    /// Full-collection scan in natural order.
    fn scan(&mut self, ns: &Namespace) -> StoreResult<Box<dyn DocCursor>>;

    fn create_collection(&mut self, ns: &Namespace, options: &Value) -> StoreResult<()>;

    fn drop_collection(&mut self, ns: &Namespace) -> StoreResult<()>;

    fn insert_batch(&mut self, ns: &Namespace, docs: &[RawDoc]) -> StoreResult<()>;

    fn create_indexes(&mut self, ns: &Namespace, indexes: &[Value]) -> StoreResult<()>;

    /// Run an arbitrary database-level command.
    fn run_command(&mut self, db: &str, command: &Value) -> StoreResult<Value>;

    fn find_one(
        &mut self,
        ns: &Namespace,
        filter: &Value,
        options: &FindOptions,
    ) -> StoreResult<Option<RawDoc>>;

    /// Remove documents matching `filter`; returns the removed count.
    fn remove_matching(&mut self, ns: &Namespace, filter: &Value) -> StoreResult<u64>;

    /// Apply a batch of oplog operations; returns the applied count.
    fn apply_ops(&mut self, ops: &[RawDoc]) -> StoreResult<u64>;
}
