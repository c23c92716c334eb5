//! docstash - Dump/Restore Toolchain for Document Databases
//!
//! Serializes collections of length-prefixed binary documents into a
//! single multiplexed archive stream and restores them back, including
//! indexes, users/roles, and oplog replay, while coordinating many
//! concurrent producers and consumers safely.
//!
//! # Features
//!
//! - **Multiplexed Archive Format**: many independent per-collection
//!   document streams interleave into one sequential output, framed so
//!   the reader can split them apart again with no cross-contamination.
//!
//! - **End-to-End Integrity**: every namespace's EOF marker carries the
//!   CRC-64 of all of its body bytes, verified on read regardless of how
//!   sections interleaved.
//!
//! - **Parallel Scheduling**: an intent catalog hands work to N threads
//!   largest-task-first across databases, never two workers on one
//!   database at once.
//!
//! - **Store-Agnostic**: the document store is a capability trait;
//!   anything that can list, scan, insert, and run commands can be dumped
//!   and restored.
//!
//! # Architecture
//!
//! ```text
//! DUMP                                       RESTORE
//!
//! ┌────────┐ ┌────────┐ ┌────────┐           ┌──────────────────────┐
//! │Worker 1│ │Worker 2│ │Worker N│           │     Archive Stream    │
//! │ scan   │ │ scan   │ │ scan   │           └──────────┬───────────┘
//! └───┬────┘ └───┬────┘ └───┬────┘                      │
//!     │MuxIn     │MuxIn     │MuxIn           ┌──────────▼───────────┐
//!     └──────────┼──────────┘                │     Block Parser      │
//!                ▼                           │  (header body* term)* │
//!     ┌──────────────────────┐               └──────────┬───────────┘
//!     │  Multiplexer (1 thr) │                          │
//!     │  select{} dispatch   │               ┌──────────▼───────────┐
//!     │  header/terminator   │               │    Demultiplexer      │
//!     │  framing + checksums │               │  route by namespace,  │
//!     └──────────┬───────────┘               │  verify checksums     │
//!                │                           └─┬────────┬─────────┬─┘
//!                ▼                             │pipe    │pipe     │pipe
//!     ┌──────────────────────┐             ┌───▼──┐ ┌───▼──┐  ┌───▼──┐
//!     │    Archive Stream    │             │Wrk 1 │ │Wrk 2 │  │Wrk N │
//!     └──────────────────────┘             │insert│ │insert│  │insert│
//!                                          └──────┘ └──────┘  └──────┘
//! ```
//!
//! Scheduling on both sides runs through the [`intent`] catalog: discover
//! intents, `put` them (special namespaces divert to dedicated slots),
//! `finalize` a prioritizer, then workers `pop`/`finish` until drained.
//! The oplog replays strictly last; users/roles restore through a
//! server-side temp-collection merge.
//!
//! # Example
//!
//! ```bash
//! # Pack a dump directory into an archive on stdout, 8 producers
//! docstash pack dump/ -j 8 > nightly.archive
//!
//! # Verify and list it
//! docstash verify nightly.archive
//! docstash inspect nightly.archive
//!
//! # Split it back into files
//! docstash unpack nightly.archive -o restored/
//! ```

pub mod archive;
pub mod config;
pub mod docio;
pub mod dump;
pub mod error;
pub mod inspect;
pub mod intent;
pub mod metadata;
pub mod progress;
pub mod restore;
pub mod store;

pub use archive::{ArchiveHeader, ChecksumPolicy, Demultiplexer, Multiplexer, NamespaceHeader};
pub use error::{ArchiveError, Result, StashError};
pub use intent::{Intent, IntentManager, Namespace, PriorityMode};
