//! The multiplexed archive format
//!
//! An archive is one sequential byte stream interleaving many independent
//! per-namespace document streams:
//!
//! ```text
//! ArchiveHeader (NamespaceHeader Body* Terminator)*
//! ```
//!
//! Every document is length-prefixed per [`crate::docio`]; the terminator
//! is the 4-byte sentinel `-1_i32`, which no valid length prefix can
//! produce. A namespace's final (EOF) header carries the CRC-64 of all of
//! its body bytes, so a reader can verify integrity end to end no matter
//! how the sections were interleaved.
//!
//! Writing goes through the [`mux::Multiplexer`] (many concurrent
//! producers, one dispatch thread, one output); reading goes through the
//! [`parser::BlockParser`] driving a [`demux::Demultiplexer`] (one input,
//! many sinks).

pub mod checksum;
pub mod demux;
pub mod header;
pub mod mux;
pub mod parser;

pub use demux::{ChecksumPolicy, Demultiplexer, DemuxSink};
pub use header::{ArchiveHeader, NamespaceHeader};
pub use mux::{Multiplexer, MuxHandle, MuxIn};
pub use parser::{BlockConsumer, BlockParser};

use crate::error::ArchiveResult;
use std::io::Read;

/// Archive format version, written into every [`ArchiveHeader`].
pub const FORMAT_VERSION: &str = "0.1";

/// The block terminator sentinel as an i32.
pub const TERMINATOR: i32 = -1;

/// The block terminator sentinel on the wire: `0xFF 0xFF 0xFF 0xFF`.
pub const TERMINATOR_BYTES: [u8; 4] = TERMINATOR.to_le_bytes();

/// Read one whole archive: the stream header, then all blocks into
/// `demux`. Returns the decoded [`ArchiveHeader`].
pub fn read_archive<R: Read>(
    source: &mut R,
    demux: &mut Demultiplexer,
) -> ArchiveResult<ArchiveHeader> {
    let archive_header = header::read_archive_header(source)?;
    let mut parser = BlockParser::new(source);
    parser.read_all_blocks(demux)?;
    Ok(archive_header)
}
