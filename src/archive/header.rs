//! Archive header documents
//!
//! Two small framed documents structure the archive stream:
//!
//! - [`ArchiveHeader`], written exactly once when the stream opens:
//!   format version plus provenance (server/tool versions, write-time
//!   concurrency).
//! - [`NamespaceHeader`], written before each contiguous run of body
//!   documents and again, with `eof=true` and the final checksum, when a
//!   namespace's producer closes.
//!
//! Both decode leniently - unknown fields from newer writers are skipped -
//! but missing required fields are corruption.

use crate::archive::FORMAT_VERSION;
use crate::docio::fields::{find_field, DocBuilder};
use crate::error::{ArchiveError, ArchiveResult};
use crate::intent::Namespace;

/// Top-level stream header, first document in every archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    /// Archive format version, currently [`FORMAT_VERSION`].
    pub version: String,

    /// Version string of the server the data came from ("unknown" for
    /// filesystem packs).
    pub server_version: String,

    /// Version of the tool that wrote the stream.
    pub tool_version: String,

    /// Number of concurrent producers used at write time.
    pub concurrent_collections: i32,
}

impl ArchiveHeader {
    pub fn new(server_version: impl Into<String>, concurrent_collections: i32) -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            server_version: server_version.into(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            concurrent_collections,
        }
    }

    pub fn to_doc(&self) -> Vec<u8> {
        let mut b = DocBuilder::new();
        b.append_str("version", &self.version)
            .append_str("server_version", &self.server_version)
            .append_str("tool_version", &self.tool_version)
            .append_i32("concurrent_collections", self.concurrent_collections);
        b.finish()
    }

    pub fn from_doc(doc: &[u8]) -> ArchiveResult<Self> {
        let version = require_str(doc, "version")?;
        if version != FORMAT_VERSION {
            return Err(ArchiveError::corrupt(format!(
                "unsupported archive format version '{version}' (expected '{FORMAT_VERSION}')"
            )));
        }
        Ok(Self {
            version,
            server_version: require_str(doc, "server_version")?,
            tool_version: require_str(doc, "tool_version")?,
            concurrent_collections: find_field(doc, "concurrent_collections")
                .map_err(|e| ArchiveError::corrupt(format!("archive header: {e}")))?
                .and_then(|f| f.as_i32())
                .unwrap_or(1),
        })
    }
}

/// Per-namespace section marker.
///
/// A non-EOF header opens (or re-opens) a namespace's run of body
/// documents; an EOF header closes the namespace for good and carries the
/// CRC-64 of every body byte written for it during the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceHeader {
    pub ns: Namespace,
    pub eof: bool,

    /// Cumulative body checksum; meaningful only when `eof` is set.
    pub crc: u64,
}

impl NamespaceHeader {
    pub fn open(ns: Namespace) -> Self {
        Self {
            ns,
            eof: false,
            crc: 0,
        }
    }

    pub fn eof(ns: Namespace, crc: u64) -> Self {
        Self { ns, eof: true, crc }
    }

    pub fn to_doc(&self) -> Vec<u8> {
        let mut b = DocBuilder::new();
        b.append_str("db", &self.ns.db)
            .append_str("collection", &self.ns.coll)
            .append_bool("EOF", self.eof)
            // Bit-cast: the wire carries the checksum as a signed 64-bit
            // integer element.
            .append_i64("CRC", self.crc as i64);
        b.finish()
    }

    pub fn from_doc(doc: &[u8]) -> ArchiveResult<Self> {
        let db = require_str(doc, "db")?;
        let coll = require_str(doc, "collection")?;
        let eof = find_field(doc, "EOF")
            .map_err(decode_err)?
            .and_then(|f| f.as_bool())
            .ok_or_else(|| ArchiveError::corrupt("namespace header missing 'EOF' field"))?;
        let crc = find_field(doc, "CRC")
            .map_err(decode_err)?
            .and_then(|f| f.as_i64())
            .ok_or_else(|| ArchiveError::corrupt("namespace header missing 'CRC' field"))?;
        Ok(Self {
            ns: Namespace::new(db, coll),
            eof,
            crc: crc as u64,
        })
    }
}

/// Read and decode the stream-open [`ArchiveHeader`]. An empty stream is
/// corruption here: even an archive with no namespaces carries a header.
pub fn read_archive_header<R: std::io::Read>(source: &mut R) -> ArchiveResult<ArchiveHeader> {
    // Header documents are tiny; a purpose-sized buffer keeps a corrupt
    // prefix from demanding a full document-sized allocation.
    let mut buf = vec![0u8; 64 * 1024];
    match crate::docio::load_doc(source, &mut buf) {
        Ok(Some(size)) => ArchiveHeader::from_doc(&buf[..size]),
        Ok(None) => Err(ArchiveError::corrupt("empty stream: missing archive header")),
        Err(e) => Err(e.into()),
    }
}

fn decode_err(e: crate::error::FramingError) -> ArchiveError {
    ArchiveError::corrupt(format!("undecodable header document: {e}"))
}

fn require_str(doc: &[u8], name: &str) -> ArchiveResult<String> {
    find_field(doc, name)
        .map_err(decode_err)?
        .and_then(|f| f.as_str().map(str::to_owned))
        .ok_or_else(|| ArchiveError::corrupt(format!("header missing string field '{name}'")))
}
