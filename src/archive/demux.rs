//! Archive demultiplexer
//!
//! The read-side inverse of the multiplexer: a [`BlockConsumer`] that
//! routes each block's body documents to the sink for the block's
//! namespace, switching sinks as non-EOF headers arrive and closing them
//! as EOF headers arrive. The archive's own ordering is the single source
//! of truth for "which namespace is current", so the demultiplexer runs
//! single-threaded over one input; its sinks may hand off to worker
//! threads (see [`demux_pipe`]).
//!
//! Every namespace's body bytes are folded into a running CRC-64 and
//! compared against the checksum its EOF header carries. What a mismatch
//! does is an explicit [`ChecksumPolicy`]: fail the read (`Strict`) or
//! log-and-count (`Warn`).

use crate::archive::checksum::Crc64;
use crate::archive::header::NamespaceHeader;
use crate::archive::parser::BlockConsumer;
use crate::error::{ArchiveError, ArchiveResult};
use crate::intent::Namespace;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::HashMap;
use std::io;
use tracing::{debug, warn};

/// How an EOF-header checksum mismatch is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumPolicy {
    /// Mismatch fails the read (default).
    #[default]
    Strict,

    /// Mismatch is logged and counted; the read continues.
    Warn,
}

/// Destination for one namespace's restored documents.
pub trait DemuxSink: Send {
    /// Receive one body document. The slice is only valid for the call.
    fn write_doc(&mut self, doc: &[u8]) -> io::Result<()>;

    /// The namespace's EOF header arrived; flush and release resources.
    fn finish(&mut self) -> io::Result<()>;
}

/// Opens the sink for a namespace first seen in the stream.
pub type SinkOpener = Box<dyn FnMut(&Namespace) -> io::Result<Box<dyn DemuxSink>> + Send>;

struct OpenNamespace {
    sink: Box<dyn DemuxSink>,
    crc: Crc64,
    docs: u64,
    bytes: u64,
}

/// Final accounting for one namespace after its EOF header.
#[derive(Debug, Clone, Copy)]
pub struct NamespaceStats {
    pub docs: u64,
    pub bytes: u64,

    /// Checksum computed over the body bytes actually read.
    pub computed_crc: u64,

    /// Checksum the EOF header carried.
    pub header_crc: u64,
}

impl NamespaceStats {
    pub fn crc_ok(&self) -> bool {
        self.computed_crc == self.header_crc
    }
}

/// Routes one archive stream's body documents to per-namespace sinks.
pub struct Demultiplexer {
    open: SinkOpener,
    policy: ChecksumPolicy,
    sinks: HashMap<Namespace, OpenNamespace>,
    current: Option<Namespace>,
    finished: Vec<(Namespace, NamespaceStats)>,
    mismatches: u64,
}

impl Demultiplexer {
    pub fn new(policy: ChecksumPolicy, open: SinkOpener) -> Self {
        Self {
            open,
            policy,
            sinks: HashMap::new(),
            current: None,
            finished: Vec::new(),
            mismatches: 0,
        }
    }

    /// Pre-register a sink instead of waiting for the lazy opener.
    pub fn register(&mut self, ns: Namespace, sink: Box<dyn DemuxSink>) {
        self.sinks.insert(
            ns,
            OpenNamespace {
                sink,
                crc: Crc64::new(),
                docs: 0,
                bytes: 0,
            },
        );
    }

    /// Per-namespace stats, in EOF order.
    pub fn finished(&self) -> &[(Namespace, NamespaceStats)] {
        &self.finished
    }

    /// Checksum mismatches tolerated under [`ChecksumPolicy::Warn`].
    pub fn mismatches(&self) -> u64 {
        self.mismatches
    }

    fn close_namespace(&mut self, header: NamespaceHeader) -> ArchiveResult<()> {
        let Some(mut open_ns) = self.sinks.remove(&header.ns) else {
            return Err(ArchiveError::corrupt(format!(
                "EOF header for namespace '{}' that was never opened",
                header.ns
            )));
        };
        self.current = None;

        let stats = NamespaceStats {
            docs: open_ns.docs,
            bytes: open_ns.bytes,
            computed_crc: open_ns.crc.sum(),
            header_crc: header.crc,
        };
        if !stats.crc_ok() {
            match self.policy {
                ChecksumPolicy::Strict => {
                    return Err(ArchiveError::ChecksumMismatch {
                        ns: header.ns,
                        expected: stats.header_crc,
                        actual: stats.computed_crc,
                    });
                }
                ChecksumPolicy::Warn => {
                    let expected = format!("{:#018x}", stats.header_crc);
                    let computed = format!("{:#018x}", stats.computed_crc);
                    warn!(
                        ns = %header.ns,
                        expected = %expected,
                        computed = %computed,
                        "checksum mismatch tolerated by policy"
                    );
                    self.mismatches += 1;
                }
            }
        }
        open_ns.sink.finish()?;
        debug!(ns = %header.ns, docs = stats.docs, bytes = stats.bytes, "namespace complete");
        self.finished.push((header.ns, stats));
        Ok(())
    }
}

impl BlockConsumer for Demultiplexer {
    fn header(&mut self, doc: &[u8]) -> ArchiveResult<()> {
        let header = NamespaceHeader::from_doc(doc)?;
        if header.eof {
            return self.close_namespace(header);
        }

        if !self.sinks.contains_key(&header.ns) {
            if self.finished.iter().any(|(ns, _)| *ns == header.ns) {
                return Err(ArchiveError::corrupt(format!(
                    "data for namespace '{}' after its EOF header",
                    header.ns
                )));
            }
            let sink = (self.open)(&header.ns)?;
            self.register(header.ns.clone(), sink);
        }
        self.current = Some(header.ns);
        Ok(())
    }

    fn body(&mut self, doc: &[u8]) -> ArchiveResult<()> {
        let Some(ns) = &self.current else {
            return Err(ArchiveError::OrphanBody);
        };
        let open_ns = self.sinks.get_mut(ns).expect("current namespace has a sink");
        open_ns.crc.update(doc);
        open_ns.docs += 1;
        open_ns.bytes += doc.len() as u64;
        open_ns.sink.write_doc(doc)?;
        Ok(())
    }

    fn end(&mut self) -> ArchiveResult<()> {
        if self.sinks.is_empty() {
            return Ok(());
        }
        let mut names: Vec<String> = self.sinks.keys().map(ToString::to_string).collect();
        names.sort();
        Err(ArchiveError::UnterminatedNamespaces {
            namespaces: names.join(", "),
        })
    }
}

/// Sink that drops everything. Checksums and counts still accumulate in
/// the demultiplexer, which is exactly what verification-only reads and
/// filtered-out namespaces need.
pub struct DiscardSink;

impl DemuxSink for DiscardSink {
    fn write_doc(&mut self, _doc: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that forwards documents into a bounded channel, for handing one
/// namespace's stream to a restore worker on another thread.
pub struct PipeSink {
    tx: Option<Sender<Vec<u8>>>,
}

impl DemuxSink for PipeSink {
    fn write_doc(&mut self, doc: &[u8]) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe already finished"))?;
        tx.send(doc.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe consumer dropped"))
    }

    fn finish(&mut self) -> io::Result<()> {
        // Dropping the sender is the end-of-stream signal.
        self.tx = None;
        Ok(())
    }
}

/// Consumer side of a [`demux_pipe`]; iterates owned documents until the
/// sink finishes.
pub struct PipeDocs {
    rx: Receiver<Vec<u8>>,
}

impl Iterator for PipeDocs {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().ok()
    }
}

/// A bounded document pipe: the demultiplexer writes into the sink, a
/// worker thread drains the other end. Capacity bounds memory; the
/// demultiplexer blocks when the worker falls behind.
pub fn demux_pipe(capacity: usize) -> (PipeSink, PipeDocs) {
    let (tx, rx) = bounded(capacity);
    (PipeSink { tx: Some(tx) }, PipeDocs { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::checksum::crc64;
    use crate::archive::parser::BlockParser;
    use crate::archive::TERMINATOR_BYTES;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn doc(fill: u8, size: usize) -> Vec<u8> {
        let mut d = vec![fill; size];
        d[..4].copy_from_slice(&(size as i32).to_le_bytes());
        d[size - 1] = 0;
        d
    }

    /// Sink capturing docs into a shared vec.
    struct CaptureSink {
        docs: Arc<Mutex<Vec<Vec<u8>>>>,
        finished: Arc<Mutex<bool>>,
    }

    impl DemuxSink for CaptureSink {
        fn write_doc(&mut self, doc: &[u8]) -> io::Result<()> {
            self.docs.lock().unwrap().push(doc.to_vec());
            Ok(())
        }

        fn finish(&mut self) -> io::Result<()> {
            *self.finished.lock().unwrap() = true;
            Ok(())
        }
    }

    type Captured = Arc<Mutex<HashMap<Namespace, Arc<Mutex<Vec<Vec<u8>>>>>>>;

    fn capturing_demux(policy: ChecksumPolicy) -> (Demultiplexer, Captured) {
        let captured: Captured = Arc::new(Mutex::new(HashMap::new()));
        let captured_clone = Arc::clone(&captured);
        let demux = Demultiplexer::new(
            policy,
            Box::new(move |ns: &Namespace| {
                let docs = Arc::new(Mutex::new(Vec::new()));
                captured_clone
                    .lock()
                    .unwrap()
                    .insert(ns.clone(), Arc::clone(&docs));
                Ok(Box::new(CaptureSink {
                    docs,
                    finished: Arc::new(Mutex::new(false)),
                }) as Box<dyn DemuxSink>)
            }),
        );
        (demux, captured)
    }

    /// Build a valid interleaved stream: a(d1), b(d3), a(d2), EOFs.
    fn interleaved_stream() -> (Vec<u8>, Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let ns_a = Namespace::new("db", "a");
        let ns_b = Namespace::new("db", "b");
        let a_docs = vec![doc(1, 16), doc(2, 20)];
        let b_docs = vec![doc(3, 24)];

        let mut out = Vec::new();
        let mut push_block = |header: NamespaceHeader, bodies: &[Vec<u8>]| {
            out.extend_from_slice(&header.to_doc());
            for b in bodies {
                out.extend_from_slice(b);
            }
            out.extend_from_slice(&TERMINATOR_BYTES);
        };
        push_block(NamespaceHeader::open(ns_a.clone()), &a_docs[..1]);
        push_block(NamespaceHeader::open(ns_b.clone()), &b_docs);
        push_block(NamespaceHeader::open(ns_a.clone()), &a_docs[1..]);
        push_block(
            NamespaceHeader::eof(ns_a.clone(), crc64(&a_docs.concat())),
            &[],
        );
        push_block(
            NamespaceHeader::eof(ns_b.clone(), crc64(&b_docs.concat())),
            &[],
        );
        (out, a_docs, b_docs)
    }

    #[test]
    fn test_routes_interleaved_namespaces() {
        let (bytes, a_docs, b_docs) = interleaved_stream();
        let (mut demux, captured) = capturing_demux(ChecksumPolicy::Strict);
        BlockParser::new(Cursor::new(bytes))
            .read_all_blocks(&mut demux)
            .unwrap();

        let captured = captured.lock().unwrap();
        let got_a = captured[&Namespace::new("db", "a")].lock().unwrap().clone();
        let got_b = captured[&Namespace::new("db", "b")].lock().unwrap().clone();
        assert_eq!(got_a, a_docs);
        assert_eq!(got_b, b_docs);

        assert_eq!(demux.finished().len(), 2);
        assert!(demux.finished().iter().all(|(_, s)| s.crc_ok()));
        assert_eq!(demux.mismatches(), 0);
    }

    fn corrupt_crc_stream() -> Vec<u8> {
        let ns = Namespace::new("db", "a");
        let body = doc(1, 16);
        let mut out = Vec::new();
        out.extend_from_slice(&NamespaceHeader::open(ns.clone()).to_doc());
        out.extend_from_slice(&body);
        out.extend_from_slice(&TERMINATOR_BYTES);
        out.extend_from_slice(&NamespaceHeader::eof(ns, 0xBAD).to_doc());
        out.extend_from_slice(&TERMINATOR_BYTES);
        out
    }

    #[test]
    fn test_checksum_mismatch_strict_fails() {
        let (mut demux, _) = capturing_demux(ChecksumPolicy::Strict);
        let err = BlockParser::new(Cursor::new(corrupt_crc_stream()))
            .read_all_blocks(&mut demux)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_checksum_mismatch_warn_continues() {
        let (mut demux, _) = capturing_demux(ChecksumPolicy::Warn);
        BlockParser::new(Cursor::new(corrupt_crc_stream()))
            .read_all_blocks(&mut demux)
            .unwrap();
        assert_eq!(demux.mismatches(), 1);
        assert!(!demux.finished()[0].1.crc_ok());
    }

    #[test]
    fn test_missing_eof_detected_at_end() {
        let ns = Namespace::new("db", "a");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&NamespaceHeader::open(ns).to_doc());
        bytes.extend_from_slice(&doc(1, 16));
        bytes.extend_from_slice(&TERMINATOR_BYTES);

        let (mut demux, _) = capturing_demux(ChecksumPolicy::Strict);
        let err = BlockParser::new(Cursor::new(bytes))
            .read_all_blocks(&mut demux)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::UnterminatedNamespaces { .. }));
        assert!(err.to_string().contains("db.a"));
    }

    #[test]
    fn test_eof_for_unknown_namespace_is_corruption() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&NamespaceHeader::eof(Namespace::new("db", "ghost"), 0).to_doc());
        bytes.extend_from_slice(&TERMINATOR_BYTES);

        let (mut demux, _) = capturing_demux(ChecksumPolicy::Strict);
        let err = BlockParser::new(Cursor::new(bytes))
            .read_all_blocks(&mut demux)
            .unwrap_err();
        assert!(err.to_string().contains("never opened"));
    }

    #[test]
    fn test_data_after_eof_is_corruption() {
        let ns = Namespace::new("db", "a");
        let body = doc(1, 16);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&NamespaceHeader::open(ns.clone()).to_doc());
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&TERMINATOR_BYTES);
        bytes.extend_from_slice(&NamespaceHeader::eof(ns.clone(), crc64(&body)).to_doc());
        bytes.extend_from_slice(&TERMINATOR_BYTES);
        // Reopen after EOF.
        bytes.extend_from_slice(&NamespaceHeader::open(ns).to_doc());
        bytes.extend_from_slice(&TERMINATOR_BYTES);

        let (mut demux, _) = capturing_demux(ChecksumPolicy::Strict);
        let err = BlockParser::new(Cursor::new(bytes))
            .read_all_blocks(&mut demux)
            .unwrap_err();
        assert!(err.to_string().contains("after its EOF header"));
    }

    #[test]
    fn test_pipe_delivers_then_ends() {
        let (mut sink, docs) = demux_pipe(4);
        sink.write_doc(&doc(1, 8)).unwrap();
        sink.write_doc(&doc(2, 8)).unwrap();
        sink.finish().unwrap();
        let collected: Vec<_> = docs.collect();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0], doc(1, 8));
    }
}
