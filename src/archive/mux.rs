//! Archive multiplexer
//!
//! Accepts document writes from many per-namespace producers, each on its
//! own thread, and serializes them into one header-framed output stream.
//! A single dispatch thread owns the output; producers talk to it through
//! channels:
//!
//! - a control channel registers new inputs ([`MuxHandle::open`]);
//! - each input has a bounded data channel plus a recycle channel, so a
//!   producer's [`MuxIn::write_doc`] hands over a buffer and blocks until
//!   the dispatch thread returns it - a synchronous handoff that bounds
//!   memory to two buffers per producer;
//! - close is acknowledged only after the namespace's EOF header and
//!   terminator have been flushed, so a reader that sees an EOF header
//!   can trust the checksum is final.
//!
//! The dispatch thread waits on `crossbeam_channel::Select` across the
//! control channel and every active input, servicing exactly one source
//! per framing decision; the active-input list is mutated only by the
//! dispatch thread itself.
//!
//! On the first output write error the dispatch thread stops writing and
//! swallows everything that follows, still acknowledging producers so
//! none of them deadlocks; the error is reported exactly once, from
//! [`Multiplexer::finish`].

use crate::archive::checksum::Crc64;
use crate::archive::header::{ArchiveHeader, NamespaceHeader};
use crate::archive::TERMINATOR_BYTES;
use crate::error::{ArchiveError, ArchiveResult};
use crate::intent::Namespace;
use crossbeam_channel::{bounded, unbounded, Receiver, Select, Sender};
use std::io::{self, BufWriter, Write};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Producer-side buffer bound. A `write_doc` that fills the buffer past
/// this hands it to the dispatch thread; batching only, the framing
/// contract is identical with a 1-byte bound.
pub const MUX_WRITE_BUFFER: usize = 1024 * 1024;

enum MuxChunk {
    /// A run of already-framed documents for this input's namespace.
    Data(Vec<u8>),

    /// Producer closed; carries its final checksum for the EOF header.
    Eof(u64),
}

struct MuxOpen {
    ns: Namespace,
    data: Receiver<MuxChunk>,
    recycle: Sender<Vec<u8>>,
    finished: Sender<()>,
}

struct ActiveInput {
    ns: Namespace,
    data: Receiver<MuxChunk>,
    recycle: Sender<Vec<u8>>,
    finished: Sender<()>,
}

/// Totals the dispatch thread hands back from [`Multiplexer::finish`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MuxStats {
    /// Namespaces closed with an EOF header.
    pub namespaces: u64,

    /// Body bytes written (framing documents excluded).
    pub body_bytes: u64,
}

/// Cloneable registration handle; one per producer-spawning site.
///
/// All clones (and all open [`MuxIn`]s) must be dropped/closed before
/// [`Multiplexer::finish`] can return.
#[derive(Clone)]
pub struct MuxHandle {
    control: Sender<MuxOpen>,
}

impl MuxHandle {
    /// Register a new producer input for `ns` with the dispatch thread.
    pub fn open(&self, ns: Namespace) -> ArchiveResult<MuxIn> {
        let (data_tx, data_rx) = bounded(1);
        let (recycle_tx, recycle_rx) = bounded(1);
        let (finished_tx, finished_rx) = bounded(1);
        self.control
            .send(MuxOpen {
                ns: ns.clone(),
                data: data_rx,
                recycle: recycle_tx,
                finished: finished_tx,
            })
            .map_err(|_| ArchiveError::MuxStopped)?;
        Ok(MuxIn {
            ns,
            buf: Vec::with_capacity(MUX_WRITE_BUFFER),
            crc: Crc64::new(),
            docs: 0,
            data: data_tx,
            recycle: recycle_rx,
            finished: finished_rx,
        })
    }
}

/// Per-namespace producer handle into the multiplexer.
///
/// One producer thread per handle; concurrency is across namespaces, and
/// byte order within a namespace is exactly this producer's write order.
pub struct MuxIn {
    ns: Namespace,
    buf: Vec<u8>,
    crc: Crc64,
    docs: u64,
    data: Sender<MuxChunk>,
    recycle: Receiver<Vec<u8>>,
    finished: Receiver<()>,
}

impl MuxIn {
    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Documents written so far through this handle.
    pub fn docs_written(&self) -> u64 {
        self.docs
    }

    /// Append one framed document. May block on the dispatch thread if
    /// the internal buffer fills.
    pub fn write_doc(&mut self, doc: &[u8]) -> ArchiveResult<()> {
        self.crc.update(doc);
        self.docs += 1;
        self.buf.extend_from_slice(doc);
        if self.buf.len() >= MUX_WRITE_BUFFER {
            self.flush()?;
        }
        Ok(())
    }

    /// Hand any buffered documents to the dispatch thread now, blocking
    /// until it has taken them.
    pub fn flush(&mut self) -> ArchiveResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let full = std::mem::take(&mut self.buf);
        self.data
            .send(MuxChunk::Data(full))
            .map_err(|_| ArchiveError::MuxStopped)?;
        self.buf = self.recycle.recv().map_err(|_| ArchiveError::MuxStopped)?;
        Ok(())
    }

    /// Flush, write this namespace's EOF header (with the final
    /// checksum), and wait for it to be durably framed. Returns the
    /// checksum. Dropping a `MuxIn` without closing it aborts the
    /// namespace: no EOF header is ever written for it.
    pub fn close(mut self) -> ArchiveResult<u64> {
        self.flush()?;
        let crc = self.crc.sum();
        self.data
            .send(MuxChunk::Eof(crc))
            .map_err(|_| ArchiveError::MuxStopped)?;
        self.finished.recv().map_err(|_| ArchiveError::MuxStopped)?;
        Ok(crc)
    }
}

/// Owns the dispatch thread for one archive output.
pub struct Multiplexer {
    handle: Option<JoinHandle<ArchiveResult<MuxStats>>>,
    control: Option<MuxHandle>,
}

impl Multiplexer {
    /// Spawn the dispatch thread and write the stream-open header.
    pub fn spawn<W: Write + Send + 'static>(out: W, header: ArchiveHeader) -> ArchiveResult<Self> {
        let (control_tx, control_rx) = unbounded();
        let handle = thread::Builder::new()
            .name("archive-mux".into())
            .spawn(move || dispatch_loop(out, header, control_rx))
            .map_err(ArchiveError::Io)?;
        Ok(Self {
            handle: Some(handle),
            control: Some(MuxHandle {
                control: control_tx,
            }),
        })
    }

    /// A registration handle for producers.
    pub fn handle(&self) -> MuxHandle {
        self.control.clone().expect("multiplexer not finished")
    }

    /// Drop the registration channel and wait for the dispatch thread.
    /// Blocks until every cloned handle is dropped and every open input
    /// is closed; surfaces the first output error exactly once.
    pub fn finish(mut self) -> ArchiveResult<MuxStats> {
        self.control.take();
        let handle = self.handle.take().expect("multiplexer joined twice");
        match handle.join() {
            Ok(result) => result,
            Err(_) => {
                warn!("multiplexer dispatch thread panicked");
                Err(ArchiveError::MuxStopped)
            }
        }
    }
}

/// Output wrapper with a one-shot error latch: the first failed write
/// poisons it into a no-op sink, and the stored error is surfaced once at
/// the end.
struct FaultSink<W: Write> {
    out: BufWriter<W>,
    fault: Option<io::Error>,
}

impl<W: Write> FaultSink<W> {
    fn new(out: W) -> Self {
        Self {
            out: BufWriter::new(out),
            fault: None,
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        if self.fault.is_some() {
            return;
        }
        if let Err(e) = self.out.write_all(bytes) {
            warn!(error = %e, "archive output failed; discarding further writes");
            self.fault = Some(e);
        }
    }

    fn flush(&mut self) {
        if self.fault.is_some() {
            return;
        }
        if let Err(e) = self.out.flush() {
            warn!(error = %e, "archive output flush failed; discarding further writes");
            self.fault = Some(e);
        }
    }

    fn into_result(mut self, stats: MuxStats) -> ArchiveResult<MuxStats> {
        self.flush();
        match self.fault {
            Some(e) => Err(ArchiveError::Io(e)),
            None => Ok(stats),
        }
    }
}

enum Action {
    Register(MuxOpen),
    ControlClosed,
    Data(usize, Vec<u8>),
    Eof(usize, u64),
    Aborted(usize),
}

fn dispatch_loop<W: Write>(
    out: W,
    header: ArchiveHeader,
    control: Receiver<MuxOpen>,
) -> ArchiveResult<MuxStats> {
    let mut sink = FaultSink::new(out);
    sink.write(&header.to_doc());

    let mut inputs: Vec<ActiveInput> = Vec::new();
    let mut control_open = true;
    let mut current: Option<Namespace> = None;
    let mut stats = MuxStats::default();

    loop {
        if !control_open && inputs.is_empty() {
            break;
        }

        // The select set is rebuilt each pass: it changes only on
        // open/close, and the set is worker-count sized.
        let action = {
            let mut sel = Select::new();
            let control_idx = control_open.then(|| sel.recv(&control));
            let input_idx: Vec<usize> = inputs.iter().map(|input| sel.recv(&input.data)).collect();

            let oper = sel.select();
            let idx = oper.index();
            if Some(idx) == control_idx {
                match oper.recv(&control) {
                    Ok(open) => Action::Register(open),
                    Err(_) => Action::ControlClosed,
                }
            } else {
                let pos = input_idx
                    .iter()
                    .position(|&i| i == idx)
                    .expect("selected index maps to an input");
                match oper.recv(&inputs[pos].data) {
                    Ok(MuxChunk::Data(buf)) => Action::Data(pos, buf),
                    Ok(MuxChunk::Eof(crc)) => Action::Eof(pos, crc),
                    Err(_) => Action::Aborted(pos),
                }
            }
        };

        match action {
            Action::Register(open) => {
                debug!(ns = %open.ns, "multiplexer input opened");
                inputs.push(ActiveInput {
                    ns: open.ns,
                    data: open.data,
                    recycle: open.recycle,
                    finished: open.finished,
                });
            }
            Action::ControlClosed => control_open = false,
            Action::Data(pos, mut buf) => {
                let input = &inputs[pos];
                if current.as_ref() != Some(&input.ns) {
                    if current.is_some() {
                        sink.write(&TERMINATOR_BYTES);
                    }
                    sink.write(&NamespaceHeader::open(input.ns.clone()).to_doc());
                    current = Some(input.ns.clone());
                }
                sink.write(&buf);
                stats.body_bytes += buf.len() as u64;
                buf.clear();
                // A producer that vanished mid-handoff just loses its
                // buffer back; nothing to do.
                let _ = input.recycle.send(buf);
            }
            Action::Eof(pos, crc) => {
                let input = inputs.swap_remove(pos);
                if current.take().is_some() {
                    sink.write(&TERMINATOR_BYTES);
                }
                sink.write(&NamespaceHeader::eof(input.ns.clone(), crc).to_doc());
                sink.write(&TERMINATOR_BYTES);
                // The close contract: the EOF framing reaches the output
                // before the producer's close() returns.
                sink.flush();
                stats.namespaces += 1;
                let crc_hex = format!("{crc:#018x}");
                debug!(ns = %input.ns, crc = %crc_hex, "namespace closed");
                let _ = input.finished.send(());
            }
            Action::Aborted(pos) => {
                let input = inputs.swap_remove(pos);
                warn!(ns = %input.ns, "producer dropped without close; namespace left without EOF header");
            }
        }
    }

    sink.into_result(stats)
}
