//! Restore orchestration
//!
//! Three restore shapes share the same machinery:
//!
//! - [`restore_directory`]: dump directory into a live store. Discovery
//!   builds intents, the intent manager schedules them, and N worker
//!   threads pop/restore/finish. Users/roles are merged afterwards
//!   through a temp collection, and the oplog replays last.
//! - [`restore_archive`]: archive stream into a live store. The
//!   demultiplexer runs on the calling thread and feeds bounded pipes; a
//!   worker pool drains one pipe per namespace.
//! - [`unpack_archive`]: archive stream back into a dump directory, one
//!   file sink per namespace.
//!
//! Worker failures report into a bounded error channel and stop further
//! dispatch; in-flight siblings finish their current intent undisturbed,
//! and the first error wins.

pub mod discovery;
pub mod oplog;

use crate::archive::demux::{demux_pipe, DiscardSink, NamespaceStats, PipeDocs};
use crate::archive::{
    read_archive, ArchiveHeader, ChecksumPolicy, Demultiplexer, DemuxSink,
};
use crate::docio::{validate_doc, DocSource};
use crate::error::{ArchiveError, Result, StashError, WorkerError};
use crate::intent::{Intent, IntentManager, Namespace, NsFilter, PriorityMode};
use crate::metadata::CollectionMetadata;
use crate::progress::ProgressTracker;
use crate::store::{RawDoc, SessionOptions, StoreClient, StoreSession};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Documents per insert batch.
const INSERT_BATCH_DOCS: usize = 1000;

/// Byte bound per insert batch.
const INSERT_BATCH_BYTES: usize = 8 * 1024 * 1024;

/// Documents buffered per demux pipe before the reader blocks.
const PIPE_CAPACITY: usize = 256;

/// How long an idle worker waits when every eligible database is
/// checked out by a sibling.
const POP_RETRY: Duration = Duration::from_millis(5);

/// Temp collections for the users/roles merge.
const TEMP_USERS: &str = "tempusers";
const TEMP_ROLES: &str = "temproles";

/// Knobs for a restore run.
#[derive(Clone)]
pub struct RestoreOptions {
    /// Parallel restore workers.
    pub jobs: usize,

    /// Drop each collection before restoring it.
    pub drop_collections: bool,

    /// Write-concern string passed through to the store collaborator.
    pub write_concern: String,

    /// Replay `oplog.bson` after all collections are restored.
    pub replay_oplog: bool,

    /// Raw timestamp cutoff for oplog replay; entries after it are
    /// skipped. See [`oplog::parse_oplog_limit`].
    pub oplog_limit: Option<u64>,

    /// Check the framing invariant on every document (objcheck).
    pub validate_docs: bool,

    /// Namespace filter.
    pub filter: NsFilter,

    /// How EOF checksum mismatches are treated on archive input.
    pub checksum_policy: ChecksumPolicy,

    /// Cooperative cancellation flag (wired to ctrl-c by the CLI).
    pub interrupt: Arc<AtomicBool>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            drop_collections: false,
            write_concern: "majority".to_string(),
            replay_oplog: false,
            oplog_limit: None,
            validate_docs: false,
            filter: NsFilter::default(),
            checksum_policy: ChecksumPolicy::Strict,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl RestoreOptions {
    fn priority_mode(&self) -> PriorityMode {
        if self.jobs > 1 {
            PriorityMode::MultiDatabaseLtf
        } else {
            PriorityMode::Legacy
        }
    }
}

/// Totals for a completed restore.
#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreSummary {
    pub namespaces: u64,
    pub docs: u64,
    pub bytes: u64,
    pub oplog_applied: u64,
}

/// Restore a dump directory into the store.
pub fn restore_directory(
    client: &dyn StoreClient,
    root: &Path,
    options: &RestoreOptions,
    tracker: &Arc<ProgressTracker>,
) -> Result<RestoreSummary> {
    let manager = IntentManager::new();
    for intent in discovery::scan_dump_dir(root, &options.filter)? {
        manager.put(intent);
    }
    manager.finalize(options.priority_mode());

    let jobs = options.jobs.max(1);
    let (err_tx, err_rx) = bounded::<StashError>(jobs);
    let shutdown = AtomicBool::new(false);

    thread::scope(|scope| -> Result<()> {
        for id in 0..jobs {
            let err_tx = err_tx.clone();
            thread::Builder::new()
                .name(format!("restore-{id}"))
                .spawn_scoped(scope, {
                    let manager = &manager;
                    let shutdown = &shutdown;
                    move || {
                        restore_worker(id, client, manager, options, tracker, shutdown, err_tx)
                    }
                })
                .map_err(|e| WorkerError::SpawnFailed {
                    id,
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    })?;

    drop(err_tx);
    if let Ok(err) = err_rx.try_recv() {
        return Err(err);
    }
    if options.interrupt.load(Ordering::SeqCst) {
        return Err(StashError::Interrupted);
    }

    // Specials run on the calling thread, after every collection worker
    // is done: users/roles first, the oplog strictly last.
    let mut session = client.session(&SessionOptions::default())?;
    restore_users_roles(
        session.as_mut(),
        manager.users(),
        manager.roles(),
        options,
        tracker,
    )?;

    let mut oplog_applied = 0;
    if options.replay_oplog {
        if let Some(intent) = manager.oplog() {
            let path = intent.bson_path.as_deref().ok_or_else(|| {
                ArchiveError::corrupt("oplog intent discovered without a data file")
            })?;
            oplog_applied =
                oplog::replay_oplog(session.as_mut(), path, options.oplog_limit, tracker)?;
        } else {
            warn!("oplog replay requested but no oplog.bson in dump");
        }
    }

    Ok(RestoreSummary {
        namespaces: tracker.namespaces(),
        docs: tracker.docs(),
        bytes: tracker.bytes(),
        oplog_applied,
    })
}

#[allow(clippy::too_many_arguments)]
fn restore_worker(
    id: usize,
    client: &dyn StoreClient,
    manager: &IntentManager,
    options: &RestoreOptions,
    tracker: &Arc<ProgressTracker>,
    shutdown: &AtomicBool,
    err_tx: Sender<StashError>,
) {
    debug!(worker = id, "restore worker starting");
    let mut session = match client.session(&SessionOptions::default()) {
        Ok(session) => session,
        Err(e) => {
            shutdown.store(true, Ordering::SeqCst);
            let _ = err_tx.try_send(e.into());
            return;
        }
    };

    loop {
        if shutdown.load(Ordering::SeqCst) || options.interrupt.load(Ordering::SeqCst) {
            break;
        }
        match manager.pop() {
            Some(intent) => {
                let result = restore_intent(session.as_mut(), &intent, options, tracker);
                manager.finish(&intent);
                if let Err(e) = result {
                    shutdown.store(true, Ordering::SeqCst);
                    let _ = err_tx.try_send(
                        WorkerError::IntentFailed {
                            ns: intent.ns.clone(),
                            source: Box::new(e),
                        }
                        .into(),
                    );
                    break;
                }
            }
            None if manager.has_queued() => {
                // Every database with remaining work is checked out by a
                // sibling; wait for a finish to free one.
                thread::sleep(POP_RETRY);
            }
            None => break,
        }
    }
    debug!(worker = id, "restore worker done");
}

/// Restore one collection: metadata, drop/create, data, then indexes.
fn restore_intent(
    session: &mut dyn StoreSession,
    intent: &Intent,
    options: &RestoreOptions,
    tracker: &Arc<ProgressTracker>,
) -> Result<()> {
    info!(ns = %intent.ns, size = intent.size, "restoring collection");

    let metadata = match &intent.metadata_path {
        Some(path) => CollectionMetadata::load(path)?,
        None => CollectionMetadata::default(),
    };

    if options.drop_collections {
        session.drop_collection(&intent.ns)?;
    }
    session.create_collection(&intent.ns, &metadata.options)?;

    if let Some(path) = &intent.bson_path {
        stream_file_into(session, &intent.ns, path, options.validate_docs, tracker)?;
    }

    if !metadata.indexes.is_empty() {
        debug!(ns = %intent.ns, count = metadata.indexes.len(), "building indexes");
        session.create_indexes(&intent.ns, &metadata.indexes)?;
    }

    tracker.add_namespace();
    Ok(())
}

/// Stream one data file into a namespace in bounded insert batches.
fn stream_file_into(
    session: &mut dyn StoreSession,
    ns: &Namespace,
    path: &Path,
    validate: bool,
    tracker: &Arc<ProgressTracker>,
) -> Result<(u64, u64)> {
    let mut source = DocSource::new(BufReader::new(File::open(path)?));
    let mut batch: Vec<RawDoc> = Vec::new();
    let mut batch_bytes = 0usize;
    let mut docs = 0u64;
    let mut bytes = 0u64;

    while let Some(doc) = source.next() {
        if validate {
            validate_doc(doc).map_err(ArchiveError::Framing)?;
        }
        batch_bytes += doc.len();
        bytes += doc.len() as u64;
        docs += 1;
        batch.push(doc.to_vec());
        if batch.len() >= INSERT_BATCH_DOCS || batch_bytes >= INSERT_BATCH_BYTES {
            session.insert_batch(ns, &batch)?;
            tracker.add_docs(batch.len() as u64);
            tracker.add_bytes(batch_bytes as u64);
            batch.clear();
            batch_bytes = 0;
        }
    }
    if let Some(err) = source.into_error() {
        return Err(StashError::Archive(ArchiveError::Framing(err)));
    }
    if !batch.is_empty() {
        session.insert_batch(ns, &batch)?;
        tracker.add_docs(batch.len() as u64);
        tracker.add_bytes(batch_bytes as u64);
    }
    Ok((docs, bytes))
}

/// Restore users/roles through the server-side merge: load the dumped
/// documents into temp collections, issue the merge command, drop the
/// temps. Running users/roles through plain inserts would clobber the
/// credentials the restore itself is running under.
fn restore_users_roles(
    session: &mut dyn StoreSession,
    users: Option<Intent>,
    roles: Option<Intent>,
    options: &RestoreOptions,
    tracker: &Arc<ProgressTracker>,
) -> Result<()> {
    if users.is_none() && roles.is_none() {
        return Ok(());
    }

    let mut command = serde_json::Map::new();
    command.insert("_mergeAuthzCollections".into(), json!(1));
    command.insert("drop".into(), json!(true));
    command.insert("db".into(), json!(""));
    command.insert("writeConcern".into(), json!({ "w": options.write_concern }));

    let mut temps: Vec<Namespace> = Vec::new();
    let mut load_temp = |session: &mut dyn StoreSession,
                         intent: &Intent,
                         temp_coll: &str|
     -> Result<Namespace> {
        let temp = Namespace::new("admin", temp_coll);
        session.drop_collection(&temp)?;
        if let Some(path) = &intent.bson_path {
            stream_file_into(session, &temp, path, options.validate_docs, tracker)?;
        }
        Ok(temp)
    };

    if let Some(intent) = &users {
        info!("restoring users");
        let temp = load_temp(session, intent, TEMP_USERS)?;
        command.insert("tempUsersCollection".into(), json!(temp.to_string()));
        temps.push(temp);
    }
    if let Some(intent) = &roles {
        info!("restoring roles");
        let temp = load_temp(session, intent, TEMP_ROLES)?;
        command.insert("tempRolesCollection".into(), json!(temp.to_string()));
        temps.push(temp);
    }

    session.run_command("admin", &Value::Object(command))?;
    for temp in temps {
        session.drop_collection(&temp)?;
    }
    Ok(())
}

/// Restore an archive stream into the store: the demultiplexer runs on
/// the calling thread, one pipe per namespace hands documents to a pool
/// of `options.jobs` workers.
pub fn restore_archive<R: Read>(
    client: &dyn StoreClient,
    source: &mut R,
    options: &RestoreOptions,
    tracker: &Arc<ProgressTracker>,
) -> Result<RestoreSummary> {
    // The stream can hold as many concurrently-open namespaces as the
    // writer had producers, and each open namespace pins one worker
    // until its EOF header arrives. Fewer workers than that deadlocks,
    // which is what the header's concurrency field is for.
    let header = crate::archive::header::read_archive_header(source)?;
    let writer_concurrency = header.concurrent_collections.max(0) as usize;
    if writer_concurrency > crate::config::MAX_JOBS {
        return Err(ArchiveError::corrupt(format!(
            "archive claims {writer_concurrency} concurrent collections (limit {})",
            crate::config::MAX_JOBS
        ))
        .into());
    }
    let jobs = options.jobs.max(1).max(writer_concurrency);
    let (err_tx, err_rx) = bounded::<StashError>(jobs);

    let read_result: Result<()> = thread::scope(|scope| {
        let (work_tx, work_rx) = unbounded::<(Namespace, PipeDocs)>();
        let mut workers = Vec::with_capacity(jobs);
        for id in 0..jobs {
            let work_rx = work_rx.clone();
            let err_tx = err_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("restore-{id}"))
                .spawn_scoped(scope, move || {
                    archive_restore_worker(client, work_rx, options, tracker, err_tx)
                })
                .map_err(|e| WorkerError::SpawnFailed {
                    id,
                    reason: e.to_string(),
                })?;
            workers.push(handle);
        }
        drop(work_rx);

        let read_result = {
            let filter = options.filter.clone();
            let mut demux = Demultiplexer::new(
                options.checksum_policy,
                Box::new(move |ns: &Namespace| {
                    if !filter.matches(ns) {
                        debug!(ns = %ns, "skipping namespace excluded by filter");
                        return Ok(Box::new(DiscardSink) as Box<dyn DemuxSink>);
                    }
                    let (sink, docs) = demux_pipe(PIPE_CAPACITY);
                    work_tx
                        .send((ns.clone(), docs))
                        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "workers gone"))?;
                    Ok(Box::new(sink) as Box<dyn DemuxSink>)
                }),
            );
            let mut parser = crate::archive::BlockParser::new(source);
            parser.read_all_blocks(&mut demux)
            // demux (and with it every pipe sink and the work channel)
            // drops here, releasing the workers.
        };

        for (id, worker) in workers.into_iter().enumerate() {
            if worker.join().is_err() {
                return Err(WorkerError::Panicked { id }.into());
            }
        }
        read_result.map_err(Into::into)
    });

    drop(err_tx);
    // A failed worker usually surfaces twice: its own error, and the
    // broken pipe the reader then hits. The worker's error wins.
    if let Ok(err) = err_rx.try_recv() {
        return Err(err);
    }
    read_result?;
    if options.interrupt.load(Ordering::SeqCst) {
        return Err(StashError::Interrupted);
    }

    Ok(RestoreSummary {
        namespaces: tracker.namespaces(),
        docs: tracker.docs(),
        bytes: tracker.bytes(),
        oplog_applied: 0,
    })
}

fn archive_restore_worker(
    client: &dyn StoreClient,
    work_rx: Receiver<(Namespace, PipeDocs)>,
    options: &RestoreOptions,
    tracker: &Arc<ProgressTracker>,
    err_tx: Sender<StashError>,
) {
    let mut session = match client.session(&SessionOptions::default()) {
        Ok(session) => session,
        Err(e) => {
            let _ = err_tx.try_send(e.into());
            return;
        }
    };

    for (ns, docs) in work_rx.iter() {
        if options.interrupt.load(Ordering::SeqCst) {
            // Dropping the pipe receiver breaks the reader's next write.
            return;
        }
        if let Err(e) = restore_pipe(session.as_mut(), &ns, docs, options, tracker) {
            let _ = err_tx.try_send(
                WorkerError::IntentFailed {
                    ns,
                    source: Box::new(e),
                }
                .into(),
            );
            return;
        }
    }
}

fn restore_pipe(
    session: &mut dyn StoreSession,
    ns: &Namespace,
    docs: PipeDocs,
    options: &RestoreOptions,
    tracker: &Arc<ProgressTracker>,
) -> Result<()> {
    info!(ns = %ns, "restoring namespace from archive");
    if options.drop_collections {
        session.drop_collection(ns)?;
    }
    session.create_collection(ns, &json!({}))?;

    let mut batch: Vec<RawDoc> = Vec::new();
    let mut batch_bytes = 0usize;
    for doc in docs {
        if options.validate_docs {
            validate_doc(&doc).map_err(ArchiveError::Framing)?;
        }
        batch_bytes += doc.len();
        batch.push(doc);
        if batch.len() >= INSERT_BATCH_DOCS || batch_bytes >= INSERT_BATCH_BYTES {
            session.insert_batch(ns, &batch)?;
            tracker.add_docs(batch.len() as u64);
            tracker.add_bytes(batch_bytes as u64);
            batch.clear();
            batch_bytes = 0;
        }
    }
    if !batch.is_empty() {
        session.insert_batch(ns, &batch)?;
        tracker.add_docs(batch.len() as u64);
        tracker.add_bytes(batch_bytes as u64);
    }
    tracker.add_namespace();
    Ok(())
}

/// Result of unpacking an archive into a dump directory.
#[derive(Debug)]
pub struct UnpackReport {
    pub header: ArchiveHeader,
    pub namespaces: Vec<(Namespace, NamespaceStats)>,
    pub mismatches: u64,
}

/// File sink for one namespace during unpack.
struct FileSink {
    out: BufWriter<File>,
    validate: bool,
    tracker: Arc<ProgressTracker>,
}

impl DemuxSink for FileSink {
    fn write_doc(&mut self, doc: &[u8]) -> io::Result<()> {
        if self.validate {
            validate_doc(doc).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        self.out.write_all(doc)?;
        self.tracker.add_docs(1);
        self.tracker.add_bytes(doc.len() as u64);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.tracker.add_namespace();
        self.out.flush()
    }
}

/// Path an unpacked namespace lands at: `<out>/<db>/<coll>.bson`, or
/// `<out>/oplog.bson` for the root-level oplog pseudo-namespace.
fn unpack_path(out_dir: &Path, ns: &Namespace) -> PathBuf {
    if ns.db.is_empty() {
        out_dir.join(format!("{}.bson", ns.coll))
    } else {
        out_dir.join(&ns.db).join(format!("{}.bson", ns.coll))
    }
}

/// Split an archive stream back into a dump directory.
pub fn unpack_archive<R: Read>(
    source: &mut R,
    out_dir: &Path,
    options: &RestoreOptions,
    tracker: &Arc<ProgressTracker>,
) -> Result<UnpackReport> {
    fs::create_dir_all(out_dir)?;

    let mut demux = Demultiplexer::new(options.checksum_policy, {
        let out_dir = out_dir.to_path_buf();
        let filter = options.filter.clone();
        let validate = options.validate_docs;
        let tracker = Arc::clone(tracker);
        Box::new(move |ns: &Namespace| {
            if !filter.matches(ns) {
                return Ok(Box::new(DiscardSink) as Box<dyn DemuxSink>);
            }
            let path = unpack_path(&out_dir, ns);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            debug!(ns = %ns, file = %path.display(), "unpacking namespace");
            Ok(Box::new(FileSink {
                out: BufWriter::new(File::create(path)?),
                validate,
                tracker: Arc::clone(&tracker),
            }) as Box<dyn DemuxSink>)
        })
    });

    let header = read_archive(source, &mut demux)?;
    Ok(UnpackReport {
        header,
        namespaces: demux.finished().to_vec(),
        mismatches: demux.mismatches(),
    })
}
