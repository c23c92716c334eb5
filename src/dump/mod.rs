//! Dump orchestration
//!
//! The write-side mirror of restore. Three shapes:
//!
//! - [`dump_to_archive`]: live store into one archive stream. Collections
//!   are enumerated into intents, scheduled largest-task-first across
//!   databases, and each worker streams its collection scan through a
//!   [`MuxIn`](crate::archive::MuxIn) producer handle.
//! - [`dump_to_directory`]: live store into a dump directory, one
//!   `.bson` + `.metadata.json` pair per collection.
//! - [`pack_directory`]: an existing dump directory into an archive
//!   stream (no store involved); the dump-side engine the CLI exposes.
//!
//! The archive grammar carries only document bodies, so collection
//! metadata travels in directory mode only; `pack` notes the metadata
//! files it leaves behind.

use crate::archive::{ArchiveHeader, Multiplexer, MuxHandle};
use crate::docio::DocSource;
use crate::error::{ArchiveError, Result, StashError, WorkerError};
use crate::intent::{Intent, IntentManager, Namespace, NsFilter, PriorityMode};
use crate::metadata::CollectionMetadata;
use crate::progress::ProgressTracker;
use crate::restore::discovery;
use crate::store::{SessionOptions, StoreClient, StoreSession};
use crossbeam_channel::{bounded, Sender};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long an idle worker waits when every eligible database is
/// checked out by a sibling.
const POP_RETRY: Duration = Duration::from_millis(5);

/// The oplog's home in a live store.
const OPLOG_SOURCE: (&str, &str) = ("local", "oplog.rs");

/// Knobs for a dump run.
#[derive(Clone)]
pub struct DumpOptions {
    /// Parallel dump workers.
    pub jobs: usize,

    /// Namespace filter.
    pub filter: NsFilter,

    /// Also dump the oplog (as the root-level `oplog` pseudo-namespace).
    pub dump_oplog: bool,

    /// Cooperative cancellation flag.
    pub interrupt: Arc<AtomicBool>,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            filter: NsFilter::default(),
            dump_oplog: false,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Knobs for packing a dump directory into an archive.
#[derive(Clone)]
pub struct PackOptions {
    pub jobs: usize,
    pub filter: NsFilter,
    pub interrupt: Arc<AtomicBool>,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            filter: NsFilter::default(),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Totals for a completed dump/pack.
#[derive(Debug, Default, Clone, Copy)]
pub struct DumpSummary {
    pub namespaces: u64,
    pub docs: u64,
    pub bytes: u64,
}

fn priority_mode(jobs: usize) -> PriorityMode {
    if jobs > 1 {
        PriorityMode::MultiDatabaseLtf
    } else {
        PriorityMode::Legacy
    }
}

/// Enumerate a live store into intents plus each collection's creation
/// options (needed for directory-mode metadata).
fn enumerate_intents(
    session: &mut dyn StoreSession,
    filter: &NsFilter,
) -> Result<(Vec<Intent>, HashMap<Namespace, Value>)> {
    let mut intents = Vec::new();
    let mut coll_options = HashMap::new();

    for db in session.list_databases()? {
        if db == "local" {
            // Internal replication state; the oplog is dumped through its
            // own path when requested.
            debug!(db = %db, "skipping internal database");
            continue;
        }
        for info in session.list_collections(&db)? {
            if info.name.starts_with("system.") {
                debug!(db = %db, coll = %info.name, "skipping system collection");
                continue;
            }
            let ns = Namespace::new(&db, &info.name);
            if !filter.matches(&ns) {
                continue;
            }
            let mut intent = Intent::new(ns.clone());
            intent.size = info.size;
            intents.push(intent);
            coll_options.insert(ns, info.options);
        }
    }
    debug!(count = intents.len(), "enumeration complete");
    Ok((intents, coll_options))
}

enum DumpTarget {
    Archive(MuxHandle),
    Directory(PathBuf),
}

/// Dump a live store into one archive stream.
pub fn dump_to_archive<W: Write + Send + 'static>(
    client: &dyn StoreClient,
    out: W,
    options: &DumpOptions,
    tracker: &Arc<ProgressTracker>,
) -> Result<DumpSummary> {
    let jobs = options.jobs.max(1);
    let mut session = client.session(&SessionOptions::default())?;
    let (intents, coll_options) = enumerate_intents(session.as_mut(), &options.filter)?;

    let manager = IntentManager::new();
    for intent in intents {
        manager.put(intent);
    }
    manager.finalize(priority_mode(jobs));

    let mux = Multiplexer::spawn(out, ArchiveHeader::new(client.server_version(), jobs as i32))?;
    let handle = mux.handle();
    let target = DumpTarget::Archive(handle.clone());

    let worker_err = run_dump_workers(client, &manager, &target, &coll_options, options, tracker);

    // The oplog goes in last so it covers the span of the dump.
    let mut oplog_err = None;
    if options.dump_oplog && worker_err.is_none() {
        if let Err(e) = dump_oplog(session.as_mut(), &target, tracker) {
            oplog_err = Some(e);
        }
    }

    drop(target);
    drop(handle);
    let mux_result = mux.finish();

    if let Some(err) = worker_err {
        return Err(err);
    }
    if let Some(err) = oplog_err {
        return Err(err);
    }
    mux_result?;
    if options.interrupt.load(Ordering::SeqCst) {
        return Err(StashError::Interrupted);
    }
    Ok(summary(tracker))
}

/// Dump a live store into a dump directory.
pub fn dump_to_directory(
    client: &dyn StoreClient,
    root: &Path,
    options: &DumpOptions,
    tracker: &Arc<ProgressTracker>,
) -> Result<DumpSummary> {
    fs::create_dir_all(root)?;
    let mut session = client.session(&SessionOptions::default())?;
    let (intents, coll_options) = enumerate_intents(session.as_mut(), &options.filter)?;

    let manager = IntentManager::new();
    for intent in intents {
        manager.put(intent);
    }
    manager.finalize(priority_mode(options.jobs.max(1)));

    let target = DumpTarget::Directory(root.to_path_buf());
    let worker_err = run_dump_workers(client, &manager, &target, &coll_options, options, tracker);
    if let Some(err) = worker_err {
        return Err(err);
    }

    if options.dump_oplog {
        dump_oplog(session.as_mut(), &target, tracker)?;
    }
    if options.interrupt.load(Ordering::SeqCst) {
        return Err(StashError::Interrupted);
    }
    Ok(summary(tracker))
}

fn summary(tracker: &ProgressTracker) -> DumpSummary {
    DumpSummary {
        namespaces: tracker.namespaces(),
        docs: tracker.docs(),
        bytes: tracker.bytes(),
    }
}

/// Spawn the worker pool, drain the manager, return the first error.
fn run_dump_workers(
    client: &dyn StoreClient,
    manager: &IntentManager,
    target: &DumpTarget,
    coll_options: &HashMap<Namespace, Value>,
    options: &DumpOptions,
    tracker: &Arc<ProgressTracker>,
) -> Option<StashError> {
    let jobs = options.jobs.max(1);
    let (err_tx, err_rx) = bounded::<StashError>(jobs);
    let shutdown = AtomicBool::new(false);

    thread::scope(|scope| {
        for id in 0..jobs {
            let err_tx = err_tx.clone();
            let shutdown = &shutdown;
            let spawned = thread::Builder::new()
                .name(format!("dump-{id}"))
                .spawn_scoped(scope, move || {
                    dump_worker(
                        id,
                        client,
                        manager,
                        target,
                        coll_options,
                        options,
                        tracker,
                        shutdown,
                        err_tx,
                    )
                });
            if let Err(e) = spawned {
                shutdown.store(true, Ordering::SeqCst);
                warn!(worker = id, error = %e, "failed to spawn dump worker");
            }
        }
    });

    drop(err_tx);
    err_rx.try_recv().ok()
}

#[allow(clippy::too_many_arguments)]
fn dump_worker(
    id: usize,
    client: &dyn StoreClient,
    manager: &IntentManager,
    target: &DumpTarget,
    coll_options: &HashMap<Namespace, Value>,
    options: &DumpOptions,
    tracker: &Arc<ProgressTracker>,
    shutdown: &AtomicBool,
    err_tx: Sender<StashError>,
) {
    debug!(worker = id, "dump worker starting");
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
                let result = dump_intent(
                    session.as_mut(),
                    &intent,
                    target,
                    coll_options.get(&intent.ns),
                    tracker,
                );
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
            None if manager.has_queued() => thread::sleep(POP_RETRY),
            None => break,
        }
    }
    debug!(worker = id, "dump worker done");
}

/// Dump one collection to the target.
fn dump_intent(
    session: &mut dyn StoreSession,
    intent: &Intent,
    target: &DumpTarget,
    options: Option<&Value>,
    tracker: &Arc<ProgressTracker>,
) -> Result<()> {
    info!(ns = %intent.ns, size = intent.size, "dumping collection");
    match target {
        DumpTarget::Archive(handle) => {
            let mut input = handle.open(intent.ns.clone())?;
            let mut cursor = session.scan(&intent.ns)?;
            while let Some(doc) = cursor.next_doc()? {
                input.write_doc(&doc)?;
                tracker.add_docs(1);
                tracker.add_bytes(doc.len() as u64);
            }
            input.close()?;
        }
        DumpTarget::Directory(root) => {
            let dir = root.join(&intent.ns.db);
            fs::create_dir_all(&dir)?;
            let mut out =
                BufWriter::new(File::create(dir.join(format!("{}.bson", intent.ns.coll)))?);
            let mut cursor = session.scan(&intent.ns)?;
            while let Some(doc) = cursor.next_doc()? {
                out.write_all(&doc)?;
                tracker.add_docs(1);
                tracker.add_bytes(doc.len() as u64);
            }
            out.flush()?;

            let metadata = CollectionMetadata {
                options: options.cloned().unwrap_or(Value::Null),
                indexes: session.list_indexes(&intent.ns)?,
                uuid: None,
            };
            metadata.save(&dir.join(format!("{}.metadata.json", intent.ns.coll)))?;
        }
    }
    tracker.add_namespace();
    Ok(())
}

/// Dump the live oplog as the root-level `oplog` pseudo-namespace.
fn dump_oplog(
    session: &mut dyn StoreSession,
    target: &DumpTarget,
    tracker: &Arc<ProgressTracker>,
) -> Result<()> {
    let source_ns = Namespace::new(OPLOG_SOURCE.0, OPLOG_SOURCE.1);
    let oplog_ns = Namespace::new("", "oplog");

    // Note the newest entry before scanning; everything up to here is
    // covered by this dump.
    let newest = session.find_one(
        &source_ns,
        &serde_json::json!({}),
        &crate::store::FindOptions {
            skip: 0,
            sort: Some(serde_json::json!({ "$natural": -1 })),
        },
    )?;
    match newest.as_deref().map(crate::restore::oplog::entry_timestamp) {
        Some(Ok(Some(ts))) => info!(secs = ts >> 32, ordinal = ts & 0xFFFF_FFFF, "dumping oplog"),
        _ => info!("dumping oplog"),
    }

    let mut cursor = session.scan(&source_ns)?;
    match target {
        DumpTarget::Archive(handle) => {
            let mut input = handle.open(oplog_ns)?;
            while let Some(doc) = cursor.next_doc()? {
                input.write_doc(&doc)?;
                tracker.add_docs(1);
                tracker.add_bytes(doc.len() as u64);
            }
            input.close()?;
        }
        DumpTarget::Directory(root) => {
            let mut out = BufWriter::new(File::create(root.join("oplog.bson"))?);
            while let Some(doc) = cursor.next_doc()? {
                out.write_all(&doc)?;
                tracker.add_docs(1);
                tracker.add_bytes(doc.len() as u64);
            }
            out.flush()?;
        }
    }
    tracker.add_namespace();
    Ok(())
}

/// Pack an existing dump directory into one archive stream.
///
/// Metadata JSON files have no representation in the archive grammar and
/// stay behind; only document data travels.
pub fn pack_directory<W: Write + Send + 'static>(
    root: &Path,
    out: W,
    options: &PackOptions,
    tracker: &Arc<ProgressTracker>,
) -> Result<DumpSummary> {
    let jobs = options.jobs.max(1);
    let manager = IntentManager::new();
    for intent in discovery::scan_dump_dir(root, &options.filter)? {
        manager.put(intent);
    }
    manager.finalize(priority_mode(jobs));

    let mux = Multiplexer::spawn(out, ArchiveHeader::new("unknown", jobs as i32))?;
    let handle = mux.handle();

    let (err_tx, err_rx) = bounded::<StashError>(jobs);
    let shutdown = AtomicBool::new(false);

    thread::scope(|scope| {
        for id in 0..jobs {
            let err_tx = err_tx.clone();
            let handle = handle.clone();
            let shutdown = &shutdown;
            let spawned = thread::Builder::new()
                .name(format!("pack-{id}"))
                .spawn_scoped(scope, {
                    let manager = &manager;
                    move || {
                        pack_worker(id, manager, handle, options, tracker, shutdown, err_tx)
                    }
                });
            if let Err(e) = spawned {
                shutdown.store(true, Ordering::SeqCst);
                warn!(worker = id, error = %e, "failed to spawn pack worker");
            }
        }
    });

    // Specials pack after the general queue, on the calling thread: the
    // admin collections, then the oplog last.
    let mut special_err = None;
    if err_rx.is_empty() {
        let specials = [manager.users(), manager.roles(), manager.oplog()];
        for intent in specials.into_iter().flatten() {
            if let Err(e) = pack_intent(&handle, &intent, tracker) {
                special_err = Some(e);
                break;
            }
        }
    }

    drop(handle);
    let mux_result = mux.finish();

    drop(err_tx);
    if let Ok(err) = err_rx.try_recv() {
        return Err(err);
    }
    if let Some(err) = special_err {
        return Err(err);
    }
    mux_result?;
    if options.interrupt.load(Ordering::SeqCst) {
        return Err(StashError::Interrupted);
    }
    Ok(summary(tracker))
}

fn pack_worker(
    id: usize,
    manager: &IntentManager,
    handle: MuxHandle,
    options: &PackOptions,
    tracker: &Arc<ProgressTracker>,
    shutdown: &AtomicBool,
    err_tx: Sender<StashError>,
) {
    debug!(worker = id, "pack worker starting");
    loop {
        if shutdown.load(Ordering::SeqCst) || options.interrupt.load(Ordering::SeqCst) {
            break;
        }
        match manager.pop() {
            Some(intent) => {
                let result = pack_intent(&handle, &intent, tracker);
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
            None if manager.has_queued() => thread::sleep(POP_RETRY),
            None => break,
        }
    }
    debug!(worker = id, "pack worker done");
}

/// Stream one intent's data file into the archive.
fn pack_intent(handle: &MuxHandle, intent: &Intent, tracker: &Arc<ProgressTracker>) -> Result<()> {
    let Some(path) = &intent.bson_path else {
        // Metadata-only intent; nothing for the archive.
        debug!(ns = %intent.ns, "no data file; metadata stays behind");
        return Ok(());
    };
    info!(ns = %intent.ns, size = intent.size, "packing collection");

    let mut input = handle.open(intent.ns.clone())?;
    let mut source = DocSource::new(BufReader::new(File::open(path)?));
    while let Some(doc) = source.next() {
        input.write_doc(doc)?;
        tracker.add_docs(1);
        tracker.add_bytes(doc.len() as u64);
    }
    if let Some(err) = source.into_error() {
        return Err(StashError::Archive(ArchiveError::Framing(err)));
    }
    input.close()?;
    tracker.add_namespace();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::demux::NamespaceStats;
    use crate::restore::{unpack_archive, RestoreOptions};
    use crate::store::mem::MemStore;
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn doc(fill: u8, size: usize) -> Vec<u8> {
        let mut d = vec![fill; size];
        d[..4].copy_from_slice(&(size as i32).to_le_bytes());
        d[size - 1] = 0;
        d
    }

    /// Shared Vec<u8> writer for capturing archive output.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_dump_to_directory_writes_data_and_metadata() {
        let store = MemStore::new();
        let ns = Namespace::new("sales", "orders");
        store.seed(
            &ns,
            vec![doc(1, 16), doc(2, 24)],
            json!({ "capped": false }),
            vec![json!({ "key": { "qty": 1 }, "name": "qty_1" })],
        );

        let out = tempdir().unwrap();
        let tracker = ProgressTracker::new();
        let summary =
            dump_to_directory(&store, out.path(), &DumpOptions::default(), &tracker).unwrap();
        assert_eq!(summary.namespaces, 1);
        assert_eq!(summary.docs, 2);

        let data = fs::read(out.path().join("sales/orders.bson")).unwrap();
        assert_eq!(data, [doc(1, 16), doc(2, 24)].concat());

        let meta =
            CollectionMetadata::load(&out.path().join("sales/orders.metadata.json")).unwrap();
        assert_eq!(meta.indexes.len(), 1);
    }

    #[test]
    fn test_dump_to_archive_then_unpack_round_trips() {
        let store = MemStore::new();
        let ns_a = Namespace::new("sales", "orders");
        let ns_b = Namespace::new("hr", "people");
        store.seed(&ns_a, vec![doc(1, 16)], json!({}), vec![]);
        store.seed(&ns_b, vec![doc(2, 32), doc(3, 8)], json!({}), vec![]);

        let out = SharedBuf::default();
        let tracker = ProgressTracker::new();
        let options = DumpOptions {
            jobs: 2,
            ..Default::default()
        };
        let summary = dump_to_archive(&store, out.clone(), &options, &tracker).unwrap();
        assert_eq!(summary.namespaces, 2);
        assert_eq!(summary.docs, 3);

        let bytes = out.0.lock().unwrap().clone();
        let unpack_dir = tempdir().unwrap();
        let tracker = ProgressTracker::new();
        let report = unpack_archive(
            &mut Cursor::new(bytes),
            unpack_dir.path(),
            &RestoreOptions::default(),
            &tracker,
        )
        .unwrap();

        assert_eq!(report.namespaces.len(), 2);
        assert!(report.namespaces.iter().all(|(_, s)| s.crc_ok()));
        let restored = fs::read(unpack_dir.path().join("hr/people.bson")).unwrap();
        assert_eq!(restored, [doc(2, 32), doc(3, 8)].concat());
    }

    #[test]
    fn test_dump_skips_local_and_system() {
        let store = MemStore::new();
        store.seed(&Namespace::new("sales", "orders"), vec![doc(1, 8)], json!({}), vec![]);
        store.seed(&Namespace::new("local", "oplog.rs"), vec![doc(2, 8)], json!({}), vec![]);
        store.seed(
            &Namespace::new("admin", "system.users"),
            vec![doc(3, 8)],
            json!({}),
            vec![],
        );

        let out = tempdir().unwrap();
        let tracker = ProgressTracker::new();
        let summary =
            dump_to_directory(&store, out.path(), &DumpOptions::default(), &tracker).unwrap();
        assert_eq!(summary.namespaces, 1);
        assert!(!out.path().join("local").exists());
        assert!(!out.path().join("admin").exists());
    }

    #[test]
    fn test_dump_oplog_lands_at_root() {
        let store = MemStore::new();
        store.seed(&Namespace::new("local", "oplog.rs"), vec![doc(9, 16)], json!({}), vec![]);

        let out = tempdir().unwrap();
        let tracker = ProgressTracker::new();
        let options = DumpOptions {
            dump_oplog: true,
            ..Default::default()
        };
        dump_to_directory(&store, out.path(), &options, &tracker).unwrap();
        assert_eq!(fs::read(out.path().join("oplog.bson")).unwrap(), doc(9, 16));
    }

    #[test]
    fn test_pack_checksums_cover_whole_namespace() {
        // pack → unpack and verify every EOF checksum held.
        let dump = tempdir().unwrap();
        fs::create_dir(dump.path().join("db1")).unwrap();
        fs::write(
            dump.path().join("db1/big.bson"),
            [doc(1, 100), doc(2, 200)].concat(),
        )
        .unwrap();
        fs::write(dump.path().join("db1/small.bson"), doc(3, 50)).unwrap();

        let out = SharedBuf::default();
        let tracker = ProgressTracker::new();
        pack_directory(dump.path(), out.clone(), &PackOptions::default(), &tracker).unwrap();

        let bytes = out.0.lock().unwrap().clone();
        let unpack_dir = tempdir().unwrap();
        let tracker = ProgressTracker::new();
        let report = unpack_archive(
            &mut Cursor::new(bytes),
            unpack_dir.path(),
            &RestoreOptions::default(),
            &tracker,
        )
        .unwrap();

        let stats: Vec<&NamespaceStats> =
            report.namespaces.iter().map(|(_, s)| s).collect();
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| s.crc_ok()));
        assert_eq!(report.mismatches, 0);
    }
}
