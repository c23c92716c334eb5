//! In-memory document store
//!
//! The test suite's `StoreClient` implementation: collections are vectors
//! of raw documents behind one mutex, commands and applied oplog batches
//! are recorded for assertions, and the auth-collections merge command is
//! implemented for the users/roles restore path.

use crate::error::{StoreError, StoreResult};
use crate::intent::Namespace;
use crate::store::{
    CollectionInfo, DocCursor, FindOptions, RawDoc, SessionOptions, StoreClient, StoreSession,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
struct MemCollection {
    docs: Vec<RawDoc>,
    options: Value,
    indexes: Vec<Value>,
}

#[derive(Default)]
struct MemState {
    dbs: BTreeMap<String, BTreeMap<String, MemCollection>>,
    commands: Vec<(String, Value)>,
    applied_ops: Vec<RawDoc>,
}

/// Shared in-memory store; clones share state.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate one collection (dump-side fixtures).
    pub fn seed(&self, ns: &Namespace, docs: Vec<RawDoc>, options: Value, indexes: Vec<Value>) {
        let mut state = self.state.lock();
        state.dbs.entry(ns.db.clone()).or_default().insert(
            ns.coll.clone(),
            MemCollection {
                docs,
                options,
                indexes,
            },
        );
    }

    pub fn docs(&self, ns: &Namespace) -> Vec<RawDoc> {
        self.state
            .lock()
            .dbs
            .get(&ns.db)
            .and_then(|colls| colls.get(&ns.coll))
            .map(|c| c.docs.clone())
            .unwrap_or_default()
    }

    pub fn indexes(&self, ns: &Namespace) -> Vec<Value> {
        self.state
            .lock()
            .dbs
            .get(&ns.db)
            .and_then(|colls| colls.get(&ns.coll))
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }

    pub fn collection_exists(&self, ns: &Namespace) -> bool {
        self.state
            .lock()
            .dbs
            .get(&ns.db)
            .is_some_and(|colls| colls.contains_key(&ns.coll))
    }

    /// Commands recorded by `run_command`, in call order.
    pub fn commands(&self) -> Vec<(String, Value)> {
        self.state.lock().commands.clone()
    }

    /// Oplog operations applied through `apply_ops`, in call order.
    pub fn applied_ops(&self) -> Vec<RawDoc> {
        self.state.lock().applied_ops.clone()
    }
}

impl StoreClient for MemStore {
    fn session(&self, _options: &SessionOptions) -> StoreResult<Box<dyn StoreSession>> {
        Ok(Box::new(MemSession {
            state: Arc::clone(&self.state),
        }))
    }

    fn server_version(&self) -> String {
        "mem-0.0".to_string()
    }
}

struct MemSession {
    state: Arc<Mutex<MemState>>,
}

struct MemCursor {
    docs: std::vec::IntoIter<RawDoc>,
}

impl DocCursor for MemCursor {
    fn next_doc(&mut self) -> StoreResult<Option<RawDoc>> {
        Ok(self.docs.next())
    }
}

impl MemSession {
    /// Move every document from one collection into another, replacing
    /// the destination (the semantics the auth merge command needs).
    fn merge_into(&mut self, from: &Namespace, into: &Namespace) {
        let mut state = self.state.lock();
        let moved = state
            .dbs
            .get_mut(&from.db)
            .and_then(|colls| colls.remove(&from.coll))
            .map(|c| c.docs)
            .unwrap_or_default();
        state
            .dbs
            .entry(into.db.clone())
            .or_default()
            .entry(into.coll.clone())
            .or_default()
            .docs = moved;
    }
}

impl StoreSession for MemSession {
    fn list_databases(&mut self) -> StoreResult<Vec<String>> {
        Ok(self.state.lock().dbs.keys().cloned().collect())
    }

    fn list_collections(&mut self, db: &str) -> StoreResult<Vec<CollectionInfo>> {
        let state = self.state.lock();
        let Some(colls) = state.dbs.get(db) else {
            return Ok(Vec::new());
        };
        Ok(colls
            .iter()
            .map(|(name, coll)| CollectionInfo {
                name: name.clone(),
                options: coll.options.clone(),
                size: coll.docs.iter().map(|d| d.len() as u64).sum(),
            })
            .collect())
    }

    fn list_indexes(&mut self, ns: &Namespace) -> StoreResult<Vec<Value>> {
        let state = self.state.lock();
        Ok(state
            .dbs
            .get(&ns.db)
            .and_then(|colls| colls.get(&ns.coll))
            .map(|c| c.indexes.clone())
            .unwrap_or_default())
    }

    fn scan(&mut self, ns: &Namespace) -> StoreResult<Box<dyn DocCursor>> {
        let state = self.state.lock();
        let docs = state
            .dbs
            .get(&ns.db)
            .and_then(|colls| colls.get(&ns.coll))
            .ok_or_else(|| StoreError::NamespaceNotFound(ns.to_string()))?
            .docs
            .clone();
        Ok(Box::new(MemCursor {
            docs: docs.into_iter(),
        }))
    }

    fn create_collection(&mut self, ns: &Namespace, options: &Value) -> StoreResult<()> {
        let mut state = self.state.lock();
        let coll = state
            .dbs
            .entry(ns.db.clone())
            .or_default()
            .entry(ns.coll.clone())
            .or_default();
        coll.options = options.clone();
        Ok(())
    }

    fn drop_collection(&mut self, ns: &Namespace) -> StoreResult<()> {
        let mut state = self.state.lock();
        if let Some(colls) = state.dbs.get_mut(&ns.db) {
            colls.remove(&ns.coll);
        }
        Ok(())
    }

    fn insert_batch(&mut self, ns: &Namespace, docs: &[RawDoc]) -> StoreResult<()> {
        let mut state = self.state.lock();
        state
            .dbs
            .entry(ns.db.clone())
            .or_default()
            .entry(ns.coll.clone())
            .or_default()
            .docs
            .extend(docs.iter().cloned());
        Ok(())
    }

    fn create_indexes(&mut self, ns: &Namespace, indexes: &[Value]) -> StoreResult<()> {
        let mut state = self.state.lock();
        state
            .dbs
            .entry(ns.db.clone())
            .or_default()
            .entry(ns.coll.clone())
            .or_default()
            .indexes
            .extend(indexes.iter().cloned());
        Ok(())
    }

    fn run_command(&mut self, db: &str, command: &Value) -> StoreResult<Value> {
        self.state
            .lock()
            .commands
            .push((db.to_string(), command.clone()));

        // The one command the engine depends on semantically.
        if let Some(obj) = command.as_object() {
            if obj.contains_key("_mergeAuthzCollections") {
                if let Some(temp) = obj.get("tempUsersCollection").and_then(Value::as_str) {
                    let (db, coll) = temp.split_once('.').unwrap_or(("admin", temp));
                    self.merge_into(
                        &Namespace::new(db, coll),
                        &Namespace::new("admin", "system.users"),
                    );
                }
                if let Some(temp) = obj.get("tempRolesCollection").and_then(Value::as_str) {
                    let (db, coll) = temp.split_once('.').unwrap_or(("admin", temp));
                    self.merge_into(
                        &Namespace::new(db, coll),
                        &Namespace::new("admin", "system.roles"),
                    );
                }
            }
        }
        Ok(json!({ "ok": 1 }))
    }

    fn find_one(
        &mut self,
        ns: &Namespace,
        _filter: &Value,
        options: &FindOptions,
    ) -> StoreResult<Option<RawDoc>> {
        let state = self.state.lock();
        let Some(coll) = state.dbs.get(&ns.db).and_then(|colls| colls.get(&ns.coll)) else {
            return Ok(None);
        };
        // Natural order only; a reverse sort reads from the tail.
        let reverse = options
            .sort
            .as_ref()
            .and_then(|s| s.get("$natural"))
            .and_then(Value::as_i64)
            .is_some_and(|dir| dir < 0);
        let skip = options.skip as usize;
        let doc = if reverse {
            coll.docs.iter().rev().nth(skip)
        } else {
            coll.docs.get(skip)
        };
        Ok(doc.cloned())
    }

    fn remove_matching(&mut self, ns: &Namespace, filter: &Value) -> StoreResult<u64> {
        // Only the match-all filter is needed here.
        if filter.as_object().is_some_and(|o| !o.is_empty()) {
            return Err(StoreError::Command {
                command: "remove".into(),
                reason: "mem store supports only the empty filter".into(),
            });
        }
        let mut state = self.state.lock();
        let Some(coll) = state.dbs.get_mut(&ns.db).and_then(|colls| colls.get_mut(&ns.coll)) else {
            return Ok(0);
        };
        let removed = coll.docs.len() as u64;
        coll.docs.clear();
        Ok(removed)
    }

    fn apply_ops(&mut self, ops: &[RawDoc]) -> StoreResult<u64> {
        let mut state = self.state.lock();
        state.applied_ops.extend(ops.iter().cloned());
        Ok(ops.len() as u64)
    }
}
