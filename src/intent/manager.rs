//! Catalog and scheduler for discovered intents
//!
//! The manager has two phases. While *accepting*, `put` classifies each
//! intent (oplog / system-indexes / users / roles get dedicated slots,
//! everything else merges into the general queue by namespace key).
//! `finalize` builds the chosen prioritizer from the discovery-ordered
//! list, discards the accepting-phase maps, and moves to *scheduling*,
//! where workers drain the queue through `pop`/`finish`.
//!
//! Misuse - put after finalize, finalize twice, pop/finish before
//! finalize - is a caller bug and panics immediately rather than letting
//! scheduler state rot.

use crate::intent::prioritizer::{self, Prioritizer, PriorityMode};
use crate::intent::{Intent, Namespace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct Accepting {
    intents: HashMap<Namespace, Intent>,
    order: Vec<Namespace>,
}

enum State {
    Accepting(Accepting),
    Scheduling(Box<dyn Prioritizer>),
}

struct Inner {
    state: State,
    oplog: Option<Intent>,
    users: Option<Intent>,
    roles: Option<Intent>,
    system_indexes: HashMap<String, Intent>,
}

/// Thread-safe catalog of all intents for one dump/restore run.
pub struct IntentManager {
    inner: Mutex<Inner>,
}

impl IntentManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Accepting(Accepting::default()),
                oplog: None,
                users: None,
                roles: None,
                system_indexes: HashMap::new(),
            }),
        }
    }

    /// Insert an intent, merging with any previously put partial intent
    /// for the same namespace. Special namespaces divert to their slots
    /// and never reach the general queue.
    ///
    /// # Panics
    ///
    /// Panics if called after `finalize`.
    pub fn put(&self, intent: Intent) {
        let mut inner = self.inner.lock();
        assert!(
            matches!(&inner.state, State::Accepting(_)),
            "IntentManager::put called after finalize"
        );

        // Classification order matters: an oplog intent must not be
        // mistaken for a collection, and system.indexes beats users/roles.
        if intent.is_oplog() {
            merge_slot(&mut inner.oplog, intent);
            return;
        }
        if intent.is_system_indexes() {
            let db = intent.ns.db.clone();
            match inner.system_indexes.entry(db) {
                std::collections::hash_map::Entry::Occupied(mut e) => e.get_mut().merge(intent),
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(intent);
                }
            }
            return;
        }
        if intent.is_users() {
            merge_slot(&mut inner.users, intent);
            return;
        }
        if intent.is_roles() {
            merge_slot(&mut inner.roles, intent);
            return;
        }

        let State::Accepting(accepting) = &mut inner.state else {
            panic!("IntentManager::put called after finalize");
        };
        match accepting.intents.entry(intent.ns.clone()) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                debug!(ns = %intent.ns, "merging partial intent");
                e.get_mut().merge(intent);
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                accepting.order.push(intent.ns.clone());
                e.insert(intent);
            }
        }
    }

    /// Freeze the catalog and build the prioritizer. The accepting-phase
    /// maps are dropped here; the prioritizer owns the queue from now on.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn finalize(&self, mode: PriorityMode) {
        let mut inner = self.inner.lock();
        let State::Accepting(accepting) = &mut inner.state else {
            panic!("IntentManager::finalize called twice");
        };
        let accepting = std::mem::take(accepting);
        let ordered: Vec<Arc<Intent>> = {
            let mut intents = accepting.intents;
            accepting
                .order
                .iter()
                .map(|ns| Arc::new(intents.remove(ns).expect("ordered namespace present")))
                .collect()
        };
        debug!(count = ordered.len(), ?mode, "finalizing intent queue");
        inner.state = State::Scheduling(prioritizer::build(mode, ordered));
    }

    /// Pop the next eligible intent, or `None` if nothing is eligible.
    /// Combine with [`has_queued`](Self::has_queued) to tell a drained
    /// queue from one whose databases are all checked out.
    ///
    /// # Panics
    ///
    /// Panics if called before `finalize`.
    pub fn pop(&self) -> Option<Arc<Intent>> {
        let mut inner = self.inner.lock();
        let State::Scheduling(prioritizer) = &mut inner.state else {
            panic!("IntentManager::pop called before finalize");
        };
        prioritizer.get()
    }

    /// Mark a popped intent's work complete, releasing any per-database
    /// reservation the prioritizer holds for it. Must be called exactly
    /// once per popped intent.
    ///
    /// # Panics
    ///
    /// Panics if called before `finalize`.
    pub fn finish(&self, intent: &Intent) {
        let mut inner = self.inner.lock();
        let State::Scheduling(prioritizer) = &mut inner.state else {
            panic!("IntentManager::finish called before finalize");
        };
        prioritizer.finish(intent);
    }

    /// True while undelivered intents remain in the general queue.
    pub fn has_queued(&self) -> bool {
        let inner = self.inner.lock();
        match &inner.state {
            State::Accepting(accepting) => !accepting.intents.is_empty(),
            State::Scheduling(prioritizer) => prioritizer.has_queued(),
        }
    }

    /// The oplog intent, if one was discovered. Never returned by `pop`.
    pub fn oplog(&self) -> Option<Intent> {
        self.inner.lock().oplog.clone()
    }

    /// The users intent, if one was discovered. Never returned by `pop`.
    pub fn users(&self) -> Option<Intent> {
        self.inner.lock().users.clone()
    }

    /// The roles intent, if one was discovered. Never returned by `pop`.
    pub fn roles(&self) -> Option<Intent> {
        self.inner.lock().roles.clone()
    }

    /// The system.indexes intent for one database, if discovered.
    pub fn system_indexes(&self, db: &str) -> Option<Intent> {
        self.inner.lock().system_indexes.get(db).cloned()
    }
}

impl Default for IntentManager {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_slot(slot: &mut Option<Intent>, intent: Intent) {
    match slot {
        Some(existing) => existing.merge(intent),
        None => *slot = Some(intent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(db: &str, coll: &str, size: u64) -> Intent {
        let mut i = Intent::new(Namespace::new(db, coll));
        i.size = size;
        i
    }

    #[test]
    fn test_legacy_scenario_discovery_order() {
        let manager = IntentManager::new();
        manager.put(intent("db1", "small", 100));
        manager.put(intent("db1", "big", 9000));
        manager.finalize(PriorityMode::Legacy);

        assert_eq!(manager.pop().unwrap().ns.coll, "small");
        assert_eq!(manager.pop().unwrap().ns.coll, "big");
        assert!(manager.pop().is_none());
    }

    #[test]
    fn test_merge_by_key_on_put() {
        let manager = IntentManager::new();
        let ns = Namespace::new("sales", "orders");
        manager.put(Intent::with_bson(
            ns.clone(),
            "/dump/sales/orders.bson".into(),
            2048,
        ));
        manager.put(Intent::with_metadata(
            ns,
            "/dump/sales/orders.metadata.json".into(),
        ));
        manager.finalize(PriorityMode::Legacy);

        let merged = manager.pop().unwrap();
        assert!(merged.bson_path.is_some());
        assert!(merged.metadata_path.is_some());
        assert_eq!(merged.size, 2048);
        assert!(manager.pop().is_none());
    }

    #[test]
    fn test_oplog_never_pops() {
        let manager = IntentManager::new();
        manager.put(intent("", "oplog", 500));
        manager.put(intent("db1", "coll", 100));
        manager.finalize(PriorityMode::Legacy);

        assert_eq!(manager.pop().unwrap().ns.coll, "coll");
        assert!(manager.pop().is_none());
        assert!(manager.oplog().unwrap().is_oplog());
    }

    #[test]
    fn test_special_slots() {
        let manager = IntentManager::new();
        manager.put(intent("admin", "system.users", 10));
        manager.put(intent("admin", "system.roles", 10));
        manager.put(intent("sales", "system.indexes", 10));
        manager.finalize(PriorityMode::Legacy);

        assert!(manager.pop().is_none());
        assert!(manager.users().is_some());
        assert!(manager.roles().is_some());
        assert!(manager.system_indexes("sales").is_some());
        assert!(manager.system_indexes("other").is_none());
    }

    #[test]
    #[should_panic(expected = "put called after finalize")]
    fn test_put_after_finalize_panics() {
        let manager = IntentManager::new();
        manager.finalize(PriorityMode::Legacy);
        manager.put(intent("db1", "coll", 1));
    }

    #[test]
    #[should_panic(expected = "finalize called twice")]
    fn test_double_finalize_panics() {
        let manager = IntentManager::new();
        manager.finalize(PriorityMode::Legacy);
        manager.finalize(PriorityMode::Legacy);
    }

    #[test]
    #[should_panic(expected = "pop called before finalize")]
    fn test_pop_before_finalize_panics() {
        let manager = IntentManager::new();
        manager.pop();
    }

    #[test]
    fn test_ltf_finish_releases_database() {
        let manager = IntentManager::new();
        manager.put(intent("db1", "a", 100));
        manager.put(intent("db1", "b", 50));
        manager.finalize(PriorityMode::MultiDatabaseLtf);

        let first = manager.pop().unwrap();
        assert_eq!(first.ns.coll, "a");
        // db1 checked out: queue non-empty but nothing eligible.
        assert!(manager.pop().is_none());
        assert!(manager.has_queued());

        manager.finish(&first);
        assert_eq!(manager.pop().unwrap().ns.coll, "b");
    }
}
