//! Scheduling policy for queued intents
//!
//! Two policies decide the order parallel workers receive intents:
//!
//! - [`Legacy`]: pure FIFO by discovery order. Used in single-threaded
//!   mode, so it never tracks per-database concurrency.
//! - [`MultiDatabaseLtf`]: largest task first, per database. Intents are
//!   grouped by database and ordered by descending file size; `get` only
//!   hands out an intent from a database that has nothing checked out, so
//!   concurrent workers spread across databases instead of contending on
//!   one. `finish` releases the database for its next-largest intent.

use crate::intent::Intent;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Which prioritizer [`finalize`](crate::intent::IntentManager::finalize)
/// builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityMode {
    /// FIFO by discovery order (single-threaded restores).
    Legacy,

    /// Largest task first within each database, at most one intent per
    /// database in flight.
    MultiDatabaseLtf,
}

/// Hands out queued intents to workers.
///
/// `get` never blocks: it returns `None` when nothing is *eligible* right
/// now. `has_queued` distinguishes a drained queue from a momentary state
/// where every database with remaining work is checked out.
pub trait Prioritizer: Send {
    fn get(&mut self) -> Option<Arc<Intent>>;
    fn finish(&mut self, intent: &Intent);
    fn has_queued(&self) -> bool;
}

/// FIFO by discovery order.
pub struct Legacy {
    queue: VecDeque<Arc<Intent>>,
}

impl Legacy {
    pub fn new(intents: Vec<Arc<Intent>>) -> Self {
        Self {
            queue: intents.into(),
        }
    }
}

impl Prioritizer for Legacy {
    fn get(&mut self) -> Option<Arc<Intent>> {
        self.queue.pop_front()
    }

    fn finish(&mut self, _intent: &Intent) {
        // Single-threaded policy: nothing to release.
    }

    fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }
}

struct DbQueue {
    /// Descending by size; stable sort keeps insertion order for ties.
    intents: VecDeque<Arc<Intent>>,

    /// Total bytes not yet handed out; drives database selection.
    remaining: u64,
}

/// Largest task first, per database, at most one intent per database in
/// flight.
pub struct MultiDatabaseLtf {
    dbs: HashMap<String, DbQueue>,
    in_use: HashSet<String>,
}

impl MultiDatabaseLtf {
    pub fn new(intents: Vec<Arc<Intent>>) -> Self {
        let mut grouped: HashMap<String, Vec<Arc<Intent>>> = HashMap::new();
        for intent in intents {
            grouped.entry(intent.ns.db.clone()).or_default().push(intent);
        }
        let dbs = grouped
            .into_iter()
            .map(|(db, mut list)| {
                list.sort_by(|a, b| b.size.cmp(&a.size));
                let remaining = list.iter().map(|i| i.size).sum();
                (
                    db,
                    DbQueue {
                        intents: list.into(),
                        remaining,
                    },
                )
            })
            .collect();
        Self {
            dbs,
            in_use: HashSet::new(),
        }
    }

    /// The eligible database with the most remaining bytes (name as a
    /// deterministic tie-break).
    fn pick_db(&self) -> Option<String> {
        self.dbs
            .iter()
            .filter(|(db, q)| !q.intents.is_empty() && !self.in_use.contains(*db))
            .max_by(|(a_db, a), (b_db, b)| {
                a.remaining.cmp(&b.remaining).then(b_db.cmp(a_db))
            })
            .map(|(db, _)| db.clone())
    }
}

impl Prioritizer for MultiDatabaseLtf {
    fn get(&mut self) -> Option<Arc<Intent>> {
        let db = self.pick_db()?;
        let queue = self.dbs.get_mut(&db).expect("picked database exists");
        let intent = queue.intents.pop_front().expect("picked database has work");
        queue.remaining = queue.remaining.saturating_sub(intent.size);
        self.in_use.insert(db);
        Some(intent)
    }

    fn finish(&mut self, intent: &Intent) {
        self.in_use.remove(&intent.ns.db);
        let drained = self
            .dbs
            .get(&intent.ns.db)
            .is_some_and(|q| q.intents.is_empty());
        if drained {
            self.dbs.remove(&intent.ns.db);
        }
    }

    fn has_queued(&self) -> bool {
        self.dbs.values().any(|q| !q.intents.is_empty())
    }
}

/// Build the prioritizer for `mode` from the discovery-ordered list.
pub fn build(mode: PriorityMode, intents: Vec<Arc<Intent>>) -> Box<dyn Prioritizer> {
    match mode {
        PriorityMode::Legacy => Box::new(Legacy::new(intents)),
        PriorityMode::MultiDatabaseLtf => Box::new(MultiDatabaseLtf::new(intents)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Namespace;

    fn intent(db: &str, coll: &str, size: u64) -> Arc<Intent> {
        let mut i = Intent::new(Namespace::new(db, coll));
        i.size = size;
        Arc::new(i)
    }

    #[test]
    fn test_legacy_preserves_discovery_order() {
        let mut p = Legacy::new(vec![
            intent("db1", "small", 100),
            intent("db1", "big", 9000),
        ]);
        assert_eq!(p.get().unwrap().ns.coll, "small");
        assert_eq!(p.get().unwrap().ns.coll, "big");
        assert!(p.get().is_none());
        assert!(!p.has_queued());
    }

    #[test]
    fn test_ltf_orders_by_size_within_db() {
        let mut p = MultiDatabaseLtf::new(vec![
            intent("db1", "small", 10),
            intent("db1", "huge", 5000),
            intent("db1", "medium", 300),
        ]);
        let mut sizes = Vec::new();
        while let Some(i) = p.get() {
            sizes.push(i.size);
            p.finish(&i);
        }
        assert_eq!(sizes, vec![5000, 300, 10]);
    }

    #[test]
    fn test_ltf_never_doubles_up_on_a_db() {
        let mut p = MultiDatabaseLtf::new(vec![
            intent("db1", "a", 100),
            intent("db1", "b", 90),
            intent("db2", "c", 80),
            intent("db3", "d", 70),
        ]);
        // Three gets without a finish: one intent per database.
        let got: Vec<_> = (0..3).filter_map(|_| p.get()).collect();
        let dbs: std::collections::HashSet<_> =
            got.iter().map(|i| i.ns.db.clone()).collect();
        assert_eq!(dbs.len(), got.len());

        // db1 still has work but is checked out; nothing is eligible.
        assert!(p.get().is_none());
        assert!(p.has_queued());

        // Finishing db1's intent frees its next-largest.
        let db1_intent = got.iter().find(|i| i.ns.db == "db1").unwrap();
        p.finish(db1_intent);
        let next = p.get().unwrap();
        assert_eq!(next.ns.db, "db1");
        assert_eq!(next.ns.coll, "b");
    }

    #[test]
    fn test_ltf_prefers_db_with_most_remaining_bytes() {
        let mut p = MultiDatabaseLtf::new(vec![
            intent("small_db", "x", 10),
            intent("big_db", "y", 10_000),
        ]);
        assert_eq!(p.get().unwrap().ns.db, "big_db");
    }

    #[test]
    fn test_ltf_stable_tie_break() {
        let mut p = MultiDatabaseLtf::new(vec![
            intent("db1", "first", 50),
            intent("db1", "second", 50),
        ]);
        assert_eq!(p.get().unwrap().ns.coll, "first");
    }
}
