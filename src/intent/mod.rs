//! Intents - the unit of dump/restore work
//!
//! An [`Intent`] ties one namespace (database + collection) to the files
//! and metadata involved in dumping or restoring it. Intents are created
//! during discovery (filesystem scan or live enumeration), merged by
//! namespace key, and scheduled by the [`manager`](crate::intent::manager).
//!
//! A few namespaces get special handling and never enter the general work
//! queue: the oplog (replayed last), `admin.system.users` and
//! `admin.system.roles` (restored through a temp-collection merge), and
//! per-database `system.indexes` collections.

pub mod manager;
pub mod prioritizer;

pub use manager::IntentManager;
pub use prioritizer::{Prioritizer, PriorityMode};

use std::fmt;
use std::path::PathBuf;

/// A (database, collection) pair - the unit the archive sections data by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.db.is_empty() {
            write!(f, "{}", self.coll)
        } else {
            write!(f, "{}.{}", self.db, self.coll)
        }
    }
}

/// Optional database/collection filter applied during discovery and
/// enumeration. `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct NsFilter {
    pub db: Option<String>,
    pub coll: Option<String>,
}

impl NsFilter {
    pub fn matches(&self, ns: &Namespace) -> bool {
        self.db.as_ref().map_or(true, |db| *db == ns.db)
            && self.coll.as_ref().map_or(true, |coll| *coll == ns.coll)
    }
}

/// One collection's (or pseudo-namespace's) unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub ns: Namespace,

    /// Document data file, if discovered.
    pub bson_path: Option<PathBuf>,

    /// Metadata JSON file (collection options + index definitions), if
    /// discovered.
    pub metadata_path: Option<PathBuf>,

    /// Size of the data in bytes; drives largest-task-first scheduling.
    pub size: u64,
}

impl Intent {
    pub fn new(ns: Namespace) -> Self {
        Self {
            ns,
            bson_path: None,
            metadata_path: None,
            size: 0,
        }
    }

    pub fn with_bson(ns: Namespace, path: PathBuf, size: u64) -> Self {
        Self {
            ns,
            bson_path: Some(path),
            metadata_path: None,
            size,
        }
    }

    pub fn with_metadata(ns: Namespace, path: PathBuf) -> Self {
        Self {
            ns,
            bson_path: None,
            metadata_path: Some(path),
            size: 0,
        }
    }

    /// The oplog pseudo-namespace (dumped at the root, no database).
    pub fn is_oplog(&self) -> bool {
        self.ns.db.is_empty() && self.ns.coll == "oplog"
    }

    /// Users collection, restored through the temp-collection merge path.
    pub fn is_users(&self) -> bool {
        (self.ns.db == "admin" || self.ns.db == "$admin") && self.ns.coll == "system.users"
    }

    /// Roles collection, restored through the temp-collection merge path.
    pub fn is_roles(&self) -> bool {
        (self.ns.db == "admin" || self.ns.db == "$admin") && self.ns.coll == "system.roles"
    }

    /// Legacy per-database index catalog; handled out of band.
    pub fn is_system_indexes(&self) -> bool {
        self.ns.coll == "system.indexes"
    }

    /// Merge a second partial intent discovered for the same namespace,
    /// filling only fields that are currently empty. Re-putting the same
    /// partial intent neither duplicates nor regresses populated fields.
    pub fn merge(&mut self, other: Intent) {
        debug_assert_eq!(self.ns, other.ns, "merging intents for different namespaces");
        if self.bson_path.is_none() {
            self.bson_path = other.bson_path;
        }
        if self.metadata_path.is_none() {
            self.metadata_path = other.metadata_path;
        }
        if self.size == 0 {
            self.size = other.size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_display() {
        assert_eq!(Namespace::new("sales", "orders").to_string(), "sales.orders");
        assert_eq!(Namespace::new("", "oplog").to_string(), "oplog");
    }

    #[test]
    fn test_special_predicates() {
        assert!(Intent::new(Namespace::new("", "oplog")).is_oplog());
        assert!(!Intent::new(Namespace::new("sales", "oplog")).is_oplog());
        assert!(Intent::new(Namespace::new("admin", "system.users")).is_users());
        assert!(Intent::new(Namespace::new("$admin", "system.roles")).is_roles());
        assert!(Intent::new(Namespace::new("sales", "system.indexes")).is_system_indexes());
        assert!(!Intent::new(Namespace::new("sales", "orders")).is_users());
    }

    #[test]
    fn test_merge_fills_empty_fields_only() {
        let ns = Namespace::new("sales", "orders");
        let mut a = Intent::with_bson(ns.clone(), "/dump/sales/orders.bson".into(), 1024);
        let b = Intent::with_metadata(ns.clone(), "/dump/sales/orders.metadata.json".into());
        a.merge(b);
        assert!(a.bson_path.is_some());
        assert!(a.metadata_path.is_some());
        assert_eq!(a.size, 1024);

        // Merging the same bson-only intent again must not regress paths.
        let again = Intent::with_bson(ns, "/elsewhere/orders.bson".into(), 9);
        a.merge(again);
        assert_eq!(
            a.bson_path.as_deref(),
            Some(std::path::Path::new("/dump/sales/orders.bson"))
        );
        assert_eq!(a.size, 1024);
    }
}
