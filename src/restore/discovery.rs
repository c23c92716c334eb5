//! Dump-directory discovery
//!
//! Walks a dump root and turns its files into intents:
//!
//! ```text
//! dump/
//! ├── oplog.bson                  -> oplog intent ("", "oplog")
//! └── <database>/
//!     ├── <collection>.bson           -> data intent
//!     ├── <collection>.bin            -> data intent (legacy naming)
//!     └── <collection>.metadata.json  -> metadata intent
//! ```
//!
//! Partial intents for the same namespace merge in the intent manager.
//! Unrecognized files and nested directories are logged and skipped, not
//! fatal: dump directories accumulate stray files in practice.

use crate::error::{DiscoveryError, Result};
use crate::intent::{Intent, Namespace, NsFilter};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Matches `<collection>.bson`, `<collection>.bin`, and
/// `<collection>.metadata.json`.
static DUMP_FILE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<coll>.+?)\.(?P<kind>bson|bin|metadata\.json)$")
        .expect("Invalid dump filename regex")
});

/// Scan a dump root into intents, in deterministic discovery order
/// (entries sorted by name so Legacy scheduling is reproducible).
pub fn scan_dump_dir(root: &Path, filter: &NsFilter) -> Result<Vec<Intent>> {
    let mut intents = Vec::new();

    let mut entries: Vec<_> = fs::read_dir(root)
        .map_err(|e| DiscoveryError::RootUnreadable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?
        .collect::<std::io::Result<_>>()
        .map_err(|e| DiscoveryError::RootUnreadable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry
            .file_type()
            .map_err(|e| DiscoveryError::EntryUnreadable {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if file_type.is_dir() {
            scan_database_dir(&path, &name, filter, &mut intents)?;
        } else if name == "oplog.bson" {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            intents.push(Intent::with_bson(Namespace::new("", "oplog"), path, size));
        } else {
            warn!(file = %path.display(), "skipping unrecognized file in dump root");
        }
    }

    debug!(count = intents.len(), root = %root.display(), "discovery complete");
    Ok(intents)
}

fn scan_database_dir(
    dir: &Path,
    db: &str,
    filter: &NsFilter,
    intents: &mut Vec<Intent>,
) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(|e| DiscoveryError::RootUnreadable {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?
        .collect::<std::io::Result<_>>()
        .map_err(|e| DiscoveryError::RootUnreadable {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();

        if path.is_dir() {
            warn!(dir = %path.display(), "skipping unrecognized subdirectory in dump");
            continue;
        }
        let Some(captures) = DUMP_FILE_REGEX.captures(&name) else {
            warn!(file = %path.display(), "skipping unrecognized file in dump");
            continue;
        };
        let ns = Namespace::new(db, &captures["coll"]);
        if !filter.matches(&ns) {
            debug!(ns = %ns, "skipping namespace excluded by filter");
            continue;
        }
        match &captures["kind"] {
            "bson" | "bin" => {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                intents.push(Intent::with_bson(ns, path, size));
            }
            "metadata.json" => intents.push(Intent::with_metadata(ns, path)),
            _ => unreachable!("regex admits only known kinds"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn touch(path: &Path, bytes: usize) {
        let mut f = File::create(path).unwrap();
        f.write_all(&vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn test_scan_finds_collections_and_oplog() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("sales")).unwrap();
        touch(&root.join("sales/orders.bson"), 128);
        touch(&root.join("sales/orders.metadata.json"), 10);
        touch(&root.join("sales/notes.txt"), 1); // skipped
        touch(&root.join("oplog.bson"), 64);

        let intents = scan_dump_dir(root, &NsFilter::default()).unwrap();
        assert_eq!(intents.len(), 3);

        let oplog = intents.iter().find(|i| i.is_oplog()).unwrap();
        assert_eq!(oplog.size, 64);

        let data = intents
            .iter()
            .find(|i| i.bson_path.is_some() && !i.is_oplog())
            .unwrap();
        assert_eq!(data.ns, Namespace::new("sales", "orders"));
        assert_eq!(data.size, 128);

        assert!(intents
            .iter()
            .any(|i| i.metadata_path.is_some() && i.ns.coll == "orders"));
    }

    #[test]
    fn test_dotted_collection_names_parse() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("admin")).unwrap();
        touch(&root.join("admin/system.users.bson"), 32);
        touch(&root.join("admin/system.users.metadata.json"), 8);

        let intents = scan_dump_dir(root, &NsFilter::default()).unwrap();
        assert_eq!(intents.len(), 2);
        assert!(intents.iter().all(|i| i.ns.coll == "system.users"));
        assert!(intents.iter().all(|i| i.is_users()));
    }

    #[test]
    fn test_filter_excludes() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("sales")).unwrap();
        fs::create_dir(root.join("hr")).unwrap();
        touch(&root.join("sales/orders.bson"), 16);
        touch(&root.join("hr/people.bson"), 16);

        let filter = NsFilter {
            db: Some("sales".into()),
            coll: None,
        };
        let intents = scan_dump_dir(root, &filter).unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].ns.db, "sales");
    }

    #[test]
    fn test_missing_root_is_error() {
        let err = scan_dump_dir(Path::new("/definitely/not/here"), &NsFilter::default())
            .unwrap_err();
        assert!(err.to_string().contains("dump root"));
    }
}
