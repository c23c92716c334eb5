//! Collection metadata JSON
//!
//! Each dumped collection may carry a `<collection>.metadata.json` next
//! to its data file: creation options, index definitions, and an opaque
//! collection UUID. Restore applies options at create time and builds the
//! indexes after the data is in.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionMetadata {
    /// Creation options, passed through to the store untouched.
    #[serde(default)]
    pub options: Value,

    /// Index definitions, passed through to the store untouched.
    #[serde(default)]
    pub indexes: Vec<Value>,

    /// Collection UUID as dumped; informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl CollectionMetadata {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}
