//! Data models

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

/// How an archive is applied to an existing database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Upsert archive rows, keeping rows the archive does not mention
    #[default]
    Merge,
    /// Clear every archive table first, then insert
    Replace,
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportMode::Merge => f.write_str("merge"),
            ImportMode::Replace => f.write_str("replace"),
        }
    }
}

impl FromStr for ImportMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "merge" => Ok(ImportMode::Merge),
            "replace" => Ok(ImportMode::Replace),
            other => Err(Error::Validation(format!(
                "Unknown import mode '{}' (expected merge or replace)",
                other
            ))),
        }
    }
}

/// Row counts for one imported table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableImportStats {
    /// Rows that did not exist before
    pub inserted: usize,
    /// Rows that replaced an existing row with the same primary key
    pub updated: usize,
    /// Rows ignored because of a constraint conflict
    pub skipped: usize,
}

/// Outcome of an import
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    /// Mode that ran
    pub mode: ImportMode,
    /// Per-table counts
    pub tables: BTreeMap<String, TableImportStats>,
    /// Sum of `inserted`
    pub total_inserted: usize,
    /// Sum of `updated`
    pub total_updated: usize,
    /// Sum of `skipped`
    pub total_skipped: usize,
}

impl ImportReport {
    /// Empty report for `mode`
    pub fn new(mode: ImportMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Record the counts of one table and update the totals.
    pub fn record(&mut self, table: impl Into<String>, stats: TableImportStats) {
        self.total_inserted += stats.inserted;
        self.total_updated += stats.updated;
        self.total_skipped += stats.skipped;
        self.tables.insert(table.into(), stats);
    }
}

/// An encrypted backup found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    /// File name, e.g. `health_2024-05-01.db.enc`
    pub name: String,
    /// Full path
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: SystemTime,
}
