use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Record written next to the artifacts of a finished backup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupMetadata {
    pub created_at: DateTime<Local>,
    pub database: String,
    pub server_version: String,
    /// Number of per-table data artifacts a restore will load.
    pub table_count: usize,
    pub tool_version: String,
}

impl BackupMetadata {
    pub fn new(database: &str, server_version: &str, table_count: usize) -> Self {
        Self {
            created_at: Local::now(),
            database: database.to_string(),
            server_version: server_version.to_string(),
            table_count,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// How many recorded artifacts are absent when `found` are on disk.
    pub fn missing_artifacts(&self, found: usize) -> Option<usize> {
        self.table_count.checked_sub(found).filter(|&n| n > 0)
    }
}
