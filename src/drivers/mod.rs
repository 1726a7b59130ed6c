use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::Result;

pub mod postgres;
pub mod psql;

/// Environment variable naming the directory that holds the PostgreSQL
/// client programs. Unset means "look them up on PATH".
pub const PG_BIN_ENV: &str = "SNAPDUMP_PG_BIN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    PreData,
    PostData,
}

impl Section {
    pub fn as_flag(&self) -> &'static str {
        match self {
            Section::PreData => "pre-data",
            Section::PostData => "post-data",
        }
    }
}

/// Include/exclude selections passed straight through to pg_dump.
#[derive(Debug, Clone, Default)]
pub struct TableFilters {
    pub schemas: Vec<String>,
    pub exclude_schemas: Vec<String>,
    pub tables: Vec<String>,
    pub exclude_tables: Vec<String>,
}

impl TableFilters {
    pub fn to_args(&self) -> Vec<String> {
        let groups = [
            ("--schema", &self.schemas),
            ("--exclude-schema", &self.exclude_schemas),
            ("--table", &self.tables),
            ("--exclude-table", &self.exclude_tables),
        ];
        groups
            .iter()
            .flat_map(|(flag, values)| values.iter().map(move |v| format!("{}={}", flag, v)))
            .collect()
    }
}

/// The external dump/restore utility handling schema sections.
pub trait SchemaTool {
    /// Write one schema section of the snapshot to `archive`.
    fn dump_section(
        &self,
        section: Section,
        snapshot: &str,
        filters: &TableFilters,
        archive: &Path,
    ) -> Result<()>;

    /// Table-of-contents listing of an archive.
    fn list_archive(&self, archive: &Path) -> Result<String>;

    /// Replay one schema section of `archive` into the target database.
    fn restore_section(&self, section: Section, archive: &Path, jobs: usize) -> Result<()>;
}

/// Builds the process that runs one slot script.
pub trait WorkerLauncher: Send + Sync {
    fn command(&self, script: &Path) -> Command;
}

/// Shell filter pair used to shrink data artifacts.
#[derive(Debug, Clone)]
pub struct Compressor {
    pub program: String,
}

impl Default for Compressor {
    fn default() -> Self {
        Self {
            program: "gzip".to_string(),
        }
    }
}

impl Compressor {
    pub fn compress_command(&self) -> String {
        format!("{} -c", self.program)
    }

    pub fn decompress_command(&self) -> String {
        format!("{} -cd", self.program)
    }
}

/// Path of a PostgreSQL client program, honouring [`PG_BIN_ENV`].
pub fn pg_program(name: &str) -> PathBuf {
    match std::env::var_os(PG_BIN_ENV) {
        Some(dir) if !dir.is_empty() => Path::new(&dir).join(name),
        _ => PathBuf::from(name),
    }
}
