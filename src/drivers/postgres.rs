use std::path::Path;
use std::process::{Command, Stdio};

use super::{SchemaTool, Section, TableFilters, pg_program};
use crate::config::connection::ConnectionParams;
use crate::error::{Result, SnapError};

/// pg_dump / pg_restore in custom archive format.
pub struct PgTools {
    conn: ConnectionParams,
}

impl PgTools {
    pub fn new(conn: ConnectionParams) -> Self {
        Self { conn }
    }

    pub(crate) fn dump_command(
        &self,
        section: Section,
        snapshot: &str,
        filters: &TableFilters,
        archive: &Path,
    ) -> Command {
        let mut cmd = Command::new(pg_program("pg_dump"));
        cmd.args(self.conn.client_args())
            .arg("--format=custom")
            .arg(format!("--section={}", section.as_flag()))
            .arg(format!("--snapshot={}", snapshot))
            .arg("--no-password")
            .args(filters.to_args())
            .arg("--file")
            .arg(archive);
        self.conn.apply_env(&mut cmd);
        cmd
    }

    pub(crate) fn restore_command(&self, section: Section, archive: &Path, jobs: usize) -> Command {
        let mut cmd = Command::new(pg_program("pg_restore"));
        cmd.args(self.conn.client_args())
            .arg(format!("--section={}", section.as_flag()))
            .arg("--no-password");
        if jobs > 1 {
            cmd.arg(format!("--jobs={}", jobs));
        }
        cmd.arg(archive);
        self.conn.apply_env(&mut cmd);
        cmd
    }
}

impl SchemaTool for PgTools {
    fn dump_section(
        &self,
        section: Section,
        snapshot: &str,
        filters: &TableFilters,
        archive: &Path,
    ) -> Result<()> {
        run(self.dump_command(section, snapshot, filters, archive), "pg_dump")
    }

    fn list_archive(&self, archive: &Path) -> Result<String> {
        let output = Command::new(pg_program("pg_restore"))
            .arg("--list")
            .arg(archive)
            .stderr(Stdio::inherit())
            .output()
            .map_err(|source| SnapError::ToolSpawn {
                tool: "pg_restore".to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(SnapError::ToolFailed {
                tool: "pg_restore --list".to_string(),
                status: output.status,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn restore_section(&self, section: Section, archive: &Path, jobs: usize) -> Result<()> {
        run(self.restore_command(section, archive, jobs), "pg_restore")
    }
}

fn run(mut cmd: Command, tool: &str) -> Result<()> {
    tracing::debug!(command = ?cmd, "running {}", tool);
    let status = cmd.status().map_err(|source| SnapError::ToolSpawn {
        tool: tool.to_string(),
        source,
    })?;
    if status.success() {
        Ok(())
    } else {
        Err(SnapError::ToolFailed {
            tool: tool.to_string(),
            status,
        })
    }
}
