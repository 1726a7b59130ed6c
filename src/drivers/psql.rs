use std::path::Path;
use std::process::Command;

use super::{WorkerLauncher, pg_program};
use crate::config::connection::ConnectionParams;

/// Runs slot scripts through the interactive client.
pub struct PsqlLauncher {
    conn: ConnectionParams,
}

impl PsqlLauncher {
    pub fn new(conn: ConnectionParams) -> Self {
        Self { conn }
    }
}

impl WorkerLauncher for PsqlLauncher {
    fn command(&self, script: &Path) -> Command {
        let mut cmd = Command::new(pg_program("psql"));
        cmd.arg("--no-psqlrc")
            .arg("--quiet")
            .arg("--no-password")
            .arg("--set=ON_ERROR_STOP=1")
            .args(self.conn.client_args())
            .arg("--file")
            .arg(script);
        self.conn.apply_env(&mut cmd);
        cmd
    }
}
