use std::path::Path;
use std::process::Command;

use crate::error::{Result, SnapError};

const DEFAULT_PORT: u16 = 5432;
const SOCKET_DIRS: &[&str] = &["/var/run/postgresql", "/tmp"];

/// Where and as whom to connect. Unset fields fall back to libpq defaults
/// in the external tools.
#[derive(Debug, Clone, Default)]
pub struct ConnectionParams {
    pub dbname: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ConnectionParams {
    /// The database name, or a precondition error when none was given.
    pub fn require_dbname(&self) -> Result<&str> {
        match self.dbname.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(SnapError::Precondition(
                "no database name given; use -d/--dbname or set PGDATABASE".to_string(),
            )),
        }
    }

    /// Connection flags understood by pg_dump, pg_restore and psql.
    pub fn client_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(host) = &self.host {
            args.push("-h".to_string());
            args.push(host.clone());
        }
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(user) = &self.user {
            args.push("-U".to_string());
            args.push(user.clone());
        }
        if let Some(db) = &self.dbname {
            args.push("-d".to_string());
            args.push(db.clone());
        }
        args
    }

    /// Hand the password to a child through its environment, never argv.
    pub fn apply_env(&self, cmd: &mut Command) {
        if let Some(pw) = &self.password {
            cmd.env("PGPASSWORD", pw);
        }
        cmd.env("PGAPPNAME", "snapdump");
    }

    /// Config for the coordinator's own held connection.
    pub fn pg_config(&self) -> Result<postgres::Config> {
        let dbname = self.require_dbname()?;
        let mut config = postgres::Config::new();
        config
            .dbname(dbname)
            .host(&self.resolve_host())
            .port(self.port.unwrap_or(DEFAULT_PORT))
            .user(&self.resolve_user())
            .application_name("snapdump");
        if let Some(pw) = &self.password {
            config.password(pw);
        }
        Ok(config)
    }

    fn resolve_host(&self) -> String {
        if let Some(host) = &self.host {
            return host.clone();
        }
        let port = self.port.unwrap_or(DEFAULT_PORT);
        SOCKET_DIRS
            .iter()
            .find(|dir| Path::new(dir).join(format!(".s.PGSQL.{}", port)).exists())
            .map(|dir| dir.to_string())
            .unwrap_or_else(|| "localhost".to_string())
    }

    fn resolve_user(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "postgres".to_string())
    }
}
