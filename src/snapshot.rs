//! Snapshot coordination: one held connection exports a repeatable-read
//! snapshot that every worker imports.

use postgres::{Client, NoTls};

use crate::catalog::Relation;
use crate::config::connection::ConnectionParams;
use crate::error::{Result, SnapError};

/// `pg_export_snapshot()` first shipped in 9.2.
pub const MIN_SERVER_VERSION: i32 = 90200;
/// Standbys can export snapshots consistently from 10 on.
pub const MIN_STANDBY_VERSION: i32 = 100000;

pub const BEGIN_SNAPSHOT_TRANSACTION: &str =
    "BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY";

/// Control statements the coordinator needs from its held connection.
pub trait ControlSession: Send {
    /// Human-readable version string (`SHOW server_version`).
    fn server_version(&mut self) -> Result<String>;
    /// Numeric version (`server_version_num`), e.g. 150004.
    fn server_version_num(&mut self) -> Result<i32>;
    fn is_in_recovery(&mut self) -> Result<bool>;
    fn execute(&mut self, statement: &str) -> Result<()>;
    fn export_snapshot(&mut self) -> Result<String>;
    /// Schema, name and kind of the given `pg_class` oids, as seen by the
    /// snapshot transaction. Unknown oids are left out.
    fn describe_relations(&mut self, oids: &[u32]) -> Result<Vec<Relation>>;
    fn close(self: Box<Self>) -> Result<()>;
}

const DESCRIBE_RELATIONS: &str = "\
SELECT c.oid, n.nspname, c.relname, c.relkind \
FROM pg_catalog.pg_class c \
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
WHERE c.oid = ANY($1)";

/// A [`ControlSession`] over a real PostgreSQL connection.
pub struct PgSession {
    client: Client,
}

impl PgSession {
    pub fn connect(params: &ConnectionParams) -> Result<Self> {
        let database = params.require_dbname()?.to_string();
        let client = params
            .pg_config()?
            .connect(NoTls)
            .map_err(|e| SnapError::Connect {
                database,
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    fn query_text(&mut self, sql: &str) -> Result<String> {
        let row = self
            .client
            .query_one(sql, &[])
            .map_err(|e| SnapError::session(format!("query `{}` failed", sql), e))?;
        row.try_get::<_, String>(0)
            .map_err(|e| SnapError::session(format!("query `{}` returned no text", sql), e))
    }
}

impl ControlSession for PgSession {
    fn server_version(&mut self) -> Result<String> {
        self.query_text("SHOW server_version")
    }

    fn server_version_num(&mut self) -> Result<i32> {
        let raw = self.query_text("SHOW server_version_num")?;
        raw.trim()
            .parse()
            .map_err(|e| SnapError::session("unreadable server_version_num", e))
    }

    fn is_in_recovery(&mut self) -> Result<bool> {
        let row = self
            .client
            .query_one("SELECT pg_catalog.pg_is_in_recovery()", &[])
            .map_err(|e| SnapError::session("cannot read recovery state", e))?;
        row.try_get(0)
            .map_err(|e| SnapError::session("cannot read recovery state", e))
    }

    fn execute(&mut self, statement: &str) -> Result<()> {
        self.client
            .batch_execute(statement)
            .map_err(|e| SnapError::session(format!("statement `{}` failed", statement), e))
    }

    fn export_snapshot(&mut self) -> Result<String> {
        self.query_text("SELECT pg_catalog.pg_export_snapshot()")
    }

    fn describe_relations(&mut self, oids: &[u32]) -> Result<Vec<Relation>> {
        let rows = self
            .client
            .query(DESCRIBE_RELATIONS, &[&oids])
            .map_err(|e| SnapError::session("cannot read table catalog", e))?;
        rows.iter()
            .map(|row| {
                let kind: i8 = row.try_get(3)?;
                Ok(Relation {
                    oid: row.try_get(0)?,
                    schema: row.try_get(1)?,
                    name: row.try_get(2)?,
                    kind: char::from(kind as u8),
                })
            })
            .collect::<std::result::Result<_, postgres::Error>>()
            .map_err(|e| SnapError::session("cannot read table catalog", e))
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.client
            .close()
            .map_err(|e| SnapError::session("closing connection failed", e))
    }
}

/// Session settings every connection taking part in a run applies, in order,
/// omitting those the server version does not know.
pub fn session_settings(version_num: i32) -> Vec<&'static str> {
    let mut settings = vec![
        "SELECT pg_catalog.set_config('search_path', '', false)",
        "SET client_encoding = 'UTF8'",
        "SET DateStyle = ISO",
        "SET IntervalStyle = POSTGRES",
        "SET extra_float_digits = 3",
        "SET synchronize_seqscans = off",
        "SET statement_timeout = 0",
    ];
    if version_num >= 90300 {
        settings.push("SET lock_timeout = 0");
    }
    if version_num >= 90600 {
        settings.push("SET idle_in_transaction_session_timeout = 0");
    }
    if version_num >= 90500 {
        settings.push("SET row_security = off");
    }
    settings
}

/// What an acquired snapshot looks like from the outside.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub token: String,
    pub server_version: String,
    pub server_version_num: i32,
}

/// Owns the held connection for the lifetime of a parallel phase.
pub struct SnapshotCoordinator {
    session: Option<Box<dyn ControlSession>>,
    info: SnapshotInfo,
}

impl SnapshotCoordinator {
    /// Check preconditions, apply session settings, open the snapshot
    /// transaction and export its token. On failure the session is closed
    /// before the error is returned.
    pub fn acquire(mut session: Box<dyn ControlSession>) -> Result<Self> {
        match Self::prepare(session.as_mut()) {
            Ok(info) => {
                tracing::info!(token = %info.token, version = %info.server_version, "snapshot exported");
                Ok(Self {
                    session: Some(session),
                    info,
                })
            }
            Err(err) => {
                if let Err(close_err) = session.close() {
                    tracing::warn!(error = %close_err, "closing connection after failed acquire");
                }
                Err(err)
            }
        }
    }

    fn prepare(session: &mut dyn ControlSession) -> Result<SnapshotInfo> {
        let server_version = session.server_version()?;
        let server_version_num = session.server_version_num()?;
        check_version(session, &server_version, server_version_num)?;

        for statement in session_settings(server_version_num) {
            session.execute(statement)?;
        }
        session.execute(BEGIN_SNAPSHOT_TRANSACTION)?;
        let token = session.export_snapshot()?;
        Ok(SnapshotInfo {
            token,
            server_version,
            server_version_num,
        })
    }

    pub fn token(&self) -> &str {
        &self.info.token
    }

    pub fn info(&self) -> &SnapshotInfo {
        &self.info
    }

    /// Look up relations inside the exported snapshot, on the held
    /// connection.
    pub fn describe_relations(&mut self, oids: &[u32]) -> Result<Vec<Relation>> {
        match self.session.as_mut() {
            Some(session) => session.describe_relations(oids),
            None => Err(SnapError::session(
                "cannot read table catalog",
                "snapshot connection already released",
            )),
        }
    }

    /// Close the held connection. Returns `true` only for the call that
    /// actually closed it.
    pub fn release(&mut self) -> bool {
        match self.session.take() {
            Some(session) => {
                if let Err(err) = session.close() {
                    tracing::warn!(error = %err, "closing snapshot connection");
                }
                tracing::debug!("snapshot connection released");
                true
            }
            None => false,
        }
    }
}

impl Drop for SnapshotCoordinator {
    fn drop(&mut self) {
        self.release();
    }
}

fn check_version(
    session: &mut dyn ControlSession,
    server_version: &str,
    version_num: i32,
) -> Result<()> {
    if version_num < MIN_SERVER_VERSION {
        return Err(SnapError::UnsupportedVersion {
            found: server_version.to_string(),
            required: "9.2",
        });
    }
    if version_num < MIN_STANDBY_VERSION && session.is_in_recovery()? {
        return Err(SnapError::StandbyVersion {
            found: server_version.to_string(),
            required: "10",
        });
    }
    Ok(())
}
