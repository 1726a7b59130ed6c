#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};

use snapdump::cancel::CancelToken;
use snapdump::catalog::Relation;
use snapdump::config::backup::BackupMetadata;
use snapdump::config::connection::ConnectionParams;
use snapdump::drivers::{Compressor, SchemaTool, Section, TableFilters, WorkerLauncher};
use snapdump::error::{Result, SnapError};
use snapdump::ops::{self, Backends, DumpOptions, RestoreOptions, RunOutcome};
use snapdump::plan::{self, WorkUnit};
use snapdump::snapshot::ControlSession;
use snapdump::storage::BackupLayout;

const LISTING: &str = "\
;
; Selected TOC Entries:
;
215; 1259 16386 TABLE public items shop
216; 1259 16390 TABLE public orders shop
218; 1259 16400 TABLE reporting sales shop
217; 1259 16395 SEQUENCE public orders_id_seq shop
219; 1259 16420 TABLE public events shop
";

/// What the server reports for the listing's tables; `events` is a
/// partitioned parent.
fn shop_relations() -> Vec<Relation> {
    [
        (16386, "public", "items", 'r'),
        (16390, "public", "orders", 'r'),
        (16400, "reporting", "sales", 'r'),
        (16420, "public", "events", 'p'),
    ]
    .into_iter()
    .map(|(oid, schema, name, kind)| Relation {
        oid,
        schema: schema.to_string(),
        name: name.to_string(),
        kind,
    })
    .collect()
}

fn shop_units() -> Vec<WorkUnit> {
    vec![
        WorkUnit::new("public", "items"),
        WorkUnit::new("public", "orders"),
        WorkUnit::new("reporting", "sales"),
    ]
}

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Clone)]
struct FakeSession {
    version_num: i32,
    log: Log,
}

impl ControlSession for FakeSession {
    fn server_version(&mut self) -> Result<String> {
        Ok("16.2".to_string())
    }

    fn server_version_num(&mut self) -> Result<i32> {
        Ok(self.version_num)
    }

    fn is_in_recovery(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn execute(&mut self, statement: &str) -> Result<()> {
        self.log.lock().unwrap().push(statement.to_string());
        Ok(())
    }

    fn export_snapshot(&mut self) -> Result<String> {
        Ok("00000004-00000A2C-1".to_string())
    }

    fn describe_relations(&mut self, oids: &[u32]) -> Result<Vec<Relation>> {
        self.log.lock().unwrap().push(format!("DESCRIBE {}", oids.len()));
        Ok(shop_relations()
            .into_iter()
            .filter(|r| oids.contains(&r.oid))
            .collect())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.log.lock().unwrap().push("CLOSE".to_string());
        Ok(())
    }
}

/// Records delegated calls; `cancel_on_dump` simulates a signal arriving
/// while pg_dump runs.
#[derive(Default)]
struct FakeTools {
    calls: Mutex<Vec<String>>,
    cancel_on_dump: Option<CancelToken>,
}

impl FakeTools {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl SchemaTool for FakeTools {
    fn dump_section(
        &self,
        section: Section,
        snapshot: &str,
        _filters: &TableFilters,
        archive: &Path,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("dump {} {}", section.as_flag(), snapshot));
        if let Some(cancel) = &self.cancel_on_dump {
            cancel.cancel();
            return Err(SnapError::Precondition("pg_dump killed".into()));
        }
        fs::write(archive, b"archive")?;
        Ok(())
    }

    fn list_archive(&self, _archive: &Path) -> Result<String> {
        self.calls.lock().unwrap().push("list".to_string());
        Ok(LISTING.to_string())
    }

    fn restore_section(&self, section: Section, _archive: &Path, jobs: usize) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("restore {} {}", section.as_flag(), jobs));
        Ok(())
    }
}

/// Plays back the progress markers of a slot script as if every table
/// transferred cleanly.
struct MarkerLauncher;

impl WorkerLauncher for MarkerLauncher {
    fn command(&self, script: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(r#"sed -n '/ fail /d; s/^\\echo //p' "$0""#)
            .arg(script);
        cmd
    }
}

/// Like [`MarkerLauncher`], except the first table of every slot reports
/// an error and the worker carries on with the rest.
struct FirstTableFailsLauncher;

impl WorkerLauncher for FirstTableFailsLauncher {
    fn command(&self, script: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(r#"sed -n '/ fail [1-9]/d; / end 0$/d; s/^\\echo //p' "$0""#)
            .arg(script);
        cmd
    }
}

struct FailingLauncher;

impl WorkerLauncher for FailingLauncher {
    fn command(&self, _script: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 3");
        cmd
    }
}

fn conn() -> ConnectionParams {
    ConnectionParams {
        dbname: Some("shop".into()),
        ..Default::default()
    }
}

fn dump_opts(output: &Path) -> DumpOptions {
    DumpOptions {
        conn: conn(),
        jobs: 2,
        filters: TableFilters::default(),
        output: output.to_path_buf(),
    }
}

fn session(version_num: i32) -> (FakeSession, Log) {
    let log = Log::default();
    (
        FakeSession {
            version_num,
            log: log.clone(),
        },
        log,
    )
}

fn closes(log: &Log) -> usize {
    log.lock().unwrap().iter().filter(|e| *e == "CLOSE").count()
}

fn connect(
    fake: FakeSession,
) -> impl FnOnce() -> std::result::Result<Box<dyn ControlSession>, SnapError> {
    move || Ok(Box::new(fake) as Box<dyn ControlSession>)
}

#[test]
fn dump_runs_every_phase_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("bk");
    let tools = FakeTools::default();
    let backends = Backends {
        tools: &tools,
        launcher: &MarkerLauncher,
        compressor: Compressor::default(),
    };
    let (fake, log) = session(160002);

    let outcome =
        ops::run_dump(&dump_opts(&out), connect(fake), &backends, &CancelToken::new()).unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(
        tools.calls(),
        vec![
            "dump pre-data 00000004-00000A2C-1",
            "list",
            "dump post-data 00000004-00000A2C-1"
        ]
    );
    assert_eq!(closes(&log), 1);
    assert!(log.lock().unwrap().contains(&"DESCRIBE 4".to_string()));
    let meta = BackupLayout::new(&out).load_metadata().unwrap();
    assert_eq!(meta.database, "shop");
    assert_eq!(meta.server_version, "16.2");
}

#[test]
fn interrupted_dump_skips_post_data_and_releases_once() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("bk");
    let tools = FakeTools::default();
    let backends = Backends {
        tools: &tools,
        launcher: &MarkerLauncher,
        compressor: Compressor::default(),
    };
    let (fake, log) = session(160002);
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = ops::run_dump(&dump_opts(&out), connect(fake), &backends, &cancel).unwrap();

    assert_eq!(outcome, RunOutcome::Interrupted);
    assert_eq!(outcome.exit_code(), 1);
    assert!(!tools.calls().iter().any(|c| c.contains("post-data")));
    assert_eq!(closes(&log), 1);
    assert!(BackupLayout::new(&out).load_metadata().is_err());
}

#[test]
fn signal_during_pre_data_is_an_interruption_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let tools = FakeTools {
        cancel_on_dump: Some(cancel.clone()),
        ..Default::default()
    };
    let backends = Backends {
        tools: &tools,
        launcher: &MarkerLauncher,
        compressor: Compressor::default(),
    };
    let (fake, log) = session(160002);

    let outcome =
        ops::run_dump(&dump_opts(&dir.path().join("bk")), connect(fake), &backends, &cancel)
            .unwrap();

    assert_eq!(outcome, RunOutcome::Interrupted);
    assert_eq!(tools.calls().len(), 1);
    assert_eq!(closes(&log), 1);
}

#[test]
fn old_server_aborts_before_session_setup() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("bk");
    let tools = FakeTools::default();
    let backends = Backends {
        tools: &tools,
        launcher: &MarkerLauncher,
        compressor: Compressor::default(),
    };
    let (fake, log) = session(90106);

    let err = ops::run_dump(&dump_opts(&out), connect(fake), &backends, &CancelToken::new())
        .unwrap_err();

    assert!(err.to_string().contains("not supported"));
    assert_eq!(log.lock().unwrap().clone(), vec!["CLOSE"]);
    assert!(tools.calls().is_empty());
    assert!(out.is_dir());
    assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
}

#[test]
fn failed_workers_fail_the_run_without_post_data() {
    let dir = tempfile::tempdir().unwrap();
    let tools = FakeTools::default();
    let backends = Backends {
        tools: &tools,
        launcher: &FailingLauncher,
        compressor: Compressor::default(),
    };
    let (fake, log) = session(160002);

    let outcome = ops::run_dump(
        &dump_opts(&dir.path().join("bk")),
        connect(fake),
        &backends,
        &CancelToken::new(),
    )
    .unwrap();

    assert_eq!(outcome, RunOutcome::PartialFailure { failed: 3 });
    assert_eq!(outcome.exit_code(), 3);
    assert!(!tools.calls().iter().any(|c| c.contains("post-data")));
    assert_eq!(closes(&log), 1);
}

#[test]
fn a_failing_table_does_not_stop_its_worker() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("bk");
    let tools = FakeTools::default();
    let backends = Backends {
        tools: &tools,
        launcher: &FirstTableFailsLauncher,
        compressor: Compressor::default(),
    };
    let (fake, log) = session(160002);
    let mut opts = dump_opts(&out);
    opts.jobs = 1;

    let outcome = ops::run_dump(&opts, connect(fake), &backends, &CancelToken::new()).unwrap();

    // one slot, three tables: only the first failed, the other two ran
    assert_eq!(outcome, RunOutcome::PartialFailure { failed: 1 });
    assert!(!tools.calls().iter().any(|c| c.contains("post-data")));
    assert!(BackupLayout::new(&out).load_metadata().is_err());
    assert_eq!(closes(&log), 1);
}

#[test]
fn missing_dbname_fails_before_touching_disk() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("bk");
    let tools = FakeTools::default();
    let backends = Backends {
        tools: &tools,
        launcher: &MarkerLauncher,
        compressor: Compressor::default(),
    };
    let (fake, _log) = session(160002);
    let mut opts = dump_opts(&out);
    opts.conn.dbname = None;

    assert!(ops::run_dump(&opts, connect(fake), &backends, &CancelToken::new()).is_err());
    assert!(!out.exists());
}

fn seed_backup(root: &Path, units: &[WorkUnit]) -> BackupLayout {
    let layout = BackupLayout::new(root);
    fs::write(layout.pre_data(), b"pre").unwrap();
    fs::write(layout.post_data(), b"post").unwrap();
    for unit in units {
        fs::write(layout.artifact(unit), b"payload").unwrap();
    }
    layout
}

#[test]
fn restore_loads_artifacts_between_schema_phases() {
    let dir = tempfile::tempdir().unwrap();
    let units = shop_units();
    seed_backup(dir.path(), &units);
    let tools = FakeTools::default();
    let backends = Backends {
        tools: &tools,
        launcher: &MarkerLauncher,
        compressor: Compressor::default(),
    };
    let opts = RestoreOptions {
        conn: conn(),
        jobs: 2,
        input: dir.path().to_path_buf(),
    };

    let outcome =
        ops::run_restore(&opts, || Ok(160002), &backends, &CancelToken::new()).unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(tools.calls(), vec!["restore pre-data 1", "restore post-data 2"]);
}

#[test]
fn restore_plan_matches_the_dump_plan() {
    let dir = tempfile::tempdir().unwrap();
    let dumped = shop_units();
    let layout = seed_backup(dir.path(), &dumped);

    for workers in 1..=4 {
        let from_catalog = plan::plan(dumped.clone(), workers);
        let from_files = plan::plan(layout.discover_units().unwrap(), workers);
        assert_eq!(from_catalog, from_files, "workers = {}", workers);
    }
}

#[test]
fn interrupted_restore_never_reaches_post_data() {
    let dir = tempfile::tempdir().unwrap();
    seed_backup(dir.path(), &shop_units());
    let tools = FakeTools::default();
    let backends = Backends {
        tools: &tools,
        launcher: &MarkerLauncher,
        compressor: Compressor::default(),
    };
    let opts = RestoreOptions {
        conn: conn(),
        jobs: 3,
        input: dir.path().to_path_buf(),
    };
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = ops::run_restore(&opts, || Ok(160002), &backends, &cancel).unwrap();

    assert_eq!(outcome, RunOutcome::Interrupted);
    assert!(tools.calls().is_empty());
}

#[test]
fn restore_goes_ahead_when_artifacts_are_missing() {
    let dir = tempfile::tempdir().unwrap();
    let layout = seed_backup(dir.path(), &shop_units()[..2]);
    layout
        .save_metadata(&BackupMetadata::new("shop", "16.2", 3))
        .unwrap();
    let meta = layout.load_metadata().unwrap();
    assert_eq!(meta.missing_artifacts(layout.count_artifacts().unwrap()), Some(1));

    let tools = FakeTools::default();
    let backends = Backends {
        tools: &tools,
        launcher: &MarkerLauncher,
        compressor: Compressor::default(),
    };
    let opts = RestoreOptions {
        conn: conn(),
        jobs: 2,
        input: dir.path().to_path_buf(),
    };

    let outcome =
        ops::run_restore(&opts, || Ok(160002), &backends, &CancelToken::new()).unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
}
