use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use colored::*;
use comfy_table::{Attribute, Cell, ContentArrangement, Table, presets::UTF8_FULL};
use indicatif::{ProgressBar, ProgressStyle};

use crate::cancel::CancelToken;
use crate::catalog;
use crate::config::backup::BackupMetadata;
use crate::config::connection::ConnectionParams;
use crate::drivers::postgres::PgTools;
use crate::drivers::psql::PsqlLauncher;
use crate::drivers::{Compressor, SchemaTool, Section, TableFilters, WorkerLauncher};
use crate::error::SnapError;
use crate::plan::{self, ScriptContext, WorkPlan};
use crate::pool::{PoolReport, UnitEvent, UnitOutcome, WorkerPool};
use crate::snapshot::{self, ControlSession, PgSession, SnapshotCoordinator};
use crate::storage::BackupLayout;

/// How a mode driver ended when it did not hit a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Interrupted,
    PartialFailure { failed: usize },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Interrupted => 1,
            RunOutcome::PartialFailure { .. } => 3,
        }
    }
}

pub struct DumpOptions {
    pub conn: ConnectionParams,
    pub jobs: usize,
    pub filters: TableFilters,
    pub output: PathBuf,
}

pub struct RestoreOptions {
    pub conn: ConnectionParams,
    pub jobs: usize,
    pub input: PathBuf,
}

/// External collaborators a mode driver talks to.
pub struct Backends<'a> {
    pub tools: &'a dyn SchemaTool,
    pub launcher: &'a dyn WorkerLauncher,
    pub compressor: Compressor,
}

pub fn do_dump(opts: DumpOptions, cancel: &CancelToken) -> Result<RunOutcome> {
    let tools = PgTools::new(opts.conn.clone());
    let launcher = PsqlLauncher::new(opts.conn.clone());
    let backends = Backends {
        tools: &tools,
        launcher: &launcher,
        compressor: Compressor::default(),
    };
    let conn = opts.conn.clone();
    run_dump(
        &opts,
        move || Ok(Box::new(PgSession::connect(&conn)?) as Box<dyn ControlSession>),
        &backends,
        cancel,
    )
}

/// Connect & snapshot → pre-data → plan & spawn → await → post-data →
/// disconnect. The snapshot connection is released exactly once on every
/// path out of here.
pub fn run_dump<C>(
    opts: &DumpOptions,
    connect: C,
    backends: &Backends<'_>,
    cancel: &CancelToken,
) -> Result<RunOutcome>
where
    C: FnOnce() -> Result<Box<dyn ControlSession>, SnapError>,
{
    let dbname = opts.conn.require_dbname()?.to_string();
    let started = Instant::now();
    let layout = BackupLayout::new(&opts.output);
    layout.create()?;

    let mut coordinator = SnapshotCoordinator::acquire(connect()?)?;
    phase(&format!(
        "Snapshot {} exported from database '{}'",
        coordinator.token(),
        dbname
    ));

    let outcome = dump_with_snapshot(opts, &dbname, &layout, &mut coordinator, backends, cancel);
    coordinator.release();

    let outcome = outcome?;
    report_outcome(outcome, "Backup", &layout, started);
    Ok(outcome)
}

fn dump_with_snapshot(
    opts: &DumpOptions,
    dbname: &str,
    layout: &BackupLayout,
    coordinator: &mut SnapshotCoordinator,
    backends: &Backends<'_>,
    cancel: &CancelToken,
) -> Result<RunOutcome> {
    let token = coordinator.token().to_string();
    let token = token.as_str();

    phase("Dumping pre-data section");
    let done = delegate("pre-data dump", cancel, || {
        backends
            .tools
            .dump_section(Section::PreData, token, &opts.filters, &layout.pre_data())
    })?;
    if !done || cancel.is_cancelled() {
        return Ok(RunOutcome::Interrupted);
    }

    let listing = backends.tools.list_archive(&layout.pre_data())?;
    let units = catalog::list_tables(&listing, |oids| coordinator.describe_relations(oids))?;
    let work = plan::plan(units, opts.jobs);
    tracing::info!(tables = work.unit_count(), workers = work.worker_count(), "work planned");

    let settings = snapshot::session_settings(coordinator.info().server_version_num);
    let report = run_parallel(&work, "Dumping", backends, cancel, |stop, units| {
        let ctx = ScriptContext {
            settings: &settings,
            snapshot: Some(token),
            stop_file: stop,
            compressor: &backends.compressor,
        };
        plan::render_dump_script(units, layout.root(), &ctx)
    })?;

    for failed in report.failed() {
        layout.remove_artifact(&failed.unit)?;
    }
    let mut pruned = 0;
    for unit in report.completed() {
        if layout.prune_if_empty(unit)? {
            pruned += 1;
        }
    }
    if pruned > 0 {
        println!(
            "{} {}",
            "i".yellow().bold(),
            format!("{} empty table(s) produced no artifact", pruned).yellow()
        );
    }

    if let Some(outcome) = parallel_outcome(&report) {
        return Ok(outcome);
    }

    phase("Dumping post-data section");
    let done = delegate("post-data dump", cancel, || {
        backends
            .tools
            .dump_section(Section::PostData, token, &opts.filters, &layout.post_data())
    })?;
    if !done {
        return Ok(RunOutcome::Interrupted);
    }

    let meta = BackupMetadata::new(
        dbname,
        &coordinator.info().server_version,
        layout.count_artifacts()?,
    );
    layout.save_metadata(&meta)?;
    Ok(RunOutcome::Completed)
}

pub fn do_restore(opts: RestoreOptions, cancel: &CancelToken) -> Result<RunOutcome> {
    let tools = PgTools::new(opts.conn.clone());
    let launcher = PsqlLauncher::new(opts.conn.clone());
    let backends = Backends {
        tools: &tools,
        launcher: &launcher,
        compressor: Compressor::default(),
    };
    let conn = opts.conn.clone();
    run_restore(
        &opts,
        move || {
            let mut session: Box<dyn ControlSession> = Box::new(PgSession::connect(&conn)?);
            let version = session.server_version_num();
            session.close()?;
            version
        },
        &backends,
        cancel,
    )
}

/// Pre-data → plan from artifact names & spawn → await → post-data.
pub fn run_restore<P>(
    opts: &RestoreOptions,
    server_version: P,
    backends: &Backends<'_>,
    cancel: &CancelToken,
) -> Result<RunOutcome>
where
    P: FnOnce() -> Result<i32, SnapError>,
{
    opts.conn.require_dbname()?;
    let started = Instant::now();
    let layout = BackupLayout::new(&opts.input);
    layout.ensure_restorable()?;

    let meta = match layout.load_metadata() {
        Ok(meta) => {
            tracing::info!(
                database = %meta.database,
                version = %meta.server_version,
                tables = meta.table_count,
                "restoring backup"
            );
            Some(meta)
        }
        Err(err) => {
            tracing::warn!(error = %err, "backup has no readable metadata");
            None
        }
    };

    let version_num = server_version()?;

    phase("Restoring pre-data section");
    let done = delegate("pre-data restore", cancel, || {
        backends
            .tools
            .restore_section(Section::PreData, &layout.pre_data(), 1)
    })?;
    if !done || cancel.is_cancelled() {
        report_outcome(RunOutcome::Interrupted, "Restore", &layout, started);
        return Ok(RunOutcome::Interrupted);
    }

    let units = layout.discover_units()?;
    if let Some(missing) = meta.as_ref().and_then(|m| m.missing_artifacts(units.len())) {
        eprintln!(
            "{} {}",
            "!".yellow().bold(),
            format!(
                "backup recorded {} table artifact(s) but {} are missing; restoring the rest",
                units.len() + missing,
                missing
            )
            .yellow()
        );
    }
    let work = plan::plan(units, opts.jobs);
    tracing::info!(tables = work.unit_count(), workers = work.worker_count(), "work planned");

    let settings = snapshot::session_settings(version_num);
    let report = run_parallel(&work, "Restoring", backends, cancel, |stop, units| {
        let ctx = ScriptContext {
            settings: &settings,
            snapshot: None,
            stop_file: stop,
            compressor: &backends.compressor,
        };
        plan::render_restore_script(units, layout.root(), &ctx)
    })?;

    if let Some(outcome) = parallel_outcome(&report) {
        report_outcome(outcome, "Restore", &layout, started);
        return Ok(outcome);
    }

    phase("Restoring post-data section");
    let done = delegate("post-data restore", cancel, || {
        backends
            .tools
            .restore_section(Section::PostData, &layout.post_data(), opts.jobs)
    })?;
    let outcome = if done {
        RunOutcome::Completed
    } else {
        RunOutcome::Interrupted
    };
    report_outcome(outcome, "Restore", &layout, started);
    Ok(outcome)
}

/// Print the metadata of a backup without touching any database.
pub fn do_info(input: PathBuf) -> Result<()> {
    let layout = BackupLayout::new(input);
    let meta = layout.load_metadata()?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Created").add_attribute(Attribute::Bold),
            Cell::new("Database").add_attribute(Attribute::Bold),
            Cell::new("Server version").add_attribute(Attribute::Bold),
            Cell::new("Tables").add_attribute(Attribute::Bold),
        ]);
    table.add_row(vec![
        Cell::new(meta.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        Cell::new(&meta.database),
        Cell::new(&meta.server_version),
        Cell::new(meta.table_count),
    ]);
    println!("{}", table);
    Ok(())
}

/// Run the parallel data phase with a progress bar over all units.
fn run_parallel<R>(
    work: &WorkPlan,
    verb: &str,
    backends: &Backends<'_>,
    cancel: &CancelToken,
    render: R,
) -> Result<PoolReport>
where
    R: Fn(&std::path::Path, &[crate::plan::WorkUnit]) -> String,
{
    let mut pool = WorkerPool::new(backends.launcher, cancel.clone())?;
    let stop = pool.stop_file().to_path_buf();
    let bar = create_unit_bar(work.unit_count() as u64);

    let report = pool.run(
        work,
        |units| render(&stop, units),
        |event| match event {
            UnitEvent::Started { slot, unit } => {
                bar.set_message(unit.to_string());
                bar.suspend(|| {
                    println!("[{}] {} table {} (worker {})", stamp(), verb.to_lowercase(), unit, slot)
                });
            }
            UnitEvent::Finished { .. } => bar.inc(1),
            UnitEvent::Failed { slot, unit } => {
                bar.inc(1);
                bar.suspend(|| {
                    eprintln!("[{}] {} table {} failed (worker {})", stamp(), verb.to_lowercase(), unit, slot)
                });
            }
        },
    )?;
    bar.finish_and_clear();
    Ok(report)
}

/// Decide whether the run stops after the parallel phase.
fn parallel_outcome(report: &PoolReport) -> Option<RunOutcome> {
    let failed: Vec<_> = report.failed().collect();
    if !failed.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_header(vec!["Worker", "Table", "Reason"]);
        for r in &failed {
            let reason = match &r.outcome {
                UnitOutcome::Failed { reason } => reason.as_str(),
                _ => "",
            };
            table.add_row(vec![r.slot.to_string(), r.unit.to_string(), reason.to_string()]);
        }
        eprintln!(
            "{} {}",
            "!".yellow().bold(),
            format!("{} table(s) failed to transfer", failed.len()).yellow()
        );
        eprintln!("{}", table);
    }

    if report.interrupted {
        Some(RunOutcome::Interrupted)
    } else if !failed.is_empty() {
        Some(RunOutcome::PartialFailure {
            failed: failed.len(),
        })
    } else {
        None
    }
}

/// Run a delegated tool phase under a spinner. `Ok(false)` means the run
/// was interrupted, either before the tool started or while it ran.
fn delegate<F>(what: &str, cancel: &CancelToken, f: F) -> Result<bool>
where
    F: FnOnce() -> Result<(), SnapError>,
{
    if cancel.is_cancelled() {
        tracing::debug!("{} not started; run interrupted", what);
        return Ok(false);
    }
    let bar = create_progress_bar(what);
    let result = f();
    bar.finish_and_clear();
    match result {
        Ok(()) => Ok(true),
        Err(err) if cancel.is_cancelled() => {
            tracing::debug!(error = %err, "{} aborted by interruption", what);
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

fn report_outcome(outcome: RunOutcome, what: &str, layout: &BackupLayout, started: Instant) {
    let elapsed = started.elapsed().as_secs_f64();
    match outcome {
        RunOutcome::Completed => println!(
            "{} {}",
            "✔".green().bold(),
            format!(
                "[{}] {} of {} complete in {:.1}s",
                stamp(),
                what,
                layout.root().display(),
                elapsed
            )
            .green()
        ),
        RunOutcome::Interrupted => eprintln!(
            "{} {}",
            "!".yellow().bold(),
            format!("[{}] {} interrupted; post-data skipped", stamp(), what).yellow()
        ),
        RunOutcome::PartialFailure { failed } => eprintln!(
            "{} {}",
            "!".yellow().bold(),
            format!(
                "[{}] {} incomplete: {} table(s) failed; post-data skipped",
                stamp(),
                what,
                failed
            )
            .yellow()
        ),
    }
}

fn phase(message: &str) {
    println!("{} [{}] {}", "→".cyan().bold(), stamp(), message);
}

fn stamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn create_progress_bar(prefix: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} {elapsed}") {
        bar.set_style(style.tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "));
    }
    bar.set_message(prefix.to_string());
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar
}

fn create_unit_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template("{bar:30} {pos}/{len} tables {msg}") {
        bar.set_style(style);
    }
    bar
}
