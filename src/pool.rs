//! Worker pool: one client process per busy slot, completion reported over a
//! channel, cancellation delivered as just another event.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use tempfile::{NamedTempFile, TempDir};

use crate::cancel::{CancelToken, Subscription};
use crate::drivers::WorkerLauncher;
use crate::error::{Result, SnapError};
use crate::plan::{Marker, WorkPlan, WorkUnit, parse_marker};

/// Whether a live worker has reported any progress yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Spawned,
    Running,
}

/// A live worker. Dropped (and its script file deleted) once reaped.
struct WorkerRecord {
    pid: u32,
    state: WorkerState,
    units: Vec<WorkUnit>,
    started: Vec<bool>,
    finished: Vec<bool>,
    failed: Vec<bool>,
    _script: NamedTempFile,
}

enum PoolEvent {
    Marker { slot: usize, marker: Marker },
    Exited { slot: usize, status: io::Result<ExitStatus> },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Completed,
    Failed { reason: String },
    /// Never attempted because the run was interrupted.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct UnitReport {
    pub slot: usize,
    pub unit: WorkUnit,
    pub outcome: UnitOutcome,
}

#[derive(Debug, Default)]
pub struct PoolReport {
    pub units: Vec<UnitReport>,
    pub interrupted: bool,
}

impl PoolReport {
    pub fn completed(&self) -> impl Iterator<Item = &WorkUnit> {
        self.units
            .iter()
            .filter(|r| r.outcome == UnitOutcome::Completed)
            .map(|r| &r.unit)
    }

    pub fn failed(&self) -> impl Iterator<Item = &UnitReport> {
        self.units
            .iter()
            .filter(|r| matches!(r.outcome, UnitOutcome::Failed { .. }))
    }

    pub fn skipped_count(&self) -> usize {
        self.units
            .iter()
            .filter(|r| r.outcome == UnitOutcome::Skipped)
            .count()
    }

    pub fn outcome_of(&self, unit: &WorkUnit) -> Option<&UnitOutcome> {
        self.units.iter().find(|r| &r.unit == unit).map(|r| &r.outcome)
    }
}

/// Per-unit progress seen by the caller while the pool drains.
#[derive(Debug, Clone, Copy)]
pub enum UnitEvent<'a> {
    Started { slot: usize, unit: &'a WorkUnit },
    Finished { slot: usize, unit: &'a WorkUnit },
    /// The worker reported an error for this unit and moved on.
    Failed { slot: usize, unit: &'a WorkUnit },
}

pub struct WorkerPool<'l> {
    launcher: &'l dyn WorkerLauncher,
    cancel: CancelToken,
    scratch: TempDir,
    stop_file: PathBuf,
    stopping: bool,
    live: BTreeMap<usize, WorkerRecord>,
    reports: Vec<UnitReport>,
    tx: Sender<PoolEvent>,
    rx: Receiver<PoolEvent>,
    _subscription: Subscription,
}

impl<'l> WorkerPool<'l> {
    pub fn new(launcher: &'l dyn WorkerLauncher, cancel: CancelToken) -> Result<Self> {
        let scratch = tempfile::Builder::new().prefix("snapdump-").tempdir()?;
        let stop_file = scratch.path().join("stop");
        let (tx, rx) = mpsc::channel();
        let notify = tx.clone();
        let subscription = cancel.on_cancel(move || {
            let _ = notify.send(PoolEvent::Cancelled);
        });
        Ok(Self {
            launcher,
            cancel,
            scratch,
            stop_file,
            stopping: false,
            live: BTreeMap::new(),
            reports: Vec::new(),
            tx,
            rx,
            _subscription: subscription,
        })
    }

    /// Sentinel whose existence tells workers not to start another unit.
    pub fn stop_file(&self) -> &Path {
        &self.stop_file
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Spawn the worker for `slot`, fed `script` through a temporary file
    /// that lives until the worker is reaped. Returns the process id.
    pub fn spawn(&mut self, slot: usize, units: &[WorkUnit], script: &str) -> Result<u32> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("slot-{}-", slot))
            .suffix(".sql")
            .tempfile_in(self.scratch.path())?;
        file.write_all(script.as_bytes())?;
        file.flush()?;

        let mut cmd = self.launcher.command(file.path());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        {
            // keep terminal signals away from workers; they drain on their own
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|source| SnapError::ToolSpawn {
            tool: cmd.get_program().to_string_lossy().into_owned(),
            source,
        })?;
        let pid = child.id();
        let tx = self.tx.clone();
        thread::Builder::new()
            .name(format!("worker-{}", slot))
            .spawn(move || watch(slot, child, tx))?;

        tracing::info!(slot, pid, units = units.len(), "worker spawned");
        self.live.insert(
            slot,
            WorkerRecord {
                pid,
                state: WorkerState::Spawned,
                units: units.to_vec(),
                started: vec![false; units.len()],
                finished: vec![false; units.len()],
                failed: vec![false; units.len()],
                _script: file,
            },
        );
        Ok(pid)
    }

    /// Spawn one worker per busy slot of `plan`, then wait for all of them.
    /// Slots not yet spawned when the token is cancelled are skipped.
    pub fn run<R, F>(&mut self, plan: &WorkPlan, render: R, on_event: F) -> Result<PoolReport>
    where
        R: Fn(&[WorkUnit]) -> String,
        F: FnMut(UnitEvent<'_>),
    {
        for (slot, units) in plan.busy_slots() {
            if self.cancel.is_cancelled() {
                self.skip(slot, units);
                continue;
            }
            if let Err(err) = self.spawn(slot, units, &render(units)) {
                tracing::error!(slot, error = %err, "cannot start worker; draining the others");
                self.interrupt();
                return Err(err);
            }
        }
        Ok(self.await_all(on_event))
    }

    /// Block until every live worker has been reaped, handing progress
    /// markers to `on_event` as they arrive.
    pub fn await_all<F>(&mut self, mut on_event: F) -> PoolReport
    where
        F: FnMut(UnitEvent<'_>),
    {
        while !self.live.is_empty() {
            let Ok(event) = self.rx.recv() else {
                break;
            };
            match event {
                PoolEvent::Cancelled => self.request_stop(),
                PoolEvent::Marker { slot, marker } => {
                    let Some(record) = self.live.get_mut(&slot) else {
                        continue;
                    };
                    record.state = WorkerState::Running;
                    match marker {
                        Marker::Begin(i) if i < record.units.len() => {
                            record.started[i] = true;
                            on_event(UnitEvent::Started {
                                slot,
                                unit: &record.units[i],
                            });
                        }
                        Marker::End(i) if i < record.units.len() => {
                            record.finished[i] = true;
                            on_event(UnitEvent::Finished {
                                slot,
                                unit: &record.units[i],
                            });
                        }
                        Marker::Fail(i) if i < record.units.len() => {
                            record.failed[i] = true;
                            tracing::warn!(slot, unit = %record.units[i], "table transfer failed");
                            on_event(UnitEvent::Failed {
                                slot,
                                unit: &record.units[i],
                            });
                        }
                        other => tracing::warn!(slot, marker = ?other, "marker for unknown unit"),
                    }
                }
                PoolEvent::Exited { slot, status } => {
                    if let Some(record) = self.live.remove(&slot) {
                        self.reap(slot, record, status);
                    }
                }
            }
        }

        PoolReport {
            units: std::mem::take(&mut self.reports),
            interrupted: self.cancel.is_cancelled(),
        }
    }

    /// Cancel the run and wait for every live worker to finish the unit it
    /// is on.
    pub fn interrupt(&mut self) -> PoolReport {
        self.cancel.cancel();
        self.request_stop();
        self.await_all(|_| {})
    }

    fn request_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        if let Err(err) = fs::write(&self.stop_file, b"stop\n") {
            tracing::error!(error = %err, "cannot write stop sentinel");
        }
        let running = self
            .live
            .values()
            .filter(|r| r.state == WorkerState::Running)
            .count();
        tracing::info!(
            running,
            not_started = self.live.len() - running,
            "stop requested; waiting for workers"
        );
    }

    fn skip(&mut self, slot: usize, units: &[WorkUnit]) {
        self.reports.extend(units.iter().map(|unit| UnitReport {
            slot,
            unit: unit.clone(),
            outcome: UnitOutcome::Skipped,
        }));
    }

    fn reap(&mut self, slot: usize, record: WorkerRecord, status: io::Result<ExitStatus>) {
        let status_text = match &status {
            Ok(s) => s.to_string(),
            Err(e) => format!("wait failed: {}", e),
        };
        let success = matches!(&status, Ok(s) if s.success());
        if success {
            tracing::info!(slot, pid = record.pid, "worker finished");
        } else {
            tracing::warn!(slot, pid = record.pid, status = %status_text, "worker failed");
        }

        for (i, unit) in record.units.into_iter().enumerate() {
            let outcome = if record.failed[i] {
                UnitOutcome::Failed {
                    reason: "table transfer reported an error".to_string(),
                }
            } else if record.finished[i] {
                UnitOutcome::Completed
            } else if record.started[i] {
                UnitOutcome::Failed {
                    reason: format!("worker exited mid-transfer ({})", status_text),
                }
            } else if self.stopping && success {
                UnitOutcome::Skipped
            } else {
                UnitOutcome::Failed {
                    reason: format!("not reached; worker exited ({})", status_text),
                }
            };
            self.reports.push(UnitReport {
                slot,
                unit,
                outcome,
            });
        }
    }
}

/// Forward progress markers from the worker's stdout, then reap it.
fn watch(slot: usize, mut child: Child, tx: Sender<PoolEvent>) {
    if let Some(stdout) = child.stdout.take() {
        // stray query output may not be UTF-8; only marker lines matter
        for line in BufReader::new(stdout).split(b'\n') {
            let Ok(line) = line else { break };
            let line = String::from_utf8_lossy(&line);
            match parse_marker(&line) {
                Some(marker) => {
                    let _ = tx.send(PoolEvent::Marker { slot, marker });
                }
                None if !line.trim().is_empty() => tracing::debug!(slot, "{}", line),
                None => {}
            }
        }
    }
    let status = child.wait();
    let _ = tx.send(PoolEvent::Exited { slot, status });
}
