//! Work units, round-robin planning and per-slot psql scripts.

use std::fmt;
use std::path::Path;

use crate::drivers::Compressor;
use crate::snapshot::BEGIN_SNAPSHOT_TRANSACTION;
use crate::utils::quote::{escape_name, quote_ident, quote_literal, shell_quote, unescape_name};

const ARTIFACT_PREFIX: &str = "data-";
const ARTIFACT_SUFFIX: &str = ".bin.gz";
const MARKER: &str = "@@snapdump";
const STOP_VAR: &str = "snapdump_stop";

/// One table scheduled for an independent data transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkUnit {
    pub schema: String,
    pub table: String,
}

impl WorkUnit {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `data-<schema>.<table>.bin.gz` with both names escaped.
    pub fn artifact_name(&self) -> String {
        format!(
            "{}{}.{}{}",
            ARTIFACT_PREFIX,
            escape_name(&self.schema),
            escape_name(&self.table),
            ARTIFACT_SUFFIX
        )
    }

    /// Recover the unit an artifact file name was produced for.
    pub fn from_artifact_name(file_name: &str) -> Option<Self> {
        let stem = file_name
            .strip_prefix(ARTIFACT_PREFIX)?
            .strip_suffix(ARTIFACT_SUFFIX)?;
        let (schema, table) = stem.split_once('.')?;
        Some(Self::new(unescape_name(schema)?, unescape_name(table)?))
    }

    pub fn qualified_ident(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Units assigned to worker slots `1..=N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPlan {
    slots: Vec<Vec<WorkUnit>>,
}

impl WorkPlan {
    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    /// Units of a 1-based slot.
    pub fn slot(&self, index: usize) -> &[WorkUnit] {
        index
            .checked_sub(1)
            .and_then(|i| self.slots.get(i))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Non-empty slots with their 1-based index.
    pub fn busy_slots(&self) -> impl Iterator<Item = (usize, &[WorkUnit])> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, units)| !units.is_empty())
            .map(|(i, units)| (i + 1, units.as_slice()))
    }

    pub fn unit_count(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    pub fn slot_of(&self, unit: &WorkUnit) -> Option<usize> {
        self.slots
            .iter()
            .position(|units| units.contains(unit))
            .map(|i| i + 1)
    }
}

/// Assign units round-robin after a stable sort on schema name, so order
/// within a schema is the caller's order. Deterministic for equal inputs.
pub fn plan(mut units: Vec<WorkUnit>, worker_count: usize) -> WorkPlan {
    let workers = worker_count.max(1);
    units.sort_by(|a, b| a.schema.cmp(&b.schema));

    let mut slots = vec![Vec::new(); workers];
    for (i, unit) in units.into_iter().enumerate() {
        slots[i % workers].push(unit);
    }
    WorkPlan { slots }
}

/// Progress marker a worker prints around each unit. A unit closes with
/// either `End` or `Fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Begin(usize),
    End(usize),
    Fail(usize),
}

pub fn parse_marker(line: &str) -> Option<Marker> {
    let mut parts = line.split_whitespace();
    if parts.next()? != MARKER {
        return None;
    }
    let kind = parts.next()?;
    let index = parts.next()?.parse().ok()?;
    match kind {
        "begin" => Some(Marker::Begin(index)),
        "end" => Some(Marker::End(index)),
        "fail" => Some(Marker::Fail(index)),
        _ => None,
    }
}

/// Everything a slot script needs besides its units.
pub struct ScriptContext<'a> {
    pub settings: &'a [&'static str],
    /// Snapshot to import; `None` for restore scripts.
    pub snapshot: Option<&'a str>,
    /// Workers quit before their next unit once this file exists.
    pub stop_file: &'a Path,
    pub compressor: &'a Compressor,
}

/// Dump script: import the snapshot, then stream each table in binary
/// format through the compressor into its artifact. Errors before the first
/// table abort the worker; a failing table is rolled back to its savepoint
/// and reported, and the worker moves on.
pub fn render_dump_script(units: &[WorkUnit], dir: &Path, ctx: &ScriptContext<'_>) -> String {
    let mut script = script_header(ctx);
    script.push_str(BEGIN_SNAPSHOT_TRANSACTION);
    script.push_str(";\n");
    if let Some(token) = ctx.snapshot {
        script.push_str(&format!("SET TRANSACTION SNAPSHOT {};\n", quote_literal(token)));
    }
    script.push_str("\\set ON_ERROR_STOP off\n\\set ON_ERROR_ROLLBACK on\n");
    for (i, unit) in units.iter().enumerate() {
        let artifact = dir.join(unit.artifact_name());
        push_stop_check(&mut script, ctx.stop_file);
        script.push_str(&format!("\\echo {} begin {}\n", MARKER, i));
        script.push_str(&format!(
            "\\o | {} > {}\n",
            ctx.compressor.compress_command(),
            shell_quote(&artifact.to_string_lossy())
        ));
        script.push_str(&format!(
            "COPY {} TO STDOUT WITH (FORMAT binary);\n",
            unit.qualified_ident()
        ));
        script.push_str("\\o\n");
        push_unit_result(&mut script, i);
    }
    script.push_str("COMMIT;\n");
    script
}

/// Restore script: load each artifact through the decompressor. Each
/// `\copy` commits on its own, so one failing table leaves the others alone.
pub fn render_restore_script(units: &[WorkUnit], dir: &Path, ctx: &ScriptContext<'_>) -> String {
    let mut script = script_header(ctx);
    script.push_str("\\set ON_ERROR_STOP off\n");
    for (i, unit) in units.iter().enumerate() {
        let artifact = dir.join(unit.artifact_name());
        let program = format!(
            "{} {}",
            ctx.compressor.decompress_command(),
            shell_quote(&artifact.to_string_lossy())
        );
        push_stop_check(&mut script, ctx.stop_file);
        script.push_str(&format!("\\echo {} begin {}\n", MARKER, i));
        script.push_str(&format!(
            "\\copy {} FROM PROGRAM {} WITH (FORMAT binary)\n",
            unit.qualified_ident(),
            quote_literal(&program)
        ));
        push_unit_result(&mut script, i);
    }
    script
}

fn script_header(ctx: &ScriptContext<'_>) -> String {
    let mut script = String::from("\\set ON_ERROR_STOP on\n\\set QUIET on\n");
    for setting in ctx.settings {
        script.push_str(setting);
        script.push_str(";\n");
    }
    script
}

/// `ERROR` reflects the last SQL command, which is the unit's COPY.
fn push_unit_result(script: &mut String, index: usize) {
    script.push_str(&format!(
        "\\if :ERROR\n\\echo {m} fail {i}\n\\else\n\\echo {m} end {i}\n\\endif\n",
        m = MARKER,
        i = index
    ));
}

fn push_stop_check(script: &mut String, stop_file: &Path) {
    script.push_str(&format!(
        "\\set {} `test -e {} && echo on || echo off`\n\\if :{}\n\\q\n\\endif\n",
        STOP_VAR,
        shell_quote(&stop_file.to_string_lossy()),
        STOP_VAR
    ));
}
