use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::plan::WorkUnit;

// `<dump id>; <catalog oid> <object oid> <desc> <schema> <name> <owner>`
// Names are printed unquoted, so only the leading numeric fields and the
// first word of the description can be trusted positionally.
const CATALOG_FIELD: usize = 1;
const OID_FIELD: usize = 2;
const DESC_FIELD: usize = 3;
const MIN_FIELDS: usize = 6;

/// `pg_class` itself; table entries carry it as their catalog oid, while
/// `TABLE DATA` and `TABLE ATTACH` entries carry 0.
const PG_CLASS_OID: &str = "1259";

/// Ordinary table, the only relkind COPY can read rows from directly.
pub const BASE_TABLE: char = 'r';

/// A relation as the server names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    /// `pg_class.relkind`
    pub kind: char,
}

/// Object oids of `TABLE` entries in a `pg_restore -l` listing, in listing
/// order without repeats. Comment lines and malformed rows are skipped.
pub fn table_oids(listing: &str) -> Vec<u32> {
    let mut seen = HashSet::new();
    let mut oids = Vec::new();

    for line in listing.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < MIN_FIELDS {
            tracing::debug!(line, "skipping short catalog row");
            continue;
        }
        if fields[DESC_FIELD] != "TABLE" || fields[CATALOG_FIELD] != PG_CLASS_OID {
            continue;
        }
        match fields[OID_FIELD].parse::<u32>() {
            Ok(oid) if seen.insert(oid) => oids.push(oid),
            Ok(_) => {}
            Err(_) => tracing::debug!(line, "skipping catalog row without an oid"),
        }
    }
    oids
}

/// Base tables of a listing in listing order. Schema and table names come
/// from `describe`, which maps oids to the relations the server knows, so
/// names with spaces or other awkward characters survive intact.
/// Partitioned parents and other non-base relations are dropped; their
/// partitions appear as entries of their own.
pub fn list_tables<D>(listing: &str, describe: D) -> Result<Vec<WorkUnit>>
where
    D: FnOnce(&[u32]) -> Result<Vec<Relation>>,
{
    let oids = table_oids(listing);
    if oids.is_empty() {
        return Ok(Vec::new());
    }
    let relations: HashMap<u32, Relation> = describe(&oids)?
        .into_iter()
        .map(|r| (r.oid, r))
        .collect();

    let mut units = Vec::with_capacity(oids.len());
    for oid in oids {
        match relations.get(&oid) {
            Some(rel) if rel.kind == BASE_TABLE => units.push(WorkUnit::new(&rel.schema, &rel.name)),
            Some(rel) => {
                tracing::debug!(oid, schema = %rel.schema, name = %rel.name, kind = %rel.kind, "not a base table")
            }
            None => tracing::warn!(oid, "listed table not found in the snapshot"),
        }
    }
    Ok(units)
}
