//! In-memory fixtures for testing plans end to end.
//!
//! [`MemEnv`] is a toy catalog: tables are row vectors keyed by dotted
//! names, optionally laid out as shards (for `UNION MAP` fan-out) or
//! partitions (for `UNION PARTITION`), optionally carrying cache counters
//! and a [`MemIndex`]. It implements every optional environment
//! capability, including handle decoding, so encoded plans round-trip
//! against it.

use crate::env::{
    Env, HandleDecoder, Hints, Index, Indexer, Input, MultiHandle, TableHandle, TableLister,
};
use crate::error::{Error, Result};
use crate::expr::{Expr, Value};
use crate::split::{Subtable, TablePart};
use crate::vm::{CacheStats, MemTable, Row, Table};
use crate::wire::{Datum, Symtab};
use std::collections::HashMap;
use std::sync::Arc;

/// Build a row from `(name, value)` pairs.
pub fn row(fields: Vec<(&str, Value)>) -> Row {
    Row::new(
        fields
            .into_iter()
            .map(|(n, v)| (n.to_string(), v))
            .collect(),
    )
}

/// An in-memory table handle over fixed rows.
pub struct MemHandle {
    pub name: String,
    rows: Vec<Row>,
    shards: Option<Vec<Vec<Row>>>,
    parts: Option<(Vec<String>, Vec<(Vec<Value>, Vec<Row>)>)>,
    cache: Option<CacheStats>,
    size: i64,
}

impl MemHandle {
    pub fn new(name: &str, rows: Vec<Row>) -> Self {
        let size = encoded_size(&rows);
        Self {
            name: name.to_string(),
            rows,
            shards: None,
            parts: None,
            cache: None,
            size,
        }
    }

    /// Lay the rows out as explicit shards; `split()` yields one local
    /// subtable per shard.
    pub fn sharded(name: &str, shards: Vec<Vec<Row>>) -> Self {
        let rows: Vec<Row> = shards.iter().flatten().cloned().collect();
        let mut h = Self::new(name, rows);
        h.shards = Some(shards);
        h
    }

    /// Lay the rows out as partitions on `keys`; `split_by(keys)` yields
    /// one part per entry.
    pub fn partitioned(name: &str, keys: &[&str], parts: Vec<(Vec<Value>, Vec<Row>)>) -> Self {
        let rows: Vec<Row> = parts.iter().flat_map(|(_, r)| r.clone()).collect();
        let mut h = Self::new(name, rows);
        h.parts = Some((keys.iter().map(|s| s.to_string()).collect(), parts));
        h
    }

    pub fn with_cache(mut self, hits: u64, misses: u64) -> Self {
        self.cache = Some(CacheStats { hits, misses });
        self
    }
}

fn encoded_size(rows: &[Row]) -> i64 {
    let mut st = Symtab::new();
    let mut buf = Vec::new();
    for r in rows {
        r.to_datum(&mut st).encode(&mut buf);
    }
    buf.len() as i64
}

impl TableHandle for MemHandle {
    fn open(&self) -> Result<Box<dyn Table>> {
        Ok(match self.cache {
            Some(cs) => Box::new(MemTable::with_cache(self.rows.clone(), cs)),
            None => Box::new(MemTable::new(self.rows.clone())),
        })
    }

    fn encode(&self, st: &mut Symtab) -> Result<Datum> {
        let mut fields = vec![
            (st.intern("name"), Datum::Str(self.name.clone())),
            (
                st.intern("rows"),
                Datum::List(self.rows.iter().map(|r| r.to_datum(st)).collect()),
            ),
        ];
        if let Some(cs) = self.cache {
            fields.push((st.intern("hits"), Datum::Int(cs.hits as i64)));
            fields.push((st.intern("misses"), Datum::Int(cs.misses as i64)));
        }
        Ok(Datum::Struct(fields))
    }

    fn size(&self) -> i64 {
        self.size
    }

    fn split(&self) -> Result<Option<Vec<Subtable>>> {
        let Some(shards) = &self.shards else {
            return Ok(None);
        };
        Ok(Some(
            shards
                .iter()
                .enumerate()
                .map(|(i, rows)| {
                    Subtable::local(Arc::new(MemHandle::new(
                        &format!("{}#{i}", self.name),
                        rows.clone(),
                    )))
                })
                .collect(),
        ))
    }

    fn split_by(&self, by: &[String]) -> Result<Option<Vec<TablePart>>> {
        let Some((keys, parts)) = &self.parts else {
            return Ok(None);
        };
        if keys != by {
            return Ok(None);
        }
        Ok(Some(
            parts
                .iter()
                .map(|(values, rows)| TablePart {
                    handle: Arc::new(MemHandle::new(&self.name, rows.clone())),
                    parts: values.clone(),
                })
                .collect(),
        ))
    }
}

/// A data-skipping index over a fixed description.
#[derive(Clone, Debug, Default)]
pub struct MemIndex {
    ranges: HashMap<String, (i64, i64)>,
    partitions: Vec<String>,
}

impl MemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, path: &str, min: i64, max: i64) -> Self {
        self.ranges.insert(path.to_string(), (min, max));
        self
    }

    pub fn with_partition(mut self, name: &str) -> Self {
        self.partitions.push(name.to_string());
        self
    }
}

impl Index for MemIndex {
    fn time_range(&self, path: &[String]) -> Option<(i64, i64)> {
        self.ranges.get(&path.join(".")).copied()
    }

    fn has_partition(&self, name: &str) -> bool {
        self.partitions.iter().any(|p| p == name)
    }
}

#[derive(Default)]
struct TableDef {
    rows: Vec<Row>,
    shards: Option<Vec<Vec<Row>>>,
    parts: Option<(Vec<String>, Vec<(Vec<Value>, Vec<Row>)>)>,
    cache: Option<CacheStats>,
    index: Option<MemIndex>,
}

impl TableDef {
    fn handle(&self, name: &str) -> MemHandle {
        let mut h = if let Some(shards) = &self.shards {
            MemHandle::sharded(name, shards.clone())
        } else if let Some((keys, parts)) = &self.parts {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            MemHandle::partitioned(name, &keys, parts.clone())
        } else {
            MemHandle::new(name, self.rows.clone())
        };
        if let Some(cs) = self.cache {
            h = h.with_cache(cs.hits, cs.misses);
        }
        h
    }
}

/// An in-memory catalog environment.
#[derive(Default)]
pub struct MemEnv {
    tables: HashMap<String, TableDef>,
}

impl MemEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table under a dotted name (`"db.tbl"` or just `"tbl"`).
    pub fn add_table(&mut self, name: &str, rows: Vec<Row>) -> &mut Self {
        self.tables.entry(name.to_string()).or_default().rows = rows;
        self
    }

    pub fn add_sharded(&mut self, name: &str, shards: Vec<Vec<Row>>) -> &mut Self {
        let def = self.tables.entry(name.to_string()).or_default();
        def.rows = shards.iter().flatten().cloned().collect();
        def.shards = Some(shards);
        self
    }

    pub fn add_partitioned(
        &mut self,
        name: &str,
        keys: &[&str],
        parts: Vec<(Vec<Value>, Vec<Row>)>,
    ) -> &mut Self {
        let def = self.tables.entry(name.to_string()).or_default();
        def.rows = parts.iter().flat_map(|(_, r)| r.clone()).collect();
        def.parts = Some((keys.iter().map(|s| s.to_string()).collect(), parts));
        self
    }

    pub fn set_cache(&mut self, name: &str, hits: u64, misses: u64) -> &mut Self {
        self.tables.entry(name.to_string()).or_default().cache = Some(CacheStats { hits, misses });
        self
    }

    pub fn set_index(&mut self, name: &str, index: MemIndex) -> &mut Self {
        self.tables.entry(name.to_string()).or_default().index = Some(index);
        self
    }
}

fn table_name(e: &Expr) -> Result<String> {
    match e {
        Expr::Path(parts) if !parts.is_empty() => Ok(parts.join(".")),
        _ => Err(Error::Corrupt(format!("not a table reference: {e}"))),
    }
}

impl Env for MemEnv {
    fn stat(&self, table: &Expr, _hints: &Hints) -> Result<Input> {
        let name = table_name(table)?;
        let def = self
            .tables
            .get(&name)
            .ok_or_else(|| Error::NotFound(name.clone()))?;
        Ok(Input::new(table.clone(), Arc::new(def.handle(&name))))
    }

    fn lister(&self) -> Option<&dyn TableLister> {
        Some(self)
    }

    fn indexer(&self) -> Option<&dyn Indexer> {
        Some(self)
    }
}

impl TableLister for MemEnv {
    fn list_tables(&self, db: &str) -> Result<Vec<String>> {
        let mut out: Vec<String> = if db.is_empty() {
            self.tables
                .keys()
                .filter(|k| !k.contains('.'))
                .cloned()
                .collect()
        } else {
            let prefix = format!("{db}.");
            self.tables
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix))
                .filter(|rest| !rest.contains('.'))
                .map(str::to_string)
                .collect()
        };
        out.sort();
        Ok(out)
    }
}

impl Indexer for MemEnv {
    fn index(&self, path: &[String]) -> Result<Option<Box<dyn Index>>> {
        let name = path.join(".");
        Ok(self
            .tables
            .get(&name)
            .and_then(|def| def.index.clone())
            .map(|ix| Box::new(ix) as Box<dyn Index>))
    }
}

impl HandleDecoder for MemEnv {
    fn decode_handle(&self, st: &Symtab, d: &Datum) -> Result<Arc<dyn TableHandle>> {
        if let Some(items) = d.as_list() {
            let members = items
                .iter()
                .map(|item| self.decode_handle(st, item))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Arc::new(MultiHandle { members }));
        }
        let fields = d
            .as_struct()
            .ok_or_else(|| Error::Corrupt("handle must be a struct or list".into()))?;
        let mut name = String::new();
        let mut rows = Vec::new();
        let mut hits = None;
        let mut misses = None;
        for (sym, val) in fields {
            let fname = st
                .name(*sym)
                .ok_or_else(|| Error::Corrupt(format!("unresolved symbol {sym}")))?;
            match fname {
                "name" => {
                    name = val
                        .as_text(st)
                        .ok_or_else(|| Error::Corrupt("handle name must be a string".into()))?
                        .to_string();
                }
                "rows" => {
                    for item in val
                        .as_list()
                        .ok_or_else(|| Error::Corrupt("handle rows must be a list".into()))?
                    {
                        rows.push(Row::from_datum(item, st)?);
                    }
                }
                "hits" => hits = val.as_int(),
                "misses" => misses = val.as_int(),
                _ => return Err(Error::UnexpectedField(fname.to_string())),
            }
        }
        let mut h = MemHandle::new(&name, rows);
        if let (Some(hits), Some(misses)) = (hits, misses) {
            h = h.with_cache(hits as u64, misses as u64);
        }
        Ok(Arc::new(h))
    }
}
