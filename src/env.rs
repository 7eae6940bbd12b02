//! Environment contracts: table resolution, handles, and indexes.
//!
//! The host supplies an [`Env`] that resolves table references into
//! [`Input`]s. A resolved input carries an opaque [`TableHandle`] that
//! knows how to open itself, serialize itself, report its size, and
//! optionally split into subtables (for `UNION MAP`) or partitions (for
//! `UNION PARTITION`).
//!
//! `TABLE_GLOB` and `TABLE_PATTERN` references expand here: the
//! environment's [`TableLister`] enumerates candidate tables, matches are
//! `stat`ed individually (absent tables are skipped), and the survivors
//! are concatenated into one [`MultiHandle`] input. Globs with no
//! metacharacters skip the listing entirely and resolve as plain
//! references.

use crate::error::{Error, Result};
use crate::expr::{Builtin, Expr};
use crate::split::{Subtable, TablePart};
use crate::vm::Table;
use crate::wire::{Datum, Symtab};
use std::sync::Arc;
use tracing::debug;

/// Planning metadata handed to [`Env::stat`] for pruning.
#[derive(Clone, Copy, Default)]
pub struct Hints<'a> {
    /// Filter predicate that will be applied to the scanned rows.
    pub filter: Option<&'a Expr>,
    /// Columns the query references, when statically known.
    pub fields: Option<&'a [String]>,
}

impl<'a> Hints<'a> {
    pub fn none() -> Hints<'static> {
        Hints::default()
    }
}

/// Opaque per-table state. Implemented by the host environment; the core
/// only opens, sizes, serializes, and (where supported) splits handles.
pub trait TableHandle: Send + Sync {
    fn open(&self) -> Result<Box<dyn Table>>;

    /// Serialize this handle. The matching decode path goes through the
    /// environment's [`HandleDecoder`], since handles are opaque here.
    fn encode(&self, st: &mut Symtab) -> Result<Datum>;

    /// Upper bound on the bytes a scan of this handle may read.
    fn size(&self) -> i64;

    /// Split into subtables for fan-out. `None` means this handle does not
    /// split; the caller falls back to a single local subtable.
    fn split(&self) -> Result<Option<Vec<Subtable>>> {
        Ok(None)
    }

    /// Split by partition key values. `None` means this handle does not
    /// partition on `by`, which makes `UNION PARTITION` on it an error.
    fn split_by(&self, by: &[String]) -> Result<Option<Vec<TablePart>>> {
        let _ = by;
        Ok(None)
    }
}

/// Decodes environment-specific handles out of a plan.
pub trait HandleDecoder {
    fn decode_handle(&self, st: &Symtab, d: &Datum) -> Result<Arc<dyn TableHandle>>;
}

/// A resolved table reference shared by index across plan nodes.
#[derive(Clone)]
pub struct Input {
    /// The original table expression (useful for display and re-planning).
    pub table: Expr,
    pub handle: Arc<dyn TableHandle>,
    size: i64,
}

impl Input {
    pub fn new(table: Expr, handle: Arc<dyn TableHandle>) -> Self {
        let size = handle.size();
        Self {
            table,
            handle,
            size,
        }
    }

    /// Upper bound on bytes scanned from this input.
    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn encode(&self, st: &mut Symtab) -> Result<Datum> {
        Ok(Datum::Struct(vec![
            (st.intern("table"), self.table.to_datum(st)?),
            (st.intern("handle"), self.handle.encode(st)?),
            (st.intern("size"), Datum::Int(self.size)),
        ]))
    }

    pub fn decode(st: &Symtab, d: &Datum, dec: &dyn HandleDecoder) -> Result<Input> {
        let fields = d
            .as_struct()
            .ok_or_else(|| Error::Corrupt("input must be a struct".into()))?;
        let mut table = None;
        let mut handle = None;
        let mut size = None;
        for (sym, val) in fields {
            let name = st
                .name(*sym)
                .ok_or_else(|| Error::Corrupt(format!("unresolved symbol {sym}")))?;
            match name {
                "table" => table = Some(Expr::from_datum(val, st)?),
                "handle" => handle = Some(dec.decode_handle(st, val)?),
                "size" => size = val.as_int(),
                _ => return Err(Error::UnexpectedField(name.to_string())),
            }
        }
        let table = table.ok_or_else(|| Error::Corrupt("input without table".into()))?;
        let handle = handle.ok_or_else(|| Error::Corrupt("input without handle".into()))?;
        let size = size.unwrap_or_else(|| handle.size());
        Ok(Input {
            table,
            handle,
            size,
        })
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Input")
            .field("table", &format_args!("{}", self.table))
            .field("size", &self.size)
            .finish()
    }
}

/// Lists tables within a database; optional [`Env`] capability.
pub trait TableLister {
    fn list_tables(&self, db: &str) -> Result<Vec<String>>;
}

/// Produces data-skipping indexes; optional [`Env`] capability.
pub trait Indexer {
    fn index(&self, path: &[String]) -> Result<Option<Box<dyn Index>>>;
}

/// Data-skipping metadata for one table.
pub trait Index: Send + Sync {
    /// Min/max of the values at `path`, if tracked.
    fn time_range(&self, path: &[String]) -> Option<(i64, i64)>;

    /// True if the table is partitioned on `name`.
    fn has_partition(&self, name: &str) -> bool;
}

/// The union of several indexes: time ranges widen, partition support
/// requires every member. An empty multi-index knows nothing.
pub struct MultiIndex(pub Vec<Box<dyn Index>>);

impl Index for MultiIndex {
    fn time_range(&self, path: &[String]) -> Option<(i64, i64)> {
        let mut acc: Option<(i64, i64)> = None;
        for ix in &self.0 {
            let (lo, hi) = ix.time_range(path)?;
            acc = Some(match acc {
                None => (lo, hi),
                Some((alo, ahi)) => (alo.min(lo), ahi.max(hi)),
            });
        }
        acc
    }

    fn has_partition(&self, name: &str) -> bool {
        !self.0.is_empty() && self.0.iter().all(|ix| ix.has_partition(name))
    }
}

/// Resolves table references. The two capability accessors let hosts
/// opt in to listing and indexing without a second registration surface.
pub trait Env {
    /// Resolve a table expression into an input, or
    /// [`Error::NotFound`] when the table is absent.
    fn stat(&self, table: &Expr, hints: &Hints) -> Result<Input>;

    fn lister(&self) -> Option<&dyn TableLister> {
        None
    }

    fn indexer(&self) -> Option<&dyn Indexer> {
        None
    }
}

/// Concatenation of several handles, produced by glob expansion. Splitting
/// recurses into the members, so `UNION MAP` over a glob fans out across
/// every matched table's own subtables.
pub struct MultiHandle {
    pub members: Vec<Arc<dyn TableHandle>>,
}

impl TableHandle for MultiHandle {
    fn open(&self) -> Result<Box<dyn Table>> {
        Ok(Box::new(MultiTable {
            members: self.members.iter().map(|m| m.open()).collect::<Result<_>>()?,
        }))
    }

    fn encode(&self, st: &mut Symtab) -> Result<Datum> {
        Ok(Datum::List(
            self.members
                .iter()
                .map(|m| m.encode(st))
                .collect::<Result<_>>()?,
        ))
    }

    fn size(&self) -> i64 {
        self.members.iter().map(|m| m.size()).sum()
    }

    fn split(&self) -> Result<Option<Vec<Subtable>>> {
        let mut out = Vec::new();
        for m in &self.members {
            match m.split()? {
                Some(subs) => out.extend(subs),
                None => out.push(Subtable::local(Arc::clone(m))),
            }
        }
        Ok(Some(out))
    }
}

struct MultiTable {
    members: Vec<Box<dyn Table>>,
}

impl Table for MultiTable {
    fn write_rows(&self, dst: &mut dyn crate::vm::RowWriter) -> Result<()> {
        for m in &self.members {
            m.write_rows(dst)?;
        }
        Ok(())
    }
}

/// Resolve a table expression, expanding `TABLE_GLOB` / `TABLE_PATTERN`
/// references through the environment's lister.
pub fn resolve(env: &dyn Env, table: &Expr, hints: &Hints) -> Result<Input> {
    match table {
        Expr::Call(Builtin::TableGlob, args) => expand(env, table, args, hints, false),
        Expr::Call(Builtin::TablePattern, args) => expand(env, table, args, hints, true),
        _ => env.stat(table, hints),
    }
}

/// The data-skipping index for a table expression. Globs produce the union
/// of every matched member's index.
pub fn index_for(env: &dyn Env, table: &Expr) -> Result<Option<Box<dyn Index>>> {
    let Some(ixr) = env.indexer() else {
        return Ok(None);
    };
    match table {
        Expr::Path(parts) => ixr.index(parts),
        Expr::Call(Builtin::TableGlob, args) | Expr::Call(Builtin::TablePattern, args) => {
            let regex = matches!(table, Expr::Call(Builtin::TablePattern, _));
            let (db, pat) = glob_parts(args)?;
            let Some(lister) = env.lister() else {
                return Ok(None);
            };
            let matcher = Matcher::new(&pat, regex)?;
            let mut members = Vec::new();
            for name in lister.list_tables(&db)? {
                if !matcher.matches(&name) {
                    continue;
                }
                let path = vec![db.clone(), name];
                if let Some(ix) = ixr.index(&path)? {
                    members.push(ix);
                } else {
                    // one unindexed member makes the union unusable
                    return Ok(None);
                }
            }
            if members.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Box::new(MultiIndex(members))))
            }
        }
        _ => Ok(None),
    }
}

/// The longest prefix of `s` before any glob metacharacter. When the whole
/// string comes back, the glob is literal and needs no expansion.
pub fn meta_prefix(s: &str) -> &str {
    match s.find(['*', '?', '[']) {
        Some(i) => &s[..i],
        None => s,
    }
}

fn regex_literal(s: &str) -> Option<&str> {
    let s = s.strip_prefix('^').unwrap_or(s);
    let s = s.strip_suffix('$').unwrap_or(s);
    if s.contains([
        '.', '*', '+', '?', '(', ')', '[', ']', '{', '}', '|', '\\', '^', '$',
    ]) {
        None
    } else {
        Some(s)
    }
}

enum Matcher {
    Glob(glob::Pattern),
    Regex(regex::Regex),
}

impl Matcher {
    fn new(pat: &str, regex: bool) -> Result<Matcher> {
        if regex {
            let anchored = anchor(pat);
            Ok(Matcher::Regex(regex::Regex::new(&anchored).map_err(
                |e| Error::Corrupt(format!("bad table pattern {pat:?}: {e}")),
            )?))
        } else {
            Ok(Matcher::Glob(glob::Pattern::new(pat).map_err(|e| {
                Error::Corrupt(format!("bad table glob {pat:?}: {e}"))
            })?))
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Matcher::Glob(p) => p.matches(name),
            Matcher::Regex(r) => r.is_match(name),
        }
    }
}

fn anchor(pat: &str) -> String {
    let mut out = String::with_capacity(pat.len() + 2);
    if !pat.starts_with('^') {
        out.push('^');
    }
    out.push_str(pat);
    if !pat.ends_with('$') {
        out.push('$');
    }
    out
}

fn glob_parts(args: &[Expr]) -> Result<(String, String)> {
    let [Expr::Path(parts)] = args else {
        return Err(Error::Corrupt("table glob takes one path argument".into()));
    };
    match parts.as_slice() {
        [tbl] => Ok((String::new(), tbl.clone())),
        [db, tbl] => Ok((db.clone(), tbl.clone())),
        _ => Err(Error::Corrupt(
            "table glob path must have one or two parts".into(),
        )),
    }
}

fn expand(
    env: &dyn Env,
    orig: &Expr,
    args: &[Expr],
    hints: &Hints,
    regex: bool,
) -> Result<Input> {
    let (db, pat) = glob_parts(args)?;

    // literal patterns skip the listing entirely
    let literal = if regex {
        regex_literal(&pat).map(str::to_string)
    } else if meta_prefix(&pat) == pat {
        Some(pat.clone())
    } else {
        None
    };
    if let Some(name) = literal {
        let mut parts = Vec::new();
        if !db.is_empty() {
            parts.push(db);
        }
        parts.push(name);
        return env.stat(&Expr::Path(parts), hints);
    }

    let lister = env
        .lister()
        .ok_or_else(|| Error::Unsupported("environment cannot list tables".into()))?;
    let matcher = Matcher::new(&pat, regex)?;
    let mut inputs = Vec::new();
    for name in lister.list_tables(&db)? {
        if !matcher.matches(&name) {
            continue;
        }
        let mut parts = Vec::new();
        if !db.is_empty() {
            parts.push(db.clone());
        }
        parts.push(name);
        match env.stat(&Expr::Path(parts), hints) {
            Ok(inp) => inputs.push(inp),
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        }
    }
    debug!(pattern = %pat, matched = inputs.len(), "expanded table glob");
    if inputs.is_empty() {
        return Err(Error::NotFound(pat));
    }
    if inputs.len() == 1 {
        return Ok(inputs.into_iter().next().unwrap());
    }
    let members = inputs.into_iter().map(|i| i.handle).collect();
    Ok(Input::new(
        orig.clone(),
        Arc::new(MultiHandle { members }),
    ))
}
