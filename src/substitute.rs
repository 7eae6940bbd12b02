//! Subquery substitution.
//!
//! A `SUBSTITUTE` operator executes its inner subqueries before its own
//! chain. Each inner node's rows collect into a [`Replacement`], capped at
//! [`ExecParams::large_size`]; the collected rows then lower into
//! expression constants through a [`Rewriter`] installed for the scope of
//! the outer chain:
//!
//! | builtin | lowering |
//! |---|---|
//! | `SCALAR_REPLACEMENT(i)` | first field of the first row, `NULL` if empty |
//! | `LIST_REPLACEMENT(i)` | list of every row as a struct |
//! | `STRUCT_REPLACEMENT(i)` | first row as a struct, `{}` if empty |
//! | `IN_REPLACEMENT(e, i)` | `e IN (first field of each row)` |
//! | `HASH_REPLACEMENT(i, kind, label, e)` | `HASH_LOOKUP(e, k0, v0, ...)` |
//!
//! For hash replacements the field named `label` is the key and the
//! remaining fields form the value: `scalar` kind requires exactly two
//! fields per row, `struct` kind keeps the non-key fields as a struct, and
//! `list` kind accumulates equal-key values into a list.
//!
//! Inner executions run concurrently; the underlying scans may write a
//! replacement from several threads, so the row set sits behind its own
//! lock. A row that cannot lower to a constant, or a replacement that
//! outgrows the cap, fails the whole execution.

use crate::error::{Error, Result};
use crate::exec::ExecParams;
use crate::expr::{Builtin, Expr, Rewriter, Value};
use crate::op::Op;
use crate::tree::{ExecCtx, Node};
use crate::vm::{QuerySink, Row, RowWriter};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Rows collected from one inner subquery.
pub(crate) struct Replacement {
    rows: Mutex<Vec<Row>>,
    cap: usize,
}

impl Replacement {
    fn new(cap: usize) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            cap,
        }
    }

    fn take_rows(&self) -> Vec<Row> {
        std::mem::take(&mut *self.rows.lock().unwrap())
    }
}

struct ReplacementSink {
    rep: Arc<Replacement>,
}

impl QuerySink for ReplacementSink {
    fn open(&self) -> Result<Box<dyn RowWriter>> {
        Ok(Box::new(ReplacementWriter {
            rep: Arc::clone(&self.rep),
        }))
    }
}

struct ReplacementWriter {
    rep: Arc<Replacement>,
}

impl RowWriter for ReplacementWriter {
    fn write(&mut self, row: Row) -> Result<()> {
        let mut rows = self.rep.rows.lock().unwrap();
        if rows.len() >= self.rep.cap {
            return Err(Error::ReplacementTooLarge(self.rep.cap));
        }
        rows.push(row);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn exec_substitute(
    inner: &[Node],
    from: &Op,
    dst: Arc<dyn QuerySink>,
    input: Option<usize>,
    ctx: &ExecCtx<'_>,
    ep: &mut ExecParams,
) -> Result<()> {
    let reps: Vec<Arc<Replacement>> = inner
        .iter()
        .map(|_| Arc::new(Replacement::new(ep.large_size)))
        .collect();
    let mut seps: Vec<ExecParams> = inner.iter().map(|_| ep.fork()).collect();

    let results: Vec<Result<()>> = inner
        .par_iter()
        .zip(reps.par_iter())
        .zip(seps.par_iter_mut())
        .map(|((node, rep), sep)| {
            let sink = ReplacementSink {
                rep: Arc::clone(rep),
            };
            node.exec(Arc::new(sink), ctx, sep)
        })
        .collect();
    for sep in &seps {
        ep.join(sep);
    }
    if let Some(err) = results.into_iter().find_map(|r| r.err()) {
        return Err(err);
    }

    let rows: Vec<Vec<Row>> = reps.iter().map(|r| r.take_rows()).collect();
    debug!(
        replacements = rows.len(),
        rows = rows.iter().map(Vec::len).sum::<usize>(),
        "collected subquery replacements"
    );

    ep.push_rewriter(Arc::new(Replacer { rows }));
    let res = from.exec(dst, input, ctx, ep);
    ep.pop_rewriter();
    res
}

/// Lowers replacement placeholders to constants over the collected rows.
struct Replacer {
    rows: Vec<Vec<Row>>,
}

impl Replacer {
    fn rows_for(&self, args: &[Expr], at: usize) -> Result<&[Row]> {
        let id = args
            .get(at)
            .and_then(|e| match e {
                Expr::Const(Value::Int(i)) if *i >= 0 => Some(*i as usize),
                _ => None,
            })
            .ok_or_else(|| Error::Corrupt("replacement id must be a constant index".into()))?;
        self.rows
            .get(id)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::Corrupt(format!("replacement {id} out of range")))
    }
}

fn first_field(row: &Row) -> Value {
    row.fields
        .first()
        .map(|(_, v)| v.clone())
        .unwrap_or(Value::Null)
}

fn constant(v: Value) -> Result<Expr> {
    Ok(Expr::Const(v.into_constant()?))
}

impl Rewriter for Replacer {
    fn rewrite(&self, e: Expr) -> Result<Expr> {
        let Expr::Call(func, args) = &e else {
            return Ok(e);
        };
        match func {
            Builtin::ScalarReplacement => {
                let rows = self.rows_for(args, 0)?;
                match rows.first() {
                    Some(row) => constant(first_field(row)),
                    None => Ok(Expr::Const(Value::Null)),
                }
            }
            Builtin::ListReplacement => {
                let rows = self.rows_for(args, 0)?;
                let items = rows.iter().map(|r| r.to_struct()).collect();
                constant(Value::List(items))
            }
            Builtin::StructReplacement => {
                let rows = self.rows_for(args, 0)?;
                match rows.first() {
                    Some(row) => constant(row.to_struct()),
                    None => Ok(Expr::Const(Value::Struct(vec![]))),
                }
            }
            Builtin::InReplacement => {
                let [value, _] = args.as_slice() else {
                    return Err(Error::Corrupt(
                        "IN_REPLACEMENT takes a value and an id".into(),
                    ));
                };
                let rows = self.rows_for(args, 1)?;
                let set = rows
                    .iter()
                    .map(|r| constant(first_field(r)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::Member(Box::new(value.clone()), set))
            }
            Builtin::HashReplacement => {
                let [_, kind, label, value] = args.as_slice() else {
                    return Err(Error::Corrupt(
                        "HASH_REPLACEMENT takes an id, a kind, a label, and a value".into(),
                    ));
                };
                let rows = self.rows_for(args, 0)?;
                let kind = match kind {
                    Expr::Const(Value::Str(s)) => s.as_str(),
                    _ => {
                        return Err(Error::Corrupt(
                            "hash replacement kind must be a string".into(),
                        ));
                    }
                };
                let label = match label {
                    Expr::Const(Value::Str(s)) => s.as_str(),
                    _ => {
                        return Err(Error::Corrupt(
                            "hash replacement label must be a string".into(),
                        ));
                    }
                };
                let pairs = hash_pairs(rows, kind, label)?;
                let mut out = Vec::with_capacity(1 + pairs.len() * 2);
                out.push(value.clone());
                for (k, v) in pairs {
                    out.push(constant(k)?);
                    out.push(constant(v)?);
                }
                Ok(Expr::Call(Builtin::HashLookup, out))
            }
            _ => Ok(e),
        }
    }
}

/// Build the key/value pairs for one hash replacement. The field named
/// `label` is the key; the rest of the row is the value.
fn hash_pairs(rows: &[Row], kind: &str, label: &str) -> Result<Vec<(Value, Value)>> {
    let split = |row: &Row| -> Result<(Value, Vec<(String, Value)>)> {
        let key = row
            .field(label)
            .cloned()
            .ok_or_else(|| Error::Corrupt(format!("hash replacement row lacks key {label:?}")))?;
        let rest = row
            .fields
            .iter()
            .filter(|(n, _)| n != label)
            .cloned()
            .collect();
        Ok((key, rest))
    };
    match kind {
        "scalar" => rows
            .iter()
            .map(|row| {
                if row.fields.len() != 2 {
                    return Err(Error::Corrupt(
                        "scalar hash replacement row must have exactly two fields".into(),
                    ));
                }
                let (key, rest) = split(row)?;
                let (_, value) = rest.into_iter().next().ok_or_else(|| {
                    Error::Corrupt("scalar hash replacement row lacks a value".into())
                })?;
                Ok((key, value))
            })
            .collect(),
        "struct" => rows
            .iter()
            .map(|row| {
                let (key, rest) = split(row)?;
                Ok((key, Value::Struct(rest)))
            })
            .collect(),
        "list" => {
            let mut order: Vec<Value> = Vec::new();
            let mut groups: HashMap<Value, Vec<Value>> = HashMap::new();
            for row in rows {
                let (key, rest) = split(row)?;
                let entry = groups.entry(key.clone()).or_default();
                if entry.is_empty() {
                    order.push(key);
                }
                entry.push(Value::Struct(rest));
            }
            Ok(order
                .into_iter()
                .map(|k| {
                    let items = groups.remove(&k).unwrap_or_default();
                    (k, Value::List(items))
                })
                .collect())
        }
        other => Err(Error::Corrupt(format!(
            "unknown hash replacement kind {other:?}"
        ))),
    }
}
