//! Row-level execution seam.
//!
//! The plan core does not scan storage itself: a [`Table`] (obtained from a
//! `TableHandle`) pumps [`Row`]s into a [`RowWriter`] opened from a
//! [`QuerySink`]. Operators compose by wrapping the sink: a filter opens
//! the downstream writer and interposes predicate evaluation, an order-by
//! buffers rows until close, and so on. Fan-out operators open multiple
//! writers from one sink, which is why sinks are `Sync` and writers are
//! per-thread.
//!
//! Blocking operators (aggregate, order-by, distinct with no inputs left)
//! emit their output when the writer is closed; `close` must therefore be
//! called on every path, including error paths.

use crate::error::{Error, Result};
use crate::expr::{self, AggOp, Aggregation, Binding, Builtin, Expr, OrderKey, Value};
use crate::wire::{Datum, Symtab};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// One output row: ordered named fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    pub fields: Vec<(String, Value)>,
}

impl Row {
    pub fn new(fields: Vec<(String, Value)>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// The whole row as a struct value, preserving field order.
    pub fn to_struct(&self) -> Value {
        Value::Struct(self.fields.clone())
    }

    pub fn to_datum(&self, st: &mut Symtab) -> Datum {
        self.to_struct().to_datum(st)
    }

    pub fn from_datum(d: &Datum, st: &Symtab) -> Result<Row> {
        match Value::from_datum(d, st)? {
            Value::Struct(fields) => Ok(Row { fields }),
            other => Err(Error::Corrupt(format!("row must be a struct, got {other}"))),
        }
    }
}

/// Cache effectiveness counters a table may expose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// An opened table: a source of rows.
pub trait Table: Send + Sync {
    /// Pump every row into `dst`. The implementation may write from
    /// multiple threads by opening additional writers elsewhere; this
    /// entry point writes through the one writer it is handed.
    fn write_rows(&self, dst: &mut dyn RowWriter) -> Result<()>;

    /// Cache counters, if this table tracks them.
    fn cached(&self) -> Option<CacheStats> {
        None
    }
}

/// Receives rows on one thread. Dropping a writer without `close` loses
/// buffered output.
pub trait RowWriter: Send {
    fn write(&mut self, row: Row) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// A destination that can open per-thread writers.
pub trait QuerySink: Send + Sync {
    fn open(&self) -> Result<Box<dyn RowWriter>>;
}

/// Adapter: build a sink from a writer-producing closure.
pub(crate) struct SinkFn<F>(pub F);

impl<F> QuerySink for SinkFn<F>
where
    F: Fn() -> Result<Box<dyn RowWriter>> + Send + Sync,
{
    fn open(&self) -> Result<Box<dyn RowWriter>> {
        (self.0)()
    }
}

/// A sink that collects rows in memory. Cloning shares the buffer.
#[derive(Clone, Default)]
pub struct Buffer {
    rows: Arc<Mutex<Vec<Row>>>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<Row> {
        self.rows.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<Row> {
        std::mem::take(&mut *self.rows.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().unwrap().is_empty()
    }
}

impl QuerySink for Buffer {
    fn open(&self) -> Result<Box<dyn RowWriter>> {
        Ok(Box::new(BufferWriter {
            rows: Arc::clone(&self.rows),
        }))
    }
}

struct BufferWriter {
    rows: Arc<Mutex<Vec<Row>>>,
}

impl RowWriter for BufferWriter {
    fn write(&mut self, row: Row) -> Result<()> {
        self.rows.lock().unwrap().push(row);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory table over a fixed row set.
pub struct MemTable {
    rows: Vec<Row>,
    cache: Option<CacheStats>,
}

impl MemTable {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows, cache: None }
    }

    pub fn with_cache(rows: Vec<Row>, cache: CacheStats) -> Self {
        Self {
            rows,
            cache: Some(cache),
        }
    }
}

impl Table for MemTable {
    fn write_rows(&self, dst: &mut dyn RowWriter) -> Result<()> {
        for row in &self.rows {
            dst.write(row.clone())?;
        }
        Ok(())
    }

    fn cached(&self) -> Option<CacheStats> {
        self.cache
    }
}

/// Evaluate `e` against `row`.
///
/// Missing fields and type mismatches evaluate to `NULL` rather than
/// erroring; only structural problems (an unresolved replacement builtin
/// left in the tree) are errors.
pub fn eval(e: &Expr, row: &Row) -> Result<Value> {
    Ok(match e {
        Expr::Const(v) => v.clone(),
        Expr::Path(parts) => {
            let mut cur: Option<&Value> = None;
            for (i, part) in parts.iter().enumerate() {
                cur = if i == 0 {
                    row.field(part)
                } else {
                    match cur {
                        Some(Value::Struct(fields)) => {
                            fields.iter().find(|(n, _)| n == part).map(|(_, v)| v)
                        }
                        _ => None,
                    }
                };
                if cur.is_none() {
                    return Ok(Value::Null);
                }
            }
            cur.cloned().unwrap_or(Value::Null)
        }
        Expr::Unary(op, a) => {
            let v = eval(a, row)?;
            match (op, v) {
                (expr::UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
                (expr::UnaryOp::Neg, Value::Int(i)) => {
                    i.checked_neg().map(Value::Int).unwrap_or(Value::Null)
                }
                (expr::UnaryOp::Neg, Value::Float(f)) => Value::Float(-f),
                _ => Value::Null,
            }
        }
        Expr::Binary(op, l, r) => {
            use crate::expr::BinaryOp::*;
            match op {
                And | Or => {
                    let lv = eval(l, row)?;
                    let rv = eval(r, row)?;
                    eval_logic(*op, lv, rv)
                }
                Add | Sub | Mul | Div => {
                    let lv = eval(l, row)?;
                    let rv = eval(r, row)?;
                    expr::arith(*op, &lv, &rv).unwrap_or(Value::Null)
                }
                _ => {
                    let lv = eval(l, row)?;
                    let rv = eval(r, row)?;
                    if matches!(lv, Value::Null) || matches!(rv, Value::Null) {
                        Value::Null
                    } else {
                        let c = lv.compare(&rv);
                        let b = match op {
                            Eq => c == Ordering::Equal,
                            Ne => c != Ordering::Equal,
                            Lt => c == Ordering::Less,
                            Le => c != Ordering::Greater,
                            Gt => c == Ordering::Greater,
                            Ge => c != Ordering::Less,
                            _ => unreachable!(),
                        };
                        Value::Bool(b)
                    }
                }
            }
        }
        Expr::Member(v, set) => {
            let val = eval(v, row)?;
            if matches!(val, Value::Null) {
                return Ok(Value::Null);
            }
            for item in set {
                let sv = eval(item, row)?;
                if val.compare(&sv) == Ordering::Equal {
                    return Ok(Value::Bool(true));
                }
            }
            Value::Bool(false)
        }
        Expr::Call(Builtin::HashLookup, args) => {
            let (key_expr, pairs) = args
                .split_first()
                .ok_or_else(|| Error::Corrupt("HASH_LOOKUP without arguments".into()))?;
            let key = eval(key_expr, row)?;
            for kv in pairs.chunks_exact(2) {
                let k = eval(&kv[0], row)?;
                if key.compare(&k) == Ordering::Equal {
                    return eval(&kv[1], row);
                }
            }
            Value::Null
        }
        Expr::Call(func, _) => {
            return Err(Error::Corrupt(format!(
                "unresolved builtin {} at evaluation time",
                func.name()
            )));
        }
        Expr::Subquery(_) | Expr::InSubquery(_, _) => {
            return Err(Error::Corrupt("unlowered subquery at evaluation time".into()));
        }
    })
}

fn eval_logic(op: expr::BinaryOp, l: Value, r: Value) -> Value {
    let lb = match l {
        Value::Bool(b) => Some(b),
        _ => None,
    };
    let rb = match r {
        Value::Bool(b) => Some(b),
        _ => None,
    };
    match op {
        expr::BinaryOp::And => match (lb, rb) {
            (Some(false), _) | (_, Some(false)) => Value::Bool(false),
            (Some(true), Some(true)) => Value::Bool(true),
            _ => Value::Null,
        },
        expr::BinaryOp::Or => match (lb, rb) {
            (Some(true), _) | (_, Some(true)) => Value::Bool(true),
            (Some(false), Some(false)) => Value::Bool(false),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

/* ---------- operator writers ---------- */

pub(crate) struct FilterWriter {
    pred: Expr,
    out: Box<dyn RowWriter>,
}

impl FilterWriter {
    pub fn new(pred: Expr, out: Box<dyn RowWriter>) -> Self {
        Self { pred, out }
    }
}

impl RowWriter for FilterWriter {
    fn write(&mut self, row: Row) -> Result<()> {
        if eval(&self.pred, &row)? == Value::Bool(true) {
            self.out.write(row)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.out.close()
    }
}

pub(crate) struct ProjectWriter {
    columns: Vec<Binding>,
    out: Box<dyn RowWriter>,
}

impl ProjectWriter {
    pub fn new(columns: Vec<Binding>, out: Box<dyn RowWriter>) -> Self {
        Self { columns, out }
    }
}

impl RowWriter for ProjectWriter {
    fn write(&mut self, row: Row) -> Result<()> {
        let mut fields = Vec::with_capacity(self.columns.len());
        for b in &self.columns {
            fields.push((b.name.clone(), eval(&b.expr, &row)?));
        }
        self.out.write(Row::new(fields))
    }

    fn close(&mut self) -> Result<()> {
        self.out.close()
    }
}

enum Acc {
    Count(u64),
    Sum(Option<Value>),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { sum: f64, n: u64 },
}

impl Acc {
    fn new(op: AggOp) -> Self {
        match op {
            AggOp::Count => Acc::Count(0),
            AggOp::Sum => Acc::Sum(None),
            AggOp::Min => Acc::Min(None),
            AggOp::Max => Acc::Max(None),
            AggOp::Avg => Acc::Avg { sum: 0.0, n: 0 },
        }
    }

    fn update(&mut self, v: Option<Value>) {
        match self {
            Acc::Count(n) => {
                // with an argument, count non-null; bare COUNT counts rows
                match v {
                    Some(Value::Null) => {}
                    _ => *n += 1,
                }
            }
            Acc::Sum(acc) => {
                if let Some(v) = v
                    && !matches!(v, Value::Null)
                {
                    *acc = Some(match acc.take() {
                        None => v,
                        Some(prev) => {
                            expr::arith(expr::BinaryOp::Add, &prev, &v).unwrap_or(Value::Null)
                        }
                    });
                }
            }
            Acc::Min(acc) => {
                if let Some(v) = v
                    && !matches!(v, Value::Null)
                {
                    let better = match acc {
                        None => true,
                        Some(prev) => v.compare(prev) == Ordering::Less,
                    };
                    if better {
                        *acc = Some(v);
                    }
                }
            }
            Acc::Max(acc) => {
                if let Some(v) = v
                    && !matches!(v, Value::Null)
                {
                    let better = match acc {
                        None => true,
                        Some(prev) => v.compare(prev) == Ordering::Greater,
                    };
                    if better {
                        *acc = Some(v);
                    }
                }
            }
            Acc::Avg { sum, n } => {
                if let Some(v) = v
                    && let Some(x) = expr::as_f64(&v)
                {
                    *sum += x;
                    *n += 1;
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Acc::Count(n) => Value::Int(n as i64),
            Acc::Sum(v) | Acc::Min(v) | Acc::Max(v) => v.unwrap_or(Value::Null),
            Acc::Avg { sum, n } => {
                if n == 0 {
                    Value::Null
                } else {
                    Value::Float(sum / n as f64)
                }
            }
        }
    }
}

pub(crate) struct AggregateWriter {
    aggs: Vec<Aggregation>,
    group_by: Vec<Binding>,
    groups: HashMap<Vec<Value>, usize>,
    states: Vec<(Vec<Value>, Vec<Acc>)>,
    out: Option<Box<dyn RowWriter>>,
}

impl AggregateWriter {
    pub fn new(aggs: Vec<Aggregation>, group_by: Vec<Binding>, out: Box<dyn RowWriter>) -> Self {
        Self {
            aggs,
            group_by,
            groups: HashMap::new(),
            states: Vec::new(),
            out: Some(out),
        }
    }
}

impl RowWriter for AggregateWriter {
    fn write(&mut self, row: Row) -> Result<()> {
        let mut key = Vec::with_capacity(self.group_by.len());
        for b in &self.group_by {
            key.push(eval(&b.expr, &row)?);
        }
        let idx = match self.groups.get(&key) {
            Some(&i) => i,
            None => {
                let i = self.states.len();
                self.states.push((
                    key.clone(),
                    self.aggs.iter().map(|a| Acc::new(a.op)).collect(),
                ));
                self.groups.insert(key, i);
                i
            }
        };
        for (agg, acc) in self.aggs.iter().zip(self.states[idx].1.iter_mut()) {
            let v = match &agg.expr {
                Some(e) => Some(eval(e, &row)?),
                None => None,
            };
            acc.update(v);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        // a global aggregate with no input still emits one row
        if self.group_by.is_empty() && self.states.is_empty() {
            self.states
                .push((vec![], self.aggs.iter().map(|a| Acc::new(a.op)).collect()));
        }
        let mut res = Ok(());
        for (key, accs) in std::mem::take(&mut self.states) {
            let mut fields = Vec::with_capacity(self.group_by.len() + self.aggs.len());
            for (b, v) in self.group_by.iter().zip(key) {
                fields.push((b.name.clone(), v));
            }
            for (agg, acc) in self.aggs.iter().zip(accs) {
                fields.push((agg.name.clone(), acc.finish()));
            }
            if let Err(e) = out.write(Row::new(fields)) {
                res = Err(e);
                break;
            }
        }
        let cres = out.close();
        res.and(cres)
    }
}

pub(crate) struct OrderByWriter {
    keys: Vec<OrderKey>,
    rows: Vec<(Vec<Value>, Row)>,
    out: Option<Box<dyn RowWriter>>,
}

impl OrderByWriter {
    pub fn new(keys: Vec<OrderKey>, out: Box<dyn RowWriter>) -> Self {
        Self {
            keys,
            rows: Vec::new(),
            out: Some(out),
        }
    }
}

impl RowWriter for OrderByWriter {
    fn write(&mut self, row: Row) -> Result<()> {
        let mut key = Vec::with_capacity(self.keys.len());
        for k in &self.keys {
            key.push(eval(&k.expr, &row)?);
        }
        self.rows.push((key, row));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        let keys = std::mem::take(&mut self.keys);
        let mut rows = std::mem::take(&mut self.rows);
        rows.sort_by(|(a, _), (b, _)| {
            for (i, k) in keys.iter().enumerate() {
                let c = a[i].compare(&b[i]);
                let c = if k.desc { c.reverse() } else { c };
                if c != Ordering::Equal {
                    return c;
                }
            }
            Ordering::Equal
        });
        let mut res = Ok(());
        for (_, row) in rows {
            if let Err(e) = out.write(row) {
                res = Err(e);
                break;
            }
        }
        let cres = out.close();
        res.and(cres)
    }
}

pub(crate) struct LimitWriter {
    left: u64,
    out: Box<dyn RowWriter>,
}

impl LimitWriter {
    pub fn new(count: u64, out: Box<dyn RowWriter>) -> Self {
        Self { left: count, out }
    }
}

impl RowWriter for LimitWriter {
    fn write(&mut self, row: Row) -> Result<()> {
        if self.left == 0 {
            return Ok(());
        }
        self.left -= 1;
        self.out.write(row)
    }

    fn close(&mut self) -> Result<()> {
        self.out.close()
    }
}

pub(crate) struct DistinctWriter {
    columns: Vec<Expr>,
    seen: HashSet<Vec<Value>>,
    out: Box<dyn RowWriter>,
}

impl DistinctWriter {
    pub fn new(columns: Vec<Expr>, out: Box<dyn RowWriter>) -> Self {
        Self {
            columns,
            seen: HashSet::new(),
            out,
        }
    }
}

impl RowWriter for DistinctWriter {
    fn write(&mut self, row: Row) -> Result<()> {
        let key = if self.columns.is_empty() {
            vec![row.to_struct()]
        } else {
            let mut k = Vec::with_capacity(self.columns.len());
            for c in &self.columns {
                k.push(eval(c, &row)?);
            }
            k
        };
        if self.seen.insert(key) {
            self.out.write(row)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.out.close()
    }
}
