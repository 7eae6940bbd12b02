//! Plan operators.
//!
//! A [`Node`](crate::tree::Node) holds the head of an operator chain: the
//! *last* step in execution order. Every non-terminal operator boxes its
//! predecessor in `from`, so walking [`Op::input`] descends toward the
//! terminal (a [`Op::Leaf`] scan or [`Op::NoOutput`]), which executes
//! first. The planner emits chains bottom-up, which makes this reverse
//! encoding the cheap one to build.
//!
//! Operators serialize as self-describing structs beginning with
//! `type: <tag>`; non-terminals carry their predecessor under `from`.
//! Unknown tags and unknown fields are decode errors.
//!
//! Execution composes sinks top-down: each non-terminal wraps the
//! destination sink with its own row transform and delegates to its
//! predecessor, so rows flow leaf-to-head while the wrapping recursion
//! runs head-to-leaf. The fan-out operators (`SUBSTITUTE`, `UNION MAP`,
//! `UNION PARTITION`) break this pattern and are implemented in their own
//! modules.

use crate::error::{Error, Result};
use crate::exec::ExecParams;
use crate::expr::{AggOp, Aggregation, Binding, Expr, OrderKey};
use crate::split;
use crate::substitute;
use crate::tree::{ExecCtx, Node};
use crate::vm::{
    AggregateWriter, DistinctWriter, FilterWriter, LimitWriter, OrderByWriter, ProjectWriter,
    QuerySink, RowWriter, SinkFn,
};
use crate::wire::{Datum, Symtab};
use std::fmt;
use std::sync::Arc;

/// One operator in a chain, linked in reverse execution order.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Terminal: scan the node's input table.
    Leaf,
    /// Terminal: emit an empty stream.
    NoOutput,
    Filter {
        predicate: Expr,
        from: Box<Op>,
    },
    Project {
        columns: Vec<Binding>,
        from: Box<Op>,
    },
    Aggregate {
        aggs: Vec<Aggregation>,
        group_by: Vec<Binding>,
        from: Box<Op>,
    },
    OrderBy {
        keys: Vec<OrderKey>,
        from: Box<Op>,
    },
    Limit {
        count: u64,
        from: Box<Op>,
    },
    Distinct {
        /// Distinct key expressions; empty means the whole row.
        columns: Vec<Expr>,
        from: Box<Op>,
    },
    /// Run `inner` subqueries first, then execute `from` with their
    /// results interpolated as constants.
    Substitute {
        inner: Vec<Node>,
        from: Box<Op>,
    },
    /// Split the node's input handle and run `from` once per subtable.
    UnionMap {
        from: Box<Op>,
    },
    /// Split the node's input handle by partition values and run `from`
    /// once per part.
    UnionPartition {
        by: Vec<String>,
        from: Box<Op>,
    },
}

impl Op {
    /// The predecessor in execution order, if any.
    pub fn input(&self) -> Option<&Op> {
        match self {
            Op::Leaf | Op::NoOutput => None,
            Op::Filter { from, .. }
            | Op::Project { from, .. }
            | Op::Aggregate { from, .. }
            | Op::OrderBy { from, .. }
            | Op::Limit { from, .. }
            | Op::Distinct { from, .. }
            | Op::Substitute { from, .. }
            | Op::UnionMap { from }
            | Op::UnionPartition { from, .. } => Some(from),
        }
    }

    /// The wire tag for this operator.
    pub fn tag(&self) -> &'static str {
        match self {
            Op::Leaf => "leaf",
            Op::NoOutput => "nooutput",
            Op::Filter { .. } => "filter",
            Op::Project { .. } => "project",
            Op::Aggregate { .. } => "aggregate",
            Op::OrderBy { .. } => "orderby",
            Op::Limit { .. } => "limit",
            Op::Distinct { .. } => "distinct",
            Op::Substitute { .. } => "substitute",
            Op::UnionMap { .. } => "unionmap",
            Op::UnionPartition { .. } => "union_partition",
        }
    }

    pub fn to_datum(&self, st: &mut Symtab) -> Result<Datum> {
        let mut fields = vec![(st.intern("type"), Datum::Sym(st.intern(self.tag())))];
        match self {
            Op::Leaf | Op::NoOutput => {}
            Op::Filter { predicate, from } => {
                fields.push((st.intern("expr"), predicate.to_datum(st)?));
                fields.push((st.intern("from"), from.to_datum(st)?));
            }
            Op::Project { columns, from } => {
                let items = columns
                    .iter()
                    .map(|b| binding_to_datum(b, st))
                    .collect::<Result<Vec<_>>>()?;
                fields.push((st.intern("columns"), Datum::List(items)));
                fields.push((st.intern("from"), from.to_datum(st)?));
            }
            Op::Aggregate {
                aggs,
                group_by,
                from,
            } => {
                let items = aggs
                    .iter()
                    .map(|a| agg_to_datum(a, st))
                    .collect::<Result<Vec<_>>>()?;
                fields.push((st.intern("aggs"), Datum::List(items)));
                if !group_by.is_empty() {
                    let items = group_by
                        .iter()
                        .map(|b| binding_to_datum(b, st))
                        .collect::<Result<Vec<_>>>()?;
                    fields.push((st.intern("group_by"), Datum::List(items)));
                }
                fields.push((st.intern("from"), from.to_datum(st)?));
            }
            Op::OrderBy { keys, from } => {
                let items = keys
                    .iter()
                    .map(|k| {
                        Ok(Datum::Struct(vec![
                            (st.intern("expr"), k.expr.to_datum(st)?),
                            (st.intern("desc"), Datum::Bool(k.desc)),
                        ]))
                    })
                    .collect::<Result<Vec<_>>>()?;
                fields.push((st.intern("keys"), Datum::List(items)));
                fields.push((st.intern("from"), from.to_datum(st)?));
            }
            Op::Limit { count, from } => {
                fields.push((st.intern("count"), Datum::Int(*count as i64)));
                fields.push((st.intern("from"), from.to_datum(st)?));
            }
            Op::Distinct { columns, from } => {
                if !columns.is_empty() {
                    let items = columns
                        .iter()
                        .map(|e| e.to_datum(st))
                        .collect::<Result<Vec<_>>>()?;
                    fields.push((st.intern("columns"), Datum::List(items)));
                }
                fields.push((st.intern("from"), from.to_datum(st)?));
            }
            Op::Substitute { inner, from } => {
                let items = inner
                    .iter()
                    .map(|n| n.to_datum(st))
                    .collect::<Result<Vec<_>>>()?;
                fields.push((st.intern("inner"), Datum::List(items)));
                fields.push((st.intern("from"), from.to_datum(st)?));
            }
            Op::UnionMap { from } => {
                fields.push((st.intern("from"), from.to_datum(st)?));
            }
            Op::UnionPartition { by, from } => {
                let items = by.iter().map(|s| Datum::Str(s.clone())).collect();
                fields.push((st.intern("by"), Datum::List(items)));
                fields.push((st.intern("from"), from.to_datum(st)?));
            }
        }
        Ok(Datum::Struct(fields))
    }

    pub fn from_datum(d: &Datum, st: &Symtab) -> Result<Op> {
        let fields = d
            .as_struct()
            .ok_or_else(|| Error::Corrupt("operator must be a struct".into()))?;
        let mut tag: Option<&str> = None;
        let mut rest: Vec<(&str, &Datum)> = Vec::with_capacity(fields.len());
        for (sym, val) in fields {
            let name = st
                .name(*sym)
                .ok_or_else(|| Error::Corrupt(format!("unresolved symbol {sym}")))?;
            if name == "type" {
                tag = val.as_text(st);
            } else {
                rest.push((name, val));
            }
        }
        let tag = tag.ok_or_else(|| Error::Corrupt("operator without type tag".into()))?;

        let mut from: Option<Op> = None;
        let mut other: Vec<(&str, &Datum)> = Vec::with_capacity(rest.len());
        for (name, val) in rest {
            if name == "from" {
                from = Some(Op::from_datum(val, st)?);
            } else {
                other.push((name, val));
            }
        }
        let need_from = |from: Option<Op>| {
            from.ok_or_else(|| Error::Corrupt(format!("{tag} without from")))
                .map(Box::new)
        };

        match tag {
            "leaf" => {
                reject_fields(&other)?;
                if from.is_some() {
                    return Err(Error::UnexpectedField("from".to_string()));
                }
                Ok(Op::Leaf)
            }
            "nooutput" => {
                reject_fields(&other)?;
                if from.is_some() {
                    return Err(Error::UnexpectedField("from".to_string()));
                }
                Ok(Op::NoOutput)
            }
            "filter" => {
                let mut predicate = None;
                for (name, val) in other {
                    match name {
                        "expr" => predicate = Some(Expr::from_datum(val, st)?),
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                Ok(Op::Filter {
                    predicate: predicate
                        .ok_or_else(|| Error::Corrupt("filter without expr".into()))?,
                    from: need_from(from)?,
                })
            }
            "project" => {
                let mut columns = Vec::new();
                for (name, val) in other {
                    match name {
                        "columns" => columns = bindings_from_datum(val, st)?,
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                Ok(Op::Project {
                    columns,
                    from: need_from(from)?,
                })
            }
            "aggregate" => {
                let mut aggs = Vec::new();
                let mut group_by = Vec::new();
                for (name, val) in other {
                    match name {
                        "aggs" => {
                            for item in val.as_list().ok_or_else(|| {
                                Error::Corrupt("aggs must be a list".into())
                            })? {
                                aggs.push(agg_from_datum(item, st)?);
                            }
                        }
                        "group_by" => group_by = bindings_from_datum(val, st)?,
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                Ok(Op::Aggregate {
                    aggs,
                    group_by,
                    from: need_from(from)?,
                })
            }
            "orderby" => {
                let mut keys = Vec::new();
                for (name, val) in other {
                    match name {
                        "keys" => {
                            for item in val.as_list().ok_or_else(|| {
                                Error::Corrupt("keys must be a list".into())
                            })? {
                                keys.push(orderkey_from_datum(item, st)?);
                            }
                        }
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                Ok(Op::OrderBy {
                    keys,
                    from: need_from(from)?,
                })
            }
            "limit" => {
                let mut count = None;
                for (name, val) in other {
                    match name {
                        "count" => {
                            let v = val
                                .as_int()
                                .ok_or_else(|| Error::Corrupt("count must be an int".into()))?;
                            count = Some(
                                u64::try_from(v)
                                    .map_err(|_| Error::Corrupt("negative limit".into()))?,
                            );
                        }
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                Ok(Op::Limit {
                    count: count.ok_or_else(|| Error::Corrupt("limit without count".into()))?,
                    from: need_from(from)?,
                })
            }
            "distinct" => {
                let mut columns = Vec::new();
                for (name, val) in other {
                    match name {
                        "columns" => {
                            for item in val.as_list().ok_or_else(|| {
                                Error::Corrupt("columns must be a list".into())
                            })? {
                                columns.push(Expr::from_datum(item, st)?);
                            }
                        }
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                Ok(Op::Distinct {
                    columns,
                    from: need_from(from)?,
                })
            }
            "substitute" => {
                let mut inner = Vec::new();
                for (name, val) in other {
                    match name {
                        "inner" => {
                            for item in val.as_list().ok_or_else(|| {
                                Error::Corrupt("inner must be a list".into())
                            })? {
                                inner.push(Node::from_datum(item, st)?);
                            }
                        }
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                Ok(Op::Substitute {
                    inner,
                    from: need_from(from)?,
                })
            }
            "unionmap" => {
                reject_fields(&other)?;
                Ok(Op::UnionMap {
                    from: need_from(from)?,
                })
            }
            "union_partition" => {
                let mut by = Vec::new();
                for (name, val) in other {
                    match name {
                        "by" => {
                            for item in val
                                .as_list()
                                .ok_or_else(|| Error::Corrupt("by must be a list".into()))?
                            {
                                let s = item.as_text(st).ok_or_else(|| {
                                    Error::Corrupt("partition key must be a string".into())
                                })?;
                                by.push(s.to_string());
                            }
                        }
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                Ok(Op::UnionPartition {
                    by,
                    from: need_from(from)?,
                })
            }
            other => Err(Error::UnknownOp(other.to_string())),
        }
    }

    /// Execute this operator chain, delivering output rows to `dst`.
    pub(crate) fn exec(
        &self,
        dst: Arc<dyn QuerySink>,
        input: Option<usize>,
        ctx: &ExecCtx<'_>,
        ep: &mut ExecParams,
    ) -> Result<()> {
        match self {
            Op::Leaf => {
                let idx = input.ok_or_else(|| Error::Corrupt("scan without input".into()))?;
                let inp = ctx
                    .inputs
                    .get(idx)
                    .ok_or_else(|| Error::Corrupt(format!("input {idx} out of range")))?;
                let table = inp.handle.open()?;
                let mut w = dst.open()?;
                let res = table.write_rows(&mut *w);
                let cres = w.close();
                ep.stats.add_scanned(inp.size().max(0) as u64);
                ep.stats.observe(&*table);
                res.and(cres)
            }
            Op::NoOutput => {
                let mut w = dst.open()?;
                w.close()
            }
            Op::Filter { predicate, from } => {
                let pred = ep.rewrite(predicate.clone())?;
                let down = Arc::clone(&dst);
                let sink = SinkFn(move || {
                    Ok(Box::new(FilterWriter::new(pred.clone(), down.open()?))
                        as Box<dyn RowWriter>)
                });
                from.exec(Arc::new(sink), input, ctx, ep)
            }
            Op::Project { columns, from } => {
                let columns = columns
                    .iter()
                    .map(|b| {
                        Ok(Binding {
                            expr: ep.rewrite(b.expr.clone())?,
                            name: b.name.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let down = Arc::clone(&dst);
                let sink = SinkFn(move || {
                    Ok(Box::new(ProjectWriter::new(columns.clone(), down.open()?))
                        as Box<dyn RowWriter>)
                });
                from.exec(Arc::new(sink), input, ctx, ep)
            }
            Op::Aggregate {
                aggs,
                group_by,
                from,
            } => {
                let aggs = aggs
                    .iter()
                    .map(|a| {
                        Ok(Aggregation {
                            op: a.op,
                            expr: a.expr.clone().map(|e| ep.rewrite(e)).transpose()?,
                            name: a.name.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let group_by = group_by
                    .iter()
                    .map(|b| {
                        Ok(Binding {
                            expr: ep.rewrite(b.expr.clone())?,
                            name: b.name.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let down = Arc::clone(&dst);
                let sink = SinkFn(move || {
                    Ok(Box::new(AggregateWriter::new(
                        aggs.clone(),
                        group_by.clone(),
                        down.open()?,
                    )) as Box<dyn RowWriter>)
                });
                from.exec(Arc::new(sink), input, ctx, ep)
            }
            Op::OrderBy { keys, from } => {
                let keys = keys
                    .iter()
                    .map(|k| {
                        Ok(OrderKey {
                            expr: ep.rewrite(k.expr.clone())?,
                            desc: k.desc,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let down = Arc::clone(&dst);
                let sink = SinkFn(move || {
                    Ok(Box::new(OrderByWriter::new(keys.clone(), down.open()?))
                        as Box<dyn RowWriter>)
                });
                from.exec(Arc::new(sink), input, ctx, ep)
            }
            Op::Limit { count, from } => {
                let count = *count;
                let down = Arc::clone(&dst);
                let sink = SinkFn(move || {
                    Ok(Box::new(LimitWriter::new(count, down.open()?)) as Box<dyn RowWriter>)
                });
                from.exec(Arc::new(sink), input, ctx, ep)
            }
            Op::Distinct { columns, from } => {
                let columns = columns
                    .iter()
                    .map(|e| ep.rewrite(e.clone()))
                    .collect::<Result<Vec<_>>>()?;
                let down = Arc::clone(&dst);
                let sink = SinkFn(move || {
                    Ok(Box::new(DistinctWriter::new(columns.clone(), down.open()?))
                        as Box<dyn RowWriter>)
                });
                from.exec(Arc::new(sink), input, ctx, ep)
            }
            Op::Substitute { inner, from } => {
                substitute::exec_substitute(inner, from, dst, input, ctx, ep)
            }
            Op::UnionMap { from } => split::exec_union_map(from, dst, input, ctx, ep),
            Op::UnionPartition { by, from } => {
                split::exec_union_partition(by, from, dst, input, ctx, ep)
            }
        }
    }

    /// Write the chain in execution order (terminal first), one operator
    /// per line at `indent`.
    pub(crate) fn describe(
        &self,
        f: &mut fmt::Formatter<'_>,
        input: Option<usize>,
        indent: usize,
    ) -> fmt::Result {
        let pad = "  ".repeat(indent);
        if let Op::Substitute { inner, from } = self {
            for (i, node) in inner.iter().enumerate() {
                writeln!(f, "{pad}WITH REPLACEMENT({i}) AS (")?;
                node.op.describe(f, node.input, indent + 1)?;
                writeln!(f, "{pad})")?;
            }
            return from.describe(f, input, indent);
        }
        if let Some(from) = self.input() {
            from.describe(f, input, indent)?;
        }
        match self {
            Op::Leaf => match input {
                Some(i) => writeln!(f, "{pad}SCAN t{i}"),
                None => writeln!(f, "{pad}SCAN"),
            },
            Op::NoOutput => writeln!(f, "{pad}NO OUTPUT"),
            Op::Filter { predicate, .. } => writeln!(f, "{pad}FILTER {predicate}"),
            Op::Project { columns, .. } => {
                writeln!(f, "{pad}PROJECT {}", join(columns, ", "))
            }
            Op::Aggregate {
                aggs, group_by, ..
            } => {
                if group_by.is_empty() {
                    writeln!(f, "{pad}AGGREGATE {}", join(aggs, ", "))
                } else {
                    writeln!(
                        f,
                        "{pad}AGGREGATE {} BY {}",
                        join(aggs, ", "),
                        join(group_by, ", ")
                    )
                }
            }
            Op::OrderBy { keys, .. } => writeln!(f, "{pad}ORDER BY {}", join(keys, ", ")),
            Op::Limit { count, .. } => writeln!(f, "{pad}LIMIT {count}"),
            Op::Distinct { columns, .. } => {
                if columns.is_empty() {
                    writeln!(f, "{pad}DISTINCT")
                } else {
                    writeln!(f, "{pad}DISTINCT ON {}", join(columns, ", "))
                }
            }
            Op::Substitute { .. } => Ok(()),
            Op::UnionMap { .. } => writeln!(f, "{pad}UNION MAP"),
            Op::UnionPartition { by, .. } => {
                writeln!(f, "{pad}UNION PARTITION BY {}", by.join(", "))
            }
        }
    }
}

fn join<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

fn reject_fields(other: &[(&str, &Datum)]) -> Result<()> {
    match other.first() {
        Some((name, _)) => Err(Error::UnexpectedField((*name).to_string())),
        None => Ok(()),
    }
}

fn binding_to_datum(b: &Binding, st: &mut Symtab) -> Result<Datum> {
    Ok(Datum::Struct(vec![
        (st.intern("expr"), b.expr.to_datum(st)?),
        (st.intern("as"), Datum::Str(b.name.clone())),
    ]))
}

fn binding_from_datum(d: &Datum, st: &Symtab) -> Result<Binding> {
    let fields = d
        .as_struct()
        .ok_or_else(|| Error::Corrupt("binding must be a struct".into()))?;
    let mut expr = None;
    let mut name = None;
    for (sym, val) in fields {
        let fname = st
            .name(*sym)
            .ok_or_else(|| Error::Corrupt(format!("unresolved symbol {sym}")))?;
        match fname {
            "expr" => expr = Some(Expr::from_datum(val, st)?),
            "as" => name = val.as_text(st).map(str::to_string),
            _ => return Err(Error::UnexpectedField(fname.to_string())),
        }
    }
    match (expr, name) {
        (Some(expr), Some(name)) => Ok(Binding { expr, name }),
        _ => Err(Error::Corrupt("incomplete binding".into())),
    }
}

fn bindings_from_datum(d: &Datum, st: &Symtab) -> Result<Vec<Binding>> {
    d.as_list()
        .ok_or_else(|| Error::Corrupt("bindings must be a list".into()))?
        .iter()
        .map(|item| binding_from_datum(item, st))
        .collect()
}

fn agg_to_datum(a: &Aggregation, st: &mut Symtab) -> Result<Datum> {
    let mut fields = vec![(st.intern("op"), Datum::Sym(st.intern(a.op.name())))];
    if let Some(e) = &a.expr {
        fields.push((st.intern("expr"), e.to_datum(st)?));
    }
    fields.push((st.intern("as"), Datum::Str(a.name.clone())));
    Ok(Datum::Struct(fields))
}

fn agg_from_datum(d: &Datum, st: &Symtab) -> Result<Aggregation> {
    let fields = d
        .as_struct()
        .ok_or_else(|| Error::Corrupt("aggregation must be a struct".into()))?;
    let mut op = None;
    let mut expr = None;
    let mut name = None;
    for (sym, val) in fields {
        let fname = st
            .name(*sym)
            .ok_or_else(|| Error::Corrupt(format!("unresolved symbol {sym}")))?;
        match fname {
            "op" => {
                let s = val
                    .as_text(st)
                    .ok_or_else(|| Error::Corrupt("aggregate op must be a symbol".into()))?;
                op = AggOp::from_name(s);
                if op.is_none() {
                    return Err(Error::Corrupt(format!("unknown aggregate {s:?}")));
                }
            }
            "expr" => expr = Some(Expr::from_datum(val, st)?),
            "as" => name = val.as_text(st).map(str::to_string),
            _ => return Err(Error::UnexpectedField(fname.to_string())),
        }
    }
    match (op, name) {
        (Some(op), Some(name)) => Ok(Aggregation { op, expr, name }),
        _ => Err(Error::Corrupt("incomplete aggregation".into())),
    }
}

fn orderkey_from_datum(d: &Datum, st: &Symtab) -> Result<OrderKey> {
    let fields = d
        .as_struct()
        .ok_or_else(|| Error::Corrupt("sort key must be a struct".into()))?;
    let mut expr = None;
    let mut desc = false;
    for (sym, val) in fields {
        let fname = st
            .name(*sym)
            .ok_or_else(|| Error::Corrupt(format!("unresolved symbol {sym}")))?;
        match fname {
            "expr" => expr = Some(Expr::from_datum(val, st)?),
            "desc" => {
                desc = val
                    .as_bool()
                    .ok_or_else(|| Error::Corrupt("desc must be a bool".into()))?;
            }
            _ => return Err(Error::UnexpectedField(fname.to_string())),
        }
    }
    Ok(OrderKey {
        expr: expr.ok_or_else(|| Error::Corrupt("sort key without expr".into()))?,
        desc,
    })
}
