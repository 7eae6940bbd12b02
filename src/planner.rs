//! Query planning: lowering a [`Query`] into an executable [`Tree`].
//!
//! Queries are built programmatically (SQL text parsing lives elsewhere)
//! and lower bottom-up into a reverse-ordered operator chain:
//! scan, filter, aggregate-or-project, distinct, order-by, limit. Scalar
//! and `IN` subqueries are extracted into `SUBSTITUTE` inner nodes and
//! their expression sites replaced with `*_REPLACEMENT` placeholders.
//!
//! [`new`] produces a single-process plan. [`new_split`] produces a
//! distributed plan: the streaming prefix (scan + filter) goes under
//! `UNION MAP`, or -- when every group-by key is a partition column per
//! the environment's index -- the whole aggregation moves under
//! `UNION PARTITION` with the group keys rewritten to `PARTITION_VALUE`
//! placeholders, since rows in one part all share the same key values.

use crate::env::{self, Env, Hints, Input};
use crate::error::Result;
use crate::expr::{AggOp, Aggregation, Binding, Builtin, Expr, OrderKey};
use crate::op::Op;
use crate::tree::{self, Node, Tree, TypeSet};
use tracing::debug;

/// One output column of a query.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectItem {
    pub expr: SelectExpr,
    pub name: String,
}

/// A select column is either a plain expression or an aggregate.
#[derive(Clone, Debug, PartialEq)]
pub enum SelectExpr {
    Value(Expr),
    Agg(AggOp, Option<Expr>),
}

/// A parsed query, ready for planning.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub select: Vec<SelectItem>,
    /// Table reference: a path, `TABLE_GLOB`, or `TABLE_PATTERN` call.
    pub from: Expr,
    pub filter: Option<Expr>,
    pub group_by: Vec<Binding>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<u64>,
    pub distinct: bool,
}

impl Query {
    pub fn from_table(from: Expr) -> Self {
        Self {
            select: Vec::new(),
            from,
            filter: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            distinct: false,
        }
    }

    pub fn select(mut self, expr: Expr, name: &str) -> Self {
        self.select.push(SelectItem {
            expr: SelectExpr::Value(expr),
            name: name.to_string(),
        });
        self
    }

    pub fn agg(mut self, op: AggOp, expr: Option<Expr>, name: &str) -> Self {
        self.select.push(SelectItem {
            expr: SelectExpr::Agg(op, expr),
            name: name.to_string(),
        });
        self
    }

    pub fn filter(mut self, e: Expr) -> Self {
        self.filter = Some(e);
        self
    }

    pub fn group_by(mut self, expr: Expr, name: &str) -> Self {
        self.group_by.push(Binding::new(expr, name));
        self
    }

    pub fn order_by(mut self, expr: Expr, desc: bool) -> Self {
        self.order_by.push(OrderKey { expr, desc });
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }
}

/// Plan a query for single-process execution.
pub fn new(q: &Query, env: &dyn Env) -> Result<Tree> {
    build(q, env, false)
}

/// Plan a query for distributed execution over split table handles.
pub fn new_split(q: &Query, env: &dyn Env) -> Result<Tree> {
    build(q, env, true)
}

fn build(q: &Query, env: &dyn Env, split: bool) -> Result<Tree> {
    let mut inputs = Vec::new();
    let root = build_node(q, env, split, &mut inputs)?;
    let id = tree::derive_id(&root)?;
    let results: Vec<String> = q.select.iter().map(|s| s.name.clone()).collect();
    let result_types = vec![TypeSet::any(); results.len()];
    debug!(id = %id, split, inputs = inputs.len(), "planned query");
    Ok(Tree {
        id,
        inputs,
        data: None,
        root,
        results,
        result_types,
    })
}

fn build_node(
    q: &Query,
    env: &dyn Env,
    split: bool,
    inputs: &mut Vec<Input>,
) -> Result<Node> {
    let fields = referenced_fields(q);
    let hints = Hints {
        filter: q.filter.as_ref(),
        fields: Some(&fields),
    };
    let input = env::resolve(env, &q.from, &hints)?;
    inputs.push(input);
    let idx = inputs.len() - 1;

    // lower subqueries out of every expression position
    let mut inner: Vec<Node> = Vec::new();
    let filter = q
        .filter
        .clone()
        .map(|e| lower_expr(e, env, inputs, &mut inner))
        .transpose()?;
    let select = q
        .select
        .iter()
        .map(|item| {
            Ok(SelectItem {
                expr: match &item.expr {
                    SelectExpr::Value(e) => {
                        SelectExpr::Value(lower_expr(e.clone(), env, inputs, &mut inner)?)
                    }
                    SelectExpr::Agg(op, e) => SelectExpr::Agg(
                        *op,
                        e.clone()
                            .map(|e| lower_expr(e, env, inputs, &mut inner))
                            .transpose()?,
                    ),
                },
                name: item.name.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let group_by = q
        .group_by
        .iter()
        .map(|b| {
            Ok(Binding {
                expr: lower_expr(b.expr.clone(), env, inputs, &mut inner)?,
                name: b.name.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let order_by = q
        .order_by
        .iter()
        .map(|k| {
            Ok(OrderKey {
                expr: lower_expr(k.expr.clone(), env, inputs, &mut inner)?,
                desc: k.desc,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let aggs: Vec<Aggregation> = select
        .iter()
        .filter_map(|item| match &item.expr {
            SelectExpr::Agg(op, e) => Some(Aggregation {
                op: *op,
                expr: e.clone(),
                name: item.name.clone(),
            }),
            SelectExpr::Value(_) => None,
        })
        .collect();
    let has_aggs = !aggs.is_empty() || !group_by.is_empty();

    // a grouped aggregation whose every key is a partition column can run
    // one part at a time, with the keys rewritten to constants; reducers
    // above the fan-out need the single-writer shape of UNION MAP instead
    let reducers_above = !q.order_by.is_empty() || q.limit.is_some() || q.distinct;
    let part_by = if split && has_aggs && !group_by.is_empty() && !reducers_above {
        partition_keys(env, &q.from, &group_by)?
    } else {
        None
    };

    let mut op = Op::Leaf;
    if let Some(predicate) = filter {
        op = Op::Filter {
            predicate,
            from: Box::new(op),
        };
    }

    if let Some(by) = part_by {
        let group_by = group_by
            .iter()
            .enumerate()
            .map(|(i, b)| Binding {
                expr: Expr::call(Builtin::PartitionValue, vec![Expr::int(i as i64)]),
                name: b.name.clone(),
            })
            .collect();
        op = Op::Aggregate {
            aggs,
            group_by,
            from: Box::new(op),
        };
        debug!(by = ?by, "splitting on partition keys");
        op = Op::UnionPartition {
            by,
            from: Box::new(op),
        };
    } else {
        if split {
            op = Op::UnionMap { from: Box::new(op) };
        }
        if has_aggs {
            op = Op::Aggregate {
                aggs,
                group_by,
                from: Box::new(op),
            };
        } else if !select.is_empty() {
            let columns = select
                .iter()
                .map(|item| match &item.expr {
                    SelectExpr::Value(e) => Binding::new(e.clone(), &item.name),
                    SelectExpr::Agg(..) => unreachable!("aggregates handled above"),
                })
                .collect();
            op = Op::Project {
                columns,
                from: Box::new(op),
            };
        }
    }

    if q.distinct {
        op = Op::Distinct {
            columns: Vec::new(),
            from: Box::new(op),
        };
    }
    if !order_by.is_empty() {
        op = Op::OrderBy {
            keys: order_by,
            from: Box::new(op),
        };
    }
    if let Some(count) = q.limit {
        op = Op::Limit {
            count,
            from: Box::new(op),
        };
    }
    if !inner.is_empty() {
        op = Op::Substitute {
            inner,
            from: Box::new(op),
        };
    }
    Ok(Node::new(op, Some(idx)))
}

/// Replace subquery expressions with replacement placeholders, planning
/// each subquery as a substitute inner node.
fn lower_expr(
    e: Expr,
    env: &dyn Env,
    inputs: &mut Vec<Input>,
    inner: &mut Vec<Node>,
) -> Result<Expr> {
    Ok(match e {
        Expr::Subquery(q) => {
            let node = build_node(&q, env, false, inputs)?;
            let id = inner.len() as i64;
            inner.push(node);
            Expr::call(Builtin::ScalarReplacement, vec![Expr::int(id)])
        }
        Expr::InSubquery(value, q) => {
            let value = lower_expr(*value, env, inputs, inner)?;
            let node = build_node(&q, env, false, inputs)?;
            let id = inner.len() as i64;
            inner.push(node);
            Expr::call(Builtin::InReplacement, vec![value, Expr::int(id)])
        }
        Expr::Unary(op, a) => Expr::Unary(op, Box::new(lower_expr(*a, env, inputs, inner)?)),
        Expr::Binary(op, l, r) => Expr::Binary(
            op,
            Box::new(lower_expr(*l, env, inputs, inner)?),
            Box::new(lower_expr(*r, env, inputs, inner)?),
        ),
        Expr::Member(v, set) => Expr::Member(
            Box::new(lower_expr(*v, env, inputs, inner)?),
            set.into_iter()
                .map(|e| lower_expr(e, env, inputs, inner))
                .collect::<Result<_>>()?,
        ),
        Expr::Call(f, args) => Expr::Call(
            f,
            args.into_iter()
                .map(|e| lower_expr(e, env, inputs, inner))
                .collect::<Result<_>>()?,
        ),
        other => other,
    })
}

/// The group keys as partition columns, when the environment's index
/// partitions on all of them.
fn partition_keys(
    env: &dyn Env,
    from: &Expr,
    group_by: &[Binding],
) -> Result<Option<Vec<String>>> {
    let cols: Option<Vec<String>> = group_by
        .iter()
        .map(|b| match &b.expr {
            Expr::Path(parts) if parts.len() == 1 => Some(parts[0].clone()),
            _ => None,
        })
        .collect();
    let Some(cols) = cols else {
        return Ok(None);
    };
    let Some(ix) = env::index_for(env, from)? else {
        return Ok(None);
    };
    if cols.iter().all(|c| ix.has_partition(c)) {
        Ok(Some(cols))
    } else {
        Ok(None)
    }
}

/// The top-level column names a query references, for `Env` hints.
fn referenced_fields(q: &Query) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |e: &Expr| {
        e.walk(&mut |node| {
            if let Expr::Path(parts) = node
                && let Some(first) = parts.first()
                && !out.contains(first)
            {
                out.push(first.clone());
            }
        });
    };
    for item in &q.select {
        match &item.expr {
            SelectExpr::Value(e) => push(e),
            SelectExpr::Agg(_, Some(e)) => push(e),
            SelectExpr::Agg(_, None) => {}
        }
    }
    if let Some(f) = &q.filter {
        push(f);
    }
    for b in &q.group_by {
        push(&b.expr);
    }
    for k in &q.order_by {
        push(&k.expr);
    }
    out
}
