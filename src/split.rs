//! Handle splitting and fan-out execution.
//!
//! `UNION MAP` splits a table handle into [`Subtable`]s and runs the same
//! subplan once per shard, each through the subtable's transport against a
//! stub plan whose single input is the shard's handle. All shards share
//! one locked writer on the parent output, so downstream reducers see a
//! single serialized row stream; shard output interleaves at row
//! granularity in arbitrary order.
//!
//! `UNION PARTITION` splits by declared partition keys instead: each
//! [`TablePart`] carries the key values for its slice, a proportional
//! share of the parallelism budget is allotted per part, and a rewriter
//! replaces `PARTITION_VALUE(i)` in the part's chain with the part's
//! `i`-th key constant.
//!
//! Fan-out error handling: every branch runs to completion, all errors are
//! collected, and the first non-nil wins. Writers close on every path;
//! close errors surface only when nothing failed earlier.

use crate::error::{Error, Result};
use crate::exec::{ExecParams, LockedSink, OpenSink};
use crate::expr::{Builtin, Expr, Rewriter, Value};
use crate::op::Op;
use crate::transport::{LocalTransport, Transport};
use crate::tree::{ExecCtx, Node, Tree, TypeSet};
use crate::vm::QuerySink;
use crate::env::{Input, TableHandle};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

/// One shard of a split handle, paired with the transport that executes
/// its subplan.
pub struct Subtable {
    pub transport: Arc<dyn Transport>,
    pub handle: Arc<dyn TableHandle>,
}

impl Subtable {
    /// A shard that executes in-process.
    pub fn local(handle: Arc<dyn TableHandle>) -> Self {
        Self {
            transport: Arc::new(LocalTransport::default()),
            handle,
        }
    }
}

/// One partition of a handle split by key values. `parts[i]` is the
/// constant `PARTITION_VALUE(i)` resolves to within this part.
pub struct TablePart {
    pub handle: Arc<dyn TableHandle>,
    pub parts: Vec<Value>,
}

/// Split a handle into subtables: the handle's own split when it has one,
/// otherwise a single local shard.
pub fn split(handle: &Arc<dyn TableHandle>) -> Result<Vec<Subtable>> {
    match handle.split()? {
        Some(subs) => Ok(subs),
        None => Ok(vec![Subtable::local(Arc::clone(handle))]),
    }
}

fn stub_tree(id: &str, seq: usize, table: &Expr, handle: Arc<dyn TableHandle>, from: &Op) -> Tree {
    Tree {
        id: format!("{id}/{seq}"),
        inputs: vec![Input::new(table.clone(), handle)],
        data: None,
        root: Node {
            op: from.clone(),
            input: Some(0),
            output_type: TypeSet::any(),
        },
        results: Vec::new(),
        result_types: Vec::new(),
    }
}

pub(crate) fn exec_union_map(
    from: &Op,
    dst: Arc<dyn QuerySink>,
    input: Option<usize>,
    ctx: &ExecCtx<'_>,
    ep: &mut ExecParams,
) -> Result<()> {
    let idx = input.ok_or_else(|| Error::Corrupt("union map without input".into()))?;
    let inp = ctx
        .inputs
        .get(idx)
        .ok_or_else(|| Error::Corrupt(format!("input {idx} out of range")))?;
    let subs = split(&inp.handle)?;
    if subs.is_empty() {
        // nothing to scan: the output is just an empty stream
        let mut w = dst.open()?;
        return w.close();
    }
    debug!(shards = subs.len(), "union map fan-out");

    let locked = LockedSink::new(dst.open()?);
    let stubs: Vec<Tree> = subs
        .iter()
        .enumerate()
        .map(|(i, sub)| stub_tree(ctx.id, i, &inp.table, Arc::clone(&sub.handle), from))
        .collect();
    let mut seps: Vec<ExecParams> = subs.iter().map(|_| ep.fork()).collect();

    let results: Vec<Result<()>> = subs
        .par_iter()
        .zip(stubs.par_iter())
        .zip(seps.par_iter_mut())
        .map(|((sub, stub), sep)| {
            let sink: Arc<dyn QuerySink> = Arc::new(locked.clone());
            sub.transport.exec(stub, sink, sep)
        })
        .collect();
    for sep in &seps {
        ep.join(sep);
    }

    let mut first = results.into_iter().find_map(|r| r.err());
    if let Some(e) = &first {
        warn!(error = %e, "union map shard failed");
    }
    let closed = locked.finish();
    if first.is_none() {
        first = closed.err();
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

pub(crate) fn exec_union_partition(
    by: &[String],
    from: &Op,
    dst: Arc<dyn QuerySink>,
    input: Option<usize>,
    ctx: &ExecCtx<'_>,
    ep: &mut ExecParams,
) -> Result<()> {
    let idx = input.ok_or_else(|| Error::Corrupt("union partition without input".into()))?;
    let inp = ctx
        .inputs
        .get(idx)
        .ok_or_else(|| Error::Corrupt(format!("input {idx} out of range")))?;
    let parts = inp
        .handle
        .split_by(by)?
        .ok_or_else(|| Error::NotPartitioned(by.join(", ")))?;
    if parts.is_empty() {
        // the partition predicate removed everything
        let mut w = dst.open()?;
        return w.close();
    }
    let sizes: Vec<i64> = parts.iter().map(|p| p.handle.size()).collect();
    let shares = distribute(&sizes, ep.parallel);
    debug!(parts = parts.len(), ?shares, "union partition fan-out");

    let sinks: Vec<OpenSink> = shares
        .iter()
        .map(|&n| OpenSink::new(&*dst, n))
        .collect::<Result<_>>()?;
    let stubs: Vec<Tree> = parts
        .iter()
        .enumerate()
        .map(|(i, part)| stub_tree(ctx.id, i, &inp.table, Arc::clone(&part.handle), from))
        .collect();
    let mut seps: Vec<ExecParams> = parts
        .iter()
        .zip(&shares)
        .map(|(part, &share)| {
            let mut sep = ep.fork();
            sep.parallel = share;
            sep.push_rewriter(Arc::new(PartValues {
                parts: part.parts.clone(),
            }));
            sep
        })
        .collect();

    let results: Vec<Result<()>> = stubs
        .par_iter()
        .zip(sinks.par_iter())
        .zip(seps.par_iter_mut())
        .map(|((stub, sink), sep)| {
            let sink: Arc<dyn QuerySink> = Arc::new(sink.clone());
            stub.exec(sink, sep)
        })
        .collect();
    for sep in &mut seps {
        sep.pop_rewriter();
        ep.join(sep);
    }

    let mut first = results.into_iter().find_map(|r| r.err());
    if let Some(e) = &first {
        warn!(error = %e, "union partition part failed");
    }
    for sink in &sinks {
        let closed = sink.finish();
        if first.is_none() {
            first = closed.err();
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Replaces `PARTITION_VALUE(i)` with one part's `i`-th key constant.
struct PartValues {
    parts: Vec<Value>,
}

impl Rewriter for PartValues {
    fn rewrite(&self, e: Expr) -> Result<Expr> {
        let Expr::Call(Builtin::PartitionValue, args) = &e else {
            return Ok(e);
        };
        let idx = match args.as_slice() {
            [Expr::Const(Value::Int(i))] if *i >= 0 => *i as usize,
            _ => {
                return Err(Error::Corrupt(
                    "PARTITION_VALUE takes a constant index".into(),
                ));
            }
        };
        let v = self
            .parts
            .get(idx)
            .ok_or_else(|| Error::Corrupt(format!("partition value {idx} out of range")))?;
        Ok(Expr::Const(v.clone()))
    }
}

/// Allot `parallel` execution slots across parts proportionally to their
/// sizes. Every part gets at least one slot; when `parallel >= parts`, the
/// slots sum to exactly `parallel` (overshoot is trimmed from the largest
/// allotments, shortfall lands on the last part).
pub fn distribute(sizes: &[i64], parallel: usize) -> Vec<usize> {
    if sizes.is_empty() {
        return Vec::new();
    }
    let n = parallel.max(sizes.len());
    let sum: u128 = sizes.iter().map(|&s| s.max(1) as u128).sum();
    let mut out: Vec<usize> = sizes
        .iter()
        .map(|&s| (((s.max(0) as u128) * n as u128 / sum) as usize).max(1))
        .collect();
    let mut total: usize = out.iter().sum();
    while total > n {
        let (i, &max) = out
            .iter()
            .enumerate()
            .max_by_key(|&(_, &v)| v)
            .expect("sizes is non-empty");
        if max == 1 {
            break;
        }
        out[i] -= 1;
        total -= 1;
    }
    if total < n
        && let Some(last) = out.last_mut()
    {
        *last += n - total;
    }
    out
}
