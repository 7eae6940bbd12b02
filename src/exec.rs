//! Execution parameters and shared sink plumbing.
//!
//! [`ExecParams`] travels down the operator chain during one execution.
//! It carries the parallelism bound, the replacement row cap, the
//! statistics counters, and a stack of expression rewriters: `SUBSTITUTE`
//! pushes the replacement rewriter for the scope of its outer chain,
//! `UNION PARTITION` pushes the partition-value rewriter for one part.
//! Operators rewrite their expressions through the stack (innermost
//! rewriter first) right before execution, and every rewrite pass is
//! followed by simplification so interpolated constants fold.
//!
//! Fan-out executions run on forked parameters: each branch gets fresh
//! counters and a clone of the rewriter stack, and the parent folds the
//! branch counters back in atomically when the branch finishes.

use crate::error::Result;
use crate::expr::{self, Expr, Rewriter};
use crate::stats::ExecStats;
use crate::vm::{QuerySink, Row, RowWriter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Default cap on the rows one replacement may collect.
pub const DEFAULT_LARGE_SIZE: usize = 65_536;

/// Per-execution state.
pub struct ExecParams {
    /// Parallelism bound for fan-out operators.
    pub parallel: usize,
    /// Maximum rows one replacement may collect.
    pub large_size: usize,
    /// Counters for this execution; children fold into their parent.
    pub stats: ExecStats,
    rewriters: Vec<Arc<dyn Rewriter>>,
}

impl Default for ExecParams {
    fn default() -> Self {
        Self {
            parallel: num_cpus::get().max(1),
            large_size: DEFAULT_LARGE_SIZE,
            stats: ExecStats::new(),
            rewriters: Vec::new(),
        }
    }
}

impl ExecParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite `e` through the stack, innermost rewriter first, folding
    /// constants after each pass.
    pub fn rewrite(&self, e: Expr) -> Result<Expr> {
        let mut e = e;
        for rw in self.rewriters.iter().rev() {
            e = expr::rewrite(e, rw.as_ref())?;
            e = expr::simplify(e);
        }
        Ok(expr::simplify(e))
    }

    /// Push a rewriter for a nested scope. Callers pair this with
    /// [`ExecParams::pop_rewriter`] around the scoped execution.
    pub(crate) fn push_rewriter(&mut self, rw: Arc<dyn Rewriter>) {
        self.rewriters.push(rw);
    }

    pub(crate) fn pop_rewriter(&mut self) {
        self.rewriters.pop();
    }

    /// Parameters for one branch of a fan-out: fresh counters, shared
    /// bounds, the same rewriter scope.
    pub(crate) fn fork(&self) -> ExecParams {
        ExecParams {
            parallel: self.parallel,
            large_size: self.large_size,
            stats: ExecStats::new(),
            rewriters: self.rewriters.clone(),
        }
    }

    /// Fold a finished branch's counters into this execution.
    pub(crate) fn join(&self, child: &ExecParams) {
        self.stats.atomic_add(&child.stats);
    }
}

/// One writer shared by every branch of a fan-out. Writes serialize
/// through a mutex so row frames from different branches never interleave;
/// branch-level `close` is a no-op and the owner closes the underlying
/// writer once via [`LockedSink::finish`].
#[derive(Clone)]
pub(crate) struct LockedSink {
    inner: Arc<Mutex<Box<dyn RowWriter>>>,
}

impl LockedSink {
    pub fn new(w: Box<dyn RowWriter>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(w)),
        }
    }

    /// Close the underlying writer.
    pub fn finish(&self) -> Result<()> {
        self.inner.lock().unwrap().close()
    }
}

impl QuerySink for LockedSink {
    fn open(&self) -> Result<Box<dyn RowWriter>> {
        Ok(Box::new(LockedWriter {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct LockedWriter {
    inner: Arc<Mutex<Box<dyn RowWriter>>>,
}

impl RowWriter for LockedWriter {
    fn write(&mut self, row: Row) -> Result<()> {
        self.inner.lock().unwrap().write(row)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A pool of writers opened up front from a downstream sink. `open`
/// hands them out round-robin via an atomic cursor; the owner closes the
/// whole pool once via [`OpenSink::finish`].
#[derive(Clone)]
pub(crate) struct OpenSink {
    writers: Arc<Vec<Mutex<Box<dyn RowWriter>>>>,
    pos: Arc<AtomicUsize>,
}

impl OpenSink {
    pub fn new(dst: &dyn QuerySink, n: usize) -> Result<Self> {
        let n = n.max(1);
        let mut writers = Vec::with_capacity(n);
        for _ in 0..n {
            writers.push(Mutex::new(dst.open()?));
        }
        Ok(Self {
            writers: Arc::new(writers),
            pos: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Close every pooled writer. The first error wins; later writers are
    /// still closed.
    pub fn finish(&self) -> Result<()> {
        let mut res = Ok(());
        for w in self.writers.iter() {
            let r = w.lock().unwrap().close();
            if res.is_ok() {
                res = r;
            }
        }
        res
    }
}

impl QuerySink for OpenSink {
    fn open(&self) -> Result<Box<dyn RowWriter>> {
        let idx = self.pos.fetch_add(1, Ordering::Relaxed) % self.writers.len();
        Ok(Box::new(OpenWriter {
            writers: Arc::clone(&self.writers),
            idx,
        }))
    }
}

struct OpenWriter {
    writers: Arc<Vec<Mutex<Box<dyn RowWriter>>>>,
    idx: usize,
}

impl RowWriter for OpenWriter {
    fn write(&mut self, row: Row) -> Result<()> {
        self.writers[self.idx].lock().unwrap().write(row)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
