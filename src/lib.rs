//! # Trestle
//!
//! The **distributed plan-execution core** of a columnar SQL engine.
//! Trestle lowers a query AST into a tree of execution operators,
//! serializes that tree into a compact self-describing binary form,
//! distributes subtrees across worker peers, executes operators --
//! including nested subqueries whose results are interpolated back into
//! the outer query as constants -- and aggregates results and statistics.
//!
//! ## Core concepts
//!
//! ### Plans
//!
//! A [`Tree`] owns the resolved table [`Input`]s and a root [`Node`]; each
//! node carries an operator chain ([`Op`]) linked in *reverse execution
//! order* -- the chain head is the last step, and walking `from` pointers
//! reaches the terminal scan that runs first. The planner builds chains
//! bottom-up, which makes this encoding the natural one.
//!
//! ### Substitution
//!
//! Subqueries become `SUBSTITUTE` operators: the inner plans run first
//! (concurrently), their rows are collected, and placeholder builtins in
//! the outer expressions (`SCALAR_REPLACEMENT`, `IN_REPLACEMENT`,
//! `HASH_REPLACEMENT`, ...) are rewritten to constants before the outer
//! chain executes. Constant folding runs after every rewrite, so
//! `x IN (subquery)` can collapse all the way to `TRUE`.
//!
//! ### Distribution
//!
//! `UNION MAP` splits a table handle into subtables and runs the same
//! subplan once per shard, each through a [`Transport`] (in-process by
//! default; hosts register remote transports in a process-global
//! registry). `UNION PARTITION` splits on declared partition keys and
//! rewrites `PARTITION_VALUE(i)` to each part's key constant. Shard output
//! funnels through one locked writer so downstream reducers stay
//! single-threaded, and [`ExecStats`] fold across branches atomically.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use trestle::testing::{MemEnv, row};
//! use trestle::{AggOp, Buffer, ExecParams, Expr, Query, Value};
//!
//! fn main() -> trestle::Result<()> {
//!     let mut env = MemEnv::new();
//!     env.add_table(
//!         "db.events",
//!         vec![
//!             row(vec![("user", Value::from("alice")), ("bytes", Value::from(120i64))]),
//!             row(vec![("user", Value::from("bob")), ("bytes", Value::from(80i64))]),
//!         ],
//!     );
//!
//!     // SELECT SUM(bytes) AS total FROM db.events
//!     let q = Query::from_table(Expr::path(&["db", "events"]))
//!         .agg(AggOp::Sum, Some(Expr::path(&["bytes"])), "total");
//!     let plan = trestle::new(&q, &env)?;
//!
//!     let out = Buffer::new();
//!     let mut ep = ExecParams::new();
//!     plan.exec(Arc::new(out.clone()), &mut ep)?;
//!     println!("{:?}", out.rows());
//!     Ok(())
//! }
//! ```
//!
//! Plans round-trip through the wire format with [`Tree::to_bytes`] and
//! [`Tree::from_bytes`]; table handles are opaque and decode through the
//! host's [`HandleDecoder`].
//!
//! ## Module overview
//!
//! - [`planner`] - query AST and lowering into operator chains
//! - [`tree`] / [`op`] - the plan data model and its binary codec
//! - [`expr`] - expressions, constants, rewriting, simplification
//! - [`vm`] - the row-level execution seam (tables, sinks, writers)
//! - [`env`] - host environment: table resolution, globs, indexes
//! - [`transport`] - local execution and the transport registry
//! - [`split`] - handle splitting and fan-out execution
//! - [`stats`] - execution counters and their compact codec
//! - [`wire`] - the self-describing binary value encoding
//! - [`testing`] - in-memory environment fixtures

pub mod env;
pub mod error;
pub mod exec;
pub mod expr;
pub mod op;
pub mod planner;
pub mod split;
pub mod stats;
pub mod testing;
pub mod transport;
pub mod tree;
pub mod vm;
pub mod wire;

mod substitute;

pub use env::{
    Env, HandleDecoder, Hints, Index, Indexer, Input, MultiHandle, MultiIndex, TableHandle,
    TableLister,
};
pub use error::{Error, Result};
pub use exec::{DEFAULT_LARGE_SIZE, ExecParams};
pub use expr::{AggOp, Aggregation, BinaryOp, Binding, Builtin, Expr, OrderKey, Rewriter, UnaryOp, Value};
pub use op::Op;
pub use planner::{Query, SelectExpr, SelectItem, new, new_split};
pub use split::{Subtable, TablePart, distribute, split};
pub use stats::{ExecStats, STATS_SYMBOLS, StatsSummary, stats_symtab};
pub use transport::{
    LocalTransport, Transport, TransportDecoder, decode_transport, encode_transport,
    register_transport,
};
pub use tree::{Node, Tree, TypeSet};
pub use vm::{Buffer, CacheStats, MemTable, QuerySink, Row, RowWriter, Table};
pub use wire::{Datum, Symtab};
