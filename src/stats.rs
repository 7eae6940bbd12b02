//! Execution statistics.
//!
//! Counters only ever increase during one execution; fan-out folds child
//! counters into the parent with atomic adds. The wire encoding is a
//! struct with the non-zero fields only, keyed through a process-wide
//! preloaded symbol table so a stats frame costs a handful of bytes.

use crate::error::{Error, Result};
use crate::vm::Table;
use crate::wire::{Datum, Symtab};
use serde::Serialize;
use std::path::Path;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Symbols every stats frame uses, in preload order.
pub const STATS_SYMBOLS: [&str; 3] = ["hits", "misses", "scanned"];

static PRELOADED: LazyLock<Symtab> = LazyLock::new(|| Symtab::preloaded(&STATS_SYMBOLS));

/// A symbol table pre-seeded for stats frames.
pub fn stats_symtab() -> Symtab {
    PRELOADED.clone()
}

/// Aggregated execution counters.
#[derive(Debug, Default)]
pub struct ExecStats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub bytes_scanned: AtomicU64,
}

impl ExecStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `other` into `self`.
    pub fn atomic_add(&self, other: &ExecStats) {
        self.cache_hits
            .fetch_add(other.cache_hits.load(Ordering::Relaxed), Ordering::Relaxed);
        self.cache_misses.fetch_add(
            other.cache_misses.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        self.bytes_scanned.fetch_add(
            other.bytes_scanned.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
    }

    pub fn add_scanned(&self, n: u64) {
        self.bytes_scanned.fetch_add(n, Ordering::Relaxed);
    }

    /// Fold the cache counters a table exposes, if any.
    pub fn observe(&self, table: &dyn Table) {
        if let Some(cs) = table.cached() {
            self.cache_hits.fetch_add(cs.hits, Ordering::Relaxed);
            self.cache_misses.fetch_add(cs.misses, Ordering::Relaxed);
        }
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
        }
    }

    /// Encode as a struct carrying only the non-zero counters.
    pub fn encode(&self, st: &mut Symtab) -> Datum {
        let s = self.summary();
        let mut fields = Vec::new();
        if s.cache_hits != 0 {
            fields.push((st.intern("hits"), Datum::Int(s.cache_hits as i64)));
        }
        if s.cache_misses != 0 {
            fields.push((st.intern("misses"), Datum::Int(s.cache_misses as i64)));
        }
        if s.bytes_scanned != 0 {
            fields.push((st.intern("scanned"), Datum::Int(s.bytes_scanned as i64)));
        }
        Datum::Struct(fields)
    }

    pub fn decode(st: &Symtab, d: &Datum) -> Result<ExecStats> {
        let fields = d
            .as_struct()
            .ok_or_else(|| Error::Corrupt("stats must be a struct".into()))?;
        let out = ExecStats::new();
        for (sym, val) in fields {
            let name = st
                .name(*sym)
                .ok_or_else(|| Error::Corrupt(format!("unresolved symbol {sym}")))?;
            let v = val
                .as_int()
                .ok_or_else(|| Error::Corrupt(format!("stats field {name:?} must be an int")))?
                as u64;
            match name {
                "hits" => out.cache_hits.store(v, Ordering::Relaxed),
                "misses" => out.cache_misses.store(v, Ordering::Relaxed),
                "scanned" => out.bytes_scanned.store(v, Ordering::Relaxed),
                _ => return Err(Error::UnexpectedField(name.to_string())),
            }
        }
        Ok(out)
    }
}

/// A plain snapshot of [`ExecStats`], for assertions and reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub bytes_scanned: u64,
}

impl StatsSummary {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!(self)
    }

    /// Write the snapshot as pretty JSON.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let f = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(f, self)
            .map_err(|e| Error::Env(format!("serialize stats: {e}")))?;
        Ok(())
    }
}
