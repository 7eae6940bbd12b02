//! Crate-wide error type.
//!
//! Most variants are sentinels the rest of the crate matches on: glob
//! expansion skips [`Error::NotFound`] per member, the plan decoder rejects
//! unknown structure with [`Error::UnexpectedField`] / [`Error::UnknownOp`],
//! and the substitution engine reports oversized or non-constant
//! replacements with dedicated variants.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by planning, decoding, and execution.
#[derive(Error, Debug)]
pub enum Error {
    /// A table reference did not resolve. Glob expansion skips this error
    /// per candidate and only surfaces it when no candidate survives.
    #[error("table {0:?} does not exist")]
    NotFound(String),

    /// The decoder met a struct field it does not understand.
    #[error("unexpected field {0:?}")]
    UnexpectedField(String),

    /// The decoder met an operator tag it does not understand.
    #[error("unknown operator {0:?}")]
    UnknownOp(String),

    /// No transport is registered under this name.
    #[error("unknown transport {0:?}")]
    UnknownTransport(String),

    /// The binary input ended in the middle of a value.
    #[error("truncated input")]
    Truncated,

    /// Structurally invalid plan or wire data.
    #[error("malformed plan: {0}")]
    Corrupt(String),

    /// A subquery produced more rows than one replacement may hold.
    #[error("replacement would exceed {0} rows")]
    ReplacementTooLarge(usize),

    /// A collected row cannot be lowered into an expression constant.
    #[error("value cannot be used as a constant: {0}")]
    NotConstant(String),

    /// UNION PARTITION was applied to a handle that does not partition.
    #[error("handle does not support partitioning on {0:?}")]
    NotPartitioned(String),

    /// The environment does not provide a required capability.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An environment or table error that is not otherwise classified.
    #[error("{0}")]
    Env(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True if this error means "the referenced table is absent", the only
    /// error kind glob expansion tolerates per member.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
