//! Expression AST, constants, and rewriting.
//!
//! This module defines:
//! - [`Value`]: the constant/row value model. Integers and floats stay
//!   distinct, struct field order is preserved, and [`Value::Bytes`] exists
//!   for row data but is rejected by constant lowering.
//! - [`Expr`]: the expression tree operators carry -- constants, field
//!   paths, unary/binary operators, list membership, builtin calls, and
//!   (pre-lowering only) subqueries.
//! - [`Builtin`]: placeholder and table-reference builtins. The
//!   `*_REPLACEMENT` family is installed by the planner and lowered to
//!   constants during execution; `PARTITION_VALUE` is rewritten per
//!   partition; `TABLE_GLOB`/`TABLE_PATTERN` only appear in table position.
//! - [`Rewriter`] + [`rewrite`]: a post-order walk-with-rewrite.
//! - [`simplify`]: algebraic constant folding applied after every rewrite
//!   so interpolated constants propagate (`1 IN (1, 2, 3)` folds to `TRUE`).

use crate::error::{Error, Result};
use crate::planner::Query;
use crate::wire::{Datum, Symtab};
use ordered_float::OrderedFloat;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A constant or row value.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Raw bytes. Valid in rows; not representable as an expression
    /// constant.
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Ordered named fields.
    Struct(Vec<(String, Value)>),
}

impl Value {
    /// Verify that this value (recursively) can stand as an expression
    /// constant. Byte blobs cannot.
    pub fn into_constant(self) -> Result<Value> {
        match &self {
            Value::Bytes(_) => Err(Error::NotConstant("byte blob".into())),
            Value::List(items) => {
                for v in items {
                    v.clone().into_constant()?;
                }
                Ok(self)
            }
            Value::Struct(fields) => {
                for (_, v) in fields {
                    v.clone().into_constant()?;
                }
                Ok(self)
            }
            _ => Ok(self),
        }
    }

    /// Total order across all values: nulls first, then booleans, numbers
    /// (integers and floats compared numerically), strings, bytes, lists,
    /// structs.
    pub fn compare(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Int(_) | Value::Float(_) => 2,
                Value::Str(_) => 3,
                Value::Bytes(_) => 4,
                Value::List(_) => 5,
                Value::Struct(_) => 6,
            }
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(a), Value::Float(b)) => OrderedFloat(*a as f64).cmp(&OrderedFloat(*b)),
            (Value::Float(a), Value::Int(b)) => OrderedFloat(*a).cmp(&OrderedFloat(*b as f64)),
            (Value::Float(a), Value::Float(b)) => OrderedFloat(*a).cmp(&OrderedFloat(*b)),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let c = x.compare(y);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Struct(a), Value::Struct(b)) => {
                for ((na, va), (nb, vb)) in a.iter().zip(b.iter()) {
                    let c = na.cmp(nb).then_with(|| va.compare(vb));
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => rank(self).cmp(&rank(other)),
        }
    }

    pub fn to_datum(&self, st: &mut Symtab) -> Datum {
        match self {
            Value::Null => Datum::Null,
            Value::Bool(b) => Datum::Bool(*b),
            Value::Int(i) => Datum::Int(*i),
            Value::Float(f) => Datum::Float(*f),
            Value::Str(s) => Datum::Str(s.clone()),
            Value::Bytes(b) => Datum::Bytes(b.clone()),
            Value::List(items) => Datum::List(items.iter().map(|v| v.to_datum(st)).collect()),
            Value::Struct(fields) => Datum::Struct(
                fields
                    .iter()
                    .map(|(n, v)| (st.intern(n), v.to_datum(st)))
                    .collect(),
            ),
        }
    }

    pub fn from_datum(d: &Datum, st: &Symtab) -> Result<Value> {
        Ok(match d {
            Datum::Null => Value::Null,
            Datum::Bool(b) => Value::Bool(*b),
            Datum::Int(i) => Value::Int(*i),
            Datum::Float(f) => Value::Float(*f),
            Datum::Str(s) => Value::Str(s.clone()),
            Datum::Sym(id) => Value::Str(
                st.name(*id)
                    .ok_or_else(|| Error::Corrupt(format!("unresolved symbol {id}")))?
                    .to_string(),
            ),
            Datum::Bytes(b) => Value::Bytes(b.clone()),
            Datum::List(items) => Value::List(
                items
                    .iter()
                    .map(|d| Value::from_datum(d, st))
                    .collect::<Result<_>>()?,
            ),
            Datum::Struct(fields) => Value::Struct(
                fields
                    .iter()
                    .map(|(sym, d)| {
                        let name = st
                            .name(*sym)
                            .ok_or_else(|| Error::Corrupt(format!("unresolved symbol {sym}")))?;
                        Ok((name.to_string(), Value::from_datum(d, st)?))
                    })
                    .collect::<Result<_>>()?,
            ),
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => OrderedFloat(*a) == OrderedFloat(*b),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => OrderedFloat(*f).hash(state),
            Value::Str(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::List(items) => items.hash(state),
            Value::Struct(fields) => fields.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "0x{}", hex(b)),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Struct(fields) => {
                write!(f, "{{")?;
                for (i, (n, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{n}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

fn hex(b: &[u8]) -> String {
    b.iter().map(|x| format!("{x:02x}")).collect()
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl UnaryOp {
    fn name(self) -> &'static str {
        match self {
            UnaryOp::Not => "not",
            UnaryOp::Neg => "neg",
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "not" => UnaryOp::Not,
            "neg" => UnaryOp::Neg,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Eq => "eq",
            BinaryOp::Ne => "ne",
            BinaryOp::Lt => "lt",
            BinaryOp::Le => "le",
            BinaryOp::Gt => "gt",
            BinaryOp::Ge => "ge",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "add" => BinaryOp::Add,
            "sub" => BinaryOp::Sub,
            "mul" => BinaryOp::Mul,
            "div" => BinaryOp::Div,
            "eq" => BinaryOp::Eq,
            "ne" => BinaryOp::Ne,
            "lt" => BinaryOp::Lt,
            "le" => BinaryOp::Le,
            "gt" => BinaryOp::Gt,
            "ge" => BinaryOp::Ge,
            "and" => BinaryOp::And,
            "or" => BinaryOp::Or,
            _ => return None,
        })
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }
}

/// Builtin functions that may appear in plan expressions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    ScalarReplacement,
    ListReplacement,
    StructReplacement,
    InReplacement,
    HashReplacement,
    HashLookup,
    PartitionValue,
    TableGlob,
    TablePattern,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::ScalarReplacement => "SCALAR_REPLACEMENT",
            Builtin::ListReplacement => "LIST_REPLACEMENT",
            Builtin::StructReplacement => "STRUCT_REPLACEMENT",
            Builtin::InReplacement => "IN_REPLACEMENT",
            Builtin::HashReplacement => "HASH_REPLACEMENT",
            Builtin::HashLookup => "HASH_LOOKUP",
            Builtin::PartitionValue => "PARTITION_VALUE",
            Builtin::TableGlob => "TABLE_GLOB",
            Builtin::TablePattern => "TABLE_PATTERN",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "SCALAR_REPLACEMENT" => Builtin::ScalarReplacement,
            "LIST_REPLACEMENT" => Builtin::ListReplacement,
            "STRUCT_REPLACEMENT" => Builtin::StructReplacement,
            "IN_REPLACEMENT" => Builtin::InReplacement,
            "HASH_REPLACEMENT" => Builtin::HashReplacement,
            "HASH_LOOKUP" => Builtin::HashLookup,
            "PARTITION_VALUE" => Builtin::PartitionValue,
            "TABLE_GLOB" => Builtin::TableGlob,
            "TABLE_PATTERN" => Builtin::TablePattern,
            _ => return None,
        })
    }
}

/// One expression node.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Const(Value),
    /// Dotted field path (`a.b.c`). Also used for table references.
    Path(Vec<String>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// List membership: `value IN (set...)`.
    Member(Box<Expr>, Vec<Expr>),
    Call(Builtin, Vec<Expr>),
    /// Scalar subquery. Lowered away by the planner; never encoded.
    Subquery(Box<Query>),
    /// `value IN (subquery)`. Lowered away by the planner; never encoded.
    InSubquery(Box<Expr>, Box<Query>),
}

impl Expr {
    pub fn path(parts: &[&str]) -> Expr {
        Expr::Path(parts.iter().map(|s| s.to_string()).collect())
    }

    pub fn int(v: i64) -> Expr {
        Expr::Const(Value::Int(v))
    }

    pub fn string(v: &str) -> Expr {
        Expr::Const(Value::Str(v.to_string()))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn call(func: Builtin, args: Vec<Expr>) -> Expr {
        Expr::Call(func, args)
    }

    /// Walk the tree, visiting every node.
    pub fn walk(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Unary(_, a) => a.walk(f),
            Expr::Binary(_, l, r) => {
                l.walk(f);
                r.walk(f);
            }
            Expr::Member(v, set) => {
                v.walk(f);
                for e in set {
                    e.walk(f);
                }
            }
            Expr::Call(_, args) => {
                for e in args {
                    e.walk(f);
                }
            }
            Expr::InSubquery(v, _) => v.walk(f),
            Expr::Const(_) | Expr::Path(_) | Expr::Subquery(_) => {}
        }
    }

    pub fn to_datum(&self, st: &mut Symtab) -> Result<Datum> {
        let tag = |st: &mut Symtab, t: &str| (st.intern("type"), Datum::Sym(st.intern(t)));
        Ok(match self {
            Expr::Const(v) => {
                let fields = vec![tag(st, "const"), (st.intern("value"), v.to_datum(st))];
                Datum::Struct(fields)
            }
            Expr::Path(parts) => {
                let items = parts.iter().map(|p| Datum::Sym(st.intern(p))).collect();
                let fields = vec![tag(st, "path"), (st.intern("parts"), Datum::List(items))];
                Datum::Struct(fields)
            }
            Expr::Unary(op, arg) => {
                let fields = vec![
                    tag(st, "unop"),
                    (st.intern("op"), Datum::Sym(st.intern(op.name()))),
                    (st.intern("arg"), arg.to_datum(st)?),
                ];
                Datum::Struct(fields)
            }
            Expr::Binary(op, lhs, rhs) => {
                let fields = vec![
                    tag(st, "binop"),
                    (st.intern("op"), Datum::Sym(st.intern(op.name()))),
                    (st.intern("lhs"), lhs.to_datum(st)?),
                    (st.intern("rhs"), rhs.to_datum(st)?),
                ];
                Datum::Struct(fields)
            }
            Expr::Member(value, set) => {
                let items = set
                    .iter()
                    .map(|e| e.to_datum(st))
                    .collect::<Result<Vec<_>>>()?;
                let fields = vec![
                    tag(st, "member"),
                    (st.intern("value"), value.to_datum(st)?),
                    (st.intern("set"), Datum::List(items)),
                ];
                Datum::Struct(fields)
            }
            Expr::Call(func, args) => {
                let items = args
                    .iter()
                    .map(|e| e.to_datum(st))
                    .collect::<Result<Vec<_>>>()?;
                let fields = vec![
                    tag(st, "call"),
                    (st.intern("func"), Datum::Sym(st.intern(func.name()))),
                    (st.intern("args"), Datum::List(items)),
                ];
                Datum::Struct(fields)
            }
            Expr::Subquery(_) | Expr::InSubquery(_, _) => {
                return Err(Error::Corrupt("unlowered subquery in plan expression".into()));
            }
        })
    }

    pub fn from_datum(d: &Datum, st: &Symtab) -> Result<Expr> {
        let fields = d
            .as_struct()
            .ok_or_else(|| Error::Corrupt("expression must be a struct".into()))?;
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
        let tag = tag.ok_or_else(|| Error::Corrupt("expression without type tag".into()))?;
        match tag {
            "const" => {
                let mut value = None;
                for (name, val) in rest {
                    match name {
                        "value" => value = Some(Value::from_datum(val, st)?),
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                Ok(Expr::Const(value.unwrap_or(Value::Null)))
            }
            "path" => {
                let mut parts = Vec::new();
                for (name, val) in rest {
                    match name {
                        "parts" => {
                            for item in val
                                .as_list()
                                .ok_or_else(|| Error::Corrupt("path parts must be a list".into()))?
                            {
                                let part = item.as_text(st).ok_or_else(|| {
                                    Error::Corrupt("path part must be a symbol".into())
                                })?;
                                parts.push(part.to_string());
                            }
                        }
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                Ok(Expr::Path(parts))
            }
            "unop" => {
                let mut op = None;
                let mut arg = None;
                for (name, val) in rest {
                    match name {
                        "op" => {
                            let s = val
                                .as_text(st)
                                .ok_or_else(|| Error::Corrupt("operator must be a symbol".into()))?;
                            op = UnaryOp::from_name(s);
                            if op.is_none() {
                                return Err(Error::Corrupt(format!("unknown unary operator {s:?}")));
                            }
                        }
                        "arg" => arg = Some(Expr::from_datum(val, st)?),
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                match (op, arg) {
                    (Some(op), Some(arg)) => Ok(Expr::Unary(op, Box::new(arg))),
                    _ => Err(Error::Corrupt("incomplete unary expression".into())),
                }
            }
            "binop" => {
                let mut op = None;
                let mut lhs = None;
                let mut rhs = None;
                for (name, val) in rest {
                    match name {
                        "op" => {
                            let s = val
                                .as_text(st)
                                .ok_or_else(|| Error::Corrupt("operator must be a symbol".into()))?;
                            op = BinaryOp::from_name(s);
                            if op.is_none() {
                                return Err(Error::Corrupt(format!("unknown binary operator {s:?}")));
                            }
                        }
                        "lhs" => lhs = Some(Expr::from_datum(val, st)?),
                        "rhs" => rhs = Some(Expr::from_datum(val, st)?),
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                match (op, lhs, rhs) {
                    (Some(op), Some(l), Some(r)) => {
                        Ok(Expr::Binary(op, Box::new(l), Box::new(r)))
                    }
                    _ => Err(Error::Corrupt("incomplete binary expression".into())),
                }
            }
            "member" => {
                let mut value = None;
                let mut set = Vec::new();
                for (name, val) in rest {
                    match name {
                        "value" => value = Some(Expr::from_datum(val, st)?),
                        "set" => {
                            for item in val
                                .as_list()
                                .ok_or_else(|| Error::Corrupt("member set must be a list".into()))?
                            {
                                set.push(Expr::from_datum(item, st)?);
                            }
                        }
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                let value =
                    value.ok_or_else(|| Error::Corrupt("member without value".into()))?;
                Ok(Expr::Member(Box::new(value), set))
            }
            "call" => {
                let mut func = None;
                let mut args = Vec::new();
                for (name, val) in rest {
                    match name {
                        "func" => {
                            let s = val
                                .as_text(st)
                                .ok_or_else(|| Error::Corrupt("func must be a symbol".into()))?;
                            func = Builtin::from_name(s);
                            if func.is_none() {
                                return Err(Error::Corrupt(format!("unknown builtin {s:?}")));
                            }
                        }
                        "args" => {
                            for item in val
                                .as_list()
                                .ok_or_else(|| Error::Corrupt("call args must be a list".into()))?
                            {
                                args.push(Expr::from_datum(item, st)?);
                            }
                        }
                        _ => return Err(Error::UnexpectedField(name.to_string())),
                    }
                }
                let func = func.ok_or_else(|| Error::Corrupt("call without func".into()))?;
                Ok(Expr::Call(func, args))
            }
            other => Err(Error::Corrupt(format!("unknown expression tag {other:?}"))),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{v}"),
            Expr::Path(parts) => write!(f, "{}", parts.join(".")),
            Expr::Unary(UnaryOp::Not, a) => write!(f, "NOT {a}"),
            Expr::Unary(UnaryOp::Neg, a) => write!(f, "-{a}"),
            Expr::Binary(op, l, r) => write!(f, "({l} {} {r})", op.symbol()),
            Expr::Member(v, set) => {
                write!(f, "{v} IN (")?;
                for (i, e) in set.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            Expr::Call(func, args) => {
                write!(f, "{}(", func.name())?;
                for (i, e) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            Expr::Subquery(_) => write!(f, "(subquery)"),
            Expr::InSubquery(v, _) => write!(f, "{v} IN (subquery)"),
        }
    }
}

/// A named expression (`expr AS name`).
#[derive(Clone, Debug, PartialEq)]
pub struct Binding {
    pub expr: Expr,
    pub name: String,
}

impl Binding {
    pub fn new(expr: Expr, name: &str) -> Self {
        Self {
            expr,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} AS {}", self.expr, self.name)
    }
}

/// Aggregate operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggOp {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggOp {
    pub fn name(self) -> &'static str {
        match self {
            AggOp::Count => "count",
            AggOp::Sum => "sum",
            AggOp::Min => "min",
            AggOp::Max => "max",
            AggOp::Avg => "avg",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "count" => AggOp::Count,
            "sum" => AggOp::Sum,
            "min" => AggOp::Min,
            "max" => AggOp::Max,
            "avg" => AggOp::Avg,
            _ => return None,
        })
    }
}

/// One aggregate output column. `expr` is `None` only for `COUNT(*)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregation {
    pub op: AggOp,
    pub expr: Option<Expr>,
    pub name: String,
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.expr {
            Some(e) => write!(f, "{}({e}) AS {}", self.op.name().to_uppercase(), self.name),
            None => write!(f, "{}(*) AS {}", self.op.name().to_uppercase(), self.name),
        }
    }
}

/// One sort key.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderKey {
    pub expr: Expr,
    pub desc: bool,
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.expr, if self.desc { " DESC" } else { "" })
    }
}

/// Expression rewriting hook. Implementations receive each node after its
/// children have been rebuilt and may replace it.
pub trait Rewriter: Send + Sync {
    fn rewrite(&self, e: Expr) -> Result<Expr>;
}

/// Post-order walk-with-rewrite: children first, then the node itself.
/// Subquery payloads are left untouched; they are lowered by the planner
/// before any rewriting happens.
pub fn rewrite(e: Expr, rw: &dyn Rewriter) -> Result<Expr> {
    let e = match e {
        Expr::Unary(op, a) => Expr::Unary(op, Box::new(rewrite(*a, rw)?)),
        Expr::Binary(op, l, r) => {
            Expr::Binary(op, Box::new(rewrite(*l, rw)?), Box::new(rewrite(*r, rw)?))
        }
        Expr::Member(v, set) => Expr::Member(
            Box::new(rewrite(*v, rw)?),
            set.into_iter()
                .map(|e| rewrite(e, rw))
                .collect::<Result<_>>()?,
        ),
        Expr::Call(func, args) => Expr::Call(
            func,
            args.into_iter()
                .map(|e| rewrite(e, rw))
                .collect::<Result<_>>()?,
        ),
        other => other,
    };
    rw.rewrite(e)
}

/// Fold constants through an expression. Applied after every rewrite so
/// interpolated replacement constants keep propagating outward.
pub fn simplify(e: Expr) -> Expr {
    match e {
        Expr::Unary(op, a) => {
            let a = simplify(*a);
            match (op, &a) {
                (UnaryOp::Not, Expr::Const(Value::Bool(b))) => Expr::Const(Value::Bool(!b)),
                (UnaryOp::Not, Expr::Const(Value::Null)) => Expr::Const(Value::Null),
                (UnaryOp::Neg, Expr::Const(Value::Int(i))) => match i.checked_neg() {
                    Some(n) => Expr::Const(Value::Int(n)),
                    None => Expr::Unary(op, Box::new(a)),
                },
                (UnaryOp::Neg, Expr::Const(Value::Float(f))) => Expr::Const(Value::Float(-f)),
                _ => Expr::Unary(op, Box::new(a)),
            }
        }
        Expr::Binary(op, l, r) => {
            let l = simplify(*l);
            let r = simplify(*r);
            fold_binary(op, l, r)
        }
        Expr::Member(v, set) => {
            let v = simplify(*v);
            let set: Vec<Expr> = set.into_iter().map(simplify).collect();
            if set.is_empty() {
                return Expr::Const(Value::Bool(false));
            }
            if let Expr::Const(val) = &v {
                if set.iter().all(|e| matches!(e, Expr::Const(_))) {
                    let found = set.iter().any(|e| match e {
                        Expr::Const(c) => val.compare(c) == Ordering::Equal,
                        _ => false,
                    });
                    return Expr::Const(Value::Bool(found));
                }
            }
            Expr::Member(Box::new(v), set)
        }
        Expr::Call(Builtin::HashLookup, args) => {
            let args: Vec<Expr> = args.into_iter().map(simplify).collect();
            if let Some((Expr::Const(key), pairs)) = args.split_first() {
                if pairs.len().is_multiple_of(2)
                    && pairs.iter().all(|e| matches!(e, Expr::Const(_)))
                {
                    for kv in pairs.chunks_exact(2) {
                        if let (Expr::Const(k), Expr::Const(v)) = (&kv[0], &kv[1])
                            && key.compare(k) == Ordering::Equal
                        {
                            return Expr::Const(v.clone());
                        }
                    }
                    return Expr::Const(Value::Null);
                }
            }
            Expr::Call(Builtin::HashLookup, args)
        }
        Expr::Call(func, args) => Expr::Call(func, args.into_iter().map(simplify).collect()),
        other => other,
    }
}

fn fold_binary(op: BinaryOp, l: Expr, r: Expr) -> Expr {
    use BinaryOp::*;
    let is_bool = |e: &Expr, want: bool| matches!(e, Expr::Const(Value::Bool(b)) if *b == want);
    // boolean short circuits first; they apply with one constant side
    match op {
        And => {
            if is_bool(&l, false) || is_bool(&r, false) {
                return Expr::Const(Value::Bool(false));
            }
            if is_bool(&l, true) {
                return r;
            }
            if is_bool(&r, true) {
                return l;
            }
        }
        Or => {
            if is_bool(&l, true) || is_bool(&r, true) {
                return Expr::Const(Value::Bool(true));
            }
            if is_bool(&l, false) {
                return r;
            }
            if is_bool(&r, false) {
                return l;
            }
        }
        _ => {}
    }
    let (a, b) = match (&l, &r) {
        (Expr::Const(a), Expr::Const(b)) => (a, b),
        _ => return Expr::Binary(op, Box::new(l), Box::new(r)),
    };
    if matches!(a, Value::Null) || matches!(b, Value::Null) {
        return Expr::Const(Value::Null);
    }
    let folded = match op {
        Add | Sub | Mul | Div => arith(op, a, b),
        Eq => Some(Value::Bool(a.compare(b) == Ordering::Equal)),
        Ne => Some(Value::Bool(a.compare(b) != Ordering::Equal)),
        Lt => Some(Value::Bool(a.compare(b) == Ordering::Less)),
        Le => Some(Value::Bool(a.compare(b) != Ordering::Greater)),
        Gt => Some(Value::Bool(a.compare(b) == Ordering::Greater)),
        Ge => Some(Value::Bool(a.compare(b) != Ordering::Less)),
        And | Or => None,
    };
    match folded {
        Some(v) => Expr::Const(v),
        None => Expr::Binary(op, Box::new(l), Box::new(r)),
    }
}

pub(crate) fn arith(op: BinaryOp, a: &Value, b: &Value) -> Option<Value> {
    use BinaryOp::*;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => match op {
            Add => x.checked_add(*y).map(Value::Int),
            Sub => x.checked_sub(*y).map(Value::Int),
            Mul => x.checked_mul(*y).map(Value::Int),
            Div => {
                if *y == 0 {
                    None
                } else {
                    x.checked_div(*y).map(Value::Int)
                }
            }
            _ => None,
        },
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let x = as_f64(a)?;
            let y = as_f64(b)?;
            let v = match op {
                Add => x + y,
                Sub => x - y,
                Mul => x * y,
                Div => {
                    if y == 0.0 {
                        return None;
                    }
                    x / y
                }
                _ => return None,
            };
            Some(Value::Float(v))
        }
        _ => None,
    }
}

pub(crate) fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}
