//! Executable plan trees.
//!
//! A [`Tree`] owns the table inputs and the root [`Node`]; a node holds an
//! operator chain plus the index of the input it scans (`None` for chains
//! that read nothing). Substitute operators nest further nodes whose input
//! indexes point into the *same* tree-level input list, which is what lets
//! [`Tree::max_scanned`] stay a simple sum over distinct reachable inputs.
//!
//! Plans serialize as a symbol table followed by one self-describing
//! struct (see [`crate::wire`]); handles are opaque and round-trip through
//! the environment's [`HandleDecoder`].

use crate::env::{HandleDecoder, Input};
use crate::error::{Error, Result};
use crate::exec::ExecParams;
use crate::op::Op;
use crate::vm::QuerySink;
use crate::wire::{Datum, Symtab};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Bitset of the value types a node or result column may produce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TypeSet(pub u16);

impl TypeSet {
    pub const NULL: TypeSet = TypeSet(1 << 0);
    pub const BOOL: TypeSet = TypeSet(1 << 1);
    pub const INT: TypeSet = TypeSet(1 << 2);
    pub const FLOAT: TypeSet = TypeSet(1 << 3);
    pub const STRING: TypeSet = TypeSet(1 << 4);
    pub const BYTES: TypeSet = TypeSet(1 << 5);
    pub const LIST: TypeSet = TypeSet(1 << 6);
    pub const STRUCT: TypeSet = TypeSet(1 << 7);

    /// Every type: nothing is known about the output.
    pub fn any() -> TypeSet {
        TypeSet(0xff)
    }

    pub fn union(self, other: TypeSet) -> TypeSet {
        TypeSet(self.0 | other.0)
    }

    pub fn contains(self, other: TypeSet) -> bool {
        self.0 & other.0 == other.0
    }
}

/// One step of a plan: an operator chain over an optional input.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// Head of the operator chain (the last step in execution order).
    pub op: Op,
    /// Index into the owning tree's inputs; `None` when the chain scans
    /// nothing.
    pub input: Option<usize>,
    /// Value types this node may emit.
    pub output_type: TypeSet,
}

impl Node {
    pub fn new(op: Op, input: Option<usize>) -> Self {
        Self {
            op,
            input,
            output_type: TypeSet::any(),
        }
    }

    pub fn to_datum(&self, st: &mut Symtab) -> Result<Datum> {
        let mut fields = vec![(st.intern("op"), self.op.to_datum(st)?)];
        if let Some(i) = self.input {
            fields.push((st.intern("input"), Datum::Int(i as i64)));
        }
        fields.push((
            st.intern("output_type"),
            Datum::Int(i64::from(self.output_type.0)),
        ));
        Ok(Datum::Struct(fields))
    }

    pub fn from_datum(d: &Datum, st: &Symtab) -> Result<Node> {
        let fields = d
            .as_struct()
            .ok_or_else(|| Error::Corrupt("node must be a struct".into()))?;
        let mut op = None;
        let mut input = None;
        let mut output_type = TypeSet::any();
        for (sym, val) in fields {
            let name = st
                .name(*sym)
                .ok_or_else(|| Error::Corrupt(format!("unresolved symbol {sym}")))?;
            match name {
                "op" => op = Some(Op::from_datum(val, st)?),
                "input" => {
                    let v = val
                        .as_int()
                        .ok_or_else(|| Error::Corrupt("input must be an int".into()))?;
                    if v >= 0 {
                        input = Some(v as usize);
                    }
                }
                "output_type" => {
                    let v = val
                        .as_int()
                        .ok_or_else(|| Error::Corrupt("output_type must be an int".into()))?;
                    output_type = TypeSet(
                        u16::try_from(v)
                            .map_err(|_| Error::Corrupt("output_type out of range".into()))?,
                    );
                }
                _ => return Err(Error::UnexpectedField(name.to_string())),
            }
        }
        Ok(Node {
            op: op.ok_or_else(|| Error::Corrupt("node without op".into()))?,
            input,
            output_type,
        })
    }

    /// Execute this node's chain into `dst`.
    pub(crate) fn exec(
        &self,
        dst: Arc<dyn QuerySink>,
        ctx: &ExecCtx<'_>,
        ep: &mut ExecParams,
    ) -> Result<()> {
        self.op.exec(dst, self.input, ctx, ep)
    }

    fn collect_inputs(&self, into: &mut BTreeSet<usize>) {
        fn walk_op(op: &Op, node_input: Option<usize>, into: &mut BTreeSet<usize>) {
            if let Op::Substitute { inner, .. } = op {
                for n in inner {
                    n.collect_inputs(into);
                }
            }
            match op.input() {
                Some(from) => walk_op(from, node_input, into),
                None => {
                    // the terminal scan is what touches the input
                    if matches!(op, Op::Leaf)
                        && let Some(i) = node_input
                    {
                        into.insert(i);
                    }
                }
            }
        }
        walk_op(&self.op, self.input, into);
    }
}

/// Execution context shared down one plan walk.
pub(crate) struct ExecCtx<'a> {
    pub id: &'a str,
    pub inputs: &'a [Input],
}

/// The root of an executable plan.
pub struct Tree {
    /// Stable identifier, derived from the plan content.
    pub id: String,
    /// Table inputs, shared by index across nodes.
    pub inputs: Vec<Input>,
    /// Opaque host data carried alongside the plan.
    pub data: Option<Datum>,
    pub root: Node,
    /// Output column names, in order.
    pub results: Vec<String>,
    /// Per-result-column type sets, parallel to `results`.
    pub result_types: Vec<TypeSet>,
}

impl Tree {
    /// Upper bound on the bytes a full execution may scan: the sum of the
    /// sizes of every distinct input reachable from the root, including
    /// inputs referenced only by substitute subqueries.
    pub fn max_scanned(&self) -> i64 {
        let mut seen = BTreeSet::new();
        self.root.collect_inputs(&mut seen);
        seen.iter()
            .filter_map(|&i| self.inputs.get(i))
            .map(|inp| inp.size().max(0))
            .sum()
    }

    /// Execute the plan in-process, writing output rows into `dst`.
    pub fn exec(&self, dst: Arc<dyn QuerySink>, ep: &mut ExecParams) -> Result<()> {
        let ctx = ExecCtx {
            id: &self.id,
            inputs: &self.inputs,
        };
        self.root.exec(dst, &ctx, ep)
    }

    pub fn to_datum(&self, st: &mut Symtab) -> Result<Datum> {
        let mut fields = vec![(st.intern("id"), Datum::Str(self.id.clone()))];
        let inputs = self
            .inputs
            .iter()
            .map(|i| i.encode(st))
            .collect::<Result<Vec<_>>>()?;
        fields.push((st.intern("inputs"), Datum::List(inputs)));
        if let Some(d) = &self.data {
            fields.push((st.intern("data"), d.clone()));
        }
        fields.push((st.intern("root"), self.root.to_datum(st)?));
        fields.push((
            st.intern("results"),
            Datum::List(self.results.iter().map(|r| Datum::Str(r.clone())).collect()),
        ));
        fields.push((
            st.intern("result_types"),
            Datum::List(
                self.result_types
                    .iter()
                    .map(|t| Datum::Int(i64::from(t.0)))
                    .collect(),
            ),
        ));
        Ok(Datum::Struct(fields))
    }

    pub fn from_datum(d: &Datum, st: &Symtab, dec: &dyn HandleDecoder) -> Result<Tree> {
        let fields = d
            .as_struct()
            .ok_or_else(|| Error::Corrupt("plan must be a struct".into()))?;
        let mut id = None;
        let mut inputs = Vec::new();
        let mut data = None;
        let mut root = None;
        let mut results = Vec::new();
        let mut result_types = Vec::new();
        for (sym, val) in fields {
            let name = st
                .name(*sym)
                .ok_or_else(|| Error::Corrupt(format!("unresolved symbol {sym}")))?;
            match name {
                "id" => id = val.as_text(st).map(str::to_string),
                "inputs" => {
                    for item in val
                        .as_list()
                        .ok_or_else(|| Error::Corrupt("inputs must be a list".into()))?
                    {
                        inputs.push(Input::decode(st, item, dec)?);
                    }
                }
                "data" => data = Some(val.clone()),
                "root" => root = Some(Node::from_datum(val, st)?),
                "results" => {
                    for item in val
                        .as_list()
                        .ok_or_else(|| Error::Corrupt("results must be a list".into()))?
                    {
                        let s = item
                            .as_text(st)
                            .ok_or_else(|| Error::Corrupt("result must be a string".into()))?;
                        results.push(s.to_string());
                    }
                }
                "result_types" => {
                    for item in val
                        .as_list()
                        .ok_or_else(|| Error::Corrupt("result_types must be a list".into()))?
                    {
                        let v = item
                            .as_int()
                            .ok_or_else(|| Error::Corrupt("result type must be an int".into()))?;
                        result_types.push(TypeSet(
                            u16::try_from(v)
                                .map_err(|_| Error::Corrupt("result type out of range".into()))?,
                        ));
                    }
                }
                _ => return Err(Error::UnexpectedField(name.to_string())),
            }
        }
        let root = root.ok_or_else(|| Error::Corrupt("plan without root".into()))?;
        // node input indexes must land inside the input list
        validate_inputs(&root, inputs.len())?;
        Ok(Tree {
            id: id.unwrap_or_default(),
            inputs,
            data,
            root,
            results,
            result_types,
        })
    }

    /// Serialize: symbol table, then the plan struct.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut st = Symtab::new();
        let mut body = Vec::new();
        self.to_datum(&mut st)?.encode(&mut body);
        let mut out = Vec::with_capacity(body.len() + 64);
        st.encode(&mut out);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a plan serialized by [`Tree::to_bytes`].
    pub fn from_bytes(bytes: &[u8], dec: &dyn HandleDecoder) -> Result<Tree> {
        let mut src = bytes;
        let st = Symtab::decode(&mut src)?;
        let d = Datum::decode(&mut src)?;
        Tree::from_datum(&d, &st, dec)
    }
}

fn validate_inputs(node: &Node, len: usize) -> Result<()> {
    if let Some(i) = node.input
        && i >= len
    {
        return Err(Error::Corrupt(format!("input {i} out of range ({len})")));
    }
    fn walk(op: &Op, len: usize) -> Result<()> {
        if let Op::Substitute { inner, .. } = op {
            for n in inner {
                validate_inputs(n, len)?;
            }
        }
        match op.input() {
            Some(from) => walk(from, len),
            None => Ok(()),
        }
    }
    walk(&node.op, len)
}

/// Derive a plan id from the content hash of the encoded root.
pub(crate) fn derive_id(root: &Node) -> Result<String> {
    let mut st = Symtab::new();
    let mut buf = Vec::new();
    root.to_datum(&mut st)?.encode(&mut buf);
    let digest = Sha256::digest(&buf);
    let mut id = String::with_capacity(16);
    for b in &digest[..8] {
        id.push_str(&format!("{b:02x}"));
    }
    Ok(id)
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "t{i} = {}", input.table)?;
        }
        self.root.op.describe(f, self.root.input, 0)
    }
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tree({})\n{self}", self.id)
    }
}
