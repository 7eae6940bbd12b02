//! Transports and the process-global transport registry.
//!
//! A [`Transport`] carries a subplan to wherever it executes: in-process
//! for [`LocalTransport`], across the network for host-provided remotes.
//! Transports serialize as a struct whose *first* field is `type: <name>`;
//! decoding reads the name, asks the registry for a fresh
//! [`TransportDecoder`], feeds it the remaining fields, and finishes it
//! into a live transport.
//!
//! Hosts register their transports once at startup with
//! [`register_transport`]; the registry is a single mutex-guarded map and
//! the built-in `local` transport is always present.

use crate::error::{Error, Result};
use crate::exec::ExecParams;
use crate::tree::Tree;
use crate::vm::QuerySink;
use crate::wire::{Datum, Symtab};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

/// Carries a plan to a peer and executes it there.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// The registry name this transport serializes under.
    fn name(&self) -> &str;

    /// Append this transport's own fields; the caller has already written
    /// the `type` discriminator.
    fn encode_body(&self, st: &mut Symtab, fields: &mut Vec<(u32, Datum)>) -> Result<()>;

    /// Execute `tree`, writing output rows into `dst` and folding
    /// statistics into `ep`.
    fn exec(&self, tree: &Tree, dst: Arc<dyn QuerySink>, ep: &mut ExecParams) -> Result<()>;
}

/// A fresh decoder produced by a registered factory. Fields arrive in wire
/// order; unknown fields are errors.
pub trait TransportDecoder: Send {
    fn set_field(&mut self, name: &str, value: &Datum) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<Arc<dyn Transport>>;
}

/// Produces a fresh decoder for one transport type.
pub type TransportFactory = fn() -> Box<dyn TransportDecoder>;

static REGISTRY: LazyLock<Mutex<HashMap<String, TransportFactory>>> = LazyLock::new(|| {
    let mut m: HashMap<String, TransportFactory> = HashMap::new();
    m.insert("local".to_string(), || Box::new(LocalDecoder::default()));
    Mutex::new(m)
});

/// Register (or replace) a transport decoder factory under `name`.
pub fn register_transport(name: &str, factory: TransportFactory) {
    REGISTRY
        .lock()
        .unwrap()
        .insert(name.to_string(), factory);
}

/// Serialize a transport as `{ type: <name>, ...body }`.
pub fn encode_transport(t: &dyn Transport, st: &mut Symtab) -> Result<Datum> {
    let mut fields = vec![(st.intern("type"), Datum::Sym(st.intern(t.name())))];
    t.encode_body(st, &mut fields)?;
    Ok(Datum::Struct(fields))
}

/// Decode a transport previously encoded by [`encode_transport`].
pub fn decode_transport(st: &Symtab, d: &Datum) -> Result<Arc<dyn Transport>> {
    let fields = d
        .as_struct()
        .ok_or_else(|| Error::Corrupt("transport must be a struct".into()))?;
    let Some(((first_sym, first_val), rest)) = fields.split_first() else {
        return Err(Error::Corrupt("transport struct is empty".into()));
    };
    if st.name(*first_sym) != Some("type") {
        return Err(Error::Corrupt(
            "transport struct must begin with its type".into(),
        ));
    }
    let name = first_val
        .as_text(st)
        .ok_or_else(|| Error::Corrupt("transport type must be a symbol".into()))?;
    let factory = {
        let reg = REGISTRY.lock().unwrap();
        reg.get(name)
            .copied()
            .ok_or_else(|| Error::UnknownTransport(name.to_string()))?
    };
    let mut dec = factory();
    for (sym, val) in rest {
        let fname = st
            .name(*sym)
            .ok_or_else(|| Error::Corrupt(format!("unresolved symbol {sym}")))?;
        dec.set_field(fname, val)?;
    }
    dec.finish()
}

/// Executes a plan entirely in-process. `threads` bounds the parallelism
/// of the execution; zero means "inherit the caller's bound".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalTransport {
    pub threads: usize,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self { threads: 0 }
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    fn encode_body(&self, st: &mut Symtab, fields: &mut Vec<(u32, Datum)>) -> Result<()> {
        fields.push((st.intern("threads"), Datum::Int(self.threads as i64)));
        Ok(())
    }

    fn exec(&self, tree: &Tree, dst: Arc<dyn QuerySink>, ep: &mut ExecParams) -> Result<()> {
        let saved = ep.parallel;
        if self.threads > 0 {
            ep.parallel = self.threads;
        }
        let res = tree.exec(dst, ep);
        ep.parallel = saved;
        res
    }
}

#[derive(Default)]
struct LocalDecoder {
    threads: usize,
}

impl TransportDecoder for LocalDecoder {
    fn set_field(&mut self, name: &str, value: &Datum) -> Result<()> {
        match name {
            "threads" => {
                let v = value
                    .as_int()
                    .ok_or_else(|| Error::Corrupt("threads must be an int".into()))?;
                self.threads = usize::try_from(v)
                    .map_err(|_| Error::Corrupt("threads out of range".into()))?;
            }
            _ => return Err(Error::UnexpectedField(name.to_string())),
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(LocalTransport {
            threads: self.threads,
        }))
    }
}
