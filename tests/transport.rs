use anyhow::Result;
use std::sync::Arc;
use trestle::testing::{MemEnv, row};
use trestle::{
    Buffer, Datum, Error, ExecParams, Expr, LocalTransport, Query, Symtab, Transport,
    TransportDecoder, Tree, Value, decode_transport, encode_transport, new, register_transport,
};

fn encode_fresh(t: &dyn Transport) -> Result<(Symtab, Datum)> {
    let mut st = Symtab::new();
    let d = encode_transport(t, &mut st)?;
    Ok((st, d))
}

#[test]
fn local_transport_round_trips() -> Result<()> {
    let orig = LocalTransport { threads: 7 };
    let (st, d) = encode_fresh(&orig)?;
    let back = decode_transport(&st, &d)?;
    assert_eq!(back.name(), "local");

    // structural round trip: re-encoding gives the identical datum
    let (_, d2) = encode_fresh(back.as_ref())?;
    assert_eq!(d2, d);
    Ok(())
}

#[test]
fn unknown_transport_is_rejected() {
    let mut st = Symtab::new();
    let d = Datum::Struct(vec![(
        st.intern("type"),
        Datum::Sym(st.intern("carrier-pigeon")),
    )]);
    let err = decode_transport(&st, &d).unwrap_err();
    assert!(matches!(err, Error::UnknownTransport(n) if n == "carrier-pigeon"));
}

#[test]
fn transport_type_must_come_first() {
    let mut st = Symtab::new();
    let d = Datum::Struct(vec![
        (st.intern("threads"), Datum::Int(2)),
        (st.intern("type"), Datum::Sym(st.intern("local"))),
    ]);
    assert!(decode_transport(&st, &d).is_err());
}

#[test]
fn transport_rejects_unknown_fields() {
    let mut st = Symtab::new();
    let d = Datum::Struct(vec![
        (st.intern("type"), Datum::Sym(st.intern("local"))),
        (st.intern("wings"), Datum::Int(2)),
    ]);
    let err = decode_transport(&st, &d).unwrap_err();
    assert!(matches!(err, Error::UnexpectedField(f) if f == "wings"));
}

#[derive(Clone, Debug)]
struct StubRemote {
    addr: String,
}

impl Transport for StubRemote {
    fn name(&self) -> &str {
        "stub-remote"
    }

    fn encode_body(&self, st: &mut Symtab, fields: &mut Vec<(u32, Datum)>) -> trestle::Result<()> {
        fields.push((st.intern("addr"), Datum::Str(self.addr.clone())));
        Ok(())
    }

    fn exec(
        &self,
        _tree: &Tree,
        _dst: Arc<dyn trestle::QuerySink>,
        _ep: &mut ExecParams,
    ) -> trestle::Result<()> {
        Err(Error::Unsupported("stub".into()))
    }
}

#[derive(Default)]
struct StubRemoteDecoder {
    addr: Option<String>,
}

impl TransportDecoder for StubRemoteDecoder {
    fn set_field(&mut self, name: &str, value: &Datum) -> trestle::Result<()> {
        match name {
            "addr" => {
                self.addr = match value {
                    Datum::Str(s) => Some(s.clone()),
                    _ => return Err(Error::Corrupt("addr must be a string".into())),
                };
            }
            _ => return Err(Error::UnexpectedField(name.to_string())),
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> trestle::Result<Arc<dyn Transport>> {
        Ok(Arc::new(StubRemote {
            addr: self
                .addr
                .ok_or_else(|| Error::Corrupt("stub-remote without addr".into()))?,
        }))
    }
}

#[test]
fn registered_transports_round_trip() -> Result<()> {
    register_transport("stub-remote", || Box::new(StubRemoteDecoder::default()));

    let orig = StubRemote {
        addr: "10.0.0.7:6000".into(),
    };
    let (st, d) = encode_fresh(&orig)?;
    let back = decode_transport(&st, &d)?;
    assert_eq!(back.name(), "stub-remote");
    let (_, d2) = encode_fresh(back.as_ref())?;
    assert_eq!(d2, d);
    Ok(())
}

#[test]
fn local_transport_executes_in_process() -> Result<()> {
    let mut env = MemEnv::new();
    env.add_table(
        "t",
        vec![
            row(vec![("x", Value::Int(1))]),
            row(vec![("x", Value::Int(2))]),
        ],
    );
    let q = Query::from_table(Expr::path(&["t"])).select(Expr::path(&["x"]), "x");
    let plan = new(&q, &env)?;

    let out = Buffer::new();
    let mut ep = ExecParams::new();
    LocalTransport { threads: 2 }.exec(&plan, Arc::new(out.clone()), &mut ep)?;
    assert_eq!(out.len(), 2);
    // the thread bound is restored after execution
    assert_eq!(ep.parallel, ExecParams::new().parallel);
    Ok(())
}
