use trestle::wire::{read_uvarint, write_nop, write_uvarint};
use trestle::{Datum, Error, Symtab};

#[test]
fn datum_round_trip() {
    let mut st = Symtab::new();
    let a = st.intern("a");
    let b = st.intern("b");
    let c = st.intern("c");
    let sym = st.intern("a_symbol");
    let d = Datum::Struct(vec![
        (a, Datum::Int(-42)),
        (
            b,
            Datum::List(vec![
                Datum::Null,
                Datum::Bool(true),
                Datum::Bool(false),
                Datum::Float(1.5),
                Datum::Sym(sym),
            ]),
        ),
        (c, Datum::Str("hello".into())),
        (st.intern("d"), Datum::Bytes(vec![0, 1, 2, 255])),
    ]);

    let mut buf = Vec::new();
    d.encode(&mut buf);
    let mut src = buf.as_slice();
    let back = Datum::decode(&mut src).unwrap();
    assert_eq!(back, d);
    assert!(src.is_empty());
}

#[test]
fn int_extremes_round_trip() {
    for v in [0i64, 1, -1, i64::MAX, i64::MIN, 1 << 40, -(1 << 40)] {
        let mut buf = Vec::new();
        Datum::Int(v).encode(&mut buf);
        let mut src = buf.as_slice();
        assert_eq!(Datum::decode(&mut src).unwrap(), Datum::Int(v));
    }
}

#[test]
fn uvarint_round_trip() {
    for v in [0u64, 1, 127, 128, 300, u64::MAX] {
        let mut buf = Vec::new();
        write_uvarint(&mut buf, v);
        let mut src = buf.as_slice();
        assert_eq!(read_uvarint(&mut src).unwrap(), v);
        assert!(src.is_empty());
    }
}

#[test]
fn nop_pads_are_skipped() {
    let mut buf = Vec::new();
    write_nop(&mut buf, 13);
    Datum::Int(7).encode(&mut buf);
    let mut src = buf.as_slice();
    assert_eq!(Datum::decode(&mut src).unwrap(), Datum::Int(7));
}

#[test]
fn truncated_input_errors() {
    let mut buf = Vec::new();
    Datum::Str("a longer string".into()).encode(&mut buf);
    for cut in 0..buf.len() {
        let mut src = &buf[..cut];
        assert!(
            Datum::decode(&mut src).is_err(),
            "decode of {cut}-byte prefix should fail"
        );
    }
}

#[test]
fn empty_input_is_truncated() {
    let mut src: &[u8] = &[];
    assert!(matches!(
        Datum::decode(&mut src).unwrap_err(),
        Error::Truncated
    ));
}

#[test]
fn symtab_round_trip() {
    let mut st = Symtab::new();
    st.intern("first");
    st.intern("second");
    st.intern("first"); // duplicate interning is a no-op
    assert_eq!(st.len(), 2);

    let mut buf = Vec::new();
    st.encode(&mut buf);
    let mut src = buf.as_slice();
    let back = Symtab::decode(&mut src).unwrap();
    assert_eq!(back, st);
    assert_eq!(back.name(0), Some("first"));
    assert_eq!(back.get("second"), Some(1));
}

#[test]
fn preloaded_symtab_has_stable_ids() {
    let st = Symtab::preloaded(&["hits", "misses", "scanned"]);
    assert_eq!(st.get("hits"), Some(0));
    assert_eq!(st.get("misses"), Some(1));
    assert_eq!(st.get("scanned"), Some(2));
}
