use std::cmp::Ordering;
use trestle::expr::simplify;
use trestle::{BinaryOp, Builtin, Expr, Symtab, UnaryOp, Value};

fn int(v: i64) -> Expr {
    Expr::int(v)
}

#[test]
fn member_of_constants_folds() {
    let e = Expr::Member(Box::new(int(1)), vec![int(1), int(2), int(3)]);
    assert_eq!(simplify(e), Expr::Const(Value::Bool(true)));

    let e = Expr::Member(Box::new(int(9)), vec![int(1), int(2)]);
    assert_eq!(simplify(e), Expr::Const(Value::Bool(false)));

    // empty membership is vacuously false
    let e = Expr::Member(Box::new(Expr::path(&["x"])), vec![]);
    assert_eq!(simplify(e), Expr::Const(Value::Bool(false)));

    // non-constant members stay put
    let e = Expr::Member(Box::new(Expr::path(&["x"])), vec![int(1)]);
    assert!(matches!(simplify(e), Expr::Member(..)));
}

#[test]
fn arithmetic_folds_preserve_numeric_kind() {
    let e = Expr::binary(BinaryOp::Add, int(2), int(3));
    assert_eq!(simplify(e), Expr::Const(Value::Int(5)));

    let e = Expr::binary(BinaryOp::Mul, int(2), Expr::Const(Value::Float(1.5)));
    assert_eq!(simplify(e), Expr::Const(Value::Float(3.0)));

    // integer division by zero does not fold
    let e = Expr::binary(BinaryOp::Div, int(1), int(0));
    assert!(matches!(simplify(e), Expr::Binary(..)));

    // overflow does not fold either
    let e = Expr::binary(BinaryOp::Add, int(i64::MAX), int(1));
    assert!(matches!(simplify(e), Expr::Binary(..)));
}

#[test]
fn comparisons_mix_ints_and_floats() {
    let e = Expr::binary(BinaryOp::Lt, int(1), Expr::Const(Value::Float(1.5)));
    assert_eq!(simplify(e), Expr::Const(Value::Bool(true)));

    let e = Expr::binary(BinaryOp::Eq, int(2), Expr::Const(Value::Float(2.0)));
    assert_eq!(simplify(e), Expr::Const(Value::Bool(true)));
}

#[test]
fn boolean_short_circuits() {
    let x = Expr::path(&["x"]);
    let e = Expr::binary(BinaryOp::And, Expr::Const(Value::Bool(true)), x.clone());
    assert_eq!(simplify(e), x);

    let e = Expr::binary(
        BinaryOp::And,
        Expr::path(&["x"]),
        Expr::Const(Value::Bool(false)),
    );
    assert_eq!(simplify(e), Expr::Const(Value::Bool(false)));

    let e = Expr::binary(BinaryOp::Or, Expr::Const(Value::Bool(true)), Expr::path(&["x"]));
    assert_eq!(simplify(e), Expr::Const(Value::Bool(true)));

    let e = Expr::Unary(UnaryOp::Not, Box::new(Expr::Const(Value::Bool(false))));
    assert_eq!(simplify(e), Expr::Const(Value::Bool(true)));
}

#[test]
fn hash_lookup_over_constants_folds() {
    let e = Expr::call(
        Builtin::HashLookup,
        vec![
            Expr::string("b"),
            Expr::string("a"),
            int(1),
            Expr::string("b"),
            int(2),
        ],
    );
    assert_eq!(simplify(e), Expr::Const(Value::Int(2)));

    let e = Expr::call(
        Builtin::HashLookup,
        vec![Expr::string("zz"), Expr::string("a"), int(1)],
    );
    assert_eq!(simplify(e), Expr::Const(Value::Null));

    // a non-constant probe stays a lookup
    let e = Expr::call(
        Builtin::HashLookup,
        vec![Expr::path(&["k"]), Expr::string("a"), int(1)],
    );
    assert!(matches!(simplify(e), Expr::Call(Builtin::HashLookup, _)));
}

#[test]
fn value_ordering_is_total() {
    assert_eq!(Value::Null.compare(&Value::Int(0)), Ordering::Less);
    assert_eq!(Value::Int(1).compare(&Value::Float(1.5)), Ordering::Less);
    assert_eq!(Value::Float(2.0).compare(&Value::Int(2)), Ordering::Equal);
    assert_eq!(
        Value::from("a").compare(&Value::from("b")),
        Ordering::Less
    );
    assert_eq!(Value::Int(5).compare(&Value::from("a")), Ordering::Less);
}

#[test]
fn bytes_are_not_constants() {
    assert!(Value::Bytes(vec![1]).into_constant().is_err());
    assert!(
        Value::Struct(vec![("b".into(), Value::Bytes(vec![1]))])
            .into_constant()
            .is_err()
    );
    assert!(
        Value::List(vec![Value::Int(1), Value::Bytes(vec![1])])
            .into_constant()
            .is_err()
    );
    assert!(
        Value::Struct(vec![("ok".into(), Value::Int(1))])
            .into_constant()
            .is_ok()
    );
}

#[test]
fn expressions_round_trip_through_datums() {
    let exprs = vec![
        Expr::Const(Value::Struct(vec![
            ("a".into(), Value::Int(1)),
            ("b".into(), Value::List(vec![Value::Null, Value::from(2.5)])),
        ])),
        Expr::path(&["a", "b", "c"]),
        Expr::Unary(UnaryOp::Neg, Box::new(Expr::path(&["x"]))),
        Expr::binary(BinaryOp::Ge, Expr::path(&["x"]), int(3)),
        Expr::Member(Box::new(Expr::path(&["x"])), vec![int(1), int(2)]),
        Expr::call(
            Builtin::HashReplacement,
            vec![
                int(0),
                Expr::string("scalar"),
                Expr::string("k"),
                Expr::path(&["key"]),
            ],
        ),
    ];
    for e in exprs {
        let mut st = Symtab::new();
        let d = e.to_datum(&mut st).unwrap();
        let back = Expr::from_datum(&d, &st).unwrap();
        assert_eq!(back, e);
    }
}

#[test]
fn subqueries_do_not_encode() {
    let sub = trestle::Query::from_table(Expr::path(&["t"]));
    let e = Expr::Subquery(Box::new(sub));
    let mut st = Symtab::new();
    assert!(e.to_datum(&mut st).is_err());
}

#[test]
fn expression_display_reads_like_sql() {
    let e = Expr::binary(
        BinaryOp::And,
        Expr::binary(BinaryOp::Gt, Expr::path(&["x"]), int(3)),
        Expr::Member(Box::new(Expr::path(&["y"])), vec![int(1), int(2)]),
    );
    assert_eq!(e.to_string(), "((x > 3) AND y IN (1, 2))");

    let e = Expr::call(Builtin::ScalarReplacement, vec![int(0)]);
    assert_eq!(e.to_string(), "SCALAR_REPLACEMENT(0)");
}
