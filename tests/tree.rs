use anyhow::Result;
use trestle::testing::{MemEnv, row};
use trestle::{
    AggOp, BinaryOp, Datum, Error, Expr, Op, Query, Symtab, Tree, Value, new,
};

fn sample_env() -> MemEnv {
    let mut env = MemEnv::new();
    env.add_table(
        "db.foo",
        vec![
            row(vec![("x", Value::Int(1)), ("y", Value::from("a"))]),
            row(vec![("x", Value::Int(2)), ("y", Value::from("b"))]),
        ],
    );
    env.add_table(
        "db.bar",
        vec![row(vec![("k", Value::Int(9))])],
    );
    env
}

#[test]
fn plan_round_trips_through_bytes() -> Result<()> {
    let env = sample_env();
    let q = Query::from_table(Expr::path(&["db", "foo"]))
        .select(Expr::path(&["x"]), "x")
        .filter(Expr::binary(
            BinaryOp::Gt,
            Expr::path(&["x"]),
            Expr::int(1),
        ))
        .order_by(Expr::path(&["x"]), true)
        .limit(10);
    let plan = new(&q, &env)?;

    let bytes = plan.to_bytes()?;
    let back = Tree::from_bytes(&bytes, &env)?;

    assert_eq!(back.id, plan.id);
    assert_eq!(back.root, plan.root);
    assert_eq!(back.results, plan.results);
    assert_eq!(back.result_types, plan.result_types);
    assert_eq!(back.inputs.len(), plan.inputs.len());
    assert_eq!(back.inputs[0].size(), plan.inputs[0].size());
    // a decoded plan re-encodes to the identical byte stream
    assert_eq!(back.to_bytes()?, bytes);
    Ok(())
}

#[test]
fn subquery_plan_round_trips() -> Result<()> {
    let env = sample_env();
    let sub = Query::from_table(Expr::path(&["db", "bar"])).agg(
        AggOp::Max,
        Some(Expr::path(&["k"])),
        "max",
    );
    let q = Query::from_table(Expr::path(&["db", "foo"]))
        .select(Expr::Subquery(Box::new(sub)), "m");
    let plan = new(&q, &env)?;
    assert!(matches!(plan.root.op, Op::Substitute { .. }));

    let bytes = plan.to_bytes()?;
    let back = Tree::from_bytes(&bytes, &env)?;
    assert_eq!(back.root, plan.root);
    Ok(())
}

#[test]
fn max_scanned_sums_reachable_inputs() -> Result<()> {
    let env = sample_env();

    let q = Query::from_table(Expr::path(&["db", "foo"])).select(Expr::path(&["x"]), "x");
    let plan = new(&q, &env)?;
    assert_eq!(plan.max_scanned(), plan.inputs[0].size());

    // a subquery on another table adds that input too
    let sub = Query::from_table(Expr::path(&["db", "bar"])).agg(
        AggOp::Max,
        Some(Expr::path(&["k"])),
        "max",
    );
    let q = Query::from_table(Expr::path(&["db", "foo"]))
        .select(Expr::Subquery(Box::new(sub)), "m");
    let plan = new(&q, &env)?;
    assert_eq!(plan.inputs.len(), 2);
    assert_eq!(
        plan.max_scanned(),
        plan.inputs[0].size() + plan.inputs[1].size()
    );
    Ok(())
}

#[test]
fn unknown_operator_field_is_rejected() {
    let mut st = Symtab::new();
    let d = Datum::Struct(vec![
        (st.intern("type"), Datum::Sym(st.intern("leaf"))),
        (st.intern("bogus"), Datum::Int(1)),
    ]);
    let err = Op::from_datum(&d, &st).unwrap_err();
    assert!(matches!(err, Error::UnexpectedField(f) if f == "bogus"));
}

#[test]
fn unknown_operator_tag_is_rejected() {
    let mut st = Symtab::new();
    let d = Datum::Struct(vec![(
        st.intern("type"),
        Datum::Sym(st.intern("teleport")),
    )]);
    let err = Op::from_datum(&d, &st).unwrap_err();
    assert!(matches!(err, Error::UnknownOp(t) if t == "teleport"));
}

#[test]
fn out_of_range_input_is_rejected() -> Result<()> {
    let env = sample_env();
    let q = Query::from_table(Expr::path(&["db", "foo"])).select(Expr::path(&["x"]), "x");
    let mut plan = new(&q, &env)?;
    plan.root.input = Some(7);
    let bytes = plan.to_bytes()?;
    assert!(matches!(
        Tree::from_bytes(&bytes, &env),
        Err(Error::Corrupt(_))
    ));
    Ok(())
}

#[test]
fn display_lists_operators_in_execution_order() -> Result<()> {
    let env = sample_env();
    let q = Query::from_table(Expr::path(&["db", "foo"]))
        .select(Expr::path(&["x"]), "x")
        .filter(Expr::binary(BinaryOp::Gt, Expr::path(&["x"]), Expr::int(1)))
        .limit(3);
    let plan = new(&q, &env)?;
    let text = plan.to_string();
    let scan = text.find("SCAN t0").expect("scan line");
    let filter = text.find("FILTER").expect("filter line");
    let project = text.find("PROJECT").expect("project line");
    let limit = text.find("LIMIT 3").expect("limit line");
    assert!(scan < filter && filter < project && project < limit);
    Ok(())
}

#[test]
fn plan_ids_reflect_content() -> Result<()> {
    let env = sample_env();
    let a = new(
        &Query::from_table(Expr::path(&["db", "foo"])).select(Expr::path(&["x"]), "x"),
        &env,
    )?;
    let b = new(
        &Query::from_table(Expr::path(&["db", "foo"])).select(Expr::path(&["y"]), "y"),
        &env,
    )?;
    assert_ne!(a.id, b.id);

    let again = new(
        &Query::from_table(Expr::path(&["db", "foo"])).select(Expr::path(&["x"]), "x"),
        &env,
    )?;
    assert_eq!(a.id, again.id);
    Ok(())
}
