use anyhow::Result;
use std::sync::Arc;
use trestle::testing::{MemEnv, row};
use trestle::{
    AggOp, BinaryOp, Buffer, Builtin, ExecParams, Expr, Op, Query, Value, new, new_split,
};

fn env() -> MemEnv {
    let mut env = MemEnv::new();
    env.add_table(
        "db.t",
        vec![
            row(vec![("x", Value::Int(1)), ("y", Value::Int(10))]),
            row(vec![("x", Value::Int(2)), ("y", Value::Int(20))]),
            row(vec![("x", Value::Int(3)), ("y", Value::Int(30))]),
        ],
    );
    env
}

/// Operator tags from terminal to chain head.
fn tags(op: &Op) -> Vec<&'static str> {
    let mut out = Vec::new();
    let mut cur = Some(op);
    while let Some(op) = cur {
        out.push(op.tag());
        cur = op.input();
    }
    out.reverse();
    out
}

#[test]
fn simple_query_chains_in_order() -> Result<()> {
    let q = Query::from_table(Expr::path(&["db", "t"]))
        .select(Expr::path(&["x"]), "x")
        .filter(Expr::binary(BinaryOp::Gt, Expr::path(&["y"]), Expr::int(15)))
        .order_by(Expr::path(&["x"]), false)
        .limit(5);
    let plan = new(&q, &env())?;
    assert_eq!(
        tags(&plan.root.op),
        vec!["leaf", "filter", "project", "orderby", "limit"]
    );
    assert_eq!(plan.results, vec!["x"]);
    Ok(())
}

#[test]
fn split_plans_put_union_map_above_the_scan() -> Result<()> {
    let q = Query::from_table(Expr::path(&["db", "t"]))
        .select(Expr::path(&["x"]), "x")
        .filter(Expr::binary(BinaryOp::Gt, Expr::path(&["y"]), Expr::int(15)));
    let plan = new_split(&q, &env())?;
    assert_eq!(
        tags(&plan.root.op),
        vec!["leaf", "filter", "unionmap", "project"]
    );
    Ok(())
}

#[test]
fn aggregates_stay_above_the_fan_out() -> Result<()> {
    let q = Query::from_table(Expr::path(&["db", "t"]))
        .agg(AggOp::Sum, Some(Expr::path(&["y"])), "total")
        .group_by(Expr::path(&["x"]), "x");
    let plan = new_split(&q, &env())?;
    assert_eq!(tags(&plan.root.op), vec!["leaf", "unionmap", "aggregate"]);
    Ok(())
}

#[test]
fn distinct_query_shape() -> Result<()> {
    let q = Query::from_table(Expr::path(&["db", "t"]))
        .select(Expr::path(&["x"]), "x")
        .distinct();
    let plan = new(&q, &env())?;
    assert_eq!(tags(&plan.root.op), vec!["leaf", "project", "distinct"]);
    Ok(())
}

#[test]
fn subqueries_lower_into_substitute() -> Result<()> {
    let sub = Query::from_table(Expr::path(&["db", "t"])).agg(
        AggOp::Min,
        Some(Expr::path(&["x"])),
        "min",
    );
    let q = Query::from_table(Expr::path(&["db", "t"]))
        .select(Expr::path(&["x"]), "x")
        .filter(Expr::binary(
            BinaryOp::Gt,
            Expr::path(&["x"]),
            Expr::Subquery(Box::new(sub)),
        ));
    let plan = new(&q, &env())?;

    let Op::Substitute { inner, from } = &plan.root.op else {
        panic!("expected substitute at the chain head");
    };
    assert_eq!(inner.len(), 1);
    assert_eq!(tags(&inner[0].op), vec!["leaf", "aggregate"]);
    assert_eq!(tags(from), vec!["leaf", "filter", "project"]);

    // the filter now references the replacement placeholder
    let Op::Project { from, .. } = from.as_ref() else {
        panic!("expected project under substitute");
    };
    let Op::Filter { predicate, .. } = from.as_ref() else {
        panic!("expected filter under project");
    };
    let mut found = false;
    predicate.walk(&mut |e| {
        if matches!(e, Expr::Call(Builtin::ScalarReplacement, _)) {
            found = true;
        }
    });
    assert!(found, "filter should contain SCALAR_REPLACEMENT: {predicate}");
    Ok(())
}

#[test]
fn lowered_plans_execute_end_to_end() -> Result<()> {
    // SELECT x FROM db.t WHERE x > (SELECT MIN(x) FROM db.t) ORDER BY x
    let sub = Query::from_table(Expr::path(&["db", "t"])).agg(
        AggOp::Min,
        Some(Expr::path(&["x"])),
        "min",
    );
    let q = Query::from_table(Expr::path(&["db", "t"]))
        .select(Expr::path(&["x"]), "x")
        .filter(Expr::binary(
            BinaryOp::Gt,
            Expr::path(&["x"]),
            Expr::Subquery(Box::new(sub)),
        ))
        .order_by(Expr::path(&["x"]), false);
    let plan = new(&q, &env())?;

    let out = Buffer::new();
    let mut ep = ExecParams::new();
    plan.exec(Arc::new(out.clone()), &mut ep)?;
    assert_eq!(
        out.rows(),
        vec![
            row(vec![("x", Value::Int(2))]),
            row(vec![("x", Value::Int(3))]),
        ]
    );
    Ok(())
}

#[test]
fn aggregate_with_avg_and_count() -> Result<()> {
    let q = Query::from_table(Expr::path(&["db", "t"]))
        .agg(AggOp::Count, None, "n")
        .agg(AggOp::Avg, Some(Expr::path(&["y"])), "mean");
    let plan = new(&q, &env())?;

    let out = Buffer::new();
    let mut ep = ExecParams::new();
    plan.exec(Arc::new(out.clone()), &mut ep)?;
    assert_eq!(
        out.rows(),
        vec![row(vec![
            ("n", Value::Int(3)),
            ("mean", Value::Float(20.0)),
        ])]
    );
    Ok(())
}

#[test]
fn missing_table_fails_planning() {
    let q = Query::from_table(Expr::path(&["db", "absent"])).select(Expr::path(&["x"]), "x");
    let err = new(&q, &env()).unwrap_err();
    assert!(err.is_not_found());
}
