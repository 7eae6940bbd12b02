use anyhow::Result;
use std::sync::Arc;
use trestle::testing::{MemEnv, row};
use trestle::{
    AggOp, Binding, Buffer, Builtin, Env, Error, ExecParams, Expr, Hints, Node, Op, Query, Tree,
    TypeSet, Value, new,
};

fn numbers_env() -> MemEnv {
    let mut env = MemEnv::new();
    env.add_table(
        "t",
        vec![
            row(vec![("x", Value::Int(10))]),
            row(vec![("x", Value::Int(42))]),
            row(vec![("x", Value::Int(7))]),
        ],
    );
    env
}

fn run(plan: &Tree) -> Result<Vec<trestle::Row>> {
    let out = Buffer::new();
    let mut ep = ExecParams::new();
    plan.exec(Arc::new(out.clone()), &mut ep)?;
    Ok(out.rows())
}

#[test]
fn scalar_replacement_interpolates_first_value() -> Result<()> {
    let mut env = numbers_env();
    env.add_table("one", vec![row(vec![("seq", Value::Int(0))])]);

    // SELECT (SELECT MAX(x) FROM t) AS m FROM one
    let sub = Query::from_table(Expr::path(&["t"])).agg(
        AggOp::Max,
        Some(Expr::path(&["x"])),
        "max",
    );
    let q = Query::from_table(Expr::path(&["one"]))
        .select(Expr::Subquery(Box::new(sub)), "m");
    let plan = new(&q, &env)?;

    let rows = run(&plan)?;
    assert_eq!(rows, vec![row(vec![("m", Value::Int(42))])]);
    Ok(())
}

#[test]
fn scalar_replacement_with_no_rows_is_null() -> Result<()> {
    let mut env = numbers_env();
    env.add_table("one", vec![row(vec![("seq", Value::Int(0))])]);
    env.add_table("empty", vec![]);

    let sub = Query::from_table(Expr::path(&["empty"])).select(Expr::path(&["x"]), "x");
    let q = Query::from_table(Expr::path(&["one"]))
        .select(Expr::Subquery(Box::new(sub)), "m");
    let plan = new(&q, &env)?;

    let rows = run(&plan)?;
    assert_eq!(rows, vec![row(vec![("m", Value::Null)])]);
    Ok(())
}

#[test]
fn in_replacement_filters_membership() -> Result<()> {
    let mut env = MemEnv::new();
    env.add_table(
        "keys",
        vec![
            row(vec![("k", Value::Int(1))]),
            row(vec![("k", Value::Int(2))]),
            row(vec![("k", Value::Int(3))]),
        ],
    );
    env.add_table(
        "v",
        vec![
            row(vec![("x", Value::Int(2))]),
            row(vec![("x", Value::Int(5))]),
        ],
    );

    // SELECT x FROM v WHERE x IN (SELECT k FROM keys)
    let sub = Query::from_table(Expr::path(&["keys"])).select(Expr::path(&["k"]), "k");
    let q = Query::from_table(Expr::path(&["v"]))
        .select(Expr::path(&["x"]), "x")
        .filter(Expr::InSubquery(
            Box::new(Expr::path(&["x"])),
            Box::new(sub),
        ));
    let plan = new(&q, &env)?;

    let rows = run(&plan)?;
    assert_eq!(rows, vec![row(vec![("x", Value::Int(2))])]);
    Ok(())
}

#[test]
fn constant_in_replacement_folds_to_true() -> Result<()> {
    let mut env = MemEnv::new();
    env.add_table(
        "keys",
        vec![
            row(vec![("k", Value::Int(1))]),
            row(vec![("k", Value::Int(2))]),
            row(vec![("k", Value::Int(3))]),
        ],
    );
    env.add_table(
        "v",
        vec![
            row(vec![("x", Value::Int(2))]),
            row(vec![("x", Value::Int(5))]),
        ],
    );

    // WHERE 1 IN (SELECT k FROM keys) is true for every row
    let sub = Query::from_table(Expr::path(&["keys"])).select(Expr::path(&["k"]), "k");
    let q = Query::from_table(Expr::path(&["v"]))
        .select(Expr::path(&["x"]), "x")
        .filter(Expr::InSubquery(Box::new(Expr::int(1)), Box::new(sub)));
    let plan = new(&q, &env)?;

    let rows = run(&plan)?;
    assert_eq!(rows.len(), 2);
    Ok(())
}

#[test]
fn empty_in_replacement_folds_to_false() -> Result<()> {
    let mut env = MemEnv::new();
    env.add_table("empty", vec![]);
    env.add_table("v", vec![row(vec![("x", Value::Int(2))])]);

    let sub = Query::from_table(Expr::path(&["empty"])).select(Expr::path(&["k"]), "k");
    let q = Query::from_table(Expr::path(&["v"]))
        .select(Expr::path(&["x"]), "x")
        .filter(Expr::InSubquery(
            Box::new(Expr::path(&["x"])),
            Box::new(sub),
        ));
    let plan = new(&q, &env)?;

    assert!(run(&plan)?.is_empty());
    Ok(())
}

/// Hand-build `SUBSTITUTE` around a replacement builtin the planner does
/// not emit itself.
fn substitute_plan(
    env: &MemEnv,
    outer_table: &str,
    inner: Node,
    outer_columns: Vec<Binding>,
) -> Result<Tree> {
    let outer_input = env.stat(&Expr::path(&[outer_table]), &Hints::none())?;
    let inputs = vec![outer_input];
    let op = Op::Substitute {
        inner: vec![inner],
        from: Box::new(Op::Project {
            columns: outer_columns,
            from: Box::new(Op::Leaf),
        }),
    };
    Ok(Tree {
        id: "test".into(),
        inputs,
        data: None,
        root: Node {
            op,
            input: Some(0),
            output_type: TypeSet::any(),
        },
        results: vec![],
        result_types: vec![],
    })
}

fn inner_scan(env: &MemEnv, table: &str, inputs: &mut Vec<trestle::Input>) -> Result<Node> {
    let input = env.stat(&Expr::path(&[table]), &Hints::none())?;
    inputs.push(input);
    Ok(Node {
        op: Op::Leaf,
        input: Some(inputs.len() - 1),
        output_type: TypeSet::any(),
    })
}

#[test]
fn hash_replacement_scalar_kind() -> Result<()> {
    let mut env = MemEnv::new();
    env.add_table(
        "kv",
        vec![
            row(vec![("k", Value::from("a")), ("v", Value::Int(1))]),
            row(vec![("k", Value::from("b")), ("v", Value::Int(2))]),
        ],
    );
    env.add_table(
        "probe",
        vec![
            row(vec![("key", Value::from("a"))]),
            row(vec![("key", Value::from("b"))]),
            row(vec![("key", Value::from("c"))]),
        ],
    );

    let mut plan = substitute_plan(
        &env,
        "probe",
        Node {
            op: Op::Leaf,
            input: Some(1),
            output_type: TypeSet::any(),
        },
        vec![Binding::new(
            Expr::call(
                Builtin::HashReplacement,
                vec![
                    Expr::int(0),
                    Expr::string("scalar"),
                    Expr::string("k"),
                    Expr::path(&["key"]),
                ],
            ),
            "v",
        )],
    )?;
    plan.inputs
        .push(env.stat(&Expr::path(&["kv"]), &Hints::none())?);

    let rows = run(&plan)?;
    assert_eq!(
        rows,
        vec![
            row(vec![("v", Value::Int(1))]),
            row(vec![("v", Value::Int(2))]),
            row(vec![("v", Value::Null)]),
        ]
    );
    Ok(())
}

#[test]
fn hash_replacement_struct_kind() -> Result<()> {
    let mut env = MemEnv::new();
    env.add_table(
        "kv",
        vec![row(vec![
            ("k", Value::from("a")),
            ("x", Value::Int(1)),
            ("y", Value::Int(2)),
        ])],
    );
    env.add_table("probe", vec![row(vec![("key", Value::from("a"))])]);

    let mut plan = substitute_plan(
        &env,
        "probe",
        Node {
            op: Op::Leaf,
            input: Some(1),
            output_type: TypeSet::any(),
        },
        vec![Binding::new(
            Expr::call(
                Builtin::HashReplacement,
                vec![
                    Expr::int(0),
                    Expr::string("struct"),
                    Expr::string("k"),
                    Expr::path(&["key"]),
                ],
            ),
            "v",
        )],
    )?;
    plan.inputs
        .push(env.stat(&Expr::path(&["kv"]), &Hints::none())?);

    let rows = run(&plan)?;
    assert_eq!(
        rows,
        vec![row(vec![(
            "v",
            Value::Struct(vec![
                ("x".into(), Value::Int(1)),
                ("y".into(), Value::Int(2)),
            ]),
        )])]
    );
    Ok(())
}

#[test]
fn hash_replacement_list_kind_accumulates() -> Result<()> {
    let mut env = MemEnv::new();
    env.add_table(
        "kv",
        vec![
            row(vec![("k", Value::from("a")), ("v", Value::Int(1))]),
            row(vec![("k", Value::from("a")), ("v", Value::Int(2))]),
            row(vec![("k", Value::from("b")), ("v", Value::Int(3))]),
        ],
    );
    env.add_table("probe", vec![row(vec![("key", Value::from("a"))])]);

    let mut plan = substitute_plan(
        &env,
        "probe",
        Node {
            op: Op::Leaf,
            input: Some(1),
            output_type: TypeSet::any(),
        },
        vec![Binding::new(
            Expr::call(
                Builtin::HashReplacement,
                vec![
                    Expr::int(0),
                    Expr::string("list"),
                    Expr::string("k"),
                    Expr::path(&["key"]),
                ],
            ),
            "vs",
        )],
    )?;
    plan.inputs
        .push(env.stat(&Expr::path(&["kv"]), &Hints::none())?);

    let rows = run(&plan)?;
    assert_eq!(
        rows,
        vec![row(vec![(
            "vs",
            Value::List(vec![
                Value::Struct(vec![("v".into(), Value::Int(1))]),
                Value::Struct(vec![("v".into(), Value::Int(2))]),
            ]),
        )])]
    );
    Ok(())
}

#[test]
fn struct_and_list_replacements() -> Result<()> {
    let mut env = MemEnv::new();
    env.add_table(
        "t",
        vec![
            row(vec![("a", Value::Int(1)), ("b", Value::from("x"))]),
            row(vec![("a", Value::Int(2)), ("b", Value::from("y"))]),
        ],
    );
    env.add_table("one", vec![row(vec![("seq", Value::Int(0))])]);

    let mut inputs = Vec::new();
    let outer_input = env.stat(&Expr::path(&["one"]), &Hints::none())?;
    inputs.push(outer_input);
    let inner = inner_scan(&env, "t", &mut inputs)?;

    let op = Op::Substitute {
        inner: vec![inner.clone(), inner],
        from: Box::new(Op::Project {
            columns: vec![
                Binding::new(
                    Expr::call(Builtin::StructReplacement, vec![Expr::int(0)]),
                    "first",
                ),
                Binding::new(
                    Expr::call(Builtin::ListReplacement, vec![Expr::int(1)]),
                    "all",
                ),
            ],
            from: Box::new(Op::Leaf),
        }),
    };
    let plan = Tree {
        id: "test".into(),
        inputs,
        data: None,
        root: Node {
            op,
            input: Some(0),
            output_type: TypeSet::any(),
        },
        results: vec![],
        result_types: vec![],
    };

    let rows = run(&plan)?;
    let first = Value::Struct(vec![("a".into(), Value::Int(1)), ("b".into(), Value::from("x"))]);
    let second = Value::Struct(vec![("a".into(), Value::Int(2)), ("b".into(), Value::from("y"))]);
    assert_eq!(
        rows,
        vec![row(vec![
            ("first", first.clone()),
            ("all", Value::List(vec![first, second])),
        ])]
    );
    Ok(())
}

#[test]
fn replacement_row_cap_is_enforced() -> Result<()> {
    let mut env = numbers_env();
    env.add_table("one", vec![row(vec![("seq", Value::Int(0))])]);

    let sub = Query::from_table(Expr::path(&["t"])).select(Expr::path(&["x"]), "x");
    let q = Query::from_table(Expr::path(&["one"]))
        .select(Expr::Subquery(Box::new(sub)), "m");
    let plan = new(&q, &env)?;

    let out = Buffer::new();
    let mut ep = ExecParams::new();
    ep.large_size = 2; // t has 3 rows
    let err = plan.exec(Arc::new(out.clone()), &mut ep).unwrap_err();
    assert!(matches!(err, Error::ReplacementTooLarge(2)));
    assert!(out.rows().is_empty());
    Ok(())
}

#[test]
fn non_constant_rows_fail_replacement() -> Result<()> {
    let mut env = MemEnv::new();
    env.add_table(
        "blobs",
        vec![row(vec![("b", Value::Bytes(vec![1, 2, 3]))])],
    );
    env.add_table("one", vec![row(vec![("seq", Value::Int(0))])]);

    let sub = Query::from_table(Expr::path(&["blobs"])).select(Expr::path(&["b"]), "b");
    let q = Query::from_table(Expr::path(&["one"]))
        .select(Expr::Subquery(Box::new(sub)), "m");
    let plan = new(&q, &env)?;

    let out = Buffer::new();
    let mut ep = ExecParams::new();
    let err = plan.exec(Arc::new(out), &mut ep).unwrap_err();
    assert!(matches!(err, Error::NotConstant(_)));
    Ok(())
}
