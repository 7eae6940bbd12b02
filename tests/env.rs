use anyhow::Result;
use trestle::env::{self, meta_prefix};
use trestle::testing::{MemEnv, MemIndex, row};
use trestle::{
    Buffer, Builtin, Env, Error, Expr, Hints, Index, Indexer, Input, MultiIndex, QuerySink,
    RowWriter, Table, TableLister, Value,
};

fn glob(parts: &[&str]) -> Expr {
    Expr::call(Builtin::TableGlob, vec![Expr::path(parts)])
}

fn pattern(parts: &[&str]) -> Expr {
    Expr::call(Builtin::TablePattern, vec![Expr::path(parts)])
}

fn count_rows(input: &Input) -> Result<usize> {
    let table = input.handle.open()?;
    let buf = Buffer::new();
    let mut w = buf.open()?;
    table.write_rows(&mut *w)?;
    w.close()?;
    Ok(buf.len())
}

fn glob_env() -> MemEnv {
    let mut env = MemEnv::new();
    env.add_table("db.foo1", vec![row(vec![("x", Value::Int(1))])]);
    env.add_table(
        "db.foo2",
        vec![
            row(vec![("x", Value::Int(2))]),
            row(vec![("x", Value::Int(3))]),
        ],
    );
    env.add_table("db.bar", vec![row(vec![("x", Value::Int(9))])]);
    env
}

#[test]
fn glob_expands_to_concatenation() -> Result<()> {
    let env = glob_env();
    let input = env::resolve(&env, &glob(&["db", "foo*"]), &Hints::none())?;
    assert_eq!(count_rows(&input)?, 3);
    // the input keeps the original glob expression
    assert_eq!(input.table, glob(&["db", "foo*"]));
    Ok(())
}

#[test]
fn glob_with_single_match_is_plain() -> Result<()> {
    let env = glob_env();
    let input = env::resolve(&env, &glob(&["db", "bar*"]), &Hints::none())?;
    assert_eq!(count_rows(&input)?, 1);
    assert_eq!(input.table, Expr::path(&["db", "bar"]));
    Ok(())
}

#[test]
fn glob_with_no_match_is_not_found() {
    let env = glob_env();
    let err = env::resolve(&env, &glob(&["db", "nope*"]), &Hints::none()).unwrap_err();
    assert!(err.is_not_found());
}

/// Lists tables but every `stat` comes back absent.
struct GhostEnv;

impl Env for GhostEnv {
    fn stat(&self, table: &Expr, _hints: &Hints) -> trestle::Result<Input> {
        Err(Error::NotFound(table.to_string()))
    }

    fn lister(&self) -> Option<&dyn TableLister> {
        Some(self)
    }
}

impl TableLister for GhostEnv {
    fn list_tables(&self, _db: &str) -> trestle::Result<Vec<String>> {
        Ok(vec!["foo1".into(), "foo2".into(), "bar".into()])
    }
}

#[test]
fn glob_where_every_member_is_absent_is_not_found() {
    let err = env::resolve(&GhostEnv, &glob(&["db", "foo*"]), &Hints::none()).unwrap_err();
    assert!(err.is_not_found());
}

/// Resolves plain references but cannot list tables.
struct NoListEnv(MemEnv);

impl Env for NoListEnv {
    fn stat(&self, table: &Expr, hints: &Hints) -> trestle::Result<Input> {
        self.0.stat(table, hints)
    }
}

#[test]
fn literal_glob_skips_listing() -> Result<()> {
    // no metacharacters: the glob resolves as a plain reference even when
    // the environment cannot list tables
    let env = NoListEnv(glob_env());
    let input = env::resolve(&env, &glob(&["db", "bar"]), &Hints::none())?;
    assert_eq!(count_rows(&input)?, 1);

    // a real glob against the same environment needs the lister
    let err = env::resolve(&env, &glob(&["db", "foo*"]), &Hints::none()).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
    Ok(())
}

#[test]
fn pattern_is_anchored() -> Result<()> {
    let mut env = MemEnv::new();
    env.add_table("db.foo", vec![row(vec![("x", Value::Int(1))])]);
    env.add_table("db.fooo", vec![row(vec![("x", Value::Int(2))])]);
    env.add_table("db.xfoo", vec![row(vec![("x", Value::Int(3))])]);

    let input = env::resolve(&env, &pattern(&["db", "fo+"]), &Hints::none())?;
    // matches foo and fooo, but not xfoo (the pattern is anchored)
    assert_eq!(count_rows(&input)?, 3);
    Ok(())
}

#[test]
fn literal_pattern_skips_listing() -> Result<()> {
    let env = NoListEnv(glob_env());
    let input = env::resolve(&env, &pattern(&["db", "^bar$"]), &Hints::none())?;
    assert_eq!(count_rows(&input)?, 1);
    Ok(())
}

#[test]
fn meta_prefix_finds_glob_metacharacters() {
    assert_eq!(meta_prefix("foo*"), "foo");
    assert_eq!(meta_prefix("foo"), "foo");
    assert_eq!(meta_prefix("*x"), "");
    assert_eq!(meta_prefix("a?b"), "a");
    assert_eq!(meta_prefix("a[0-9]"), "a");
}

struct FixedIndex(Option<(i64, i64)>, bool);

impl Index for FixedIndex {
    fn time_range(&self, _path: &[String]) -> Option<(i64, i64)> {
        self.0
    }

    fn has_partition(&self, _name: &str) -> bool {
        self.1
    }
}

#[test]
fn multi_index_unions_time_ranges() {
    let p = vec!["ts".to_string()];
    let multi = MultiIndex(vec![
        Box::new(FixedIndex(Some((5, 10)), true)),
        Box::new(FixedIndex(Some((0, 7)), true)),
        Box::new(FixedIndex(Some((6, 20)), true)),
    ]);
    assert_eq!(multi.time_range(&p), Some((0, 20)));
    assert!(multi.has_partition("region"));

    // one member without a range poisons the union
    let multi = MultiIndex(vec![
        Box::new(FixedIndex(Some((5, 10)), true)),
        Box::new(FixedIndex(None, false)),
    ]);
    assert_eq!(multi.time_range(&p), None);
    assert!(!multi.has_partition("region"));

    // an empty multi-index knows nothing
    let multi = MultiIndex(vec![]);
    assert_eq!(multi.time_range(&p), None);
    assert!(!multi.has_partition("region"));
}

#[test]
fn index_for_glob_unions_members() -> Result<()> {
    let mut env = glob_env();
    env.set_index(
        "db.foo1",
        MemIndex::new()
            .with_range("ts", 0, 10)
            .with_partition("region"),
    );
    env.set_index(
        "db.foo2",
        MemIndex::new()
            .with_range("ts", 5, 25)
            .with_partition("region"),
    );

    let ix = env::index_for(&env, &glob(&["db", "foo*"]))?.expect("combined index");
    assert_eq!(ix.time_range(&["ts".to_string()]), Some((0, 25)));
    assert!(ix.has_partition("region"));
    assert!(!ix.has_partition("shard"));
    Ok(())
}

#[test]
fn index_for_plain_table() -> Result<()> {
    let mut env = glob_env();
    env.set_index("db.bar", MemIndex::new().with_range("ts", 3, 4));
    let ix = env
        .indexer()
        .expect("indexer")
        .index(&["db".to_string(), "bar".to_string()])?
        .expect("index");
    assert_eq!(ix.time_range(&["ts".to_string()]), Some((3, 4)));
    Ok(())
}
