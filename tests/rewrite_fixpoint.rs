use anyhow::Result;
use jsonmill::expr::{ExprArena, ExprId, ExprKind};
use jsonmill::rules::simplification_rules;
use jsonmill::testing::{longs, record};
use jsonmill::value::{MathOp, Value};
use jsonmill::{
    AdapterRegistry, AggregateRegistry, CompileError, MemStore, RewriteEngine, RewritePhase,
    Runner, Traversal,
};

fn simplify_engine(cap: usize) -> RewriteEngine {
    let mut engine = RewriteEngine::new(AggregateRegistry::standard(), AdapterRegistry::new());
    let mut phase = RewritePhase::new("simplify", Traversal::PostOrder, cap);
    for rule in simplification_rules() {
        phase = phase.rule(rule);
    }
    engine.phase(phase);
    engine.enable_trace();
    engine
}

fn long(arena: &mut ExprArena, v: i64) -> ExprId {
    arena.constant(Value::Long(v))
}

#[test]
fn binding_inlines_and_folds_to_a_constant() -> Result<()> {
    let mut engine = simplify_engine(10_000);
    let mut arena = ExprArena::new();

    // ( x = 2, x * 3 )
    let x = arena.vars.make("x");
    let two = long(&mut arena, 2);
    let bind = arena.add(ExprKind::Bind(x), vec![two]);
    let x_ref = arena.var_ref(x);
    let three = long(&mut arena, 3);
    let product = arena.add(ExprKind::Math(MathOp::Mul), vec![x_ref, three]);
    let root = arena.add(ExprKind::Do, vec![bind, product]);

    let result = engine.run(&mut arena, root)?;
    assert_eq!(*arena.kind(result), ExprKind::Const(Value::Long(6)));
    Ok(())
}

#[test]
fn second_run_fires_nothing() -> Result<()> {
    let mut engine = simplify_engine(10_000);
    let mut arena = ExprArena::new();

    let x = arena.vars.make("x");
    let init = long(&mut arena, 5);
    let bind = arena.add(ExprKind::Bind(x), vec![init]);
    let x_ref = arena.var_ref(x);
    let one = long(&mut arena, 1);
    let sum = arena.add(ExprKind::Math(MathOp::Add), vec![x_ref, one]);
    let root = arena.add(ExprKind::Do, vec![bind, sum]);

    let simplified = engine.run(&mut arena, root)?;
    assert!(engine.trace.fire_count() > 0);

    engine.trace.clear();
    engine.run(&mut arena, simplified)?;
    assert_eq!(engine.trace.fire_count(), 0, "a second run must reach the same fixpoint");
    Ok(())
}

#[test]
fn iteration_cap_aborts_compilation() {
    let mut engine = simplify_engine(1);
    let mut arena = ExprArena::new();

    // Needs two firings: inline, then collapse the sequence.
    let x = arena.vars.make("x");
    let init = long(&mut arena, 1);
    let bind = arena.add(ExprKind::Bind(x), vec![init]);
    let x_ref = arena.var_ref(x);
    let root = arena.add(ExprKind::Do, vec![bind, x_ref]);

    match engine.run(&mut arena, root) {
        Err(CompileError::IterationCap { cap: 1, .. }) => {}
        other => panic!("expected an iteration-cap error, got {other:?}"),
    }
}

#[test]
fn cap_of_zero_disables_the_phase() -> Result<()> {
    let mut engine = simplify_engine(0);
    let mut arena = ExprArena::new();

    let x = arena.vars.make("x");
    let init = long(&mut arena, 1);
    let bind = arena.add(ExprKind::Bind(x), vec![init]);
    let x_ref = arena.var_ref(x);
    let root = arena.add(ExprKind::Do, vec![bind, x_ref]);

    let out = engine.run(&mut arena, root)?;
    assert_eq!(out, root, "a disabled phase must leave the tree alone");
    assert_eq!(engine.trace.fire_count(), 0);
    Ok(())
}

#[test]
fn function_call_inlines_to_a_constant() -> Result<()> {
    let mut engine = simplify_engine(10_000);
    let mut arena = ExprArena::new();

    let p = arena.vars.make("p");
    let p_ref = arena.var_ref(p);
    let one = long(&mut arena, 1);
    let body = arena.add(ExprKind::Math(MathOp::Add), vec![p_ref, one]);
    let f = arena.fn_def(vec![p], body);
    let arg = long(&mut arena, 4);
    let call = arena.add(ExprKind::FnCall, vec![f, arg]);

    let result = engine.run(&mut arena, call)?;
    assert_eq!(*arena.kind(result), ExprKind::Const(Value::Long(5)));
    Ok(())
}

#[test]
fn nested_strips_fold_away() -> Result<()> {
    let mut engine = simplify_engine(10_000);
    let mut arena = ExprArena::new();

    let data = arena.constant(Value::Array(vec![
        Value::Long(1),
        Value::Null,
        Value::Long(2),
    ]));
    let inner = arena.add(ExprKind::Denull, vec![data]);
    let outer = arena.add(ExprKind::Denull, vec![inner]);

    let result = engine.run(&mut arena, outer)?;
    assert_eq!(
        *arena.kind(result),
        ExprKind::Const(Value::Array(longs(&[1, 2])))
    );
    Ok(())
}

#[test]
fn adjacent_transforms_merge() -> Result<()> {
    let mut engine = simplify_engine(10_000);
    let mut arena = ExprArena::new();

    let src = arena.constant(Value::Array(longs(&[1, 2])));
    let x = arena.vars.make("x");
    let x_ref = arena.var_ref(x);
    let two = long(&mut arena, 2);
    let doubled = arena.add(ExprKind::Math(MathOp::Mul), vec![x_ref, two]);
    let first = arena.add(ExprKind::Transform(x), vec![src, doubled]);

    let y = arena.vars.make("y");
    let y_ref = arena.var_ref(y);
    let one = long(&mut arena, 1);
    let incremented = arena.add(ExprKind::Math(MathOp::Add), vec![y_ref, one]);
    let second = arena.add(ExprKind::Transform(y), vec![first, incremented]);

    let result = engine.run(&mut arena, second)?;
    assert!(matches!(arena.kind(result), ExprKind::Transform(_)));
    assert!(matches!(
        arena.kind(arena.child(result, 0)),
        ExprKind::Const(_)
    ));

    let store = MemStore::new();
    let aggregates = AggregateRegistry::standard();
    let runner = Runner::new(&store, &aggregates);
    assert_eq!(runner.run(&arena, result)?, Value::Array(longs(&[3, 5])));
    Ok(())
}

#[test]
fn for_over_singleton_array_becomes_a_transform() -> Result<()> {
    let mut engine = simplify_engine(10_000);
    let mut arena = ExprArena::new();

    let src = arena.constant(Value::Array(longs(&[1, 2, 3])));
    let x = arena.vars.make("x");
    let x_ref = arena.var_ref(x);
    let element = arena.array(vec![x_ref]);
    let for_expr = arena.add(ExprKind::For(x), vec![src, element]);

    let result = engine.run(&mut arena, for_expr)?;
    // for x in src collect [x] is the identity; everything folds away.
    assert_eq!(
        *arena.kind(result),
        ExprKind::Const(Value::Array(longs(&[1, 2, 3])))
    );
    Ok(())
}

#[test]
fn average_expands_into_a_sum_count_ratio() -> Result<()> {
    let mut engine = simplify_engine(10_000);
    let mut arena = ExprArena::new();

    let data = arena.constant(Value::Array(longs(&[1, 2, 3])));
    let avg = arena.add(ExprKind::AggCall("avg".into()), vec![data]);

    let result = engine.run(&mut arena, avg)?;
    assert!(matches!(arena.kind(result), ExprKind::Math(MathOp::Div)));
    assert!(matches!(
        arena.kind(arena.child(result, 0)),
        ExprKind::AggCall(name) if name == "sum"
    ));

    let store = MemStore::new();
    let aggregates = AggregateRegistry::standard();
    let runner = Runner::new(&store, &aggregates);
    assert_eq!(runner.run(&arena, result)?, Value::Long(2));
    Ok(())
}

#[test]
fn merging_transforms_keeps_per_element_writes() -> Result<()> {
    let mut engine = simplify_engine(10_000);
    let mut arena = ExprArena::new();

    // The outer body ignores its variable; merging must not drop the inner
    // body's write along with it.
    let src = arena.constant(Value::Array(longs(&[1])));
    let x = arena.vars.make("x");
    let x_ref = arena.var_ref(x);
    let row = arena.array(vec![x_ref]);
    let desc = arena.constant(jsonmill::Descriptor::new("temp", "audit").to_value());
    let write = arena.add(ExprKind::Write, vec![row, desc]);
    let x_again = arena.var_ref(x);
    let body = arena.add(ExprKind::Do, vec![write, x_again]);
    let inner = arena.add(ExprKind::Transform(x), vec![src, body]);

    let y = arena.vars.make("y");
    let five = long(&mut arena, 5);
    let outer = arena.add(ExprKind::Transform(y), vec![inner, five]);

    let result = engine.run(&mut arena, outer)?;

    let store = MemStore::new();
    let aggregates = AggregateRegistry::standard();
    let runner = Runner::new(&store, &aggregates);
    assert_eq!(runner.run(&arena, result)?, Value::Array(longs(&[5])));
    assert_eq!(
        store.get(&jsonmill::Descriptor::new("temp", "audit")),
        Some(longs(&[1])),
        "the per-element write must still happen"
    );
    Ok(())
}

#[test]
fn filter_pushes_below_a_pure_transform() -> Result<()> {
    let mut engine = simplify_engine(10_000);
    let mut arena = ExprArena::new();

    // src -> transform x into x.r -> filter f by f.flag
    let rows = Value::Array(vec![
        record(&[("r", record(&[("flag", Value::Bool(true)), ("v", Value::Long(1))]))]),
        record(&[("r", record(&[("flag", Value::Bool(false)), ("v", Value::Long(2))]))]),
    ]);
    let src = arena.constant(rows);
    let x = arena.vars.make("x");
    let x_ref = arena.var_ref(x);
    let project = arena.add(ExprKind::Field("r".into()), vec![x_ref]);
    let transform = arena.add(ExprKind::Transform(x), vec![src, project]);

    let f = arena.vars.make("f");
    let f_ref = arena.var_ref(f);
    let flag = arena.add(ExprKind::Field("flag".into()), vec![f_ref]);
    let root = arena.add(ExprKind::Filter(f), vec![transform, flag]);

    let result = engine.run(&mut arena, root)?;
    assert!(matches!(arena.kind(result), ExprKind::Transform(_)));
    assert!(matches!(
        arena.kind(arena.child(result, 0)),
        ExprKind::Filter(_)
    ));

    let store = MemStore::new();
    let aggregates = AggregateRegistry::standard();
    let runner = Runner::new(&store, &aggregates);
    assert_eq!(
        runner.run(&arena, result)?,
        Value::Array(vec![record(&[
            ("flag", Value::Bool(true)),
            ("v", Value::Long(1)),
        ])])
    );
    Ok(())
}

#[test]
fn filter_stays_above_an_effectful_transform() -> Result<()> {
    let mut engine = simplify_engine(10_000);
    let mut arena = ExprArena::new();

    // Pushing the filter down would re-run the write inside the predicate.
    let src = arena.constant(Value::Array(longs(&[1])));
    let x = arena.vars.make("x");
    let x_ref = arena.var_ref(x);
    let row = arena.array(vec![x_ref]);
    let desc = arena.constant(jsonmill::Descriptor::new("temp", "log").to_value());
    let write = arena.add(ExprKind::Write, vec![row, desc]);
    let x_again = arena.var_ref(x);
    let body = arena.add(ExprKind::Do, vec![write, x_again]);
    let transform = arena.add(ExprKind::Transform(x), vec![src, body]);

    let f = arena.vars.make("f");
    let pred = arena.constant(Value::Bool(true));
    let root = arena.add(ExprKind::Filter(f), vec![transform, pred]);

    let result = engine.run(&mut arena, root)?;
    assert_eq!(result, root);
    assert_eq!(engine.trace.fire_count(), 0);
    Ok(())
}

#[test]
fn effectful_bindings_are_not_duplicated() -> Result<()> {
    let mut engine = simplify_engine(10_000);
    let mut arena = ExprArena::new();

    // ( x = read(...), [x, x] ) keeps its binding: inlining would read twice.
    let x = arena.vars.make("x");
    let desc = arena.constant(
        jsonmill::Descriptor::new("temp", "t").to_value(),
    );
    let rows = arena.constant(Value::Array(longs(&[1])));
    let write = arena.add(ExprKind::Write, vec![rows, desc]);
    let bind = arena.add(ExprKind::Bind(x), vec![write]);
    let a = arena.var_ref(x);
    let b = arena.var_ref(x);
    let pair = arena.array(vec![a, b]);
    let root = arena.add(ExprKind::Do, vec![bind, pair]);

    let result = engine.run(&mut arena, root)?;
    assert_eq!(*arena.kind(result), ExprKind::Do);
    assert!(matches!(
        arena.kind(arena.child(result, 0)),
        ExprKind::Bind(_)
    ));
    Ok(())
}
