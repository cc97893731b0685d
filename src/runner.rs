//! Reference evaluator.
//!
//! Runs an expression tree, compiled or not, against a [`MemStore`]. It
//! exists to pin the compiler's semantics: a tree must evaluate to the same
//! result before and after rewriting and planning. Compiled jobs are
//! simulated with real partitioning so a wrongly synthesized combine stage
//! produces a wrong answer here, not just in production.
//!
//! The stage contracts match what the planner assumes: map functions run
//! once per input partition with no ordering guarantee, combine functions
//! may fold any grouping of a key's values, and the reduce function runs
//! exactly once per key.

use crate::aggregate::AggregateRegistry;
use crate::expr::{ExprArena, ExprId, ExprKind, JobShape, VarId};
use crate::io::{Descriptor, MemStore};
use crate::value::Value;
use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;

/// Variable bindings, scoped as a stack.
#[derive(Default, Debug)]
pub struct Env {
    frames: Vec<(VarId, Value)>,
}

impl Env {
    pub fn bind(&mut self, var: VarId, value: Value) {
        self.frames.push((var, value));
    }

    pub fn lookup(&self, var: VarId) -> Option<&Value> {
        self.frames.iter().rev().find(|(v, _)| *v == var).map(|(_, val)| val)
    }

    fn mark(&self) -> usize {
        self.frames.len()
    }

    fn reset(&mut self, mark: usize) {
        self.frames.truncate(mark);
    }
}

pub struct Runner<'a> {
    pub store: &'a MemStore,
    pub aggregates: &'a AggregateRegistry,
    /// Partitions simulated per job input. More than one, or combine stages
    /// never merge anything.
    pub partitions: usize,
}

impl<'a> Runner<'a> {
    pub fn new(store: &'a MemStore, aggregates: &'a AggregateRegistry) -> Self {
        Self { store, aggregates, partitions: 3 }
    }

    pub fn run(&self, arena: &ExprArena, root: ExprId) -> Result<Value> {
        self.eval(arena, root, &mut Env::default())
    }

    pub fn eval(&self, arena: &ExprArena, expr: ExprId, env: &mut Env) -> Result<Value> {
        match arena.kind(expr) {
            ExprKind::Const(v) => Ok(v.clone()),
            ExprKind::VarRef(v) => env
                .lookup(*v)
                .cloned()
                .with_context(|| format!("unbound variable ${}", arena.vars.name(*v))),
            ExprKind::Array => {
                let items: Result<Vec<Value>> = arena
                    .children(expr)
                    .iter()
                    .map(|&c| self.eval(arena, c, env))
                    .collect();
                Ok(Value::Array(items?))
            }
            ExprKind::Record(names) => {
                let mut fields = BTreeMap::new();
                for (name, &c) in names.iter().zip(arena.children(expr)) {
                    fields.insert(name.clone(), self.eval(arena, c, env)?);
                }
                Ok(Value::Record(fields))
            }
            ExprKind::Field(name) => {
                let v = self.eval(arena, arena.child(expr, 0), env)?;
                Ok(v.field(name))
            }
            ExprKind::Math(op) => {
                let lhs = self.eval(arena, arena.child(expr, 0), env)?;
                let rhs = self.eval(arena, arena.child(expr, 1), env)?;
                Value::math(*op, &lhs, &rhs)
                    .with_context(|| format!("cannot apply {op:?} to {lhs} and {rhs}"))
            }
            ExprKind::For(var) => {
                let items = self.eval_array(arena, arena.child(expr, 0), env)?;
                let body = arena.child(expr, 1);
                let mut out = Vec::new();
                for item in items {
                    let mark = env.mark();
                    env.bind(*var, item);
                    let v = self.eval(arena, body, env)?;
                    env.reset(mark);
                    match v {
                        Value::Null => {}
                        Value::Array(items) => out.extend(items),
                        other => bail!("for-body produced a non-array {other}"),
                    }
                }
                Ok(Value::Array(out))
            }
            ExprKind::Transform(var) => {
                let items = self.eval_array(arena, arena.child(expr, 0), env)?;
                let body = arena.child(expr, 1);
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    let mark = env.mark();
                    env.bind(*var, item);
                    out.push(self.eval(arena, body, env)?);
                    env.reset(mark);
                }
                Ok(Value::Array(out))
            }
            ExprKind::Filter(var) => {
                let items = self.eval_array(arena, arena.child(expr, 0), env)?;
                let body = arena.child(expr, 1);
                let mut out = Vec::new();
                for item in items {
                    let mark = env.mark();
                    env.bind(*var, item.clone());
                    let keep = self.eval(arena, body, env)?;
                    env.reset(mark);
                    if keep.as_bool() == Some(true) {
                        out.push(item);
                    }
                }
                Ok(Value::Array(out))
            }
            ExprKind::Do => {
                let mark = env.mark();
                let mut last = Value::Null;
                for &c in arena.children(expr) {
                    last = self.eval(arena, c, env)?;
                }
                env.reset(mark);
                Ok(last)
            }
            ExprKind::Bind(var) => {
                let v = self.eval(arena, arena.child(expr, 0), env)?;
                env.bind(*var, v.clone());
                Ok(v)
            }
            ExprKind::GroupBy(_) => self.eval_group(arena, expr, env),
            ExprKind::AggCall(name) => {
                let items = self.eval_array(arena, arena.child(expr, 0), env)?;
                let mut acc = self
                    .aggregates
                    .accumulator(name)
                    .with_context(|| format!("unknown aggregate '{name}'"))?;
                acc.init();
                for item in &items {
                    acc.accumulate(item)?;
                }
                Ok(acc.final_result()?)
            }
            ExprKind::Read => {
                let desc = self.eval_descriptor(arena, arena.child(expr, 0), env)?;
                let rows = self
                    .store
                    .get(&desc)
                    .with_context(|| format!("nothing stored at '{}'", desc.location))?;
                Ok(Value::Array(rows))
            }
            ExprKind::Write => {
                let rows = self.eval_array(arena, arena.child(expr, 0), env)?;
                let desc = self.eval_descriptor(arena, arena.child(expr, 1), env)?;
                self.store.put(&desc, rows);
                Ok(desc.to_value())
            }
            ExprKind::Denull => {
                let items = self.eval_array(arena, arena.child(expr, 0), env)?;
                Ok(Value::Array(items.into_iter().filter(|v| !v.is_null()).collect()))
            }
            ExprKind::Deempty => {
                let items = self.eval_array(arena, arena.child(expr, 0), env)?;
                Ok(Value::Array(
                    items.into_iter().filter(|v| !v.is_empty_like()).collect(),
                ))
            }
            ExprKind::FnDef(_) => bail!("function definition outside a call position"),
            ExprKind::FnCall => {
                let callee = arena.child(expr, 0);
                let (params, body) = fn_parts(arena, callee)?;
                let args = &arena.children(expr)[1..];
                if args.len() != params.len() {
                    bail!("call passes {} args to a {}-parameter function", args.len(), params.len());
                }
                let values: Result<Vec<Value>> =
                    args.iter().map(|&a| self.eval(arena, a, env)).collect();
                let mark = env.mark();
                for (param, value) in params.iter().zip(values?) {
                    env.bind(*param, value);
                }
                let out = self.eval(arena, body, env);
                env.reset(mark);
                out
            }
            ExprKind::MapReduce(_) => self.run_job(arena, expr, env),
        }
    }

    /// Evaluate to an array; null passes as the empty array, as it does in
    /// every iteration context of the language.
    fn eval_array(&self, arena: &ExprArena, expr: ExprId, env: &mut Env) -> Result<Vec<Value>> {
        match self.eval(arena, expr, env)? {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => Ok(items),
            other => bail!("expected an array, got {other}"),
        }
    }

    fn eval_descriptor(&self, arena: &ExprArena, expr: ExprId, env: &mut Env) -> Result<Descriptor> {
        let v = self.eval(arena, expr, env)?;
        Descriptor::from_value(&v).with_context(|| format!("not a storage descriptor: {v}"))
    }

    /// Sequential group-by semantics: one collect value per distinct key, in
    /// key order.
    fn eval_group(&self, arena: &ExprArena, group: ExprId, env: &mut Env) -> Result<Value> {
        let spec = arena.group_spec(group).clone();
        let n = spec.inputs.len();
        let mut buckets: BTreeMap<Value, Vec<Vec<Value>>> = BTreeMap::new();
        for (i, input) in spec.inputs.iter().enumerate() {
            let items = self.eval_array(arena, arena.group_source(group, i), env)?;
            let by = arena.group_by_expr(group, i);
            for item in items {
                let mark = env.mark();
                env.bind(input.bind_var, item.clone());
                let key = self.eval(arena, by, env)?;
                env.reset(mark);
                buckets.entry(key).or_insert_with(|| vec![Vec::new(); n])[i].push(item);
            }
        }

        let collect = arena.group_collect(group);
        let mut out = Vec::with_capacity(buckets.len());
        for (key, per_input) in buckets {
            let mark = env.mark();
            env.bind(spec.key_var, key);
            for (input, values) in spec.inputs.iter().zip(per_input) {
                env.bind(input.into_var, Value::Array(values));
            }
            let v = self.eval(arena, collect, env);
            env.reset(mark);
            out.push(v?);
        }
        Ok(Value::Array(out))
    }

    /// Simulate one compiled job and return its output descriptor value.
    fn run_job(&self, arena: &ExprArena, job: ExprId, env: &mut Env) -> Result<Value> {
        let spec = arena.job_spec(job);
        let mut inputs = Vec::with_capacity(spec.n_inputs);
        for i in 0..spec.n_inputs {
            let desc = self.eval_descriptor(arena, arena.job_input(job, i), env)?;
            let rows = self
                .store
                .get(&desc)
                .with_context(|| format!("job input '{}' is empty", desc.location))?;
            inputs.push(rows);
        }
        let output = self.eval_descriptor(arena, arena.job_output(job), env)?;

        match spec.shape {
            JobShape::MapOnly => {
                let mut rows = Vec::new();
                for pair in self.map_stage(arena, arena.job_map(job, 0), &inputs[0], env)? {
                    rows.push(pair_value(&pair)?);
                }
                self.store.put(&output, rows);
            }
            JobShape::Plain | JobShape::Aggregate => {
                // Shuffle: per-key, per-input value buckets.
                let mut buckets: BTreeMap<Value, Vec<Vec<Value>>> = BTreeMap::new();
                for (i, rows) in inputs.iter().enumerate() {
                    for pair in self.map_stage(arena, arena.job_map(job, i), rows, env)? {
                        let key = pair_key(&pair)?;
                        let value = pair_value(&pair)?;
                        buckets
                            .entry(key)
                            .or_insert_with(|| vec![Vec::new(); spec.n_inputs])[i]
                            .push(value);
                    }
                }

                let reduce = arena.job_reduce(job);
                let (reduce_params, reduce_body) = fn_parts(arena, reduce)?;
                if reduce_params.len() != spec.n_inputs + 1 {
                    bail!("reduce stage takes the key plus one value per input");
                }
                let mut rows = Vec::new();
                for (key, per_input) in buckets {
                    let mark = env.mark();
                    env.bind(reduce_params[0], key);
                    for (i, values) in per_input.into_iter().enumerate() {
                        let arg = match arena.job_combine(job, i) {
                            Some(combine) if !matches!(arena.kind(combine), ExprKind::Const(Value::Null)) => {
                                self.combine_stage(arena, combine, values, env)?
                            }
                            _ => Value::Array(values),
                        };
                        env.bind(reduce_params[1 + i], arg);
                    }
                    let per_key = self.eval_array(arena, reduce_body, env);
                    env.reset(mark);
                    rows.extend(per_key?);
                }
                self.store.put(&output, rows);
            }
        }
        Ok(output.to_value())
    }

    /// Run a map function once per partition; no ordering guarantee is
    /// exercised beyond the partition split itself.
    fn map_stage(
        &self,
        arena: &ExprArena,
        map_fn: ExprId,
        rows: &[Value],
        env: &mut Env,
    ) -> Result<Vec<Value>> {
        let (params, body) = fn_parts(arena, map_fn)?;
        let [param] = params.as_slice() else {
            bail!("map stage takes exactly one partition argument");
        };
        let mut pairs = Vec::new();
        for chunk in partition(rows, self.partitions) {
            let mark = env.mark();
            env.bind(*param, Value::Array(chunk.to_vec()));
            let out = self.eval_array(arena, body, env);
            env.reset(mark);
            pairs.extend(out?);
        }
        Ok(pairs)
    }

    /// Run a combine function over one key's values: a partial per
    /// partition, partials merged through the aggregate's combine operation,
    /// then finalized.
    fn combine_stage(
        &self,
        arena: &ExprArena,
        combine_fn: ExprId,
        values: Vec<Value>,
        env: &mut Env,
    ) -> Result<Value> {
        let (params, body) = fn_parts(arena, combine_fn)?;
        let [param] = params.as_slice() else {
            bail!("combine stage takes exactly one values argument");
        };
        let ExprKind::AggCall(name) = arena.kind(body) else {
            bail!("combine stage is not an aggregate call");
        };
        let agg_input = arena.child(body, 0);

        let mut partials = Vec::new();
        for chunk in partition(&values, self.partitions) {
            let mark = env.mark();
            env.bind(*param, Value::Array(chunk.to_vec()));
            let items = self.eval_array(arena, agg_input, env);
            env.reset(mark);
            let items = items?;
            let mut acc = self.aggregates.algebraic_accumulator(name)?;
            acc.init();
            for item in &items {
                acc.accumulate(item)?;
            }
            partials.push(acc.partial_result()?);
        }

        let mut merger = self.aggregates.algebraic_accumulator(name)?;
        merger.init();
        for partial in &partials {
            merger.combine(partial)?;
        }
        Ok(merger.final_result()?)
    }
}

fn fn_parts(arena: &ExprArena, f: ExprId) -> Result<(Vec<VarId>, ExprId)> {
    match arena.kind(f) {
        ExprKind::FnDef(params) => Ok((params.clone(), arena.child(f, 0))),
        other => bail!("expected a function, got {other:?}"),
    }
}

fn pair_key(pair: &Value) -> Result<Value> {
    match pair.as_array() {
        Some([k, _]) => Ok(k.clone()),
        _ => bail!("map stage emitted a malformed pair: {pair}"),
    }
}

fn pair_value(pair: &Value) -> Result<Value> {
    match pair.as_array() {
        Some([_, v]) => Ok(v.clone()),
        _ => bail!("map stage emitted a malformed pair: {pair}"),
    }
}

/// Split `rows` into up to `k` contiguous chunks, every row in exactly one
/// chunk. Empty chunks are kept so aggregate identities get exercised.
fn partition(rows: &[Value], k: usize) -> Vec<&[Value]> {
    let k = k.max(1);
    let size = rows.len().div_ceil(k).max(1);
    let mut chunks: Vec<&[Value]> = rows.chunks(size).collect();
    while chunks.len() < k {
        chunks.push(&[]);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{GroupInput, GroupSpec};
    use crate::value::MathOp;

    fn runner_fixtures() -> (MemStore, AggregateRegistry) {
        (MemStore::new(), AggregateRegistry::standard())
    }

    fn longs(vals: &[i64]) -> Vec<Value> {
        vals.iter().map(|&v| Value::Long(v)).collect()
    }

    #[test]
    fn transform_filter_and_math() -> Result<()> {
        let (store, aggs) = runner_fixtures();
        let runner = Runner::new(&store, &aggs);
        let mut arena = ExprArena::new();

        let src = arena.constant(Value::Array(longs(&[1, 2, 3, 4])));
        let v = arena.vars.make("x");
        let v_ref = arena.var_ref(v);
        let two = arena.constant(Value::Long(2));
        let doubled = arena.add(ExprKind::Math(MathOp::Mul), vec![v_ref, two]);
        let transform = arena.add(ExprKind::Transform(v), vec![src, doubled]);

        assert_eq!(
            runner.run(&arena, transform)?,
            Value::Array(longs(&[2, 4, 6, 8]))
        );
        Ok(())
    }

    #[test]
    fn sequential_group_counts_per_key() -> Result<()> {
        let (store, aggs) = runner_fixtures();
        let runner = Runner::new(&store, &aggs);
        let mut arena = ExprArena::new();

        let rows: Vec<Value> = ["a", "b", "a", "a"]
            .iter()
            .map(|k| {
                let mut fields = BTreeMap::new();
                fields.insert("k".to_string(), Value::string(*k));
                Value::Record(fields)
            })
            .collect();
        let src = arena.constant(Value::Array(rows));
        let bind_var = arena.vars.make("x");
        let into_var = arena.vars.make("xs");
        let key_var = arena.vars.make("k");
        let x_ref = arena.var_ref(bind_var);
        let by = arena.add(ExprKind::Field("k".into()), vec![x_ref]);
        let xs_ref = arena.var_ref(into_var);
        let collect = arena.add(ExprKind::AggCall("count".into()), vec![xs_ref]);
        let spec = GroupSpec {
            inputs: vec![GroupInput { bind_var, into_var }],
            key_var,
        };
        let group = arena.add(ExprKind::GroupBy(spec), vec![src, by, collect]);

        // Key order: "a" before "b".
        assert_eq!(runner.run(&arena, group)?, Value::Array(longs(&[3, 1])));
        Ok(())
    }

    #[test]
    fn write_then_read_round_trips_through_the_store() -> Result<()> {
        let (store, aggs) = runner_fixtures();
        let runner = Runner::new(&store, &aggs);
        let mut arena = ExprArena::new();

        let data = arena.constant(Value::Array(longs(&[7, 8])));
        let desc = arena.constant(Descriptor::new("temp", "t1").to_value());
        let write = arena.add(ExprKind::Write, vec![data, desc]);
        let read = arena.add(ExprKind::Read, vec![write]);

        assert_eq!(runner.run(&arena, read)?, Value::Array(longs(&[7, 8])));
        Ok(())
    }

    #[test]
    fn null_source_iterates_as_empty() -> Result<()> {
        let (store, aggs) = runner_fixtures();
        let runner = Runner::new(&store, &aggs);
        let mut arena = ExprArena::new();

        let src = arena.constant(Value::Null);
        let v = arena.vars.make("x");
        let body = arena.var_ref(v);
        let transform = arena.add(ExprKind::Transform(v), vec![src, body]);
        assert_eq!(runner.run(&arena, transform)?, Value::Array(vec![]));
        Ok(())
    }

    #[test]
    fn partition_covers_all_rows() {
        let rows = longs(&[1, 2, 3, 4, 5]);
        let chunks = partition(&rows, 3);
        assert_eq!(chunks.len(), 3);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, rows.len());
    }
}
