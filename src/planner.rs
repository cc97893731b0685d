//! Plan compilation: turning classified segments into distributed job nodes.
//!
//! [`ToMapReduce`] is a root-only rule. Each firing classifies the whole
//! tree (see [`crate::segment`]) and compiles every compilable segment
//! bottom-up, replacing each one with a [`ExprKind::MapReduce`] node plus,
//! where the segment did not end in a write, a read of the job's output.
//! On an already-planned tree classification finds only bare reads and
//! compiled jobs, nothing fires, and the phase reaches its fixpoint.

use crate::aggregate::AggregateRegistry;
use crate::error::CompileError;
use crate::expr::{ExprArena, ExprId, ExprKind, JobShape, JobSpec};
use crate::io::AdapterRegistry;
use crate::rewrite::{RewriteEngine, RewritePhase, Rule, RuleCx, Traversal};
use crate::rules::simplification_rules;
use crate::segment::{Classifier, ReduceKind, Segment, SegmentKind, classify_reduce};
use crate::value::Value;

/// Engine with the standard schedule: simplify to fixpoint, plan, then
/// simplify again to clean up what planning exposed.
pub fn standard_engine(aggregates: AggregateRegistry, adapters: AdapterRegistry) -> RewriteEngine {
    let mut engine = RewriteEngine::new(aggregates, adapters);
    let mut simplify = RewritePhase::new("simplify", Traversal::PostOrder, 10_000);
    for rule in simplification_rules() {
        simplify = simplify.rule(rule);
    }
    let simplify_index = engine.phase(simplify);
    let plan = RewritePhase::new("plan", Traversal::RootOnly, 100).rule(Box::new(ToMapReduce));
    engine.phase(plan);
    engine.reschedule(simplify_index);
    engine
}

/// The planning rule. Registered as a wildcard in a root-only phase; the
/// node it receives is always the engine's sentinel.
pub struct ToMapReduce;

impl Rule for ToMapReduce {
    fn name(&self) -> &'static str {
        "to-map-reduce"
    }

    fn fire_on(&self) -> Option<&'static [crate::expr::ExprTag]> {
        None
    }

    fn rewrite(&self, cx: &mut RuleCx<'_>, expr: ExprId) -> Result<bool, CompileError> {
        let segment = Classifier::new(cx.arena, cx.adapters, cx.aggregates).classify(expr);
        if cx.trace.enabled {
            record_classification(cx, &segment);
        }
        compile_segment(cx, &segment)
    }
}

fn record_classification(cx: &mut RuleCx<'_>, segment: &Segment) {
    let node = cx.arena.describe(segment.root);
    cx.trace.classified(node, format!("{:?}", segment.kind));
    for child in &segment.children {
        record_classification(cx, child);
    }
}

/// Compile children before parents, mirroring the post-order discipline of
/// the rewrite walk. A group's input segments are not compiled on their
/// own: they fuse into the group job's map functions. Only the work behind
/// a materialization boundary compiles separately.
fn compile_segment(cx: &mut RuleCx<'_>, segment: &Segment) -> Result<bool, CompileError> {
    let mut fired = false;
    if segment.kind == SegmentKind::Group {
        for input in &segment.children {
            for inner in &input.children {
                fired |= compile_segment(cx, inner)?;
            }
        }
        fired |= compile_group(cx, segment.root)?;
        return Ok(fired);
    }
    for child in &segment.children {
        fired |= compile_segment(cx, child)?;
    }
    if matches!(segment.kind, SegmentKind::Map | SegmentKind::InlineMap) {
        fired |= compile_map(cx, segment.root)?;
    }
    Ok(fired)
}

/// First read reachable through element-wise nodes along the source spine.
fn spine_read(arena: &ExprArena, mut node: ExprId) -> Option<ExprId> {
    loop {
        match arena.kind(node) {
            ExprKind::Read => return Some(node),
            ExprKind::Transform(_)
            | ExprKind::Filter(_)
            | ExprKind::For(_)
            | ExprKind::Denull
            | ExprKind::Deempty => node = arena.child(node, 0),
            _ => return None,
        }
    }
}

/// First group-by reachable the same way.
fn spine_group(arena: &ExprArena, mut node: ExprId) -> Option<ExprId> {
    loop {
        match arena.kind(node) {
            ExprKind::GroupBy(_) => return Some(node),
            ExprKind::Transform(_)
            | ExprKind::Filter(_)
            | ExprKind::For(_)
            | ExprKind::Denull
            | ExprKind::Deempty => node = arena.child(node, 0),
            _ => return None,
        }
    }
}

/// Compile a map segment into a map-only job.
///
/// The map function takes one partition of the input and replays the
/// segment's chain over it with the read swapped for the partition
/// parameter, tagging each element with a null key.
fn compile_map(cx: &mut RuleCx<'_>, seg_root: ExprId) -> Result<bool, CompileError> {
    // A job that only re-reads its input is pure overhead.
    if matches!(cx.arena.kind(seg_root), ExprKind::Read) {
        return Ok(false);
    }

    let (is_write, chain_top, sink_desc) = match cx.arena.kind(seg_root) {
        ExprKind::Write => (
            true,
            cx.arena.child(seg_root, 0),
            Some(cx.arena.child(seg_root, 1)),
        ),
        _ => (false, seg_root, None),
    };
    let read = spine_read(cx.arena, chain_top)
        .ok_or_else(|| CompileError::structural(seg_root, "map segment without a read anchor"))?;

    let anchor = cx.arena.parent(seg_root).expect("segment root under sentinel");
    let slot = cx.arena.child_slot(seg_root).expect("segment root under sentinel");

    if cx.trace.enabled {
        let node = cx.arena.describe(seg_root);
        cx.trace.planned(node, "map-only job");
    }

    let input_desc = cx.arena.child(read, 0);
    cx.arena.detach(input_desc);
    let part = cx.arena.vars.make("part");
    let part_ref = cx.arena.var_ref(part);
    cx.arena.replace_in_parent(read, part_ref);
    let chain = if read == chain_top { part_ref } else { chain_top };
    match is_write {
        true => cx.arena.detach(chain),
        false => cx.arena.detach(seg_root),
    }

    let elem = cx.arena.vars.make("e");
    let null_key = cx.arena.constant(Value::Null);
    let elem_ref = cx.arena.var_ref(elem);
    let pair = cx.arena.array(vec![null_key, elem_ref]);
    let body = cx.arena.add(ExprKind::Transform(elem), vec![chain, pair]);
    let map_fn = cx.arena.fn_def(vec![part], body);

    let output_desc = match sink_desc {
        Some(d) => {
            cx.arena.detach(d);
            d
        }
        None => {
            let temp = cx.adapters.make_temp();
            cx.arena.constant(temp.to_value())
        }
    };

    let job = cx.arena.add(
        ExprKind::MapReduce(JobSpec { n_inputs: 1, shape: JobShape::MapOnly }),
        vec![input_desc, output_desc, map_fn],
    );

    if is_write {
        cx.arena.replace_in_parent(seg_root, job);
    } else {
        let result = cx.arena.add(ExprKind::Read, vec![job]);
        cx.arena.splice(anchor, slot, vec![result]);
    }
    Ok(true)
}

/// Compile a group segment into a grouped job.
///
/// Each input contributes a map function emitting `[by(elem), elem]` pairs.
/// Reduce-side analysis then decides, input by input, whether a combine
/// stage is sound; one combinable input upgrades the job to the aggregate
/// shape, with non-combinable inputs keeping a null combine slot. The
/// reduce function receives the key plus one combined-or-materialized value
/// per input and returns the output rows for that key; element-wise work
/// the segment absorbed above the group-by replays inside it.
fn compile_group(cx: &mut RuleCx<'_>, seg_root: ExprId) -> Result<bool, CompileError> {
    let (is_write, chain_top, sink_desc) = match cx.arena.kind(seg_root) {
        ExprKind::Write => (
            true,
            cx.arena.child(seg_root, 0),
            Some(cx.arena.child(seg_root, 1)),
        ),
        _ => (false, seg_root, None),
    };
    let group = spine_group(cx.arena, chain_top)
        .ok_or_else(|| CompileError::structural(seg_root, "group segment without a group-by"))?;
    let spec = cx.arena.group_spec(group).clone();
    let n = spec.inputs.len();
    if n == 0 {
        return Err(CompileError::structural(group, "group-by with no inputs"));
    }

    let anchor = cx.arena.parent(seg_root).expect("segment root under sentinel");
    let slot = cx.arena.child_slot(seg_root).expect("segment root under sentinel");

    // Combiner eligibility, decided per input on the untouched collect
    // expression.
    let collect = cx.arena.group_collect(group);
    let analyses: Vec<_> = spec
        .inputs
        .iter()
        .map(|input| classify_reduce(cx.arena, cx.aggregates, collect, input.into_var))
        .collect();
    let shape = if analyses.iter().any(|a| a.kind == ReduceKind::CombineGroup) {
        JobShape::Aggregate
    } else {
        JobShape::Plain
    };

    if cx.trace.enabled {
        let node = cx.arena.describe(group);
        let decision = match shape {
            JobShape::Aggregate => "group job with combine stage",
            _ => "group job without combine stage",
        };
        cx.trace.planned(node, decision);
    }

    // Combine stage: carve each combinable aggregate call out of the collect
    // expression, leaving a reference to its combined result behind.
    let mut combine_slots = Vec::new();
    let mut reduce_params = Vec::with_capacity(n);
    for (input, analysis) in spec.inputs.iter().zip(&analyses) {
        if analysis.kind == ReduceKind::CombineGroup {
            let agg = analysis.agg_call.expect("combine analysis names its aggregate call");
            let combined = cx.arena.vars.make("combined");
            let combined_ref = cx.arena.var_ref(combined);
            cx.arena.replace_in_parent(agg, combined_ref);
            let vals = cx.arena.vars.make("vals");
            cx.arena.replace_var(agg, input.into_var, vals);
            combine_slots.push(cx.arena.fn_def(vec![vals], agg));
            reduce_params.push(combined);
        } else {
            if shape == JobShape::Aggregate {
                combine_slots.push(cx.arena.constant(Value::Null));
            }
            reduce_params.push(input.into_var);
        }
    }
    // Carving may have replaced the collect expression itself.
    let collect = cx.arena.group_collect(group);

    // Map stage per input.
    let sources: Vec<ExprId> = (0..n).map(|i| cx.arena.group_source(group, i)).collect();
    let bys: Vec<ExprId> = (0..n).map(|i| cx.arena.group_by_expr(group, i)).collect();
    let mut input_descs = Vec::with_capacity(n);
    let mut map_fns = Vec::with_capacity(n);
    for (i, input) in spec.inputs.iter().enumerate() {
        let source = sources[i];
        let read = spine_read(cx.arena, source).ok_or_else(|| {
            CompileError::structural(source, "group input is not anchored on a read")
        })?;
        let desc = cx.arena.child(read, 0);
        cx.arena.detach(desc);
        input_descs.push(desc);

        let part = cx.arena.vars.make("part");
        let part_ref = cx.arena.var_ref(part);
        cx.arena.detach(source);
        let chain = if read == source {
            part_ref
        } else {
            cx.arena.replace_in_parent(read, part_ref);
            source
        };
        let by = bys[i];
        cx.arena.detach(by);
        let elem_ref = cx.arena.var_ref(input.bind_var);
        let pair = cx.arena.array(vec![by, elem_ref]);
        let body = cx.arena.add(ExprKind::Transform(input.bind_var), vec![chain, pair]);
        map_fns.push(cx.arena.fn_def(vec![part], body));
    }

    // Reduce stage: one key's output rows. The collect value is a single
    // element; any absorbed element-wise chain replays over it.
    cx.arena.detach(collect);
    let per_key = cx.arena.array(vec![collect]);
    let body = if chain_top == group {
        if !is_write {
            cx.arena.detach(seg_root);
        }
        per_key
    } else {
        cx.arena.detach(chain_top);
        cx.arena.replace_in_parent(group, per_key);
        chain_top
    };
    let mut params = Vec::with_capacity(n + 1);
    params.push(spec.key_var);
    params.extend(reduce_params);
    let reduce_fn = cx.arena.fn_def(params, body);

    let output_desc = match sink_desc {
        Some(d) => {
            cx.arena.detach(d);
            d
        }
        None => {
            let temp = cx.adapters.make_temp();
            cx.arena.constant(temp.to_value())
        }
    };

    let mut children = input_descs;
    children.push(output_desc);
    children.extend(map_fns);
    children.extend(combine_slots);
    children.push(reduce_fn);
    let job = cx
        .arena
        .add(ExprKind::MapReduce(JobSpec { n_inputs: n, shape }), children);

    if is_write {
        cx.arena.replace_in_parent(seg_root, job);
    } else {
        let result = cx.arena.add(ExprKind::Read, vec![job]);
        cx.arena.splice(anchor, slot, vec![result]);
    }
    Ok(true)
}
