//! Segment classification: deciding which parts of a tree can run as
//! distributed map/group stages and which must stay sequential.
//!
//! A [`Segment`] is a shadow tree over the expression tree. One segment
//! covers a maximal chain of expressions that can compile into a single
//! distributed stage; its children are the segments of the foreign work
//! feeding it. Classification is the read-only half of planning, with one
//! sanctioned exception: a group input whose own segment is parallel output
//! gets a materialization boundary (write to a temporary, read it back)
//! spliced in, because a group cannot consume another job's live output
//! directly.

use crate::aggregate::AggregateRegistry;
use crate::expr::{ExprArena, ExprId, ExprKind, VarId};
use crate::io::AdapterRegistry;

/// What a subtree can run as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    /// Per-element chain anchored on a parallel read.
    Map,
    /// Map chain anchored on a materialization boundary (read of a
    /// just-written temporary).
    InlineMap,
    /// Group-by whose inputs all reduce to map chains.
    Group,
    /// Anything that must run locally, in order.
    Sequential,
    /// Already-compiled job; terminal.
    MapReduce,
}

/// Shadow-tree node. `root` is the topmost expression the segment covers.
#[derive(Debug)]
pub struct Segment {
    pub kind: SegmentKind,
    pub root: ExprId,
    pub children: Vec<Segment>,
}

impl Segment {
    fn leaf(kind: SegmentKind, root: ExprId) -> Segment {
        Segment { kind, root, children: Vec::new() }
    }
}

/// Classifies expression trees against the adapter and aggregate registries.
pub struct Classifier<'a> {
    pub arena: &'a mut ExprArena,
    pub adapters: &'a AdapterRegistry,
    pub aggregates: &'a AggregateRegistry,
}

impl<'a> Classifier<'a> {
    pub fn new(
        arena: &'a mut ExprArena,
        adapters: &'a AdapterRegistry,
        aggregates: &'a AggregateRegistry,
    ) -> Self {
        Self { arena, adapters, aggregates }
    }

    /// Classify the subtree at `expr`. Deterministic for a given tree and
    /// registries; mutates the tree only to insert group-input
    /// materialization boundaries.
    pub fn classify(&mut self, expr: ExprId) -> Segment {
        match self.arena.kind(expr).clone() {
            ExprKind::Read => self.classify_read(expr),
            ExprKind::Write => self.classify_write(expr),
            ExprKind::For(_) | ExprKind::Transform(_) | ExprKind::Filter(_) => {
                self.classify_loop(expr)
            }
            ExprKind::GroupBy(_) => self.classify_group(expr),
            ExprKind::Denull | ExprKind::Deempty => self.classify_strip(expr),
            ExprKind::MapReduce(_) => Segment::leaf(SegmentKind::MapReduce, expr),
            // A function body is not segmented until the call is inlined.
            ExprKind::FnDef(_) => Segment::leaf(SegmentKind::Sequential, expr),
            _ => self.sequential_default(expr),
        }
    }

    /// Every child classified independently under a sequential parent.
    fn sequential_default(&mut self, expr: ExprId) -> Segment {
        let children: Vec<ExprId> = self.arena.children(expr).to_vec();
        let children = children.into_iter().map(|c| self.classify(c)).collect();
        Segment { kind: SegmentKind::Sequential, root: expr, children }
    }

    fn classify_read(&mut self, expr: ExprId) -> Segment {
        let descriptor = self.arena.child(expr, 0);
        if self.adapters.expr_is_parallel(self.arena, descriptor) {
            Segment::leaf(SegmentKind::Map, expr)
        } else {
            self.sequential_default(expr)
        }
    }

    fn classify_write(&mut self, expr: ExprId) -> Segment {
        let data = self.arena.child(expr, 0);
        let descriptor = self.arena.child(expr, 1);
        let data_seg = self.classify(data);
        let fusible = matches!(
            data_seg.kind,
            SegmentKind::Map | SegmentKind::InlineMap | SegmentKind::Group
        );
        if fusible && self.adapters.expr_is_parallel(self.arena, descriptor) {
            // The write becomes the job's sink; it joins the data's segment.
            Segment { kind: data_seg.kind, root: expr, children: data_seg.children }
        } else {
            Segment { kind: SegmentKind::Sequential, root: expr, children: vec![data_seg] }
        }
    }

    fn classify_loop(&mut self, expr: ExprId) -> Segment {
        let source = self.arena.child(expr, 0);
        let body = self.arena.child(expr, 1);
        let source_seg = self.classify(source);
        match source_seg.kind {
            SegmentKind::Map | SegmentKind::InlineMap | SegmentKind::Group
                if !self.arena.might_contain_mapreduce(body) =>
            {
                Segment { kind: source_seg.kind, root: expr, children: source_seg.children }
            }
            _ => Segment {
                kind: SegmentKind::Sequential,
                root: expr,
                children: vec![source_seg],
            },
        }
    }

    fn classify_strip(&mut self, expr: ExprId) -> Segment {
        let inner_seg = self.classify(self.arena.child(expr, 0));
        match inner_seg.kind {
            SegmentKind::Map | SegmentKind::InlineMap => {
                Segment { kind: inner_seg.kind, root: expr, children: inner_seg.children }
            }
            _ => Segment {
                kind: SegmentKind::Sequential,
                root: expr,
                children: vec![inner_seg],
            },
        }
    }

    fn classify_group(&mut self, expr: ExprId) -> Segment {
        let spec = self.arena.group_spec(expr).clone();
        let collect = self.arena.group_collect(expr);
        if self.arena.might_contain_mapreduce(collect) {
            return self.sequential_default(expr);
        }
        for i in 0..spec.inputs.len() {
            let by = self.arena.group_by_expr(expr, i);
            if self.arena.might_contain_mapreduce(by) {
                return self.sequential_default(expr);
            }
        }

        let mut inputs = Vec::with_capacity(spec.inputs.len());
        for i in 0..spec.inputs.len() {
            let source = self.arena.group_source(expr, i);
            let seg = self.classify(source);
            let seg = match seg.kind {
                SegmentKind::Map | SegmentKind::InlineMap => seg,
                SegmentKind::Group => self.materialize_input(expr, i, seg),
                SegmentKind::MapReduce => self.reread_input(expr, i, seg),
                SegmentKind::Sequential => return self.sequential_default(expr),
            };
            inputs.push(seg);
        }
        Segment { kind: SegmentKind::Group, root: expr, children: inputs }
    }

    /// Splice a materialization boundary over group input `i`: the source is
    /// written to a fresh temporary and the input becomes a read of that
    /// write. The displaced segment becomes the boundary's child.
    fn materialize_input(&mut self, group: ExprId, i: usize, inner: Segment) -> Segment {
        let source = self.arena.group_source(group, i);
        self.arena.detach(source);
        let temp = self.adapters.make_temp();
        let descriptor = self.arena.constant(temp.to_value());
        let write = self.arena.add(ExprKind::Write, vec![source, descriptor]);
        let read = self.arena.add(ExprKind::Read, vec![write]);
        self.arena.splice(group, 2 * i, vec![read]);
        // Root the displaced group at the write so it fuses the temporary
        // as its own sink.
        let displaced = Segment { kind: SegmentKind::Group, root: write, children: inner.children };
        Segment { kind: SegmentKind::InlineMap, root: read, children: vec![displaced] }
    }

    /// A compiled job already materializes its output; reading it back is
    /// the whole boundary.
    fn reread_input(&mut self, group: ExprId, i: usize, inner: Segment) -> Segment {
        let source = self.arena.group_source(group, i);
        self.arena.detach(source);
        let read = self.arena.add(ExprKind::Read, vec![source]);
        self.arena.splice(group, 2 * i, vec![read]);
        Segment { kind: SegmentKind::InlineMap, root: read, children: vec![inner] }
    }
}

/// How a group's collect expression uses one input's grouped values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceKind {
    /// The values flow to the result through local element-wise work only.
    MapGroup,
    /// The values are never consulted; the job needs no aggregate for this
    /// input.
    FinalGroup,
    /// The single use is an algebraic aggregate call; a combine stage is
    /// sound for this input.
    CombineGroup,
    /// Anything else; the values must be materialized per key.
    SequentialGroup,
}

/// Result of reduce-side analysis for one group input.
#[derive(Debug)]
pub struct ReduceAnalysis {
    pub kind: ReduceKind,
    /// For [`ReduceKind::CombineGroup`], the aggregate call consuming the
    /// input's grouped values.
    pub agg_call: Option<ExprId>,
}

impl ReduceAnalysis {
    fn of(kind: ReduceKind) -> Self {
        Self { kind, agg_call: None }
    }
}

/// Decide combiner eligibility for one group input: how does `collect` use
/// `into_var`?
///
/// A combine stage is sound only when the grouped values feed exactly one
/// algebraic aggregate call, reached through nodes that neither duplicate
/// the values nor let them escape: strip operators, and loops whose use of
/// the values is confined to the source position with an effect-free body.
pub fn classify_reduce(
    arena: &ExprArena,
    aggregates: &AggregateRegistry,
    collect: ExprId,
    into_var: VarId,
) -> ReduceAnalysis {
    let uses = arena.var_uses(collect, into_var);
    let use_site = match uses.as_slice() {
        [] => return ReduceAnalysis::of(ReduceKind::FinalGroup),
        [single] => *single,
        _ => return ReduceAnalysis::of(ReduceKind::SequentialGroup),
    };

    let mut node = use_site;
    while node != collect {
        let parent = arena
            .parent(node)
            .expect("variable use outside its collect expression");
        match arena.kind(parent) {
            ExprKind::AggCall(name) => {
                return if aggregates.is_algebraic(name) {
                    ReduceAnalysis { kind: ReduceKind::CombineGroup, agg_call: Some(parent) }
                } else {
                    ReduceAnalysis::of(ReduceKind::SequentialGroup)
                };
            }
            ExprKind::Denull | ExprKind::Deempty => node = parent,
            ExprKind::Transform(_) | ExprKind::Filter(_) | ExprKind::For(_)
                if arena.child(parent, 0) == node =>
            {
                let body = arena.child(parent, 1);
                if arena.might_contain_mapreduce(body) || arena.has_effects(body) {
                    return ReduceAnalysis::of(ReduceKind::SequentialGroup);
                }
                node = parent;
            }
            _ => return ReduceAnalysis::of(ReduceKind::SequentialGroup),
        }
    }
    ReduceAnalysis::of(ReduceKind::MapGroup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{GroupInput, GroupSpec};
    use crate::io::Descriptor;
    use crate::value::Value;

    fn setup() -> (ExprArena, AdapterRegistry, AggregateRegistry) {
        let mut adapters = AdapterRegistry::new();
        adapters.register("parfile", true);
        adapters.register("local", false);
        (ExprArena::new(), adapters, AggregateRegistry::standard())
    }

    fn parallel_read(arena: &mut ExprArena, location: &str) -> ExprId {
        let d = arena.constant(Descriptor::new("parfile", location).to_value());
        arena.add(ExprKind::Read, vec![d])
    }

    #[test]
    fn parallel_read_is_map_local_read_is_not() {
        let (mut arena, adapters, aggs) = setup();
        let par = parallel_read(&mut arena, "a");
        let d = arena.constant(Descriptor::new("local", "b").to_value());
        let seq = arena.add(ExprKind::Read, vec![d]);

        let mut cls = Classifier::new(&mut arena, &adapters, &aggs);
        assert_eq!(cls.classify(par).kind, SegmentKind::Map);
        assert_eq!(cls.classify(seq).kind, SegmentKind::Sequential);
    }

    #[test]
    fn transform_over_parallel_read_joins_the_map_segment() {
        let (mut arena, adapters, aggs) = setup();
        let read = parallel_read(&mut arena, "a");
        let v = arena.vars.make("x");
        let body = arena.var_ref(v);
        let transform = arena.add(ExprKind::Transform(v), vec![read, body]);

        let mut cls = Classifier::new(&mut arena, &adapters, &aggs);
        let seg = cls.classify(transform);
        assert_eq!(seg.kind, SegmentKind::Map);
        assert_eq!(seg.root, transform);
        assert!(seg.children.is_empty());
    }

    #[test]
    fn nested_job_in_loop_body_forces_sequential() {
        let (mut arena, adapters, aggs) = setup();
        let read = parallel_read(&mut arena, "a");
        let v = arena.vars.make("x");
        // A call whose body the classifier cannot see.
        let f = arena.vars.make("f");
        let callee = arena.var_ref(f);
        let body = arena.add(ExprKind::FnCall, vec![callee]);
        let transform = arena.add(ExprKind::Transform(v), vec![read, body]);

        let mut cls = Classifier::new(&mut arena, &adapters, &aggs);
        assert_eq!(cls.classify(transform).kind, SegmentKind::Sequential);
    }

    fn simple_group(arena: &mut ExprArena, source: ExprId) -> (ExprId, VarId) {
        let bind_var = arena.vars.make("x");
        let into_var = arena.vars.make("xs");
        let key_var = arena.vars.make("k");
        let by = arena.var_ref(bind_var);
        let collect = arena.var_ref(into_var);
        let spec = GroupSpec {
            inputs: vec![GroupInput { bind_var, into_var }],
            key_var,
        };
        let group = arena.add(ExprKind::GroupBy(spec), vec![source, by, collect]);
        (group, into_var)
    }

    #[test]
    fn group_over_parallel_read_is_group() {
        let (mut arena, adapters, aggs) = setup();
        let read = parallel_read(&mut arena, "a");
        let (group, _) = simple_group(&mut arena, read);

        let mut cls = Classifier::new(&mut arena, &adapters, &aggs);
        let seg = cls.classify(group);
        assert_eq!(seg.kind, SegmentKind::Group);
        assert_eq!(seg.children.len(), 1);
        assert_eq!(seg.children[0].kind, SegmentKind::Map);
    }

    #[test]
    fn group_over_group_gets_a_materialization_boundary() {
        let (mut arena, adapters, aggs) = setup();
        let read = parallel_read(&mut arena, "a");
        let (inner, _) = simple_group(&mut arena, read);
        let (outer, _) = simple_group(&mut arena, inner);

        let mut cls = Classifier::new(&mut arena, &adapters, &aggs);
        let seg = cls.classify(outer);
        assert_eq!(seg.kind, SegmentKind::Group);
        assert_eq!(seg.children[0].kind, SegmentKind::InlineMap);
        // The boundary is a read of a write of a temporary.
        let boundary = arena.group_source(outer, 0);
        assert_eq!(*arena.kind(boundary), ExprKind::Read);
        assert_eq!(*arena.kind(arena.child(boundary, 0)), ExprKind::Write);
        arena.validate(outer).unwrap();
    }

    #[test]
    fn classification_is_deterministic() {
        let (mut arena, adapters, aggs) = setup();
        let read = parallel_read(&mut arena, "a");
        let (group, _) = simple_group(&mut arena, read);
        let mut cls = Classifier::new(&mut arena, &adapters, &aggs);
        let first = cls.classify(group);
        let second = cls.classify(group);
        assert_eq!(first.kind, second.kind);
        assert_eq!(first.root, second.root);
        assert_eq!(first.children.len(), second.children.len());
    }

    #[test]
    fn unused_values_are_final_group() {
        let (mut arena, _, aggs) = setup();
        let into = arena.vars.make("xs");
        let collect = arena.constant(Value::Long(1));
        let r = classify_reduce(&arena, &aggs, collect, into);
        assert_eq!(r.kind, ReduceKind::FinalGroup);
    }

    #[test]
    fn algebraic_aggregate_over_values_is_combine_group() {
        let (mut arena, _, aggs) = setup();
        let into = arena.vars.make("xs");
        let use_site = arena.var_ref(into);
        let agg = arena.add(ExprKind::AggCall("sum".into()), vec![use_site]);
        let collect = arena.add(ExprKind::Record(vec!["total".into()]), vec![agg]);
        let r = classify_reduce(&arena, &aggs, collect, into);
        assert_eq!(r.kind, ReduceKind::CombineGroup);
        assert_eq!(r.agg_call, Some(agg));
    }

    #[test]
    fn non_algebraic_aggregate_is_sequential_group() {
        let (mut arena, _, aggs) = setup();
        let into = arena.vars.make("xs");
        let use_site = arena.var_ref(into);
        let collect = arena.add(ExprKind::AggCall("array".into()), vec![use_site]);
        let r = classify_reduce(&arena, &aggs, collect, into);
        assert_eq!(r.kind, ReduceKind::SequentialGroup);
    }

    #[test]
    fn double_use_is_sequential_group() {
        let (mut arena, _, aggs) = setup();
        let into = arena.vars.make("xs");
        let a = arena.var_ref(into);
        let sum = arena.add(ExprKind::AggCall("sum".into()), vec![a]);
        let b = arena.var_ref(into);
        let count = arena.add(ExprKind::AggCall("count".into()), vec![b]);
        let collect = arena.add(ExprKind::Math(crate::value::MathOp::Div), vec![sum, count]);
        let r = classify_reduce(&arena, &aggs, collect, into);
        assert_eq!(r.kind, ReduceKind::SequentialGroup);
    }

    #[test]
    fn aggregate_over_transformed_values_is_combine_group() {
        let (mut arena, _, aggs) = setup();
        let into = arena.vars.make("xs");
        let v = arena.vars.make("x");
        let use_site = arena.var_ref(into);
        let elem = arena.var_ref(v);
        let body = arena.add(ExprKind::Field("n".into()), vec![elem]);
        let transform = arena.add(ExprKind::Transform(v), vec![use_site, body]);
        let collect = arena.add(ExprKind::AggCall("sum".into()), vec![transform]);
        let r = classify_reduce(&arena, &aggs, collect, into);
        assert_eq!(r.kind, ReduceKind::CombineGroup);
        assert_eq!(r.agg_call, Some(collect));
    }

    #[test]
    fn bare_values_as_result_are_map_group() {
        let (mut arena, _, aggs) = setup();
        let into = arena.vars.make("xs");
        let collect = arena.var_ref(into);
        let r = classify_reduce(&arena, &aggs, collect, into);
        assert_eq!(r.kind, ReduceKind::MapGroup);
    }
}
