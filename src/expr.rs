//! The mutable expression tree the compiler rewrites and plans.
//!
//! Nodes live in an [`ExprArena`] and are addressed by [`ExprId`]; every node
//! stores its parent index and an ordered child list, so the two mutation
//! primitives every rewrite goes through ([`ExprArena::replace_in_parent`]
//! and [`ExprArena::detach`]) are plain index rewrites. Detached subtrees
//! simply become unreachable; the arena lives for one compile unit.
//!
//! [`ExprKind`] is a closed sum type: the rewrite dispatcher and the segment
//! classifier match on it exhaustively, so an unhandled kind is a compile
//! error here rather than a runtime failure.

use crate::value::{MathOp, Value};
use std::collections::HashMap;
use std::fmt;

/// Index of a node in an [`ExprArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub(crate) usize);

/// Identity of a variable, stable across scopes and clones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub(crate) usize);

/// Variable table. Names are kept for diagnostics only; identity is the id.
#[derive(Default, Debug)]
pub struct VarGen {
    names: Vec<String>,
}

impl VarGen {
    pub fn make(&mut self, name: impl Into<String>) -> VarId {
        self.names.push(name.into());
        VarId(self.names.len() - 1)
    }

    pub fn name(&self, var: VarId) -> &str {
        &self.names[var.0]
    }

    /// Fresh variable with the same diagnostic name as `var`.
    pub fn rename(&mut self, var: VarId) -> VarId {
        let name = self.names[var.0].clone();
        self.make(name)
    }
}

/// Old-variable to new-variable mapping threaded through deep clones so bound
/// variables rename consistently. Cleared and reused per clone operation.
#[derive(Default, Debug)]
pub struct VarMap {
    map: HashMap<VarId, VarId>,
}

impl VarMap {
    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn bind(&mut self, old: VarId, new: VarId) {
        self.map.insert(old, new);
    }

    pub fn lookup(&self, old: VarId) -> Option<VarId> {
        self.map.get(&old).copied()
    }
}

/// Per-input variables of a group-by: `bind_var` names one element of the
/// input while the by-expression runs, `into_var` names the grouped value
/// array inside the collect expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupInput {
    pub bind_var: VarId,
    pub into_var: VarId,
}

/// Group-by shape. Children of the node are laid out as
/// `[source_0, by_0, ..., source_n-1, by_n-1, collect]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSpec {
    pub inputs: Vec<GroupInput>,
    /// Binds the grouping key inside the collect expression.
    pub key_var: VarId,
}

/// Which stages a compiled job carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobShape {
    /// map stages only; no shuffle, no reduce
    MapOnly,
    /// map + reduce
    Plain,
    /// init + combine + final
    Aggregate,
}

/// Compiled-job layout. Children of the node are laid out as
/// `[inputs..., output, maps..., combines... (Aggregate only), reduce
/// (Plain and Aggregate only)]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobSpec {
    pub n_inputs: usize,
    pub shape: JobShape,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExprKind {
    /// Literal value.
    Const(Value),
    /// Variable reference.
    VarRef(VarId),
    /// Array constructor; children are the elements.
    Array,
    /// Record constructor; names parallel the children.
    Record(Vec<String>),
    /// Record field projection of child 0.
    Field(String),
    /// Arithmetic over children `[lhs, rhs]`.
    Math(MathOp),
    /// Iterate child 0 binding `var` per element, concatenating the array
    /// results of child 1.
    For(VarId),
    /// Iterate child 0 binding `var`, emitting exactly child 1 per element.
    Transform(VarId),
    /// Iterate child 0 binding `var`, keeping elements where child 1 is true.
    Filter(VarId),
    /// Sequencing: evaluate children in order, value is the last child.
    Do,
    /// Let-binding inside a `Do`; child 0 is the bound value.
    Bind(VarId),
    /// Group-by over one or more inputs. See [`GroupSpec`] for child layout.
    GroupBy(GroupSpec),
    /// Call of a registered aggregate over the array value of child 0.
    AggCall(String),
    /// Read the descriptor of child 0.
    Read,
    /// Write child 0 to the descriptor of child 1.
    Write,
    /// Strip nulls from the array value of child 0.
    Denull,
    /// Strip nulls and empty containers from the array value of child 0.
    Deempty,
    /// Function definition; child 0 is the body.
    FnDef(Vec<VarId>),
    /// Function call; child 0 is the callee, the rest are arguments.
    FnCall,
    /// Already-compiled distributed job. See [`JobSpec`] for child layout.
    MapReduce(JobSpec),
}

impl ExprKind {
    pub fn tag(&self) -> ExprTag {
        match self {
            ExprKind::Const(_) => ExprTag::Const,
            ExprKind::VarRef(_) => ExprTag::VarRef,
            ExprKind::Array => ExprTag::Array,
            ExprKind::Record(_) => ExprTag::Record,
            ExprKind::Field(_) => ExprTag::Field,
            ExprKind::Math(_) => ExprTag::Math,
            ExprKind::For(_) => ExprTag::For,
            ExprKind::Transform(_) => ExprTag::Transform,
            ExprKind::Filter(_) => ExprTag::Filter,
            ExprKind::Do => ExprTag::Do,
            ExprKind::Bind(_) => ExprTag::Bind,
            ExprKind::GroupBy(_) => ExprTag::GroupBy,
            ExprKind::AggCall(_) => ExprTag::AggCall,
            ExprKind::Read => ExprTag::Read,
            ExprKind::Write => ExprTag::Write,
            ExprKind::Denull => ExprTag::Denull,
            ExprKind::Deempty => ExprTag::Deempty,
            ExprKind::FnDef(_) => ExprTag::FnDef,
            ExprKind::FnCall => ExprTag::FnCall,
            ExprKind::MapReduce(_) => ExprTag::MapReduce,
        }
    }
}

/// Data-free discriminant of [`ExprKind`], used as the rule-table key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExprTag {
    Const,
    VarRef,
    Array,
    Record,
    Field,
    Math,
    For,
    Transform,
    Filter,
    Do,
    Bind,
    GroupBy,
    AggCall,
    Read,
    Write,
    Denull,
    Deempty,
    FnDef,
    FnCall,
    MapReduce,
}

impl fmt::Display for ExprTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug)]
struct Node {
    kind: ExprKind,
    children: Vec<ExprId>,
    parent: Option<ExprId>,
}

/// Arena of expression nodes plus the variable table.
#[derive(Default, Debug)]
pub struct ExprArena {
    nodes: Vec<Node>,
    pub vars: VarGen,
}

impl ExprArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a node and claim `children` as its children. Children must
    /// currently be unparented (fresh or detached).
    pub fn add(&mut self, kind: ExprKind, children: Vec<ExprId>) -> ExprId {
        let id = ExprId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            children: children.clone(),
            parent: None,
        });
        for c in children {
            debug_assert!(self.nodes[c.0].parent.is_none(), "child already has a parent");
            self.nodes[c.0].parent = Some(id);
        }
        id
    }

    pub fn kind(&self, id: ExprId) -> &ExprKind {
        &self.nodes[id.0].kind
    }

    pub fn kind_mut(&mut self, id: ExprId) -> &mut ExprKind {
        &mut self.nodes[id.0].kind
    }

    pub fn children(&self, id: ExprId) -> &[ExprId] {
        &self.nodes[id.0].children
    }

    pub fn child(&self, id: ExprId, i: usize) -> ExprId {
        self.nodes[id.0].children[i]
    }

    pub fn parent(&self, id: ExprId) -> Option<ExprId> {
        self.nodes[id.0].parent
    }

    /// Slot of `id` within its parent's child list.
    pub fn child_slot(&self, id: ExprId) -> Option<usize> {
        let p = self.nodes[id.0].parent?;
        self.nodes[p.0].children.iter().position(|&c| c == id)
    }

    /// Replace `old` with `new` in `old`'s parent, preserving the slot.
    /// `old` becomes a detached root; `new` must be unparented.
    ///
    /// Panics if `old` has no parent: the engine keeps a sentinel above the
    /// query root precisely so rules never see a parentless node.
    pub fn replace_in_parent(&mut self, old: ExprId, new: ExprId) {
        let parent = self.nodes[old.0].parent.expect("replace_in_parent on root");
        debug_assert!(self.nodes[new.0].parent.is_none(), "replacement already parented");
        let slot = self.nodes[parent.0]
            .children
            .iter()
            .position(|&c| c == old)
            .expect("child not found in parent");
        self.nodes[parent.0].children[slot] = new;
        self.nodes[new.0].parent = Some(parent);
        self.nodes[old.0].parent = None;
    }

    /// Remove `id` from its parent's child list; `id` becomes a detached root.
    pub fn detach(&mut self, id: ExprId) {
        if let Some(parent) = self.nodes[id.0].parent {
            self.nodes[parent.0].children.retain(|&c| c != id);
            self.nodes[id.0].parent = None;
        }
    }

    /// Deep clone of the subtree at `id`.
    ///
    /// Binding kinds mint fresh variables and record them in `remap`, so
    /// variable identity stays consistent inside the clone without capturing
    /// the original's bindings. Callers clear `remap` before each clone.
    pub fn clone_subtree(&mut self, id: ExprId, remap: &mut VarMap) -> ExprId {
        let mut kind = self.nodes[id.0].kind.clone();
        // Rebind before descending so references below see the fresh vars.
        match &mut kind {
            ExprKind::For(v) | ExprKind::Transform(v) | ExprKind::Filter(v) | ExprKind::Bind(v) => {
                let fresh = self.vars.rename(*v);
                remap.bind(*v, fresh);
                *v = fresh;
            }
            ExprKind::GroupBy(spec) => {
                for input in &mut spec.inputs {
                    let fresh = self.vars.rename(input.bind_var);
                    remap.bind(input.bind_var, fresh);
                    input.bind_var = fresh;
                    let fresh = self.vars.rename(input.into_var);
                    remap.bind(input.into_var, fresh);
                    input.into_var = fresh;
                }
                let fresh = self.vars.rename(spec.key_var);
                remap.bind(spec.key_var, fresh);
                spec.key_var = fresh;
            }
            ExprKind::FnDef(params) => {
                for p in params {
                    let fresh = self.vars.rename(*p);
                    remap.bind(*p, fresh);
                    *p = fresh;
                }
            }
            ExprKind::VarRef(v) => {
                if let Some(new) = remap.lookup(*v) {
                    *v = new;
                }
            }
            _ => {}
        }
        let children: Vec<ExprId> = self.nodes[id.0].children.clone();
        let cloned: Vec<ExprId> = children
            .into_iter()
            .map(|c| self.clone_subtree(c, remap))
            .collect();
        self.add(kind, cloned)
    }

    /// Post-order listing of the subtree at `id`.
    pub fn post_order(&self, id: ExprId) -> Vec<ExprId> {
        let mut out = Vec::new();
        self.post_order_into(id, &mut out);
        out
    }

    fn post_order_into(&self, id: ExprId, out: &mut Vec<ExprId>) {
        for &c in &self.nodes[id.0].children {
            self.post_order_into(c, out);
        }
        out.push(id);
    }

    /// All `VarRef` nodes for `var` under `id`.
    pub fn var_uses(&self, id: ExprId, var: VarId) -> Vec<ExprId> {
        self.post_order(id)
            .into_iter()
            .filter(|&e| matches!(self.kind(e), ExprKind::VarRef(v) if *v == var))
            .collect()
    }

    pub fn count_var_uses(&self, id: ExprId, var: VarId) -> usize {
        self.var_uses(id, var).len()
    }

    /// Rename every use of `old` under `id` to `new` in place.
    pub fn replace_var(&mut self, id: ExprId, old: VarId, new: VarId) {
        for e in self.post_order(id) {
            if let ExprKind::VarRef(v) = self.kind_mut(e) {
                if *v == old {
                    *v = new;
                }
            }
        }
    }

    /// Replace every use of `var` under `id` with a clone of `replacement`.
    /// Returns the number of uses replaced.
    pub fn substitute_var(&mut self, id: ExprId, var: VarId, replacement: ExprId) -> usize {
        let uses = self.var_uses(id, var);
        let n = uses.len();
        let mut remap = VarMap::default();
        for use_site in uses {
            remap.clear();
            let clone = self.clone_subtree(replacement, &mut remap);
            self.replace_in_parent(use_site, clone);
        }
        n
    }

    /// Replace the child at `slot` of `parent` with `replacements` (possibly
    /// empty), shifting later children. The old child and the replacements
    /// must already be detached.
    pub fn splice(&mut self, parent: ExprId, slot: usize, replacements: Vec<ExprId>) {
        for (offset, r) in replacements.iter().enumerate() {
            debug_assert!(self.nodes[r.0].parent.is_none(), "replacement already parented");
            self.nodes[r.0].parent = Some(parent);
            self.nodes[parent.0].children.insert(slot + offset, *r);
        }
    }

    /// Conservative purity check: a subtree with a write or a compiled job
    /// in it must not be dropped or duplicated by inlining.
    pub fn has_effects(&self, id: ExprId) -> bool {
        self.post_order(id)
            .into_iter()
            .any(|e| matches!(self.kind(e), ExprKind::Write | ExprKind::MapReduce(_)))
    }

    /// Conservative check for anything under `id` that must not be relocated
    /// into a distributed function body: an already-compiled job, or a call
    /// whose body we cannot see.
    pub fn might_contain_mapreduce(&self, id: ExprId) -> bool {
        self.post_order(id).into_iter().any(|e| {
            matches!(self.kind(e), ExprKind::MapReduce(_) | ExprKind::FnCall)
        })
    }

    /// Verify the parent/child invariant over the subtree at `root`:
    /// each child points back at its parent, and no node appears twice.
    pub fn validate(&self, root: ExprId) -> Result<(), String> {
        let mut seen = vec![false; self.nodes.len()];
        self.validate_inner(root, &mut seen)
    }

    fn validate_inner(&self, id: ExprId, seen: &mut [bool]) -> Result<(), String> {
        if seen[id.0] {
            return Err(format!("node {:?} reachable twice", id));
        }
        seen[id.0] = true;
        for &c in &self.nodes[id.0].children {
            if self.nodes[c.0].parent != Some(id) {
                return Err(format!(
                    "child {:?} of {:?} does not point back to its parent",
                    c, id
                ));
            }
            self.validate_inner(c, seen)?;
        }
        Ok(())
    }

    /// One-line rendering for diagnostics.
    pub fn describe(&self, id: ExprId) -> String {
        match self.kind(id) {
            ExprKind::Const(v) => format!("Const({v})"),
            ExprKind::VarRef(v) => format!("VarRef(${})", self.vars.name(*v)),
            ExprKind::AggCall(name) => format!("AggCall({name})"),
            ExprKind::Field(name) => format!("Field(.{name})"),
            other => format!("{:?}", other.tag()),
        }
    }

    // Convenience constructors used heavily by rules, the planner, and tests.

    pub fn constant(&mut self, v: Value) -> ExprId {
        self.add(ExprKind::Const(v), vec![])
    }

    pub fn var_ref(&mut self, v: VarId) -> ExprId {
        self.add(ExprKind::VarRef(v), vec![])
    }

    pub fn array(&mut self, items: Vec<ExprId>) -> ExprId {
        self.add(ExprKind::Array, items)
    }

    pub fn fn_def(&mut self, params: Vec<VarId>, body: ExprId) -> ExprId {
        self.add(ExprKind::FnDef(params), vec![body])
    }

    // Group-by child-layout accessors.

    pub fn group_spec(&self, group: ExprId) -> &GroupSpec {
        match self.kind(group) {
            ExprKind::GroupBy(spec) => spec,
            other => panic!("not a group-by: {other:?}"),
        }
    }

    pub fn group_source(&self, group: ExprId, i: usize) -> ExprId {
        self.child(group, 2 * i)
    }

    pub fn group_by_expr(&self, group: ExprId, i: usize) -> ExprId {
        self.child(group, 2 * i + 1)
    }

    pub fn group_collect(&self, group: ExprId) -> ExprId {
        let n = self.group_spec(group).inputs.len();
        self.child(group, 2 * n)
    }

    /// Index of the input whose `into_var` is `var`, if any.
    pub fn group_into_index(&self, group: ExprId, var: VarId) -> Option<usize> {
        self.group_spec(group)
            .inputs
            .iter()
            .position(|input| input.into_var == var)
    }

    // Compiled-job child-layout accessors.

    pub fn job_spec(&self, job: ExprId) -> JobSpec {
        match self.kind(job) {
            ExprKind::MapReduce(spec) => *spec,
            other => panic!("not a compiled job: {other:?}"),
        }
    }

    pub fn job_input(&self, job: ExprId, i: usize) -> ExprId {
        self.child(job, i)
    }

    pub fn job_output(&self, job: ExprId) -> ExprId {
        let spec = self.job_spec(job);
        self.child(job, spec.n_inputs)
    }

    pub fn job_map(&self, job: ExprId, i: usize) -> ExprId {
        let spec = self.job_spec(job);
        self.child(job, spec.n_inputs + 1 + i)
    }

    pub fn job_combine(&self, job: ExprId, i: usize) -> Option<ExprId> {
        let spec = self.job_spec(job);
        match spec.shape {
            JobShape::MapOnly | JobShape::Plain => None,
            JobShape::Aggregate => Some(self.child(job, 2 * spec.n_inputs + 1 + i)),
        }
    }

    pub fn job_reduce(&self, job: ExprId) -> ExprId {
        let spec = self.job_spec(job);
        let base = match spec.shape {
            JobShape::MapOnly => panic!("map-only job has no reduce stage"),
            JobShape::Plain => 2 * spec.n_inputs + 1,
            JobShape::Aggregate => 3 * spec.n_inputs + 1,
        };
        self.child(job, base)
    }
}
