//! The local rewrite rules of the simplification phase.
//!
//! Each rule is one bounded local shape change: inlining, sequencing
//! cleanup, iteration fusion, constant folding, aggregate expansion. Rules
//! see a single node and mutate only through the arena primitives; none of
//! them recurses on its own.

use crate::error::CompileError;
use crate::expr::{ExprArena, ExprId, ExprKind, ExprTag, VarMap};
use crate::rewrite::{Rule, RuleCx};
use crate::value::Value;

/// `( ..., v = e, ...uses of v... )` — inline `e` into its uses when that
/// cannot duplicate effects: `e` must be pure, and either `v` is used once
/// or `e` is trivial to re-evaluate. Unused pure bindings are dropped
/// outright; unused effectful bindings keep their value expression in the
/// sequence.
pub struct VarInline;

impl Rule for VarInline {
    fn name(&self) -> &'static str {
        "var-inline"
    }

    fn fire_on(&self) -> Option<&'static [ExprTag]> {
        Some(&[ExprTag::Do])
    }

    fn rewrite(&self, cx: &mut RuleCx<'_>, expr: ExprId) -> Result<bool, CompileError> {
        let n = cx.arena.children(expr).len();
        for i in 0..n {
            let binding = cx.arena.child(expr, i);
            let ExprKind::Bind(var) = *cx.arena.kind(binding) else {
                continue;
            };
            let value = cx.arena.child(binding, 0);
            let uses = cx.arena.count_var_uses(expr, var);
            let pure = !cx.arena.has_effects(value);

            if uses == 0 {
                if pure && i + 1 < n {
                    cx.arena.detach(binding);
                } else {
                    // Keep the value for its effect, or as the sequence's
                    // final value; only the binding itself goes away.
                    cx.arena.detach(value);
                    cx.arena.replace_in_parent(binding, value);
                }
                return Ok(true);
            }

            let trivial = matches!(
                cx.arena.kind(value),
                ExprKind::Const(_) | ExprKind::VarRef(_) | ExprKind::FnDef(_)
            );
            if pure && (uses == 1 || trivial) {
                cx.arena.substitute_var(expr, var, value);
                cx.arena.detach(binding);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Flatten a `Do` nested in a `Do`, and collapse a single-expression `Do`
/// into that expression.
pub struct DoMerge;

impl Rule for DoMerge {
    fn name(&self) -> &'static str {
        "do-merge"
    }

    fn fire_on(&self) -> Option<&'static [ExprTag]> {
        Some(&[ExprTag::Do])
    }

    fn rewrite(&self, cx: &mut RuleCx<'_>, expr: ExprId) -> Result<bool, CompileError> {
        // Never rewrite a parentless Do; the engine's sentinel is one.
        if cx.arena.parent(expr).is_none() {
            return Ok(false);
        }

        let children: Vec<ExprId> = cx.arena.children(expr).to_vec();
        for (i, &child) in children.iter().enumerate() {
            if *cx.arena.kind(child) == ExprKind::Do {
                let inner: Vec<ExprId> = cx.arena.children(child).to_vec();
                cx.arena.detach(child);
                for &g in &inner {
                    cx.arena.detach(g);
                }
                cx.arena.splice(expr, i, inner);
                return Ok(true);
            }
        }

        if children.len() == 1 && !matches!(cx.arena.kind(children[0]), ExprKind::Bind(_)) {
            let only = children[0];
            cx.arena.detach(only);
            cx.arena.replace_in_parent(expr, only);
            return Ok(true);
        }
        Ok(false)
    }
}

/// Inline a call of a literal function definition: the call becomes a `Do`
/// binding each parameter to its argument, ending in the function body.
pub struct FunctionInline;

impl Rule for FunctionInline {
    fn name(&self) -> &'static str {
        "function-inline"
    }

    fn fire_on(&self) -> Option<&'static [ExprTag]> {
        Some(&[ExprTag::FnCall])
    }

    fn rewrite(&self, cx: &mut RuleCx<'_>, expr: ExprId) -> Result<bool, CompileError> {
        let callee = cx.arena.child(expr, 0);
        let ExprKind::FnDef(params) = cx.arena.kind(callee).clone() else {
            return Ok(false);
        };
        let args: Vec<ExprId> = cx.arena.children(expr)[1..].to_vec();
        if args.len() != params.len() {
            return Err(CompileError::structural(
                expr,
                format!("call passes {} args to a {}-parameter function", args.len(), params.len()),
            ));
        }

        let body = cx.arena.child(callee, 0);
        cx.arena.detach(body);
        let mut seq = Vec::with_capacity(params.len() + 1);
        for (param, arg) in params.into_iter().zip(args) {
            cx.arena.detach(arg);
            seq.push(cx.arena.add(ExprKind::Bind(param), vec![arg]));
        }
        seq.push(body);
        let do_expr = cx.arena.add(ExprKind::Do, seq);
        cx.arena.replace_in_parent(expr, do_expr);
        Ok(true)
    }
}

/// `for v in src collect [e]` is `src -> transform v into e`.
pub struct ForToTransform;

impl Rule for ForToTransform {
    fn name(&self) -> &'static str {
        "for-to-transform"
    }

    fn fire_on(&self) -> Option<&'static [ExprTag]> {
        Some(&[ExprTag::For])
    }

    fn rewrite(&self, cx: &mut RuleCx<'_>, expr: ExprId) -> Result<bool, CompileError> {
        let ExprKind::For(var) = *cx.arena.kind(expr) else {
            return Ok(false);
        };
        let body = cx.arena.child(expr, 1);
        if *cx.arena.kind(body) != ExprKind::Array || cx.arena.children(body).len() != 1 {
            return Ok(false);
        }
        let element = cx.arena.child(body, 0);
        cx.arena.detach(element);
        cx.arena.replace_in_parent(body, element);
        *cx.arena.kind_mut(expr) = ExprKind::Transform(var);
        Ok(true)
    }
}

/// A transform whose body is exactly its binding variable is the identity.
pub struct TrivialTransformElimination;

impl Rule for TrivialTransformElimination {
    fn name(&self) -> &'static str {
        "trivial-transform"
    }

    fn fire_on(&self) -> Option<&'static [ExprTag]> {
        Some(&[ExprTag::Transform])
    }

    fn rewrite(&self, cx: &mut RuleCx<'_>, expr: ExprId) -> Result<bool, CompileError> {
        let ExprKind::Transform(var) = *cx.arena.kind(expr) else {
            return Ok(false);
        };
        let body = cx.arena.child(expr, 1);
        if *cx.arena.kind(body) != ExprKind::VarRef(var) {
            return Ok(false);
        }
        let source = cx.arena.child(expr, 0);
        cx.arena.detach(source);
        cx.arena.replace_in_parent(expr, source);
        Ok(true)
    }
}

/// Fuse `src -> transform v1 into b1 -> transform v2 into b2` into one
/// transform, substituting `b1` for `v2`. Guarded so the fusion cannot
/// duplicate non-trivial work.
pub struct TransformMerge;

impl Rule for TransformMerge {
    fn name(&self) -> &'static str {
        "transform-merge"
    }

    fn fire_on(&self) -> Option<&'static [ExprTag]> {
        Some(&[ExprTag::Transform])
    }

    fn rewrite(&self, cx: &mut RuleCx<'_>, expr: ExprId) -> Result<bool, CompileError> {
        let ExprKind::Transform(outer_var) = *cx.arena.kind(expr) else {
            return Ok(false);
        };
        let inner = cx.arena.child(expr, 0);
        let ExprKind::Transform(inner_var) = *cx.arena.kind(inner) else {
            return Ok(false);
        };

        let inner_body = cx.arena.child(inner, 1);
        let outer_body = cx.arena.child(expr, 1);
        let uses = cx.arena.count_var_uses(outer_body, outer_var);
        // Anything but exactly one use drops or duplicates the inner body.
        if uses != 1 && cx.arena.has_effects(inner_body) {
            return Ok(false);
        }
        let inner_trivial = matches!(
            cx.arena.kind(inner_body),
            ExprKind::Const(_) | ExprKind::VarRef(_) | ExprKind::Field(_)
        );
        if uses > 1 && !inner_trivial {
            return Ok(false);
        }

        cx.arena.substitute_var(outer_body, outer_var, inner_body);
        let source = cx.arena.child(inner, 0);
        cx.arena.detach(source);
        cx.arena.detach(inner);
        cx.arena.splice(expr, 0, vec![source]);
        *cx.arena.kind_mut(expr) = ExprKind::Transform(inner_var);
        Ok(true)
    }
}

/// Push `src -> transform v into b -> filter f by p` down to
/// `src -> filter f' by p[f := b] -> transform v into b`, filtering before
/// the per-element work instead of after. The body lands inside the
/// predicate and re-runs for kept elements; only pure bodies move.
pub struct FilterPushDown;

impl Rule for FilterPushDown {
    fn name(&self) -> &'static str {
        "filter-push-down"
    }

    fn fire_on(&self) -> Option<&'static [ExprTag]> {
        Some(&[ExprTag::Filter])
    }

    fn rewrite(&self, cx: &mut RuleCx<'_>, expr: ExprId) -> Result<bool, CompileError> {
        let ExprKind::Filter(filter_var) = *cx.arena.kind(expr) else {
            return Ok(false);
        };
        let inner = cx.arena.child(expr, 0);
        let ExprKind::Transform(transform_var) = *cx.arena.kind(inner) else {
            return Ok(false);
        };

        let body = cx.arena.child(inner, 1);
        let pred = cx.arena.child(expr, 1);
        if cx.arena.has_effects(body) || cx.arena.might_contain_mapreduce(body) {
            return Ok(false);
        }
        let uses = cx.arena.count_var_uses(pred, filter_var);
        let body_trivial = matches!(
            cx.arena.kind(body),
            ExprKind::Const(_) | ExprKind::VarRef(_) | ExprKind::Field(_)
        );
        if uses > 1 && !body_trivial {
            return Ok(false);
        }

        cx.arena.substitute_var(pred, filter_var, body);
        // Substitution can replace the predicate root itself.
        let pred = cx.arena.child(expr, 1);
        // The substituted clones reference the transform's variable; rebind
        // them to the pushed filter's own binder.
        let fresh = cx.arena.vars.rename(transform_var);
        cx.arena.replace_var(pred, transform_var, fresh);

        let source = cx.arena.child(inner, 0);
        cx.arena.detach(source);
        cx.arena.detach(pred);
        let pushed = cx.arena.add(ExprKind::Filter(fresh), vec![source, pred]);
        cx.arena.splice(inner, 0, vec![pushed]);
        cx.arena.detach(inner);
        cx.arena.replace_in_parent(expr, inner);
        Ok(true)
    }
}

/// Strip operators are idempotent; drop a directly nested duplicate.
pub struct StripDedup;

impl Rule for StripDedup {
    fn name(&self) -> &'static str {
        "strip-dedup"
    }

    fn fire_on(&self) -> Option<&'static [ExprTag]> {
        Some(&[ExprTag::Denull, ExprTag::Deempty])
    }

    fn rewrite(&self, cx: &mut RuleCx<'_>, expr: ExprId) -> Result<bool, CompileError> {
        let inner = cx.arena.child(expr, 0);
        if cx.arena.kind(inner).tag() != cx.arena.kind(expr).tag() {
            return Ok(false);
        }
        let grandchild = cx.arena.child(inner, 0);
        cx.arena.detach(grandchild);
        cx.arena.replace_in_parent(inner, grandchild);
        Ok(true)
    }
}

/// Fold any node whose operands are all literal: arithmetic, projection,
/// strip operators, and array/record constructors.
pub struct ConstFold;

impl ConstFold {
    fn const_value(arena: &ExprArena, id: ExprId) -> Option<&Value> {
        match arena.kind(id) {
            ExprKind::Const(v) => Some(v),
            _ => None,
        }
    }

    fn fold(arena: &ExprArena, expr: ExprId) -> Option<Value> {
        match arena.kind(expr) {
            ExprKind::Math(op) => {
                let lhs = Self::const_value(arena, arena.child(expr, 0))?;
                let rhs = Self::const_value(arena, arena.child(expr, 1))?;
                Value::math(*op, lhs, rhs)
            }
            ExprKind::Field(name) => {
                let v = Self::const_value(arena, arena.child(expr, 0))?;
                Some(v.field(name))
            }
            ExprKind::Denull => {
                let v = Self::const_value(arena, arena.child(expr, 0))?;
                let items = v.as_array()?;
                Some(Value::Array(
                    items.iter().filter(|v| !v.is_null()).cloned().collect(),
                ))
            }
            ExprKind::Deempty => {
                let v = Self::const_value(arena, arena.child(expr, 0))?;
                let items = v.as_array()?;
                Some(Value::Array(
                    items.iter().filter(|v| !v.is_empty_like()).cloned().collect(),
                ))
            }
            ExprKind::Array => {
                let items: Option<Vec<Value>> = arena
                    .children(expr)
                    .iter()
                    .map(|&c| Self::const_value(arena, c).cloned())
                    .collect();
                Some(Value::Array(items?))
            }
            ExprKind::Record(names) => {
                let fields: Option<_> = names
                    .iter()
                    .zip(arena.children(expr))
                    .map(|(name, &c)| Some((name.clone(), Self::const_value(arena, c)?.clone())))
                    .collect();
                Some(Value::Record(fields?))
            }
            _ => None,
        }
    }
}

impl Rule for ConstFold {
    fn name(&self) -> &'static str {
        "const-fold"
    }

    fn fire_on(&self) -> Option<&'static [ExprTag]> {
        Some(&[
            ExprTag::Math,
            ExprTag::Field,
            ExprTag::Denull,
            ExprTag::Deempty,
            ExprTag::Array,
            ExprTag::Record,
        ])
    }

    fn rewrite(&self, cx: &mut RuleCx<'_>, expr: ExprId) -> Result<bool, CompileError> {
        // An empty constructor is already a perfectly good constant; folding
        // it would fire forever.
        if cx.arena.children(expr).is_empty()
            && matches!(cx.arena.kind(expr), ExprKind::Array | ExprKind::Record(_))
        {
            return Ok(false);
        }
        let Some(v) = Self::fold(cx.arena, expr) else {
            return Ok(false);
        };
        let folded = cx.arena.constant(v);
        cx.arena.replace_in_parent(expr, folded);
        Ok(true)
    }
}

/// `avg(xs)` is not algebraic; expand it into `sum(xs) / count(denull(xs))`
/// so each side can be planned on its own.
pub struct AvgExpand;

impl Rule for AvgExpand {
    fn name(&self) -> &'static str {
        "avg-expand"
    }

    fn fire_on(&self) -> Option<&'static [ExprTag]> {
        Some(&[ExprTag::AggCall])
    }

    fn rewrite(&self, cx: &mut RuleCx<'_>, expr: ExprId) -> Result<bool, CompileError> {
        let ExprKind::AggCall(name) = cx.arena.kind(expr) else {
            return Ok(false);
        };
        if name != "avg" {
            return Ok(false);
        }

        let input = cx.arena.child(expr, 0);
        let mut remap = VarMap::default();
        let input_copy = cx.arena.clone_subtree(input, &mut remap);
        cx.arena.detach(input);

        let sum = cx.arena.add(ExprKind::AggCall("sum".into()), vec![input]);
        let non_null = cx.arena.add(ExprKind::Denull, vec![input_copy]);
        let count = cx.arena.add(ExprKind::AggCall("count".into()), vec![non_null]);
        let ratio = cx
            .arena
            .add(ExprKind::Math(crate::value::MathOp::Div), vec![sum, count]);
        cx.arena.replace_in_parent(expr, ratio);
        Ok(true)
    }
}

/// The simplification rule set in its standard order.
pub fn simplification_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(VarInline),
        Box::new(DoMerge),
        Box::new(FunctionInline),
        Box::new(ForToTransform),
        Box::new(TrivialTransformElimination),
        Box::new(TransformMerge),
        Box::new(FilterPushDown),
        Box::new(StripDedup),
        Box::new(ConstFold),
        Box::new(AvgExpand),
    ]
}
