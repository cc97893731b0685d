//! Fixpoint rewrite engine.
//!
//! An engine is an ordered list of phases; a phase is an ordered list of
//! rules sharing one traversal strategy and one iteration cap. A phase
//! repeatedly walks the tree, attempting every rule registered for the
//! current node's kind (registration order, most specific first, wildcard
//! rules last); the first rule that fires ends the pass and the walk
//! restarts, until a full pass fires nothing. Re-running an earlier phase
//! after a later one is expressed by scheduling the phase twice.
//!
//! The engine dispatches purely on kind tags and never inspects semantic
//! meaning; rules mutate only through the arena's two primitives. A rule
//! that keeps reporting "fired" without making progress is caught by the
//! phase cap, which aborts compilation with [`CompileError::IterationCap`].

use crate::aggregate::AggregateRegistry;
use crate::error::CompileError;
use crate::expr::{ExprArena, ExprId, ExprKind, ExprTag};
use crate::io::AdapterRegistry;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Everything a rule may touch while rewriting one node.
pub struct RuleCx<'a> {
    pub arena: &'a mut ExprArena,
    pub aggregates: &'a AggregateRegistry,
    pub adapters: &'a AdapterRegistry,
    pub trace: &'a mut Trace,
}

/// A pure, bounded local transformation registered against one or more
/// expression kinds (or the wildcard). Inspects a single node; either leaves
/// the tree unchanged and reports `false`, or performs one local mutation
/// and reports `true`. Traversal is the engine's job, never the rule's.
pub trait Rule {
    fn name(&self) -> &'static str;

    /// Kinds this rule fires on; `None` is the wildcard "any kind".
    fn fire_on(&self) -> Option<&'static [ExprTag]>;

    fn rewrite(&self, cx: &mut RuleCx<'_>, expr: ExprId) -> Result<bool, CompileError>;
}

/// How a phase visits the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Traversal {
    /// Children before parents; the standard strategy.
    PostOrder,
    /// The root only (used by the plan-compilation phase, which walks its
    /// own segment tree instead).
    RootOnly,
}

pub struct RewritePhase {
    pub name: &'static str,
    pub traversal: Traversal,
    /// Total firings allowed per run of this phase; `0` disables the phase.
    pub max_fire: usize,
    rules: Vec<Box<dyn Rule>>,
    by_tag: HashMap<ExprTag, Vec<usize>>,
    wildcard: Vec<usize>,
}

impl RewritePhase {
    pub fn new(name: &'static str, traversal: Traversal, max_fire: usize) -> Self {
        Self {
            name,
            traversal,
            max_fire,
            rules: Vec::new(),
            by_tag: HashMap::new(),
            wildcard: Vec::new(),
        }
    }

    pub fn rule(mut self, rule: Box<dyn Rule>) -> Self {
        let idx = self.rules.len();
        match rule.fire_on() {
            Some(tags) => {
                for &tag in tags {
                    self.by_tag.entry(tag).or_default().push(idx);
                }
            }
            None => self.wildcard.push(idx),
        }
        self.rules.push(rule);
        self
    }

    /// Rule indices to try for `tag`: specific registrations first, then
    /// wildcard rules.
    fn candidates(&self, tag: ExprTag) -> impl Iterator<Item = usize> + '_ {
        self.by_tag
            .get(&tag)
            .into_iter()
            .flatten()
            .chain(self.wildcard.iter())
            .copied()
    }

    fn run(
        &self,
        phase_index: usize,
        cx: &mut RuleCx<'_>,
        start: ExprId,
    ) -> Result<(), CompileError> {
        if self.max_fire == 0 {
            return Ok(());
        }
        let mut fire_count = 0usize;
        'pass: loop {
            let walk = match self.traversal {
                Traversal::PostOrder => cx.arena.post_order(start),
                Traversal::RootOnly => vec![start],
            };
            for expr in walk {
                let tag = cx.arena.kind(expr).tag();
                for idx in self.candidates(tag).collect::<Vec<_>>() {
                    let rule = &self.rules[idx];
                    if rule.rewrite(cx, expr)? {
                        if let Err(reason) = cx.arena.validate(start) {
                            return Err(CompileError::structural(
                                expr,
                                format!("rule {} broke the tree: {reason}", rule.name()),
                            ));
                        }
                        if cx.trace.enabled {
                            let node = cx.arena.describe(expr);
                            cx.trace.fired(phase_index, rule.name(), node);
                        }
                        fire_count += 1;
                        if fire_count >= self.max_fire {
                            return Err(CompileError::IterationCap {
                                phase: phase_index,
                                cap: self.max_fire,
                            });
                        }
                        // Restart the walk; the tree under us changed.
                        continue 'pass;
                    }
                }
            }
            return Ok(());
        }
    }
}

/// Ordered phases plus the registries rules consult. The schedule indexes
/// into `phases`, so a phase can appear more than once.
pub struct RewriteEngine {
    phases: Vec<RewritePhase>,
    schedule: Vec<usize>,
    pub aggregates: AggregateRegistry,
    pub adapters: AdapterRegistry,
    pub trace: Trace,
}

impl RewriteEngine {
    pub fn new(aggregates: AggregateRegistry, adapters: AdapterRegistry) -> Self {
        Self {
            phases: Vec::new(),
            schedule: Vec::new(),
            aggregates,
            adapters,
            trace: Trace::default(),
        }
    }

    /// Append a phase and schedule it once. Returns the phase index for
    /// re-scheduling.
    pub fn phase(&mut self, phase: RewritePhase) -> usize {
        self.phases.push(phase);
        let idx = self.phases.len() - 1;
        self.schedule.push(idx);
        idx
    }

    /// Schedule an existing phase again (cyclic phase lists).
    pub fn reschedule(&mut self, phase_index: usize) {
        assert!(phase_index < self.phases.len());
        self.schedule.push(phase_index);
    }

    pub fn enable_trace(&mut self) {
        self.trace.enabled = true;
    }

    /// Run every scheduled phase in order over the tree rooted at `root`.
    ///
    /// The root is held under a sentinel node for the duration so rules may
    /// replace any node, the root included; the possibly new root is
    /// returned.
    pub fn run(&mut self, arena: &mut ExprArena, root: ExprId) -> Result<ExprId, CompileError> {
        let sentinel = arena.add(ExprKind::Do, vec![root]);
        let schedule = self.schedule.clone();
        for phase_index in schedule {
            let phase = &self.phases[phase_index];
            let mut cx = RuleCx {
                arena,
                aggregates: &self.aggregates,
                adapters: &self.adapters,
                trace: &mut self.trace,
            };
            phase.run(phase_index, &mut cx, sentinel)?;
        }
        let new_root = arena.child(sentinel, 0);
        arena.detach(new_root);
        Ok(new_root)
    }
}

/// One observable compilation decision. Collected only when tracing is on;
/// tracing never alters compilation outcomes, only observability.
#[derive(Clone, Debug, Serialize)]
pub enum TraceEvent {
    RuleFired {
        phase: usize,
        rule: String,
        node: String,
    },
    Classified {
        node: String,
        kind: String,
    },
    Planned {
        node: String,
        decision: String,
    },
}

#[derive(Default)]
pub struct Trace {
    pub enabled: bool,
    events: Vec<TraceEvent>,
}

impl Trace {
    pub fn fired(&mut self, phase: usize, rule: &str, node: String) {
        if self.enabled {
            self.events.push(TraceEvent::RuleFired {
                phase,
                rule: rule.to_string(),
                node,
            });
        }
    }

    pub fn classified(&mut self, node: String, kind: impl fmt::Display) {
        if self.enabled {
            self.events.push(TraceEvent::Classified {
                node,
                kind: kind.to_string(),
            });
        }
    }

    pub fn planned(&mut self, node: String, decision: impl Into<String>) {
        if self.enabled {
            self.events.push(TraceEvent::Planned {
                node,
                decision: decision.into(),
            });
        }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Firings recorded so far; the fixpoint tests key off this.
    pub fn fire_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, TraceEvent::RuleFired { .. }))
            .count()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for event in &self.events {
            match event {
                TraceEvent::RuleFired { phase, rule, node } => {
                    writeln!(f, "fired  phase={phase} rule={rule} at {node}")?;
                }
                TraceEvent::Classified { node, kind } => {
                    writeln!(f, "segment {kind} at {node}")?;
                }
                TraceEvent::Planned { node, decision } => {
                    writeln!(f, "planned {decision} at {node}")?;
                }
            }
        }
        Ok(())
    }
}
