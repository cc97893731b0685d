//! # jsonmill
//!
//! An **optimizing compiler core** for a JSON-oriented query language:
//! queries arrive as mutable expression trees, get normalized by a fixpoint
//! rewrite engine, and leave with their parallelizable regions compiled into
//! explicit map/group/combine job nodes.
//!
//! ## Key Pieces
//!
//! - **Expression arena** - index-addressed tree with parent back-links;
//!   every rewrite goes through two mutation primitives
//! - **Rewrite engine** - ordered phases of local rules, run to fixpoint
//!   under an iteration cap, dispatched by node kind
//! - **Segment classifier** - decides which regions can run as distributed
//!   map or group stages and which must stay sequential
//! - **Plan compiler** - replaces classified segments with job nodes,
//!   synthesizing map, combine, and reduce functions
//! - **Algebraic aggregates** - the init/accumulate/partial/combine/final
//!   protocol, enforced by a state machine, that makes combine stages sound
//! - **Reference runner** - evaluates trees before and after compilation,
//!   simulating jobs with real partitioning
//!
//! ## Quick Start
//!
//! ```ignore
//! use jsonmill::prelude::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut adapters = AdapterRegistry::new();
//! adapters.register("parfile", true);
//! let mut engine = standard_engine(AggregateRegistry::standard(), adapters);
//!
//! let mut arena = ExprArena::new();
//! // ... build a query tree in `arena` ...
//! # let root = arena.constant(Value::Null);
//! let compiled = engine.run(&mut arena, root)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Design Notes
//!
//! The compiler is single-threaded and synchronous: a tree is rewritten to
//! completion or compilation fails with a [`error::CompileError`]. The
//! concurrency story lives entirely in the contracts of the plans it emits;
//! see [`runner`] for the stage contracts the planner assumes.

pub mod aggregate;
pub mod error;
pub mod expr;
pub mod io;
pub mod planner;
pub mod rewrite;
pub mod rules;
pub mod runner;
pub mod segment;
pub mod testing;
pub mod value;

pub use aggregate::{Accumulator, AggregateFn, AggregateRegistry};
pub use error::{CompileError, ProtocolError};
pub use expr::{ExprArena, ExprId, ExprKind, ExprTag, JobShape, JobSpec, VarId};
pub use io::{AdapterRegistry, Descriptor, MemStore};
pub use planner::standard_engine;
pub use rewrite::{RewriteEngine, RewritePhase, Rule, RuleCx, Trace, TraceEvent, Traversal};
pub use runner::Runner;
pub use segment::{Classifier, Segment, SegmentKind};
pub use value::Value;

/// Common imports for building and compiling queries.
pub mod prelude {
    pub use crate::aggregate::AggregateRegistry;
    pub use crate::expr::{ExprArena, ExprId, ExprKind, GroupInput, GroupSpec, VarId};
    pub use crate::io::{AdapterRegistry, Descriptor, MemStore};
    pub use crate::planner::standard_engine;
    pub use crate::runner::Runner;
    pub use crate::value::{MathOp, Value};
}
