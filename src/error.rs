//! Compile-time error classes.
//!
//! Three classes, kept distinguishable so tooling can react differently:
//! structural violations (the tree has a shape a rule or the planner cannot
//! legally handle), iteration-cap exhaustion (the fixpoint guard tripped),
//! and aggregate protocol violations (a programming error in an aggregate
//! implementation). Compilation is deterministic and never retried; every
//! failure is surfaced to the caller.

use crate::expr::ExprId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    /// The tree reached a shape compilation cannot handle. Unrecoverable;
    /// reported with the offending node.
    #[error("structural violation at {node:?}: {reason}")]
    Structural { node: ExprId, reason: String },

    /// A rewrite phase exceeded its iteration cap. Distinct from a
    /// structural failure so callers can suggest disabling specific rules.
    #[error("rewrite phase {phase} exceeded its iteration cap of {cap} firings")]
    IterationCap { phase: usize, cap: usize },

    /// An algebraic aggregate was driven out of protocol. Always an internal
    /// error in the aggregate implementation, never a data error.
    #[error("aggregate protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Out-of-order use of the init / accumulate / partial / combine / final
/// protocol. Surfaced instead of silently producing a wrong result.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{op} called before init on aggregate '{agg}'")]
    BeforeInit { agg: String, op: &'static str },

    #[error("accumulate called after partial_result on aggregate '{agg}' without a new init")]
    AccumulateAfterPartial { agg: String },

    #[error("final_result requested on a stale accumulator of aggregate '{agg}'")]
    StaleFinal { agg: String },

    #[error("aggregate '{agg}' does not implement the algebraic protocol")]
    NotAlgebraic { agg: String },
}

impl CompileError {
    pub fn structural(node: ExprId, reason: impl Into<String>) -> Self {
        CompileError::Structural {
            node,
            reason: reason.into(),
        }
    }
}
