//! Testing utilities for query compilation.
//!
//! This module provides the pieces tests keep rebuilding by hand:
//!
//! - **Value builders**: construct rows and records tersely
//! - **Assertions**: compare result arrays, ordered or unordered
//! - **Harness**: a wired-up store, registries, engine, and runner
//!
//! # Quick Start
//!
//! ```no_run
//! use jsonmill::testing::*;
//! use jsonmill::expr::ExprArena;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut harness = QueryHarness::new();
//! let input = harness.load("sales", longs(&[3, 1, 4]));
//! let mut arena = ExprArena::new();
//! // ... build a query over `input` ...
//! # let root = arena.constant(input.to_value());
//! let (compiled, result) = harness.check(&mut arena, root)?;
//! # Ok(())
//! # }
//! ```

use crate::aggregate::AggregateRegistry;
use crate::error::CompileError;
use crate::expr::{ExprArena, ExprId};
use crate::io::{AdapterRegistry, Descriptor, MemStore};
use crate::planner::standard_engine;
use crate::rewrite::RewriteEngine;
use crate::runner::Runner;
use crate::value::Value;
use anyhow::Result;
use std::collections::BTreeMap;

/// Rows of longs.
pub fn longs(vals: &[i64]) -> Vec<Value> {
    vals.iter().map(|&v| Value::Long(v)).collect()
}

/// A record value from field pairs.
pub fn record(fields: &[(&str, Value)]) -> Value {
    let mut map = BTreeMap::new();
    for (name, value) in fields {
        map.insert((*name).to_string(), value.clone());
    }
    Value::Record(map)
}

/// Assert a result is exactly these rows, in order.
pub fn assert_rows_equal(actual: &Value, expected: &[Value]) {
    assert_eq!(
        actual,
        &Value::Array(expected.to_vec()),
        "rows differ (ordered comparison)"
    );
}

/// Assert a result holds exactly these rows, ignoring order.
pub fn assert_rows_unordered_equal(actual: &Value, expected: &[Value]) {
    let Value::Array(items) = actual else {
        panic!("expected an array result, got {actual}");
    };
    let mut actual_sorted = items.clone();
    actual_sorted.sort();
    let mut expected_sorted = expected.to_vec();
    expected_sorted.sort();
    assert_eq!(actual_sorted, expected_sorted, "rows differ (unordered comparison)");
}

/// Store, registries, engine, and runner wired together.
///
/// The adapter table starts with `parfile` (parallel) and `local` (not), so
/// tests can exercise both sides of the classifier without setup.
pub struct QueryHarness {
    pub store: MemStore,
    pub engine: RewriteEngine,
}

impl QueryHarness {
    pub fn new() -> Self {
        let mut adapters = AdapterRegistry::new();
        adapters.register("parfile", true);
        adapters.register("local", false);
        let mut engine = standard_engine(AggregateRegistry::standard(), adapters);
        engine.enable_trace();
        Self { store: MemStore::new(), engine }
    }

    /// Put rows into the store under a parallel descriptor.
    pub fn load(&self, location: &str, rows: Vec<Value>) -> Descriptor {
        let desc = Descriptor::new("parfile", location);
        self.store.put(&desc, rows);
        desc
    }

    /// Put rows into the store under a sequential-only descriptor.
    pub fn load_local(&self, location: &str, rows: Vec<Value>) -> Descriptor {
        let desc = Descriptor::new("local", location);
        self.store.put(&desc, rows);
        desc
    }

    pub fn compile(&mut self, arena: &mut ExprArena, root: ExprId) -> Result<ExprId, CompileError> {
        self.engine.run(arena, root)
    }

    pub fn run(&self, arena: &ExprArena, root: ExprId) -> Result<Value> {
        Runner::new(&self.store, &self.engine.aggregates).run(arena, root)
    }

    /// Evaluate `root` sequentially, compile it, evaluate the compiled tree,
    /// and assert the two results agree. Returns the compiled root and the
    /// result.
    ///
    /// Only for queries without writes; a query with a write would execute
    /// its effect twice.
    pub fn check(&mut self, arena: &mut ExprArena, root: ExprId) -> Result<(ExprId, Value)> {
        let before = self.run(arena, root)?;
        let compiled = self.compile(arena, root)?;
        let after = self.run(arena, compiled)?;
        assert_eq!(before, after, "compilation changed the query's result");
        Ok((compiled, after))
    }
}

/// All compiled-job nodes under `root`, in post-order.
pub fn find_jobs(arena: &ExprArena, root: ExprId) -> Vec<ExprId> {
    arena
        .post_order(root)
        .into_iter()
        .filter(|&e| matches!(arena.kind(e), crate::expr::ExprKind::MapReduce(_)))
        .collect()
}

impl Default for QueryHarness {
    fn default() -> Self {
        Self::new()
    }
}
