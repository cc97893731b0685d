//! Descriptor layer consumed by the compiler.
//!
//! The compiler never performs I/O. It asks two things of this layer: whether
//! a read/write descriptor is parallel-capable (and may therefore anchor a
//! distributed map stage), and a way to fabricate internal temporary
//! descriptors to materialize intermediate results. The in-memory store at
//! the bottom exists for the reference runner and tests only.
//!
//! The adapter registry is an explicit value handed to the engine at
//! construction time; there is no process-wide adapter table.

use crate::expr::{ExprArena, ExprId, ExprKind};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Name of the adapter internal temporaries are fabricated under.
pub const TEMP_ADAPTER: &str = "temp";

/// A storage descriptor: which adapter reads/writes it, and where.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    pub adapter: String,
    pub location: String,
}

impl Descriptor {
    pub fn new(adapter: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            location: location.into(),
        }
    }

    /// Descriptor as the record value read/write expressions carry.
    pub fn to_value(&self) -> Value {
        let mut fields = BTreeMap::new();
        fields.insert("adapter".to_string(), Value::String(self.adapter.clone()));
        fields.insert("location".to_string(), Value::String(self.location.clone()));
        Value::Record(fields)
    }

    pub fn from_value(v: &Value) -> Option<Descriptor> {
        let (Value::String(adapter), Value::String(location)) =
            (v.field("adapter"), v.field("location"))
        else {
            return None;
        };
        Some(Descriptor::new(adapter, location))
    }
}

/// Which adapters exist and which of them are parallel-capable; also the
/// factory for internal temporary descriptors.
#[derive(Debug, Default)]
pub struct AdapterRegistry {
    parallel: HashSet<String>,
    temp_counter: RefCell<u64>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        let mut reg = Self::default();
        // Temporaries always live on the parallel substrate.
        reg.register(TEMP_ADAPTER, true);
        reg
    }

    pub fn register(&mut self, adapter: impl Into<String>, parallel: bool) {
        let adapter = adapter.into();
        if parallel {
            self.parallel.insert(adapter);
        } else {
            self.parallel.remove(&adapter);
        }
    }

    pub fn is_parallel(&self, desc: &Descriptor) -> bool {
        self.parallel.contains(&desc.adapter)
    }

    /// Fresh internal temporary descriptor.
    pub fn make_temp(&self) -> Descriptor {
        let mut n = self.temp_counter.borrow_mut();
        *n += 1;
        Descriptor::new(TEMP_ADAPTER, format!("__temp{}", *n))
    }

    /// Static parallel-capability of a descriptor expression. Anything the
    /// compiler cannot see through is conservatively sequential.
    pub fn expr_is_parallel(&self, arena: &ExprArena, descriptor: ExprId) -> bool {
        match static_descriptor(arena, descriptor) {
            Some(desc) => self.is_parallel(&desc),
            None => false,
        }
    }
}

/// Statically known descriptor of an expression: a literal descriptor record,
/// a write (which evaluates to the descriptor it wrote), or a compiled job
/// (which evaluates to its output descriptor).
pub fn static_descriptor(arena: &ExprArena, expr: ExprId) -> Option<Descriptor> {
    match arena.kind(expr) {
        ExprKind::Const(v) => Descriptor::from_value(v),
        ExprKind::Write => static_descriptor(arena, arena.child(expr, 1)),
        ExprKind::MapReduce(_) => static_descriptor(arena, arena.job_output(expr)),
        _ => None,
    }
}

/// In-memory table store backing the reference runner: location -> rows.
#[derive(Debug, Default)]
pub struct MemStore {
    tables: RefCell<HashMap<String, Vec<Value>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, desc: &Descriptor, rows: Vec<Value>) {
        self.tables.borrow_mut().insert(desc.location.clone(), rows);
    }

    pub fn get(&self, desc: &Descriptor) -> Option<Vec<Value>> {
        self.tables.borrow().get(&desc.location).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_value_round_trip() {
        let d = Descriptor::new("parfile", "sales");
        assert_eq!(Descriptor::from_value(&d.to_value()), Some(d));
    }

    #[test]
    fn temps_are_unique_and_parallel() {
        let reg = AdapterRegistry::new();
        let a = reg.make_temp();
        let b = reg.make_temp();
        assert_ne!(a.location, b.location);
        assert!(reg.is_parallel(&a));
    }

    #[test]
    fn unknown_adapter_is_sequential() {
        let reg = AdapterRegistry::new();
        assert!(!reg.is_parallel(&Descriptor::new("mystery", "x")));
    }
}
