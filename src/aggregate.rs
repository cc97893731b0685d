//! The algebraic aggregate protocol and the built-in aggregates.
//!
//! An aggregate is *algebraic* when a total aggregate over all values can be
//! split into init -> accumulate-many -> partial-result -> combine-partials
//! -> final-result. That split is the precondition for injecting a combiner
//! into a compiled job: the runtime may invoke the combine stage zero or more
//! times per key, grouping partials arbitrarily, so combine must be
//! associative and commutative over partials.
//!
//! [`AggregateFn`] is the raw folding behavior; [`Accumulator`] wraps one in
//! the protocol state machine so out-of-order driving surfaces as a
//! [`ProtocolError`] instead of a silently wrong number. The
//! [`AggregateRegistry`] is the explicit "which names are algebraic" table
//! handed to the engine at construction; nothing here is process-global.

use crate::error::ProtocolError;
use crate::value::{MathOp, Value};
use anyhow::{Result, bail};
use std::collections::HashMap;
use std::fmt;

/// Raw aggregate behavior, without protocol enforcement.
///
/// `add` folds one raw input value; `add_partial` folds one already-partial
/// result and is the dual of `add` over partials. `partial` must be callable
/// repeatedly without disturbing the state. Value-shape problems (summing a
/// string, combining a malformed partial) are data errors, not protocol
/// errors, and come back through `anyhow`.
pub trait AggregateFn: fmt::Debug {
    fn reset(&mut self);
    fn add(&mut self, v: &Value) -> Result<()>;
    fn partial(&self) -> Value;
    fn add_partial(&mut self, partial: &Value) -> Result<()>;
    fn finish(&self) -> Value;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AccState {
    /// Created, or drained by `final_result`. Only `init` is legal.
    Idle,
    /// After `init`: raw values may be accumulated.
    Accumulating,
    /// After the first `partial_result` or `combine`: only partials may be
    /// folded from here on.
    Combining,
}

/// An [`AggregateFn`] under protocol enforcement.
#[derive(Debug)]
pub struct Accumulator {
    name: String,
    fun: Box<dyn AggregateFn>,
    state: AccState,
}

impl Accumulator {
    pub fn new(name: impl Into<String>, fun: Box<dyn AggregateFn>) -> Self {
        Self {
            name: name.into(),
            fun,
            state: AccState::Idle,
        }
    }

    fn guard(&self, op: &'static str, legal: &[AccState]) -> Result<(), ProtocolError> {
        if self.state == AccState::Idle {
            return Err(ProtocolError::BeforeInit {
                agg: self.name.clone(),
                op,
            });
        }
        if legal.contains(&self.state) {
            Ok(())
        } else {
            Err(ProtocolError::AccumulateAfterPartial {
                agg: self.name.clone(),
            })
        }
    }

    /// Reset accumulator state. Always legal; required before reuse.
    pub fn init(&mut self) {
        self.fun.reset();
        self.state = AccState::Accumulating;
    }

    /// Fold one raw input value.
    pub fn accumulate(&mut self, v: &Value) -> Result<()> {
        self.guard("accumulate", &[AccState::Accumulating])?;
        self.fun.add(v)
    }

    /// Serialize the current accumulator. Callable repeatedly; raw
    /// accumulation is illegal afterwards until the next `init`.
    pub fn partial_result(&mut self) -> Result<Value, ProtocolError> {
        self.guard("partial_result", &[AccState::Accumulating, AccState::Combining])?;
        self.state = AccState::Combining;
        Ok(self.fun.partial())
    }

    /// Fold one already-partial result.
    pub fn combine(&mut self, partial: &Value) -> Result<()> {
        self.guard("combine", &[AccState::Accumulating, AccState::Combining])?;
        self.state = AccState::Combining;
        self.fun.add_partial(partial)
    }

    /// Externally visible result; drains the accumulator.
    pub fn final_result(&mut self) -> Result<Value, ProtocolError> {
        if self.state == AccState::Idle {
            return Err(ProtocolError::StaleFinal {
                agg: self.name.clone(),
            });
        }
        self.state = AccState::Idle;
        Ok(self.fun.finish())
    }
}

/// One registered aggregate: whether the planner may treat it as algebraic,
/// and how to build a fresh instance.
pub struct AggregateDef {
    pub algebraic: bool,
    factory: fn() -> Box<dyn AggregateFn>,
}

/// Explicit name -> aggregate table passed into engine construction.
#[derive(Default)]
pub struct AggregateRegistry {
    defs: HashMap<String, AggregateDef>,
}

impl AggregateRegistry {
    /// The standard library: `count`, `sum`, `min`, `max` are algebraic;
    /// `array` (raw per-group values) and `avg` are not. `avg` is expanded
    /// into a sum/count ratio by rewriting before it would ever reach the
    /// combiner analysis.
    pub fn standard() -> Self {
        let mut reg = Self::default();
        reg.register("count", true, || Box::new(CountAgg::default()));
        reg.register("sum", true, || Box::new(SumAgg::default()));
        reg.register("min", true, || Box::new(ExtremumAgg::min()));
        reg.register("max", true, || Box::new(ExtremumAgg::max()));
        reg.register("array", false, || Box::new(ArrayAgg::default()));
        reg.register("avg", false, || Box::new(AvgAgg::default()));
        reg
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        algebraic: bool,
        factory: fn() -> Box<dyn AggregateFn>,
    ) {
        self.defs.insert(name.into(), AggregateDef { algebraic, factory });
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    pub fn is_algebraic(&self, name: &str) -> bool {
        self.defs.get(name).is_some_and(|d| d.algebraic)
    }

    /// Fresh protocol-enforced accumulator for `name`.
    pub fn accumulator(&self, name: &str) -> Option<Accumulator> {
        let def = self.defs.get(name)?;
        Some(Accumulator::new(name, (def.factory)()))
    }

    /// Accumulator for a name the planner already classified as algebraic.
    /// A non-algebraic name here is a broken earlier classification.
    pub fn algebraic_accumulator(&self, name: &str) -> Result<Accumulator, ProtocolError> {
        if !self.is_algebraic(name) {
            return Err(ProtocolError::NotAlgebraic {
                agg: name.to_string(),
            });
        }
        Ok(self.accumulator(name).expect("algebraic aggregate is registered"))
    }
}

/* ===================== count ===================== */

/// Counts every input element. Documented identity is zero, so an empty
/// group reports `0`, not null. The partial is the running count itself.
#[derive(Debug, Default)]
pub struct CountAgg {
    n: i64,
}

impl AggregateFn for CountAgg {
    fn reset(&mut self) {
        self.n = 0;
    }

    fn add(&mut self, _v: &Value) -> Result<()> {
        self.n += 1;
        Ok(())
    }

    fn partial(&self) -> Value {
        Value::Long(self.n)
    }

    fn add_partial(&mut self, partial: &Value) -> Result<()> {
        match partial {
            Value::Long(m) => {
                self.n += m;
                Ok(())
            }
            other => bail!("count: malformed partial {other}"),
        }
    }

    fn finish(&self) -> Value {
        Value::Long(self.n)
    }
}

/* ===================== sum ===================== */

/// Sums numerics, skipping nulls, promoting along long -> double / decimal
/// on the first conflicting input. No non-null input yields null.
#[derive(Debug, Default)]
pub struct SumAgg {
    total: Option<Value>,
}

impl SumAgg {
    fn fold(&mut self, v: &Value) -> Result<()> {
        if v.is_null() {
            return Ok(());
        }
        let total = match &self.total {
            None => match v {
                Value::Long(_) | Value::Double(_) | Value::Decimal(_) => v.clone(),
                other => bail!("sum: non-numeric input {other}"),
            },
            Some(t) => match Value::math(MathOp::Add, t, v) {
                Some(sum) => sum,
                None => bail!("sum: cannot add {v} to running total {t}"),
            },
        };
        self.total = Some(total);
        Ok(())
    }
}

impl AggregateFn for SumAgg {
    fn reset(&mut self) {
        self.total = None;
    }

    fn add(&mut self, v: &Value) -> Result<()> {
        self.fold(v)
    }

    fn partial(&self) -> Value {
        self.total.clone().unwrap_or(Value::Null)
    }

    // A null partial means "that partition saw nothing"; skipping it is what
    // keeps the absent-result rule intact across partitions.
    fn add_partial(&mut self, partial: &Value) -> Result<()> {
        self.fold(partial)
    }

    fn finish(&self) -> Value {
        self.total.clone().unwrap_or(Value::Null)
    }
}

/* ===================== min / max ===================== */

/// Minimum or maximum under the numeric-aware total order, skipping nulls.
#[derive(Debug)]
pub struct ExtremumAgg {
    best: Option<Value>,
    want_max: bool,
}

impl ExtremumAgg {
    pub fn min() -> Self {
        Self {
            best: None,
            want_max: false,
        }
    }

    pub fn max() -> Self {
        Self {
            best: None,
            want_max: true,
        }
    }

    fn fold(&mut self, v: &Value) {
        if v.is_null() {
            return;
        }
        let better = match &self.best {
            None => true,
            Some(b) => {
                let ord = v.total_cmp(b);
                if self.want_max {
                    ord.is_gt()
                } else {
                    ord.is_lt()
                }
            }
        };
        if better {
            self.best = Some(v.clone());
        }
    }
}

impl AggregateFn for ExtremumAgg {
    fn reset(&mut self) {
        self.best = None;
    }

    fn add(&mut self, v: &Value) -> Result<()> {
        self.fold(v);
        Ok(())
    }

    fn partial(&self) -> Value {
        self.best.clone().unwrap_or(Value::Null)
    }

    fn add_partial(&mut self, partial: &Value) -> Result<()> {
        self.fold(partial);
        Ok(())
    }

    fn finish(&self) -> Value {
        self.best.clone().unwrap_or(Value::Null)
    }
}

/* ===================== array ===================== */

/// Collects the raw values in arrival order. Deliberately not algebraic:
/// concatenation of partials is not commutative, so the planner must never
/// push this into a combine stage.
#[derive(Debug, Default)]
pub struct ArrayAgg {
    items: Vec<Value>,
}

impl AggregateFn for ArrayAgg {
    fn reset(&mut self) {
        self.items.clear();
    }

    fn add(&mut self, v: &Value) -> Result<()> {
        self.items.push(v.clone());
        Ok(())
    }

    fn partial(&self) -> Value {
        Value::Array(self.items.clone())
    }

    fn add_partial(&mut self, partial: &Value) -> Result<()> {
        match partial {
            Value::Array(items) => {
                self.items.extend(items.iter().cloned());
                Ok(())
            }
            other => bail!("array: malformed partial {other}"),
        }
    }

    fn finish(&self) -> Value {
        Value::Array(self.items.clone())
    }
}

/* ===================== avg ===================== */

/// Average; a ratio of two separately-algebraic aggregates, so not itself
/// algebraic. Rewriting expands `avg` into `sum / count-of-non-null` before
/// planning; this direct form only runs in sequential evaluation.
#[derive(Debug, Default)]
pub struct AvgAgg {
    sum: SumAgg,
    non_null: i64,
}

impl AggregateFn for AvgAgg {
    fn reset(&mut self) {
        self.sum.reset();
        self.non_null = 0;
    }

    fn add(&mut self, v: &Value) -> Result<()> {
        if !v.is_null() {
            self.non_null += 1;
        }
        self.sum.add(v)
    }

    fn partial(&self) -> Value {
        Value::Array(vec![self.sum.partial(), Value::Long(self.non_null)])
    }

    fn add_partial(&mut self, partial: &Value) -> Result<()> {
        bail!("avg is not algebraic; cannot combine partial {partial}")
    }

    fn finish(&self) -> Value {
        if self.non_null == 0 {
            return Value::Null;
        }
        let sum = self.sum.finish();
        Value::math(MathOp::Div, &sum, &Value::Long(self.non_null)).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_all(acc: &mut Accumulator, values: &[i64]) -> Value {
        acc.init();
        for v in values {
            acc.accumulate(&Value::Long(*v)).unwrap();
        }
        acc.final_result().unwrap()
    }

    #[test]
    fn sum_over_partitions_matches_total() {
        let reg = AggregateRegistry::standard();
        let values = [3i64, 1, 4, 1, 5, 9];

        let mut whole = reg.accumulator("sum").unwrap();
        let expected = run_all(&mut whole, &values);
        assert_eq!(expected, Value::Long(24));

        // Two partitions, combined.
        let partials: Vec<Value> = [&values[..3], &values[3..]]
            .iter()
            .map(|chunk| {
                let mut acc = reg.accumulator("sum").unwrap();
                acc.init();
                for v in *chunk {
                    acc.accumulate(&Value::Long(*v)).unwrap();
                }
                acc.partial_result().unwrap()
            })
            .collect();

        let mut merger = reg.accumulator("sum").unwrap();
        merger.init();
        for p in &partials {
            merger.combine(p).unwrap();
        }
        assert_eq!(merger.final_result().unwrap(), expected);
    }

    #[test]
    fn empty_sum_is_null_but_empty_count_is_zero() {
        let reg = AggregateRegistry::standard();
        let mut sum = reg.accumulator("sum").unwrap();
        sum.init();
        assert_eq!(sum.final_result().unwrap(), Value::Null);

        let mut count = reg.accumulator("count").unwrap();
        count.init();
        assert_eq!(count.final_result().unwrap(), Value::Long(0));
    }

    #[test]
    fn nulls_do_not_zero_a_sum() {
        let reg = AggregateRegistry::standard();
        let mut sum = reg.accumulator("sum").unwrap();
        sum.init();
        sum.accumulate(&Value::Null).unwrap();
        assert_eq!(sum.final_result().unwrap(), Value::Null);
    }

    #[test]
    fn sum_promotes_long_to_double() {
        let reg = AggregateRegistry::standard();
        let mut sum = reg.accumulator("sum").unwrap();
        sum.init();
        sum.accumulate(&Value::Long(1)).unwrap();
        sum.accumulate(&Value::double(0.5)).unwrap();
        assert_eq!(sum.final_result().unwrap(), Value::double(1.5));
    }

    #[test]
    fn accumulate_before_init_is_a_protocol_error() {
        let reg = AggregateRegistry::standard();
        let mut acc = reg.accumulator("count").unwrap();
        let err = acc.accumulate(&Value::Long(1)).unwrap_err();
        let proto = err.downcast::<ProtocolError>().unwrap();
        assert!(matches!(proto, ProtocolError::BeforeInit { .. }));
    }

    #[test]
    fn accumulate_after_partial_is_a_protocol_error() {
        let reg = AggregateRegistry::standard();
        let mut acc = reg.accumulator("sum").unwrap();
        acc.init();
        acc.accumulate(&Value::Long(1)).unwrap();
        let _ = acc.partial_result().unwrap();
        let err = acc.accumulate(&Value::Long(2)).unwrap_err();
        let proto = err.downcast::<ProtocolError>().unwrap();
        assert!(matches!(proto, ProtocolError::AccumulateAfterPartial { .. }));
    }

    #[test]
    fn final_on_stale_accumulator_is_a_protocol_error() {
        let reg = AggregateRegistry::standard();
        let mut acc = reg.accumulator("max").unwrap();
        acc.init();
        acc.accumulate(&Value::Long(7)).unwrap();
        assert_eq!(acc.final_result().unwrap(), Value::Long(7));
        assert!(matches!(
            acc.final_result(),
            Err(ProtocolError::StaleFinal { .. })
        ));
    }

    #[test]
    fn partial_result_is_repeatable() {
        let reg = AggregateRegistry::standard();
        let mut acc = reg.accumulator("min").unwrap();
        acc.init();
        acc.accumulate(&Value::Long(5)).unwrap();
        let a = acc.partial_result().unwrap();
        let b = acc.partial_result().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn registry_flags_algebraic_names() {
        let reg = AggregateRegistry::standard();
        assert!(reg.is_algebraic("sum"));
        assert!(reg.is_algebraic("count"));
        assert!(!reg.is_algebraic("array"));
        assert!(!reg.is_algebraic("avg"));
        assert!(matches!(
            reg.algebraic_accumulator("array"),
            Err(ProtocolError::NotAlgebraic { .. })
        ));
    }
}
