//! The JSON value model the compiler folds constants over and the reference
//! runner evaluates.
//!
//! Values carry three numeric tiers (long, double, arbitrary-precision
//! decimal) and a total order so any value can serve as a grouping key.
//! Doubles are wrapped in [`OrderedFloat`] and decimals in [`OrderedDecimal`]
//! so the whole enum derives `Ord` and `Hash`.

use dec::{Context, OrderedDecimal};
use ordered_float::OrderedFloat;
use std::collections::BTreeMap;
use std::fmt;

/// Arbitrary-precision decimal used for the widest numeric tier.
pub type Numeric = dec::Decimal<13>;

/// A JSON value.
///
/// Variant order defines the cross-type total order, which only needs to be
/// deterministic (group keys of mixed types sort consistently), not
/// semantically meaningful.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Null,
    Bool(bool),
    Long(i64),
    Double(OrderedFloat<f64>),
    Decimal(OrderedDecimal<Numeric>),
    String(String),
    Array(Vec<Value>),
    Record(BTreeMap<String, Value>),
}

/// Binary arithmetic operators understood by constant folding and the runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MathOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl fmt::Display for MathOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MathOp::Add => "+",
            MathOp::Sub => "-",
            MathOp::Mul => "*",
            MathOp::Div => "/",
        };
        f.write_str(s)
    }
}

impl Value {
    pub fn double(v: f64) -> Value {
        Value::Double(OrderedFloat(v))
    }

    pub fn decimal(v: Numeric) -> Value {
        Value::Decimal(OrderedDecimal(v))
    }

    pub fn string(v: impl Into<String>) -> Value {
        Value::String(v.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Array contents, or `None` for non-arrays. Null is the empty array in
    /// iteration contexts; callers decide whether to accept it.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// True for the values the empty-stripping operator removes: null and
    /// empty containers.
    pub fn is_empty_like(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Array(items) => items.is_empty(),
            Value::Record(fields) => fields.is_empty(),
            _ => false,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Record field lookup; null for a missing field or a non-record, which
    /// is how path expressions behave in the query language.
    pub fn field(&self, name: &str) -> Value {
        match self {
            Value::Record(fields) => fields.get(name).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// The value as a decimal, when it is numeric at all.
    pub fn as_numeric(&self) -> Option<OrderedDecimal<Numeric>> {
        match self {
            Value::Long(i) => Some(OrderedDecimal(Numeric::from(*i))),
            Value::Double(f) => Some(OrderedDecimal(Numeric::from(f.0))),
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Total order that compares numerics across tiers by magnitude and
    /// everything else by the derived variant order. Used by min/max
    /// aggregation; plain `Ord` is enough for grouping keys.
    pub fn total_cmp(&self, other: &Value) -> std::cmp::Ordering {
        match (self.as_numeric(), other.as_numeric()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.cmp(other),
        }
    }

    /// Apply `op` with null propagation and numeric promotion.
    ///
    /// Longs stay longs while they fit; overflow promotes to decimal. A long
    /// mixes with either wider tier by promotion, but doubles and decimals do
    /// not mix (no exact conversion exists); that combination returns `None`,
    /// as does any non-numeric operand.
    pub fn math(op: MathOp, a: &Value, b: &Value) -> Option<Value> {
        use Value::*;
        match (a, b) {
            (Null, _) | (_, Null) => Some(Null),
            (Long(_), Long(0)) if op == MathOp::Div => None,
            (Long(x), Long(y)) => Some(long_math(op, *x, *y)),
            (Long(x), Double(y)) => Some(double_math(op, *x as f64, y.0)),
            (Double(x), Long(y)) => Some(double_math(op, x.0, *y as f64)),
            (Double(x), Double(y)) => Some(double_math(op, x.0, y.0)),
            (Long(x), Decimal(y)) => Some(decimal_math(op, Numeric::from(*x), y.0)),
            (Decimal(x), Long(y)) => Some(decimal_math(op, x.0, Numeric::from(*y))),
            (Decimal(x), Decimal(y)) => Some(decimal_math(op, x.0, y.0)),
            _ => None,
        }
    }
}

fn long_math(op: MathOp, x: i64, y: i64) -> Value {
    let exact = match op {
        MathOp::Add => x.checked_add(y),
        MathOp::Sub => x.checked_sub(y),
        MathOp::Mul => x.checked_mul(y),
        // Integer division only when it divides evenly; otherwise widen.
        MathOp::Div => {
            if y != 0 && x % y == 0 {
                Some(x / y)
            } else {
                None
            }
        }
    };
    match exact {
        Some(v) => Value::Long(v),
        None => decimal_math(op, Numeric::from(x), Numeric::from(y)),
    }
}

fn double_math(op: MathOp, x: f64, y: f64) -> Value {
    let v = match op {
        MathOp::Add => x + y,
        MathOp::Sub => x - y,
        MathOp::Mul => x * y,
        MathOp::Div => x / y,
    };
    Value::double(v)
}

fn decimal_math(op: MathOp, mut x: Numeric, y: Numeric) -> Value {
    let mut cx = Context::<Numeric>::default();
    match op {
        MathOp::Add => cx.add(&mut x, &y),
        MathOp::Sub => cx.sub(&mut x, &y),
        MathOp::Mul => cx.mul(&mut x, &y),
        MathOp::Div => cx.div(&mut x, &y),
    }
    Value::decimal(x)
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(v.to_string())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Long(i)
                } else if let Some(f) = n.as_f64() {
                    Value::double(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::Record(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> serde_json::Value {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Long(i) => serde_json::Value::from(*i),
            Value::Double(f) => {
                serde_json::Number::from_f64(f.0).map_or(serde_json::Value::Null, Into::into)
            }
            // Decimals have no JSON number form; render through their text
            // representation (test/trace output only, never arithmetic).
            Value::Decimal(d) => serde_json::Value::String(d.0.to_string()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Record(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", serde_json::Value::from(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_overflow_promotes_to_decimal() {
        let v = Value::math(MathOp::Add, &Value::Long(i64::MAX), &Value::Long(1)).unwrap();
        assert!(matches!(v, Value::Decimal(_)));
    }

    #[test]
    fn uneven_long_division_widens() {
        let v = Value::math(MathOp::Div, &Value::Long(7), &Value::Long(2)).unwrap();
        match v {
            Value::Decimal(d) => assert_eq!(d.0.to_string(), "3.5"),
            other => panic!("expected decimal, got {other:?}"),
        }
    }

    #[test]
    fn null_propagates() {
        assert_eq!(
            Value::math(MathOp::Mul, &Value::Null, &Value::Long(3)),
            Some(Value::Null)
        );
    }

    #[test]
    fn double_and_decimal_do_not_mix() {
        let d = Value::decimal(Numeric::from(1i64));
        assert_eq!(Value::math(MathOp::Add, &Value::double(1.0), &d), None);
    }

    #[test]
    fn json_round_trip() {
        let j: serde_json::Value = serde_json::json!({"k": "a", "n": 3, "xs": [1, null]});
        let v = Value::from(j.clone());
        assert_eq!(serde_json::Value::from(&v), j);
    }
}
