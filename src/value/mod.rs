//! # Value System
//!
//! Runtime values flowing through the function-node graph and the query
//! runtime: scalars, ranges, ordered sets, attribute-value records, area
//! references, projectors and defun references.
//!
//! Everything is an ordered set: a scalar is a singleton, `Undefined` is the
//! empty set. Ordered sets never nest; [`Value::os`] flattens on
//! construction.
//!
//! ## Usage
//!
//! ```rust
//! use weft::value::Value;
//!
//! let v = Value::os(vec![Value::number(1.0), Value::number(2.0)]);
//! assert_eq!(v.size(), 2);
//! assert!(v.is_true());
//! assert_eq!(v.first(), Value::number(1.0));
//! ```

pub mod valuetype;

pub use valuetype::{SizeRange, SizeRanges, ValueType};

use crate::fnode::DefunId;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A closed range endpoint pair. Endpoints are arbitrary ordered values so
/// both numeric and string ranges work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RangeValue {
    pub low: Box<Value>,
    pub high: Box<Value>,
    pub low_open: bool,
    pub high_open: bool,
}

impl RangeValue {
    pub fn closed(low: Value, high: Value) -> Self {
        RangeValue {
            low: Box::new(low),
            high: Box::new(high),
            low_open: false,
            high_open: false,
        }
    }

    /// Whether `v` falls inside the range.
    pub fn contains(&self, v: &Value) -> bool {
        let lo = match v.partial_cmp(&self.low) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Equal) => !self.low_open,
            _ => false,
        };
        if !lo {
            return false;
        }
        match v.partial_cmp(&self.high) {
            Some(Ordering::Less) => true,
            Some(Ordering::Equal) => !self.high_open,
            _ => false,
        }
    }
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    /// The empty ordered set.
    Undefined,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    Range(RangeValue),
    OrderedSet(Vec<Value>),
    Record(BTreeMap<String, Value>),
    /// Reference to a runtime area.
    AreaRef(u64),
    /// The projection terminal (`_`).
    Projector,
    /// Reference to a compiled defun.
    Defun(DefunId),
    /// Opaque foreign-function handle.
    Foreign(u32),
}

/// Canonical bit pattern for a number: one NaN, one zero.
fn num_bits(n: f64) -> u64 {
    if n.is_nan() {
        f64::NAN.to_bits()
    } else if n == 0.0 {
        0.0_f64.to_bits()
    } else {
        n.to_bits()
    }
}

fn variant_rank(v: &Value) -> u8 {
    match v {
        Value::Undefined => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Range(_) => 4,
        Value::OrderedSet(_) => 5,
        Value::Record(_) => 6,
        Value::AreaRef(_) => 7,
        Value::Projector => 8,
        Value::Defun(_) => 9,
        Value::Foreign(_) => 10,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Projector, Value::Projector) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => num_bits(*a) == num_bits(*b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::OrderedSet(a), Value::OrderedSet(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::AreaRef(a), Value::AreaRef(b)) => a == b,
            (Value::Defun(a), Value::Defun(b)) => a == b,
            (Value::Foreign(a), Value::Foreign(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        variant_rank(self).hash(state);
        match self {
            Value::Undefined | Value::Projector => {}
            Value::Bool(b) => b.hash(state),
            Value::Number(n) => num_bits(*n).hash(state),
            Value::String(s) => s.hash(state),
            Value::Range(r) => r.hash(state),
            Value::OrderedSet(items) => items.hash(state),
            Value::Record(map) => map.hash(state),
            Value::AreaRef(id) => id.hash(state),
            Value::Defun(d) => d.hash(state),
            Value::Foreign(f) => f.hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => {
                f64::from_bits(num_bits(*a)).total_cmp(&f64::from_bits(num_bits(*b)))
            }
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Range(a), Value::Range(b)) => a.cmp(b),
            (Value::OrderedSet(a), Value::OrderedSet(b)) => a.cmp(b),
            (Value::Record(a), Value::Record(b)) => a.cmp(b),
            (Value::AreaRef(a), Value::AreaRef(b)) => a.cmp(b),
            (Value::Defun(a), Value::Defun(b)) => a.cmp(b),
            (Value::Foreign(a), Value::Foreign(b)) => a.cmp(b),
            (a, b) => variant_rank(a).cmp(&variant_rank(b)),
        }
    }
}

impl Value {
    pub fn number(n: f64) -> Value {
        Value::Number(n)
    }

    pub fn string(s: &str) -> Value {
        Value::String(Arc::from(s))
    }

    /// Build an ordered set, flattening nested sets and dropping empties.
    /// A singleton collapses to its single member.
    pub fn os(items: Vec<Value>) -> Value {
        let mut flat = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::Undefined => {}
                Value::OrderedSet(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Value::Undefined,
            1 => flat.into_iter().next().unwrap_or(Value::Undefined),
            _ => Value::OrderedSet(flat),
        }
    }

    /// Number of elements when viewed as an ordered set.
    pub fn size(&self) -> usize {
        match self {
            Value::Undefined => 0,
            Value::OrderedSet(items) => items.len(),
            _ => 1,
        }
    }

    pub fn is_empty_os(&self) -> bool {
        self.size() == 0
    }

    /// Truthiness: `false`, the empty set and a set of only false values are
    /// false; everything else is true.
    pub fn is_true(&self) -> bool {
        match self {
            Value::Undefined => false,
            Value::Bool(b) => *b,
            Value::OrderedSet(items) => items.iter().any(Value::is_true),
            _ => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::OrderedSet(items) if items.len() == 1 => items[0].as_number(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Iterate the value as an ordered set.
    pub fn items(&self) -> impl Iterator<Item = &Value> {
        let slice: &[Value] = match self {
            Value::Undefined => &[],
            Value::OrderedSet(items) => items.as_slice(),
            other => std::slice::from_ref(other),
        };
        slice.iter()
    }

    /// First element, or empty when the set is empty.
    pub fn first(&self) -> Value {
        self.items().next().cloned().unwrap_or(Value::Undefined)
    }

    /// Last element, or empty when the set is empty.
    pub fn last(&self) -> Value {
        self.items().last().cloned().unwrap_or(Value::Undefined)
    }

    /// Whether the value contains `other` as an element (ordered-set
    /// membership; a scalar is its own singleton).
    pub fn contains_element(&self, other: &Value) -> bool {
        self.items().any(|item| item == other)
    }

    /// Shallow merge: `other` wins per attribute; non-records replace.
    pub fn merge_under(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Record(base), Value::Record(over)) => {
                let mut out = base.clone();
                for (k, v) in over {
                    let merged = match base.get(k) {
                        Some(prev) => prev.merge_under(v),
                        None => v.clone(),
                    };
                    out.insert(k.clone(), merged);
                }
                Value::Record(out)
            }
            (_, v) => v.clone(),
        }
    }

    /// JSON rendering for diagnostics and graph dumps.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::Undefined => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Number(n) => json!(n),
            Value::String(s) => json!(&**s),
            Value::Range(r) => json!({
                "range": [r.low.to_json(), r.high.to_json()],
                "lowOpen": r.low_open,
                "highOpen": r.high_open,
            }),
            Value::OrderedSet(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Record(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::AreaRef(id) => json!({ "area": id }),
            Value::Projector => json!("_"),
            Value::Defun(d) => json!({ "defun": d.0 }),
            Value::Foreign(f) => json!({ "foreign": f }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "o()"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Range(r) => write!(
                f,
                "r{}{}, {}{}",
                if r.low_open { '(' } else { '[' },
                r.low,
                r.high,
                if r.high_open { ')' } else { ']' }
            ),
            Value::OrderedSet(items) => {
                write!(f, "o(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Value::Record(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::AreaRef(id) => write!(f, "@{id}"),
            Value::Projector => write!(f, "_"),
            Value::Defun(d) => write!(f, "defun#{}", d.0),
            Value::Foreign(id) => write!(f, "foreign#{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_flattens_and_collapses() {
        let v = Value::os(vec![
            Value::number(1.0),
            Value::Undefined,
            Value::os(vec![Value::number(2.0), Value::number(3.0)]),
        ]);
        assert_eq!(v.size(), 3);
        assert_eq!(Value::os(vec![Value::number(7.0)]), Value::number(7.0));
        assert_eq!(Value::os(vec![]), Value::Undefined);
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Undefined.is_true());
        assert!(!Value::Bool(false).is_true());
        assert!(Value::number(0.0).is_true());
        assert!(!Value::os(vec![Value::Bool(false), Value::Bool(false)]).is_true());
        assert!(Value::os(vec![Value::Bool(false), Value::Bool(true)]).is_true());
    }

    #[test]
    fn nan_and_zero_canonicalisation() {
        assert_eq!(Value::number(f64::NAN), Value::number(-f64::NAN));
        assert_eq!(Value::number(0.0), Value::number(-0.0));
    }

    #[test]
    fn range_containment() {
        let r = RangeValue::closed(Value::number(1.0), Value::number(5.0));
        assert!(r.contains(&Value::number(1.0)));
        assert!(r.contains(&Value::number(3.5)));
        assert!(!r.contains(&Value::number(5.1)));
        let open = RangeValue {
            low: Box::new(Value::number(1.0)),
            high: Box::new(Value::number(5.0)),
            low_open: true,
            high_open: false,
        };
        assert!(!open.contains(&Value::number(1.0)));
    }

    #[test]
    fn merge_under_prefers_writer() {
        let mut a = BTreeMap::new();
        a.insert("x".to_string(), Value::number(1.0));
        a.insert("y".to_string(), Value::number(2.0));
        let mut b = BTreeMap::new();
        b.insert("y".to_string(), Value::number(9.0));
        let merged = Value::Record(a).merge_under(&Value::Record(b));
        match merged {
            Value::Record(m) => {
                assert_eq!(m["x"], Value::number(1.0));
                assert_eq!(m["y"], Value::number(9.0));
            }
            other => panic!("expected record, got {other}"),
        }
    }
}
