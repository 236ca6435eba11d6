//! Marshaled values
//!
//! [`Value`] is the host-side representation of anything that crosses the
//! sandbox boundary: tool arguments, tool results, console arguments and the
//! final return value of a guest script.
//!
//! Host code that needs aliasing (the same sub-object reachable from two
//! places) or genuine reference cycles wraps the shared part in a
//! [`SharedValue`]. Identity of a shared value is the identity of its
//! allocation, which is what the marshaler uses to tell a cycle apart from a
//! repeated reference.

use num_bigint::BigInt;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// Replacement emitted at the edge that closes a reference cycle
pub const CIRCULAR_SENTINEL: &str = "[Circular]";

/// Key of the tagged placeholder used for functions and symbols
pub const UNSERIALIZABLE_TAG: &str = "__unserializable__";

/// Kind of a value that has no data representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnserializableKind {
    Function,
    Symbol,
}

impl UnserializableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnserializableKind::Function => "function",
            UnserializableKind::Symbol => "symbol",
        }
    }
}

impl fmt::Display for UnserializableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference-counted, interior-mutable value with identity
#[derive(Clone)]
pub struct SharedValue(Arc<RwLock<Value>>);

impl SharedValue {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Value> {
        self.0.read()
    }

    /// Replace the wrapped value
    pub fn set(&self, value: Value) {
        *self.0.write() = value;
    }

    /// Mutate the wrapped value in place
    pub fn update<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        f(&mut self.0.write())
    }

    /// Stable identity of the allocation
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &SharedValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SharedValue {
    // Never recurse: the wrapped graph may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shared(@{:x})", self.id())
    }
}

/// Errors raised when coercing a [`Value`] to strict JSON
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JsonError {
    #[error("Converting circular structure to JSON")]
    Circular,

    #[error("Do not know how to serialize a BigInt")]
    BigInt,
}

/// Host-side representation of a guest value
#[derive(Debug, Clone)]
pub enum Value {
    /// Present-but-empty (`undefined` on the guest side)
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    /// Arbitrary-precision integer, kept distinct from `Number`
    BigInt(BigInt),
    String(String),
    /// Array elements, `Undefined` holes included
    Array(Vec<Value>),
    /// Object members in insertion order
    Object(Vec<(String, Value)>),
    /// ISO-8601 rendering of a date
    Date(String),
    Unserializable(UnserializableKind),
    Shared(SharedValue),
}

impl Value {
    /// Build an object from key/value pairs
    pub fn object<K, I>(members: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(members.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(items.into_iter().collect())
    }

    /// Wrap a value in a fresh shared allocation
    pub fn shared(value: Value) -> Self {
        Value::Shared(SharedValue::new(value))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Whether an optional value has nothing to put on the wire
    pub fn is_absent(value: &Option<Value>) -> bool {
        value.as_ref().map_or(true, Value::is_undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Shared(shared) => shared.read().as_bool(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Shared(shared) => shared.read().as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Date(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<&BigInt> {
        match self {
            Value::BigInt(n) => Some(n),
            _ => None,
        }
    }

    /// Look up an object member, following a shared wrapper
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(members) => members
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.clone()),
            Value::Shared(shared) => shared.read().get(key),
            _ => None,
        }
    }

    /// Look up an array element, following a shared wrapper
    pub fn index(&self, idx: usize) -> Option<Value> {
        match self {
            Value::Array(items) => items.get(idx).cloned(),
            Value::Shared(shared) => shared.read().index(idx),
            _ => None,
        }
    }

    /// Strip one level of shared wrapping
    pub fn resolve(&self) -> Value {
        match self {
            Value::Shared(shared) => shared.read().resolve(),
            other => other.clone(),
        }
    }

    /// Guest-facing name of the value's type, as `typeof` would report it
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::String(_) | Value::Date(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Unserializable(kind) => kind.as_str(),
            Value::Shared(shared) => shared.read().type_name(),
        }
    }

    /// Convert from JSON
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(members) => Value::Object(
                members
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Coerce to strict JSON, the way a `JSON.stringify` round-trip would
    ///
    /// Members that JSON cannot carry (`undefined`, functions, symbols) are
    /// dropped from objects and become `null` inside arrays. Cycles and
    /// bigints are errors.
    pub fn to_json(&self) -> Result<serde_json::Value, JsonError> {
        let mut stack = Vec::new();
        Ok(self
            .to_json_inner(&mut stack)?
            .unwrap_or(serde_json::Value::Null))
    }

    fn to_json_inner(
        &self,
        stack: &mut Vec<usize>,
    ) -> Result<Option<serde_json::Value>, JsonError> {
        Ok(Some(match self {
            Value::Undefined | Value::Unserializable(_) => return Ok(None),
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::BigInt(_) => return Err(JsonError::BigInt),
            Value::String(s) | Value::Date(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.to_json_inner(stack)?.unwrap_or(serde_json::Value::Null));
                }
                serde_json::Value::Array(out)
            }
            Value::Object(members) => {
                let mut out = serde_json::Map::new();
                for (key, value) in members {
                    if let Some(json) = value.to_json_inner(stack)? {
                        out.insert(key.clone(), json);
                    }
                }
                serde_json::Value::Object(out)
            }
            Value::Shared(shared) => {
                let id = shared.id();
                if stack.contains(&id) {
                    return Err(JsonError::Circular);
                }
                stack.push(id);
                let inner = shared.read().to_json_inner(stack);
                stack.pop();
                return inner;
            }
        }))
    }

    /// Total, lossy JSON rendering used for logs and serialization
    ///
    /// Cycles render as [`CIRCULAR_SENTINEL`], bigints as decimal strings and
    /// unserializable values as their tagged placeholder. As with
    /// `JSON.stringify`, `undefined` members are left out of objects and
    /// become `null` elsewhere.
    pub fn to_json_lossy(&self) -> serde_json::Value {
        let mut stack = Vec::new();
        self.to_json_lossy_inner(&mut stack)
    }

    fn to_json_lossy_inner(&self, stack: &mut Vec<usize>) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::BigInt(n) => serde_json::Value::String(n.to_string()),
            Value::String(s) | Value::Date(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| item.to_json_lossy_inner(stack))
                    .collect(),
            ),
            Value::Object(members) => serde_json::Value::Object(
                members
                    .iter()
                    .filter(|(_, v)| !v.is_undefined())
                    .map(|(k, v)| (k.clone(), v.to_json_lossy_inner(stack)))
                    .collect(),
            ),
            Value::Unserializable(kind) => {
                let mut placeholder = serde_json::Map::new();
                placeholder.insert(UNSERIALIZABLE_TAG.to_string(), kind.as_str().into());
                serde_json::Value::Object(placeholder)
            }
            Value::Shared(shared) => {
                let id = shared.id();
                if stack.contains(&id) {
                    return serde_json::Value::String(CIRCULAR_SENTINEL.to_string());
                }
                stack.push(id);
                let json = shared.read().to_json_lossy_inner(stack);
                stack.pop();
                json
            }
        }
    }

    fn eq_inner(&self, other: &Value, seen: &mut Vec<(usize, usize)>) -> bool {
        match (self, other) {
            (Value::Shared(a), Value::Shared(b)) => {
                if a.ptr_eq(b) {
                    return true;
                }
                let pair = (a.id(), b.id());
                if seen.contains(&pair) {
                    return true;
                }
                seen.push(pair);
                let equal = a.read().eq_inner(&b.read(), seen);
                seen.pop();
                equal
            }
            (Value::Shared(a), b) => a.read().eq_inner(b, seen),
            (a, Value::Shared(b)) => a.eq_inner(&b.read(), seen),
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::String(a), Value::String(b)) | (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Unserializable(a), Value::Unserializable(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_inner(y, seen))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.eq_inner(vb, seen))
            }
            _ => false,
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl PartialEq for Value {
    /// Structural equality; shared cycles compare equal coinductively
    fn eq(&self, other: &Value) -> bool {
        let mut seen = Vec::new();
        self.eq_inner(other, &mut seen)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json_lossy().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::String(s) => f.write_str(s),
            Value::BigInt(n) => write!(f, "{}n", n),
            other => write!(f, "{}", other.to_json_lossy()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<BigInt> for Value {
    fn from(n: BigInt) -> Self {
        Value::BigInt(n)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip_keeps_integers() {
        let value = Value::from_json(json!({"a": 1, "b": [true, null, "x"], "c": 1.5}));
        assert_eq!(value.to_json().unwrap(), json!({"a": 1, "b": [true, null, "x"], "c": 1.5}));
    }

    #[test]
    fn test_to_json_drops_absent_members() {
        let value = Value::object([
            ("a", Value::Undefined),
            ("b", Value::Unserializable(UnserializableKind::Function)),
            ("c", Value::array([Value::Undefined, Value::from(1)])),
        ]);
        assert_eq!(value.to_json().unwrap(), json!({"c": [null, 1]}));
    }

    #[test]
    fn test_to_json_rejects_cycles_and_bigints() {
        let node = SharedValue::new(Value::object([("a", Value::from(1))]));
        node.update(|v| {
            if let Value::Object(members) = v {
                members.push(("self".into(), Value::Shared(node.clone())));
            }
        });
        assert_eq!(Value::Shared(node).to_json(), Err(JsonError::Circular));

        let big = Value::BigInt("9007199254740993".parse().unwrap());
        assert_eq!(big.to_json(), Err(JsonError::BigInt));
    }

    #[test]
    fn test_shared_reference_is_not_a_cycle() {
        let shared = Value::shared(Value::object([("n", Value::from(1))]));
        let value = Value::object([("x", shared.clone()), ("y", shared)]);
        assert_eq!(value.to_json().unwrap(), json!({"x": {"n": 1}, "y": {"n": 1}}));
    }

    #[test]
    fn test_lossy_rendering_marks_cycles() {
        let a = SharedValue::new(Value::Null);
        let b = SharedValue::new(Value::object([("ref", Value::Shared(a.clone()))]));
        a.set(Value::object([("ref", Value::Shared(b.clone()))]));

        let rendered = Value::Shared(a).to_json_lossy();
        assert_eq!(rendered, json!({"ref": {"ref": "[Circular]"}}));
    }

    #[test]
    fn test_serialization_leaves_out_undefined_members() {
        let value = Value::object([
            ("gap", Value::Undefined),
            ("kept", Value::Null),
            ("list", Value::array([Value::Undefined, Value::from(1)])),
        ]);
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            json!({"kept": null, "list": [null, 1]})
        );
    }

    #[test]
    fn test_cyclic_values_compare_without_overflow() {
        let a = SharedValue::new(Value::Null);
        a.set(Value::object([("me", Value::Shared(a.clone()))]));
        let b = SharedValue::new(Value::Null);
        b.set(Value::object([("me", Value::Shared(b.clone()))]));
        assert_eq!(Value::Shared(a), Value::Shared(b));
    }

    #[test]
    fn test_get_follows_shared() {
        let value = Value::shared(Value::object([("k", Value::from("v"))]));
        assert_eq!(value.get("k"), Some(Value::from("v")));
        assert_eq!(value.get("missing"), None);
    }
}
