use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Canonical, order-insensitive key derived from a [`Pattern`] value.
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PatternKey(Arc<str>);

impl PatternKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PatternKey({})", self.0)
    }
}

impl fmt::Display for PatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PatternKey {
    fn from(key: &str) -> Self {
        Self(Arc::from(key))
    }
}

/// The address of a request or event.
///
/// A pattern is any structural value: a plain string (`"notify"`), a number, or an
/// object/tuple (`{"cmd": "sum"}`). Two patterns are equal when their canonical keys
/// are equal, so `{"a": 1, "b": 2}` and `{"b": 2, "a": 1}` address the same handler.
///
/// On the wire the original value is sent; the receiver recomputes the key.
#[derive(Clone)]
pub struct Pattern {
    value: Value,
    key: PatternKey,
}

impl Pattern {
    pub fn new(value: impl Into<Value>) -> Self {
        let value = value.into();
        let key = PatternKey(Arc::from(canonicalize(&value)));
        Self { value, key }
    }

    pub fn key(&self) -> &PatternKey {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Pattern {}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({})", self.key)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key, f)
    }
}

impl From<&str> for Pattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

impl From<String> for Pattern {
    fn from(pattern: String) -> Self {
        Self::new(pattern)
    }
}

impl From<Value> for Pattern {
    fn from(pattern: Value) -> Self {
        Self::new(pattern)
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::new)
    }
}

/// Compute the canonical key for a pattern value.
///
/// Strings are their own key. Everything else is rendered as compact JSON with object
/// keys sorted at every depth; array order is significant.
pub fn canonicalize(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => {
            let mut out = String::new();
            write_canonical(other, &mut out);
            out
        }
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Number(number) => match number.as_f64() {
            // Whole floats render like integers, so `1.0` and `1` share a key.
            Some(f) if number.is_f64() && f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER => {
                out.push_str(&(f as i64).to_string());
            }
            _ => out.push_str(&number.to_string()),
        },
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Largest float that still maps to exactly one integer.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_pattern_is_its_own_key() {
        assert_eq!(Pattern::from("notify").key().as_str(), "notify");
    }

    #[test]
    fn test_object_key_is_order_insensitive() {
        let a = Pattern::new(json!({ "a": 1, "b": 2 }));
        let b = Pattern::new(json!({ "b": 2, "a": 1 }));
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().as_str(), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn test_nested_objects_are_sorted() {
        let a = Pattern::new(json!({ "svc": { "z": true, "m": [1, 2] }, "cmd": "sum" }));
        assert_eq!(a.key().as_str(), r#"{"cmd":"sum","svc":{"m":[1,2],"z":true}}"#);
    }

    #[test]
    fn test_whole_floats_match_integers() {
        let float = Pattern::new(json!({ "id": 1.0, "page": -0.0 }));
        let int = Pattern::new(json!({ "id": 1, "page": 0 }));
        assert_eq!(float.key(), int.key());
        assert_eq!(float.key().as_str(), r#"{"id":1,"page":0}"#);

        let fraction = Pattern::new(json!({ "id": 1.5 }));
        assert_eq!(fraction.key().as_str(), r#"{"id":1.5}"#);
    }

    #[test]
    fn test_tuple_order_matters() {
        let a = Pattern::new(json!(["user", "create"]));
        let b = Pattern::new(json!(["create", "user"]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_string_and_quoted_object_differ() {
        let plain = Pattern::from("sum");
        let wrapped = Pattern::new(json!({ "cmd": "sum" }));
        assert_ne!(plain.key(), wrapped.key());
    }

    #[test]
    fn test_wire_form_keeps_original_value() {
        let pattern = Pattern::new(json!({ "b": 2, "a": 1 }));
        let text = serde_json::to_string(&pattern).unwrap();
        let back: Pattern = serde_json::from_str(&text).unwrap();
        assert_eq!(back.value(), pattern.value());
        assert_eq!(back, pattern);
    }
}
