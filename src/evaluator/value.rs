//! Runtime values for the evaluator.
//!
//! Values are the result of evaluating DSL expressions. Unlike plain JSON
//! values they carry an `Unknown` variant marking content that cannot be
//! determined yet, typically because it refers to observed state that does
//! not exist until a later reconciliation.

use indexmap::IndexMap;
use std::fmt;

/// Best-effort type information attached to an unknown value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeHint {
    #[default]
    Any,
    Bool,
    Number,
    String,
    List,
    Object,
}

/// A runtime value in the DSL.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean
    Bool(bool),
    /// Integer (64-bit signed)
    Int(i64),
    /// Floating point (64-bit)
    Float(f64),
    /// String
    String(String),
    /// Array of values
    Array(Vec<Value>),
    /// Object (ordered map of string keys to values)
    Object(IndexMap<String, Value>),
    /// A value whose content cannot be determined yet
    Unknown(TypeHint),
}

impl Value {
    /// Shorthand for an unknown value with no type information.
    pub fn unknown() -> Self {
        Value::Unknown(TypeHint::Any)
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::Float(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Unknown(_) => "unknown",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Value::Unknown(_))
    }

    /// True if no `Unknown` appears anywhere in the value tree.
    pub fn is_wholly_known(&self) -> bool {
        match self {
            Value::Unknown(_) => false,
            Value::Array(items) => items.iter().all(Value::is_wholly_known),
            Value::Object(map) => map.values().all(Value::is_wholly_known),
            _ => true,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view of the value (int widens to float).
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut IndexMap<String, Value>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Check equality with numeric coercion between int and float.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Float(b)) => (*a as f64) == *b,
            (Value::Float(a), Value::Int(b)) => *a == (*b as f64),
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.equals(w)))
            }
            _ => self == other,
        }
    }

    /// Dotted paths to every unknown leaf in the value, in walk order.
    ///
    /// Attribute steps render as `.name`, index steps as `[i]`, matching how
    /// traversals look in the source.
    pub fn unknown_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_unknown_paths(&mut String::new(), &mut paths);
        paths
    }

    fn collect_unknown_paths(&self, prefix: &mut String, out: &mut Vec<String>) {
        match self {
            Value::Unknown(_) => out.push(prefix.clone()),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    let len = prefix.len();
                    prefix.push_str(&format!("[{}]", i));
                    item.collect_unknown_paths(prefix, out);
                    prefix.truncate(len);
                }
            }
            Value::Object(map) => {
                for (k, v) in map {
                    let len = prefix.len();
                    prefix.push('.');
                    prefix.push_str(k);
                    v.collect_unknown_paths(prefix, out);
                    prefix.truncate(len);
                }
            }
            _ => {}
        }
    }

    /// Convert to a `serde_json::Value`. Unknown leaves map to JSON null;
    /// callers installing values into outputs must gate on
    /// [`Value::is_wholly_known`] first.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Unknown(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::Number(serde_json::Number::from(*n)),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(Value::to_json).collect())
            }
            Value::Object(obj) => {
                let map: serde_json::Map<String, serde_json::Value> =
                    obj.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
                serde_json::Value::Object(map)
            }
        }
    }

    /// Convert a `serde_json::Value` into a DSL value.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(obj) => {
                let mut map = IndexMap::new();
                for (k, v) in obj {
                    map.insert(k.clone(), Value::from_json(v));
                }
                Value::Object(map)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => {
                if n.fract() == 0.0 {
                    write!(f, "{}.0", n)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::String(s) => write!(f, "{}", s),
            Value::Array(arr) => {
                write!(f, "[")?;
                for (i, v) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Object(obj) => {
                write!(f, "{{")?;
                for (i, (k, v)) in obj.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Unknown(_) => write!(f, "(unknown)"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(m: IndexMap<String, Value>) -> Self {
        Value::Object(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(pairs: &[(&str, Value)]) -> Value {
        let mut map = IndexMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        Value::Object(map)
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Null.type_name(), "null");
        assert_eq!(Value::Bool(true).type_name(), "bool");
        assert_eq!(Value::Int(42).type_name(), "number");
        assert_eq!(Value::Float(3.14).type_name(), "number");
        assert_eq!(Value::String("hello".into()).type_name(), "string");
        assert_eq!(Value::Array(vec![]).type_name(), "array");
        assert_eq!(Value::Object(IndexMap::new()).type_name(), "object");
        assert_eq!(Value::unknown().type_name(), "unknown");
    }

    #[test]
    fn test_wholly_known() {
        assert!(Value::Null.is_wholly_known());
        assert!(!Value::unknown().is_wholly_known());
        assert!(!Value::Array(vec![Value::Int(1), Value::unknown()]).is_wholly_known());

        let nested = obj(&[("a", obj(&[("b", Value::unknown())]))]);
        assert!(!nested.is_wholly_known());
        let known = obj(&[("a", obj(&[("b", Value::Int(1))]))]);
        assert!(known.is_wholly_known());
    }

    #[test]
    fn test_unknown_paths() {
        let v = obj(&[
            ("a", Value::unknown()),
            (
                "b",
                Value::Array(vec![Value::Int(1), obj(&[("c", Value::unknown())])]),
            ),
        ]);
        assert_eq!(v.unknown_paths(), vec![".a", ".b[1].c"]);
    }

    #[test]
    fn test_unknown_paths_at_root() {
        assert_eq!(Value::unknown().unknown_paths(), vec![""]);
        assert!(Value::Int(1).unknown_paths().is_empty());
    }

    #[test]
    fn test_number_coercion() {
        assert!(Value::Int(42).equals(&Value::Float(42.0)));
        assert!(Value::Float(42.0).equals(&Value::Int(42)));
        assert!(!Value::Int(42).equals(&Value::Float(42.1)));
    }

    #[test]
    fn test_deep_equals() {
        let a = obj(&[("x", Value::Array(vec![Value::Int(1)]))]);
        let b = obj(&[("x", Value::Array(vec![Value::Float(1.0)]))]);
        assert!(a.equals(&b));
    }

    #[test]
    fn test_json_round_trip() {
        let json: serde_json::Value = serde_json::json!({
            "name": "web",
            "replicas": 3,
            "labels": {"app": "web"},
            "ports": [80, 443],
        });
        let v = Value::from_json(&json);
        assert_eq!(v.to_json(), json);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Value::Null), "null");
        assert_eq!(format!("{}", Value::Int(42)), "42");
        assert_eq!(format!("{}", Value::unknown()), "(unknown)");
    }
}
