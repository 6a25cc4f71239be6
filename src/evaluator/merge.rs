//! Unification: deep merge with conflict detection.
//!
//! Used at response time to combine the statuses, contexts, and connection
//! maps produced by many blocks into one. Two inputs may set the same key
//! only if the values are deeply equal or both are objects (which are then
//! merged recursively); anything else is a conflict reported with the
//! dotted path where it occurred.

use indexmap::map::Entry;
use indexmap::IndexMap;
use thiserror::Error;

use super::value::Value;

/// A conflict found while unifying.
#[derive(Debug, Error, PartialEq)]
pub enum UnifyError {
    #[error("type mismatch for key {path}: {left} vs {right}")]
    TypeMismatch {
        path: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("values for key {path} not equal")]
    ValueConflict { path: String },

    #[error("input is not an object, got {found}")]
    NotAnObject { found: &'static str },
}

/// Unify object values into one object.
pub fn unify(inputs: &[Value]) -> Result<Value, UnifyError> {
    let mut out: IndexMap<String, Value> = IndexMap::new();
    for input in inputs {
        let map = input.as_object().ok_or(UnifyError::NotAnObject {
            found: input.type_name(),
        })?;
        unify_into(&mut out, map, "")?;
    }
    Ok(Value::Object(out))
}

fn unify_into(
    out: &mut IndexMap<String, Value>,
    input: &IndexMap<String, Value>,
    path: &str,
) -> Result<(), UnifyError> {
    for (key, value) in input {
        let current_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", path, key)
        };

        let existing = match out.entry(key.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(value.clone());
                continue;
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };

        if existing.type_name() != value.type_name() {
            return Err(UnifyError::TypeMismatch {
                path: current_path,
                left: value.type_name(),
                right: existing.type_name(),
            });
        }

        if let Value::Object(value_map) = value {
            if let Value::Object(existing_map) = existing {
                unify_into(existing_map, value_map, &current_path)?;
                continue;
            }
        }

        if !existing.equals(value) {
            return Err(UnifyError::ValueConflict { path: current_path });
        }
    }
    Ok(())
}

/// Unify byte maps (connection details) into one map. Same-key values must
/// be byte-equal.
pub fn unify_bytes(
    inputs: &[IndexMap<String, Vec<u8>>],
) -> Result<IndexMap<String, Vec<u8>>, UnifyError> {
    let mut out: IndexMap<String, Vec<u8>> = IndexMap::new();
    for input in inputs {
        for (key, value) in input {
            match out.entry(key.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(value.clone());
                }
                Entry::Occupied(entry) => {
                    if entry.get() != value {
                        return Err(UnifyError::ValueConflict { path: key.clone() });
                    }
                }
            }
        }
    }
    Ok(out)
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
    fn test_disjoint_keys_merge() {
        let a = obj(&[("x", Value::Int(1))]);
        let b = obj(&[("y", Value::Int(2))]);
        let merged = unify(&[a, b]).unwrap();
        let map = merged.as_object().unwrap();
        assert_eq!(map.get("x"), Some(&Value::Int(1)));
        assert_eq!(map.get("y"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_nested_objects_merge_recursively() {
        let a = obj(&[("foo", obj(&[("bar", obj(&[("x", Value::Int(10))]))]))]);
        let b = obj(&[("foo", obj(&[("bar", obj(&[("y", Value::Int(12))]))]))]);
        let merged = unify(&[a, b]).unwrap();
        let expected = obj(&[(
            "foo",
            obj(&[(
                "bar",
                obj(&[("x", Value::Int(10)), ("y", Value::Int(12))]),
            )]),
        )]);
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_equal_scalars_are_compatible() {
        let a = obj(&[("x", Value::Int(1))]);
        let b = obj(&[("x", Value::Float(1.0))]);
        assert!(unify(&[a, b]).is_ok());
    }

    #[test]
    fn test_unequal_scalars_conflict_with_path() {
        let a = obj(&[("a", obj(&[("b", obj(&[("c", Value::Int(1))]))]))]);
        let b = obj(&[("a", obj(&[("b", obj(&[("c", Value::Int(2))]))]))]);
        let err = unify(&[a, b]).unwrap_err();
        assert_eq!(
            err,
            UnifyError::ValueConflict {
                path: "a.b.c".into()
            }
        );
    }

    #[test]
    fn test_type_mismatch_conflicts_with_path() {
        let a = obj(&[("x", Value::Int(1))]);
        let b = obj(&[("x", Value::String("1".into()))]);
        let err = unify(&[a, b]).unwrap_err();
        assert!(matches!(err, UnifyError::TypeMismatch { path, .. } if path == "x"));
    }

    #[test]
    fn test_null_vs_object_is_a_conflict() {
        let a = obj(&[("x", Value::Null)]);
        let b = obj(&[("x", obj(&[("y", Value::Int(1))]))]);
        assert!(matches!(
            unify(&[a, b]),
            Err(UnifyError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_arrays_must_be_deep_equal() {
        let a = obj(&[("x", Value::Array(vec![Value::Int(1)]))]);
        let b = obj(&[("x", Value::Array(vec![Value::Int(1)]))]);
        assert!(unify(&[a.clone(), b]).is_ok());

        let c = obj(&[("x", Value::Array(vec![Value::Int(2)]))]);
        assert!(matches!(
            unify(&[a, c]),
            Err(UnifyError::ValueConflict { .. })
        ));
    }

    #[test]
    fn test_non_object_input_rejected() {
        assert!(matches!(
            unify(&[Value::Int(1)]),
            Err(UnifyError::NotAnObject { .. })
        ));
    }

    #[test]
    fn test_unify_bytes() {
        let mut a = IndexMap::new();
        a.insert("user".to_string(), b"admin".to_vec());
        let mut b = IndexMap::new();
        b.insert("user".to_string(), b"admin".to_vec());
        b.insert("pass".to_string(), b"secret".to_vec());
        let merged = unify_bytes(&[a.clone(), b]).unwrap();
        assert_eq!(merged.len(), 2);

        let mut c = IndexMap::new();
        c.insert("user".to_string(), b"other".to_vec());
        assert!(matches!(
            unify_bytes(&[a, c]),
            Err(UnifyError::ValueConflict { path }) if path == "user"
        ));
    }
}
