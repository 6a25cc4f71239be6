//! Built-in functions available to all expressions.
//!
//! The set is intentionally small and strictly pure: no randomness, no file
//! access, no clock. Every function propagates unknown arguments by
//! returning an unknown result, so incomplete observed state flows through
//! call sites the same way it flows through operators.

use base64::Engine;
use indexmap::IndexMap;

use crate::errors::Diagnostic;

use super::value::Value;

type BuiltinResult = Result<Value, Diagnostic>;

/// Evaluate a built-in function call. `invoke` is not dispatched here; user
/// functions are the function processor's concern.
pub fn call(name: &str, args: &[Value]) -> BuiltinResult {
    if !is_builtin(name) {
        return Err(Diagnostic::error(format!(
            "call to unknown function {:?}",
            name
        )));
    }
    if args.iter().any(Value::is_unknown) {
        return Ok(Value::unknown());
    }
    match name {
        "length" => length(args),
        "range" => range(args),
        "keys" => keys(args),
        "values" => values(args),
        "lookup" => lookup(args),
        "contains" => contains(args),
        "concat" => concat(args),
        "merge" => merge(args),
        "flatten" => flatten(args),
        "join" => join(args),
        "split" => split(args),
        "upper" => upper(args),
        "lower" => lower(args),
        "trim" => trim(args),
        "replace" => replace(args),
        "coalesce" => coalesce(args),
        "tostring" => tostring(args),
        "tonumber" => tonumber(args),
        "jsonencode" => jsonencode(args),
        "jsondecode" => jsondecode(args),
        "base64encode" => base64encode(args),
        "base64decode" => base64decode(args),
        _ => unreachable!("is_builtin and call must list the same names"),
    }
}

/// Check if a name refers to a built-in function. Must list the same names
/// as the match arms in `call`.
pub fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "length"
            | "range"
            | "keys"
            | "values"
            | "lookup"
            | "contains"
            | "concat"
            | "merge"
            | "flatten"
            | "join"
            | "split"
            | "upper"
            | "lower"
            | "trim"
            | "replace"
            | "coalesce"
            | "tostring"
            | "tonumber"
            | "jsonencode"
            | "jsondecode"
            | "base64encode"
            | "base64decode"
    )
}

fn check_arity(name: &str, args: &[Value], expected: usize) -> Result<(), Diagnostic> {
    if args.len() != expected {
        return Err(Diagnostic::error(format!(
            "{} expects {} argument(s), got {}",
            name,
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn type_error(name: &str, expected: &str, found: &Value) -> Diagnostic {
    Diagnostic::error(format!(
        "{}: expected {}, got {}",
        name,
        expected,
        found.type_name()
    ))
}

fn length(args: &[Value]) -> BuiltinResult {
    check_arity("length", args, 1)?;
    match &args[0] {
        Value::Array(items) => Ok(Value::Int(items.len() as i64)),
        Value::Object(map) => Ok(Value::Int(map.len() as i64)),
        Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
        other => Err(type_error("length", "array, object, or string", other)),
    }
}

fn range(args: &[Value]) -> BuiltinResult {
    let (start, end, step) = match args.len() {
        1 => (0, int_arg("range", &args[0])?, 1),
        2 => (int_arg("range", &args[0])?, int_arg("range", &args[1])?, 1),
        3 => (
            int_arg("range", &args[0])?,
            int_arg("range", &args[1])?,
            int_arg("range", &args[2])?,
        ),
        n => {
            return Err(Diagnostic::error(format!(
                "range expects 1 to 3 arguments, got {}",
                n
            )));
        }
    };
    if step == 0 {
        return Err(Diagnostic::error("range step must not be zero"));
    }
    let mut out = Vec::new();
    let mut current = start;
    while (step > 0 && current < end) || (step < 0 && current > end) {
        out.push(Value::Int(current));
        current += step;
    }
    Ok(Value::Array(out))
}

fn int_arg(name: &str, value: &Value) -> Result<i64, Diagnostic> {
    value
        .as_int()
        .ok_or_else(|| type_error(name, "integer", value))
}

fn keys(args: &[Value]) -> BuiltinResult {
    check_arity("keys", args, 1)?;
    match &args[0] {
        Value::Object(map) => Ok(Value::Array(
            map.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        other => Err(type_error("keys", "object", other)),
    }
}

fn values(args: &[Value]) -> BuiltinResult {
    check_arity("values", args, 1)?;
    match &args[0] {
        Value::Object(map) => Ok(Value::Array(map.values().cloned().collect())),
        other => Err(type_error("values", "object", other)),
    }
}

fn lookup(args: &[Value]) -> BuiltinResult {
    if args.len() != 2 && args.len() != 3 {
        return Err(Diagnostic::error(format!(
            "lookup expects 2 or 3 arguments, got {}",
            args.len()
        )));
    }
    let map = match &args[0] {
        Value::Object(map) => map,
        other => return Err(type_error("lookup", "object", other)),
    };
    let key = match &args[1] {
        Value::String(s) => s,
        other => return Err(type_error("lookup", "string key", other)),
    };
    match map.get(key.as_str()) {
        Some(value) => Ok(value.clone()),
        None => match args.get(2) {
            Some(default) => Ok(default.clone()),
            None => Err(Diagnostic::error(format!(
                "lookup: key {:?} not found and no default given",
                key
            ))),
        },
    }
}

fn contains(args: &[Value]) -> BuiltinResult {
    check_arity("contains", args, 2)?;
    match &args[0] {
        Value::Array(items) => Ok(Value::Bool(items.iter().any(|v| v.equals(&args[1])))),
        Value::String(s) => match &args[1] {
            Value::String(sub) => Ok(Value::Bool(s.contains(sub.as_str()))),
            other => Err(type_error("contains", "string", other)),
        },
        Value::Object(map) => match &args[1] {
            Value::String(key) => Ok(Value::Bool(map.contains_key(key.as_str()))),
            other => Err(type_error("contains", "string key", other)),
        },
        other => Err(type_error("contains", "array, string, or object", other)),
    }
}

fn concat(args: &[Value]) -> BuiltinResult {
    let mut out = Vec::new();
    for arg in args {
        match arg {
            Value::Array(items) => out.extend(items.iter().cloned()),
            other => return Err(type_error("concat", "array", other)),
        }
    }
    Ok(Value::Array(out))
}

fn merge(args: &[Value]) -> BuiltinResult {
    let mut out: IndexMap<String, Value> = IndexMap::new();
    for arg in args {
        match arg {
            Value::Object(map) => {
                for (k, v) in map {
                    out.insert(k.clone(), v.clone());
                }
            }
            other => return Err(type_error("merge", "object", other)),
        }
    }
    Ok(Value::Object(out))
}

fn flatten(args: &[Value]) -> BuiltinResult {
    check_arity("flatten", args, 1)?;
    fn flatten_into(value: &Value, out: &mut Vec<Value>) {
        match value {
            Value::Array(items) => {
                for item in items {
                    flatten_into(item, out);
                }
            }
            other => out.push(other.clone()),
        }
    }
    match &args[0] {
        Value::Array(_) => {
            let mut out = Vec::new();
            flatten_into(&args[0], &mut out);
            Ok(Value::Array(out))
        }
        other => Err(type_error("flatten", "array", other)),
    }
}

fn join(args: &[Value]) -> BuiltinResult {
    check_arity("join", args, 2)?;
    let sep = match &args[0] {
        Value::String(s) => s,
        other => return Err(type_error("join", "string separator", other)),
    };
    let items = match &args[1] {
        Value::Array(items) => items,
        other => return Err(type_error("join", "array", other)),
    };
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(s) => parts.push(s.clone()),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => parts.push(item.to_string()),
            other => return Err(type_error("join", "string or number element", other)),
        }
    }
    Ok(Value::String(parts.join(sep)))
}

fn split(args: &[Value]) -> BuiltinResult {
    check_arity("split", args, 2)?;
    match (&args[0], &args[1]) {
        (Value::String(sep), Value::String(s)) => Ok(Value::Array(
            s.split(sep.as_str())
                .map(|part| Value::String(part.to_string()))
                .collect(),
        )),
        _ => Err(type_error("split", "string", &args[0])),
    }
}

fn string_fn(
    name: &str,
    args: &[Value],
    f: impl FnOnce(&str) -> String,
) -> BuiltinResult {
    check_arity(name, args, 1)?;
    match &args[0] {
        Value::String(s) => Ok(Value::String(f(s))),
        other => Err(type_error(name, "string", other)),
    }
}

fn upper(args: &[Value]) -> BuiltinResult {
    string_fn("upper", args, |s| s.to_uppercase())
}

fn lower(args: &[Value]) -> BuiltinResult {
    string_fn("lower", args, |s| s.to_lowercase())
}

fn trim(args: &[Value]) -> BuiltinResult {
    string_fn("trim", args, |s| s.trim().to_string())
}

fn replace(args: &[Value]) -> BuiltinResult {
    check_arity("replace", args, 3)?;
    match (&args[0], &args[1], &args[2]) {
        (Value::String(s), Value::String(from), Value::String(to)) => {
            Ok(Value::String(s.replace(from.as_str(), to)))
        }
        _ => Err(Diagnostic::error("replace expects three strings")),
    }
}

fn coalesce(args: &[Value]) -> BuiltinResult {
    for arg in args {
        if !arg.is_null() {
            return Ok(arg.clone());
        }
    }
    Err(Diagnostic::error("coalesce: all arguments are null"))
}

fn tostring(args: &[Value]) -> BuiltinResult {
    check_arity("tostring", args, 1)?;
    match &args[0] {
        Value::String(_) => Ok(args[0].clone()),
        Value::Int(_) | Value::Float(_) | Value::Bool(_) => {
            Ok(Value::String(args[0].to_string()))
        }
        Value::Null => Ok(Value::Null),
        other => Err(type_error("tostring", "primitive", other)),
    }
}

fn tonumber(args: &[Value]) -> BuiltinResult {
    check_arity("tonumber", args, 1)?;
    match &args[0] {
        Value::Int(_) | Value::Float(_) => Ok(args[0].clone()),
        Value::String(s) => {
            if let Ok(i) = s.parse::<i64>() {
                Ok(Value::Int(i))
            } else if let Ok(f) = s.parse::<f64>() {
                Ok(Value::Float(f))
            } else {
                Err(Diagnostic::error(format!(
                    "tonumber: cannot parse {:?} as a number",
                    s
                )))
            }
        }
        Value::Null => Ok(Value::Null),
        other => Err(type_error("tonumber", "number or numeric string", other)),
    }
}

fn jsonencode(args: &[Value]) -> BuiltinResult {
    check_arity("jsonencode", args, 1)?;
    serde_json::to_string(&args[0].to_json())
        .map(Value::String)
        .map_err(|err| Diagnostic::error(format!("jsonencode: {}", err)))
}

fn jsondecode(args: &[Value]) -> BuiltinResult {
    check_arity("jsondecode", args, 1)?;
    match &args[0] {
        Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
            .map(|json| Value::from_json(&json))
            .map_err(|err| Diagnostic::error(format!("jsondecode: {}", err))),
        other => Err(type_error("jsondecode", "string", other)),
    }
}

fn base64encode(args: &[Value]) -> BuiltinResult {
    check_arity("base64encode", args, 1)?;
    match &args[0] {
        Value::String(s) => Ok(Value::String(
            base64::engine::general_purpose::STANDARD.encode(s.as_bytes()),
        )),
        other => Err(type_error("base64encode", "string", other)),
    }
}

fn base64decode(args: &[Value]) -> BuiltinResult {
    check_arity("base64decode", args, 1)?;
    match &args[0] {
        Value::String(s) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .map_err(|_| Diagnostic::error("base64decode: invalid base64 input"))?;
            String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|_| Diagnostic::error("base64decode: decoded value is not utf-8"))
        }
        other => Err(type_error("base64decode", "string", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_args_propagate() {
        let result = call("length", &[Value::unknown()]).unwrap();
        assert!(result.is_unknown());
        let result = call("join", &[Value::String(",".into()), Value::unknown()]).unwrap();
        assert!(result.is_unknown());
    }

    #[test]
    fn test_unknown_function_name() {
        assert!(call("nope", &[]).is_err());
    }

    #[test]
    fn test_length() {
        assert_eq!(
            call("length", &[Value::Array(vec![Value::Int(1)])]).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            call("length", &[Value::String("abc".into())]).unwrap(),
            Value::Int(3)
        );
        assert!(call("length", &[Value::Int(1)]).is_err());
    }

    #[test]
    fn test_range() {
        assert_eq!(
            call("range", &[Value::Int(3)]).unwrap(),
            Value::Array(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            call("range", &[Value::Int(1), Value::Int(4)]).unwrap(),
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert!(call("range", &[Value::Int(1), Value::Int(4), Value::Int(0)]).is_err());
    }

    #[test]
    fn test_lookup_with_default() {
        let mut map = IndexMap::new();
        map.insert("a".to_string(), Value::Int(1));
        let obj = Value::Object(map);
        assert_eq!(
            call("lookup", &[obj.clone(), Value::String("a".into())]).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            call(
                "lookup",
                &[obj.clone(), Value::String("b".into()), Value::Int(9)]
            )
            .unwrap(),
            Value::Int(9)
        );
        assert!(call("lookup", &[obj, Value::String("b".into())]).is_err());
    }

    #[test]
    fn test_merge_last_wins() {
        let mut a = IndexMap::new();
        a.insert("x".to_string(), Value::Int(1));
        a.insert("y".to_string(), Value::Int(2));
        let mut b = IndexMap::new();
        b.insert("y".to_string(), Value::Int(3));
        let merged = call("merge", &[Value::Object(a), Value::Object(b)]).unwrap();
        let map = merged.as_object().unwrap();
        assert_eq!(map.get("x"), Some(&Value::Int(1)));
        assert_eq!(map.get("y"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_flatten() {
        let nested = Value::Array(vec![
            Value::Int(1),
            Value::Array(vec![Value::Int(2), Value::Array(vec![Value::Int(3)])]),
        ]);
        assert_eq!(
            call("flatten", &[nested]).unwrap(),
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_join_and_split() {
        let items = Value::Array(vec![Value::String("a".into()), Value::Int(1)]);
        assert_eq!(
            call("join", &[Value::String("-".into()), items]).unwrap(),
            Value::String("a-1".into())
        );
        assert_eq!(
            call(
                "split",
                &[Value::String(",".into()), Value::String("a,b".into())]
            )
            .unwrap(),
            Value::Array(vec![Value::String("a".into()), Value::String("b".into())])
        );
    }

    #[test]
    fn test_coalesce() {
        assert_eq!(
            call("coalesce", &[Value::Null, Value::Int(2)]).unwrap(),
            Value::Int(2)
        );
        assert!(call("coalesce", &[Value::Null, Value::Null]).is_err());
    }

    #[test]
    fn test_tonumber() {
        assert_eq!(
            call("tonumber", &[Value::String("42".into())]).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            call("tonumber", &[Value::String("4.5".into())]).unwrap(),
            Value::Float(4.5)
        );
        assert!(call("tonumber", &[Value::String("abc".into())]).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let mut map = IndexMap::new();
        map.insert("a".to_string(), Value::Int(1));
        let encoded = call("jsonencode", &[Value::Object(map.clone())]).unwrap();
        assert_eq!(encoded, Value::String(r#"{"a":1}"#.into()));
        let decoded = call("jsondecode", &[encoded]).unwrap();
        assert_eq!(decoded, Value::Object(map));
    }

    #[test]
    fn test_base64() {
        let encoded = call("base64encode", &[Value::String("hello".into())]).unwrap();
        assert_eq!(encoded, Value::String("aGVsbG8=".into()));
        let decoded = call("base64decode", &[encoded]).unwrap();
        assert_eq!(decoded, Value::String("hello".into()));
        assert!(call("base64decode", &[Value::String("!!!".into())]).is_err());
    }
}
