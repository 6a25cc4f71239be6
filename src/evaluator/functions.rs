//! User-defined functions: loading `function` blocks, static validation of
//! their references, and invocation through the built-in `invoke`.
//!
//! Functions may call each other, including recursively; a shared depth
//! counter bounds the call stack.

use std::cell::Cell;

use hcl::expr::Expression;
use indexmap::IndexMap;

use crate::errors::{Diagnostic, Diagnostics};
use crate::schema::{
    self, Content, ATTR_BODY, ATTR_DEFAULT, ATTR_DESCRIPTION, BLOCK_ARG, BLOCK_FUNCTION,
};

use super::expr;
use super::locals;
use super::scope::{Environment, RESERVED_ARG};
use super::value::Value;

const MAX_DEPTH: usize = 100;

/// True if the string is a valid identifier: a letter or underscore
/// followed by letters, digits, underscores, or dashes.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// An argument declared by a user function.
#[derive(Debug, Clone)]
pub struct Arg {
    pub name: String,
    pub description: Option<String>,
    pub default: Option<Value>,
}

/// A user-defined function.
#[derive(Debug, Clone)]
pub struct UserFunction {
    pub name: String,
    pub description: Option<String>,
    pub args: IndexMap<String, Arg>,
    body: Expression,
    content: Content,
}

/// The set of user functions loaded from the source, with the shared
/// invocation depth counter.
#[derive(Debug, Default)]
pub struct FunctionSet {
    functions: IndexMap<String, UserFunction>,
    depth: Cell<usize>,
}

impl FunctionSet {
    /// Name of the built-in that calls user functions.
    pub const INVOKE: &'static str = "invoke";

    /// A set with no user functions.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&UserFunction> {
        self.functions.get(name)
    }

    /// Load all top-level `function` blocks from the supplied content and
    /// statically validate them: identifier rules, constant descriptions
    /// and defaults, duplicate names, and every `invoke` reference in
    /// bodies and locals.
    pub fn load(content: &Content) -> Result<Self, Diagnostics> {
        let mut functions = IndexMap::new();
        for block in content.blocks_of(BLOCK_FUNCTION) {
            let function = load_function(block)?;
            if functions.contains_key(&function.name) {
                return Err(Diagnostic::error("duplicate function declaration")
                    .with_detail(function.name)
                    .into());
            }
            functions.insert(function.name.clone(), function);
        }
        let set = Self {
            functions,
            depth: Cell::new(0),
        };
        set.validate()?;
        Ok(set)
    }

    /// Run every function against a dummy environment: args bound to their
    /// default (or unknown), locals processed, every `invoke` call checked.
    /// This catches typos before any request is evaluated.
    fn validate(&self) -> Result<(), Diagnostics> {
        for function in self.functions.values() {
            let mut bindings = IndexMap::new();
            for arg in function.args.values() {
                bindings.insert(
                    arg.name.clone(),
                    arg.default.clone().unwrap_or_else(Value::unknown),
                );
            }
            bindings.insert(RESERVED_ARG.to_string(), Value::Object(bindings.clone()));
            let env = Environment::with_bindings(bindings);
            locals::process(&env, &function.content, self)?;

            let mut diags = self.check_invoke_calls(&function.body);
            for (_, local_expr) in locals::expressions(&function.content)? {
                diags.extend(self.check_invoke_calls(&local_expr));
            }
            if diags.has_errors() {
                return Err(diags);
            }
        }
        Ok(())
    }

    /// Statically check every `invoke` call in the expression: two
    /// arguments, a string-literal function name, and a target that exists.
    pub fn check_invoke_calls(&self, expression: &Expression) -> Diagnostics {
        let mut diags = Diagnostics::new();
        expr::walk_func_calls(expression, &mut |call| {
            if call.name.to_string() != Self::INVOKE {
                return;
            }
            if call.args.len() != 2 {
                diags.push(Diagnostic::error(format!(
                    "invoke expects 2 arguments, got {}",
                    call.args.len()
                )));
                return;
            }
            match &call.args[0] {
                Expression::String(name) => {
                    if !self.functions.contains_key(name.as_str()) {
                        diags.push(Diagnostic::error(format!(
                            "user function {:?} not found",
                            name
                        )));
                    }
                }
                other => diags.push(
                    Diagnostic::error("first argument to invoke must be a string literal")
                        .with_subject(expr::render(other)),
                ),
            }
        });
        diags
    }

    /// Invoke a user function with the supplied arguments. The returned
    /// value may be incomplete; structural problems with the call are
    /// errors.
    pub fn invoke(
        &self,
        name: &str,
        params: IndexMap<String, Value>,
    ) -> Result<Value, Diagnostics> {
        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        let result = if depth >= MAX_DEPTH {
            Err(Diagnostics::single_error(format!(
                "user function calls: max depth {} exceeded",
                MAX_DEPTH
            )))
        } else {
            self.call(name, params)
        };
        self.depth.set(self.depth.get() - 1);
        result
    }

    fn call(&self, name: &str, params: IndexMap<String, Value>) -> Result<Value, Diagnostics> {
        let function = self.functions.get(name).ok_or_else(|| {
            Diagnostics::single_error(format!("user function {:?} not found", name))
        })?;

        for param in params.keys() {
            if !function.args.contains_key(param) {
                return Err(Diagnostics::single_error(format!(
                    "function: {}, invalid argument {:?}",
                    name, param
                )));
            }
        }
        let mut bindings = IndexMap::new();
        for arg in function.args.values() {
            let value = match params.get(&arg.name) {
                Some(value) => value.clone(),
                None => match &arg.default {
                    Some(default) => default.clone(),
                    None => {
                        return Err(Diagnostics::single_error(format!(
                            "function: {}, argument {:?} expected but not supplied",
                            name, arg.name
                        )));
                    }
                },
            };
            bindings.insert(arg.name.clone(), value);
        }
        bindings.insert(RESERVED_ARG.to_string(), Value::Object(bindings.clone()));

        let env = Environment::with_bindings(bindings);
        let (env, _) = locals::process(&env, &function.content, self)?;

        let (value, diags) = expr::evaluate(&function.body, &env, self);
        if diags.has_errors() {
            return Err(diags);
        }
        Ok(value)
    }
}

fn load_function(block: &hcl::Block) -> Result<UserFunction, Diagnostics> {
    let name = schema::block_label(block).unwrap_or_default().to_string();
    if !is_identifier(&name) {
        return Err(Diagnostics::single_error(format!(
            "function {:?}: name must be an identifier",
            name
        )));
    }

    let content = schema::content_of(&block.body, &schema::FUNCTION)?;
    let description = constant_description(&content, &format!("function {}", name))?;

    let mut args = IndexMap::new();
    for arg_block in content.blocks_of(BLOCK_ARG) {
        let arg = load_arg(&name, arg_block)?;
        if args.contains_key(&arg.name) {
            return Err(Diagnostic::error(format!(
                "function {}: duplicate definition of argument",
                name
            ))
            .with_detail(arg.name)
            .into());
        }
        args.insert(arg.name.clone(), arg);
    }

    let body = content
        .attr(ATTR_BODY)
        .expect("schema guarantees a body attribute")
        .clone();

    Ok(UserFunction {
        name,
        description,
        args,
        body,
        content,
    })
}

fn load_arg(function: &str, block: &hcl::Block) -> Result<Arg, Diagnostics> {
    let name = schema::block_label(block).unwrap_or_default().to_string();
    if !is_identifier(&name) {
        return Err(Diagnostics::single_error(format!(
            "function {:?}, arg {:?}: name must be an identifier",
            function, name
        )));
    }

    let content = schema::content_of(&block.body, &schema::ARG)?;
    let description =
        constant_description(&content, &format!("function {:?}, arg {:?}", function, name))?;

    let default = match content.attr(ATTR_DEFAULT) {
        Some(default_expr) => {
            let (value, diags) =
                expr::evaluate(default_expr, &Environment::new(), &FunctionSet::empty());
            if diags.has_errors() || !value.is_wholly_known() {
                return Err(Diagnostics::single_error(format!(
                    "function {:?}, arg {:?}: default is not a constant",
                    function, name
                )));
            }
            Some(value)
        }
        None => None,
    };

    Ok(Arg {
        name,
        description,
        default,
    })
}

/// Evaluate an optional `description` attribute, requiring a constant
/// string.
fn constant_description(content: &Content, owner: &str) -> Result<Option<String>, Diagnostics> {
    let Some(description_expr) = content.attr(ATTR_DESCRIPTION) else {
        return Ok(None);
    };
    let (value, diags) =
        expr::evaluate(description_expr, &Environment::new(), &FunctionSet::empty());
    match value {
        Value::String(s) if !diags.has_errors() => Ok(Some(s)),
        _ => Err(Diagnostics::single_error(format!(
            "{}: description is not a constant string",
            owner
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{content_of, TOP_LEVEL};

    fn load_src(src: &str) -> Result<FunctionSet, Diagnostics> {
        let body = hcl::parse(src).expect("source must parse");
        let content = content_of(&body, &TOP_LEVEL).expect("content must match schema");
        FunctionSet::load(&content)
    }

    fn eval_str(src: &str, functions: &FunctionSet) -> (Value, Diagnostics) {
        let body = hcl::parse(&format!("x = {}", src)).expect("source must parse");
        let attr = body.into_attributes().next().unwrap();
        expr::evaluate(&attr.expr, &Environment::new(), functions)
    }

    const SCALE_AND_ADD: &str = r#"
        function scale {
          description = "scales a number"
          arg n {
            description = "input"
          }
          arg m {
            default = 2
          }
          body = m * n
        }

        function add1 {
          arg n {}
          locals {
            incremented = n + 1
          }
          body = incremented
        }
    "#;

    #[test]
    fn test_load_and_invoke() {
        let functions = load_src(SCALE_AND_ADD).unwrap();
        let (value, diags) = eval_str(r#"invoke("scale", { n = 10 })"#, &functions);
        assert!(!diags.has_errors(), "unexpected: {}", diags);
        assert_eq!(value, Value::Int(20));

        let (value, _) = eval_str(r#"invoke("scale", { n = 10, m = 3 })"#, &functions);
        assert_eq!(value, Value::Int(30));

        let (value, _) = eval_str(r#"invoke("add1", { n = 1 })"#, &functions);
        assert_eq!(value, Value::Int(2));
    }

    #[test]
    fn test_functions_calling_functions_in_locals() {
        let functions = load_src(&format!(
            "{}{}",
            SCALE_AND_ADD,
            r#"
            function scale_then_add1 {
              arg n {}
              locals {
                scaled = invoke("scale", { n = n })
              }
              body = invoke("add1", { n = scaled })
            }
            "#
        ))
        .unwrap();
        let (value, diags) = eval_str(r#"invoke("scale_then_add1", { n = 100 })"#, &functions);
        assert!(!diags.has_errors(), "unexpected: {}", diags);
        assert_eq!(value, Value::Int(201));
    }

    #[test]
    fn test_recursion_and_depth_bound() {
        let functions = load_src(
            r#"
            function factorial {
              arg n {}
              body = n < 1 ? 1 : n * invoke("factorial", { n = n - 1 })
            }
            "#,
        )
        .unwrap();

        let (value, diags) = eval_str(r#"invoke("factorial", { n = 5 })"#, &functions);
        assert!(!diags.has_errors(), "unexpected: {}", diags);
        assert_eq!(value, Value::Int(120));

        let (_, diags) = eval_str(r#"invoke("factorial", { n = 101 })"#, &functions);
        assert!(diags.has_errors());
        assert!(diags
            .messages()
            .join(";")
            .contains("max depth 100 exceeded"));
    }

    #[test]
    fn test_invalid_and_missing_args() {
        let functions = load_src(SCALE_AND_ADD).unwrap();

        let (_, diags) = eval_str(r#"invoke("scale", {})"#, &functions);
        assert!(diags
            .messages()
            .join(";")
            .contains(r#"argument "n" expected but not supplied"#));

        let (_, diags) = eval_str(r#"invoke("scale", { n = 1, bogus = 2 })"#, &functions);
        assert!(diags.messages().join(";").contains("invalid argument"));
    }

    #[test]
    fn test_invoke_arity_and_name_type() {
        let functions = load_src(SCALE_AND_ADD).unwrap();

        let (_, diags) = eval_str(r#"invoke("scale")"#, &functions);
        assert!(diags.messages().join(";").contains("2 arguments"));

        let (_, diags) = eval_str(r#"invoke(42, {})"#, &functions);
        assert!(diags.messages().join(";").contains("not a string"));

        let (_, diags) = eval_str(r#"invoke("nope", {})"#, &functions);
        assert!(diags.messages().join(";").contains("not found"));
    }

    #[test]
    fn test_unknown_arg_flows_through() {
        let functions = load_src(SCALE_AND_ADD).unwrap();
        let body = hcl::parse(r#"x = invoke("scale", { n = u })"#).unwrap();
        let attr = body.into_attributes().next().unwrap();
        let mut env = Environment::new();
        env.define("u", Value::unknown());
        let (value, diags) = expr::evaluate(&attr.expr, &env, &functions);
        assert!(!diags.has_errors(), "unexpected: {}", diags);
        assert!(value.is_unknown());
    }

    #[test]
    fn test_load_rejects_duplicate_function() {
        let err = load_src(
            r#"
            function f {
              body = 1
            }
            function f {
              body = 2
            }
            "#,
        )
        .unwrap_err();
        assert!(err.messages().join(";").contains("duplicate function"));
    }

    #[test]
    fn test_load_rejects_duplicate_arg() {
        let err = load_src(
            r#"
            function f {
              arg n {}
              arg n {}
              body = n
            }
            "#,
        )
        .unwrap_err();
        assert!(err.messages().join(";").contains("duplicate definition"));
    }

    #[test]
    fn test_load_rejects_bad_identifiers() {
        let err = load_src(r#"function "not an ident" { body = 1 }"#).unwrap_err();
        assert!(err.messages().join(";").contains("identifier"));
    }

    #[test]
    fn test_load_rejects_non_constant_default() {
        let err = load_src(
            r#"
            function f {
              arg n {
                default = other_var
              }
              body = n
            }
            "#,
        )
        .unwrap_err();
        assert!(err.messages().join(";").contains("not a constant"));
    }

    #[test]
    fn test_load_rejects_non_constant_description() {
        let err = load_src(
            r#"
            function f {
              description = 42
              body = 1
            }
            "#,
        )
        .unwrap_err();
        assert!(err
            .messages()
            .join(";")
            .contains("description is not a constant string"));
    }

    #[test]
    fn test_load_catches_invoke_typos_in_bodies_and_locals() {
        let err = load_src(
            r#"
            function f {
              body = invoke("does_not_exist", {})
            }
            "#,
        )
        .unwrap_err();
        assert!(err.messages().join(";").contains("not found"));

        let err = load_src(
            r#"
            function f {
              locals {
                x = invoke("also_missing", {})
              }
              body = x
            }
            "#,
        )
        .unwrap_err();
        assert!(err.messages().join(";").contains("also_missing"));
    }

    #[test]
    fn test_load_requires_string_literal_invoke_target() {
        let err = load_src(
            r#"
            function f {
              arg n {}
              body = invoke(n, {})
            }
            "#,
        )
        .unwrap_err();
        assert!(err.messages().join(";").contains("string literal"));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("foo"));
        assert!(is_identifier("_foo-bar2"));
        assert!(!is_identifier("2foo"));
        assert!(!is_identifier("has space"));
        assert!(!is_identifier(""));
    }
}
