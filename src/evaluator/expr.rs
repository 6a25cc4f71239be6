//! Expression evaluation over the parsed HCL AST.
//!
//! The parser library supplies the AST; this module supplies the semantics
//! the evaluator needs on top of it: evaluation against an [`Environment`]
//! with unknown-value propagation, the free-variable walker, and traversal
//! normalisation.
//!
//! Evaluation is total: it never panics and never stops at the first
//! problem. Failures push a diagnostic and yield [`Value::Unknown`] for the
//! failing subterm, so callers can decide whether to treat the result as a
//! hard error or discard the enclosing block. Diagnostics caused by data
//! that does not have the requested shape yet (missing attribute, missing
//! key, index out of range) are marked incomplete-class; genuine type and
//! invocation errors are not.

use hcl::expr::{
    BinaryOperator, Conditional, Expression, ForExpr, FuncCall, Operation, TemplateExpr,
    Traversal, TraversalOperator, UnaryOperator,
};
use hcl::template::{Directive, Element, Template};
use indexmap::IndexMap;

use crate::errors::{Diagnostic, Diagnostics};

use super::functions::FunctionSet;
use super::scope::Environment;
use super::value::{TypeHint, Value};

/// Re-render an expression as source text, best effort. Used wherever a
/// diagnostic needs to point at a location.
pub fn render(expr: &Expression) -> String {
    hcl::format::to_string(expr).unwrap_or_else(|_| "<expression>".to_string())
}

/// Evaluate an expression against an environment.
pub fn evaluate(expr: &Expression, env: &Environment, functions: &FunctionSet) -> (Value, Diagnostics) {
    let mut cx = EvalCx {
        env,
        functions,
        diags: Diagnostics::new(),
    };
    let value = cx.eval(expr);
    (value, cx.diags)
}

struct EvalCx<'a> {
    env: &'a Environment,
    functions: &'a FunctionSet,
    diags: Diagnostics,
}

impl<'a> EvalCx<'a> {
    /// A fresh context over a child environment, e.g. one iteration of a
    /// for expression. Diagnostics are collected separately and folded back
    /// by the caller.
    fn scoped<'b>(&self, env: &'b Environment) -> EvalCx<'b>
    where
        'a: 'b,
    {
        EvalCx {
            env,
            functions: self.functions,
            diags: Diagnostics::new(),
        }
    }

    fn error(&mut self, summary: impl Into<String>, subject: &Expression) -> Value {
        self.diags
            .push(Diagnostic::error(summary).with_subject(render(subject)));
        Value::unknown()
    }

    fn incomplete(&mut self, summary: impl Into<String>, subject: String) -> Value {
        self.diags
            .push(Diagnostic::incomplete(summary).with_subject(subject));
        Value::unknown()
    }

    fn eval(&mut self, expr: &Expression) -> Value {
        match expr {
            Expression::Null => Value::Null,
            Expression::Bool(b) => Value::Bool(*b),
            Expression::Number(n) => number_value(n),
            Expression::String(s) => Value::String(s.clone()),
            Expression::Array(items) => Value::Array(items.iter().map(|e| self.eval(e)).collect()),
            Expression::Object(object) => self.eval_object(expr, object),
            Expression::TemplateExpr(template) => self.eval_template_expr(expr, template),
            Expression::Variable(var) => match self.env.get(var.as_str()) {
                Some(value) => value.clone(),
                None => self.error(format!("unknown variable {:?}", var.as_str()), expr),
            },
            Expression::Traversal(traversal) => self.eval_traversal(traversal),
            Expression::FuncCall(call) => self.eval_func_call(expr, call),
            Expression::Parenthesis(inner) => self.eval(inner),
            Expression::Conditional(cond) => self.eval_conditional(cond),
            Expression::Operation(op) => self.eval_operation(expr, op),
            Expression::ForExpr(for_expr) => self.eval_for(expr, for_expr),
            _ => self.error("unsupported expression form", expr),
        }
    }

    fn eval_object(
        &mut self,
        expr: &Expression,
        object: &hcl::Object<hcl::ObjectKey, Expression>,
    ) -> Value {
        let mut map = IndexMap::new();
        for (key, value_expr) in object.iter() {
            let key = match key {
                hcl::ObjectKey::Identifier(ident) => ident.to_string(),
                hcl::ObjectKey::Expression(key_expr) => match self.eval(key_expr) {
                    Value::String(s) => s,
                    Value::Unknown(_) => return Value::Unknown(TypeHint::Object),
                    other => {
                        return self.error(
                            format!("object key is not a string, got {}", other.type_name()),
                            expr,
                        );
                    }
                },
                _ => return self.error("unsupported object key form", expr),
            };
            let value = self.eval(value_expr);
            map.insert(key, value);
        }
        Value::Object(map)
    }

    fn eval_template_expr(&mut self, expr: &Expression, template: &TemplateExpr) -> Value {
        match Template::from_expr(template) {
            Ok(template) => self.eval_template(&template),
            Err(err) => self.error(format!("invalid template: {}", err), expr),
        }
    }

    fn eval_template(&mut self, template: &Template) -> Value {
        let elements = template.elements();

        // a lone interpolation passes its value through without stringifying
        if let [Element::Interpolation(interp)] = elements {
            return self.eval(&interp.expr);
        }

        let mut out = String::new();
        let mut unknown = false;
        for element in elements {
            match element {
                Element::Literal(lit) => out.push_str(lit),
                Element::Interpolation(interp) => {
                    let value = self.eval(&interp.expr);
                    match self.value_to_template_string(&value, &interp.expr) {
                        Some(s) => out.push_str(&s),
                        None => unknown = true,
                    }
                }
                Element::Directive(directive) => {
                    match self.eval_directive(directive) {
                        Some(s) => out.push_str(&s),
                        None => unknown = true,
                    }
                }
            }
        }
        if unknown {
            Value::Unknown(TypeHint::String)
        } else {
            Value::String(out)
        }
    }

    /// Renders a value inside a template. `None` means the value is unknown
    /// and the whole template must become unknown.
    fn value_to_template_string(&mut self, value: &Value, subject: &Expression) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => Some(value.to_string()),
            Value::Unknown(_) => None,
            other => {
                self.error(
                    format!("cannot interpolate value of type {}", other.type_name()),
                    subject,
                );
                None
            }
        }
    }

    fn eval_directive(&mut self, directive: &Directive) -> Option<String> {
        match directive {
            Directive::If(dir) => {
                let cond = self.eval(&dir.cond_expr);
                match cond {
                    Value::Bool(true) => match self.eval_template(&dir.true_template) {
                        Value::String(s) => Some(s),
                        _ => None,
                    },
                    Value::Bool(false) => match &dir.false_template {
                        Some(t) => match self.eval_template(t) {
                            Value::String(s) => Some(s),
                            _ => None,
                        },
                        None => Some(String::new()),
                    },
                    Value::Unknown(_) => None,
                    other => {
                        self.error(
                            format!(
                                "if directive condition is not a bool, got {}",
                                other.type_name()
                            ),
                            &dir.cond_expr,
                        );
                        None
                    }
                }
            }
            Directive::For(dir) => {
                let collection = self.eval(&dir.collection_expr);
                let iterations = match self.iterations_of(&collection, &dir.collection_expr) {
                    Some(iters) => iters,
                    None => return None,
                };
                let mut out = String::new();
                for (key, value) in iterations {
                    let mut bindings = IndexMap::new();
                    if let Some(key_var) = &dir.key_var {
                        bindings.insert(key_var.to_string(), key);
                    }
                    bindings.insert(dir.value_var.to_string(), value);
                    let env = self.env.child_with(bindings);
                    let mut inner = self.scoped(&env);
                    let rendered = inner.eval_template(&dir.template);
                    self.diags.extend(inner.diags);
                    match rendered {
                        Value::String(s) => out.push_str(&s),
                        _ => return None,
                    }
                }
                Some(out)
            }
        }
    }

    fn eval_traversal(&mut self, traversal: &Traversal) -> Value {
        let text = render(&Expression::Traversal(Box::new(traversal.clone())));
        let mut current = self.eval(&traversal.expr);
        let operators = &traversal.operators;

        for (i, op) in operators.iter().enumerate() {
            match op {
                TraversalOperator::GetAttr(name) => {
                    current = self.step_attr(current, name.as_str(), &text);
                }
                TraversalOperator::Index(index_expr) => {
                    let index = self.eval(index_expr);
                    current = self.step_index(current, &index, &text);
                }
                TraversalOperator::LegacyIndex(n) => {
                    current = self.step_index(current, &Value::Int(*n as i64), &text);
                }
                TraversalOperator::AttrSplat | TraversalOperator::FullSplat => {
                    return self.eval_splat(current, &operators[i + 1..], &text);
                }
            }
        }
        current
    }

    fn step_attr(&mut self, base: Value, name: &str, text: &str) -> Value {
        match base {
            Value::Object(map) => match map.get(name) {
                Some(value) => value.clone(),
                None => self.incomplete(
                    format!("object has no attribute {:?}", name),
                    text.to_string(),
                ),
            },
            Value::Unknown(_) => Value::unknown(),
            Value::Null => self.incomplete(
                format!("attempt to get attribute {:?} from null value", name),
                text.to_string(),
            ),
            other => self.error_text(
                format!(
                    "cannot access attribute {:?} on value of type {}",
                    name,
                    other.type_name()
                ),
                text,
            ),
        }
    }

    fn step_index(&mut self, base: Value, index: &Value, text: &str) -> Value {
        match (&base, index) {
            (Value::Unknown(_), _) | (_, Value::Unknown(_)) => Value::unknown(),
            (Value::Array(items), Value::Int(i)) => {
                let idx = *i;
                if idx >= 0 && (idx as usize) < items.len() {
                    items[idx as usize].clone()
                } else {
                    self.incomplete(
                        format!("index {} out of range for list of length {}", idx, items.len()),
                        text.to_string(),
                    )
                }
            }
            (Value::Object(map), Value::String(key)) => match map.get(key.as_str()) {
                Some(value) => value.clone(),
                None => {
                    self.incomplete(format!("object has no attribute {:?}", key), text.to_string())
                }
            },
            (Value::Null, _) => {
                self.incomplete("attempt to index a null value".to_string(), text.to_string())
            }
            _ => self.error_text(
                format!(
                    "cannot index value of type {} with key of type {}",
                    base.type_name(),
                    index.type_name()
                ),
                text,
            ),
        }
    }

    fn eval_splat(&mut self, base: Value, rest: &[TraversalOperator], text: &str) -> Value {
        let items = match base {
            Value::Unknown(_) => return Value::Unknown(TypeHint::List),
            Value::Null => Vec::new(),
            Value::Array(items) => items,
            other => vec![other],
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let mut current = item;
            for op in rest {
                current = match op {
                    TraversalOperator::GetAttr(name) => self.step_attr(current, name.as_str(), text),
                    TraversalOperator::Index(index_expr) => {
                        let index = self.eval(index_expr);
                        self.step_index(current, &index, text)
                    }
                    TraversalOperator::LegacyIndex(n) => {
                        self.step_index(current, &Value::Int(*n as i64), text)
                    }
                    TraversalOperator::AttrSplat | TraversalOperator::FullSplat => {
                        return self.error_text("nested splat is not supported", text);
                    }
                };
            }
            out.push(current);
        }
        Value::Array(out)
    }

    fn error_text(&mut self, summary: impl Into<String>, text: &str) -> Value {
        self.diags
            .push(Diagnostic::error(summary).with_subject(text.to_string()));
        Value::unknown()
    }

    fn eval_conditional(&mut self, cond: &Conditional) -> Value {
        match self.eval(&cond.cond_expr) {
            Value::Bool(true) => self.eval(&cond.true_expr),
            Value::Bool(false) => self.eval(&cond.false_expr),
            Value::Unknown(_) => Value::unknown(),
            other => self.error(
                format!("condition is not a bool, got {}", other.type_name()),
                &cond.cond_expr,
            ),
        }
    }

    fn eval_operation(&mut self, expr: &Expression, op: &Operation) -> Value {
        match op {
            Operation::Unary(unary) => {
                let operand = self.eval(&unary.expr);
                match (unary.operator, &operand) {
                    (_, Value::Unknown(_)) => Value::unknown(),
                    (UnaryOperator::Neg, Value::Int(n)) => Value::Int(-n),
                    (UnaryOperator::Neg, Value::Float(n)) => Value::Float(-n),
                    (UnaryOperator::Not, Value::Bool(b)) => Value::Bool(!b),
                    (operator, other) => self.error(
                        format!(
                            "operator {:?} cannot be applied to {}",
                            operator,
                            other.type_name()
                        ),
                        expr,
                    ),
                }
            }
            Operation::Binary(binary) => {
                let lhs = self.eval(&binary.lhs_expr);
                let rhs = self.eval(&binary.rhs_expr);
                self.eval_binary(expr, binary.operator, lhs, rhs)
            }
        }
    }

    fn eval_binary(
        &mut self,
        expr: &Expression,
        operator: BinaryOperator,
        lhs: Value,
        rhs: Value,
    ) -> Value {
        use BinaryOperator::*;

        match operator {
            And | Or => return self.eval_logical(expr, operator, lhs, rhs),
            Eq | NotEq => {
                if lhs.is_unknown() || rhs.is_unknown() {
                    return Value::Unknown(TypeHint::Bool);
                }
                let equal = lhs.equals(&rhs);
                return Value::Bool(if operator == Eq { equal } else { !equal });
            }
            _ => {}
        }

        if lhs.is_unknown() || rhs.is_unknown() {
            return Value::unknown();
        }

        let (a, b) = match (lhs.as_float(), rhs.as_float()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return self.error(
                    format!(
                        "operands must be numbers, got {} and {}",
                        lhs.type_name(),
                        rhs.type_name()
                    ),
                    expr,
                );
            }
        };

        match operator {
            Less => Value::Bool(a < b),
            LessEq => Value::Bool(a <= b),
            Greater => Value::Bool(a > b),
            GreaterEq => Value::Bool(a >= b),
            Plus | Minus | Mul | Div | Mod => self.eval_arithmetic(expr, operator, lhs, rhs, a, b),
            And | Or | Eq | NotEq => unreachable!("handled above"),
        }
    }

    fn eval_logical(
        &mut self,
        expr: &Expression,
        operator: BinaryOperator,
        lhs: Value,
        rhs: Value,
    ) -> Value {
        let as_bool = |cx: &mut Self, v: &Value| -> Option<Option<bool>> {
            match v {
                Value::Bool(b) => Some(Some(*b)),
                Value::Unknown(_) => Some(None),
                other => {
                    cx.error(
                        format!("logical operand is not a bool, got {}", other.type_name()),
                        expr,
                    );
                    None
                }
            }
        };
        let a = match as_bool(self, &lhs) {
            Some(v) => v,
            None => return Value::unknown(),
        };
        let b = match as_bool(self, &rhs) {
            Some(v) => v,
            None => return Value::unknown(),
        };
        let short = operator == BinaryOperator::Or;
        // a known operand that decides the result wins even if the other
        // side is unknown
        if a == Some(short) || b == Some(short) {
            return Value::Bool(short);
        }
        match (a, b) {
            (Some(a), Some(b)) => {
                if operator == BinaryOperator::Or {
                    Value::Bool(a || b)
                } else {
                    Value::Bool(a && b)
                }
            }
            _ => Value::Unknown(TypeHint::Bool),
        }
    }

    fn eval_arithmetic(
        &mut self,
        expr: &Expression,
        operator: BinaryOperator,
        lhs: Value,
        rhs: Value,
        a: f64,
        b: f64,
    ) -> Value {
        use BinaryOperator::*;

        if let (Value::Int(x), Value::Int(y)) = (&lhs, &rhs) {
            let (x, y) = (*x, *y);
            match operator {
                Plus => {
                    if let Some(v) = x.checked_add(y) {
                        return Value::Int(v);
                    }
                }
                Minus => {
                    if let Some(v) = x.checked_sub(y) {
                        return Value::Int(v);
                    }
                }
                Mul => {
                    if let Some(v) = x.checked_mul(y) {
                        return Value::Int(v);
                    }
                }
                Div => {
                    if y == 0 {
                        return self.error("division by zero", expr);
                    }
                    if x % y == 0 {
                        return Value::Int(x / y);
                    }
                }
                Mod => {
                    if y == 0 {
                        return self.error("division by zero", expr);
                    }
                    return Value::Int(x % y);
                }
                _ => unreachable!("arithmetic operator"),
            }
        }

        match operator {
            Plus => Value::Float(a + b),
            Minus => Value::Float(a - b),
            Mul => Value::Float(a * b),
            Div => {
                if b == 0.0 {
                    self.error("division by zero", expr)
                } else {
                    Value::Float(a / b)
                }
            }
            Mod => {
                if b == 0.0 {
                    self.error("division by zero", expr)
                } else {
                    Value::Float(a % b)
                }
            }
            _ => unreachable!("arithmetic operator"),
        }
    }

    fn eval_for(&mut self, expr: &Expression, for_expr: &ForExpr) -> Value {
        let collection = self.eval(&for_expr.collection_expr);
        let iterations = match self.iterations_of(&collection, &for_expr.collection_expr) {
            Some(iters) => iters,
            None => return Value::unknown(),
        };

        let mut list_out = Vec::new();
        let mut object_out: IndexMap<String, Value> = IndexMap::new();

        for (key, value) in iterations {
            let mut bindings = IndexMap::new();
            if let Some(key_var) = &for_expr.key_var {
                bindings.insert(key_var.to_string(), key.clone());
            }
            bindings.insert(for_expr.value_var.to_string(), value);
            let env = self.env.child_with(bindings);
            let mut inner = self.scoped(&env);

            if let Some(cond_expr) = &for_expr.cond_expr {
                let cond = inner.eval(cond_expr);
                self.diags.extend(std::mem::take(&mut inner.diags));
                match cond {
                    Value::Bool(true) => {}
                    Value::Bool(false) => continue,
                    Value::Unknown(_) => return Value::unknown(),
                    other => {
                        return self.error(
                            format!("for filter is not a bool, got {}", other.type_name()),
                            cond_expr,
                        );
                    }
                }
            }

            match &for_expr.key_expr {
                None => {
                    let item = inner.eval(&for_expr.value_expr);
                    self.diags.extend(inner.diags);
                    list_out.push(item);
                }
                Some(key_expr) => {
                    let key = inner.eval(key_expr);
                    let item = inner.eval(&for_expr.value_expr);
                    self.diags.extend(inner.diags);
                    let key = match key {
                        Value::String(s) => s,
                        Value::Unknown(_) => return Value::Unknown(TypeHint::Object),
                        other => {
                            return self.error(
                                format!("for key is not a string, got {}", other.type_name()),
                                key_expr,
                            );
                        }
                    };
                    if for_expr.grouping {
                        match object_out.entry(key).or_insert_with(|| Value::Array(Vec::new())) {
                            Value::Array(group) => group.push(item),
                            _ => unreachable!("grouping entries are always arrays"),
                        }
                    } else if object_out.insert(key.clone(), item).is_some() {
                        return self.error(format!("duplicate object key {:?}", key), expr);
                    }
                }
            }
        }

        if for_expr.key_expr.is_some() {
            Value::Object(object_out)
        } else {
            Value::Array(list_out)
        }
    }

    /// Key/value pairs for iterating a collection value. `None` means the
    /// collection is unknown or not iterable (with a diagnostic pushed for
    /// the latter).
    fn iterations_of(
        &mut self,
        collection: &Value,
        subject: &Expression,
    ) -> Option<Vec<(Value, Value)>> {
        match collection {
            Value::Unknown(_) => None,
            Value::Array(items) => Some(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (Value::Int(i as i64), v.clone()))
                    .collect(),
            ),
            Value::Object(map) => Some(
                map.iter()
                    .map(|(k, v)| (Value::String(k.clone()), v.clone()))
                    .collect(),
            ),
            other => {
                self.error(
                    format!("value of type {} is not iterable", other.type_name()),
                    subject,
                );
                None
            }
        }
    }

    fn eval_func_call(&mut self, expr: &Expression, call: &FuncCall) -> Value {
        let name = call.name.to_string();

        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(self.eval(arg));
        }
        if call.expand_final {
            match args.pop() {
                Some(Value::Array(items)) => args.extend(items),
                Some(Value::Unknown(_)) => return Value::unknown(),
                Some(other) => {
                    return self.error(
                        format!("final expanded argument is not a list, got {}", other.type_name()),
                        expr,
                    );
                }
                None => {
                    return self.error("expansion requires at least one argument", expr);
                }
            }
        }

        if name == FunctionSet::INVOKE {
            return self.eval_invoke(expr, args);
        }

        match super::builtins::call(&name, &args) {
            Ok(value) => value,
            Err(diag) => {
                self.diags.push(diag.with_subject(render(expr)));
                Value::unknown()
            }
        }
    }

    fn eval_invoke(&mut self, expr: &Expression, args: Vec<Value>) -> Value {
        if args.len() != 2 {
            return self.error(
                format!("invoke expects 2 arguments, got {}", args.len()),
                expr,
            );
        }
        let name = match &args[0] {
            Value::String(s) => s.clone(),
            Value::Unknown(_) => return Value::unknown(),
            other => {
                return self.error(
                    format!("invoke function name is not a string, got {}", other.type_name()),
                    expr,
                );
            }
        };
        let params = match &args[1] {
            Value::Object(map) => map.clone(),
            Value::Unknown(_) => return Value::unknown(),
            other => {
                return self.error(
                    format!(
                        "arguments to user function {:?} are not an object, got {}",
                        name,
                        other.type_name()
                    ),
                    expr,
                );
            }
        };
        match self.functions.invoke(&name, params) {
            Ok(value) => value,
            Err(diags) => {
                let subject = render(expr);
                for mut diag in diags {
                    if diag.subject.is_none() {
                        diag.subject = Some(subject.clone());
                    }
                    self.diags.push(diag);
                }
                Value::unknown()
            }
        }
    }
}

fn number_value(n: &hcl::Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Int(i)
    } else {
        Value::Float(n.as_f64().unwrap_or(0.0))
    }
}

/// A static step of a variable reference.
#[derive(Debug, Clone, PartialEq)]
pub enum VarStep {
    Attr(String),
    Index(i64),
}

/// A free root reference in an expression: the root name, the leading static
/// steps, and the re-rendered source text.
#[derive(Debug, Clone)]
pub struct VarRef {
    pub root: String,
    pub steps: Vec<VarStep>,
    pub text: String,
}

impl VarRef {
    /// Resolve the reference against an environment, following as many
    /// static steps as the data allows. `None` if the root is unbound or a
    /// step is missing.
    pub fn resolve(&self, env: &Environment) -> Option<Value> {
        let mut current = env.get(&self.root)?.clone();
        for step in &self.steps {
            if current.is_unknown() {
                return Some(current);
            }
            current = match step {
                VarStep::Attr(name) => current.as_object()?.get(name)?.clone(),
                VarStep::Index(i) => {
                    let items = current.as_array()?;
                    items.get(usize::try_from(*i).ok()?)?.clone()
                }
            };
        }
        Some(current)
    }
}

/// List every free root reference of the expression, excluding names bound
/// by enclosing `for` expressions and template directives.
pub fn variables(expr: &Expression) -> Vec<VarRef> {
    let mut out = Vec::new();
    let mut bound = Vec::new();
    collect_variables(expr, &mut bound, &mut out);
    out
}

fn collect_variables(expr: &Expression, bound: &mut Vec<String>, out: &mut Vec<VarRef>) {
    match expr {
        Expression::Variable(var) => {
            let name = var.as_str();
            if !bound.iter().any(|b| b == name) {
                out.push(VarRef {
                    root: name.to_string(),
                    steps: Vec::new(),
                    text: render(expr),
                });
            }
        }
        Expression::Traversal(traversal) => collect_traversal(traversal, bound, out),
        Expression::Array(items) => {
            for item in items {
                collect_variables(item, bound, out);
            }
        }
        Expression::Object(object) => {
            for (key, value) in object.iter() {
                if let hcl::ObjectKey::Expression(key_expr) = key {
                    collect_variables(key_expr, bound, out);
                }
                collect_variables(value, bound, out);
            }
        }
        Expression::TemplateExpr(template) => {
            if let Ok(template) = Template::from_expr(template) {
                collect_template_variables(&template, bound, out);
            }
        }
        Expression::Parenthesis(inner) => collect_variables(inner, bound, out),
        Expression::Conditional(cond) => {
            collect_variables(&cond.cond_expr, bound, out);
            collect_variables(&cond.true_expr, bound, out);
            collect_variables(&cond.false_expr, bound, out);
        }
        Expression::Operation(op) => match op.as_ref() {
            Operation::Unary(unary) => collect_variables(&unary.expr, bound, out),
            Operation::Binary(binary) => {
                collect_variables(&binary.lhs_expr, bound, out);
                collect_variables(&binary.rhs_expr, bound, out);
            }
        },
        Expression::ForExpr(for_expr) => {
            collect_variables(&for_expr.collection_expr, bound, out);
            let mut names = vec![for_expr.value_var.to_string()];
            if let Some(key_var) = &for_expr.key_var {
                names.push(key_var.to_string());
            }
            let depth = bound.len();
            bound.extend(names);
            if let Some(key_expr) = &for_expr.key_expr {
                collect_variables(key_expr, bound, out);
            }
            collect_variables(&for_expr.value_expr, bound, out);
            if let Some(cond_expr) = &for_expr.cond_expr {
                collect_variables(cond_expr, bound, out);
            }
            bound.truncate(depth);
        }
        Expression::FuncCall(call) => {
            for arg in &call.args {
                collect_variables(arg, bound, out);
            }
        }
        _ => {}
    }
}

fn collect_traversal(traversal: &Traversal, bound: &mut Vec<String>, out: &mut Vec<VarRef>) {
    // index expressions may themselves contain references
    for op in &traversal.operators {
        if let TraversalOperator::Index(index_expr) = op {
            collect_variables(index_expr, bound, out);
        }
    }

    let root = match &traversal.expr {
        Expression::Variable(var) => var.as_str().to_string(),
        other => {
            // traversal of a computed value, e.g. a function call result
            collect_variables(other, bound, out);
            return;
        }
    };
    if bound.iter().any(|b| b == &root) {
        return;
    }

    let mut steps = Vec::new();
    for op in &traversal.operators {
        match normalize_operator(op) {
            Some(step) => steps.push(step),
            None => break,
        }
    }
    out.push(VarRef {
        root,
        steps,
        text: render(&Expression::Traversal(Box::new(traversal.clone()))),
    });
}

/// Normalise a traversal operator to a static step: attribute access stays
/// attribute access, a literal string index becomes an attribute, a literal
/// integer index becomes an index. Dynamic operators yield `None`.
fn normalize_operator(op: &TraversalOperator) -> Option<VarStep> {
    match op {
        TraversalOperator::GetAttr(name) => Some(VarStep::Attr(name.to_string())),
        TraversalOperator::Index(Expression::String(key)) => Some(VarStep::Attr(key.clone())),
        TraversalOperator::Index(Expression::Number(n)) => n.as_i64().map(VarStep::Index),
        TraversalOperator::LegacyIndex(n) => Some(VarStep::Index(*n as i64)),
        _ => None,
    }
}

fn collect_template_variables(template: &Template, bound: &mut Vec<String>, out: &mut Vec<VarRef>) {
    for element in template.elements() {
        match element {
            Element::Literal(_) => {}
            Element::Interpolation(interp) => collect_variables(&interp.expr, bound, out),
            Element::Directive(Directive::If(dir)) => {
                collect_variables(&dir.cond_expr, bound, out);
                collect_template_variables(&dir.true_template, bound, out);
                if let Some(false_template) = &dir.false_template {
                    collect_template_variables(false_template, bound, out);
                }
            }
            Element::Directive(Directive::For(dir)) => {
                collect_variables(&dir.collection_expr, bound, out);
                let depth = bound.len();
                bound.push(dir.value_var.to_string());
                if let Some(key_var) = &dir.key_var {
                    bound.push(key_var.to_string());
                }
                collect_template_variables(&dir.template, bound, out);
                bound.truncate(depth);
            }
        }
    }
}

/// Visit every function call in the expression, including calls nested in
/// templates, for-expressions and other calls.
pub fn walk_func_calls<F: FnMut(&FuncCall)>(expr: &Expression, visit: &mut F) {
    match expr {
        Expression::FuncCall(call) => {
            visit(call);
            for arg in &call.args {
                walk_func_calls(arg, visit);
            }
        }
        Expression::Array(items) => {
            for item in items {
                walk_func_calls(item, visit);
            }
        }
        Expression::Object(object) => {
            for (key, value) in object.iter() {
                if let hcl::ObjectKey::Expression(key_expr) = key {
                    walk_func_calls(key_expr, visit);
                }
                walk_func_calls(value, visit);
            }
        }
        Expression::TemplateExpr(template) => {
            if let Ok(template) = Template::from_expr(template) {
                walk_template_func_calls(&template, visit);
            }
        }
        Expression::Variable(_) => {}
        Expression::Traversal(traversal) => {
            walk_func_calls(&traversal.expr, visit);
            for op in &traversal.operators {
                if let TraversalOperator::Index(index_expr) = op {
                    walk_func_calls(index_expr, visit);
                }
            }
        }
        Expression::Parenthesis(inner) => walk_func_calls(inner, visit),
        Expression::Conditional(cond) => {
            walk_func_calls(&cond.cond_expr, visit);
            walk_func_calls(&cond.true_expr, visit);
            walk_func_calls(&cond.false_expr, visit);
        }
        Expression::Operation(op) => match op.as_ref() {
            Operation::Unary(unary) => walk_func_calls(&unary.expr, visit),
            Operation::Binary(binary) => {
                walk_func_calls(&binary.lhs_expr, visit);
                walk_func_calls(&binary.rhs_expr, visit);
            }
        },
        Expression::ForExpr(for_expr) => {
            walk_func_calls(&for_expr.collection_expr, visit);
            if let Some(key_expr) = &for_expr.key_expr {
                walk_func_calls(key_expr, visit);
            }
            walk_func_calls(&for_expr.value_expr, visit);
            if let Some(cond_expr) = &for_expr.cond_expr {
                walk_func_calls(cond_expr, visit);
            }
        }
        _ => {}
    }
}

fn walk_template_func_calls<F: FnMut(&FuncCall)>(template: &Template, visit: &mut F) {
    for element in template.elements() {
        match element {
            Element::Literal(_) => {}
            Element::Interpolation(interp) => walk_func_calls(&interp.expr, visit),
            Element::Directive(Directive::If(dir)) => {
                walk_func_calls(&dir.cond_expr, visit);
                walk_template_func_calls(&dir.true_template, visit);
                if let Some(false_template) = &dir.false_template {
                    walk_template_func_calls(false_template, visit);
                }
            }
            Element::Directive(Directive::For(dir)) => {
                walk_func_calls(&dir.collection_expr, visit);
                walk_template_func_calls(&dir.template, visit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_expr(src: &str) -> Expression {
        let body = hcl::parse(&format!("x = {}", src)).expect("source must parse");
        body.into_attributes()
            .next()
            .expect("attribute must exist")
            .expr
    }

    fn eval_str(src: &str, env: &Environment) -> (Value, Diagnostics) {
        let functions = FunctionSet::empty();
        evaluate(&parse_expr(src), env, &functions)
    }

    fn must_eval(src: &str, env: &Environment) -> Value {
        let (value, diags) = eval_str(src, env);
        assert!(!diags.has_errors(), "unexpected errors: {}", diags);
        value
    }

    fn env_with(pairs: &[(&str, Value)]) -> Environment {
        let mut env = Environment::new();
        for (k, v) in pairs {
            env.define(*k, v.clone());
        }
        env
    }

    #[test]
    fn test_literals() {
        let env = Environment::new();
        assert_eq!(must_eval("null", &env), Value::Null);
        assert_eq!(must_eval("true", &env), Value::Bool(true));
        assert_eq!(must_eval("42", &env), Value::Int(42));
        assert_eq!(must_eval("4.5", &env), Value::Float(4.5));
        assert_eq!(must_eval(r#""hi""#, &env), Value::String("hi".into()));
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        let env = Environment::new();
        assert_eq!(must_eval("1 + 2 * 3", &env), Value::Int(7));
        assert_eq!(must_eval("7 / 2", &env), Value::Float(3.5));
        assert_eq!(must_eval("6 / 2", &env), Value::Int(3));
        assert_eq!(must_eval("7 % 3", &env), Value::Int(1));
        assert_eq!(must_eval("1 < 2", &env), Value::Bool(true));
        assert_eq!(must_eval("2 >= 3", &env), Value::Bool(false));
    }

    #[test]
    fn test_division_by_zero_is_hard_error() {
        let env = Environment::new();
        let (value, diags) = eval_str("1 / 0", &env);
        assert!(value.is_unknown());
        assert!(diags.has_errors());
        assert!(!diags.clone().downgrade_incomplete().has_warnings());
    }

    #[test]
    fn test_equality_with_coercion() {
        let env = Environment::new();
        assert_eq!(must_eval("1 == 1.0", &env), Value::Bool(true));
        assert_eq!(must_eval(r#""a" != "b""#, &env), Value::Bool(true));
        assert_eq!(must_eval("null == null", &env), Value::Bool(true));
    }

    #[test]
    fn test_logical_short_circuit_with_unknown() {
        let env = env_with(&[("u", Value::unknown())]);
        assert_eq!(must_eval("true || u", &env), Value::Bool(true));
        assert_eq!(must_eval("false && u", &env), Value::Bool(false));
        assert!(must_eval("true && u", &env).is_unknown());
    }

    #[test]
    fn test_variables_and_traversal() {
        let mut inner = IndexMap::new();
        inner.insert("port".to_string(), Value::Int(8080));
        let env = env_with(&[("server", Value::Object(inner))]);
        assert_eq!(must_eval("server.port", &env), Value::Int(8080));
        assert_eq!(must_eval(r#"server["port"]"#, &env), Value::Int(8080));
    }

    #[test]
    fn test_missing_attribute_is_incomplete_class() {
        let env = env_with(&[("server", Value::Object(IndexMap::new()))]);
        let (value, diags) = eval_str("server.port", &env);
        assert!(value.is_unknown());
        assert!(diags.has_errors());
        // incomplete-class: downgradeable
        assert!(!diags.downgrade_incomplete().has_errors());
    }

    #[test]
    fn test_unknown_variable_is_hard_error() {
        let env = Environment::new();
        let (value, diags) = eval_str("nonexistent", &env);
        assert!(value.is_unknown());
        assert!(diags.clone().downgrade_incomplete().has_errors());
    }

    #[test]
    fn test_traversal_into_unknown_is_silent() {
        let env = env_with(&[("res", Value::unknown())]);
        let (value, diags) = eval_str("res.status.url", &env);
        assert!(value.is_unknown());
        assert!(diags.is_empty());
    }

    #[test]
    fn test_index_traversal() {
        let env = env_with(&[(
            "items",
            Value::Array(vec![Value::Int(10), Value::Int(20)]),
        )]);
        assert_eq!(must_eval("items[1]", &env), Value::Int(20));
        let (value, diags) = eval_str("items[5]", &env);
        assert!(value.is_unknown());
        assert!(!diags.downgrade_incomplete().has_errors());
    }

    #[test]
    fn test_splat() {
        let mut a = IndexMap::new();
        a.insert("name".to_string(), Value::String("a".into()));
        let mut b = IndexMap::new();
        b.insert("name".to_string(), Value::String("b".into()));
        let env = env_with(&[(
            "items",
            Value::Array(vec![Value::Object(a), Value::Object(b)]),
        )]);
        assert_eq!(
            must_eval("items[*].name", &env),
            Value::Array(vec![Value::String("a".into()), Value::String("b".into())])
        );
    }

    #[test]
    fn test_template_interpolation() {
        let env = env_with(&[("name", Value::String("web".into())), ("n", Value::Int(3))]);
        assert_eq!(
            must_eval(r#""${name}-${n}""#, &env),
            Value::String("web-3".into())
        );
    }

    #[test]
    fn test_template_with_unknown_part_is_unknown() {
        let env = env_with(&[("u", Value::unknown())]);
        let (value, diags) = eval_str(r#""prefix-${u}""#, &env);
        assert!(value.is_unknown());
        assert!(diags.is_empty());
    }

    #[test]
    fn test_lone_interpolation_passes_value_through() {
        let mut map = IndexMap::new();
        map.insert("a".to_string(), Value::Int(1));
        let env = env_with(&[("obj", Value::Object(map.clone()))]);
        assert_eq!(must_eval(r#""${obj}""#, &env), Value::Object(map));
    }

    #[test]
    fn test_conditional() {
        let env = env_with(&[("u", Value::unknown())]);
        assert_eq!(must_eval("true ? 1 : 2", &env), Value::Int(1));
        assert_eq!(must_eval("false ? 1 : 2", &env), Value::Int(2));
        assert!(must_eval("u ? 1 : 2", &env).is_unknown());
    }

    #[test]
    fn test_conditional_evaluates_taken_branch_only() {
        let env = env_with(&[("n", Value::Int(0))]);
        // the false branch divides by zero but is never taken
        assert_eq!(must_eval("n == 0 ? -1 : 1 / n", &env), Value::Int(-1));
    }

    #[test]
    fn test_object_and_array_constructors() {
        let env = Environment::new();
        let value = must_eval(r#"{ a = 1, b = [true, "x"] }"#, &env);
        let map = value.as_object().unwrap();
        assert_eq!(map.get("a"), Some(&Value::Int(1)));
        assert_eq!(
            map.get("b"),
            Some(&Value::Array(vec![
                Value::Bool(true),
                Value::String("x".into())
            ]))
        );
    }

    #[test]
    fn test_for_expression_list() {
        let env = env_with(&[(
            "items",
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        )]);
        assert_eq!(
            must_eval("[for v in items : v * 2]", &env),
            Value::Array(vec![Value::Int(2), Value::Int(4), Value::Int(6)])
        );
    }

    #[test]
    fn test_for_expression_object_with_filter() {
        let mut map = IndexMap::new();
        map.insert("a".to_string(), Value::Int(1));
        map.insert("b".to_string(), Value::Int(2));
        let env = env_with(&[("m", Value::Object(map))]);
        let value = must_eval("{for k, v in m : k => v if v > 1}", &env);
        let out = value.as_object().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("b"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_unknown_propagates_through_operations() {
        let env = env_with(&[("u", Value::unknown())]);
        assert!(must_eval("u + 1", &env).is_unknown());
        assert!(must_eval("-u", &env).is_unknown());
        assert!(must_eval("u == 1", &env).is_unknown());
        assert!(must_eval("[for v in u : v]", &env).is_unknown());
    }

    #[test]
    fn test_variables_walker() {
        let expr = parse_expr(r#"{ a = req.composite.spec.size, b = local_one + each.value }"#);
        let vars = variables(&expr);
        let roots: Vec<&str> = vars.iter().map(|v| v.root.as_str()).collect();
        assert_eq!(roots, vec!["req", "local_one", "each"]);
        assert_eq!(
            vars[0].steps,
            vec![
                VarStep::Attr("composite".into()),
                VarStep::Attr("spec".into()),
                VarStep::Attr("size".into())
            ]
        );
    }

    #[test]
    fn test_variables_walker_excludes_bound_names() {
        let expr = parse_expr("[for v in items : v + outer]");
        let vars = variables(&expr);
        let roots: Vec<&str> = vars.iter().map(|v| v.root.as_str()).collect();
        assert_eq!(roots, vec!["items", "outer"]);
    }

    #[test]
    fn test_variables_walker_normalizes_string_index() {
        let expr = parse_expr(r#"req["resource"].web"#);
        let vars = variables(&expr);
        assert_eq!(vars.len(), 1);
        assert_eq!(
            vars[0].steps,
            vec![VarStep::Attr("resource".into()), VarStep::Attr("web".into())]
        );
    }

    #[test]
    fn test_var_ref_resolve() {
        let mut spec = IndexMap::new();
        spec.insert("size".to_string(), Value::unknown());
        let mut composite = IndexMap::new();
        composite.insert("spec".to_string(), Value::Object(spec));
        let mut req = IndexMap::new();
        req.insert("composite".to_string(), Value::Object(composite));
        let env = env_with(&[("req", Value::Object(req))]);

        let expr = parse_expr("req.composite.spec.size");
        let vars = variables(&expr);
        let resolved = vars[0].resolve(&env).unwrap();
        assert!(resolved.is_unknown());

        let expr = parse_expr("req.composite.missing.size");
        let vars = variables(&expr);
        assert!(vars[0].resolve(&env).is_none());
    }

    #[test]
    fn test_walk_func_calls_finds_nested_calls() {
        let expr = parse_expr(r#"invoke("f", { n = length([1, 2]) })"#);
        let mut names = Vec::new();
        walk_func_calls(&expr, &mut |call| names.push(call.name.to_string()));
        assert_eq!(names, vec!["invoke", "length"]);
    }

    #[test]
    fn test_builtin_call() {
        let env = Environment::new();
        assert_eq!(must_eval("length([1, 2, 3])", &env), Value::Int(3));
        assert_eq!(
            must_eval(r#"upper("abc")"#, &env),
            Value::String("ABC".into())
        );
    }

    #[test]
    fn test_unknown_function_is_hard_error() {
        let env = Environment::new();
        let (value, diags) = eval_str("definitely_not_a_function(1)", &env);
        assert!(value.is_unknown());
        assert!(diags.downgrade_incomplete().has_errors());
    }
}
