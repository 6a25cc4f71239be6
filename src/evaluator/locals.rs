//! Dependency-ordered evaluation of `locals` blocks.
//!
//! All locals blocks under one body are processed as a single unit: names
//! must be unique across them, may reference each other in any declaration
//! order, and are evaluated depth-first with cycle detection. A local may
//! end up incomplete if it refers to observed state that is not known yet;
//! that is not an error here.

use std::collections::HashSet;

use hcl::expr::Expression;
use indexmap::IndexMap;

use crate::errors::{Diagnostic, Diagnostics};
use crate::schema::{self, Content, BLOCK_LOCALS};

use super::expr;
use super::functions::FunctionSet;
use super::scope::{self, Environment, RESERVED_ARG, RESERVED_REQ, RESERVED_SELF};

struct LocalInfo {
    expr: Expression,
    deps: Vec<String>,
}

/// Process all `locals` blocks in the supplied content and return a child
/// environment holding their values, plus any warnings produced while
/// evaluating. If no locals are declared the parent environment is returned
/// unchanged.
pub fn process(
    env: &Environment,
    content: &Content,
    functions: &FunctionSet,
) -> Result<(Environment, Diagnostics), Diagnostics> {
    let mut locals: IndexMap<String, LocalInfo> = IndexMap::new();

    for block in content.blocks_of(BLOCK_LOCALS) {
        let attributes = schema::just_attributes(&block.body)?;
        for (name, attribute) in attributes {
            if locals.contains_key(&name) {
                return Err(Diagnostics::single_error(format!(
                    "local {:?}: duplicate local declaration",
                    name
                )));
            }
            if scope::is_reserved(&name) {
                return Err(Diagnostics::single_error(format!(
                    "local {:?}: name is reserved and cannot be used",
                    name
                )));
            }
            if env.is_defined(&name) {
                return Err(Diagnostic::error("attempt to shadow variable")
                    .with_detail(name)
                    .into());
            }
            locals.insert(
                name,
                LocalInfo {
                    expr: attribute.expr,
                    deps: Vec::new(),
                },
            );
        }
    }

    if locals.is_empty() {
        return Ok((env.clone(), Diagnostics::new()));
    }

    compute_deps(env, &mut locals)?;

    let mut eval = LocalEval {
        env: env.child(),
        functions,
        remaining: locals.keys().cloned().collect(),
        path: Vec::new(),
        diags: Diagnostics::new(),
    };
    let names: Vec<String> = locals.keys().cloned().collect();
    for name in &names {
        eval.eval_local(&locals, name);
    }

    if eval.diags.has_errors() {
        return Err(eval.diags);
    }
    Ok((eval.env, eval.diags))
}

/// Expressions keyed by local name, for the analyzer's reference checks.
pub fn expressions(content: &Content) -> Result<IndexMap<String, Expression>, Diagnostics> {
    let mut out = IndexMap::new();
    for block in content.blocks_of(BLOCK_LOCALS) {
        for (name, attribute) in schema::just_attributes(&block.body)? {
            out.insert(name, attribute.expr);
        }
    }
    Ok(out)
}

/// Record which locals each local depends on, checking every other root
/// reference against the parent environment. Cycles are not detected here.
fn compute_deps(
    env: &Environment,
    locals: &mut IndexMap<String, LocalInfo>,
) -> Result<(), Diagnostics> {
    let names: HashSet<String> = locals.keys().cloned().collect();
    for info in locals.values_mut() {
        for var in expr::variables(&info.expr) {
            match var.root.as_str() {
                // namespace roots get checked by the analyzer, not here
                RESERVED_REQ | RESERVED_SELF | RESERVED_ARG => {}
                root if names.contains(root) => {
                    if !info.deps.iter().any(|d| d == root) {
                        info.deps.push(root.to_string());
                    }
                }
                root if env.is_defined(root) => {}
                _ => {
                    return Err(Diagnostic::error("reference to non-existent variable")
                        .with_subject(var.text)
                        .into());
                }
            }
        }
    }
    Ok(())
}

struct LocalEval<'a> {
    env: Environment,
    functions: &'a FunctionSet,
    remaining: HashSet<String>,
    path: Vec<String>,
    diags: Diagnostics,
}

impl LocalEval<'_> {
    fn eval_local(&mut self, locals: &IndexMap<String, LocalInfo>, name: &str) {
        if !self.remaining.contains(name) {
            return;
        }

        if let Some(pos) = self.path.iter().position(|p| p == name) {
            let mut cycle: Vec<&str> = self.path[pos..].iter().map(String::as_str).collect();
            cycle.push(name);
            self.diags.push(Diagnostic::error(format!(
                "cycle found: {}",
                cycle.join(" \u{2192} ")
            )));
            return;
        }
        self.path.push(name.to_string());

        let info = &locals[name];
        for dep in info.deps.clone() {
            if self.remaining.contains(&dep) {
                self.eval_local(locals, &dep);
            }
        }

        self.path.pop();
        self.remaining.remove(name);
        if self.diags.has_errors() {
            return;
        }

        // the value may be unknown if the expression relies on observed
        // state that does not exist yet; only incomplete-class problems are
        // softened here
        let (value, diags) = expr::evaluate(&info.expr, &self.env, self.functions);
        self.diags.extend(diags.downgrade_incomplete());
        self.env.define(name, value);
    }
}
