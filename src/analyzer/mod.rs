//! Static analysis of DSL sources.
//!
//! The analyzer never produces desired state. It parses the same bodies the
//! evaluator would, loads functions, builds a dummy request environment
//! (empty composite, no observed resources), and walks every expression in
//! every block checking that references resolve: locals, the reserved
//! namespaces, declared resource/collection/requirement names, `each`
//! steps, and `invoke` targets. Duplicate names across the whole source are
//! rejected in a prior structural pass.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::api::{Request, SourceFile};
use crate::errors::{Diagnostic, Diagnostics, Error};
use crate::evaluator::expr::{self, VarRef, VarStep};
use crate::evaluator::locals;
use crate::evaluator::request;
use crate::evaluator::scope::{
    Environment, ITERATOR_NAME, RESERVED_ARG, RESERVED_REQ, RESERVED_SELF,
};
use crate::evaluator::value::Value;
use crate::evaluator::FunctionSet;
use crate::schema::{
    self, Content, ATTR_NAME, BLOCK_FUNCTION, BLOCK_LOCALS, BLOCK_REQUIREMENT, BLOCK_RESOURCE,
    BLOCK_RESOURCES, BLOCK_TEMPLATE,
};

/// Run static checks on the supplied files. Returns the collected
/// diagnostics, errors first.
pub fn analyze(files: &[SourceFile]) -> Diagnostics {
    let diags = match try_analyze(files) {
        Ok(diags) => diags,
        Err(diags) => diags,
    };
    diags.sort_by_severity()
}

fn try_analyze(files: &[SourceFile]) -> Result<Diagnostics, Diagnostics> {
    let content = crate::evaluator::load_content(files).map_err(|err| match err {
        Error::Eval(diags) => diags,
        other => Diagnostics::single_error(other.to_string()),
    })?;

    let mut analyzer = Analyzer::default();
    let structure = analyzer.check_structure(&content);
    if structure.has_errors() {
        return Err(structure);
    }

    let functions = FunctionSet::load(&content)?;
    analyzer.functions = functions;

    // a dummy request: empty composite, no observed state
    let tables = request::build(&Environment::new(), &Request::default());

    let mut diags = structure;
    diags.extend(analyzer.analyze_content(&tables.env, "", &content));
    Ok(diags)
}

#[derive(Default)]
struct Analyzer {
    functions: FunctionSet,
    resource_names: HashSet<String>,
    collection_names: HashSet<String>,
    requirement_names: HashSet<String>,
}

impl Analyzer {
    /// Walk the whole block tree checking structure against the schemas and
    /// collecting declared names, rejecting duplicates.
    fn check_structure(&mut self, content: &Content) -> Diagnostics {
        let mut diags = Diagnostics::new();
        for block in &content.blocks {
            let kind = block.identifier.as_str();
            let label = schema::block_label(block).unwrap_or_default().to_string();
            match kind {
                BLOCK_RESOURCE => {
                    if !self.resource_names.insert(label.clone()) {
                        diags.push(
                            Diagnostic::error("resource defined more than once")
                                .with_detail(label),
                        );
                    }
                }
                BLOCK_RESOURCES => {
                    if !self.collection_names.insert(label.clone()) {
                        diags.push(
                            Diagnostic::error("resource collection defined more than once")
                                .with_detail(label),
                        );
                    }
                }
                BLOCK_REQUIREMENT => {
                    if !self.requirement_names.insert(label.clone()) {
                        diags.push(
                            Diagnostic::error("requirement defined more than once")
                                .with_detail(label),
                        );
                    }
                }
                _ => {}
            }

            match schema::for_block_kind(kind) {
                Some(block_schema) => match schema::content_of(&block.body, block_schema) {
                    Ok(child) => diags.extend(self.check_structure(&child)),
                    Err(ds) => diags.extend(ds),
                },
                // blocks without a schema hold plain attributes (locals)
                None => {
                    if let Err(ds) = schema::just_attributes(&block.body) {
                        diags.extend(ds);
                    }
                }
            }
        }
        diags
    }

    /// Check every expression in the content of one block, then recurse
    /// into nested blocks.
    fn analyze_content(
        &self,
        env: &Environment,
        parent_kind: &str,
        content: &Content,
    ) -> Diagnostics {
        let mut env = env.clone();

        // bind the dummy self entries the evaluator would bind
        if parent_kind == BLOCK_RESOURCES {
            let mut self_vars = IndexMap::new();
            self_vars.insert("basename".to_string(), Value::String("dummy".into()));
            self_vars.insert("resources".to_string(), Value::unknown());
            self_vars.insert("connections".to_string(), Value::unknown());
            env = env.child_with_self(self_vars);
        }
        if parent_kind == BLOCK_RESOURCE || parent_kind == BLOCK_TEMPLATE {
            let mut self_vars = IndexMap::new();
            self_vars.insert("name".to_string(), Value::String("dummy".into()));
            self_vars.insert("resource".to_string(), Value::unknown());
            self_vars.insert("connection".to_string(), Value::unknown());
            env = env.child_with_self(self_vars);
        }

        let (env, _) = match locals::process(&env, content, &self.functions) {
            Ok(ok) => ok,
            Err(diags) => return diags,
        };
        let local_expressions = match locals::expressions(content) {
            Ok(expressions) => expressions,
            Err(diags) => return diags,
        };

        let mut diags = Diagnostics::new();

        for expression in local_expressions.values() {
            for var in expr::variables(expression) {
                diags.extend(self.check_reference(&env, &var));
            }
            diags.extend(self.functions.check_invoke_calls(expression));
        }

        for (name, attribute) in &content.attributes {
            // the name attribute of a collection is special: it alone has
            // access to the iterator
            if name == ATTR_NAME && parent_kind == BLOCK_RESOURCES {
                continue;
            }
            for var in expr::variables(&attribute.expr) {
                diags.extend(self.check_reference(&env, &var));
            }
            diags.extend(self.functions.check_invoke_calls(&attribute.expr));
        }

        // from here on, collections bind the iterator: for their name
        // attribute and for everything in their nested blocks
        let env = if parent_kind == BLOCK_RESOURCES {
            let mut each = IndexMap::new();
            each.insert("key".to_string(), Value::unknown());
            each.insert("value".to_string(), Value::unknown());
            let mut bindings = IndexMap::new();
            bindings.insert(ITERATOR_NAME.to_string(), Value::Object(each));
            let env = env.child_with(bindings);
            if let Some(name_attr) = content.attributes.get(ATTR_NAME) {
                for var in expr::variables(&name_attr.expr) {
                    diags.extend(self.check_reference(&env, &var));
                }
                diags.extend(self.functions.check_invoke_calls(&name_attr.expr));
            }
            env
        } else {
            env
        };

        for block in &content.blocks {
            let kind = block.identifier.as_str();
            // function bodies were checked at load time
            if kind == BLOCK_LOCALS || kind == BLOCK_FUNCTION {
                continue;
            }
            let Some(block_schema) = schema::for_block_kind(kind) else {
                continue;
            };
            match schema::content_of(&block.body, block_schema) {
                Ok(child) => diags.extend(self.analyze_content(&env, kind, &child)),
                Err(ds) => diags.extend(ds),
            }
        }
        diags
    }

    /// Check one root reference against the reserved namespaces, the
    /// declared names, and the environment.
    fn check_reference(&self, env: &Environment, var: &VarRef) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let first = var.steps.first();
        let second = var.steps.get(1);

        let attr_of = |step: &VarStep| match step {
            VarStep::Attr(name) => Some(name.clone()),
            VarStep::Index(_) => None,
        };

        match var.root.as_str() {
            root @ (RESERVED_REQ | RESERVED_SELF) => {
                let Some(first) = first else {
                    return diags;
                };
                let Some(first) = attr_of(first) else {
                    diags.push(
                        Diagnostic::error("invalid index expression").with_subject(var.text.clone()),
                    );
                    return diags;
                };

                // the trailing step of the iterator view is fixed
                if root == RESERVED_SELF && first == "each" {
                    let second = second.and_then(attr_of);
                    if !matches!(second.as_deref(), Some("key") | Some("value")) {
                        diags.push(
                            Diagnostic::error(
                                "invalid each reference, must be one of 'key' or 'value'",
                            )
                            .with_subject(var.text.clone()),
                        );
                    }
                    return diags;
                }

                let table = env.namespace_table(root);
                if !table.contains_key(&first) {
                    diags.push(
                        Diagnostic::error(format!("no such attribute {:?}", first))
                            .with_subject(var.text.clone()),
                    );
                    return diags;
                }

                let Some(second) = second.and_then(attr_of) else {
                    return diags;
                };
                if root == RESERVED_REQ {
                    match first.as_str() {
                        "resource" | "connection" => {
                            if !self.resource_names.contains(&second) {
                                diags.push(
                                    Diagnostic::error("invalid resource name reference")
                                        .with_detail(second)
                                        .with_subject(var.text.clone()),
                                );
                            }
                        }
                        "resources" | "connections" => {
                            if !self.collection_names.contains(&second) {
                                diags.push(
                                    Diagnostic::error("invalid resource collection name reference")
                                        .with_detail(second)
                                        .with_subject(var.text.clone()),
                                );
                            }
                        }
                        "extra_resources" => {
                            if !self.requirement_names.contains(&second) {
                                diags.push(
                                    Diagnostic::error("invalid requirement name reference")
                                        .with_detail(second)
                                        .with_subject(var.text.clone()),
                                );
                            }
                        }
                        _ => {}
                    }
                }
            }

            ITERATOR_NAME => {
                if let Some(first) = first {
                    match attr_of(first).as_deref() {
                        Some("key") | Some("value") => {}
                        _ => {
                            diags.push(
                                Diagnostic::error(
                                    "invalid each reference, must be one of 'key' or 'value'",
                                )
                                .with_subject(var.text.clone()),
                            );
                            return diags;
                        }
                    }
                }
                // the iterator is bound on demand, so also check it like a
                // local variable
                if !env.is_defined(ITERATOR_NAME) {
                    diags.push(
                        Diagnostic::error("invalid local variable reference")
                            .with_detail(ITERATOR_NAME)
                            .with_subject(var.text.clone()),
                    );
                }
            }

            RESERVED_ARG => {
                // argument references are only meaningful inside functions,
                // which are validated at load time
                if !env.is_defined(RESERVED_ARG) {
                    diags.push(
                        Diagnostic::error("invalid local variable reference")
                            .with_detail(RESERVED_ARG)
                            .with_subject(var.text.clone()),
                    );
                }
            }

            root => {
                if !env.is_defined(root) {
                    diags.push(
                        Diagnostic::error("invalid local variable reference")
                            .with_detail(root.to_string())
                            .with_subject(var.text.clone()),
                    );
                }
            }
        }
        diags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze_src(src: &str) -> Diagnostics {
        analyze(&[SourceFile::new("test.hcl", src)])
    }

    fn messages(diags: &Diagnostics) -> String {
        diags.messages().join("; ")
    }

    #[test]
    fn test_clean_source() {
        let diags = analyze_src(
            r#"
            locals {
              app = "web"
            }
            resource "cm" {
              body = {
                apiVersion = "v1"
                kind       = "ConfigMap"
                metadata   = { name = app, labels = { owner = self.name } }
              }
            }
            "#,
        );
        assert!(!diags.has_errors(), "unexpected: {}", diags);
    }

    #[test]
    fn test_undeclared_local_flagged() {
        let diags = analyze_src(
            r#"
            resource "cm" {
              body = { apiVersion = "v1", metadata = { name = missing_local } }
            }
            "#,
        );
        assert!(diags.has_errors());
        assert!(messages(&diags).contains("invalid local variable reference"));
    }

    #[test]
    fn test_unknown_req_attribute_flagged() {
        let diags = analyze_src(
            r#"
            resource "cm" {
              body = { name = req.compostie.spec }
            }
            "#,
        );
        assert!(messages(&diags).contains("no such attribute \"compostie\""));
    }

    #[test]
    fn test_resource_name_references_checked() {
        let diags = analyze_src(
            r#"
            resource "cm" {
              body = { name = req.resource.other.status }
            }
            "#,
        );
        assert!(messages(&diags).contains("invalid resource name reference"));

        let diags = analyze_src(
            r#"
            resource "cm" {
              body = { name = req.resource.cm.status }
            }
            "#,
        );
        assert!(!diags.has_errors(), "unexpected: {}", diags);
    }

    #[test]
    fn test_collection_name_references_checked() {
        let diags = analyze_src(
            r#"
            resources "members" {
              for_each = [1, 2]
              template {
                body = { apiVersion = "v1" }
              }
            }
            resource "cm" {
              body = { count = length(req.resources.members) }
            }
            "#,
        );
        assert!(!diags.has_errors(), "unexpected: {}", diags);

        let diags = analyze_src(
            r#"
            resource "cm" {
              body = { count = length(req.resources.nope) }
            }
            "#,
        );
        assert!(messages(&diags).contains("invalid resource collection name reference"));
    }

    #[test]
    fn test_extra_resource_references_checked() {
        let diags = analyze_src(
            r#"
            requirement "networks" {
              select {
                apiVersion = "v1"
                kind       = "Network"
                matchName  = "net"
              }
            }
            resource "cm" {
              body = { nets = req.extra_resources.networks }
            }
            "#,
        );
        assert!(!diags.has_errors(), "unexpected: {}", diags);

        let diags = analyze_src(
            r#"
            resource "cm" {
              body = { nets = req.extra_resources.networks }
            }
            "#,
        );
        assert!(messages(&diags).contains("invalid requirement name reference"));
    }

    #[test]
    fn test_each_outside_iteration_flagged() {
        let diags = analyze_src(
            r#"
            resource "cm" {
              body = { name = each.key }
            }
            "#,
        );
        assert!(diags.has_errors());
    }

    #[test]
    fn test_each_inside_template_allowed() {
        let diags = analyze_src(
            r#"
            resources "members" {
              for_each = ["a", "b"]
              name     = "${self.basename}-${each.key}"
              template {
                body = {
                  apiVersion = "v1"
                  metadata   = { name = each.value }
                }
              }
            }
            "#,
        );
        assert!(!diags.has_errors(), "unexpected: {}", diags);
    }

    #[test]
    fn test_invalid_each_step_flagged() {
        let diags = analyze_src(
            r#"
            resources "members" {
              for_each = ["a"]
              template {
                body = { name = each.index }
              }
            }
            "#,
        );
        assert!(messages(&diags).contains("invalid each reference"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let diags = analyze_src(
            r#"
            resource "cm" {
              body = { a = 1 }
            }
            resource "cm" {
              body = { a = 2 }
            }
            "#,
        );
        assert!(messages(&diags).contains("resource defined more than once"));

        let diags = analyze_src(
            r#"
            requirement "x" {
              select {
                apiVersion = "v1"
                kind       = "K"
                matchName  = "n"
              }
            }
            requirement "x" {
              select {
                apiVersion = "v1"
                kind       = "K"
                matchName  = "n"
              }
            }
            "#,
        );
        assert!(messages(&diags).contains("requirement defined more than once"));
    }

    #[test]
    fn test_duplicates_across_files_rejected() {
        let diags = analyze(&[
            SourceFile::new("a.hcl", r#"resource "cm" { body = { a = 1 } }"#),
            SourceFile::new("b.hcl", r#"resource "cm" { body = { a = 2 } }"#),
        ]);
        assert!(messages(&diags).contains("resource defined more than once"));
    }

    #[test]
    fn test_invoke_targets_checked() {
        let diags = analyze_src(
            r#"
            function double {
              arg n {}
              body = n * 2
            }
            resource "cm" {
              body = { a = invoke("duble", { n = 1 }) }
            }
            "#,
        );
        assert!(messages(&diags).contains("\"duble\" not found"));

        let diags = analyze_src(
            r#"
            function double {
              arg n {}
              body = n * 2
            }
            resource "cm" {
              body = { a = invoke("double", { n = 1 }) }
            }
            "#,
        );
        assert!(!diags.has_errors(), "unexpected: {}", diags);
    }

    #[test]
    fn test_invoke_checked_inside_locals() {
        let diags = analyze_src(
            r#"
            locals {
              x = invoke("nope", {})
            }
            resource "cm" {
              body = { a = x }
            }
            "#,
        );
        assert!(diags.has_errors());
    }

    #[test]
    fn test_analyzer_produces_no_desired_state() {
        // analysis of a source with observed-state references succeeds
        // without a request
        let diags = analyze_src(
            r#"
            resource "cm" {
              body = {
                apiVersion = "v1"
                status     = self.resource.status
              }
            }
            "#,
        );
        assert!(!diags.has_errors(), "unexpected: {}", diags);
    }
}
