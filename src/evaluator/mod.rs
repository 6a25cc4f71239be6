//! Evaluator for the composition DSL.
//!
//! The evaluator walks the merged top-level content block by block,
//! producing desired resources, composite status and connection details,
//! context values and extra-resource requirements from a request describing
//! the observed world. Values that cannot be determined yet flow through
//! evaluation as unknowns; blocks whose output would be incomplete are
//! discarded with a warning instead of failing the run, with one deliberate
//! exception: a resource that already exists in observed state must never
//! silently vanish, so an incomplete body for it aborts the run.

pub mod builtins;
pub mod expr;
pub mod functions;
pub mod locals;
pub mod merge;
pub mod request;
pub mod scope;
pub mod value;

use std::fmt;

use hcl::expr::Expression;
use indexmap::IndexMap;

use crate::api::{
    Condition, ConditionStatus, DesiredResource, Match, Ready, Request, ResourceSelector,
    Response, ResultEntry, ResultSeverity, SourceFile, Target,
};
use crate::errors::{Diagnostic, Diagnostics, Error, Result};
use crate::schema::{
    self, Content, ATTR_API_VERSION, ATTR_BODY, ATTR_CONDITION, ATTR_FOR_EACH, ATTR_KEY,
    ATTR_KIND, ATTR_MATCH_LABELS, ATTR_MATCH_NAME, ATTR_NAME, ATTR_VALUE, BLOCK_COMPOSITE,
    BLOCK_CONTEXT, BLOCK_FUNCTION, BLOCK_GROUP, BLOCK_LOCALS, BLOCK_READY, BLOCK_REQUIREMENT,
    BLOCK_RESOURCE, BLOCK_RESOURCES, BLOCK_SELECT, BLOCK_TEMPLATE, LABEL_CONNECTION,
    LABEL_STATUS,
};

use base64::Engine;

pub use functions::FunctionSet;
pub use merge::{unify, unify_bytes, UnifyError};
pub use request::{ANNOTATION_BASE_NAME, ANNOTATION_INDEX};
pub use scope::Environment;
pub use value::{TypeHint, Value};

const MAX_DISCARDS_TO_DISPLAY: usize = 3;

/// What kind of block was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardKind {
    Resource,
    ResourceCollection,
    Group,
    CompositeStatus,
    CompositeConnection,
    Ready,
    Context,
    Requirement,
}

impl fmt::Display for DiscardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscardKind::Resource => "resource",
            DiscardKind::ResourceCollection => "resources",
            DiscardKind::Group => "group",
            DiscardKind::CompositeStatus => "composite-status",
            DiscardKind::CompositeConnection => "composite-connection",
            DiscardKind::Ready => "resource-ready",
            DiscardKind::Context => "context",
            DiscardKind::Requirement => "requirement",
        };
        f.write_str(s)
    }
}

/// Why a block was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    UserCondition,
    Incomplete,
    BadSecret,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscardReason::UserCondition => "user-condition",
            DiscardReason::Incomplete => "incomplete",
            DiscardReason::BadSecret => "bad-secret",
        };
        f.write_str(s)
    }
}

/// A record of a block whose output was suppressed, either by a user
/// condition or because its definition was incomplete.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscardItem {
    pub kind: DiscardKind,
    pub reason: DiscardReason,
    pub name: Option<String>,
    /// Source text of the expression the discard happened at.
    pub source: String,
    /// Relevant messages with more detail.
    pub context: Vec<String>,
}

impl DiscardItem {
    /// The message surfaced in results and conditions.
    pub fn message(&self) -> String {
        let mut lines = vec![match &self.name {
            Some(name) => format!("{}: discarded {} {}", self.source, self.kind, name),
            None => format!("{}: discarded {}", self.source, self.kind),
        }];
        lines.extend(self.context.iter().cloned());
        lines.join("\n")
    }

    /// The short form used in the resolution condition message.
    fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} {}", self.kind, name),
            None => self.kind.to_string(),
        }
    }
}

/// Evaluates the DSL for one request. Evaluators hold mutable state and are
/// single use: construct one per request.
#[derive(Debug, Default)]
pub struct Evaluator {
    desired_resources: IndexMap<String, serde_json::Value>,
    composite_statuses: Vec<Value>,
    composite_connections: Vec<IndexMap<String, Vec<u8>>>,
    contexts: Vec<Value>,
    ready: IndexMap<String, Ready>,
    requirements: IndexMap<String, ResourceSelector>,
    discards: Vec<DiscardItem>,
    observed_resources: IndexMap<String, Value>,
    observed_connections: IndexMap<String, Value>,
    collection_resources: IndexMap<String, Value>,
    collection_connections: IndexMap<String, Value>,
}

/// Parse all files and merge their top-level content, as though they were
/// one concatenated source.
pub(crate) fn load_content(files: &[SourceFile]) -> Result<Content> {
    let mut merged = Content::default();
    for file in files {
        tracing::debug!(name = %file.name, "parsing source file");
        let body = hcl::parse(&file.content).map_err(|source| Error::Parse {
            name: file.name.clone(),
            source,
        })?;
        let content = schema::content_of(&body, &schema::TOP_LEVEL)
            .map_err(|diags| Error::Eval(diags.sort_by_severity()))?;
        let diags = merged.merge(content);
        if diags.has_errors() {
            return Err(Error::Eval(diags.sort_by_severity()));
        }
    }
    Ok(merged)
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the supplied files against a request. File order does not
    /// matter; they are processed as one concatenated source.
    pub fn evaluate(mut self, request: &Request, files: &[SourceFile]) -> Result<Response> {
        let content = load_content(files)?;

        let functions = FunctionSet::load(&content)
            .map_err(|diags| Error::Eval(diags.sort_by_severity()))?;

        let tables = request::build(&Environment::new(), request);
        self.observed_resources = tables.observed_resources;
        self.observed_connections = tables.observed_connections;
        self.collection_resources = tables.collection_resources;
        self.collection_connections = tables.collection_connections;

        let diags = self.process_group(&tables.env, &content, &functions);
        if diags.has_errors() {
            return Err(Error::Eval(diags.sort_by_severity()));
        }

        self.into_response(diags)
    }

    /// Run static checks on the supplied files without producing desired
    /// state.
    pub fn analyze(self, files: &[SourceFile]) -> Diagnostics {
        crate::analyzer::analyze(files)
    }

    fn discard(&mut self, item: DiscardItem) {
        tracing::debug!(kind = %item.kind, reason = %item.reason, name = item.name.as_deref().unwrap_or(""), "discarding block");
        self.discards.push(item);
    }

    fn observed_resource(&self, name: &str) -> Value {
        self.observed_resources
            .get(name)
            .cloned()
            .unwrap_or_else(Value::unknown)
    }

    fn observed_connection(&self, name: &str) -> Value {
        self.observed_connections
            .get(name)
            .cloned()
            .unwrap_or_else(Value::unknown)
    }

    fn observed_collection_resources(&self, base_name: &str) -> Value {
        self.collection_resources
            .get(base_name)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()))
    }

    fn observed_collection_connections(&self, base_name: &str) -> Value {
        self.collection_connections
            .get(base_name)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()))
    }

    /// Evaluate an optional `condition` attribute. A false condition
    /// records a discard; anything but a wholly-known boolean is an error.
    fn evaluate_condition(
        &mut self,
        env: &Environment,
        content: &Content,
        functions: &FunctionSet,
        kind: DiscardKind,
        name: Option<&str>,
    ) -> std::result::Result<bool, Diagnostics> {
        let Some(cond_expr) = content.attr(ATTR_CONDITION) else {
            return Ok(true);
        };
        let (value, diags) = expr::evaluate(cond_expr, env, functions);
        if diags.has_errors() {
            return Err(diags);
        }
        match value {
            Value::Bool(true) => Ok(true),
            Value::Bool(false) => {
                self.discard(DiscardItem {
                    kind,
                    reason: DiscardReason::UserCondition,
                    name: name.map(String::from),
                    source: expr::render(cond_expr),
                    context: Vec::new(),
                });
                Ok(false)
            }
            Value::Unknown(_) => Err(Diagnostic::error("condition is not wholly known")
                .with_subject(expr::render(cond_expr))
                .into()),
            other => Err(Diagnostic::error(format!(
                "condition is not a bool, got {}",
                other.type_name()
            ))
            .with_subject(expr::render(cond_expr))
            .into()),
        }
    }

    /// Process all blocks at the top level or within one group.
    fn process_group(
        &mut self,
        env: &Environment,
        content: &Content,
        functions: &FunctionSet,
    ) -> Diagnostics {
        let (env, mut diags) = match locals::process(env, content, functions) {
            Ok(ok) => ok,
            Err(diags) => return diags,
        };

        match self.evaluate_condition(&env, content, functions, DiscardKind::Group, None) {
            Ok(true) => {}
            Ok(false) => return diags,
            Err(ds) => {
                diags.extend(ds);
                return diags;
            }
        }

        for block in &content.blocks {
            let current = match block.identifier.as_str() {
                BLOCK_GROUP => match schema::content_of(&block.body, &schema::GROUP) {
                    Ok(group_content) => self.process_group(&env, &group_content, functions),
                    Err(ds) => ds,
                },
                BLOCK_RESOURCE => self.process_resource(&env, block, functions),
                BLOCK_RESOURCES => self.process_resources(&env, block, functions),
                BLOCK_CONTEXT => self.process_context(&env, block, functions),
                BLOCK_COMPOSITE => self.process_composite(&env, block, functions),
                BLOCK_REQUIREMENT => self.process_requirement(&env, block, functions),
                // locals were handled above, functions at load time
                BLOCK_LOCALS | BLOCK_FUNCTION => Diagnostics::new(),
                other => Diagnostics::single_error(format!("unsupported block type {:?}", other)),
            };
            let failed = current.has_errors();
            diags.extend(current);
            if failed {
                return diags;
            }
        }
        diags
    }

    fn process_resource(
        &mut self,
        env: &Environment,
        block: &hcl::Block,
        functions: &FunctionSet,
    ) -> Diagnostics {
        let name = schema::block_label(block).unwrap_or_default().to_string();
        let content = match schema::content_of(&block.body, &schema::RESOURCE) {
            Ok(content) => content,
            Err(diags) => return diags,
        };
        self.add_resource(env, functions, &name, &content, None)
    }

    /// Emit one resource from the supplied content. Used for standalone
    /// `resource` blocks and for each iteration of a collection.
    fn add_resource(
        &mut self,
        env: &Environment,
        functions: &FunctionSet,
        name: &str,
        content: &Content,
        annotations: Option<&IndexMap<String, String>>,
    ) -> Diagnostics {
        if self.desired_resources.contains_key(name) {
            return Diagnostics::single_error(format!("duplicate resource {:?}", name));
        }

        let mut self_vars = IndexMap::new();
        self_vars.insert("name".to_string(), Value::String(name.to_string()));
        self_vars.insert("resource".to_string(), self.observed_resource(name));
        self_vars.insert("connection".to_string(), self.observed_connection(name));
        let env = env.child_with_self(self_vars);

        let (env, mut diags) = match locals::process(&env, content, functions) {
            Ok(ok) => ok,
            Err(diags) => return diags,
        };

        match self.evaluate_condition(&env, content, functions, DiscardKind::Resource, Some(name)) {
            Ok(true) => {}
            Ok(false) => return diags,
            Err(ds) => {
                diags.extend(ds);
                return diags;
            }
        }

        let body_expr = content
            .attr(ATTR_BODY)
            .expect("resource schema requires a body attribute");
        let (value, ds) = expr::evaluate(body_expr, &env, functions);

        if ds.has_errors() || !value.is_wholly_known() {
            return self.handle_incomplete_resource(&env, name, body_expr, ds, diags);
        }
        diags.extend(ds);

        let mut value = value;
        if let Some(annotations) = annotations {
            if let Err(diag) = apply_annotations(&mut value, annotations) {
                diags.push(diag.with_subject(expr::render(body_expr)));
                return diags;
            }
        }
        if value.as_object().is_none() {
            diags.push(
                Diagnostic::error(format!(
                    "resource body is not an object, got {}",
                    value.type_name()
                ))
                .with_subject(expr::render(body_expr)),
            );
            return diags;
        }

        tracing::trace!(name, "installing desired resource");
        self.desired_resources
            .insert(name.to_string(), value.to_json());

        for block in &content.blocks {
            let current = match block.identifier.as_str() {
                BLOCK_COMPOSITE => self.process_composite(&env, block, functions),
                BLOCK_READY => self.process_ready(&env, name, block, functions),
                BLOCK_CONTEXT => self.process_context(&env, block, functions),
                _ => Diagnostics::new(),
            };
            let failed = current.has_errors();
            diags.extend(current);
            if failed {
                return diags;
            }
        }
        diags
    }

    /// Decide what to do with a resource body that failed to evaluate or is
    /// not wholly known: abort if the resource already exists in observed
    /// state, otherwise discard it and carry on.
    fn handle_incomplete_resource(
        &mut self,
        env: &Environment,
        name: &str,
        body_expr: &Expression,
        ds: Diagnostics,
        mut diags: Diagnostics,
    ) -> Diagnostics {
        let context_msgs = ds.messages();
        let soft = ds.downgrade_incomplete();

        // name the unknown sub-values to assist debugging: resolve every
        // root reference of the body and walk it for unknown paths
        let mut incomplete_vars = Vec::new();
        for var in expr::variables(body_expr) {
            match var.resolve(env) {
                Some(value) => {
                    let paths = value.unknown_paths();
                    if paths.is_empty() && !value.is_wholly_known() {
                        incomplete_vars.push(var.text.clone());
                    }
                    for path in paths {
                        incomplete_vars.push(format!("{}{}", var.text, path));
                    }
                }
                None => incomplete_vars.push(var.text.clone()),
            }
        }
        let unknown = incomplete_vars.join(", ");

        if self.observed_resources.contains_key(name) {
            diags.extend(soft);
            diags.push(
                Diagnostic::error(format!(
                    "existing resource {} could not be evaluated, abort (unknown values: {})",
                    name, unknown
                ))
                .with_subject(expr::render(body_expr)),
            );
            return diags;
        }

        if soft.has_errors() {
            diags.extend(soft);
            return diags;
        }

        let mut context = context_msgs;
        context.push(format!("unknown values: {}", unknown));
        self.discard(DiscardItem {
            kind: DiscardKind::Resource,
            reason: DiscardReason::Incomplete,
            name: Some(name.to_string()),
            source: expr::render(body_expr),
            context,
        });
        diags.extend(soft);
        diags
    }

    fn process_resources(
        &mut self,
        env: &Environment,
        block: &hcl::Block,
        functions: &FunctionSet,
    ) -> Diagnostics {
        let base_name = schema::block_label(block).unwrap_or_default().to_string();
        let content = match schema::content_of(&block.body, &schema::RESOURCES) {
            Ok(content) => content,
            Err(diags) => return diags,
        };

        let mut template_blocks = content.blocks_of(BLOCK_TEMPLATE);
        let template_block = match (template_blocks.next(), template_blocks.next()) {
            (Some(template), None) => template,
            (Some(_), Some(_)) => {
                return Diagnostics::single_error(format!(
                    "multiple template blocks for resource collection {}",
                    base_name
                ));
            }
            (None, _) => {
                return Diagnostics::single_error(format!(
                    "no template block for resource collection {}",
                    base_name
                ));
            }
        };
        let template_content = match schema::content_of(&template_block.body, &schema::TEMPLATE) {
            Ok(content) => content,
            Err(diags) => return diags,
        };

        let mut self_vars = IndexMap::new();
        self_vars.insert(
            "basename".to_string(),
            Value::String(base_name.clone()),
        );
        self_vars.insert(
            "resources".to_string(),
            self.observed_collection_resources(&base_name),
        );
        self_vars.insert(
            "connections".to_string(),
            self.observed_collection_connections(&base_name),
        );
        let env = env.child_with_self(self_vars);

        let (env, mut diags) = match locals::process(&env, &content, functions) {
            Ok(ok) => ok,
            Err(diags) => return diags,
        };

        match self.evaluate_condition(
            &env,
            &content,
            functions,
            DiscardKind::ResourceCollection,
            Some(&base_name),
        ) {
            Ok(true) => {}
            Ok(false) => return diags,
            Err(ds) => {
                diags.extend(ds);
                return diags;
            }
        }

        let for_each_expr = content
            .attr(ATTR_FOR_EACH)
            .expect("resources schema requires for_each");
        let (for_each, ds) = expr::evaluate(for_each_expr, &env, functions);
        if ds.has_errors() {
            diags.extend(ds);
            diags.push(Diagnostic::error(format!(
                "unable to evaluate for_each for resource collection {}",
                base_name
            )));
            return diags;
        }
        diags.extend(ds);

        let iterations = match extract_iterations(&for_each) {
            Ok(iterations) => iterations,
            Err(diag) => {
                diags.push(diag.with_subject(expr::render(for_each_expr)));
                return diags;
            }
        };

        let default_name;
        let name_expr = match content.attr(ATTR_NAME) {
            Some(name_expr) => name_expr,
            None => {
                default_name = default_name_expr();
                &default_name
            }
        };

        for (i, (key, value)) in iterations.into_iter().enumerate() {
            let mut each = IndexMap::new();
            each.insert("key".to_string(), key);
            each.insert("value".to_string(), value);
            let mut bindings = IndexMap::new();
            bindings.insert(scope::ITERATOR_NAME.to_string(), Value::Object(each));
            let iter_env = env.child_with(bindings);

            let (name_value, ds) = expr::evaluate(name_expr, &iter_env, functions);
            if ds.has_errors() {
                diags.extend(ds);
                diags.push(Diagnostic::error(format!(
                    "unable to evaluate name expression for resource collection {}",
                    base_name
                )));
                return diags;
            }
            diags.extend(ds);
            let name = match name_value {
                Value::String(name) => name,
                _ => {
                    diags.push(
                        Diagnostic::error(format!(
                            "name produced from evaluating the name expression for collection {} was not a string",
                            base_name
                        ))
                        .with_subject(expr::render(name_expr)),
                    );
                    return diags;
                }
            };

            let mut annotations = IndexMap::new();
            annotations.insert(ANNOTATION_BASE_NAME.to_string(), base_name.clone());
            annotations.insert(ANNOTATION_INDEX.to_string(), format!("s{:06}", i));

            let current =
                self.add_resource(&iter_env, functions, &name, &template_content, Some(&annotations));
            let failed = current.has_errors();
            diags.extend(current);
            if failed {
                return diags;
            }
        }

        // composite and context blocks run once in the collection's scope
        for block in &content.blocks {
            let current = match block.identifier.as_str() {
                BLOCK_COMPOSITE => self.process_composite(&env, block, functions),
                BLOCK_CONTEXT => self.process_context(&env, block, functions),
                _ => Diagnostics::new(),
            };
            let failed = current.has_errors();
            diags.extend(current);
            if failed {
                return diags;
            }
        }
        diags
    }

    fn process_composite(
        &mut self,
        env: &Environment,
        block: &hcl::Block,
        functions: &FunctionSet,
    ) -> Diagnostics {
        let label = schema::block_label(block).unwrap_or_default().to_string();
        let content = match schema::content_of(&block.body, &schema::COMPOSITE) {
            Ok(content) => content,
            Err(diags) => return diags,
        };
        let (env, mut diags) = match locals::process(env, &content, functions) {
            Ok(ok) => ok,
            Err(diags) => return diags,
        };

        let body_expr = content
            .attr(ATTR_BODY)
            .expect("composite schema requires a body attribute");

        match label.as_str() {
            LABEL_STATUS => {
                let Some(value) =
                    self.evaluate_output(&env, functions, body_expr, DiscardKind::CompositeStatus, &mut diags)
                else {
                    return diags;
                };
                if value.as_object().is_none() {
                    diags.push(
                        Diagnostic::error(format!(
                            "composite status is not an object, got {}",
                            value.type_name()
                        ))
                        .with_subject(expr::render(body_expr)),
                    );
                    return diags;
                }
                self.composite_statuses.push(value);
            }
            LABEL_CONNECTION => {
                self.add_connection_details(&env, functions, body_expr, &mut diags);
            }
            other => {
                diags.push(Diagnostic::error(format!(
                    "invalid composite label: {}",
                    other
                )));
            }
        }
        diags
    }

    fn add_connection_details(
        &mut self,
        env: &Environment,
        functions: &FunctionSet,
        body_expr: &Expression,
        diags: &mut Diagnostics,
    ) {
        let Some(value) = self.evaluate_output(
            env,
            functions,
            body_expr,
            DiscardKind::CompositeConnection,
            diags,
        ) else {
            return;
        };
        let Some(map) = value.as_object() else {
            diags.push(
                Diagnostic::error(format!(
                    "composite connection is not an object, got {}",
                    value.type_name()
                ))
                .with_subject(expr::render(body_expr)),
            );
            return;
        };

        let mut values: IndexMap<String, Vec<u8>> = IndexMap::new();
        let mut has_discards = false;
        for (key, entry) in map {
            let Some(encoded) = entry.as_str() else {
                diags.push(Diagnostic::error(format!(
                    "connection key {:?} was not a string, got {}",
                    key,
                    entry.type_name()
                )));
                // keep going to collect further problems
                continue;
            };
            match base64::engine::general_purpose::STANDARD.decode(encoded.as_bytes()) {
                Ok(bytes) => {
                    values.insert(key.clone(), bytes);
                }
                // do not print the value, it could be a secret in plain text
                Err(_) => {
                    self.discard(DiscardItem {
                        kind: DiscardKind::CompositeConnection,
                        reason: DiscardReason::BadSecret,
                        name: Some(key.clone()),
                        source: expr::render(body_expr),
                        context: vec![format!(
                            "connection secret key {:?} not in base64 format",
                            key
                        )],
                    });
                    diags.push(Diagnostic::warning(format!(
                        "connection secret key {:?} not in base64 format",
                        key
                    )));
                    has_discards = true;
                }
            }
        }
        if has_discards || diags.has_errors() {
            return;
        }
        self.composite_connections.push(values);
    }

    /// Evaluate an output expression that may legitimately be incomplete.
    /// `None` means the value was discarded (warnings recorded) or a hard
    /// error occurred (errors recorded).
    fn evaluate_output(
        &mut self,
        env: &Environment,
        functions: &FunctionSet,
        expression: &Expression,
        kind: DiscardKind,
        diags: &mut Diagnostics,
    ) -> Option<Value> {
        let (value, ds) = expr::evaluate(expression, env, functions);
        if ds.has_errors() || !value.is_wholly_known() {
            let context = ds.messages();
            let soft = ds.downgrade_incomplete();
            let hard_failure = soft.has_errors();
            diags.extend(soft);
            if !hard_failure {
                self.discard(DiscardItem {
                    kind,
                    reason: DiscardReason::Incomplete,
                    name: None,
                    source: expr::render(expression),
                    context,
                });
            }
            return None;
        }
        diags.extend(ds);
        Some(value)
    }

    fn process_context(
        &mut self,
        env: &Environment,
        block: &hcl::Block,
        functions: &FunctionSet,
    ) -> Diagnostics {
        let content = match schema::content_of(&block.body, &schema::CONTEXT) {
            Ok(content) => content,
            Err(diags) => return diags,
        };
        let (env, mut diags) = match locals::process(env, &content, functions) {
            Ok(ok) => ok,
            Err(diags) => return diags,
        };

        let key_expr = content
            .attr(ATTR_KEY)
            .expect("context schema requires a key attribute");
        let (key, ds) = expr::evaluate(key_expr, &env, functions);
        if ds.has_errors() {
            diags.extend(ds);
            diags.push(
                Diagnostic::error("unable to evaluate context key")
                    .with_subject(expr::render(key_expr)),
            );
            return diags;
        }
        diags.extend(ds);
        let key = match key {
            Value::String(key) => key,
            Value::Unknown(_) => {
                diags.push(
                    Diagnostic::error("context key is unknown")
                        .with_subject(expr::render(key_expr)),
                );
                return diags;
            }
            other => {
                diags.push(
                    Diagnostic::error(format!(
                        "context key was not a string, got {}",
                        other.type_name()
                    ))
                    .with_subject(expr::render(key_expr)),
                );
                return diags;
            }
        };

        let value_expr = content
            .attr(ATTR_VALUE)
            .expect("context schema requires a value attribute");
        let Some(value) =
            self.evaluate_output(&env, functions, value_expr, DiscardKind::Context, &mut diags)
        else {
            return diags;
        };

        let mut entry = IndexMap::new();
        entry.insert(key, value);
        self.contexts.push(Value::Object(entry));
        diags
    }

    fn process_ready(
        &mut self,
        env: &Environment,
        resource_name: &str,
        block: &hcl::Block,
        functions: &FunctionSet,
    ) -> Diagnostics {
        let content = match schema::content_of(&block.body, &schema::READY) {
            Ok(content) => content,
            Err(diags) => return diags,
        };
        let (env, mut diags) = match locals::process(env, &content, functions) {
            Ok(ok) => ok,
            Err(diags) => return diags,
        };

        let value_expr = content
            .attr(ATTR_VALUE)
            .expect("ready schema requires a value attribute");
        let (value, ds) = expr::evaluate(value_expr, &env, functions);
        if ds.has_errors() || !value.is_wholly_known() {
            let context = ds.messages();
            let soft = ds.downgrade_incomplete();
            let hard_failure = soft.has_errors();
            diags.extend(soft);
            if !hard_failure {
                self.discard(DiscardItem {
                    kind: DiscardKind::Ready,
                    reason: DiscardReason::Incomplete,
                    name: Some(resource_name.to_string()),
                    source: expr::render(value_expr),
                    context,
                });
            }
            return diags;
        }
        diags.extend(ds);

        let Some(name) = value.as_str() else {
            diags.push(
                Diagnostic::error(format!(
                    "ready value for {} is not a string, got {}",
                    resource_name,
                    value.type_name()
                ))
                .with_subject(expr::render(value_expr)),
            );
            return diags;
        };
        let Some(ready) = Ready::from_name(name) else {
            diags.push(
                Diagnostic::error(format!(
                    "ready value for {} is invalid, must be one of {}",
                    resource_name,
                    Ready::NAMES.join(", ")
                ))
                .with_subject(expr::render(value_expr)),
            );
            return diags;
        };
        self.ready.insert(resource_name.to_string(), ready);
        diags
    }

    fn process_requirement(
        &mut self,
        env: &Environment,
        block: &hcl::Block,
        functions: &FunctionSet,
    ) -> Diagnostics {
        let name = schema::block_label(block).unwrap_or_default().to_string();
        if self.requirements.contains_key(&name) {
            return Diagnostic::error("multiple requirements with name")
                .with_detail(name)
                .into();
        }

        let content = match schema::content_of(&block.body, &schema::REQUIREMENT) {
            Ok(content) => content,
            Err(diags) => return diags,
        };

        let mut select_blocks = content.blocks_of(BLOCK_SELECT);
        let select_block = match (select_blocks.next(), select_blocks.next()) {
            (Some(select), None) => select,
            (Some(_), Some(_)) => {
                return Diagnostic::error("multiple select blocks in requirement")
                    .with_detail(name)
                    .into();
            }
            (None, _) => {
                return Diagnostic::error("no select block in requirement")
                    .with_detail(name)
                    .into();
            }
        };
        let select = match schema::content_of(&select_block.body, &schema::SELECT) {
            Ok(content) => content,
            Err(diags) => return diags,
        };

        let match_name = select.attr(ATTR_MATCH_NAME);
        let match_labels = select.attr(ATTR_MATCH_LABELS);
        match (match_name.is_some(), match_labels.is_some()) {
            (true, true) => {
                return Diagnostic::error(
                    "requirement selector has both matchName and matchLabels",
                )
                .with_detail(name)
                .into();
            }
            (false, false) => {
                return Diagnostic::error(
                    "requirement selector has neither matchName nor matchLabels",
                )
                .with_detail(name)
                .into();
            }
            _ => {}
        }

        let (env, mut diags) = match locals::process(env, &content, functions) {
            Ok(ok) => ok,
            Err(diags) => return diags,
        };

        match self.evaluate_condition(
            &env,
            &content,
            functions,
            DiscardKind::Requirement,
            Some(&name),
        ) {
            Ok(true) => {}
            Ok(false) => return diags,
            Err(ds) => {
                diags.extend(ds);
                return diags;
            }
        }

        // evaluate the selector parts; any incomplete part discards the
        // whole requirement without failing the run
        let mut incomplete = false;
        let selector_string = |expression: &Expression,
                                   what: &str,
                                   diags: &mut Diagnostics,
                                   incomplete: &mut bool|
         -> Option<String> {
            let (value, ds) = expr::evaluate(expression, &env, functions);
            let soft = ds.downgrade_incomplete();
            if soft.has_errors() {
                diags.extend(soft);
                return None;
            }
            match value {
                Value::String(s) => {
                    diags.extend(soft);
                    Some(s)
                }
                Value::Unknown(_) => {
                    diags.extend(soft);
                    *incomplete = true;
                    None
                }
                other => {
                    diags.extend(soft);
                    diags.push(
                        Diagnostic::error(format!(
                            "{} in requirement selector was not a string, got {}",
                            what,
                            other.type_name()
                        ))
                        .with_detail(name.clone()),
                    );
                    None
                }
            }
        };

        let api_version_expr = select
            .attr(ATTR_API_VERSION)
            .expect("select schema requires apiVersion");
        let kind_expr = select.attr(ATTR_KIND).expect("select schema requires kind");

        let api_version = selector_string(api_version_expr, "api version", &mut diags, &mut incomplete);
        let kind = selector_string(kind_expr, "kind", &mut diags, &mut incomplete);

        let match_ = if let Some(match_name_expr) = match_name {
            selector_string(match_name_expr, "matchName", &mut diags, &mut incomplete)
                .map(Match::Name)
        } else {
            let labels_expr = match_labels.expect("one of the two match forms is present");
            selector_labels(&env, functions, &name, labels_expr, &mut diags, &mut incomplete)
                .map(Match::Labels)
        };

        match (api_version, kind, match_) {
            (Some(api_version), Some(kind), Some(match_)) => {
                self.requirements.insert(
                    name,
                    ResourceSelector {
                        api_version,
                        kind,
                        match_,
                    },
                );
            }
            _ => {
                if incomplete && !diags.has_errors() {
                    self.discard(DiscardItem {
                        kind: DiscardKind::Requirement,
                        reason: DiscardReason::Incomplete,
                        name: Some(name),
                        source: expr::render(
                            select.attr(ATTR_MATCH_NAME).or(select.attr(ATTR_MATCH_LABELS)).unwrap_or(api_version_expr),
                        ),
                        context: Vec::new(),
                    });
                }
            }
        }
        diags
    }

    /// Build the response from accumulated state.
    fn into_response(self, diags: Diagnostics) -> Result<Response> {
        let mut response = Response::default();

        for (name, resource) in self.desired_resources {
            response
                .desired
                .resources
                .insert(name, DesiredResource { resource, ready: Ready::Unspecified });
        }
        for (name, ready) in &self.ready {
            response
                .desired
                .resources
                .get_mut(name)
                .expect("readiness recorded for a resource that was never installed")
                .ready = *ready;
        }

        if !self.composite_statuses.is_empty() {
            let merged = unify(&self.composite_statuses).map_err(|err| Error::Assembly {
                context: "unify composite status".into(),
                message: err.to_string(),
            })?;
            let mut status = serde_json::Map::new();
            status.insert("status".into(), merged.to_json());
            response
                .desired
                .composite
                .get_or_insert_with(Default::default)
                .resource = Some(serde_json::Value::Object(status));
        }

        if !self.composite_connections.is_empty() {
            let merged = unify_bytes(&self.composite_connections).map_err(|err| Error::Assembly {
                context: "unify composite connection".into(),
                message: err.to_string(),
            })?;
            response
                .desired
                .composite
                .get_or_insert_with(Default::default)
                .connection_details = merged;
        }

        if !self.contexts.is_empty() {
            let merged = unify(&self.contexts).map_err(|err| Error::Assembly {
                context: "unify context".into(),
                message: err.to_string(),
            })?;
            response.context = Some(merged.to_json());
        }

        response.requirements = self.requirements;

        let mut displayed = Vec::new();
        for item in &self.discards {
            if item.reason == DiscardReason::UserCondition {
                continue;
            }
            response.results.push(ResultEntry {
                severity: ResultSeverity::Warning,
                message: item.message(),
                target: Target::Composite,
                reason: item.reason.to_string(),
            });
            if displayed.len() < MAX_DISCARDS_TO_DISPLAY {
                displayed.push(item.label());
            }
        }

        let message = if displayed.is_empty() {
            "all items complete".to_string()
        } else {
            let mut message = displayed.join(", ");
            if response.results.len() > MAX_DISCARDS_TO_DISPLAY {
                message.push_str(&format!(
                    " and {} more items incomplete",
                    response.results.len() - MAX_DISCARDS_TO_DISPLAY
                ));
            } else {
                message.push_str(" incomplete");
            }
            message
        };
        let (status, reason) = if response.results.is_empty() {
            (ConditionStatus::True, "AllItemsProcessed")
        } else {
            (ConditionStatus::False, "IncompleteItemsPresent")
        };
        response.conditions.push(Condition {
            type_: "FullyResolved".into(),
            status,
            reason: reason.into(),
            message,
            target: Target::Composite,
        });

        let summaries = diags.warning_summaries();
        if summaries.is_empty() {
            response.results.push(ResultEntry {
                severity: ResultSeverity::Normal,
                message: "no warnings".into(),
                target: Target::Composite,
                reason: "HclDiagnostics".into(),
            });
            response.conditions.push(Condition {
                type_: "HclDiagnostics".into(),
                status: ConditionStatus::True,
                reason: "Eval".into(),
                message: "diagnostics contain no warnings".into(),
                target: Target::Composite,
            });
        } else {
            response.results.push(ResultEntry {
                severity: ResultSeverity::Warning,
                message: format!("warnings: [{}]", summaries.join("; ")),
                target: Target::Composite,
                reason: "HclDiagnostics".into(),
            });
            response.conditions.push(Condition {
                type_: "HclDiagnostics".into(),
                status: ConditionStatus::False,
                reason: "Eval".into(),
                message: format!(
                    "diagnostics contain {} warnings; {}",
                    summaries.len(),
                    summaries.join("; ")
                ),
                target: Target::Composite,
            });
        }

        Ok(response)
    }
}

/// Evaluate a `matchLabels` selector attribute into a string map. `None`
/// with `incomplete` set means the selector is waiting on unknown values.
fn selector_labels(
    env: &Environment,
    functions: &FunctionSet,
    name: &str,
    labels_expr: &Expression,
    diags: &mut Diagnostics,
    incomplete: &mut bool,
) -> Option<IndexMap<String, String>> {
    let (value, ds) = expr::evaluate(labels_expr, env, functions);
    let soft = ds.downgrade_incomplete();
    if soft.has_errors() {
        diags.extend(soft);
        return None;
    }
    diags.extend(soft);
    if !value.is_wholly_known() {
        *incomplete = true;
        return None;
    }
    let Some(map) = value.as_object() else {
        diags.push(
            Diagnostic::error("matchLabels in requirement selector was not an object")
                .with_detail(name.to_string()),
        );
        return None;
    };
    let mut labels = IndexMap::new();
    for (key, label) in map {
        let Some(label) = label.as_str() else {
            diags.push(
                Diagnostic::error(format!(
                    "match label {:?} in requirement selector was not a string",
                    key
                ))
                .with_detail(name.to_string()),
            );
            return None;
        };
        labels.insert(key.clone(), label.to_string());
    }
    Some(labels)
}

/// Add the collection annotations to a resource body, creating `metadata`
/// and `metadata.annotations` if missing.
fn apply_annotations(
    value: &mut Value,
    annotations: &IndexMap<String, String>,
) -> std::result::Result<(), Diagnostic> {
    let body = match value {
        Value::Object(map) => map,
        other => {
            return Err(Diagnostic::error(format!(
                "resource body is not an object, got {}",
                other.type_name()
            )));
        }
    };
    let metadata = match body
        .entry("metadata".to_string())
        .or_insert_with(|| Value::Object(IndexMap::new()))
    {
        Value::Object(map) => map,
        other => {
            return Err(Diagnostic::error(format!(
                "expected metadata to be an object, got {}",
                other.type_name()
            )));
        }
    };
    let annotations_map = match metadata
        .entry("annotations".to_string())
        .or_insert_with(|| Value::Object(IndexMap::new()))
    {
        Value::Object(map) => map,
        other => {
            return Err(Diagnostic::error(format!(
                "expected annotations to be an object, got {}",
                other.type_name()
            )));
        }
    };
    for (key, annotation) in annotations {
        annotations_map.insert(key.clone(), Value::String(annotation.clone()));
    }
    Ok(())
}

/// The iteration key/value pairs of a `for_each` value.
fn extract_iterations(for_each: &Value) -> std::result::Result<Vec<(Value, Value)>, Diagnostic> {
    if for_each.is_null() || !for_each.is_wholly_known() {
        return Err(Diagnostic::error("for_each value is null or unknown"));
    }
    match for_each {
        Value::Array(items) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, item)| (Value::Int(i as i64), item.clone()))
            .collect()),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(key, item)| (Value::String(key.clone()), item.clone()))
            .collect()),
        other => Err(Diagnostic::error(format!(
            "for_each value is not iterable, found type {}",
            other.type_name()
        ))),
    }
}

/// The default collection member name: `${self.basename}-${each.key}`.
fn default_name_expr() -> Expression {
    let body = hcl::parse(r#"name = "${self.basename}-${each.key}""#)
        .expect("default name template parses");
    body.into_attributes()
        .next()
        .expect("default name template has one attribute")
        .expr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluate_src(src: &str, request: &Request) -> Result<Response> {
        Evaluator::new().evaluate(request, &[SourceFile::new("test.hcl", src)])
    }

    #[test]
    fn test_empty_source_produces_clean_response() {
        let response = evaluate_src("", &Request::default()).unwrap();
        assert!(response.desired.resources.is_empty());
        let resolved = response.condition("FullyResolved").unwrap();
        assert_eq!(resolved.status, ConditionStatus::True);
        assert_eq!(resolved.reason, "AllItemsProcessed");
        assert_eq!(resolved.message, "all items complete");
        let diag = response.condition("HclDiagnostics").unwrap();
        assert_eq!(diag.status, ConditionStatus::True);
    }

    #[test]
    fn test_simple_resource() {
        let src = r#"
            resource "cm" {
              body = {
                apiVersion = "v1"
                kind       = "ConfigMap"
                metadata   = { name = "cm" }
              }
            }
        "#;
        let response = evaluate_src(src, &Request::default()).unwrap();
        assert_eq!(response.desired.resources.len(), 1);
        let resource = &response.desired.resources["cm"];
        assert_eq!(resource.resource["kind"], "ConfigMap");
        assert_eq!(resource.ready, Ready::Unspecified);
    }

    #[test]
    fn test_user_condition_discard_is_silent() {
        let src = r#"
            resource "cm" {
              condition = false
              body      = { apiVersion = "v1", kind = "ConfigMap" }
            }
        "#;
        let response = evaluate_src(src, &Request::default()).unwrap();
        assert!(response.desired.resources.is_empty());
        // user-condition discards produce no results
        let resolved = response.condition("FullyResolved").unwrap();
        assert_eq!(resolved.status, ConditionStatus::True);
    }

    #[test]
    fn test_non_boolean_condition_is_fatal() {
        let src = r#"
            resource "cm" {
              condition = "yes"
              body      = { apiVersion = "v1" }
            }
        "#;
        let err = evaluate_src(src, &Request::default()).unwrap_err();
        assert!(err.to_string().contains("condition is not a bool"));
    }

    #[test]
    fn test_duplicate_resource_name_is_fatal() {
        let src = r#"
            resource "cm" {
              body = { apiVersion = "v1" }
            }
            resource "cm" {
              body = { apiVersion = "v1" }
            }
        "#;
        let err = evaluate_src(src, &Request::default()).unwrap_err();
        assert!(err.to_string().contains("duplicate resource"));
    }

    #[test]
    fn test_group_scoping_and_nesting() {
        let src = r#"
            group {
              locals {
                app = "web"
              }
              resource "cm" {
                body = {
                  apiVersion = "v1"
                  kind       = "ConfigMap"
                  metadata   = { name = app }
                }
              }
            }
        "#;
        let response = evaluate_src(src, &Request::default()).unwrap();
        assert_eq!(
            response.desired.resources["cm"].resource["metadata"]["name"],
            "web"
        );
    }

    #[test]
    fn test_ready_block() {
        let src = r#"
            resource "cm" {
              body = { apiVersion = "v1", kind = "ConfigMap" }
              ready {
                value = "READY_TRUE"
              }
            }
        "#;
        let response = evaluate_src(src, &Request::default()).unwrap();
        assert_eq!(response.desired.resources["cm"].ready, Ready::True);
    }

    #[test]
    fn test_invalid_ready_value_is_fatal() {
        let src = r#"
            resource "cm" {
              body = { apiVersion = "v1" }
              ready {
                value = "NOT_A_READY"
              }
            }
        "#;
        let err = evaluate_src(src, &Request::default()).unwrap_err();
        assert!(err.to_string().contains("must be one of"));
    }

    #[test]
    fn test_requirement_block() {
        let src = r#"
            requirement "networks" {
              select {
                apiVersion = "example.org/v1"
                kind       = "Network"
                matchLabels = { tier = "prod" }
              }
            }
        "#;
        let response = evaluate_src(src, &Request::default()).unwrap();
        let selector = &response.requirements["networks"];
        assert_eq!(selector.api_version, "example.org/v1");
        assert_eq!(selector.kind, "Network");
        match &selector.match_ {
            Match::Labels(labels) => assert_eq!(labels.get("tier"), Some(&"prod".to_string())),
            other => panic!("expected labels match, got {:?}", other),
        }
    }

    #[test]
    fn test_requirement_with_both_matchers_is_fatal() {
        let src = r#"
            requirement "networks" {
              select {
                apiVersion  = "example.org/v1"
                kind        = "Network"
                matchName   = "net-0"
                matchLabels = { tier = "prod" }
              }
            }
        "#;
        let err = evaluate_src(src, &Request::default()).unwrap_err();
        assert!(err.to_string().contains("both matchName and matchLabels"));
    }

    #[test]
    fn test_incomplete_requirement_is_discarded() {
        let src = r#"
            requirement "networks" {
              select {
                apiVersion = "example.org/v1"
                kind       = "Network"
                matchName  = req.composite.spec.networkRef
              }
            }
        "#;
        let response = evaluate_src(src, &Request::default()).unwrap();
        assert!(response.requirements.is_empty());
        let resolved = response.condition("FullyResolved").unwrap();
        assert_eq!(resolved.status, ConditionStatus::False);
        assert!(resolved.message.contains("requirement networks"));
    }

    #[test]
    fn test_context_block() {
        let src = r#"
            context {
              key   = "region"
              value = { name = "eu-west-1" }
            }
        "#;
        let response = evaluate_src(src, &Request::default()).unwrap();
        let context = response.context.unwrap();
        assert_eq!(context["region"]["name"], "eu-west-1");
    }

    #[test]
    fn test_unknown_context_key_is_fatal() {
        let src = r#"
            context {
              key   = req.composite.spec.missing
              value = 1
            }
        "#;
        let err = evaluate_src(src, &Request::default()).unwrap_err();
        assert!(err.to_string().contains("context key"));
    }

    #[test]
    fn test_extract_iterations() {
        let list = Value::Array(vec![Value::String("a".into())]);
        let iterations = extract_iterations(&list).unwrap();
        assert_eq!(
            iterations,
            vec![(Value::Int(0), Value::String("a".into()))]
        );

        let mut map = IndexMap::new();
        map.insert("k".to_string(), Value::Int(1));
        let iterations = extract_iterations(&Value::Object(map)).unwrap();
        assert_eq!(
            iterations,
            vec![(Value::String("k".into()), Value::Int(1))]
        );

        assert!(extract_iterations(&Value::Null).is_err());
        assert!(extract_iterations(&Value::unknown()).is_err());
        assert!(extract_iterations(&Value::Int(3)).is_err());
    }

    #[test]
    fn test_apply_annotations_creates_missing_metadata() {
        let mut value = Value::Object(IndexMap::new());
        let mut annotations = IndexMap::new();
        annotations.insert(ANNOTATION_BASE_NAME.to_string(), "web".to_string());
        apply_annotations(&mut value, &annotations).unwrap();
        let json = value.to_json();
        assert_eq!(json["metadata"]["annotations"][ANNOTATION_BASE_NAME], "web");
    }

    #[test]
    fn test_discard_message_format() {
        let item = DiscardItem {
            kind: DiscardKind::Resource,
            reason: DiscardReason::Incomplete,
            name: Some("web".into()),
            source: "{ a = req.x }".into(),
            context: vec!["unknown values: req.x".into()],
        };
        assert_eq!(
            item.message(),
            "{ a = req.x }: discarded resource web\nunknown values: req.x"
        );
    }
}
