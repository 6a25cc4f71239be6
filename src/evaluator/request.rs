//! Building the `req` namespace and the observed-state lookup tables from a
//! request.
//!
//! Observed resources carrying the collection annotations are pulled out of
//! the flat `req.resource` map and regrouped into ordered tuples under
//! `req.resources`, sorted by their index annotation. Keeping collection
//! members out of the flat map lets the analyzer check plain resource name
//! references precisely.

use base64::Engine;
use indexmap::IndexMap;

use crate::api::Request;

use super::scope::{Environment, RESERVED_REQ};
use super::value::Value;

/// Annotations written on desired collection members and read back from
/// observed ones.
pub const ANNOTATION_BASE_NAME: &str = "hcl.fn.crossplane.io/collection-base-name";
pub const ANNOTATION_INDEX: &str = "hcl.fn.crossplane.io/collection-index";

// keys under req
const REQ_CONTEXT: &str = "context";
const REQ_COMPOSITE: &str = "composite";
const REQ_COMPOSITE_CONNECTION: &str = "composite_connection";
const REQ_RESOURCE: &str = "resource";
const REQ_CONNECTION: &str = "connection";
const REQ_RESOURCES: &str = "resources";
const REQ_CONNECTIONS: &str = "connections";
const REQ_EXTRA_RESOURCES: &str = "extra_resources";

/// The initial environment plus the lookup tables the block processors
/// consult while evaluating.
#[derive(Debug)]
pub struct RequestEnv {
    pub env: Environment,
    pub observed_resources: IndexMap<String, Value>,
    pub observed_connections: IndexMap<String, Value>,
    pub collection_resources: IndexMap<String, Value>,
    pub collection_connections: IndexMap<String, Value>,
}

/// Build the `req` namespace from a request on top of the supplied parent
/// environment.
pub fn build(parent: &Environment, request: &Request) -> RequestEnv {
    let mut observed_resources = IndexMap::new();
    let mut observed_connections = IndexMap::new();
    for (name, observed) in &request.observed.resources {
        observed_resources.insert(name.clone(), resource_value(&observed.resource));
        observed_connections.insert(name.clone(), connection_value(&observed.connection_details));
    }

    // regroup collection members, ordered by the index annotation
    let mut collection_resources = IndexMap::new();
    let mut collection_connections = IndexMap::new();
    for (base_name, names) in collection_members(&observed_resources) {
        let mut resources = Vec::with_capacity(names.len());
        let mut connections = Vec::with_capacity(names.len());
        for name in names {
            if let Some(value) = observed_resources.shift_remove(&name) {
                resources.push(value);
            }
            if let Some(value) = observed_connections.shift_remove(&name) {
                connections.push(value);
            }
        }
        collection_resources.insert(base_name.clone(), Value::Array(resources));
        collection_connections.insert(base_name, Value::Array(connections));
    }

    let mut extra = IndexMap::new();
    for (name, items) in &request.extra_resources {
        let values: Vec<Value> = items
            .iter()
            .map(|item| resource_value(&item.resource))
            .collect();
        extra.insert(name.clone(), Value::Array(values));
    }

    let mut req = IndexMap::new();
    req.insert(
        REQ_CONTEXT.to_string(),
        Value::from_json(&request.context),
    );
    req.insert(
        REQ_COMPOSITE.to_string(),
        resource_value(&request.observed.composite.resource),
    );
    req.insert(
        REQ_COMPOSITE_CONNECTION.to_string(),
        connection_value(&request.observed.composite.connection_details),
    );
    req.insert(
        REQ_RESOURCE.to_string(),
        Value::Object(observed_resources.clone()),
    );
    req.insert(
        REQ_CONNECTION.to_string(),
        Value::Object(observed_connections.clone()),
    );
    req.insert(
        REQ_RESOURCES.to_string(),
        Value::Object(collection_resources.clone()),
    );
    req.insert(
        REQ_CONNECTIONS.to_string(),
        Value::Object(collection_connections.clone()),
    );
    req.insert(REQ_EXTRA_RESOURCES.to_string(), Value::Object(extra));

    let mut bindings = IndexMap::new();
    bindings.insert(RESERVED_REQ.to_string(), Value::Object(req));
    let env = parent.child_with(bindings);

    RequestEnv {
        env,
        observed_resources,
        observed_connections,
        collection_resources,
        collection_connections,
    }
}

/// The names of every observed collection member, grouped by base name and
/// sorted by the index annotation. The index format is chosen so the
/// default string sort matches numeric order.
fn collection_members(observed: &IndexMap<String, Value>) -> IndexMap<String, Vec<String>> {
    let mut groups: IndexMap<String, Vec<(String, String)>> = IndexMap::new();
    for (name, resource) in observed {
        let Some(annotations) = resource
            .as_object()
            .and_then(|r| r.get("metadata"))
            .and_then(Value::as_object)
            .and_then(|m| m.get("annotations"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let Some(base_name) = annotations.get(ANNOTATION_BASE_NAME).and_then(Value::as_str) else {
            continue;
        };
        // the index is assumed to exist if the base name does, it only
        // affects ordering
        let index = annotations
            .get(ANNOTATION_INDEX)
            .and_then(Value::as_str)
            .unwrap_or_default();
        groups
            .entry(base_name.to_string())
            .or_default()
            .push((index.to_string(), name.clone()));
    }

    let mut out = IndexMap::new();
    for (base_name, mut members) in groups {
        members.sort_by(|a, b| a.0.cmp(&b.0));
        out.insert(
            base_name,
            members.into_iter().map(|(_, name)| name).collect(),
        );
    }
    out
}

/// Convert a resource body to a value, dropping `metadata.managedFields`:
/// it is large and never useful in expressions.
fn resource_value(resource: &serde_json::Value) -> Value {
    let mut value = Value::from_json(resource);
    if let Some(metadata) = value
        .as_object_mut()
        .and_then(|map| map.get_mut("metadata"))
        .and_then(Value::as_object_mut)
    {
        metadata.shift_remove("managedFields");
    }
    value
}

/// Connection details appear in the DSL as base64 strings, matching how
/// they travel on the wire.
fn connection_value(details: &IndexMap<String, Vec<u8>>) -> Value {
    let mut map = IndexMap::new();
    for (key, bytes) in details {
        map.insert(
            key.clone(),
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
        );
    }
    Value::Object(map)
}
