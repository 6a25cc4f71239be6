//! Variable scoping for the evaluator.
//!
//! Environments form a lexically nested chain. A new frame is opened when
//! entering a file or group, a `locals` block, a resource or template (to
//! bind `self`), a collection (to bind `self.basename`), an iteration step
//! (to bind `each`), and a function invocation (to bind the arguments).

use indexmap::IndexMap;

use super::value::Value;

/// Reserved namespace roots that user declarations may not shadow.
pub const RESERVED_REQ: &str = "req";
pub const RESERVED_SELF: &str = "self";
pub const RESERVED_ARG: &str = "arg";
pub const ITERATOR_NAME: &str = "each";

/// True if the name is reserved for one of the built-in namespaces.
pub fn is_reserved(name: &str) -> bool {
    matches!(
        name,
        RESERVED_REQ | RESERVED_SELF | RESERVED_ARG | ITERATOR_NAME
    )
}

/// A frame of variable bindings with an optional parent.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    bindings: IndexMap<String, Value>,
    parent: Option<Box<Environment>>,
}

impl Environment {
    /// Create a new root environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a root environment seeded with the supplied bindings.
    pub fn with_bindings(bindings: IndexMap<String, Value>) -> Self {
        Self {
            bindings,
            parent: None,
        }
    }

    /// Create an empty child frame on top of this environment.
    pub fn child(&self) -> Self {
        Self {
            bindings: IndexMap::new(),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Create a child frame holding the supplied bindings.
    pub fn child_with(&self, bindings: IndexMap<String, Value>) -> Self {
        Self {
            bindings,
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Define a variable in this frame.
    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    /// Look up a variable, walking parent frames to the root.
    pub fn get(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.bindings.get(name) {
            return Some(value);
        }
        self.parent.as_ref().and_then(|p| p.get(name))
    }

    /// Check whether a name is bound anywhere in the chain.
    pub fn is_defined(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// The nearest object bound to `namespace` in the chain, as a map.
    /// Returns an empty map if the namespace is unbound.
    pub fn namespace_table(&self, namespace: &str) -> IndexMap<String, Value> {
        match self.get(namespace) {
            Some(Value::Object(map)) => map.clone(),
            _ => IndexMap::new(),
        }
    }

    /// Create a child frame whose `self` namespace is the nearest `self`
    /// table augmented with the supplied entries. Used when entering
    /// resources (name, observed resource/connection) and collections
    /// (basename, observed resources/connections).
    pub fn child_with_self(&self, extra: IndexMap<String, Value>) -> Self {
        let mut table = self.namespace_table(RESERVED_SELF);
        for (k, v) in extra {
            table.insert(k, v);
        }
        let mut bindings = IndexMap::new();
        bindings.insert(RESERVED_SELF.to_string(), Value::Object(table));
        self.child_with(bindings)
    }
}
