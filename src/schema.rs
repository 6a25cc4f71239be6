//! Block and attribute schemas for every block kind, plus schema-driven
//! content extraction from parsed bodies.
//!
//! Schemas are the structural gate: content extraction rejects attributes
//! and block kinds a schema does not list, missing required attributes, and
//! label-count mismatches, before any expression is evaluated.

use indexmap::IndexMap;

use crate::errors::{Diagnostic, Diagnostics};

// block kinds
pub const BLOCK_GROUP: &str = "group";
pub const BLOCK_RESOURCE: &str = "resource";
pub const BLOCK_RESOURCES: &str = "resources";
pub const BLOCK_COMPOSITE: &str = "composite";
pub const BLOCK_CONTEXT: &str = "context";
pub const BLOCK_LOCALS: &str = "locals";
pub const BLOCK_TEMPLATE: &str = "template";
pub const BLOCK_READY: &str = "ready";
pub const BLOCK_FUNCTION: &str = "function";
pub const BLOCK_ARG: &str = "arg";
pub const BLOCK_REQUIREMENT: &str = "requirement";
pub const BLOCK_SELECT: &str = "select";

// attribute names
pub const ATTR_BODY: &str = "body";
pub const ATTR_CONDITION: &str = "condition";
pub const ATTR_FOR_EACH: &str = "for_each";
pub const ATTR_NAME: &str = "name";
pub const ATTR_KEY: &str = "key";
pub const ATTR_VALUE: &str = "value";
pub const ATTR_DESCRIPTION: &str = "description";
pub const ATTR_DEFAULT: &str = "default";
pub const ATTR_API_VERSION: &str = "apiVersion";
pub const ATTR_KIND: &str = "kind";
pub const ATTR_MATCH_NAME: &str = "matchName";
pub const ATTR_MATCH_LABELS: &str = "matchLabels";

// composite block labels
pub const LABEL_STATUS: &str = "status";
pub const LABEL_CONNECTION: &str = "connection";

/// Schema entry for an attribute.
#[derive(Debug, Clone, Copy)]
pub struct AttributeSchema {
    pub name: &'static str,
    pub required: bool,
}

/// Schema entry for a nested block kind.
#[derive(Debug, Clone, Copy)]
pub struct BlockSchema {
    pub kind: &'static str,
    pub labels: usize,
}

/// Allowed attributes and nested blocks for one body.
#[derive(Debug, Clone, Copy)]
pub struct BodySchema {
    pub attributes: &'static [AttributeSchema],
    pub blocks: &'static [BlockSchema],
}

const fn attr(name: &'static str) -> AttributeSchema {
    AttributeSchema {
        name,
        required: false,
    }
}

const fn required_attr(name: &'static str) -> AttributeSchema {
    AttributeSchema {
        name,
        required: true,
    }
}

const fn block0(kind: &'static str) -> BlockSchema {
    BlockSchema { kind, labels: 0 }
}

const fn block1(kind: &'static str) -> BlockSchema {
    BlockSchema { kind, labels: 1 }
}

// block kinds allowed at the top level and in groups
const GROUP_BLOCKS: &[BlockSchema] = &[
    block0(BLOCK_LOCALS),
    block0(BLOCK_GROUP),
    block1(BLOCK_RESOURCE),
    block1(BLOCK_RESOURCES),
    block1(BLOCK_COMPOSITE),
    block0(BLOCK_CONTEXT),
    block1(BLOCK_REQUIREMENT),
];

const TOP_LEVEL_BLOCKS: &[BlockSchema] = &[
    block0(BLOCK_LOCALS),
    block0(BLOCK_GROUP),
    block1(BLOCK_RESOURCE),
    block1(BLOCK_RESOURCES),
    block1(BLOCK_COMPOSITE),
    block0(BLOCK_CONTEXT),
    block1(BLOCK_REQUIREMENT),
    block1(BLOCK_FUNCTION),
];

// block kinds allowed inside resource and template blocks
const RESOURCE_BLOCKS: &[BlockSchema] = &[
    block0(BLOCK_LOCALS),
    block0(BLOCK_READY),
    block1(BLOCK_COMPOSITE),
    block0(BLOCK_CONTEXT),
];

pub const TOP_LEVEL: BodySchema = BodySchema {
    attributes: &[],
    blocks: TOP_LEVEL_BLOCKS,
};

pub const GROUP: BodySchema = BodySchema {
    attributes: &[attr(ATTR_CONDITION)],
    blocks: GROUP_BLOCKS,
};

pub const RESOURCE: BodySchema = BodySchema {
    attributes: &[required_attr(ATTR_BODY), attr(ATTR_CONDITION)],
    blocks: RESOURCE_BLOCKS,
};

pub const RESOURCES: BodySchema = BodySchema {
    attributes: &[
        attr(ATTR_CONDITION),
        required_attr(ATTR_FOR_EACH),
        attr(ATTR_NAME),
    ],
    blocks: &[
        block0(BLOCK_LOCALS),
        block1(BLOCK_COMPOSITE),
        block0(BLOCK_TEMPLATE),
        block0(BLOCK_CONTEXT),
    ],
};

pub const TEMPLATE: BodySchema = BodySchema {
    attributes: &[required_attr(ATTR_BODY)],
    blocks: RESOURCE_BLOCKS,
};

pub const COMPOSITE: BodySchema = BodySchema {
    attributes: &[required_attr(ATTR_BODY)],
    blocks: &[block0(BLOCK_LOCALS)],
};

pub const CONTEXT: BodySchema = BodySchema {
    attributes: &[required_attr(ATTR_KEY), required_attr(ATTR_VALUE)],
    blocks: &[block0(BLOCK_LOCALS)],
};

pub const READY: BodySchema = BodySchema {
    attributes: &[required_attr(ATTR_VALUE)],
    blocks: &[block0(BLOCK_LOCALS)],
};

pub const FUNCTION: BodySchema = BodySchema {
    attributes: &[attr(ATTR_DESCRIPTION), required_attr(ATTR_BODY)],
    blocks: &[block1(BLOCK_ARG), block0(BLOCK_LOCALS)],
};

pub const ARG: BodySchema = BodySchema {
    attributes: &[attr(ATTR_DESCRIPTION), attr(ATTR_DEFAULT)],
    blocks: &[],
};

pub const REQUIREMENT: BodySchema = BodySchema {
    attributes: &[attr(ATTR_CONDITION)],
    blocks: &[block0(BLOCK_LOCALS), block0(BLOCK_SELECT)],
};

pub const SELECT: BodySchema = BodySchema {
    attributes: &[
        required_attr(ATTR_API_VERSION),
        required_attr(ATTR_KIND),
        attr(ATTR_MATCH_NAME),
        attr(ATTR_MATCH_LABELS),
    ],
    blocks: &[],
};

/// The schema for a block kind's own body, if it has one.
pub fn for_block_kind(kind: &str) -> Option<&'static BodySchema> {
    match kind {
        BLOCK_GROUP => Some(&GROUP),
        BLOCK_RESOURCE => Some(&RESOURCE),
        BLOCK_RESOURCES => Some(&RESOURCES),
        BLOCK_COMPOSITE => Some(&COMPOSITE),
        BLOCK_CONTEXT => Some(&CONTEXT),
        BLOCK_TEMPLATE => Some(&TEMPLATE),
        BLOCK_READY => Some(&READY),
        BLOCK_FUNCTION => Some(&FUNCTION),
        BLOCK_ARG => Some(&ARG),
        BLOCK_REQUIREMENT => Some(&REQUIREMENT),
        BLOCK_SELECT => Some(&SELECT),
        _ => None,
    }
}

/// Attributes and labelled blocks extracted from a body per a schema.
#[derive(Debug, Clone, Default)]
pub struct Content {
    pub attributes: IndexMap<String, hcl::Attribute>,
    pub blocks: Vec<hcl::Block>,
}

impl Content {
    /// The expression bound to the named attribute, if present.
    pub fn attr(&self, name: &str) -> Option<&hcl::Expression> {
        self.attributes.get(name).map(|a| &a.expr)
    }

    /// Nested blocks of one kind, in source order.
    pub fn blocks_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a hcl::Block> {
        self.blocks
            .iter()
            .filter(move |b| b.identifier.as_str() == kind)
    }

    /// Merge another content into this one, preserving order. Used to treat
    /// multiple files as one concatenated body.
    pub fn merge(&mut self, other: Content) -> Diagnostics {
        let mut diags = Diagnostics::new();
        for (name, attribute) in other.attributes {
            if self.attributes.contains_key(&name) {
                diags.push(Diagnostic::error(format!(
                    "attribute {:?} declared more than once",
                    name
                )));
                continue;
            }
            self.attributes.insert(name, attribute);
        }
        self.blocks.extend(other.blocks);
        diags
    }
}

/// Extract the content of a body per the supplied schema, rejecting
/// structure the schema does not allow.
pub fn content_of(body: &hcl::Body, schema: &BodySchema) -> Result<Content, Diagnostics> {
    let mut diags = Diagnostics::new();
    let mut content = Content::default();

    for attribute in body.attributes() {
        let name = attribute.key.as_str();
        match schema.attributes.iter().find(|a| a.name == name) {
            Some(_) => {
                if content.attributes.contains_key(name) {
                    diags.push(Diagnostic::error(format!(
                        "attribute {:?} declared more than once",
                        name
                    )));
                    continue;
                }
                content.attributes.insert(name.to_string(), attribute.clone());
            }
            None => diags.push(Diagnostic::error(format!(
                "unexpected attribute {:?} in this block",
                name
            ))),
        }
    }

    for block in body.blocks() {
        let kind = block.identifier.as_str();
        match schema.blocks.iter().find(|b| b.kind == kind) {
            Some(block_schema) => {
                if block.labels.len() != block_schema.labels {
                    diags.push(Diagnostic::error(format!(
                        "block {:?} expects {} label(s), got {}",
                        kind,
                        block_schema.labels,
                        block.labels.len()
                    )));
                    continue;
                }
                content.blocks.push(block.clone());
            }
            None => diags.push(Diagnostic::error(format!(
                "unsupported block type {:?}",
                kind
            ))),
        }
    }

    for required in schema.attributes.iter().filter(|a| a.required) {
        if !content.attributes.contains_key(required.name) {
            diags.push(Diagnostic::error(format!(
                "missing required attribute {:?}",
                required.name
            )));
        }
    }

    if diags.has_errors() {
        return Err(diags);
    }
    Ok(content)
}

/// Extract a body that may only contain attributes, as `locals` and `arg`
/// bodies do. Any nested block is an error.
pub fn just_attributes(body: &hcl::Body) -> Result<IndexMap<String, hcl::Attribute>, Diagnostics> {
    let mut diags = Diagnostics::new();
    let mut out = IndexMap::new();
    for block in body.blocks() {
        diags.push(Diagnostic::error(format!(
            "unexpected block {:?}, only attributes are allowed here",
            block.identifier.as_str()
        )));
    }
    for attribute in body.attributes() {
        let name = attribute.key.as_str();
        if out.contains_key(name) {
            diags.push(Diagnostic::error(format!(
                "attribute {:?} declared more than once",
                name
            )));
            continue;
        }
        out.insert(name.to_string(), attribute.clone());
    }
    if diags.has_errors() {
        return Err(diags);
    }
    Ok(out)
}

/// The single label of a block, e.g. a resource or function name.
pub fn block_label(block: &hcl::Block) -> Option<&str> {
    block.labels.first().map(|label| label.as_str())
}
