//! Request and response model for one evaluation.
//!
//! A [`Request`] describes the observed world: the composite, the resources
//! that already exist, their connection details, and any extra resources
//! fetched for the composition. A [`Response`] is the pure in-memory result:
//! desired resources, composite status and connection details, context
//! values, extra-resource requirements, and diagnostic results/conditions.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A named piece of DSL source. The name is informational and only appears
/// in diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Informational request metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    #[serde(default)]
    pub tag: String,
}

/// An observed resource: its body plus connection details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedResource {
    #[serde(default)]
    pub resource: serde_json::Value,
    #[serde(default)]
    pub connection_details: IndexMap<String, Vec<u8>>,
}

/// The observed composite and resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    #[serde(default)]
    pub composite: ObservedResource,
    #[serde(default)]
    pub resources: IndexMap<String, ObservedResource>,
}

/// The input to one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub meta: RequestMeta,
    #[serde(default)]
    pub observed: ObservedState,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub extra_resources: IndexMap<String, Vec<ObservedResource>>,
}

/// Readiness recorded for a desired resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ready {
    #[default]
    Unspecified,
    True,
    False,
}

impl Ready {
    /// The DSL-visible names, in the order they are listed in errors.
    pub const NAMES: [&'static str; 3] = ["READY_FALSE", "READY_TRUE", "READY_UNSPECIFIED"];

    /// Parse a DSL-visible name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "READY_UNSPECIFIED" => Some(Ready::Unspecified),
            "READY_TRUE" => Some(Ready::True),
            "READY_FALSE" => Some(Ready::False),
            _ => None,
        }
    }
}

/// A desired resource body plus optional readiness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredResource {
    pub resource: serde_json::Value,
    #[serde(default)]
    pub ready: Ready,
}

/// The desired composite: merged statuses and connection details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredComposite {
    #[serde(default)]
    pub resource: Option<serde_json::Value>,
    #[serde(default)]
    pub connection_details: IndexMap<String, Vec<u8>>,
}

/// Everything the evaluation wants the orchestrator to create or update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub composite: Option<DesiredComposite>,
    #[serde(default)]
    pub resources: IndexMap<String, DesiredResource>,
}

/// How a requirement matches extra resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Match {
    Name(String),
    Labels(IndexMap<String, String>),
}

/// A selector asking the orchestrator for additional observed resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSelector {
    pub api_version: String,
    pub kind: String,
    #[serde(rename = "match")]
    pub match_: Match,
}

/// Target of a result or condition. Only the composite is addressed today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    #[default]
    Composite,
}

/// Severity of a result entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultSeverity {
    Normal,
    Warning,
}

/// One diagnostic result surfaced to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub severity: ResultSeverity,
    pub message: String,
    pub target: Target,
    pub reason: String,
}

/// Status of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
}

/// A condition describing the overall outcome of the evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub target: Target,
}

/// The output of one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub desired: DesiredState,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub requirements: IndexMap<String, ResourceSelector>,
    #[serde(default)]
    pub results: Vec<ResultEntry>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Response {
    /// The condition with the supplied type, if present.
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}
