//! Evaluator for an HCL-based composition DSL.
//!
//! The DSL describes desired Kubernetes-style resources, composite status
//! and connection details, context values and extra-resource requirements
//! as a function of a request describing the observed world. Each
//! evaluation is a single-threaded, deterministic, hermetic transformation
//! of request to response.
//!
//! # Example
//!
//! ```
//! use hclcomp::{Evaluator, Request, SourceFile};
//!
//! let source = r#"
//! locals {
//!   app = "web"
//! }
//!
//! resource "config" {
//!   body = {
//!     apiVersion = "v1"
//!     kind       = "ConfigMap"
//!     metadata   = { name = "${app}-config" }
//!   }
//! }
//! "#;
//!
//! let response = Evaluator::new()
//!     .evaluate(&Request::default(), &[SourceFile::new("main.hcl", source)])
//!     .unwrap();
//! assert!(response.desired.resources.contains_key("config"));
//! ```

pub mod analyzer;
pub mod api;
pub mod errors;
pub mod evaluator;
pub mod schema;

pub use analyzer::analyze;
pub use api::{
    Condition, ConditionStatus, DesiredComposite, DesiredResource, DesiredState, Match,
    ObservedResource, ObservedState, Ready, Request, RequestMeta, ResourceSelector, Response,
    ResultEntry, ResultSeverity, SourceFile, Target,
};
pub use errors::{Diagnostic, Diagnostics, Error, Result, Severity};
pub use evaluator::{
    DiscardItem, DiscardKind, DiscardReason, Environment, Evaluator, FunctionSet, TypeHint,
    UnifyError, Value,
};
