//! Diagnostics and error types for the evaluator.
//!
//! Evaluation never aborts on the first problem: processors accumulate
//! [`Diagnostics`] and decide per call site whether errors are fatal or may be
//! softened into warnings. The [`Error`] enum is the crate-level failure type
//! returned from the public entry points.

use std::fmt;

use thiserror::Error;

/// Severity of a single diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Halts the enclosing evaluation branch.
    Error,
    /// Collected and reported, never halts.
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// A single diagnostic message.
///
/// `subject` carries the re-rendered source text of the offending expression;
/// the underlying AST has no byte offsets, so text stands in for ranges.
/// `incomplete` marks diagnostics caused by values that are not yet knowable
/// (e.g. a reference into observed state that does not exist yet). Only these
/// may be downgraded to warnings by [`Diagnostics::downgrade_incomplete`].
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: Option<String>,
    pub subject: Option<String>,
    pub incomplete: bool,
}

impl Diagnostic {
    /// An ordinary error diagnostic.
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: None,
            subject: None,
            incomplete: false,
        }
    }

    /// An error diagnostic caused by a not-yet-knowable value.
    pub fn incomplete(summary: impl Into<String>) -> Self {
        Self {
            incomplete: true,
            ..Self::error(summary)
        }
    }

    /// A warning diagnostic.
    pub fn warning(summary: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(summary)
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Formats the diagnostic the way it appears in condition messages.
    pub fn message(&self) -> String {
        let mut parts = Vec::new();
        if let Some(subject) = &self.subject {
            parts.push(subject.clone());
        }
        parts.push(self.summary.clone());
        if let Some(detail) = &self.detail {
            parts.push(detail.clone());
        }
        parts.join(", ")
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message())
    }
}

/// An ordered collection of diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A collection holding a single error.
    pub fn single_error(summary: impl Into<String>) -> Self {
        Self(vec![Diagnostic::error(summary)])
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.0.push(diag);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.0.iter().any(|d| d.severity == Severity::Warning)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }

    /// Downgrades incomplete-class errors to warnings, leaving everything
    /// else untouched. This is the "allow incomplete" combinator used at the
    /// soft spots (resource bodies, statuses, connections, context values,
    /// ready values, selectors).
    pub fn downgrade_incomplete(mut self) -> Self {
        for diag in &mut self.0 {
            if diag.severity == Severity::Error && diag.incomplete {
                diag.severity = Severity::Warning;
            }
        }
        self
    }

    /// Stable sort with errors first, so formatted output leads with one.
    pub fn sort_by_severity(mut self) -> Self {
        self.0.sort_by_key(|d| d.severity);
        self
    }

    /// Short per-diagnostic messages, used as context lines in discards.
    pub fn messages(&self) -> Vec<String> {
        self.0.iter().map(Diagnostic::message).collect()
    }

    /// Summaries of all warnings, used in the diagnostics condition.
    pub fn warning_summaries(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .map(|d| match &d.subject {
                Some(subject) => format!("{}: {}", subject, d.summary),
                None => d.summary.clone(),
            })
            .collect()
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(diag: Diagnostic) -> Self {
        Self(vec![diag])
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<T: IntoIterator<Item = Diagnostic>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sorted = self.clone().sort_by_severity();
        let msgs: Vec<String> = sorted.0.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

impl std::error::Error for Diagnostics {}

/// Crate-level error returned from the public entry points.
#[derive(Debug, Error)]
pub enum Error {
    /// A source file failed to parse.
    #[error("parse {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: hcl::Error,
    },

    /// Evaluation produced at least one error diagnostic.
    #[error("{0}")]
    Eval(Diagnostics),

    /// Output assembly failed, e.g. a unification conflict.
    #[error("{context}: {message}")]
    Assembly { context: String, message: String },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
