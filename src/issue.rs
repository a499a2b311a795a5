//! Issue tree produced by a failed parse.
//!
//! Leaves describe what went wrong; `Pointer` and `Composite` give them a
//! location, `Filter` and `Encoding` record which check or transformation
//! step produced them.
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::ast::{Annotations, Link, NodeRef};
use crate::check::Check;
use crate::value::{Value, quote};

/// One segment of a property/index path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum PathKey {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKey::Key(k) => write!(f, "[{}]", quote(k)),
            PathKey::Index(i) => write!(f, "[{i}]"),
        }
    }
}

impl From<&str> for PathKey {
    fn from(k: &str) -> Self { PathKey::Key(k.to_string()) }
}

impl From<String> for PathKey {
    fn from(k: String) -> Self { PathKey::Key(k) }
}

impl From<usize> for PathKey {
    fn from(i: usize) -> Self { PathKey::Index(i) }
}

pub fn format_path(path: &[PathKey]) -> String {
    path.iter().map(ToString::to_string).collect()
}

/// Non-validation failure raised by user-supplied code.
pub type Defect = Arc<anyhow::Error>;

#[derive(Clone, Debug)]
pub enum Issue {
    /// The input does not have the runtime shape the node describes.
    Mismatch { ast: NodeRef, actual: Option<Value> },
    /// A custom parser rejected the type of a present value.
    InvalidType { ast: NodeRef, actual: Option<Value> },
    /// A check or transformation rejected a present value.
    InvalidValue { actual: Option<Value>, annotations: Option<Arc<Annotations>> },
    MissingKey { annotations: Option<Arc<Annotations>> },
    UnexpectedKey { ast: NodeRef, actual: Option<Value> },
    Forbidden { actual: Option<Value>, annotations: Option<Arc<Annotations>>, cause: Option<Defect> },
    OneOf { ast: NodeRef, actual: Value, successes: Vec<NodeRef> },
    Composite { ast: NodeRef, actual: Option<Value>, issues: Vec<Issue> },
    Pointer { path: Vec<PathKey>, issue: Box<Issue> },
    Filter { check: Check, issue: Box<Issue> },
    Encoding { link: Link, issue: Box<Issue> },
}

impl Issue {
    pub fn mismatch(ast: &NodeRef, actual: Option<Value>) -> Self {
        Issue::Mismatch { ast: ast.clone(), actual }
    }

    pub fn invalid_type(ast: &NodeRef, actual: Option<Value>) -> Self {
        Issue::InvalidType { ast: ast.clone(), actual }
    }

    pub fn invalid_value(actual: Option<Value>) -> Self {
        Issue::InvalidValue { actual, annotations: None }
    }

    pub fn invalid_value_with(actual: Option<Value>, message: impl Into<String>) -> Self {
        Issue::InvalidValue { actual, annotations: Some(Arc::new(Annotations::message(message))) }
    }

    pub fn missing_key() -> Self {
        Issue::MissingKey { annotations: None }
    }

    pub fn forbidden(actual: Option<Value>, message: impl Into<String>) -> Self {
        Issue::Forbidden {
            actual,
            annotations: Some(Arc::new(Annotations::message(message))),
            cause: None,
        }
    }

    pub fn defect(actual: Option<Value>, cause: anyhow::Error) -> Self {
        Issue::Forbidden { actual, annotations: None, cause: Some(Arc::new(cause)) }
    }

    /// Prefixes `path` onto `issue`; an empty path leaves it untouched.
    pub fn pointer(path: Vec<PathKey>, issue: Issue) -> Self {
        if path.is_empty() {
            return issue;
        }
        Issue::Pointer { path, issue: Box::new(issue) }
    }

    /// Folds sibling failures: one stays as is, several become a `Composite`.
    pub fn collect(ast: &NodeRef, actual: Option<Value>, mut issues: Vec<Issue>) -> Self {
        if issues.len() == 1 {
            return issues.remove(0);
        }
        Issue::Composite { ast: ast.clone(), actual, issues }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Issue::Mismatch { .. } => "Mismatch",
            Issue::InvalidType { .. } => "InvalidType",
            Issue::InvalidValue { .. } => "InvalidValue",
            Issue::MissingKey { .. } => "MissingKey",
            Issue::UnexpectedKey { .. } => "UnexpectedKey",
            Issue::Forbidden { .. } => "Forbidden",
            Issue::OneOf { .. } => "OneOf",
            Issue::Composite { .. } => "Composite",
            Issue::Pointer { .. } => "Pointer",
            Issue::Filter { .. } => "Filter",
            Issue::Encoding { .. } => "Encoding",
        }
    }

    /// Whether a captured panic sits anywhere in this tree.
    pub fn has_defect(&self) -> bool {
        match self {
            Issue::Forbidden { cause, .. } => cause.is_some(),
            Issue::Composite { issues, .. } => issues.iter().any(Issue::has_defect),
            Issue::Pointer { issue, .. } | Issue::Filter { issue, .. } | Issue::Encoding { issue, .. } => {
                issue.has_defect()
            }
            _ => false,
        }
    }

    pub fn actual(&self) -> Option<&Value> {
        match self {
            Issue::Mismatch { actual, .. }
            | Issue::InvalidType { actual, .. }
            | Issue::InvalidValue { actual, .. }
            | Issue::UnexpectedKey { actual, .. }
            | Issue::Forbidden { actual, .. }
            | Issue::Composite { actual, .. } => actual.as_ref(),
            Issue::OneOf { actual, .. } => Some(actual),
            Issue::MissingKey { .. } => None,
            Issue::Pointer { issue, .. } | Issue::Filter { issue, .. } | Issue::Encoding { issue, .. } => {
                issue.actual()
            }
        }
    }
}

/// A failed parse as a `std::error::Error`; displays the issue tree.
#[derive(Debug, Clone, Error)]
#[error("{}", crate::format::format_tree(&self.issue))]
pub struct ParseError {
    pub issue: Issue,
}

impl From<Issue> for ParseError {
    fn from(issue: Issue) -> Self { ParseError { issue } }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Node;

    #[test]
    fn defects_are_found_under_wrappers() {
        let defect = Issue::defect(None, anyhow::anyhow!("boom"));
        assert!(Issue::pointer(vec![PathKey::from("a")], defect).has_defect());
        assert!(!Issue::forbidden(None, "not a panic").has_defect());
        assert!(!Issue::pointer(vec![PathKey::from("a")], Issue::missing_key()).has_defect());
    }

    #[test]
    fn empty_pointer_is_transparent() {
        let issue = Issue::pointer(vec![], Issue::missing_key());
        assert!(matches!(issue, Issue::MissingKey { .. }));
    }

    #[test]
    fn collect_keeps_single_issue_bare() {
        let node: NodeRef = Arc::new(Node::string());
        let one = Issue::collect(&node, None, vec![Issue::missing_key()]);
        assert_eq!(one.tag(), "MissingKey");
        let many = Issue::collect(&node, None, vec![Issue::missing_key(), Issue::missing_key()]);
        assert_eq!(many.tag(), "Composite");
    }

    #[test]
    fn path_keys_render_like_accessors() {
        let path = vec![PathKey::from("a"), PathKey::from(0usize), PathKey::from("b c")];
        assert_eq!(format_path(&path), r#"["a"][0]["b c"]"#);
    }
}
