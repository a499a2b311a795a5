//! Flat records, one per terminal issue.
use serde::Serialize;

use crate::issue::{Issue, PathKey};
use crate::value::Value;

use super::{leaves, message};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StructuredIssue {
    #[serde(rename = "_tag")]
    pub tag: &'static str,
    pub path: Vec<PathKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    pub message: String,
    /// Set when the issue came from an aborting check.
    pub abort: bool,
}

pub fn format_structured(issue: &Issue) -> Vec<StructuredIssue> {
    leaves(issue)
        .into_iter()
        .map(|leaf| StructuredIssue {
            tag: leaf.issue.tag(),
            actual: leaf.issue.actual().cloned(),
            message: message(leaf.issue, leaf.check),
            abort: leaf.check.is_some_and(|c| c.abort),
            path: leaf.path,
        })
        .collect()
}

// ------------------------------- Tests ------------------------------------ //
