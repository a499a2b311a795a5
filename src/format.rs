//! Issue rendering.
//!
//! Three views of the same tree: an indented tree for humans, flat records
//! with paths for programs, and the minimal `{path, message}` list used by
//! interop layers. All of them share [`leaves`] and [`message`].
pub mod standard;
pub mod structured;
pub mod tree;

pub use standard::{StandardIssue, format_standard};
pub use structured::{StructuredIssue, format_structured};
pub use tree::format_tree;

use crate::ast::{Annotations, Message};
use crate::check::Check;
use crate::effect::catch;
use crate::issue::{Issue, PathKey};
use crate::value::Value;

/// A terminal issue with the location and the innermost check it came from.
pub struct Leaf<'a> {
    pub path: Vec<PathKey>,
    pub issue: &'a Issue,
    pub check: Option<&'a Check>,
}

/// Flattens the tree into its terminal issues, in order.
pub fn leaves(issue: &Issue) -> Vec<Leaf<'_>> {
    let mut out = Vec::new();
    walk(issue, &mut Vec::new(), None, &mut out);
    out
}

fn walk<'a>(issue: &'a Issue, path: &mut Vec<PathKey>, check: Option<&'a Check>, out: &mut Vec<Leaf<'a>>) {
    match issue {
        Issue::Pointer { path: segment, issue } => {
            let depth = path.len();
            path.extend(segment.iter().cloned());
            walk(issue, path, check, out);
            path.truncate(depth);
        }
        Issue::Composite { issues, .. } => {
            for i in issues {
                walk(i, path, check, out);
            }
        }
        Issue::Filter { check, issue } => walk(issue, path, Some(check), out),
        Issue::Encoding { issue, .. } => walk(issue, path, check, out),
        leaf => out.push(Leaf { path: path.clone(), issue: leaf, check }),
    }
}

fn shown(actual: Option<&Value>) -> String {
    actual.map(ToString::to_string).unwrap_or_else(|| "no value provided".to_string())
}

fn render(message: &Message, issue: &Issue) -> Option<String> {
    match message {
        Message::Text(text) => Some(text.clone()),
        Message::Build(build) => match catch(|| build(issue)) {
            Ok(text) => Some(text),
            Err(err) => {
                tracing::warn!(error = %err, "message builder panicked");
                None
            }
        },
    }
}

fn annotated(annotations: Option<&Annotations>, issue: &Issue) -> Option<String> {
    annotations.and_then(|a| a.message.as_ref()).and_then(|m| render(m, issue))
}

/// Human message for a terminal issue.
pub fn message(issue: &Issue, check: Option<&Check>) -> String {
    if let Some(text) = annotated(check.and_then(|c| c.annotations.as_deref()), issue) {
        return text;
    }
    match issue {
        Issue::Mismatch { ast, actual } | Issue::InvalidType { ast, actual } => {
            annotated(ast.annotations.as_deref(), issue)
                .unwrap_or_else(|| format!("Expected {}, actual {}", ast.expected(), shown(actual.as_ref())))
        }
        Issue::InvalidValue { actual, annotations } => annotated(annotations.as_deref(), issue)
            .or_else(|| {
                check
                    .and_then(|c| c.annotations.as_deref())
                    .or(annotations.as_deref())
                    .and_then(|a| a.expected.as_deref())
                    .map(|expected| format!("Expected {expected}, actual {}", shown(actual.as_ref())))
            })
            .unwrap_or_else(|| format!("Invalid data {}", shown(actual.as_ref()))),
        Issue::MissingKey { annotations } => annotations
            .as_deref()
            .and_then(|a| a.missing_key_message.as_ref())
            .and_then(|m| render(m, issue))
            .unwrap_or_else(|| "Missing key".to_string()),
        Issue::UnexpectedKey { actual, .. } => format!("Unexpected key with value {}", shown(actual.as_ref())),
        Issue::Forbidden { annotations, cause, .. } => {
            let base = annotated(annotations.as_deref(), issue).unwrap_or_else(|| "Forbidden operation".to_string());
            match cause {
                Some(cause) => format!("{base}: {cause}"),
                None => base,
            }
        }
        Issue::OneOf { actual, .. } => format!("Expected exactly one member to match the input {actual}"),
        // not leaves; kept total for callers that pass inner nodes
        Issue::Composite { ast, actual, .. } => format!("Expected {}, actual {}", ast.expected(), shown(actual.as_ref())),
        Issue::Pointer { issue, .. } | Issue::Encoding { issue, .. } => message(issue, check),
        Issue::Filter { check, issue } => message(issue, Some(check)),
    }
}

// ------------------------------- Tests ------------------------------------ //
