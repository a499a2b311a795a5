//! `{ path, message }` pairs for interop layers that only understand those.
use serde::Serialize;

use crate::issue::{Issue, PathKey};

use super::{leaves, message};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StandardIssue {
    pub path: Vec<PathKey>,
    pub message: String,
}

pub fn format_standard(issue: &Issue) -> Vec<StandardIssue> {
    leaves(issue)
        .into_iter()
        .map(|leaf| StandardIssue { message: message(leaf.issue, leaf.check), path: leaf.path })
        .collect()
}
