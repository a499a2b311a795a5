//! Indented tree view.
//!
//! ```text
//! Expected { readonly "a": string; readonly "b": number }, actual {"a":1}
//! ├─ ["a"]
//! │  └─ Expected string, actual 1
//! └─ ["b"]
//!    └─ Missing key
//! ```
use crate::check::Check;
use crate::issue::{Issue, format_path};

use super::message;

struct Branch {
    label: String,
    children: Vec<Branch>,
}

fn branch(issue: &Issue, check: Option<&Check>) -> Branch {
    match issue {
        Issue::Pointer { path, issue } => Branch { label: format_path(path), children: vec![branch(issue, check)] },
        Issue::Composite { issues, .. } => Branch {
            label: message(issue, check),
            children: issues.iter().map(|i| branch(i, check)).collect(),
        },
        Issue::Filter { check, issue } => branch(issue, Some(check)),
        Issue::Encoding { issue, .. } => branch(issue, check),
        leaf => Branch { label: message(leaf, check), children: Vec::new() },
    }
}

fn draw(b: &Branch, indent: &str, out: &mut String) {
    let last = b.children.len().saturating_sub(1);
    for (i, child) in b.children.iter().enumerate() {
        let (elbow, pipe) = if i == last { ("└─ ", "   ") } else { ("├─ ", "│  ") };
        out.push('\n');
        out.push_str(indent);
        out.push_str(elbow);
        out.push_str(&child.label);
        draw(child, &format!("{indent}{pipe}"), out);
    }
}

pub fn format_tree(issue: &Issue) -> String {
    let root = branch(issue, None);
    let mut out = root.label.clone();
    draw(&root, "", &mut out);
    out
}

// ------------------------------- Tests ------------------------------------ //
