//! Template literals compile to one anchored regex at build time.
use regex::Regex;

use crate::ast::{Node, NodeKind, NodeRef, TemplatePart};
use crate::effect::Effect;
use crate::issue::Issue;
use crate::value::Value;

use super::{Parser, dispatcher, leaf};

const NUMBER: &str = r"[+-]?\d*\.?\d+(?:[Ee][+-]?\d+)?";
const ANY: &str = r"[\s\S]*?";

pub fn pattern(parts: &[TemplatePart]) -> String {
    format!("^{}$", body(parts))
}

fn body(parts: &[TemplatePart]) -> String {
    parts
        .iter()
        .map(|part| match part {
            TemplatePart::Literal(text) => regex::escape(text),
            TemplatePart::Node(node) => hole(node),
        })
        .collect()
}

fn hole(node: &Node) -> String {
    match &node.kind {
        NodeKind::Number => NUMBER.to_string(),
        NodeKind::BigInt => r"-?\d+".to_string(),
        NodeKind::Boolean => "(?:true|false)".to_string(),
        NodeKind::Null => "null".to_string(),
        NodeKind::Undefined => "undefined".to_string(),
        NodeKind::Literal(l) => regex::escape(&l.as_template_text()),
        NodeKind::Enums(entries) => alternation(entries.iter().map(|(_, v)| regex::escape(&v.as_template_text()))),
        NodeKind::Union { members, .. } => alternation(members.iter().map(|m| hole(m))),
        NodeKind::TemplateLiteral(parts) => body(parts),
        _ => ANY.to_string(),
    }
}

fn alternation(options: impl Iterator<Item = String>) -> String {
    format!("(?:{})", options.collect::<Vec<_>>().join("|"))
}

pub(super) fn build(node: &NodeRef, parts: &[TemplatePart]) -> Parser {
    match Regex::new(&pattern(parts)) {
        Ok(regex) => leaf(node, move |v| matches!(v, Value::String(s) if regex.is_match(s))),
        Err(err) => {
            tracing::warn!(error = %err, "template literal did not compile");
            let message = format!("template literal did not compile: {err}");
            dispatcher(move |input, _| match input {
                None => Effect::succeed(None),
                Some(v) => Effect::fail(Issue::forbidden(Some(v), message.clone())),
            })
        }
    }
}

// ------------------------------- Tests ------------------------------------ //
