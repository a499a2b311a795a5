//! Union dispatcher.
//!
//! Candidates are narrowed up front by runtime kind and, for struct members,
//! by required literal properties ("sentinels") before any member runs.
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use crate::ast::{NodeKind, NodeRef, UnionMode};
use crate::effect::{Effect, try_fold};
use crate::issue::Issue;
use crate::value::{LiteralValue, Value, ValueKind};

use super::{Direction, NodeHandle, ParseOptions, Parser, ParserCache, dispatcher};

struct Member {
    node: NodeHandle,
    parser: Parser,
    /// `None` accepts every runtime kind.
    kinds: Option<BTreeSet<ValueKind>>,
    sentinels: Vec<(String, LiteralValue)>,
}

impl Member {
    fn admits(&self, value: &Value) -> bool {
        if !self.kinds.as_ref().is_none_or(|k| k.contains(&value.kind())) {
            return false;
        }
        match value {
            Value::Object(map) => self
                .sentinels
                .iter()
                .all(|(key, literal)| map.get(key).is_some_and(|v| literal.matches(v))),
            _ => true,
        }
    }
}

/// The node whose shape the input has in `direction`.
fn input_side(node: &NodeRef, direction: Direction) -> &NodeRef {
    match (direction, node.links().last()) {
        (Direction::Decode, Some(link)) => input_side(&link.to, direction),
        _ => node,
    }
}

fn kinds(node: &NodeRef, direction: Direction, depth: usize) -> Option<BTreeSet<ValueKind>> {
    let node = input_side(node, direction);
    let one = |k: ValueKind| Some(BTreeSet::from([k]));
    match &node.kind {
        NodeKind::Never => Some(BTreeSet::new()),
        NodeKind::Unknown | NodeKind::Suspend(_) | NodeKind::Declaration(_) => None,
        NodeKind::Null => one(ValueKind::Null),
        NodeKind::Undefined => one(ValueKind::Undefined),
        NodeKind::String | NodeKind::TemplateLiteral(_) => one(ValueKind::String),
        NodeKind::Number => one(ValueKind::Number),
        NodeKind::Boolean => one(ValueKind::Boolean),
        NodeKind::BigInt => one(ValueKind::BigInt),
        NodeKind::Symbol | NodeKind::UniqueSymbol(_) => one(ValueKind::Symbol),
        NodeKind::Literal(l) => one(l.kind()),
        NodeKind::Enums(entries) => Some(entries.iter().map(|(_, v)| v.kind()).collect()),
        NodeKind::Tuple { .. } => one(ValueKind::Array),
        NodeKind::Struct { .. } => one(ValueKind::Object),
        NodeKind::Union { members, .. } => {
            if depth > 8 {
                return None;
            }
            let mut all = BTreeSet::new();
            for m in members {
                all.extend(kinds(m, direction, depth + 1)?);
            }
            Some(all)
        }
    }
}

fn sentinels(node: &NodeRef, direction: Direction) -> Vec<(String, LiteralValue)> {
    let node = input_side(node, direction);
    let NodeKind::Struct { properties, .. } = &node.kind else {
        return Vec::new();
    };
    properties
        .iter()
        .filter(|p| !p.optional && (direction == Direction::Validate || p.ty.links().is_empty()))
        .filter_map(|p| match &p.ty.kind {
            NodeKind::Literal(l) => {
                let key = if direction == Direction::Decode { p.encoded_name() } else { p.name.as_str() };
                Some((key.to_string(), l.clone()))
            }
            _ => None,
        })
        .collect()
}

enum Search {
    Failed(Vec<Issue>),
    Found(Option<Value>),
}

pub(super) fn build(
    cache: &Arc<ParserCache>,
    node: &NodeRef,
    members: &[NodeRef],
    mode: UnionMode,
    direction: Direction,
) -> Parser {
    let members: Arc<Vec<Member>> = Arc::new(
        members
            .iter()
            .map(|m| Member {
                node: NodeHandle::new(m),
                parser: cache.parser(m, direction),
                kinds: kinds(m, direction, 0),
                sentinels: sentinels(m, direction),
            })
            .collect(),
    );
    let node = NodeHandle::new(node);

    dispatcher(move |input, options| {
        let value = match input {
            None => return Effect::succeed(None),
            Some(v) => v,
        };
        match mode {
            UnionMode::AnyOf => any_of(&node, &members, value, options),
            UnionMode::OneOf => one_of(&node, &members, value, options),
        }
    })
}

/// First admitted member that parses wins.
fn any_of(node: &NodeHandle, members: &Arc<Vec<Member>>, value: Value, options: &ParseOptions) -> Effect<Option<Value>> {
    let candidates: Vec<usize> = (0..members.len()).filter(|&i| members[i].admits(&value)).collect();
    if candidates.is_empty() {
        return Effect::fail(node.mismatch(value));
    }
    let shown = value.clone();
    let node = node.clone();
    let members = members.clone();
    let options = options.clone();
    try_fold(candidates, Search::Failed(Vec::new()), move |search, i| {
        let mut failures = match search {
            Search::Failed(failures) => failures,
            found => return Effect::succeed(ControlFlow::Break(found)),
        };
        (members[i].parser)(Some(value.clone()), &options).then(move |result| {
            Effect::succeed(match result {
                Ok(out) => ControlFlow::Break(Search::Found(out)),
                Err(issue) => {
                    failures.push(issue);
                    ControlFlow::Continue(Search::Failed(failures))
                }
            })
        })
    })
    .and_then(move |search| match search {
        Search::Found(out) => Effect::succeed(out),
        Search::Failed(failures) => Effect::fail(node.issue(Some(shown), |ast, actual| Issue::collect(ast, actual, failures))),
    })
}

/// Every member runs; more than one success is an error.
fn one_of(node: &NodeHandle, members: &Arc<Vec<Member>>, value: Value, options: &ParseOptions) -> Effect<Option<Value>> {
    let admitted: Vec<bool> = members.iter().map(|m| m.admits(&value)).collect();
    if !admitted.contains(&true) {
        return Effect::fail(node.mismatch(value));
    }
    let shown = value.clone();
    let node = node.clone();
    let fold_members = members.clone();
    let members = members.clone();
    let options = options.clone();
    let init: (Vec<(usize, Option<Value>)>, Vec<Issue>) = (Vec::new(), Vec::new());
    try_fold((0..members.len()).collect(), init, move |(mut successes, mut failures), i: usize| {
        let admitted = admitted[i];
        (fold_members[i].parser)(Some(value.clone()), &options).then(move |result| {
            match result {
                Ok(out) => successes.push((i, out)),
                Err(issue) if admitted => failures.push(issue),
                Err(_) => {}
            }
            Effect::succeed(ControlFlow::Continue((successes, failures)))
        })
    })
    .and_then(move |(mut successes, failures)| match successes.len() {
        0 => Effect::fail(node.issue(Some(shown), |ast, actual| Issue::collect(ast, actual, failures))),
        1 => Effect::succeed(successes.remove(0).1),
        _ => {
            let matched: Result<Vec<NodeRef>, Issue> = successes.iter().map(|(i, _)| members[*i].node.upgrade()).collect();
            match (node.upgrade(), matched) {
                (Ok(ast), Ok(successes)) => Effect::fail(Issue::OneOf { ast, actual: shown, successes }),
                (Err(issue), _) | (_, Err(issue)) => Effect::fail(issue),
            }
        }
    })
}
