//! Tuple dispatcher.
//!
//! Layout is `[...elements, ...head[], ...tail]`: required/optional leading
//! elements, then a repeated head, then fixed trailing elements.
use std::ops::ControlFlow;
use std::sync::Arc;

use crate::ast::{Element, NodeRef};
use crate::effect::{Effect, try_fold};
use crate::issue::{Issue, PathKey};
use crate::value::Value;

use super::{Direction, ErrorMode, NodeHandle, Parser, ParserCache, dispatcher};

enum Step {
    Element(usize),
    Rest(usize),
    Tail { parser: usize, index: usize },
    Excess(usize),
}

pub(super) fn build(
    cache: &Arc<ParserCache>,
    node: &NodeRef,
    elements: &[Element],
    rest: &[NodeRef],
    direction: Direction,
) -> Parser {
    let elements: Arc<Vec<(Parser, bool)>> =
        Arc::new(elements.iter().map(|e| (cache.parser(&e.ty, direction), e.optional)).collect());
    let head: Option<Parser> = rest.first().map(|r| cache.parser(r, direction));
    let tail: Arc<Vec<Parser>> = Arc::new(rest.iter().skip(1).map(|r| cache.parser(r, direction)).collect());
    let node = NodeHandle::new(node);

    dispatcher(move |input, options| {
        let items = match input {
            None => return Effect::succeed(None),
            Some(Value::Array(items)) => Arc::new(items),
            Some(other) => return Effect::fail(node.mismatch(other)),
        };

        let len = items.len();
        let leading = elements.len();
        let mut steps: Vec<Step> = (0..leading).map(Step::Element).collect();
        if head.is_some() {
            let rest_end = len.saturating_sub(tail.len()).max(leading);
            steps.extend((leading..rest_end).map(Step::Rest));
            steps.extend((0..tail.len()).map(|parser| Step::Tail { parser, index: rest_end + parser }));
        } else {
            steps.extend((leading..len).map(Step::Excess));
        }

        let all = options.errors == ErrorMode::All;
        let (elements, head, tail, fold_items, fold_node) =
            (elements.clone(), head.clone(), tail.clone(), items.clone(), node.clone());
        let fold_options = options.clone();
        let node = node.clone();

        let init: (Vec<Value>, Vec<Issue>) = (Vec::with_capacity(len), Vec::new());
        try_fold(steps, init, move |(mut out, mut issues), step| {
            let (index, parser, optional) = match step {
                Step::Element(i) => (i, elements[i].0.clone(), elements[i].1),
                Step::Tail { parser, index } => (index, tail[parser].clone(), false),
                Step::Rest(i) => match &head {
                    Some(p) => (i, p.clone(), false),
                    None => return Effect::succeed(ControlFlow::Continue((out, issues))),
                },
                Step::Excess(i) => {
                    let issue = fold_node
                        .issue(fold_items.get(i).cloned(), |ast, actual| Issue::UnexpectedKey { ast: ast.clone(), actual });
                    issues.push(Issue::pointer(vec![PathKey::Index(i)], issue));
                    return Effect::succeed(if all {
                        ControlFlow::Continue((out, issues))
                    } else {
                        ControlFlow::Break((out, issues))
                    });
                }
            };
            parser(fold_items.get(index).cloned(), &fold_options).then(move |result| {
                let issue = match result {
                    Ok(Some(v)) => {
                        out.push(v);
                        None
                    }
                    Ok(None) if optional => None,
                    Ok(None) => Some(Issue::missing_key()),
                    Err(issue) => Some(issue),
                };
                Effect::succeed(match issue {
                    None => ControlFlow::Continue((out, issues)),
                    Some(issue) => {
                        issues.push(Issue::pointer(vec![PathKey::Index(index)], issue));
                        if all { ControlFlow::Continue((out, issues)) } else { ControlFlow::Break((out, issues)) }
                    }
                })
            })
        })
        .and_then(move |(out, issues)| {
            if issues.is_empty() {
                Effect::succeed(Some(Value::Array(out)))
            } else {
                let actual = Arc::try_unwrap(items).unwrap_or_else(|xs| (*xs).clone());
                Effect::fail(node.issue(Some(Value::Array(actual)), |ast, actual| Issue::collect(ast, actual, issues)))
            }
        })
    })
}
