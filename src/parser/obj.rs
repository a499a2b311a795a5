//! Struct dispatcher: declared properties, index signatures, excess keys.
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use crate::ast::{Annotations, IndexSignature, KeyMerge, NodeRef, PropertySignature};
use crate::effect::{Effect, catch, try_fold};
use crate::getter::js_to_string;
use crate::issue::{Issue, PathKey};
use crate::value::{Object, Value};

use super::{Direction, ErrorMode, ExcessProperty, NodeHandle, Parser, ParserCache, Variant, dispatcher};

struct Property {
    name: String,
    input_key: String,
    output_key: String,
    optional: bool,
    constructor_default: Option<Value>,
    annotations: Option<Arc<Annotations>>,
    parser: Parser,
}

struct Signature {
    key: Parser,
    value: Parser,
    merge: Option<KeyMerge>,
}

enum Step {
    Property(usize),
    Entry { signature: usize, key: String },
    /// Runs after the key went through every signature.
    Leftover(String),
}

struct State {
    out: Object,
    issues: Vec<Issue>,
    matched: HashSet<String>,
}

impl State {
    fn record(mut self, issue: Issue, all: bool) -> ControlFlow<State, State> {
        self.issues.push(issue);
        if all { ControlFlow::Continue(self) } else { ControlFlow::Break(self) }
    }

    /// A panicking `merge` leaves the existing value in place and reports a defect.
    fn insert(mut self, key: String, value: Value, merge: Option<&KeyMerge>, all: bool) -> ControlFlow<State, State> {
        let merged = match (self.out.shift_remove(&key), merge) {
            (Some(existing), Some(merge)) => {
                let shown = existing.clone();
                match catch(|| merge(&key, existing, value)) {
                    Ok(merged) => merged,
                    Err(err) => {
                        tracing::warn!(key = %key, defect = %err, "index signature merge panicked");
                        self.out.insert(key.clone(), shown.clone());
                        let issue = Issue::defect(Some(shown), err);
                        return self.record(Issue::pointer(vec![PathKey::Key(key)], issue), all);
                    }
                }
            }
            _ => value,
        };
        self.out.insert(key, merged);
        ControlFlow::Continue(self)
    }
}

pub(super) fn build(
    cache: &Arc<ParserCache>,
    node: &NodeRef,
    properties: &[PropertySignature],
    index_signatures: &[IndexSignature],
    direction: Direction,
) -> Parser {
    let properties: Arc<Vec<Property>> = Arc::new(
        properties
            .iter()
            .map(|p| {
                let (input_key, output_key) = match direction {
                    Direction::Decode => (p.encoded_name().to_string(), p.name.clone()),
                    Direction::Encode => (p.name.clone(), p.encoded_name().to_string()),
                    Direction::Validate => (p.name.clone(), p.name.clone()),
                };
                Property {
                    name: p.name.clone(),
                    input_key,
                    output_key,
                    optional: p.optional,
                    constructor_default: p.constructor_default.clone(),
                    annotations: p.ty.annotations.clone(),
                    parser: cache.parser(&p.ty, direction),
                }
            })
            .collect(),
    );
    let declared: Arc<HashSet<String>> = Arc::new(properties.iter().map(|p| p.input_key.clone()).collect());
    let signatures: Arc<Vec<Signature>> = Arc::new(
        index_signatures
            .iter()
            .map(|s| Signature {
                key: cache.parser(&s.key, direction),
                value: cache.parser(&s.value, direction),
                merge: s.merge.clone(),
            })
            .collect(),
    );
    let node = NodeHandle::new(node);

    dispatcher(move |input, options| {
        let map = match input {
            None => return Effect::succeed(None),
            Some(Value::Object(map)) => Arc::new(map),
            Some(other) => return Effect::fail(node.mismatch(other)),
        };

        let mut steps: Vec<Step> = (0..properties.len()).map(Step::Property).collect();
        for key in map.keys().filter(|k| !declared.contains(*k)) {
            for signature in 0..signatures.len() {
                steps.push(Step::Entry { signature, key: key.clone() });
            }
            steps.push(Step::Leftover(key.clone()));
        }

        let all = options.errors == ErrorMode::All;
        let excess = options.on_excess_property;
        let state = State { out: Object::new(), issues: Vec::new(), matched: HashSet::new() };
        let (properties, signatures, fold_map, fold_node) = (properties.clone(), signatures.clone(), map.clone(), node.clone());
        let fold_options = options.clone();
        let node = node.clone();

        try_fold(steps, state, move |mut state, step| match step {
            Step::Property(i) => {
                let p = &properties[i];
                let mut value = fold_map.get(&p.input_key).cloned();
                if value.is_none() && fold_options.variant == Variant::Make {
                    value = p.constructor_default.clone();
                }
                let (name, output_key, optional, annotations) =
                    (p.name.clone(), p.output_key.clone(), p.optional, p.annotations.clone());
                (p.parser)(value, &fold_options).then(move |result| {
                    Effect::succeed(match result {
                        Ok(Some(v)) => {
                            state.out.insert(output_key, v);
                            ControlFlow::Continue(state)
                        }
                        Ok(None) if optional => ControlFlow::Continue(state),
                        Ok(None) => state.record(
                            Issue::pointer(vec![PathKey::Key(name)], Issue::MissingKey { annotations }),
                            all,
                        ),
                        Err(issue) => state.record(Issue::pointer(vec![PathKey::Key(name)], issue), all),
                    })
                })
            }
            Step::Entry { signature, key } => {
                let value = fold_map.get(&key).cloned();
                let signature_ref = signatures.clone();
                let options = fold_options.clone();
                (signatures[signature].key)(Some(Value::String(key.clone())), &fold_options).then(move |parsed_key| {
                    let out_key = match parsed_key {
                        Ok(Some(k)) => match k {
                            Value::String(s) => s,
                            other => js_to_string(&other),
                        },
                        Err(issue) if issue.has_defect() => {
                            state.matched.insert(key.clone());
                            return Effect::succeed(state.record(Issue::pointer(vec![PathKey::Key(key)], issue), all));
                        }
                        // key outside this signature's domain
                        _ => return Effect::succeed(ControlFlow::Continue(state)),
                    };
                    state.matched.insert(key.clone());
                    let sig = &signature_ref[signature];
                    let merge = sig.merge.clone();
                    (sig.value)(value, &options).then(move |result| {
                        Effect::succeed(match result {
                            Ok(Some(v)) => state.insert(out_key, v, merge.as_ref(), all),
                            Ok(None) => ControlFlow::Continue(state),
                            Err(issue) => state.record(Issue::pointer(vec![PathKey::Key(key)], issue), all),
                        })
                    })
                })
            }
            Step::Leftover(key) => {
                if state.matched.contains(&key) {
                    return Effect::succeed(ControlFlow::Continue(state));
                }
                let value = fold_map.get(&key).cloned();
                Effect::succeed(match excess {
                    ExcessProperty::Ignore => ControlFlow::Continue(state),
                    ExcessProperty::Preserve => {
                        if let Some(v) = value {
                            state.out.insert(key, v);
                        }
                        ControlFlow::Continue(state)
                    }
                    ExcessProperty::Error => {
                        let issue = fold_node.issue(value, |ast, actual| Issue::UnexpectedKey { ast: ast.clone(), actual });
                        state.record(Issue::pointer(vec![PathKey::Key(key)], issue), all)
                    }
                })
            }
        })
        .and_then(move |state| {
            if state.issues.is_empty() {
                Effect::succeed(Some(Value::Object(state.out)))
            } else {
                let actual = Arc::try_unwrap(map).unwrap_or_else(|m| (*m).clone());
                Effect::fail(node.issue(Some(Value::Object(actual)), |ast, actual| Issue::collect(ast, actual, state.issues)))
            }
        })
    })
}
