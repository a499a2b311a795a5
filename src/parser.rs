//! Codec engine.
//!
//! A dispatcher ([`Parser`]) is assembled once per node and direction and
//! memoized by node identity in a [`ParserCache`]. Assembly order:
//!
//! - decode:   outermost link → … → innermost link → structure → checks
//! - encode:   structure → checks → innermost link → … → outermost link
//! - validate: structure → checks (encoding chains ignored, recursively)
//!
//! Children are dispatched through the same cache, `Suspend` nodes lazily.
pub mod arr;
pub mod obj;
pub mod template;
pub mod union;

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ast::{DeclarationContext, Link, Node, NodeKind, NodeRef};
use crate::check::run_checks;
use crate::effect::{Effect, Services, catch, guard, try_fold};
use crate::issue::Issue;
use crate::value::Value;

// ------------------------------- Options --------------------------------- //

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Stop a composite at its first failing child.
    #[default]
    First,
    /// Report every failing child of a composite.
    All,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Decode,
    Validate,
    /// Like `Validate`, with constructor defaults filled in.
    Make,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExcessProperty {
    #[default]
    Ignore,
    Error,
    Preserve,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParseOptions {
    pub errors: ErrorMode,
    pub variant: Variant,
    pub on_excess_property: ExcessProperty,
    #[serde(skip)]
    pub services: Services,
}

impl ParseOptions {
    pub fn all() -> Self { Self { errors: ErrorMode::All, ..Self::default() } }

    pub fn with_errors(mut self, errors: ErrorMode) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_excess_property(mut self, policy: ExcessProperty) -> Self {
        self.on_excess_property = policy;
        self
    }

    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    fn with_variant(&self, variant: Variant) -> Self {
        Self { variant, ..self.clone() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Decode,
    Encode,
    /// The node's own type, encodings ignored.
    Validate,
}

impl Direction {
    fn slot(self) -> usize {
        match self {
            Direction::Decode => 0,
            Direction::Encode => 1,
            Direction::Validate => 2,
        }
    }
}

/// The assembled parse function for one node and direction.
pub type Parser = Arc<dyn Fn(Option<Value>, &ParseOptions) -> Effect<Option<Value>> + Send + Sync>;

pub(crate) fn dispatcher(
    f: impl Fn(Option<Value>, &ParseOptions) -> Effect<Option<Value>> + Send + Sync + 'static,
) -> Parser {
    Arc::new(f)
}

/// The node a dispatcher was built for, held weakly.
///
/// Cached dispatchers must not keep their node alive, or no cache entry
/// could ever be evicted.
#[derive(Clone)]
pub(crate) struct NodeHandle(Weak<Node>);

impl NodeHandle {
    pub(crate) fn new(node: &NodeRef) -> Self { Self(Arc::downgrade(node)) }

    pub(crate) fn upgrade(&self) -> Result<NodeRef, Issue> {
        self.0.upgrade().ok_or_else(|| dropped(None))
    }

    /// Builds an issue against the node, or a defect if it is gone.
    pub(crate) fn issue(&self, actual: Option<Value>, f: impl FnOnce(&NodeRef, Option<Value>) -> Issue) -> Issue {
        match self.0.upgrade() {
            Some(node) => f(&node, actual),
            None => dropped(actual),
        }
    }

    pub(crate) fn mismatch(&self, actual: Value) -> Issue {
        self.issue(Some(actual), |node, actual| Issue::mismatch(node, actual))
    }
}

fn dropped(actual: Option<Value>) -> Issue {
    Issue::forbidden(actual, "schema node was dropped while its dispatcher was in use")
}

// -------------------------------- Cache ---------------------------------- //

/// Tables are swept for dead nodes once they reach this size.
const PRUNE_FLOOR: usize = 64;

struct Entry {
    // The allocation outlives every `Weak`, so the key stays unique while cached.
    node: Weak<Node>,
    parser: Parser,
}

struct Table {
    entries: HashMap<usize, Entry>,
    prune_at: usize,
}

impl Table {
    fn new() -> Self { Self { entries: HashMap::new(), prune_at: PRUNE_FLOOR } }

    fn prune(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.node.strong_count() > 0);
        self.prune_at = (self.entries.len() * 2).max(PRUNE_FLOOR);
        before - self.entries.len()
    }
}

/// Dispatcher memo tables, one per direction, keyed by node identity.
///
/// Entries hold their node weakly; entries for dropped nodes are swept
/// whenever a table doubles past its last live size.
pub struct ParserCache {
    tables: [RwLock<Table>; 3],
    constructed: AtomicUsize,
}

static GLOBAL: Lazy<Arc<ParserCache>> = Lazy::new(|| Arc::new(ParserCache::new()));

impl Default for ParserCache {
    fn default() -> Self { Self::new() }
}

impl ParserCache {
    pub fn new() -> Self {
        Self {
            tables: [RwLock::new(Table::new()), RwLock::new(Table::new()), RwLock::new(Table::new())],
            constructed: AtomicUsize::new(0),
        }
    }

    /// Process-wide cache used by the free functions.
    pub fn global() -> Arc<ParserCache> { GLOBAL.clone() }

    pub fn parser(self: &Arc<Self>, node: &NodeRef, direction: Direction) -> Parser {
        let key = Arc::as_ptr(node) as usize;
        let table = &self.tables[direction.slot()];
        if let Some(entry) = table.read().entries.get(&key) {
            return entry.parser.clone();
        }
        // built without holding the lock: children go through this cache too
        let parser = build(self, node, direction);
        self.constructed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(kind = node.tag(), ?direction, "constructed parser");
        let mut table = table.write();
        if table.entries.len() >= table.prune_at {
            let removed = table.prune();
            tracing::debug!(removed, live = table.entries.len(), ?direction, "pruned parser cache");
        }
        table
            .entries
            .entry(key)
            .or_insert_with(|| Entry { node: Arc::downgrade(node), parser })
            .parser
            .clone()
    }

    /// Number of dispatchers built so far.
    pub fn constructed(&self) -> usize { self.constructed.load(Ordering::Relaxed) }

    /// Entries in one direction's table, including ones not yet swept.
    pub fn len(&self, direction: Direction) -> usize { self.tables[direction.slot()].read().entries.len() }

    pub fn is_empty(&self) -> bool { self.tables.iter().all(|t| t.read().entries.is_empty()) }

    pub fn contains(&self, node: &NodeRef, direction: Direction) -> bool {
        self.tables[direction.slot()].read().entries.contains_key(&(Arc::as_ptr(node) as usize))
    }

    /// Drops entries whose node is gone; returns how many were removed.
    pub fn prune(&self) -> usize {
        self.tables.iter().map(|t| t.write().prune()).sum()
    }

    pub fn clear(&self) {
        for table in &self.tables {
            let mut table = table.write();
            table.entries.clear();
            table.prune_at = PRUNE_FLOOR;
        }
    }
}

// ------------------------------- Assembly -------------------------------- //

fn build(cache: &Arc<ParserCache>, node: &NodeRef, direction: Direction) -> Parser {
    let structural = build_structural(cache, node, direction);

    let checked: Parser = if node.checks.is_empty() {
        structural
    } else {
        let node = NodeHandle::new(node);
        dispatcher(move |input, options| {
            let node = node.clone();
            let options = options.clone();
            structural(input, &options).and_then(move |out| match (out, node.upgrade()) {
                (Some(v), Ok(node)) => run_checks(&node, v, &options).map(Some),
                (Some(_), Err(issue)) => Effect::fail(issue),
                (None, _) => Effect::succeed(None),
            })
        })
    };

    let links = node.links();
    if links.is_empty() {
        return checked;
    }
    match direction {
        Direction::Validate => checked,
        Direction::Decode => {
            let steps: Vec<(usize, Parser)> = links
                .iter()
                .enumerate()
                .rev()
                .map(|(i, l)| (i, cache.parser(&l.to, Direction::Decode)))
                .collect();
            decode_chain(node, Arc::new(steps), checked)
        }
        Direction::Encode => {
            let steps: Vec<(usize, Parser)> = links
                .iter()
                .enumerate()
                .map(|(i, l)| (i, cache.parser(&l.to, Direction::Encode)))
                .collect();
            encode_chain(node, checked, Arc::new(steps))
        }
    }
}

/// Link steps are stored by index so the chain holds no node strongly.
fn decode_chain(node: &NodeRef, steps: Arc<Vec<(usize, Parser)>>, tail: Parser) -> Parser {
    let node = NodeHandle::new(node);
    dispatcher(move |input, options| {
        let node = match node.upgrade() {
            Ok(node) => node,
            Err(issue) => return Effect::fail(issue),
        };
        let steps = steps.clone();
        let fold_options = options.clone();
        let tail = tail.clone();
        let tail_options = options.clone();
        try_fold((0..steps.len()).collect(), input, move |value, i: usize| {
            let (link, parser) = steps[i].clone();
            let node = node.clone();
            let options = fold_options.clone();
            parser(value, &options)
                .and_then(move |v| link_step(&node, link, v, &options, Direction::Decode))
                .map(ControlFlow::Continue)
        })
        .and_then(move |v| tail(v, &tail_options))
    })
}

fn encode_chain(node: &NodeRef, head: Parser, steps: Arc<Vec<(usize, Parser)>>) -> Parser {
    let node = NodeHandle::new(node);
    dispatcher(move |input, options| {
        let node = match node.upgrade() {
            Ok(node) => node,
            Err(issue) => return Effect::fail(issue),
        };
        let steps = steps.clone();
        let fold_options = options.clone();
        head(input, options).and_then(move |encoded| {
            try_fold((0..steps.len()).collect(), encoded, move |value, i: usize| {
                let (link, parser) = steps[i].clone();
                let options = fold_options.clone();
                link_step(&node, link, value, &options, Direction::Encode)
                    .and_then(move |v| parser(v, &options))
                    .map(ControlFlow::Continue)
            })
        })
    })
}

/// One transformation step; its failures are tagged with the link.
fn link_step(node: &NodeRef, link: usize, value: Option<Value>, options: &ParseOptions, direction: Direction) -> Effect<Option<Value>> {
    let link: Link = node.links()[link].clone();
    let getter = match direction {
        Direction::Encode => &link.transformation.encode,
        _ => &link.transformation.decode,
    };
    let run = getter.run(value, node, options);
    run.map_err(move |issue| Issue::Encoding { link, issue: Box::new(issue) })
}

fn build_structural(cache: &Arc<ParserCache>, node: &NodeRef, direction: Direction) -> Parser {
    match &node.kind {
        NodeKind::Never => leaf(node, |_| false),
        NodeKind::Unknown => dispatcher(|input, _| Effect::succeed(input)),
        NodeKind::Null => leaf(node, |v| matches!(v, Value::Null)),
        NodeKind::Undefined => leaf(node, |v| matches!(v, Value::Undefined)),
        NodeKind::String => leaf(node, |v| matches!(v, Value::String(_))),
        NodeKind::Number => leaf(node, |v| matches!(v, Value::Number(_))),
        NodeKind::Boolean => leaf(node, |v| matches!(v, Value::Boolean(_))),
        NodeKind::BigInt => leaf(node, |v| matches!(v, Value::BigInt(_))),
        NodeKind::Symbol => leaf(node, |v| matches!(v, Value::Symbol(_))),
        NodeKind::Literal(literal) => {
            let literal = literal.clone();
            leaf(node, move |v| literal.matches(v))
        }
        NodeKind::UniqueSymbol(sym) => {
            let sym = sym.clone();
            leaf(node, move |v| matches!(v, Value::Symbol(s) if *s == sym))
        }
        NodeKind::Enums(entries) => {
            let values: Vec<_> = entries.iter().map(|(_, v)| v.clone()).collect();
            leaf(node, move |v| values.iter().any(|e| e.matches(v)))
        }
        NodeKind::TemplateLiteral(parts) => template::build(node, parts),
        NodeKind::Tuple { elements, rest } => arr::build(cache, node, elements, rest, direction),
        NodeKind::Struct { properties, index_signatures } => {
            obj::build(cache, node, properties, index_signatures, direction)
        }
        NodeKind::Union { members, mode } => union::build(cache, node, members, *mode, direction),
        NodeKind::Suspend(_) => suspended(cache, node, direction),
        NodeKind::Declaration(declaration) => {
            let type_parameters: Vec<Parser> = declaration
                .type_parameters
                .iter()
                .map(|t| cache.parser(t, direction))
                .collect();
            let run = declaration.run.clone();
            let node = NodeHandle::new(node);
            dispatcher(move |input, options| match input {
                None => Effect::succeed(None),
                Some(v) => {
                    let node = match node.upgrade() {
                        Ok(node) => node,
                        Err(issue) => return Effect::fail(issue),
                    };
                    let shown = v.clone();
                    guard(Some(&shown), || {
                        run(v, DeclarationContext { node: &node, type_parameters: &type_parameters, options, direction })
                    })
                    .map(Some)
                }
            })
        }
    }
}

/// Direct runtime test; absent input passes through untouched.
fn leaf(node: &NodeRef, test: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Parser {
    let node = NodeHandle::new(node);
    dispatcher(move |input, _| match input {
        None => Effect::succeed(None),
        Some(v) if test(&v) => Effect::succeed(Some(v)),
        Some(v) => Effect::fail(node.mismatch(v)),
    })
}

/// The thunk runs once (the node memoizes it); the target's dispatcher is
/// looked up in the cache on each visit, so no parser cycle is formed.
fn suspended(cache: &Arc<ParserCache>, node: &NodeRef, direction: Direction) -> Parser {
    let cache = Arc::downgrade(cache);
    let node = NodeHandle::new(node);
    dispatcher(move |input, options| {
        let resolved = resolve_suspended(&cache, &node, input.as_ref(), direction);
        match resolved {
            Ok(parser) => parser(input, options),
            Err(issue) => Effect::fail(issue),
        }
    })
}

fn resolve_suspended(
    cache: &Weak<ParserCache>,
    node: &NodeHandle,
    input: Option<&Value>,
    direction: Direction,
) -> Result<Parser, Issue> {
    let cache = cache
        .upgrade()
        .ok_or_else(|| Issue::forbidden(None, "parser cache dropped before a suspended node was resolved"))?;
    let node = node.upgrade()?;
    let target = catch(|| match &node.kind {
        NodeKind::Suspend(s) => s.resolve().clone(),
        _ => node.clone(),
    })
    .map_err(|err| {
        tracing::warn!(defect = %err, "suspended node thunk panicked");
        Issue::defect(input.cloned(), err)
    })?;
    Ok(cache.parser(&target, direction))
}

// ------------------------------- Front API -------------------------------- //

/// A schema graph bound to the cache its dispatchers live in.
#[derive(Clone)]
pub struct Codec {
    node: NodeRef,
    cache: Arc<ParserCache>,
}

impl Codec {
    pub fn new(node: impl Into<NodeRef>) -> Self {
        Self { node: node.into(), cache: ParserCache::global() }
    }

    pub fn with_cache(node: impl Into<NodeRef>, cache: Arc<ParserCache>) -> Self {
        Self { node: node.into(), cache }
    }

    pub fn node(&self) -> &NodeRef { &self.node }
    pub fn cache(&self) -> &Arc<ParserCache> { &self.cache }

    fn run(&self, direction: Direction, input: Value, options: &ParseOptions) -> Effect<Value> {
        let parser = self.cache.parser(&self.node, direction);
        parser(Some(input), options).map(|out| out.unwrap_or(Value::Undefined))
    }

    /// Dispatches on `options.variant`.
    pub fn parse(&self, input: Value, options: &ParseOptions) -> Effect<Value> {
        match options.variant {
            Variant::Decode => self.run(Direction::Decode, input, options),
            Variant::Validate | Variant::Make => self.run(Direction::Validate, input, options),
        }
    }

    pub fn decode(&self, input: Value, options: &ParseOptions) -> Effect<Value> {
        self.run(Direction::Decode, input, &options.with_variant(Variant::Decode))
    }

    pub fn encode(&self, input: Value, options: &ParseOptions) -> Effect<Value> {
        self.run(Direction::Encode, input, options)
    }

    pub fn validate(&self, input: Value, options: &ParseOptions) -> Effect<Value> {
        self.run(Direction::Validate, input, &options.with_variant(Variant::Validate))
    }

    pub fn make(&self, input: Value, options: &ParseOptions) -> Effect<Value> {
        self.run(Direction::Validate, input, &options.with_variant(Variant::Make))
    }

    pub fn decode_sync(&self, input: Value, options: &ParseOptions) -> Result<Value, Issue> {
        self.decode(input, options).run_sync()
    }

    pub fn encode_sync(&self, input: Value, options: &ParseOptions) -> Result<Value, Issue> {
        self.encode(input, options).run_sync()
    }

    pub fn validate_sync(&self, input: Value, options: &ParseOptions) -> Result<Value, Issue> {
        self.validate(input, options).run_sync()
    }
}

pub fn decode_unknown(node: &NodeRef, input: Value, options: &ParseOptions) -> Effect<Value> {
    Codec::new(node.clone()).decode(input, options)
}

pub fn encode_unknown(node: &NodeRef, input: Value, options: &ParseOptions) -> Effect<Value> {
    Codec::new(node.clone()).encode(input, options)
}

pub fn validate_unknown(node: &NodeRef, input: Value, options: &ParseOptions) -> Effect<Value> {
    Codec::new(node.clone()).validate(input, options)
}

pub fn make_unknown(node: &NodeRef, input: Value, options: &ParseOptions) -> Effect<Value> {
    Codec::new(node.clone()).make(input, options)
}

pub fn decode_unknown_sync(node: &NodeRef, input: Value, options: &ParseOptions) -> Result<Value, Issue> {
    decode_unknown(node, input, options).run_sync()
}

pub fn encode_unknown_sync(node: &NodeRef, input: Value, options: &ParseOptions) -> Result<Value, Issue> {
    encode_unknown(node, input, options).run_sync()
}

pub fn validate_unknown_sync(node: &NodeRef, input: Value, options: &ParseOptions) -> Result<Value, Issue> {
    validate_unknown(node, input, options).run_sync()
}

pub fn decode_unknown_async(node: &NodeRef, input: Value, options: &ParseOptions) -> BoxFuture<'static, Result<Value, Issue>> {
    decode_unknown(node, input, options).into_future()
}

pub fn encode_unknown_async(node: &NodeRef, input: Value, options: &ParseOptions) -> BoxFuture<'static, Result<Value, Issue>> {
    encode_unknown(node, input, options).into_future()
}

// ------------------------------ Built-ins --------------------------------- //

/// Instance check for `Value::Date`.
pub fn date() -> Node {
    Node::declare(Vec::new(), |v, cx| match v {
        Value::Date(_) => Effect::succeed(v),
        other => Effect::fail(Issue::invalid_type(cx.node, Some(other))),
    })
    .annotate(crate::ast::Annotations::expected("Date"))
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Annotations, Element, PropertySignature, TemplatePart};
    use crate::check::{self, Check};
    use crate::effect::tests::YieldNow;
    use crate::getter::{Getter, Transformation};
    use crate::issue::PathKey;
    use crate::value::Sym;
    use once_cell::sync::OnceCell;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn v(j: serde_json::Value) -> Value { Value::from(j) }

    fn finite_from_string() -> NodeRef {
        Arc::new(
            Node::number()
                .check(check::finite())
                .encode_to(Node::string(), Transformation::number_from_string()),
        )
    }

    /// Message of the captured panic at the bottom of `issue`.
    fn defect_cause(issue: &Issue) -> String {
        match issue {
            Issue::Forbidden { cause: Some(cause), .. } => cause.to_string(),
            Issue::Pointer { issue, .. } | Issue::Encoding { issue, .. } | Issue::Filter { issue, .. } => defect_cause(issue),
            other => panic!("expected a captured defect, got {other:?}"),
        }
    }

    /// Every leaf's path, in order.
    fn leaf_paths(issue: &Issue) -> Vec<(Vec<PathKey>, &'static str)> {
        crate::format::structured::format_structured(issue)
            .into_iter()
            .map(|r| (r.path, r.tag))
            .collect()
    }

    #[test]
    fn missing_optional_property_is_absent_in_output() {
        let node: NodeRef = Arc::new(Node::structure(vec![PropertySignature::optional("a", Node::string())]));
        let out = decode_unknown_sync(&node, v(json!({})), &ParseOptions::default()).unwrap();
        assert_eq!(out, v(json!({})));
    }

    #[test]
    fn missing_required_property_is_a_pointed_missing_key() {
        let node: NodeRef = Arc::new(Node::structure(vec![PropertySignature::required("a", Node::string())]));
        let issue = decode_unknown_sync(&node, v(json!({})), &ParseOptions::default()).unwrap_err();
        match issue {
            Issue::Pointer { path, issue } => {
                assert_eq!(path, vec![PathKey::from("a")]);
                assert!(matches!(*issue, Issue::MissingKey { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn coercion_round_trip() {
        let node = finite_from_string();
        let opts = ParseOptions::default();
        let encoded = encode_unknown_sync(&node, Value::from(42), &opts).unwrap();
        assert_eq!(encoded, Value::from("42"));
        assert_eq!(decode_unknown_sync(&node, encoded, &opts).unwrap(), Value::from(42));
        let decoded = decode_unknown_sync(&node, Value::from("42"), &opts).unwrap();
        assert_eq!(encode_unknown_sync(&node, decoded, &opts).unwrap(), Value::from("42"));
    }

    #[test]
    fn error_modes_differ_in_sibling_reporting() {
        let node: NodeRef = Arc::new(Node::structure(vec![
            PropertySignature::required("a", finite_from_string()),
            PropertySignature::required("b", finite_from_string()),
        ]));
        let input = v(json!({"a": "x", "b": "y"}));

        let first = decode_unknown_sync(&node, input.clone(), &ParseOptions::default()).unwrap_err();
        assert_eq!(leaf_paths(&first), vec![(vec![PathKey::from("a")], "InvalidValue")]);

        let all = decode_unknown_sync(&node, input, &ParseOptions::all()).unwrap_err();
        assert_eq!(all.tag(), "Composite");
        assert_eq!(
            leaf_paths(&all),
            vec![(vec![PathKey::from("a")], "InvalidValue"), (vec![PathKey::from("b")], "InvalidValue")]
        );
    }

    fn linked_list(thunk_calls: Arc<AtomicUsize>) -> NodeRef {
        let slot: Arc<OnceCell<NodeRef>> = Arc::new(OnceCell::new());
        let s = slot.clone();
        let next = Node::suspend(move || {
            thunk_calls.fetch_add(1, Ordering::SeqCst);
            s.get().cloned().expect("root is set before use")
        });
        let root: NodeRef = Arc::new(Node::structure(vec![
            PropertySignature::required("value", Node::number()),
            PropertySignature::required("next", Node::null_or(next)),
        ]));
        let _ = slot.set(root.clone());
        root
    }

    #[test]
    fn recursive_schema_decodes_and_reuses_dispatchers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let root = linked_list(calls.clone());
        let cache = Arc::new(ParserCache::new());
        let codec = Codec::with_cache(root.clone(), cache.clone());
        let input = v(json!({"value": 1, "next": {"value": 2, "next": {"value": 3, "next": null}}}));

        let out = codec.decode_sync(input.clone(), &ParseOptions::default()).unwrap();
        assert_eq!(out, input);
        let built = cache.constructed();

        let again = codec.decode_sync(input.clone(), &ParseOptions::default()).unwrap();
        assert_eq!(again, input);
        assert_eq!(cache.constructed(), built);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.contains(&root, Direction::Decode));
    }

    #[test]
    fn recursive_schema_reports_deep_paths() {
        let root = linked_list(Arc::new(AtomicUsize::new(0)));
        let input = v(json!({"value": 1, "next": {"value": "two", "next": null}}));
        let issue = decode_unknown_sync(&root, input, &ParseOptions::default()).unwrap_err();
        assert_eq!(
            leaf_paths(&issue),
            vec![(vec![PathKey::from("next"), PathKey::from("value")], "Mismatch")]
        );
    }

    #[test]
    fn union_exclusivity() {
        let a: NodeRef = Arc::new(Node::structure(vec![PropertySignature::required("a", Node::string())]));
        let b: NodeRef = Arc::new(Node::structure(vec![PropertySignature::required("b", Node::number())]));
        let input = v(json!({"a": "x", "b": 1}));

        let exclusive: NodeRef = Arc::new(Node::one_of(vec![a.clone(), b.clone()]));
        let issue = decode_unknown_sync(&exclusive, input.clone(), &ParseOptions::default()).unwrap_err();
        match issue {
            Issue::OneOf { successes, .. } => assert_eq!(successes.len(), 2),
            other => panic!("unexpected {other:?}"),
        }

        let inclusive: NodeRef = Arc::new(Node::union(vec![a, b]));
        let out = decode_unknown_sync(&inclusive, input, &ParseOptions::default()).unwrap();
        assert_eq!(out, v(json!({"a": "x"})));
    }

    #[test]
    fn aborting_check_stops_the_chain_even_in_all_mode() {
        let node: NodeRef = Arc::new(
            Node::string()
                .check(check::min_length(5).abort())
                .check(check::pattern(regex::Regex::new("^[0-9]+$").unwrap())),
        );
        let issue = decode_unknown_sync(&node, Value::from("ab"), &ParseOptions::all()).unwrap_err();
        match issue {
            Issue::Filter { check, .. } => assert!(check.abort),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_aborting_checks_accumulate_in_all_mode() {
        let node: NodeRef = Arc::new(
            Node::string()
                .check(check::min_length(5))
                .check(check::pattern(regex::Regex::new("^[0-9]+$").unwrap())),
        );
        let issue = decode_unknown_sync(&node, Value::from("ab"), &ParseOptions::all()).unwrap_err();
        assert_eq!(leaf_paths(&issue).len(), 2);
    }

    #[test]
    fn checks_do_not_run_on_absent_values() {
        let node: NodeRef = Arc::new(Node::structure(vec![PropertySignature::optional(
            "a",
            Node::string().check(Check::make(|_, _| -> bool { panic!("must not run") })),
        )]));
        assert!(decode_unknown_sync(&node, v(json!({})), &ParseOptions::default()).is_ok());
    }

    #[test]
    fn tuple_with_rest_and_tail() {
        let node: NodeRef = Arc::new(Node::tuple(
            vec![Element::required(Node::string()), Element::optional(Node::number())],
            vec![Arc::new(Node::boolean()), Arc::new(Node::null())],
        ));
        let opts = ParseOptions::default();
        assert!(decode_unknown_sync(&node, v(json!(["a", 1, true, false, null])), &opts).is_ok());
        assert!(decode_unknown_sync(&node, v(json!(["a", 1, null])), &opts).is_ok());
        let issue = decode_unknown_sync(&node, v(json!(["a", 1, true, "x", null])), &opts).unwrap_err();
        assert_eq!(leaf_paths(&issue), vec![(vec![PathKey::from(3usize)], "Mismatch")]);
        let missing = decode_unknown_sync(&node, v(json!([])), &ParseOptions::all()).unwrap_err();
        assert_eq!(
            leaf_paths(&missing),
            vec![(vec![PathKey::from(0usize)], "MissingKey"), (vec![PathKey::from(2usize)], "MissingKey")]
        );
    }

    #[test]
    fn tuple_without_rest_rejects_extra_elements() {
        let node: NodeRef = Arc::new(Node::tuple(vec![Element::required(Node::string())], vec![]));
        let issue = decode_unknown_sync(&node, v(json!(["a", 2])), &ParseOptions::default()).unwrap_err();
        assert_eq!(leaf_paths(&issue), vec![(vec![PathKey::from(1usize)], "UnexpectedKey")]);
    }

    #[test]
    fn excess_property_policies() {
        let node: NodeRef = Arc::new(Node::structure(vec![PropertySignature::required("a", Node::number())]));
        let input = v(json!({"a": 1, "b": 2}));
        let ignored = decode_unknown_sync(&node, input.clone(), &ParseOptions::default()).unwrap();
        assert_eq!(ignored, v(json!({"a": 1})));
        let preserved = decode_unknown_sync(
            &node,
            input.clone(),
            &ParseOptions::default().with_excess_property(ExcessProperty::Preserve),
        )
        .unwrap();
        assert_eq!(preserved, input);
        let issue = decode_unknown_sync(&node, input, &ParseOptions::default().with_excess_property(ExcessProperty::Error))
            .unwrap_err();
        assert_eq!(leaf_paths(&issue), vec![(vec![PathKey::from("b")], "UnexpectedKey")]);
    }

    #[test]
    fn record_keys_and_values_are_parsed() {
        let node: NodeRef = Arc::new(Node::record(Node::string().check(check::min_length(2)), finite_from_string()));
        let out = decode_unknown_sync(&node, v(json!({"ab": "1", "cd": "2"})), &ParseOptions::default()).unwrap();
        assert_eq!(out, v(json!({"ab": 1, "cd": 2})));
        // keys outside the key type are skipped
        let skipped = decode_unknown_sync(&node, v(json!({"a": "1"})), &ParseOptions::default()).unwrap();
        assert_eq!(skipped, v(json!({})));
        let issue = decode_unknown_sync(&node, v(json!({"ab": "x"})), &ParseOptions::default()).unwrap_err();
        assert_eq!(leaf_paths(&issue), vec![(vec![PathKey::from("ab")], "InvalidValue")]);
    }

    #[test]
    fn index_signature_collisions_use_merge() {
        let lower = Node::string().encode_to(Node::string(), Transformation::lowercase());
        let node: NodeRef = Arc::new(Node::structure(vec![]).index_signature(
            crate::ast::IndexSignature::new(lower, Node::number()).with_merge(|_, a, b| {
                Value::Number(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
            }),
        ));
        let out = decode_unknown_sync(&node, v(json!({"A": 1, "a": 2})), &ParseOptions::default()).unwrap();
        assert_eq!(out, v(json!({"a": 3})));
    }

    #[test]
    fn panicking_merge_is_reported_under_the_merged_key() {
        let lower = Node::string().encode_to(Node::string(), Transformation::lowercase());
        let node: NodeRef = Arc::new(Node::structure(vec![]).index_signature(
            crate::ast::IndexSignature::new(lower, Node::number()).with_merge(|_, _, _| panic!("merge defect")),
        ));
        let issue = decode_unknown_sync(&node, v(json!({"A": 1, "a": 2})), &ParseOptions::default()).unwrap_err();
        assert_eq!(leaf_paths(&issue), vec![(vec![PathKey::from("a")], "Forbidden")]);
        assert_eq!(issue.actual(), Some(&Value::from(1)));
        assert!(defect_cause(&issue).contains("merge defect"));
    }

    #[test]
    fn key_defects_are_reported_instead_of_skipping_the_key() {
        let opts = ParseOptions::default();
        let checked_key = Node::string().check(Check::make(|_: &Value, _: &ParseOptions| -> bool { panic!("key check defect") }));
        let node: NodeRef = Arc::new(Node::record(checked_key, Node::number()));
        let issue = decode_unknown_sync(&node, v(json!({"a": 1})), &opts).unwrap_err();
        assert_eq!(leaf_paths(&issue), vec![(vec![PathKey::from("a")], "Forbidden")]);
        assert!(defect_cause(&issue).contains("key check defect"));

        let broken = Getter::transform(|_| panic!("key getter defect"));
        let linked_key = Node::string().encode_to(Node::string(), Transformation::new(broken, Getter::passthrough()));
        let node: NodeRef = Arc::new(Node::record(linked_key, Node::number()));
        let issue = decode_unknown_sync(&node, v(json!({"a": 1})), &opts).unwrap_err();
        assert!(matches!(&issue, Issue::Pointer { path, .. } if *path == vec![PathKey::from("a")]));
        assert!(defect_cause(&issue).contains("key getter defect"));

        // an ordinary key mismatch still just skips the entry
        let node: NodeRef = Arc::new(Node::record(Node::literal("b"), Node::number()));
        assert_eq!(decode_unknown_sync(&node, v(json!({"a": 1})), &opts).unwrap(), v(json!({})));
    }

    #[test]
    fn encoded_keys_rename_properties_both_ways() {
        let node: NodeRef = Arc::new(Node::structure(vec![PropertySignature::required(
            "userId",
            Node::number().encoded_key("user_id"),
        )]));
        let opts = ParseOptions::default();
        let decoded = decode_unknown_sync(&node, v(json!({"user_id": 7})), &opts).unwrap();
        assert_eq!(decoded, v(json!({"userId": 7})));
        assert_eq!(encode_unknown_sync(&node, decoded, &opts).unwrap(), v(json!({"user_id": 7})));
    }

    #[test]
    fn validate_bypasses_encodings_recursively() {
        let node: NodeRef = Arc::new(Node::structure(vec![PropertySignature::required("n", finite_from_string())]));
        let opts = ParseOptions::default();
        assert!(validate_unknown_sync(&node, v(json!({"n": 3})), &opts).is_ok());
        let issue = validate_unknown_sync(&node, v(json!({"n": "3"})), &opts).unwrap_err();
        assert_eq!(leaf_paths(&issue), vec![(vec![PathKey::from("n")], "Mismatch")]);
    }

    #[test]
    fn make_fills_constructor_defaults() {
        let node: NodeRef = Arc::new(Node::structure(vec![
            PropertySignature::required("a", Node::number()).with_constructor_default(Value::from(0)),
        ]));
        let made = make_unknown(&node, v(json!({})), &ParseOptions::default()).run_sync().unwrap();
        assert_eq!(made, v(json!({"a": 0})));
        assert!(validate_unknown_sync(&node, v(json!({})), &ParseOptions::default()).is_err());
    }

    #[test]
    fn decoding_defaults_apply_to_missing_keys() {
        let node: NodeRef = Arc::new(Node::structure(vec![PropertySignature::required(
            "n",
            Node::number().encode_to(Node::number(), Transformation::with_decoding_default(Value::from(10))),
        )]));
        let out = decode_unknown_sync(&node, v(json!({})), &ParseOptions::default()).unwrap();
        assert_eq!(out, v(json!({"n": 10})));
    }

    #[test]
    fn transformation_failures_are_tagged_with_their_link() {
        let node: NodeRef = Arc::new(Node::bigint().encode_to(Node::string(), Transformation::bigint_from_string()));
        let issue = decode_unknown_sync(&node, Value::from("1.5"), &ParseOptions::all()).unwrap_err();
        assert_eq!(issue.tag(), "Encoding");
        assert_eq!(decode_unknown_sync(&node, Value::from("15"), &ParseOptions::default()).unwrap(), Value::BigInt(15));
    }

    #[test]
    fn multi_link_chain_decodes_outer_to_inner() {
        // outer: JSON text -> unknown value; inner: string -> trimmed string
        let node: NodeRef = Arc::new(
            Node::string()
                .check(check::trimmed())
                .encode_to(Node::string(), Transformation::trim())
                .encode_to(Node::string(), Transformation::json_from_string()),
        );
        let opts = ParseOptions::default();
        let out = decode_unknown_sync(&node, Value::from(r#""  hi  ""#), &opts).unwrap();
        assert_eq!(out, Value::from("hi"));
        assert_eq!(encode_unknown_sync(&node, out, &opts).unwrap(), Value::from(r#""hi""#));
    }

    #[test]
    fn union_narrows_by_runtime_type_and_sentinel() {
        let circle: NodeRef = Arc::new(Node::structure(vec![
            PropertySignature::required("kind", Node::literal("circle")),
            PropertySignature::required("radius", Node::number()),
        ]));
        let square: NodeRef = Arc::new(Node::structure(vec![
            PropertySignature::required("kind", Node::literal("square")),
            PropertySignature::required("side", Node::number()),
        ]));
        let node: NodeRef = Arc::new(Node::union(vec![Arc::new(Node::string()), circle, square]));
        let opts = ParseOptions::default();
        assert!(decode_unknown_sync(&node, v(json!({"kind": "square", "side": 2})), &opts).is_ok());
        // only the square member is a candidate, so its issue comes back bare
        let issue = decode_unknown_sync(&node, v(json!({"kind": "square", "side": "2"})), &opts).unwrap_err();
        assert_eq!(leaf_paths(&issue), vec![(vec![PathKey::from("side")], "Mismatch")]);
        let none = decode_unknown_sync(&node, Value::from(1), &opts).unwrap_err();
        assert_eq!(none.tag(), "Mismatch");
    }

    #[test]
    fn literal_enum_symbol_and_template_keywords() {
        let opts = ParseOptions::default();
        let lit: NodeRef = Arc::new(Node::literal(1));
        assert!(decode_unknown_sync(&lit, Value::from(1), &opts).is_ok());
        assert!(decode_unknown_sync(&lit, Value::from("1"), &opts).is_err());

        let enums: NodeRef = Arc::new(Node::enums([("A", "a"), ("B", "b")]));
        assert!(decode_unknown_sync(&enums, Value::from("b"), &opts).is_ok());
        assert!(decode_unknown_sync(&enums, Value::from("c"), &opts).is_err());

        let sym = Sym::new("token");
        let unique: NodeRef = Arc::new(Node::unique_symbol(sym.clone()));
        assert!(decode_unknown_sync(&unique, Value::Symbol(sym), &opts).is_ok());
        assert!(decode_unknown_sync(&unique, Value::Symbol(Sym::new("token")), &opts).is_err());

        let template: NodeRef = Arc::new(Node::template_literal(vec![
            TemplatePart::Literal("id-".into()),
            TemplatePart::Node(Arc::new(Node::number())),
        ]));
        assert!(decode_unknown_sync(&template, Value::from("id-42"), &opts).is_ok());
        assert!(decode_unknown_sync(&template, Value::from("id-x"), &opts).is_err());

        let never: NodeRef = Arc::new(Node::never());
        assert!(decode_unknown_sync(&never, Value::Null, &opts).is_err());
    }

    #[test]
    fn declaration_delegates_to_custom_parser() {
        let node: NodeRef = Arc::new(date());
        let opts = ParseOptions::default();
        let now = chrono::Utc::now();
        assert!(decode_unknown_sync(&node, Value::Date(now), &opts).is_ok());
        let issue = decode_unknown_sync(&node, Value::from("2020-01-01"), &opts).unwrap_err();
        assert_eq!(issue.tag(), "InvalidType");

        let dated: NodeRef = Arc::new(date().encode_to(Node::string(), Transformation::date_from_string()));
        let out = decode_unknown_sync(&dated, Value::from("2020-01-01T00:00:00Z"), &opts).unwrap();
        assert!(matches!(out, Value::Date(_)));
        assert_eq!(encode_unknown_sync(&dated, out, &opts).unwrap(), Value::from("2020-01-01T00:00:00.000Z"));
    }

    #[test]
    fn declaration_panics_come_back_as_defects() {
        let node: NodeRef = Arc::new(Node::declare(Vec::new(), |_, _| -> Effect<Value> { panic!("declaration defect") }));
        let issue = decode_unknown_sync(&node, Value::from(1), &ParseOptions::default()).unwrap_err();
        assert_eq!(issue.tag(), "Forbidden");
        assert_eq!(issue.actual(), Some(&Value::from(1)));
        assert!(defect_cause(&issue).contains("declaration defect"));
    }

    #[test]
    fn suspend_thunk_panics_come_back_as_defects() {
        let node: NodeRef = Arc::new(Node::structure(vec![PropertySignature::required(
            "next",
            Node::suspend(|| -> NodeRef { panic!("thunk defect") }),
        )]));
        let issue = decode_unknown_sync(&node, v(json!({"next": 1})), &ParseOptions::default()).unwrap_err();
        assert_eq!(leaf_paths(&issue), vec![(vec![PathKey::from("next")], "Forbidden")]);
        assert!(defect_cause(&issue).contains("thunk defect"));
    }

    #[test]
    fn link_getter_panics_are_tagged_with_the_link() {
        let broken = Getter::transform(|_| panic!("getter defect"));
        let node: NodeRef =
            Arc::new(Node::number().encode_to(Node::string(), Transformation::new(broken, Getter::passthrough())));
        let issue = decode_unknown_sync(&node, Value::from("1"), &ParseOptions::default()).unwrap_err();
        match &issue {
            Issue::Encoding { issue, .. } => assert!(matches!(**issue, Issue::Forbidden { cause: Some(_), .. })),
            other => panic!("unexpected {other:?}"),
        }
        assert!(defect_cause(&issue).contains("getter defect"));
    }

    #[test]
    fn declaration_type_parameters_use_the_same_direction() {
        // a "box" whose single field is parsed by the type parameter
        let boxed: NodeRef = Arc::new(Node::declare(vec![finite_from_string()], |v, cx| {
            let Value::Object(mut m) = v else {
                return Effect::fail(Issue::invalid_type(cx.node, None));
            };
            let inner = m.shift_remove("value");
            let mut out = m;
            let key = "value".to_string();
            cx.type_parameters[0](inner, cx.options).map(move |parsed| {
                if let Some(p) = parsed {
                    out.insert(key, p);
                }
                Value::Object(out)
            })
        }));
        let opts = ParseOptions::default();
        let out = decode_unknown_sync(&boxed, v(json!({"value": "5"})), &opts).unwrap();
        assert_eq!(out, v(json!({"value": 5})));
        assert_eq!(encode_unknown_sync(&boxed, out, &opts).unwrap(), v(json!({"value": "5"})));
    }

    fn slow_check() -> Check {
        Check::make_async(|v: Value, _o: ParseOptions| async move {
            YieldNow::new().await;
            v.as_str() != Some("taken")
        })
        .annotate(Annotations::message("username is taken"))
    }

    #[test]
    fn async_checks_run_on_an_executor_and_are_forbidden_synchronously() {
        let node: NodeRef = Arc::new(Node::structure(vec![PropertySignature::required(
            "name",
            Node::string().check(slow_check()),
        )]));
        let opts = ParseOptions::default();
        let ok = futures::executor::block_on(decode_unknown_async(&node, v(json!({"name": "free"})), &opts)).unwrap();
        assert_eq!(ok, v(json!({"name": "free"})));
        let err = futures::executor::block_on(decode_unknown_async(&node, v(json!({"name": "taken"})), &opts)).unwrap_err();
        assert_eq!(leaf_paths(&err), vec![(vec![PathKey::from("name")], "InvalidValue")]);

        let sync = decode_unknown_sync(&node, v(json!({"name": "free"})), &opts).unwrap_err();
        assert_eq!(sync.tag(), "Forbidden");
    }

    #[test]
    fn async_getter_without_suspension_still_runs_sync() {
        let upper = Getter::transform_or_fail(|v, _| Effect::from_future(async move {
            Ok(Value::from(v.as_str().unwrap_or_default().to_uppercase()))
        }));
        let node: NodeRef = Arc::new(Node::string().encode_to(Node::string(), Transformation::new(upper, Getter::passthrough())));
        assert_eq!(decode_unknown_sync(&node, Value::from("ab"), &ParseOptions::default()).unwrap(), Value::from("AB"));
    }

    #[test]
    fn options_load_from_configuration() {
        let opts: ParseOptions = serde_json::from_value(json!({"errors": "all", "onExcessProperty": "error"})).unwrap();
        assert_eq!(opts.errors, ErrorMode::All);
        assert_eq!(opts.on_excess_property, ExcessProperty::Error);
        assert_eq!(opts.variant, Variant::Decode);
    }

    #[test]
    fn separately_built_nodes_are_cached_separately() {
        let cache = Arc::new(ParserCache::new());
        let a: NodeRef = Arc::new(Node::string());
        let b: NodeRef = Arc::new(Node::string());
        let pa = cache.parser(&a, Direction::Decode);
        let pa2 = cache.parser(&a, Direction::Decode);
        let _pb = cache.parser(&b, Direction::Decode);
        assert!(Arc::ptr_eq(&pa, &pa2));
        assert_eq!(cache.len(Direction::Decode), 2);
        assert_eq!(cache.len(Direction::Encode), 0);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn dropped_nodes_are_swept_from_the_cache() {
        let cache = Arc::new(ParserCache::new());
        let opts = ParseOptions::default();
        let kept: NodeRef = Arc::new(Node::string());
        Codec::with_cache(kept.clone(), cache.clone()).decode_sync(Value::from("x"), &opts).unwrap();
        for _ in 0..1000 {
            let node: NodeRef = Arc::new(Node::structure(vec![PropertySignature::required("a", Node::string())]));
            Codec::with_cache(node, cache.clone()).decode_sync(v(json!({"a": "x"})), &opts).unwrap();
        }
        assert!(cache.len(Direction::Decode) <= PRUNE_FLOOR);
        // the last schema is dropped but not yet swept
        assert!(cache.prune() >= 2);
        assert_eq!(cache.len(Direction::Decode), 1);
        assert!(cache.contains(&kept, Direction::Decode));
    }

    #[test]
    fn free_functions_do_not_keep_transient_nodes_alive() {
        let opts = ParseOptions::default();
        let first = finite_from_string();
        let watch = Arc::downgrade(&first);
        decode_unknown_sync(&first, Value::from("1"), &opts).unwrap();
        drop(first);
        assert!(watch.upgrade().is_none());

        for _ in 0..1000 {
            let node: NodeRef = Arc::new(Node::string());
            decode_unknown_sync(&node, Value::from("x"), &opts).unwrap();
        }
        ParserCache::global().prune();
        assert!(ParserCache::global().len(Direction::Decode) < 1000);
    }

}
