//! Schema graph.
//!
//! Pure data: nodes describe a shape, carry checks and an optional encoding
//! chain, and never parse anything themselves. Nodes are shared behind
//! `Arc` and compared by identity when the engine memoizes dispatchers.
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::OnceCell;

use crate::check::Check;
use crate::effect::Effect;
use crate::getter::Transformation;
use crate::issue::Issue;
use crate::parser::{Direction, ParseOptions, Parser};
use crate::value::{LiteralValue, Sym, Value};

pub type NodeRef = Arc<Node>;

pub struct Node {
    pub kind: NodeKind,
    pub annotations: Option<Arc<Annotations>>,
    pub checks: Vec<Check>,
    pub encoding: Option<Encoding>,
}

pub enum NodeKind {
    Never,
    Unknown,
    Null,
    Undefined,
    String,
    Number,
    Boolean,
    BigInt,
    Symbol,
    Literal(LiteralValue),
    UniqueSymbol(Sym),
    TemplateLiteral(Vec<TemplatePart>),
    Enums(Vec<(String, LiteralValue)>),
    Tuple { elements: Vec<Element>, rest: Vec<NodeRef> },
    Struct { properties: Vec<PropertySignature>, index_signatures: Vec<IndexSignature> },
    Union { members: Vec<NodeRef>, mode: UnionMode },
    Suspend(Suspend),
    Declaration(Declaration),
}

#[derive(Clone)]
pub struct Element {
    pub ty: NodeRef,
    pub optional: bool,
}

impl Element {
    pub fn required(ty: impl Into<NodeRef>) -> Self { Self { ty: ty.into(), optional: false } }
    pub fn optional(ty: impl Into<NodeRef>) -> Self { Self { ty: ty.into(), optional: true } }
}

#[derive(Clone)]
pub struct PropertySignature {
    pub name: String,
    pub ty: NodeRef,
    pub optional: bool,
    /// Filled in for a missing key when parsing with the `make` variant.
    pub constructor_default: Option<Value>,
}

impl PropertySignature {
    pub fn required(name: impl Into<String>, ty: impl Into<NodeRef>) -> Self {
        Self { name: name.into(), ty: ty.into(), optional: false, constructor_default: None }
    }

    pub fn optional(name: impl Into<String>, ty: impl Into<NodeRef>) -> Self {
        Self { name: name.into(), ty: ty.into(), optional: true, constructor_default: None }
    }

    pub fn with_constructor_default(mut self, value: Value) -> Self {
        self.constructor_default = Some(value);
        self
    }

    /// Key under which the property lives on the encoded side.
    pub fn encoded_name(&self) -> &str {
        self.ty
            .encoding
            .as_ref()
            .and_then(|e| e.encoded_key.as_deref())
            .unwrap_or(&self.name)
    }
}

/// Resolves two values that landed on the same output key.
pub type KeyMerge = Arc<dyn Fn(&str, Value, Value) -> Value + Send + Sync>;

#[derive(Clone)]
pub struct IndexSignature {
    pub key: NodeRef,
    pub value: NodeRef,
    pub merge: Option<KeyMerge>,
}

impl IndexSignature {
    pub fn new(key: impl Into<NodeRef>, value: impl Into<NodeRef>) -> Self {
        Self { key: key.into(), value: value.into(), merge: None }
    }

    pub fn with_merge(mut self, merge: impl Fn(&str, Value, Value) -> Value + Send + Sync + 'static) -> Self {
        self.merge = Some(Arc::new(merge));
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnionMode {
    /// First matching member wins.
    #[default]
    AnyOf,
    /// Exactly one member may match.
    OneOf,
}

#[derive(Clone)]
pub enum TemplatePart {
    Literal(String),
    Node(NodeRef),
}

// ------------------------------- Encoding -------------------------------- //

/// Chain from the node's own representation outward. `links[0]` sits next
/// to the node, the last link is the most external form.
#[derive(Clone, Default)]
pub struct Encoding {
    pub links: Vec<Link>,
    /// Renamed key when this node is a struct property.
    pub encoded_key: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Link {
    pub to: NodeRef,
    pub transformation: Transformation,
}

// ------------------------------ Annotations ------------------------------ //

#[derive(Clone)]
pub enum Message {
    Text(String),
    Build(Arc<dyn Fn(&Issue) -> String + Send + Sync>),
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Message::Build(_) => f.write_str("Build(..)"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Annotations {
    pub identifier: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub expected: Option<String>,
    pub message: Option<Message>,
    pub missing_key_message: Option<Message>,
    pub meta: IndexMap<String, serde_json::Value>,
}

impl Annotations {
    pub fn expected(text: impl Into<String>) -> Self {
        Self { expected: Some(text.into()), ..Self::default() }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self { message: Some(Message::Text(text.into())), ..Self::default() }
    }

    pub fn with_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }

    /// Human label for the described shape, if any was given.
    pub fn label(&self) -> Option<&str> {
        self.expected.as_deref()
            .or(self.identifier.as_deref())
            .or(self.title.as_deref())
    }
}

// --------------------------- Lazy & custom nodes -------------------------- //

pub struct Suspend {
    thunk: Arc<dyn Fn() -> NodeRef + Send + Sync>,
    resolved: OnceCell<NodeRef>,
}

impl Suspend {
    pub fn new(thunk: impl Fn() -> NodeRef + Send + Sync + 'static) -> Self {
        Self { thunk: Arc::new(thunk), resolved: OnceCell::new() }
    }

    /// Runs the thunk on first use only.
    pub fn resolve(&self) -> &NodeRef {
        self.resolved.get_or_init(|| {
            let node = (self.thunk)();
            tracing::debug!(kind = node.tag(), "resolved suspended node");
            node
        })
    }
}

pub struct DeclarationContext<'a> {
    pub node: &'a NodeRef,
    /// Dispatchers for the type parameters, built for `direction`.
    pub type_parameters: &'a [Parser],
    pub options: &'a ParseOptions,
    pub direction: Direction,
}

pub type DeclarationFn = Arc<dyn Fn(Value, DeclarationContext<'_>) -> Effect<Value> + Send + Sync>;

pub struct Declaration {
    pub type_parameters: Vec<NodeRef>,
    pub run: DeclarationFn,
}

// ------------------------------ Constructors ------------------------------ //

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self { kind, annotations: None, checks: Vec::new(), encoding: None }
    }

    pub fn never() -> Self { Self::new(NodeKind::Never) }
    pub fn unknown() -> Self { Self::new(NodeKind::Unknown) }
    pub fn null() -> Self { Self::new(NodeKind::Null) }
    pub fn undefined() -> Self { Self::new(NodeKind::Undefined) }
    pub fn string() -> Self { Self::new(NodeKind::String) }
    pub fn number() -> Self { Self::new(NodeKind::Number) }
    pub fn boolean() -> Self { Self::new(NodeKind::Boolean) }
    pub fn bigint() -> Self { Self::new(NodeKind::BigInt) }
    pub fn symbol() -> Self { Self::new(NodeKind::Symbol) }

    pub fn literal(value: impl Into<LiteralValue>) -> Self {
        Self::new(NodeKind::Literal(value.into()))
    }

    pub fn unique_symbol(sym: Sym) -> Self { Self::new(NodeKind::UniqueSymbol(sym)) }

    pub fn template_literal(parts: Vec<TemplatePart>) -> Self {
        Self::new(NodeKind::TemplateLiteral(parts))
    }

    pub fn enums<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<LiteralValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::new(NodeKind::Enums(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect()))
    }

    pub fn tuple(elements: Vec<Element>, rest: Vec<NodeRef>) -> Self {
        Self::new(NodeKind::Tuple { elements, rest })
    }

    pub fn array(item: impl Into<NodeRef>) -> Self {
        Self::tuple(Vec::new(), vec![item.into()])
    }

    pub fn structure(properties: Vec<PropertySignature>) -> Self {
        Self::new(NodeKind::Struct { properties, index_signatures: Vec::new() })
    }

    pub fn record(key: impl Into<NodeRef>, value: impl Into<NodeRef>) -> Self {
        Self::new(NodeKind::Struct {
            properties: Vec::new(),
            index_signatures: vec![IndexSignature::new(key, value)],
        })
    }

    pub fn union(members: Vec<NodeRef>) -> Self {
        Self::new(NodeKind::Union { members, mode: UnionMode::AnyOf })
    }

    pub fn one_of(members: Vec<NodeRef>) -> Self {
        Self::new(NodeKind::Union { members, mode: UnionMode::OneOf })
    }

    pub fn null_or(node: impl Into<NodeRef>) -> Self {
        Self::union(vec![node.into(), Arc::new(Node::null())])
    }

    pub fn suspend(thunk: impl Fn() -> NodeRef + Send + Sync + 'static) -> Self {
        Self::new(NodeKind::Suspend(Suspend::new(thunk)))
    }

    pub fn declare(
        type_parameters: Vec<NodeRef>,
        run: impl Fn(Value, DeclarationContext<'_>) -> Effect<Value> + Send + Sync + 'static,
    ) -> Self {
        Self::new(NodeKind::Declaration(Declaration { type_parameters, run: Arc::new(run) }))
    }

    // ---- builder-style modifiers (consume, return) ----

    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn annotate(mut self, annotations: Annotations) -> Self {
        self.annotations = Some(Arc::new(annotations));
        self
    }

    /// Adds one link on the external side of the current chain.
    pub fn encode_to(mut self, to: impl Into<NodeRef>, transformation: Transformation) -> Self {
        self.encoding
            .get_or_insert_with(Encoding::default)
            .links
            .push(Link { to: to.into(), transformation });
        self
    }

    pub fn encoded_key(mut self, key: impl Into<String>) -> Self {
        self.encoding.get_or_insert_with(Encoding::default).encoded_key = Some(key.into());
        self
    }

    /// Adds an index signature to a `Struct` node.
    ///
    /// Any other kind has nowhere to hold one: release builds ignore the
    /// call, debug builds panic.
    pub fn index_signature(mut self, signature: IndexSignature) -> Self {
        let tag = self.tag();
        match &mut self.kind {
            NodeKind::Struct { index_signatures, .. } => index_signatures.push(signature),
            _ => debug_assert!(false, "index signature added to a non-struct node ({tag})"),
        }
        self
    }

    // ---- introspection ----

    pub fn links(&self) -> &[Link] {
        self.encoding.as_ref().map(|e| e.links.as_slice()).unwrap_or(&[])
    }

    pub fn tag(&self) -> &'static str {
        match &self.kind {
            NodeKind::Never => "Never",
            NodeKind::Unknown => "Unknown",
            NodeKind::Null => "Null",
            NodeKind::Undefined => "Undefined",
            NodeKind::String => "String",
            NodeKind::Number => "Number",
            NodeKind::Boolean => "Boolean",
            NodeKind::BigInt => "BigInt",
            NodeKind::Symbol => "Symbol",
            NodeKind::Literal(_) => "Literal",
            NodeKind::UniqueSymbol(_) => "UniqueSymbol",
            NodeKind::TemplateLiteral(_) => "TemplateLiteral",
            NodeKind::Enums(_) => "Enums",
            NodeKind::Tuple { .. } => "Tuple",
            NodeKind::Struct { .. } => "Struct",
            NodeKind::Union { .. } => "Union",
            NodeKind::Suspend(_) => "Suspend",
            NodeKind::Declaration(_) => "Declaration",
        }
    }

    /// Description of the shape this node expects, used by messages.
    pub fn expected(&self) -> String {
        if let Some(label) = self.annotations.as_deref().and_then(Annotations::label) {
            return label.to_string();
        }
        match &self.kind {
            NodeKind::Never => "never".into(),
            NodeKind::Unknown => "unknown".into(),
            NodeKind::Null => "null".into(),
            NodeKind::Undefined => "undefined".into(),
            NodeKind::String => "string".into(),
            NodeKind::Number => "number".into(),
            NodeKind::Boolean => "boolean".into(),
            NodeKind::BigInt => "bigint".into(),
            NodeKind::Symbol => "symbol".into(),
            NodeKind::Literal(l) => l.to_string(),
            NodeKind::UniqueSymbol(s) => s.to_string(),
            NodeKind::TemplateLiteral(parts) => {
                let mut out = String::from("`");
                for part in parts {
                    match part {
                        TemplatePart::Literal(s) => out.push_str(s),
                        TemplatePart::Node(n) => out.push_str(&format!("${{{}}}", n.expected())),
                    }
                }
                out.push('`');
                out
            }
            NodeKind::Enums(entries) => entries
                .iter()
                .map(|(_, v)| v.to_string())
                .collect::<Vec<_>>()
                .join(" | "),
            NodeKind::Tuple { elements, rest } => {
                let mut parts: Vec<String> = elements
                    .iter()
                    .map(|e| if e.optional { format!("{}?", e.ty.expected()) } else { e.ty.expected() })
                    .collect();
                if let Some((head, tail)) = rest.split_first() {
                    parts.push(format!("...{}[]", head.expected()));
                    parts.extend(tail.iter().map(|t| t.expected()));
                }
                format!("readonly [{}]", parts.join(", "))
            }
            NodeKind::Struct { properties, index_signatures } => {
                if properties.is_empty() && index_signatures.is_empty() {
                    return "{}".into();
                }
                let mut parts: Vec<String> = properties
                    .iter()
                    .map(|p| {
                        let q = if p.optional { "?" } else { "" };
                        format!("readonly {}{q}: {}", crate::value::quote(&p.name), p.ty.expected())
                    })
                    .collect();
                parts.extend(index_signatures.iter().map(|is| {
                    format!("readonly [x: {}]: {}", is.key.expected(), is.value.expected())
                }));
                format!("{{ {} }}", parts.join("; "))
            }
            NodeKind::Union { members, .. } => {
                if members.is_empty() {
                    return "never".into();
                }
                members.iter().map(|m| m.expected()).collect::<Vec<_>>().join(" | ")
            }
            NodeKind::Suspend(_) => "Suspend".into(),
            NodeKind::Declaration(_) => "<Declaration>".into(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("tag", &self.tag())
            .field("expected", &self.expected())
            .field("checks", &self.checks.len())
            .field("links", &self.links().len())
            .finish()
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_describes_nested_shapes() {
        let node = Node::structure(vec![
            PropertySignature::required("a", Node::string()),
            PropertySignature::optional("b", Node::array(Node::number())),
        ]);
        assert_eq!(node.expected(), r#"{ readonly "a": string; readonly "b"?: readonly [...number[]] }"#);
    }

    #[test]
    fn annotations_override_expected() {
        let node = Node::string().annotate(Annotations::expected("a user id"));
        assert_eq!(node.expected(), "a user id");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "non-struct node (String)")]
    fn index_signature_on_a_non_struct_node_is_caught_in_debug() {
        let _ = Node::string().index_signature(IndexSignature::new(Node::string(), Node::number()));
    }

    #[test]
    fn suspend_resolves_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let s = Suspend::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Arc::new(Node::string())
        });
        let a = s.resolve().clone();
        let b = s.resolve().clone();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn encoded_key_is_read_from_the_property_type() {
        let p = PropertySignature::required("userId", Node::string().encoded_key("user_id"));
        assert_eq!(p.encoded_name(), "user_id");
        let q = PropertySignature::required("name", Node::string());
        assert_eq!(q.encoded_name(), "name");
    }
}
