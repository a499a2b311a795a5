//! Schema codec and validation engine.
//!
//! Build a schema graph out of [`ast::Node`]s, then decode, encode, validate
//! or construct values against it. Failures come back as a structured
//! [`issue::Issue`] tree that the [`format`] module renders.
//!
//! ```ignore
//! let node: NodeRef = Arc::new(Node::structure(vec![
//!     PropertySignature::required("id", Node::number().encode_to(Node::string(), Transformation::number_from_string())),
//! ]));
//! let out = decode_unknown_sync(&node, json!({"id": "7"}).into(), &ParseOptions::default())?;
//! ```
pub mod ast;
pub mod check;
pub mod effect;
pub mod format;
pub mod getter;
pub mod issue;
pub mod parser;
pub mod typed;
pub mod value;

pub use ast::{Annotations, Element, IndexSignature, Message, Node, NodeKind, NodeRef, PropertySignature, TemplatePart};
pub use check::{Check, CheckOutcome};
pub use effect::{Effect, Services};
pub use format::{format_standard, format_structured, format_tree};
pub use getter::{Getter, Transformation};
pub use issue::{Issue, ParseError, PathKey};
pub use parser::{
    Codec, Direction, ErrorMode, ExcessProperty, ParseOptions, Parser, ParserCache, Variant, decode_unknown,
    decode_unknown_async, decode_unknown_sync, encode_unknown, encode_unknown_async, encode_unknown_sync, make_unknown,
    validate_unknown, validate_unknown_sync,
};
pub use value::{LiteralValue, Sym, Value, ValueKind};
