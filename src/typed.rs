//! Typed boundary: decode through a schema, then deserialize into a Rust
//! type with the JSON path of any mismatch in the error.
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::ast::NodeRef;
use crate::issue::ParseError;
use crate::parser::{ParseOptions, decode_unknown_sync, encode_unknown_sync};
use crate::value::Value;

#[derive(Debug, Error)]
pub enum TypedError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("invalid JSON text: {0}")]
    Syntax(#[from] serde_json::Error),
    #[error("decoded value is not JSON-compatible: {0}")]
    NotJson(String),
    #[error("at JSON path {path} → {message}")]
    Deserialize { path: String, message: String },
}

fn deserialize_with_path<T: DeserializeOwned>(json: serde_json::Value) -> Result<T, TypedError> {
    serde_path_to_error::deserialize::<_, T>(json).map_err(|err| TypedError::Deserialize {
        path: err.path().to_string(),
        message: err.into_inner().to_string(),
    })
}

pub fn decode_into<T: DeserializeOwned>(node: &NodeRef, input: Value, options: &ParseOptions) -> Result<T, TypedError> {
    let decoded = decode_unknown_sync(node, input, options).map_err(ParseError::from)?;
    deserialize_with_path(decoded.try_to_json().map_err(TypedError::NotJson)?)
}

pub fn decode_str_into<T: DeserializeOwned>(node: &NodeRef, src: &str, options: &ParseOptions) -> Result<T, TypedError> {
    let json: serde_json::Value = serde_json::from_str(src)?;
    decode_into(node, Value::from(json), options)
}

pub fn encode_from<T: Serialize>(node: &NodeRef, value: &T, options: &ParseOptions) -> Result<Value, TypedError> {
    let json = serde_json::to_value(value)?;
    Ok(encode_unknown_sync(node, Value::from(json), options).map_err(ParseError::from)?)
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Node, PropertySignature};
    use crate::check;
    use crate::getter::Transformation;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Account {
        id: f64,
        tags: Vec<String>,
    }

    fn account() -> NodeRef {
        Arc::new(Node::structure(vec![
            PropertySignature::required(
                "id",
                Node::number().check(check::finite()).encode_to(Node::string(), Transformation::number_from_string()),
            ),
            PropertySignature::required("tags", Node::array(Node::string())),
        ]))
    }

    #[test]
    fn decodes_into_rust_types() {
        let out: Account = decode_str_into(&account(), r#"{"id": "7", "tags": ["a"]}"#, &ParseOptions::default()).unwrap();
        assert_eq!(out, Account { id: 7.0, tags: vec!["a".into()] });
    }

    #[test]
    fn schema_failures_surface_as_parse_errors() {
        let err = decode_str_into::<Account>(&account(), r#"{"id": "x", "tags": []}"#, &ParseOptions::default())
            .unwrap_err();
        match err {
            TypedError::Parse(e) => assert!(e.to_string().contains(r#"["id"]"#)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn type_mismatch_reports_the_json_path() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Wrong {
            tags: Vec<u8>,
        }
        let err = decode_str_into::<Wrong>(&account(), r#"{"id": "1", "tags": ["a"]}"#, &ParseOptions::default())
            .unwrap_err();
        match err {
            TypedError::Deserialize { path, .. } => assert_eq!(path, "tags[0]"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn encodes_from_rust_types() {
        let out = encode_from(&account(), &Account { id: 3.0, tags: vec![] }, &ParseOptions::default()).unwrap();
        assert_eq!(out, Value::from(serde_json::json!({"id": "3", "tags": []})));
    }
}
