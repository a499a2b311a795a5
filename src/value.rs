//! Runtime values flowing through the codec.
//!
//! Inputs arrive as `Value`, dispatchers hand back `Value`. Absence is not a
//! value: a missing property is `Option::<Value>::None`, which is distinct
//! from the present value `Value::Undefined`.
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use ordered_float::OrderedFloat;
use serde::{Serialize, Serializer};

pub type Object = IndexMap<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    BigInt(i128),
    String(String),
    Symbol(Sym),
    Date(DateTime<Utc>),
    Array(Vec<Value>),
    Object(Object),
}

/// Coarse runtime type of a value; unions narrow their candidates with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    BigInt,
    String,
    Symbol,
    Date,
    Array,
    Object,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Undefined => ValueKind::Undefined,
            Value::Null => ValueKind::Null,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::BigInt(_) => ValueKind::BigInt,
            Value::String(_) => ValueKind::String,
            Value::Symbol(_) => ValueKind::Symbol,
            Value::Date(_) => ValueKind::Date,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self { Value::String(s) => Some(s), _ => None }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self { Value::Number(n) => Some(*n), _ => None }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self { Value::Array(xs) => Some(xs), _ => None }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self { Value::Object(m) => Some(m), _ => None }
    }

    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Lossy projection into JSON: `undefined` and non-finite numbers become
    /// `null`, bigints become digit strings, dates become ISO-8601 strings.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Undefined | Value::Null => J::Null,
            Value::Boolean(b) => J::Bool(*b),
            Value::Number(n) => json_number(*n),
            Value::BigInt(i) => J::String(i.to_string()),
            Value::String(s) => J::String(s.clone()),
            Value::Symbol(s) => J::String(s.to_string()),
            Value::Date(d) => J::String(iso_date(d)),
            Value::Array(xs) => J::Array(xs.iter().map(Value::to_json).collect()),
            Value::Object(m) => J::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
        }
    }

    /// Strict projection into JSON following `JSON.stringify` rules: object
    /// entries holding `undefined` are omitted, bigints and symbols are
    /// rejected.
    pub fn try_to_json(&self) -> Result<serde_json::Value, String> {
        use serde_json::Value as J;
        Ok(match self {
            Value::Undefined => return Err("undefined is not representable as JSON".into()),
            Value::Symbol(s) => return Err(format!("{s} is not representable as JSON")),
            Value::BigInt(_) => return Err("Do not know how to serialize a BigInt".into()),
            Value::Array(xs) => J::Array(
                xs.iter()
                    .map(|x| match x {
                        Value::Undefined | Value::Symbol(_) => Ok(J::Null),
                        other => other.try_to_json(),
                    })
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(m) => {
                let mut out = serde_json::Map::new();
                for (k, v) in m {
                    if matches!(v, Value::Undefined | Value::Symbol(_)) { continue; }
                    out.insert(k.clone(), v.try_to_json()?);
                }
                J::Object(out)
            }
            other => other.to_json(),
        })
    }
}

fn json_number(n: f64) -> serde_json::Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null)
    }
}

pub(crate) fn iso_date(d: &DateTime<Utc>) -> String {
    d.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Number rendering that matches the way the values are usually written by
/// hand: `1` rather than `1.0`, `NaN`, `Infinity`.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{n:.0}")
    } else {
        format!("{n}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::BigInt(i) => write!(f, "{i}n"),
            Value::String(s) => f.write_str(&quote(s)),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Date(d) => f.write_str(&iso_date(d)),
            Value::Array(xs) => {
                f.write_str("[")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 { f.write_str(",")?; }
                    write!(f, "{x}")?;
                }
                f.write_str("]")
            }
            Value::Object(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 { f.write_str(",")?; }
                    write!(f, "{}:{v}", quote(k))?;
                }
                f.write_str("}")
            }
        }
    }
}

pub(crate) fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""))
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value as J;
        match v {
            J::Null => Value::Null,
            J::Bool(b) => Value::Boolean(b),
            J::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            J::String(s) => Value::String(s),
            J::Array(xs) => Value::Array(xs.into_iter().map(Value::from).collect()),
            J::Object(m) => Value::Object(m.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self { Value::Number(n) }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self { Value::Number(n as f64) }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Boolean(b) }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self { Value::Date(d) }
}

// ------------------------------- Symbols --------------------------------- //

/// A symbol compares by identity, never by description.
#[derive(Clone)]
pub struct Sym(Arc<str>);

impl Sym {
    pub fn new(description: &str) -> Self { Sym(Arc::from(description)) }
    pub fn description(&self) -> &str { &self.0 }
}

impl PartialEq for Sym {
    fn eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }
}

impl Eq for Sym {}

impl fmt::Debug for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Symbol({})", self.0) }
}

impl fmt::Display for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Symbol({})", self.0) }
}

// ------------------------------- Literals -------------------------------- //

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LiteralValue {
    Null,
    Boolean(bool),
    Number(OrderedFloat<f64>),
    BigInt(i128),
    String(String),
}

impl LiteralValue {
    pub fn matches(&self, v: &Value) -> bool {
        match (self, v) {
            (LiteralValue::Null, Value::Null) => true,
            (LiteralValue::Boolean(a), Value::Boolean(b)) => a == b,
            (LiteralValue::Number(a), Value::Number(b)) => a.0 == *b,
            (LiteralValue::BigInt(a), Value::BigInt(b)) => a == b,
            (LiteralValue::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            LiteralValue::Null => ValueKind::Null,
            LiteralValue::Boolean(_) => ValueKind::Boolean,
            LiteralValue::Number(_) => ValueKind::Number,
            LiteralValue::BigInt(_) => ValueKind::BigInt,
            LiteralValue::String(_) => ValueKind::String,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            LiteralValue::Null => Value::Null,
            LiteralValue::Boolean(b) => Value::Boolean(*b),
            LiteralValue::Number(n) => Value::Number(n.0),
            LiteralValue::BigInt(i) => Value::BigInt(*i),
            LiteralValue::String(s) => Value::String(s.clone()),
        }
    }

    /// Key-form used inside template literal patterns.
    pub(crate) fn as_template_text(&self) -> String {
        match self {
            LiteralValue::String(s) => s.clone(),
            LiteralValue::BigInt(i) => i.to_string(),
            LiteralValue::Number(n) => format_number(n.0),
            LiteralValue::Boolean(b) => b.to_string(),
            LiteralValue::Null => "null".to_string(),
        }
    }
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

impl From<&str> for LiteralValue {
    fn from(s: &str) -> Self { LiteralValue::String(s.to_string()) }
}

impl From<String> for LiteralValue {
    fn from(s: String) -> Self { LiteralValue::String(s) }
}

impl From<f64> for LiteralValue {
    fn from(n: f64) -> Self { LiteralValue::Number(OrderedFloat(n)) }
}

impl From<i32> for LiteralValue {
    fn from(n: i32) -> Self { LiteralValue::Number(OrderedFloat(n as f64)) }
}

impl From<bool> for LiteralValue {
    fn from(b: bool) -> Self { LiteralValue::Boolean(b) }
}

// ------------------------------- Tests ------------------------------------ //
