//! Getters and transformations.
//!
//! A [`Getter`] is one step between two representations. It sees the
//! optional input (a missing property arrives as `None`) and may answer
//! with a value, no value, or an issue. A [`Transformation`] pairs the
//! decode getter with its inverse; the pair is not verified to actually be
//! inverse, that is up to whoever builds it.
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::ast::NodeRef;
use crate::effect::{Effect, guard};
use crate::issue::Issue;
use crate::parser::ParseOptions;
use crate::value::{Value, format_number, iso_date};

type GetterFn = dyn Fn(Option<Value>, &NodeRef, &ParseOptions) -> Effect<Option<Value>> + Send + Sync;

#[derive(Clone)]
pub struct Getter {
    run: Arc<GetterFn>,
}

impl fmt::Debug for Getter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("Getter(..)") }
}

impl Getter {
    pub fn new(f: impl Fn(Option<Value>, &NodeRef, &ParseOptions) -> Effect<Option<Value>> + Send + Sync + 'static) -> Self {
        Getter { run: Arc::new(f) }
    }

    pub fn run(&self, input: Option<Value>, node: &NodeRef, options: &ParseOptions) -> Effect<Option<Value>> {
        guard(None, || (self.run)(input, node, options))
    }

    /// `self` first, then `next`.
    pub fn compose(&self, next: &Getter) -> Getter {
        let first = self.clone();
        let next = next.clone();
        Getter::new(move |input, node, options| {
            let next = next.clone();
            let node = node.clone();
            let options = options.clone();
            first.run(input, &node, &options).and_then(move |v| next.run(v, &node, &options))
        })
    }

    // ---- presence ----

    pub fn passthrough() -> Self {
        Getter::new(|input, _, _| Effect::succeed(input))
    }

    pub fn fail(builder: impl Fn(Option<Value>) -> Issue + Send + Sync + 'static) -> Self {
        Getter::new(move |input, _, _| Effect::fail(builder(input)))
    }

    /// Missing input becomes a `MissingKey` issue.
    pub fn required() -> Self {
        Getter::new(|input, _, _| match input {
            None => Effect::fail(Issue::missing_key()),
            some => Effect::succeed(some),
        })
    }

    pub fn on_missing(f: impl Fn(&ParseOptions) -> Effect<Option<Value>> + Send + Sync + 'static) -> Self {
        Getter::new(move |input, _, options| match input {
            None => f(options),
            some => Effect::succeed(some),
        })
    }

    pub fn on_defined(f: impl Fn(Value, &ParseOptions) -> Effect<Option<Value>> + Send + Sync + 'static) -> Self {
        Getter::new(move |input, _, options| match input {
            Some(v) => f(v, options),
            None => Effect::succeed(None),
        })
    }

    pub fn with_default(value: Value) -> Self {
        Getter::on_missing(move |_| Effect::succeed(Some(value.clone())))
    }

    pub fn transform(f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        Getter::on_defined(move |v, _| Effect::succeed(Some(f(v))))
    }

    pub fn transform_or_fail(f: impl Fn(Value, &ParseOptions) -> Effect<Value> + Send + Sync + 'static) -> Self {
        Getter::on_defined(move |v, options| f(v, options).map(Some))
    }

    /// A fallible transform whose errors are defects, not validation failures.
    pub fn try_transform(f: impl Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static) -> Self {
        Getter::on_defined(move |v, _| {
            let actual = v.clone();
            match f(v) {
                Ok(out) => Effect::succeed(Some(out)),
                Err(err) => Effect::fail(Issue::defect(Some(actual), err)),
            }
        })
    }

    // ---- coercions ----

    pub fn to_string() -> Self { Getter::transform(|v| Value::String(js_to_string(&v))) }
    pub fn to_number() -> Self { Getter::transform(|v| Value::Number(js_to_number(&v))) }
    pub fn to_boolean() -> Self { Getter::transform(|v| Value::Boolean(truthy(&v))) }

    pub fn to_bigint() -> Self {
        Getter::transform_or_fail(|v, _| match js_to_bigint(&v) {
            Some(i) => Effect::succeed(Value::BigInt(i)),
            None => Effect::fail(Issue::invalid_value_with(Some(v.clone()), format!("Cannot convert {v} to a BigInt"))),
        })
    }

    pub fn to_date() -> Self {
        Getter::transform_or_fail(|v, _| match js_to_date(&v) {
            Some(d) => Effect::succeed(Value::Date(d)),
            None => Effect::fail(Issue::invalid_value_with(Some(v), "Invalid date")),
        })
    }

    // ---- strings ----

    pub fn trim() -> Self { Getter::map_str(|s| s.trim().to_string()) }
    pub fn to_lower_case() -> Self { Getter::map_str(str::to_lowercase) }
    pub fn to_upper_case() -> Self { Getter::map_str(str::to_uppercase) }

    pub fn capitalize() -> Self {
        Getter::map_str(|s| {
            let mut cs = s.chars();
            match cs.next() {
                Some(c) => c.to_uppercase().chain(cs).collect(),
                None => String::new(),
            }
        })
    }

    pub fn uncapitalize() -> Self {
        Getter::map_str(|s| {
            let mut cs = s.chars();
            match cs.next() {
                Some(c) => c.to_lowercase().chain(cs).collect(),
                None => String::new(),
            }
        })
    }

    fn map_str(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Getter::transform(move |v| match v {
            Value::String(s) => Value::String(f(&s)),
            other => other,
        })
    }

    // ---- JSON text ----

    pub fn parse_json() -> Self {
        Getter::transform_or_fail(|v, _| {
            let Value::String(text) = &v else {
                return Effect::fail(Issue::invalid_value_with(Some(v.clone()), "Expected JSON text"));
            };
            match serde_json::from_str::<serde_json::Value>(text) {
                Ok(json) => Effect::succeed(Value::from(json)),
                Err(err) => Effect::fail(Issue::invalid_value_with(Some(v.clone()), err.to_string())),
            }
        })
    }

    pub fn stringify_json() -> Self {
        Getter::transform_or_fail(|v, _| match v.try_to_json().and_then(|j| serde_json::to_string(&j).map_err(|e| e.to_string())) {
            Ok(text) => Effect::succeed(Value::String(text)),
            Err(message) => Effect::fail(Issue::invalid_value_with(Some(v), message)),
        })
    }
}

// ------------------------------- Coercion -------------------------------- //

pub fn js_to_string(v: &Value) -> String {
    match v {
        Value::Undefined => "undefined".into(),
        Value::Null => "null".into(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::BigInt(i) => i.to_string(),
        Value::String(s) => s.clone(),
        Value::Symbol(s) => s.to_string(),
        Value::Date(d) => iso_date(d),
        Value::Array(xs) => xs
            .iter()
            .map(|x| match x {
                Value::Undefined | Value::Null => String::new(),
                other => js_to_string(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".into(),
    }
}

pub fn js_to_number(v: &Value) -> f64 {
    match v {
        Value::Number(n) => *n,
        Value::Boolean(b) => if *b { 1.0 } else { 0.0 },
        Value::Null => 0.0,
        Value::BigInt(i) => *i as f64,
        Value::Date(d) => d.timestamp_millis() as f64,
        Value::String(s) => parse_number_text(s),
        Value::Array(xs) if xs.is_empty() => 0.0,
        Value::Array(xs) if xs.len() == 1 => js_to_number(&Value::String(js_to_string(&xs[0]))),
        _ => f64::NAN,
    }
}

fn parse_number_text(s: &str) -> f64 {
    let t = s.trim();
    match t {
        "" => return 0.0,
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        if hex.is_empty() {
            return f64::NAN;
        }
        // digit by digit: no integer width limits the text
        return hex
            .chars()
            .try_fold(0.0_f64, |acc, c| c.to_digit(16).map(|d| acc * 16.0 + f64::from(d)))
            .unwrap_or(f64::NAN);
    }
    // f64::from_str also accepts "inf"/"nan" spellings, which are not numbers here
    let lower = t.to_ascii_lowercase();
    if lower.contains("inf") || lower.contains("nan") {
        return f64::NAN;
    }
    t.parse::<f64>().unwrap_or(f64::NAN)
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Undefined | Value::Null => false,
        Value::Boolean(b) => *b,
        Value::Number(n) => !(n.is_nan() || *n == 0.0),
        Value::BigInt(i) => *i != 0,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

pub fn js_to_bigint(v: &Value) -> Option<i128> {
    match v {
        Value::BigInt(i) => Some(*i),
        Value::Boolean(b) => Some(*b as i128),
        // `as` would saturate; out-of-range integers have no i128 form
        Value::Number(n) if n.fract() == 0.0 && (i128::MIN as f64..i128::MAX as f64).contains(n) => Some(*n as i128),
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() { Some(0) } else { t.parse::<i128>().ok() }
        }
        _ => None,
    }
}

pub fn js_to_date(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Date(d) => Some(*d),
        Value::Number(n) if n.is_finite() => DateTime::from_timestamp_millis(*n as i64),
        Value::String(s) => {
            let t = s.trim();
            if let Ok(d) = DateTime::parse_from_rfc3339(t) {
                return Some(d.with_timezone(&Utc));
            }
            if let Ok(d) = NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(d.and_utc());
            }
            NaiveDate::parse_from_str(t, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| d.and_utc())
        }
        _ => None,
    }
}

// ---------------------------- Transformations ----------------------------- //

#[derive(Clone)]
pub struct Transformation {
    pub decode: Getter,
    pub encode: Getter,
}

impl fmt::Debug for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("Transformation(..)") }
}

impl Transformation {
    pub fn new(decode: Getter, encode: Getter) -> Self { Self { decode, encode } }

    pub fn passthrough() -> Self { Self::new(Getter::passthrough(), Getter::passthrough()) }

    pub fn flip(&self) -> Self { Self::new(self.encode.clone(), self.decode.clone()) }

    /// `self` sits on the encoded side of `inner`.
    pub fn compose(&self, inner: &Transformation) -> Self {
        Self::new(self.decode.compose(&inner.decode), inner.encode.compose(&self.encode))
    }

    /// `string <-> number`; decoding uses numeric coercion, so malformed text
    /// becomes `NaN` and is left to a `finite` check to reject.
    pub fn number_from_string() -> Self { Self::new(Getter::to_number(), Getter::to_string()) }

    pub fn bigint_from_string() -> Self { Self::new(Getter::to_bigint(), Getter::to_string()) }

    pub fn date_from_string() -> Self { Self::new(Getter::to_date(), Getter::to_string()) }

    pub fn boolean_from_string() -> Self {
        let decode = Getter::transform_or_fail(|v, _| match v.as_str() {
            Some("true") => Effect::succeed(Value::Boolean(true)),
            Some("false") => Effect::succeed(Value::Boolean(false)),
            _ => Effect::fail(Issue::invalid_value_with(Some(v.clone()), "Expected \"true\" or \"false\"")),
        });
        Self::new(decode, Getter::to_string())
    }

    pub fn trim() -> Self { Self::new(Getter::trim(), Getter::passthrough()) }
    pub fn lowercase() -> Self { Self::new(Getter::to_lower_case(), Getter::passthrough()) }
    pub fn uppercase() -> Self { Self::new(Getter::to_upper_case(), Getter::passthrough()) }

    pub fn json_from_string() -> Self { Self::new(Getter::parse_json(), Getter::stringify_json()) }

    /// Missing encoded input decodes to `value`.
    pub fn with_decoding_default(value: Value) -> Self {
        Self::new(Getter::with_default(value), Getter::passthrough())
    }
}

// ------------------------------- Tests ------------------------------------ //
