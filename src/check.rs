//! Checks (filters) attached to a node.
//!
//! A check runs once the structural shape of a value is known. Its outcome
//! is normalized by [`from_check_outcome`]: passing yields no issue, `false`
//! yields an `InvalidValue` carrying the check's annotations, a string
//! becomes the message of that `InvalidValue`, an explicit issue is kept.
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use regex::Regex;
use serde_json::json;

use crate::ast::{Annotations, Message, NodeRef};
use crate::effect::{Effect, guard, try_fold};
use crate::issue::Issue;
use crate::parser::{ErrorMode, ParseOptions};
use crate::value::{Value, format_number};

#[derive(Debug)]
pub enum CheckOutcome {
    Pass,
    Fail,
    Message(String),
    Issue(Issue),
}

impl From<()> for CheckOutcome {
    fn from(_: ()) -> Self { CheckOutcome::Pass }
}

impl From<bool> for CheckOutcome {
    fn from(ok: bool) -> Self { if ok { CheckOutcome::Pass } else { CheckOutcome::Fail } }
}

impl From<&str> for CheckOutcome {
    fn from(m: &str) -> Self { CheckOutcome::Message(m.to_string()) }
}

impl From<String> for CheckOutcome {
    fn from(m: String) -> Self { CheckOutcome::Message(m) }
}

impl From<Issue> for CheckOutcome {
    fn from(i: Issue) -> Self { CheckOutcome::Issue(i) }
}

impl<T: Into<CheckOutcome>> From<Option<T>> for CheckOutcome {
    fn from(o: Option<T>) -> Self { o.map(Into::into).unwrap_or(CheckOutcome::Pass) }
}

pub fn from_check_outcome(
    outcome: CheckOutcome,
    value: &Value,
    annotations: Option<&Arc<Annotations>>,
) -> Option<Issue> {
    match outcome {
        CheckOutcome::Pass => None,
        CheckOutcome::Fail => Some(Issue::InvalidValue { actual: Some(value.clone()), annotations: annotations.cloned() }),
        CheckOutcome::Message(m) => Some(Issue::invalid_value_with(Some(value.clone()), m)),
        CheckOutcome::Issue(i) => Some(i),
    }
}

type SyncCheck = dyn Fn(&Value, &ParseOptions) -> CheckOutcome + Send + Sync;
type AsyncCheck = dyn Fn(Value, ParseOptions) -> BoxFuture<'static, CheckOutcome> + Send + Sync;

#[derive(Clone)]
pub enum CheckFn {
    Sync(Arc<SyncCheck>),
    Async(Arc<AsyncCheck>),
}

#[derive(Clone)]
pub struct Check {
    pub run: CheckFn,
    /// A failing aborting check ends the chain whatever the error mode.
    pub abort: bool,
    pub annotations: Option<Arc<Annotations>>,
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check")
            .field("async", &matches!(self.run, CheckFn::Async(_)))
            .field("abort", &self.abort)
            .field("annotations", &self.annotations)
            .finish()
    }
}

impl Check {
    pub fn make<O, F>(f: F) -> Self
    where
        O: Into<CheckOutcome>,
        F: Fn(&Value, &ParseOptions) -> O + Send + Sync + 'static,
    {
        Check {
            run: CheckFn::Sync(Arc::new(move |v: &Value, o: &ParseOptions| -> CheckOutcome { f(v, o).into() })),
            abort: false,
            annotations: None,
        }
    }

    /// A check that may need injected services (`options.services`).
    pub fn make_async<O, Fut, F>(f: F) -> Self
    where
        O: Into<CheckOutcome>,
        Fut: Future<Output = O> + Send + 'static,
        F: Fn(Value, ParseOptions) -> Fut + Send + Sync + 'static,
    {
        Check {
            run: CheckFn::Async(Arc::new(move |v: Value, o: ParseOptions| -> BoxFuture<'static, CheckOutcome> {
                f(v, o).map(|out: O| -> CheckOutcome { out.into() }).boxed()
            })),
            abort: false,
            annotations: None,
        }
    }

    pub fn abort(mut self) -> Self {
        self.abort = true;
        self
    }

    pub fn annotate(mut self, annotations: Annotations) -> Self {
        self.annotations = Some(Arc::new(annotations));
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        let mut annotations = self.annotations.as_deref().cloned().unwrap_or_default();
        annotations.message = Some(message);
        self.annotations = Some(Arc::new(annotations));
        self
    }

    pub fn run(&self, value: &Value, options: &ParseOptions) -> Effect<Option<Issue>> {
        let annotations = self.annotations.clone();
        match &self.run {
            CheckFn::Sync(f) => guard(Some(value), || {
                let outcome = f(value, options);
                Effect::succeed(from_check_outcome(outcome, value, annotations.as_ref()))
            }),
            CheckFn::Async(f) => guard(Some(value), || {
                let actual = value.clone();
                let fut = f(value.clone(), options.clone());
                Effect::from_future(async move { Ok(from_check_outcome(fut.await, &actual, annotations.as_ref())) })
            }),
        }
    }
}

/// Runs the node's checks in declaration order over a structurally valid
/// value.
pub(crate) fn run_checks(node: &NodeRef, value: Value, options: &ParseOptions) -> Effect<Value> {
    if node.checks.is_empty() {
        return Effect::succeed(value);
    }
    let subject = Arc::new(value);
    let shared = subject.clone();
    let fold_node = node.clone();
    let fold_options = options.clone();
    let all = options.errors == ErrorMode::All;
    let node = node.clone();

    try_fold((0..node.checks.len()).collect(), Vec::new(), move |mut issues: Vec<Issue>, i: usize| {
        let check = fold_node.checks[i].clone();
        check.run(&shared, &fold_options).map(move |outcome| match outcome {
            None => ControlFlow::Continue(issues),
            Some(issue) => {
                let stop = check.abort || !all;
                issues.push(Issue::Filter { check, issue: Box::new(issue) });
                if stop { ControlFlow::Break(issues) } else { ControlFlow::Continue(issues) }
            }
        })
    })
    .and_then(move |issues| {
        let value = Arc::try_unwrap(subject).unwrap_or_else(|v| (*v).clone());
        if issues.is_empty() {
            Effect::succeed(value)
        } else {
            Effect::fail(Issue::collect(&node, Some(value), issues))
        }
    })
}

// ------------------------------ Ready-made -------------------------------- //

fn described<O, F>(expected: String, meta: serde_json::Value, f: F) -> Check
where
    O: Into<CheckOutcome>,
    F: Fn(&Value) -> O + Send + Sync + 'static,
{
    let mut annotations = Annotations::expected(expected);
    if let serde_json::Value::Object(m) = meta {
        annotations.meta.extend(m);
    }
    Check::make(move |v, _| f(v)).annotate(annotations)
}

fn length_of(v: &Value) -> Option<usize> {
    match v {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(xs) => Some(xs.len()),
        _ => None,
    }
}

fn number_check(expected: String, meta: serde_json::Value, test: impl Fn(f64) -> bool + Send + Sync + 'static) -> Check {
    described(expected, meta, move |v| v.as_f64().is_some_and(&test))
}

fn string_check(expected: String, meta: serde_json::Value, test: impl Fn(&str) -> bool + Send + Sync + 'static) -> Check {
    described(expected, meta, move |v| v.as_str().is_some_and(&test))
}

pub fn finite() -> Check {
    number_check("a finite number".into(), json!({"_tag": "finite"}), f64::is_finite)
}

pub fn int() -> Check {
    number_check("an integer".into(), json!({"_tag": "int"}), |n| n.is_finite() && n.fract() == 0.0)
}

pub fn greater_than(min: f64) -> Check {
    number_check(
        format!("a value greater than {}", format_number(min)),
        json!({"_tag": "greaterThan", "exclusiveMinimum": min}),
        move |n| n > min,
    )
}

pub fn greater_than_or_equal_to(min: f64) -> Check {
    number_check(
        format!("a value greater than or equal to {}", format_number(min)),
        json!({"_tag": "greaterThanOrEqualTo", "minimum": min}),
        move |n| n >= min,
    )
}

pub fn less_than(max: f64) -> Check {
    number_check(
        format!("a value less than {}", format_number(max)),
        json!({"_tag": "lessThan", "exclusiveMaximum": max}),
        move |n| n < max,
    )
}

pub fn less_than_or_equal_to(max: f64) -> Check {
    number_check(
        format!("a value less than or equal to {}", format_number(max)),
        json!({"_tag": "lessThanOrEqualTo", "maximum": max}),
        move |n| n <= max,
    )
}

pub fn between(min: f64, max: f64) -> Check {
    number_check(
        format!("a value between {} and {}", format_number(min), format_number(max)),
        json!({"_tag": "between", "minimum": min, "maximum": max}),
        move |n| min <= n && n <= max,
    )
}

pub fn multiple_of(divisor: f64) -> Check {
    number_check(
        format!("a value that is a multiple of {}", format_number(divisor)),
        json!({"_tag": "multipleOf", "multipleOf": divisor}),
        move |n| {
            let q = n / divisor;
            q.is_finite() && (q - q.round()).abs() < 1e-9
        },
    )
}

pub fn min_length(min: usize) -> Check {
    described(
        format!("a value with a length of at least {min}"),
        json!({"_tag": "minLength", "minLength": min}),
        move |v| length_of(v).is_some_and(|l| l >= min),
    )
}

pub fn max_length(max: usize) -> Check {
    described(
        format!("a value with a length of at most {max}"),
        json!({"_tag": "maxLength", "maxLength": max}),
        move |v| length_of(v).is_some_and(|l| l <= max),
    )
}

pub fn length(exact: usize) -> Check {
    described(
        format!("a value with a length of {exact}"),
        json!({"_tag": "length", "length": exact}),
        move |v| length_of(v) == Some(exact),
    )
}

pub fn non_empty() -> Check { min_length(1) }

pub fn trimmed() -> Check {
    string_check("a string with no leading or trailing whitespace".into(), json!({"_tag": "trimmed"}), |s| s.trim() == s)
}

pub fn lowercased() -> Check {
    string_check("a string with all characters in lowercase".into(), json!({"_tag": "lowercased"}), |s| s.to_lowercase() == s)
}

pub fn uppercased() -> Check {
    string_check("a string with all characters in uppercase".into(), json!({"_tag": "uppercased"}), |s| s.to_uppercase() == s)
}

pub fn pattern(regex: Regex) -> Check {
    let source = regex.as_str().to_string();
    string_check(
        format!("a string matching the pattern {source}"),
        json!({"_tag": "pattern", "pattern": source}),
        move |s| regex.is_match(s),
    )
}

pub fn starts_with(prefix: &str) -> Check {
    let p = prefix.to_string();
    string_check(
        format!("a string starting with {}", crate::value::quote(prefix)),
        json!({"_tag": "startsWith", "startsWith": prefix}),
        move |s| s.starts_with(&p),
    )
}

pub fn ends_with(suffix: &str) -> Check {
    let p = suffix.to_string();
    string_check(
        format!("a string ending with {}", crate::value::quote(suffix)),
        json!({"_tag": "endsWith", "endsWith": suffix}),
        move |s| s.ends_with(&p),
    )
}

pub fn includes(needle: &str) -> Check {
    let p = needle.to_string();
    string_check(
        format!("a string including {}", crate::value::quote(needle)),
        json!({"_tag": "includes", "includes": needle}),
        move |s| s.contains(&p),
    )
}

pub fn min_entries(min: usize) -> Check {
    described(
        format!("a value with at least {min} entries"),
        json!({"_tag": "minEntries", "minEntries": min}),
        move |v| v.as_object().is_some_and(|m| m.len() >= min),
    )
}

pub fn max_entries(max: usize) -> Check {
    described(
        format!("a value with at most {max} entries"),
        json!({"_tag": "maxEntries", "maxEntries": max}),
        move |v| v.as_object().is_some_and(|m| m.len() <= max),
    )
}

pub fn unique() -> Check {
    described("an array with unique items".into(), json!({"_tag": "unique"}), |v| {
        v.as_array().is_some_and(|xs| xs.iter().enumerate().all(|(i, x)| !xs[..i].contains(x)))
    })
}

// ------------------------------- Tests ------------------------------------ //
