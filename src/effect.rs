//! Execution duality.
//!
//! Every dispatcher answers with an [`Effect`]: either a value that is
//! already there, or a boxed future that needs to be driven (usually because
//! an async check or transformation asked an injected service). Combinators
//! stay on the ready path as long as they can, so purely synchronous schemas
//! never allocate a future.
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::issue::Issue;
use crate::value::Value;

pub enum Effect<T> {
    Ready(Result<T, Issue>),
    Pending(BoxFuture<'static, Result<T, Issue>>),
}

impl<T: Send + 'static> Effect<T> {
    pub fn succeed(value: T) -> Self { Effect::Ready(Ok(value)) }
    pub fn fail(issue: Issue) -> Self { Effect::Ready(Err(issue)) }

    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, Issue>> + Send + 'static,
    {
        Effect::Pending(fut.boxed())
    }

    pub fn is_ready(&self) -> bool { matches!(self, Effect::Ready(_)) }

    /// Continue with the outcome, success or failure.
    pub fn then<U, F>(self, f: F) -> Effect<U>
    where
        U: Send + 'static,
        F: FnOnce(Result<T, Issue>) -> Effect<U> + Send + 'static,
    {
        match self {
            Effect::Ready(r) => f(r),
            Effect::Pending(fut) => Effect::Pending(async move { f(fut.await).into_future().await }.boxed()),
        }
    }

    pub fn and_then<U, F>(self, f: F) -> Effect<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Effect<U> + Send + 'static,
    {
        self.then(|r| match r {
            Ok(v) => f(v),
            Err(issue) => Effect::fail(issue),
        })
    }

    pub fn map<U, F>(self, f: F) -> Effect<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.and_then(|v| Effect::succeed(f(v)))
    }

    pub fn map_err<F>(self, f: F) -> Effect<T>
    where
        F: FnOnce(Issue) -> Issue + Send + 'static,
    {
        self.then(|r| Effect::Ready(r.map_err(f)))
    }

    pub fn into_future(self) -> BoxFuture<'static, Result<T, Issue>> {
        match self {
            Effect::Ready(r) => futures::future::ready(r).boxed(),
            Effect::Pending(fut) => fut,
        }
    }

    /// Resolve without a runtime. A pending effect gets exactly one poll
    /// with a no-op waker; if it still wants to suspend, the result is a
    /// `Forbidden` issue instead of a blocked thread.
    pub fn run_sync(self) -> Result<T, Issue> {
        match self {
            Effect::Ready(r) => r,
            Effect::Pending(fut) => match fut.now_or_never() {
                Some(r) => r,
                None => {
                    tracing::debug!("effect suspended during synchronous run");
                    Err(Issue::forbidden(
                        None,
                        "cannot be resolved synchronously, this schema requires asynchronous work",
                    ))
                }
            },
        }
    }
}

impl<T> fmt::Debug for Effect<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Ready(r) => f.debug_tuple("Ready").field(r).finish(),
            Effect::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// Sequential fold over `items`. Each step may break early; the first
/// pending step moves the remainder of the fold into one future.
pub fn try_fold<A, S, F>(items: Vec<A>, init: S, mut f: F) -> Effect<S>
where
    A: Send + 'static,
    S: Send + 'static,
    F: FnMut(S, A) -> Effect<ControlFlow<S, S>> + Send + 'static,
{
    let mut items = items.into_iter();
    let mut state = init;
    while let Some(item) = items.next() {
        match f(state, item) {
            Effect::Ready(Ok(ControlFlow::Continue(s))) => state = s,
            Effect::Ready(Ok(ControlFlow::Break(s))) => return Effect::succeed(s),
            Effect::Ready(Err(issue)) => return Effect::fail(issue),
            Effect::Pending(fut) => {
                return Effect::Pending(
                    async move {
                        let mut state = match fut.await? {
                            ControlFlow::Continue(s) => s,
                            ControlFlow::Break(s) => return Ok(s),
                        };
                        for item in items {
                            match f(state, item).into_future().await? {
                                ControlFlow::Continue(s) => state = s,
                                ControlFlow::Break(s) => return Ok(s),
                            }
                        }
                        Ok(state)
                    }
                    .boxed(),
                );
            }
        }
    }
    Effect::succeed(state)
}

// ------------------------------- Defects --------------------------------- //

/// Invoke user-supplied code. A panic, now or while the returned future is
/// being driven, becomes a `Forbidden` issue carrying the defect.
pub fn guard<T, F>(actual: Option<&Value>, f: F) -> Effect<T>
where
    T: Send + 'static,
    F: FnOnce() -> Effect<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Effect::Ready(r)) => Effect::Ready(r),
        Ok(Effect::Pending(fut)) => {
            let actual = actual.cloned();
            Effect::Pending(
                AssertUnwindSafe(fut)
                    .catch_unwind()
                    .map(move |r| match r {
                        Ok(r) => r,
                        Err(payload) => Err(defect(actual, payload)),
                    })
                    .boxed(),
            )
        }
        Err(payload) => Effect::fail(defect(actual.cloned(), payload)),
    }
}

/// Same as [`guard`] for plain synchronous calls.
pub(crate) fn catch<R>(f: impl FnOnce() -> R) -> Result<R, anyhow::Error> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| anyhow::anyhow!(panic_message(payload.as_ref())))
}

fn defect(actual: Option<Value>, payload: Box<dyn Any + Send>) -> Issue {
    let message = panic_message(payload.as_ref());
    tracing::warn!(defect = %message, "user-supplied code panicked during parse");
    Issue::defect(actual, anyhow::anyhow!(message))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

// ------------------------------- Services -------------------------------- //

/// Capabilities injected by the caller, keyed by type.
#[derive(Clone, Default)]
pub struct Services {
    map: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Services {
    pub fn new() -> Self { Self::default() }

    pub fn with<T: Any + Send + Sync>(mut self, service: T) -> Self {
        Arc::make_mut(&mut self.map).insert(TypeId::of::<T>(), Arc::new(service));
        self
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.map.get(&TypeId::of::<T>()).cloned().and_then(|s| s.downcast::<T>().ok())
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").field("len", &self.map.len()).finish()
    }
}

// ------------------------------- Tests ------------------------------------ //
