//! The filter seam: traits, registry, and the per-request context.
//!
//! Filters are the unit of behavior in a route's processing chain. A
//! [`FilterSpec`] validates declaration arguments and produces a
//! [`Filter`] instance per route; instances see every request routed
//! through their route via the async `request`/`response` hooks.
//!
//! The [`FilterContext`] carries the mutable per-request state the
//! hooks operate on: the request path and headers, a typed state bag
//! for values handed from `request` to `response`, a cancellation
//! token, and the served-response slot a filter uses to short-circuit
//! the chain.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::route::Arg;

/// Response status codes used by the admission and builtin filters.
pub mod status {
    pub const OK: u16 = 200;
    pub const CLIENT_CLOSED_REQUEST: u16 = 499;
    pub const BAD_GATEWAY: u16 = 502;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// A response produced inside the proxy, short-circuiting the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServedResponse {
    pub status: u16,
}

/// Filter instantiation errors.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("unknown filter '{0}'")]
    Unknown(String),

    #[error("invalid arguments for filter '{filter}': {reason}")]
    InvalidArgs { filter: String, reason: String },
}

/// Mutable per-request state shared along a route's filter chain.
pub struct FilterContext {
    path: String,
    headers: HashMap<String, String>,
    state_bag: HashMap<String, Box<dyn Any + Send>>,
    cancel: CancellationToken,
    served: Option<ServedResponse>,
}

impl FilterContext {
    /// Context for a request to `path` with a fresh cancellation token.
    pub fn new(path: impl Into<String>) -> Self {
        Self::with_cancellation(path, CancellationToken::new())
    }

    /// Context bound to an externally owned cancellation token.
    pub fn with_cancellation(path: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            path: path.into(),
            headers: HashMap::new(),
            state_bag: HashMap::new(),
            cancel,
            served: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn request_header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn set_request_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// The request's cancellation signal.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Serve a response from inside the proxy. The first call wins;
    /// later calls are ignored so an upstream filter cannot overwrite
    /// the decision of the one that short-circuited.
    pub fn serve(&mut self, status: u16) {
        if self.served.is_none() {
            self.served = Some(ServedResponse { status });
        }
    }

    pub fn is_served(&self) -> bool {
        self.served.is_some()
    }

    pub fn response(&self) -> Option<ServedResponse> {
        self.served
    }

    /// Stash a value for a later hook (typically `request` → `response`).
    pub fn state_insert<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        self.state_bag.insert(key.into(), Box::new(value));
    }

    /// Take a previously stashed value back out of the state bag.
    pub fn state_remove<T: Any + Send>(&mut self, key: &str) -> Option<T> {
        let boxed = self.state_bag.remove(key)?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(boxed) => {
                // Wrong type requested; put the value back untouched.
                self.state_bag.insert(key.to_string(), boxed);
                None
            }
        }
    }
}

/// A filter instance participating in request handling.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Called on the request path, in chain order.
    async fn request(&self, ctx: &mut FilterContext);

    /// Called on the response path, in reverse chain order.
    async fn response(&self, _ctx: &mut FilterContext) {}

    /// Concrete-type access for post-processors that need to recognize
    /// and mutate specific filter kinds after instantiation.
    fn as_any(&self) -> &dyn Any;
}

/// Factory for one named filter kind.
pub trait FilterSpec: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, args: &[Arg]) -> Result<Arc<dyn Filter>, FilterError>;
}

/// Name → spec lookup used by the routing engine at compile time.
#[derive(Default)]
pub struct FilterRegistry {
    specs: HashMap<&'static str, Arc<dyn FilterSpec>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: Arc<dyn FilterSpec>) {
        self.specs.insert(spec.name(), spec);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn FilterSpec>> {
        self.specs.get(name).cloned()
    }
}
