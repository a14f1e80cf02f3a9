//! Admission filters: `lifo` and `lifoGroup`.
//!
//! Both filters gate request handling on a bounded LIFO queue. A
//! `lifo(max_concurrency, max_queue_size, timeout?)` filter gates its
//! own route; every `lifoGroup(name, ...)` filter with the same name
//! shares one queue across routes, with exactly one member of the
//! group expected to carry the configuration.
//!
//! Filters are created unbound; the scheduler registry's
//! post-processing pass assigns the queue after each route-set
//! compile. On the request path the filter acquires a [`Permit`] and
//! parks it in the context's state bag; the response path takes it
//! back out and releases. A context dropped on any other exit path
//! releases the permit through `Drop`.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, error};

use turnstile_routing::filter::{status, Filter, FilterContext, FilterError, FilterSpec};
use turnstile_routing::route::Arg;
use turnstile_routing::FilterRegistry;

use crate::queue::{Permit, Queue, QueueConfig, WaitError};

pub const LIFO_FILTER_NAME: &str = "lifo";
pub const LIFO_GROUP_FILTER_NAME: &str = "lifoGroup";

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

/// A request admission filter backed by a LIFO queue.
pub struct LifoFilter {
    group: Option<String>,
    declared: Option<QueueConfig>,
    queue: RwLock<Option<Arc<Queue>>>,
    state_key: String,
}

impl LifoFilter {
    fn new(group: Option<String>, declared: Option<QueueConfig>) -> Self {
        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            group,
            declared,
            queue: RwLock::new(None),
            state_key: format!("turnstile.admission.permit.{}", id),
        }
    }

    /// The configuration this filter's declaration carried, if any.
    /// Name-only group members return `None` and inherit.
    pub fn declared_config(&self) -> Option<QueueConfig> {
        self.declared
    }

    /// The effective configuration: the declared one, or the bound
    /// queue's for inheriting group members.
    pub fn config(&self) -> Option<QueueConfig> {
        self.declared.or_else(|| self.queue().map(|q| q.config()))
    }

    /// The admission group, for `lifoGroup` filters.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// The bound queue. `None` until post-processing has run.
    pub fn queue(&self) -> Option<Arc<Queue>> {
        self.queue.read().unwrap().clone()
    }

    /// Assign the queue this filter admits against.
    pub fn bind_queue(&self, queue: Arc<Queue>) {
        *self.queue.write().unwrap() = Some(queue);
    }

    fn filter_name(&self) -> &'static str {
        if self.group.is_some() {
            LIFO_GROUP_FILTER_NAME
        } else {
            LIFO_FILTER_NAME
        }
    }
}

#[async_trait]
impl Filter for LifoFilter {
    async fn request(&self, ctx: &mut FilterContext) {
        let Some(queue) = self.queue() else {
            error!(filter = self.filter_name(), "admission filter has no bound queue");
            ctx.serve(status::SERVICE_UNAVAILABLE);
            return;
        };

        match queue.wait(ctx.cancellation()).await {
            Ok(permit) => ctx.state_insert(self.state_key.clone(), permit),
            Err(err) => {
                debug!(filter = self.filter_name(), %err, "admission rejected");
                ctx.serve(admission_status(err));
            }
        }
    }

    async fn response(&self, ctx: &mut FilterContext) {
        if let Some(permit) = ctx.state_remove::<Permit>(&self.state_key) {
            permit.release();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The response status an admission failure maps to.
pub fn admission_status(err: WaitError) -> u16 {
    match err {
        WaitError::QueueFull | WaitError::Closed => status::SERVICE_UNAVAILABLE,
        WaitError::Timeout => status::BAD_GATEWAY,
        WaitError::Canceled => status::CLIENT_CLOSED_REQUEST,
    }
}

/// Spec for `lifo(max_concurrency?, max_queue_size?, timeout?)`.
pub struct LifoSpec;

impl FilterSpec for LifoSpec {
    fn name(&self) -> &'static str {
        LIFO_FILTER_NAME
    }

    fn create(&self, args: &[Arg]) -> Result<Arc<dyn Filter>, FilterError> {
        let config = parse_config(LIFO_FILTER_NAME, args)?;
        Ok(Arc::new(LifoFilter::new(None, Some(config))))
    }
}

/// Spec for `lifoGroup(name, max_concurrency?, max_queue_size?, timeout?)`.
pub struct LifoGroupSpec;

impl FilterSpec for LifoGroupSpec {
    fn name(&self) -> &'static str {
        LIFO_GROUP_FILTER_NAME
    }

    fn create(&self, args: &[Arg]) -> Result<Arc<dyn Filter>, FilterError> {
        let Some((name, rest)) = args.split_first() else {
            return Err(invalid(LIFO_GROUP_FILTER_NAME, "missing group name"));
        };
        let group = name
            .as_str()
            .ok_or_else(|| invalid(LIFO_GROUP_FILTER_NAME, "group name must be a string"))?;
        let declared = if rest.is_empty() {
            None
        } else {
            Some(parse_config(LIFO_GROUP_FILTER_NAME, rest)?)
        };
        Ok(Arc::new(LifoFilter::new(Some(group.to_string()), declared)))
    }
}

/// Register `lifo` and `lifoGroup` with a routing filter registry.
pub fn register_admission_filters(registry: &mut FilterRegistry) {
    registry.register(Arc::new(LifoSpec));
    registry.register(Arc::new(LifoGroupSpec));
}

fn parse_config(filter: &'static str, args: &[Arg]) -> Result<QueueConfig, FilterError> {
    if args.len() > 3 {
        return Err(invalid(filter, "expected at most three arguments"));
    }

    let mut config = QueueConfig::default();
    if let Some(arg) = args.first() {
        let v = arg
            .as_int()
            .ok_or_else(|| invalid(filter, "max concurrency must be an integer"))?;
        if v < 1 {
            return Err(invalid(filter, "max concurrency must be positive"));
        }
        config.max_concurrency = v as usize;
    }
    if let Some(arg) = args.get(1) {
        let v = arg
            .as_int()
            .ok_or_else(|| invalid(filter, "max queue size must be an integer"))?;
        if v < 0 {
            return Err(invalid(filter, "max queue size must not be negative"));
        }
        config.max_queue_size = v as usize;
    }
    if let Some(arg) = args.get(2) {
        let s = arg
            .as_str()
            .ok_or_else(|| invalid(filter, "timeout must be a duration string"))?;
        config.timeout = humantime::parse_duration(s)
            .map_err(|e| invalid(filter, format!("invalid timeout: {}", e)))?;
    }
    Ok(config)
}

fn invalid(filter: &'static str, reason: impl Into<String>) -> FilterError {
    FilterError::InvalidArgs { filter: filter.to_string(), reason: reason.into() }
}
