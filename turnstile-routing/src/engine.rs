//! Live routing engine.
//!
//! The engine consumes a stream of route-set updates, compiles each set
//! into live routes, and swaps the active table atomically:
//!
//! ```text
//! route definitions ──► pre-processors ──► filter instantiation
//!                                                   │
//!            table swap ◄── post-processors ◄───────┘
//! ```
//!
//! Pre-processors rewrite definitions before any filter exists (e.g.
//! deduplicating admission filters in a chain); post-processors see the
//! compiled routes and may bind state into filter instances before the
//! set goes live. A route whose chain references an unknown filter or
//! carries invalid arguments is dropped from the set with an error log.

use std::fmt;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::filter::{status, Filter, FilterContext, FilterError, FilterRegistry, ServedResponse};
use crate::route::{Backend, FilterDef, RouteDef};

/// Rewrites route definitions before filter instantiation.
pub trait PreProcessor: Send + Sync {
    fn process(&self, defs: Vec<RouteDef>) -> Vec<RouteDef>;
}

/// Observes and mutates compiled routes before the table swap.
pub trait PostProcessor: Send + Sync {
    fn process(&self, routes: &[Arc<Route>]);
}

/// A filter instance together with the definition it was built from.
pub struct CompiledFilter {
    pub def: FilterDef,
    pub filter: Arc<dyn Filter>,
}

/// A live route: the (pre-processed) definition plus its instantiated
/// filter chain.
pub struct Route {
    pub id: String,
    pub def: RouteDef,
    pub filters: Vec<CompiledFilter>,
}

impl Route {
    pub fn matches(&self, path: &str) -> bool {
        self.def.matches(path)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.def.expression())
    }
}

/// Configuration for a routing instance.
pub struct RoutingOptions {
    pub filter_registry: FilterRegistry,
    pub pre_processors: Vec<Arc<dyn PreProcessor>>,
    pub post_processors: Vec<Arc<dyn PostProcessor>>,
}

/// The live routing table, kept current by a background reload task.
pub struct Routing {
    table: Arc<RwLock<Vec<Arc<Route>>>>,
    loaded: watch::Receiver<bool>,
    reload_task: tokio::task::JoinHandle<()>,
}

impl Routing {
    /// Start a routing instance over a stream of route-set updates.
    /// The initial value of the channel is compiled immediately.
    pub fn new(options: RoutingOptions, updates: watch::Receiver<Vec<RouteDef>>) -> Self {
        let table = Arc::new(RwLock::new(Vec::new()));
        let (loaded_tx, loaded_rx) = watch::channel(false);
        let reload_task =
            tokio::spawn(reload_loop(options, updates, Arc::clone(&table), loaded_tx));
        Self { table, loaded: loaded_rx, reload_task }
    }

    /// Wait until the first route set has been compiled and swapped in.
    pub async fn first_load(&self) {
        let mut loaded = self.loaded.clone();
        let _ = loaded.wait_for(|ready| *ready).await;
    }

    /// Look up the first route matching the request path.
    pub fn route(&self, path: &str) -> Option<Arc<Route>> {
        let table = self.table.read().unwrap();
        table.iter().find(|r| r.matches(path)).cloned()
    }

    /// All currently live routes.
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.table.read().unwrap().clone()
    }

    /// Stop the reload task. The current table stays readable.
    pub fn close(&self) {
        self.reload_task.abort();
    }
}

impl Drop for Routing {
    fn drop(&mut self) {
        self.reload_task.abort();
    }
}

async fn reload_loop(
    options: RoutingOptions,
    mut updates: watch::Receiver<Vec<RouteDef>>,
    table: Arc<RwLock<Vec<Arc<Route>>>>,
    loaded_tx: watch::Sender<bool>,
) {
    loop {
        let defs = updates.borrow_and_update().clone();
        let routes = compile(&options, defs);
        for post in &options.post_processors {
            post.process(&routes);
        }
        info!(routes = routes.len(), "routing table updated");
        *table.write().unwrap() = routes;
        loaded_tx.send_replace(true);

        if updates.changed().await.is_err() {
            debug!("route update source closed, stopping reload loop");
            break;
        }
    }
}

fn compile(options: &RoutingOptions, mut defs: Vec<RouteDef>) -> Vec<Arc<Route>> {
    for pre in &options.pre_processors {
        defs = pre.process(defs);
    }

    let mut routes = Vec::with_capacity(defs.len());
    'defs: for def in defs {
        let mut filters = Vec::with_capacity(def.filters.len());
        for filter_def in &def.filters {
            let Some(spec) = options.filter_registry.lookup(&filter_def.name) else {
                let err = FilterError::Unknown(filter_def.name.clone());
                error!(route = %def.id, error = %err, "dropping route");
                continue 'defs;
            };
            match spec.create(&filter_def.args) {
                Ok(filter) => filters.push(CompiledFilter { def: filter_def.clone(), filter }),
                Err(err) => {
                    error!(
                        route = %def.id,
                        filter = %filter_def.name,
                        error = %err,
                        "failed to instantiate filter, dropping route"
                    );
                    continue 'defs;
                }
            }
        }
        routes.push(Arc::new(Route { id: def.id.clone(), def, filters }));
    }
    routes
}

/// Run a request through a route's filter chain.
///
/// Request hooks run in chain order until one of them serves; the
/// backend produces the response otherwise. Response hooks then run in
/// reverse order for every filter whose request hook ran, so a filter
/// that acquired a resource on the way in always sees the way out.
pub async fn serve(route: &Route, ctx: &mut FilterContext) -> ServedResponse {
    let mut ran = 0;
    for compiled in &route.filters {
        compiled.filter.request(ctx).await;
        ran += 1;
        if ctx.is_served() {
            break;
        }
    }

    if !ctx.is_served() {
        match &route.def.backend {
            Backend::Shunt => ctx.serve(status::OK),
            Backend::Network(addr) => {
                // No upstream client is wired into this build.
                debug!(route = %route.id, upstream = %addr, "no upstream client, serving 502");
                ctx.serve(status::BAD_GATEWAY);
            }
        }
    }

    for compiled in route.filters[..ran].iter().rev() {
        compiled.filter.response(ctx).await;
    }

    ctx.response().unwrap_or(ServedResponse { status: status::OK })
}
