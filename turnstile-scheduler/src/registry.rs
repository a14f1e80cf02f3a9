//! Queue registry and routing-pipeline hooks.
//!
//! The registry owns every admission queue, keyed by `(kind, name)`:
//! one queue per route for plain `lifo` filters, one shared queue per
//! user-named group for `lifoGroup` filters. It plugs into the routing
//! pipeline twice, as the same object:
//!
//! - as a [`PreProcessor`] it rewrites each route's filter chain so at
//!   most one `lifo` filter remains (nested admission gates on one
//!   route are strictly worse than one; the last declaration wins);
//! - as a [`PostProcessor`] it binds every compiled admission filter
//!   to its queue and then reconciles: queues no longer referenced by
//!   the new route set are closed and removed.
//!
//! A generation counter drives reconciliation; the whole pass runs
//! under the registry mutex, so every binding completes before orphan
//! closure begins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use turnstile_routing::{PostProcessor, PreProcessor, Route, RouteDef};

use crate::lifo::{LifoFilter, LIFO_FILTER_NAME};
use crate::queue::{Queue, QueueConfig};

/// Which declaration style owns a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// A route-scoped queue from a `lifo` filter; named by route id.
    Single,
    /// A shared queue from `lifoGroup` filters; named by the group.
    Group,
}

/// Registry key: at most one live queue exists per key at any instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub kind: QueueKind,
    pub name: String,
}

struct QueueEntry {
    queue: Arc<Queue>,
    generation: u64,
}

struct RegistryState {
    queues: HashMap<QueueKey, QueueEntry>,
    generation: u64,
    closed: bool,
}

/// Registry construction options.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Configuration for provisional queues: a name-only `lifoGroup`
    /// member seen before any sibling supplies the group's real
    /// config gets a queue with these parameters, reconfigured once
    /// the config arrives.
    pub default_config: QueueConfig,
}

impl RegistryOptions {
    /// Create options from environment variables.
    pub fn from_env() -> Self {
        Self { default_config: QueueConfig::from_env() }
    }
}

/// Owner of all admission queues for one routing instance.
pub struct Registry {
    state: Mutex<RegistryState>,
    default_config: QueueConfig,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Self::with_options(RegistryOptions::default())
    }

    pub fn with_options(options: RegistryOptions) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState {
                queues: HashMap::new(),
                generation: 0,
                closed: false,
            }),
            default_config: options.default_config,
        })
    }

    /// The queue for `(kind, name)`, created on first use.
    ///
    /// With a config, an existing queue is reconfigured to it; without
    /// one, an existing queue is returned unchanged and a missing one
    /// is created provisionally with the registry default. Returns
    /// `None` once the registry is closed.
    pub fn get_or_create(
        &self,
        kind: QueueKind,
        name: &str,
        config: Option<QueueConfig>,
    ) -> Option<Arc<Queue>> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return None;
        }
        Some(Self::get_or_create_locked(&mut state, self.default_config, kind, name, config))
    }

    fn get_or_create_locked(
        state: &mut RegistryState,
        default_config: QueueConfig,
        kind: QueueKind,
        name: &str,
        config: Option<QueueConfig>,
    ) -> Arc<Queue> {
        let generation = state.generation;
        let key = QueueKey { kind, name: name.to_string() };

        if let Some(entry) = state.queues.get_mut(&key) {
            entry.generation = generation;
            let queue = Arc::clone(&entry.queue);
            if let Some(config) = config {
                if config != queue.config() {
                    queue.reconfigure(config);
                }
            }
            return queue;
        }

        let queue = Queue::new(config.unwrap_or(default_config));
        debug!(?kind, name, "created admission queue");
        state.queues.insert(key, QueueEntry { queue: Arc::clone(&queue), generation });
        queue
    }

    /// Close every queue and reject further operations. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        for (_, entry) in state.queues.drain() {
            entry.queue.close();
        }
    }
}

impl PreProcessor for Registry {
    /// Collapse each route's `lifo` occurrences to the last one.
    /// `lifoGroup` filters gate distinct admission pools and stay
    /// untouched. Applying the rewrite twice is a no-op.
    fn process(&self, mut defs: Vec<RouteDef>) -> Vec<RouteDef> {
        for def in &mut defs {
            let Some(last) = def.filters.iter().rposition(|f| f.name == LIFO_FILTER_NAME)
            else {
                continue;
            };
            let before = def.filters.len();
            let mut index = 0;
            def.filters.retain(|f| {
                let keep = f.name != LIFO_FILTER_NAME || index == last;
                index += 1;
                keep
            });
            if def.filters.len() < before {
                debug!(
                    route = %def.id,
                    removed = before - def.filters.len(),
                    "collapsed duplicate lifo filters, keeping the last"
                );
            }
        }
        defs
    }
}

impl PostProcessor for Registry {
    /// Bind every admission filter in the new route set to its queue,
    /// then close and remove queues the set no longer references.
    fn process(&self, routes: &[Arc<Route>]) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.generation += 1;

        // Resolve group configurations up front: the first declaration
        // in route order wins, later conflicting ones are reported and
        // ignored, name-only members inherit.
        let mut group_configs: HashMap<String, QueueConfig> = HashMap::new();
        for route in routes {
            for compiled in &route.filters {
                let Some(lifo) = compiled.filter.as_any().downcast_ref::<LifoFilter>() else {
                    continue;
                };
                let (Some(group), Some(config)) = (lifo.group(), lifo.declared_config()) else {
                    continue;
                };
                match group_configs.get(group) {
                    None => {
                        group_configs.insert(group.to_string(), config);
                    }
                    Some(winner) if *winner != config => {
                        warn!(
                            group,
                            kept = ?winner,
                            ignored = ?config,
                            "conflicting lifoGroup configuration, keeping the first declaration"
                        );
                    }
                    Some(_) => {}
                }
            }
        }

        for route in routes {
            for compiled in &route.filters {
                let Some(lifo) = compiled.filter.as_any().downcast_ref::<LifoFilter>() else {
                    continue;
                };
                let (kind, name, config) = match lifo.group() {
                    Some(group) => {
                        (QueueKind::Group, group.to_string(), group_configs.get(group).copied())
                    }
                    None => (QueueKind::Single, route.id.clone(), lifo.declared_config()),
                };
                let queue = Self::get_or_create_locked(
                    &mut state,
                    self.default_config,
                    kind,
                    &name,
                    config,
                );
                lifo.bind_queue(queue);
            }
        }

        // Reconciliation sweep.
        let generation = state.generation;
        let stale: Vec<QueueKey> = state
            .queues
            .iter()
            .filter(|(_, entry)| entry.generation != generation)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(entry) = state.queues.remove(&key) {
                debug!(kind = ?key.kind, name = %key.name, "closing orphaned admission queue");
                entry.queue.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifo::{LifoGroupSpec, LifoSpec, LIFO_GROUP_FILTER_NAME};
    use turnstile_routing::{CompiledFilter, Filter, FilterDef, FilterSpec};

    fn lifo_route(id: &str, spec_args: &[turnstile_routing::Arg]) -> Arc<Route> {
        let filter = LifoSpec.create(spec_args).unwrap();
        compiled_route(id, LIFO_FILTER_NAME, filter)
    }

    fn group_route(id: &str, spec_args: &[turnstile_routing::Arg]) -> Arc<Route> {
        let filter = LifoGroupSpec.create(spec_args).unwrap();
        compiled_route(id, LIFO_GROUP_FILTER_NAME, filter)
    }

    fn compiled_route(id: &str, name: &str, filter: Arc<dyn Filter>) -> Arc<Route> {
        Arc::new(Route {
            id: id.to_string(),
            def: RouteDef::new(id),
            filters: vec![CompiledFilter { def: FilterDef::new(name, vec![]), filter }],
        })
    }

    fn bound_queue(route: &Route) -> Arc<Queue> {
        route.filters[0]
            .filter
            .as_any()
            .downcast_ref::<LifoFilter>()
            .unwrap()
            .queue()
            .unwrap()
    }

    #[test]
    fn test_same_key_returns_same_queue() {
        let registry = Registry::new();
        let a = registry.get_or_create(QueueKind::Group, "g", None).unwrap();
        let b = registry.get_or_create(QueueKind::Group, "g", None).unwrap();
        let c = registry.get_or_create(QueueKind::Group, "other", None).unwrap();
        let d = registry.get_or_create(QueueKind::Single, "g", None).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(!Arc::ptr_eq(&a, &d));
    }

    #[test]
    fn test_get_or_create_reconfigures_existing() {
        let registry = Registry::new();
        let config = QueueConfig { max_concurrency: 2, ..QueueConfig::default() };
        let queue = registry.get_or_create(QueueKind::Single, "r", Some(config)).unwrap();

        let updated = QueueConfig { max_concurrency: 5, ..QueueConfig::default() };
        registry.get_or_create(QueueKind::Single, "r", Some(updated)).unwrap();
        assert_eq!(queue.config().max_concurrency, 5);

        // Config-less lookups leave the configuration alone.
        registry.get_or_create(QueueKind::Single, "r", None).unwrap();
        assert_eq!(queue.config().max_concurrency, 5);
    }

    #[test]
    fn test_closed_registry_rejects_operations() {
        let registry = Registry::new();
        let queue = registry.get_or_create(QueueKind::Single, "r", None).unwrap();
        registry.close();

        assert!(queue.status().closed);
        assert!(registry.get_or_create(QueueKind::Single, "r", None).is_none());
        registry.close();
    }

    #[test]
    fn test_reconciliation_closes_orphans() {
        let registry = Registry::new();
        let args: [turnstile_routing::Arg; 2] = [2.into(), 2.into()];
        let r1 = lifo_route("g1", &args);
        let r2 = lifo_route("g2", &args);
        PostProcessor::process(registry.as_ref(), &[Arc::clone(&r1), Arc::clone(&r2)]);

        let q1 = bound_queue(&r1);
        let q2 = bound_queue(&r2);
        assert!(!Arc::ptr_eq(&q1, &q2));

        // Drop g1 from the set: its queue closes, g2's survives.
        let r2_next = lifo_route("g2", &args);
        PostProcessor::process(registry.as_ref(), &[Arc::clone(&r2_next)]);
        assert!(q1.status().closed);
        assert!(!q2.status().closed);
        assert!(Arc::ptr_eq(&q2, &bound_queue(&r2_next)));
    }

    #[test]
    fn test_reconciliation_is_idempotent() {
        let registry = Registry::new();
        let route = lifo_route("r", &[2.into(), 2.into()]);
        PostProcessor::process(registry.as_ref(), &[Arc::clone(&route)]);
        let queue = bound_queue(&route);

        PostProcessor::process(registry.as_ref(), &[Arc::clone(&route)]);
        assert!(!queue.status().closed);
        assert!(Arc::ptr_eq(&queue, &bound_queue(&route)));
    }

    #[test]
    fn test_group_members_share_queue_and_config() {
        let registry = Registry::new();
        let declaring = group_route("g1", &["g".into(), 2.into(), 2.into()]);
        let inheriting = group_route("g2", &["g".into()]);
        // The inheriting member comes first; resolution still finds
        // the declared config before any binding happens.
        PostProcessor::process(registry.as_ref(), &[Arc::clone(&inheriting), Arc::clone(&declaring)]);

        let q1 = bound_queue(&declaring);
        let q2 = bound_queue(&inheriting);
        assert!(Arc::ptr_eq(&q1, &q2));
        assert_eq!(q1.config().max_concurrency, 2);
        assert_eq!(q1.config().max_queue_size, 2);
    }

    #[test]
    fn test_conflicting_group_config_first_wins() {
        let registry = Registry::new();
        let first = group_route("g1", &["g".into(), 2.into(), 2.into()]);
        let second = group_route("g2", &["g".into(), 9.into(), 9.into()]);
        PostProcessor::process(registry.as_ref(), &[Arc::clone(&first), Arc::clone(&second)]);

        let queue = bound_queue(&first);
        assert!(Arc::ptr_eq(&queue, &bound_queue(&second)));
        assert_eq!(queue.config().max_concurrency, 2);
    }

    #[test]
    fn test_name_only_group_gets_provisional_default() {
        let registry = Registry::with_options(RegistryOptions {
            default_config: QueueConfig { max_concurrency: 7, ..QueueConfig::default() },
        });
        let member = group_route("g1", &["g".into()]);
        PostProcessor::process(registry.as_ref(), &[Arc::clone(&member)]);
        assert_eq!(bound_queue(&member).config().max_concurrency, 7);
    }

    fn def(id: &str, filters: &[&str]) -> RouteDef {
        let mut def = RouteDef::new(id);
        for name in filters {
            def = def.with_filter(*name, vec![]);
        }
        def
    }

    fn filter_names(def: &RouteDef) -> Vec<String> {
        def.filters.iter().map(|f| f.name.clone()).collect()
    }

    #[test]
    fn test_pre_processor_dedup_table() {
        let registry = Registry::new();
        let cases: &[(&[&str], &[&str])] = &[
            (&["setPath"], &["setPath"]),
            (&["lifo", "setPath"], &["lifo", "setPath"]),
            (&["lifo", "lifo", "setPath"], &["lifo", "setPath"]),
            (&["lifo", "setPath", "lifo", "lifo", "setPath"], &["setPath", "lifo", "setPath"]),
            (
                &["lifo", "lifoGroup", "lifo", "lifo", "setPath"],
                &["lifoGroup", "lifo", "setPath"],
            ),
        ];

        for (input, want) in cases {
            let out = PreProcessor::process(registry.as_ref(), vec![def("r", input)]);
            assert_eq!(filter_names(&out[0]), *want, "input: {:?}", input);

            // Idempotence: a second pass changes nothing.
            let again = PreProcessor::process(registry.as_ref(), out.clone());
            assert_eq!(again, out, "input: {:?}", input);
        }
    }
}
