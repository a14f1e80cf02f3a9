//! In-memory route data client.
//!
//! Feeds full route-set replacements into a [`crate::engine::Routing`]
//! instance. Test suites across the workspace use it to drive live
//! configuration updates without a real data source.

use tokio::sync::watch;

use crate::route::RouteDef;

/// An in-memory source of route-set updates.
pub struct TestDataClient {
    tx: watch::Sender<Vec<RouteDef>>,
}

impl TestDataClient {
    /// Create a client seeded with an initial route set, returning the
    /// update receiver to hand to [`crate::engine::Routing::new`].
    pub fn new(initial: Vec<RouteDef>) -> (Self, watch::Receiver<Vec<RouteDef>>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, rx)
    }

    /// Replace the full route set. A no-op once the routing instance
    /// consuming the updates has shut down.
    pub fn update(&self, defs: Vec<RouteDef>) {
        let _ = self.tx.send(defs);
    }
}
