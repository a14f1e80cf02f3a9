//! Turnstile Routing
//!
//! The routing pipeline of the Turnstile proxy: route and filter
//! definitions, the filter seam, and a live-reloading routing engine
//! with pre- and post-processing hooks.
//!
//! Subsystems that need to rewrite filter chains or attach state to
//! filter instances (such as the admission scheduler in
//! `turnstile-scheduler`) plug in through
//! [`PreProcessor`]/[`PostProcessor`].

pub mod builtin;
pub mod engine;
pub mod filter;
pub mod route;
pub mod testdata;

pub use engine::{
    serve, CompiledFilter, PostProcessor, PreProcessor, Route, Routing, RoutingOptions,
};
pub use filter::{
    Filter, FilterContext, FilterError, FilterRegistry, FilterSpec, ServedResponse,
};
pub use route::{Arg, Backend, FilterDef, Predicate, RouteDef};
