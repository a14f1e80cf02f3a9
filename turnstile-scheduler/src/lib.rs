//! Turnstile Request Admission Scheduler
//!
//! Bounds per-route concurrency by placing arriving requests into
//! named LIFO queues with configurable concurrency limits, queue
//! depths, and timeouts.
//!
//! # Architecture
//!
//! ```text
//! route definitions ──► Registry (pre-processor)  ──► dedup lifo chains
//!                                │
//!                       filter instantiation
//!                                │
//!                       Registry (post-processor) ──► bind queues,
//!                                │                    close orphans
//!                          live routes
//!
//! request ──► LifoFilter.request ──► Queue.wait ──► permit
//!                                                     │
//! response ◄── LifoFilter.response ◄── release ◄──────┘
//! ```
//!
//! The [`Queue`] is a bounded LIFO: when a permit frees up, the most
//! recently suspended request resumes first, so under overload the
//! oldest waiters age out while fresh demand keeps moving. The
//! [`Registry`] owns every queue, keyed by `(kind, name)`, and
//! reconciles the live set against each route-set update without
//! dropping in-flight requests.

pub mod lifo;
pub mod queue;
pub mod registry;

pub use lifo::{
    admission_status, register_admission_filters, LifoFilter, LifoGroupSpec, LifoSpec,
    LIFO_FILTER_NAME, LIFO_GROUP_FILTER_NAME,
};
pub use queue::{Permit, Queue, QueueConfig, QueueStatus, WaitError};
pub use registry::{QueueKey, QueueKind, Registry, RegistryOptions};
