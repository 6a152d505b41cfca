//! Redis-backed background job queue and worker runtime.
//!
//! Wire-compatible with the original Resque key/value layout: jobs enqueued
//! here can be consumed by other Resque producers and show up in existing
//! dashboards, and vice versa.
//!
//! Producers build a [`context::Context`], register handlers, and call
//! [`context::Context::enqueue`]. A worker process constructs an
//! [`application::Worker`] over one or more queues and runs its
//! [`application::Worker::work`] loop, which reserves jobs in priority
//! order and executes each inside an isolated child task.

pub mod application;
pub mod config;
pub mod context;
pub mod events;
pub mod models;
pub mod redis_utils;
pub mod registry;

pub use crate::application::{Job, Keys, MatchSpec, Queue, Worker};
pub use crate::context::Context;
pub use crate::events::{Event, EventBus, HookData, HookFlow, Listener};
pub use crate::models::{RusqueError, RusqueResult};
pub use crate::registry::{HandlerError, HandlerRegistry, JobHandler};

/// Crate version, reported at worker startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
