//! Lifecycle-managed background processing.
//!
//! Every primitive in here runs one or more tokio tasks and is driven by a
//! [`Latch`] cycling through `Stopped -> Starting -> Started -> Stopping`:
//!
//! - [`Worker`] and [`ErrorWorker`] consume an unbounded channel one item at a
//!   time,
//! - [`Queue`] does the same over a bounded channel, so `enqueue` waits while
//!   it is full,
//! - [`ParallelQueue`] hands items to a pool of single-slot queues,
//! - [`Batch`] processes a fixed set of items in parallel and returns,
//! - [`AutoflushBuffer`] collects items and flushes them in batches,
//! - [`AutoAction`] runs a handler periodically or on demand.
//!
//! Actions are plain async closures returning `anyhow::Result<()>`. Their
//! failures and panics never reach the producer; they are routed to an
//! [`ErrorSink`] instead.

mod action;
mod auto_action;
mod autoflush;
mod batch;
mod dispatch;
mod error;
mod error_worker;
mod latch;
mod parallel_queue;
mod queue;
mod worker;

pub use action::{
    ActionFuture, ContextAction, ErrorSink, Finalizer, action_fn, context_action_fn,
    finalizer_fn, recover,
};
pub use auto_action::AutoAction;
pub use autoflush::AutoflushBuffer;
pub use batch::Batch;
pub use error::{ActionPanic, LifecycleError};
pub use error_worker::ErrorWorker;
pub use latch::{Latch, LatchState, Signal};
pub use parallel_queue::ParallelQueue;
pub use queue::Queue;
pub use worker::Worker;
