//! # Sansho
//!
//! Building blocks for background processing on tokio: workers and queues
//! with explicit start/stop lifecycles, parallel worker pools, one-shot
//! batches, auto-flushing buffers and periodic actions.
//!
//! ## Modules
//!
//! - [`concurrency`] - the primitives and the [`Latch`](concurrency::Latch)
//!   coordinating their lifecycle
//! - [`graceful`] - starting and stopping a set of primitives around a
//!   termination signal
//! - [`config`] - defaults read from the environment
//! - [`logging`] - console setup for the emitted `tracing` events
//! - [`tools`] - signal handling and timing helpers
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `ASYNC_QUEUE_MAX_WORK` | Capacity of queues and parallel queues | `1024` |
//! | `ASYNC_INTERVAL_MS` | Tick of autoflush buffers and auto actions | `500` |
//! | `ASYNC_PARALLELISM` | Default worker count of a batch | available CPUs |
//! | `ASYNC_SHUTDOWN_GRACE_PERIOD_MS` | Time `stop` waits for in-flight flushes | `10000` |
//! | `RUST_LOG` | Log filter | `info` |
//!
//! ## Feature Flags
//!
//! - `pretty_logs` - colorful console output with timestamps, for local
//!   development
//!
//! ## Example
//!
//! ```rust,no_run
//! use sansho::concurrency::Queue;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     sansho::logging::setup_tracing();
//!
//!     let greetings = Queue::with_capacity(8, |name: String| async move {
//!         tracing::info!("Hello {}", name);
//!         Ok(())
//!     });
//!     greetings.start().await?;
//!     greetings.enqueue("world".to_string()).await?;
//!     greetings.close().await;
//!
//!     Ok(())
//! }
//! ```

pub mod concurrency;
pub mod config;
pub mod graceful;
pub mod logging;
pub mod tools;
