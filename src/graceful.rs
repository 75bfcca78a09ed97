//! Coordinated startup and shutdown of background services.
//!
//! Every long-lived primitive of [`concurrency`](crate::concurrency)
//! implements [`Graceful`], so a service can start all of them, wait for a
//! termination signal and stop them again in reverse order:
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), sansho::concurrency::LifecycleError> {
//! use sansho::concurrency::{AutoflushBuffer, Worker};
//! use sansho::graceful;
//!
//! let uploads = AutoflushBuffer::new(|batch: Vec<String>| async move {
//!     tracing::info!("Uploading {} lines", batch.len());
//!     Ok(())
//! });
//! let mails = Worker::new(|address: String| async move {
//!     tracing::info!("Sending mail to {}", address);
//!     Ok(())
//! });
//!
//! let services: [&dyn graceful::Graceful; 2] = [&uploads, &mails];
//! graceful::shutdown_by_signal(&services).await
//! # }
//! ```

use crate::concurrency::{Latch, LifecycleError};
use crate::tools::system;
use async_trait::async_trait;
use std::future::Future;

/// A background service with a start/stop lifecycle.
#[async_trait]
pub trait Graceful: Send + Sync {
    /// Starts the service and returns once it is running.
    async fn start(&self) -> Result<(), LifecycleError>;

    /// Stops the service and returns once it has stopped.
    async fn stop(&self) -> Result<(), LifecycleError>;

    /// The latch tracking the lifecycle of the service.
    fn latch(&self) -> &Latch;
}

/// Starts all services in order, waits for `signal` and stops them in reverse
/// order.
///
/// If a service fails to start, the services started so far are stopped again
/// and the error is returned. Failures while stopping are logged, as there is
/// nobody left to handle them.
pub async fn shutdown<S>(services: &[&dyn Graceful], signal: S) -> Result<(), LifecycleError>
where
    S: Future<Output = ()>,
{
    for (index, service) in services.iter().enumerate() {
        if let Err(err) = service.start().await {
            tracing::warn!(index, "Failed to start service: {}", err);
            stop_all(&services[..index]).await;
            return Err(err);
        }
    }
    tracing::debug!(services = services.len(), "All services started");

    signal.await;

    stop_all(services).await;
    tracing::debug!(services = services.len(), "All services stopped");

    Ok(())
}

/// Like [`shutdown`] but waits for SIGINT, SIGTERM or SIGHUP.
pub async fn shutdown_by_signal(services: &[&dyn Graceful]) -> Result<(), LifecycleError> {
    shutdown(services, system::await_termination("services")).await
}

async fn stop_all(services: &[&dyn Graceful]) {
    for (index, service) in services.iter().enumerate().rev() {
        if let Err(err) = service.stop().await {
            tracing::warn!(index, "Failed to stop service: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::{AutoAction, Worker};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn starts_and_stops_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let worker = Worker::new({
            let events = events.clone();
            move |item: &'static str| {
                let events = events.clone();
                async move {
                    events.lock().unwrap().push(item);
                    Ok(())
                }
            }
        });
        let action = AutoAction::new(Duration::from_secs(3600), "final", {
            let events = events.clone();
            move |value: &'static str| {
                let events = events.clone();
                async move {
                    events.lock().unwrap().push(value);
                    Ok(())
                }
            }
        });

        let (trigger, signal) = oneshot::channel::<()>();
        let services: [&dyn Graceful; 2] = [&worker, &action];
        let running = shutdown(&services, async {
            let _ = signal.await;
        });
        tokio::pin!(running);

        tokio::select! {
            _ = &mut running => panic!("shutdown returned before the signal"),
            _ = async {
                while !(worker.latch().is_started() && action.latch().is_started()) {
                    tokio::task::yield_now().await;
                }
            } => {}
        }

        let _ = trigger.send(());
        running.await.unwrap();

        assert!(worker.latch().is_stopped());
        assert!(action.latch().is_stopped());
        assert_eq!(*events.lock().unwrap(), vec!["final"]);
    }

    #[tokio::test]
    async fn failed_start_stops_started_services() {
        let first = Worker::new(|_: u32| async { Ok(()) });
        let second = Worker::new(|_: u32| async { Ok(()) });
        second.start().await.unwrap();

        let services: [&dyn Graceful; 2] = [&first, &second];
        let result = shutdown(&services, async {
            panic!("must not wait for the signal");
        })
        .await;

        assert_eq!(result, Err(LifecycleError::CannotStart));
        assert!(first.latch().is_stopped());
        assert!(second.latch().is_started());
    }
}
