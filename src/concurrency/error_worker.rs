//! A worker whose work items are errors.

use crate::concurrency::dispatch::Engine;
use crate::concurrency::{ErrorSink, Latch, LifecycleError, Signal, context_action_fn};
use crate::graceful::Graceful;
use async_trait::async_trait;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Processes errors pushed from elsewhere, e.g. to report them to an external
/// collector off the hot path.
///
/// Whenever the action itself fails or panics, the resulting error is handed
/// to the fallback (see [`ErrorWorker::with_fallback`]) rather than a channel,
/// so that a broken reporter never feeds errors back into itself.
pub struct ErrorWorker {
    engine: Engine<anyhow::Error, mpsc::UnboundedReceiver<anyhow::Error>>,
    work: mpsc::UnboundedSender<anyhow::Error>,
}

impl ErrorWorker {
    /// Creates an error worker invoking the given action per error.
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: Fn(CancellationToken, anyhow::Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (work, receiver) = mpsc::unbounded_channel();
        Self {
            engine: Engine::new(context_action_fn(action), receiver),
            work,
        }
    }

    /// Sets the callback which receives failures of the action itself.
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(anyhow::Error) + Send + Sync + 'static,
    {
        self.engine.executor.errors = ErrorSink::fallback(fallback);
        self
    }

    /// Sets the context handed to the action. Cancelling it stops the worker.
    pub fn with_context(mut self, context: CancellationToken) -> Self {
        self.engine.context = context;
        self
    }

    pub fn latch(&self) -> &Latch {
        &self.engine.latch
    }

    pub fn notify_started(&self) -> Signal {
        self.engine.latch.notify_started()
    }

    pub fn notify_stopped(&self) -> Signal {
        self.engine.latch.notify_stopped()
    }

    /// Adds an error to the work queue.
    pub fn enqueue(&self, err: anyhow::Error) -> Result<(), LifecycleError> {
        if self.engine.is_closed() {
            return Err(LifecycleError::Closed);
        }
        self.work.send(err).map_err(|_| LifecycleError::Closed)
    }

    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.engine.start().await
    }

    /// Stops the worker. Queued errors remain queued.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.engine.stop().await
    }

    /// Stops the worker and synchronously processes the remaining errors.
    pub async fn drain(&self) {
        self.engine.drain().await
    }

    /// Like [`ErrorWorker::drain`] but gives up once `context` is cancelled.
    pub async fn drain_context(&self, context: CancellationToken) {
        self.engine.drain_context(context).await
    }

    /// Drains the worker and closes its channel.
    pub async fn close(&self) {
        self.engine.close().await
    }
}

#[async_trait]
impl Graceful for ErrorWorker {
    async fn start(&self) -> Result<(), LifecycleError> {
        ErrorWorker::start(self).await
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        ErrorWorker::stop(self).await
    }

    fn latch(&self) -> &Latch {
        ErrorWorker::latch(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn reports_every_error() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let worker = ErrorWorker::new({
            let reported = reported.clone();
            move |_, err: anyhow::Error| {
                let reported = reported.clone();
                async move {
                    reported.lock().unwrap().push(err.to_string());
                    Ok(())
                }
            }
        });
        worker.start().await.unwrap();

        worker.enqueue(anyhow::anyhow!("disk full")).unwrap();
        worker.enqueue(anyhow::anyhow!("connection reset")).unwrap();
        worker.close().await;

        assert_eq!(
            *reported.lock().unwrap(),
            vec!["disk full", "connection reset"]
        );
    }

    #[tokio::test]
    async fn failing_action_uses_the_fallback() {
        let fallback = Arc::new(Mutex::new(Vec::new()));
        let worker = ErrorWorker::new(|_, err: anyhow::Error| async move {
            if err.to_string() == "panic" {
                panic!("reporter crashed");
            }
            Err(err.context("cannot report"))
        })
        .with_fallback({
            let fallback = fallback.clone();
            move |err| fallback.lock().unwrap().push(format!("{:#}", err))
        });
        worker.start().await.unwrap();

        worker.enqueue(anyhow::anyhow!("timeout")).unwrap();
        worker.enqueue(anyhow::anyhow!("panic")).unwrap();
        worker.drain().await;

        assert_eq!(
            *fallback.lock().unwrap(),
            vec![
                "cannot report: timeout",
                "action panicked: reporter crashed"
            ]
        );
        assert!(worker.latch().is_stopped());
    }

    #[tokio::test]
    async fn stop_leaves_errors_queued() {
        let worker = ErrorWorker::new(|_, _| async { Ok(()) });
        assert_eq!(worker.stop().await, Err(LifecycleError::CannotStop));

        worker.start().await.unwrap();
        worker.stop().await.unwrap();
        worker.enqueue(anyhow::anyhow!("later")).unwrap();
        assert_eq!(worker.engine.backlog_len(), 1);

        worker.close().await;
        assert_eq!(worker.engine.backlog_len(), 0);
        assert_eq!(
            worker.enqueue(anyhow::anyhow!("too late")).unwrap_err(),
            LifecycleError::Closed
        );
    }
}
