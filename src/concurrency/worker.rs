//! A single consumer task fed over an unbounded channel.

use crate::concurrency::dispatch::Engine;
use crate::concurrency::{
    ContextAction, ErrorSink, Latch, LifecycleError, Signal, action_fn, context_action_fn,
    finalizer_fn,
};
use crate::graceful::Graceful;
use async_trait::async_trait;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A worker is pushed work over a channel and processes it one item at a time.
///
/// [`Worker::enqueue`] never blocks: the channel is unbounded, so a slow action
/// makes the backlog grow instead of stalling producers. Use a
/// [`Queue`](super::Queue) when producers should feel backpressure.
///
/// Shutting down comes in three flavors:
/// - [`Worker::stop`] stops the task and leaves queued items where they are.
///   They are picked up again by the next [`Worker::start`].
/// - [`Worker::drain`] stops the task and executes everything that was queued
///   at that moment before returning. The worker can be started again.
/// - [`Worker::close`] drains and then disposes the channel for good.
///
/// # Example
/// ```rust,no_run
/// # async fn run() -> anyhow::Result<()> {
/// use sansho::concurrency::Worker;
///
/// let worker = Worker::new(|name: String| async move {
///     tracing::info!("Hello {}", name);
///     Ok(())
/// });
/// worker.start().await?;
/// worker.enqueue("world".to_string())?;
/// worker.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Worker<T> {
    engine: Engine<T, mpsc::UnboundedReceiver<T>>,
    work: mpsc::UnboundedSender<T>,
}

impl<T: Send + 'static> Worker<T> {
    /// Creates a worker invoking the given action per work item.
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_action(action_fn(action))
    }

    /// Creates a worker whose action also receives the worker's context.
    pub fn new_with_context<F, Fut>(action: F) -> Self
    where
        F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_action(context_action_fn(action))
    }

    /// Creates a worker from an already boxed action.
    pub fn from_action(action: ContextAction<T>) -> Self {
        let (work, receiver) = mpsc::unbounded_channel();
        Self {
            engine: Engine::new(action, receiver),
            work,
        }
    }

    /// Routes action errors and panics to the given sink.
    pub fn with_errors(mut self, errors: impl Into<ErrorSink>) -> Self {
        self.engine.executor.errors = errors.into();
        self
    }

    /// Installs a finalizer which runs after every work item, whatever its outcome.
    pub fn with_finalizer<F, Fut>(mut self, finalizer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.engine.executor.finalizer = Some(finalizer_fn(finalizer));
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

    /// Number of items queued while the worker is stopped.
    pub fn backlog_len(&self) -> usize {
        self.engine.backlog_len()
    }

    /// Adds an item to the work queue.
    pub fn enqueue(&self, item: T) -> Result<(), LifecycleError> {
        if self.engine.is_closed() {
            return Err(LifecycleError::Closed);
        }
        self.work.send(item).map_err(|_| LifecycleError::Closed)
    }

    /// Starts the worker and waits until it receives work.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.engine.start().await
    }

    /// Stops the worker. Queued work remains queued.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.engine.stop().await
    }

    /// Stops the worker and synchronously executes the remaining work.
    pub async fn drain(&self) {
        self.engine.drain().await
    }

    /// Like [`Worker::drain`] but gives up once `context` is cancelled.
    pub async fn drain_context(&self, context: CancellationToken) {
        self.engine.drain_context(context).await
    }

    /// Drains the worker and closes its channel.
    pub async fn close(&self) {
        self.engine.close().await
    }
}

#[async_trait]
impl<T: Send + 'static> Graceful for Worker<T> {
    async fn start(&self) -> Result<(), LifecycleError> {
        Worker::start(self).await
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        Worker::stop(self).await
    }

    fn latch(&self) -> &Latch {
        Worker::latch(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ActionPanic;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn recording_worker() -> (Worker<u32>, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = Worker::new({
            let seen = seen.clone();
            move |item: u32| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(item);
                    Ok(())
                }
            }
        });
        (worker, seen)
    }

    #[tokio::test]
    async fn processes_items_in_order() {
        let (worker, seen) = recording_worker();
        worker.start().await.unwrap();
        assert!(worker.latch().is_started());

        for item in 0..10 {
            worker.enqueue(item).unwrap();
        }
        worker.close().await;

        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert!(worker.latch().is_stopped());
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let (worker, _) = recording_worker();
        worker.start().await.unwrap();
        assert_eq!(worker.start().await, Err(LifecycleError::CannotStart));
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_twice_fails() {
        let (worker, _) = recording_worker();
        assert_eq!(worker.stop().await, Err(LifecycleError::CannotStop));

        worker.start().await.unwrap();
        worker.stop().await.unwrap();
        assert_eq!(worker.stop().await, Err(LifecycleError::CannotStop));
    }

    #[tokio::test]
    async fn every_failure_reaches_the_error_channel() {
        let (errors, mut failures) = mpsc::channel(64);
        let worker =
            Worker::new(|item: u32| async move { Err(anyhow::anyhow!("failed {}", item)) })
                .with_errors(errors);
        worker.start().await.unwrap();

        for item in 0..16 {
            worker.enqueue(item).unwrap();
        }
        worker.close().await;

        let mut received = 0;
        while let Ok(err) = failures.try_recv() {
            assert_eq!(err.to_string(), format!("failed {}", received));
            received += 1;
        }
        assert_eq!(received, 16);
    }

    #[tokio::test]
    async fn panics_are_recovered() {
        let (errors, mut failures) = mpsc::channel(4);
        let worker = Worker::new(|item: u32| async move {
            if item == 1 {
                panic!("unlucky");
            }
            Ok(())
        })
        .with_errors(errors);
        worker.start().await.unwrap();

        worker.enqueue(1).unwrap();
        worker.enqueue(2).unwrap();

        let err = failures.recv().await.unwrap();
        assert_eq!(err.downcast_ref::<ActionPanic>().unwrap().message, "unlucky");
        assert!(worker.latch().is_started());

        worker.close().await;
        assert!(failures.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_keeps_queued_work() {
        let gate = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());
        let count = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new({
            let (gate, entered, count) = (gate.clone(), entered.clone(), count.clone());
            move |_: u32| {
                let (gate, entered, count) = (gate.clone(), entered.clone(), count.clone());
                async move {
                    entered.notify_one();
                    gate.notified().await;
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        });
        let worker = Arc::new(worker);
        worker.start().await.unwrap();

        for item in 0..3 {
            worker.enqueue(item).unwrap();
        }
        entered.notified().await;

        let stopping = worker.latch().notify_stopping();
        let stop = tokio::spawn({
            let worker = worker.clone();
            async move { worker.stop().await }
        });
        stopping.wait().await;
        gate.notify_one();
        stop.await.unwrap().unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(worker.backlog_len(), 2);

        // The next start picks up what was left behind.
        worker.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while count.load(Ordering::SeqCst) < 3 {
                gate.notify_one();
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn drain_executes_backlog_and_allows_restart() {
        let (worker, seen) = recording_worker();
        for item in 0..5 {
            worker.enqueue(item).unwrap();
        }

        worker.drain().await;
        assert_eq!(seen.lock().unwrap().len(), 5);
        assert_eq!(worker.backlog_len(), 0);

        worker.start().await.unwrap();
        worker.enqueue(5).unwrap();
        worker.drain().await;
        assert_eq!(*seen.lock().unwrap(), (0..6).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn drain_context_gives_up_when_cancelled() {
        let (worker, seen) = recording_worker();
        for item in 0..5 {
            worker.enqueue(item).unwrap();
        }

        let context = CancellationToken::new();
        context.cancel();
        worker.drain_context(context).await;

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(worker.backlog_len(), 5);
    }

    #[tokio::test]
    async fn close_rejects_further_work() {
        let (worker, _) = recording_worker();
        worker.start().await.unwrap();
        worker.close().await;

        assert_eq!(worker.enqueue(1), Err(LifecycleError::Closed));
        assert_eq!(worker.start().await, Err(LifecycleError::Closed));
    }

    #[tokio::test]
    async fn finalizer_runs_after_each_item() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new(|item: u32| async move {
            anyhow::ensure!(item % 2 == 0, "odd");
            Ok(())
        })
        .with_finalizer({
            let finalized = finalized.clone();
            move || {
                let finalized = finalized.clone();
                async move {
                    finalized.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        });
        worker.start().await.unwrap();

        for item in 0..4 {
            worker.enqueue(item).unwrap();
        }
        worker.close().await;

        assert_eq!(finalized.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancelling_the_context_stops_the_worker() {
        let context = CancellationToken::new();
        let (worker, _) = recording_worker();
        let worker = worker.with_context(context.clone());
        worker.start().await.unwrap();

        let stopped = worker.notify_stopped();
        context.cancel();
        tokio::time::timeout(Duration::from_secs(1), stopped.wait())
            .await
            .unwrap();

        assert!(worker.latch().is_stopped());
    }
}
