//! A bounded queue served by a fixed pool of workers.

use crate::concurrency::{
    ActionFuture, ContextAction, ErrorSink, Latch, LifecycleError, Queue, Signal, action_fn,
    recover,
};
use crate::config::QUEUE_MAX_WORK;
use crate::graceful::Graceful;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// State owned by the dispatcher while it runs and parked here otherwise.
struct Pool<T> {
    work: mpsc::Receiver<T>,
    idle: Option<mpsc::Receiver<usize>>,
    workers: Vec<Queue<T>>,
}

/// A queue whose items are processed by `num_workers` workers in parallel.
///
/// A single dispatcher task pulls items in arrival order and hands each one
/// to the next idle worker. Workers report back to the idle pool once their
/// action has completed, so every worker holds at most one item at a time.
/// Completion order across workers is not defined.
pub struct ParallelQueue<T> {
    latch: Arc<Latch>,
    num_workers: usize,
    action: ContextAction<T>,
    errors: ErrorSink,
    work: mpsc::Sender<T>,
    pool: Arc<Mutex<Option<Pool<T>>>>,
    enqueued: Arc<AtomicU64>,
    processed: Arc<watch::Sender<u64>>,
}

impl<T: Send + 'static> ParallelQueue<T> {
    /// Creates a parallel queue with the default capacity (see [`QUEUE_MAX_WORK`]).
    pub fn new<F, Fut>(num_workers: usize, action: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_action(num_workers, action_fn(action))
    }

    /// Creates a parallel queue from an already boxed action. At least one
    /// worker is used.
    pub fn from_action(num_workers: usize, action: ContextAction<T>) -> Self {
        let (work, receiver) = mpsc::channel(*QUEUE_MAX_WORK);
        Self {
            latch: Arc::new(Latch::new()),
            num_workers: num_workers.max(1),
            action,
            errors: ErrorSink::Discard,
            work,
            pool: Arc::new(Mutex::new(Some(Pool {
                work: receiver,
                idle: None,
                workers: Vec::new(),
            }))),
            enqueued: Arc::new(AtomicU64::new(0)),
            processed: Arc::new(watch::channel(0).0),
        }
    }

    /// Replaces the work channel by one of the given capacity.
    pub fn with_max_work(mut self, max_work: usize) -> Self {
        let (work, receiver) = mpsc::channel(max_work.max(1));
        self.work = work;
        self.pool = Arc::new(Mutex::new(Some(Pool {
            work: receiver,
            idle: None,
            workers: Vec::new(),
        })));
        self
    }

    /// Routes action errors and panics of all workers to the given sink.
    pub fn with_errors(mut self, errors: impl Into<ErrorSink>) -> Self {
        self.errors = errors.into();
        self
    }

    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    pub fn notify_started(&self) -> Signal {
        self.latch.notify_started()
    }

    pub fn notify_stopped(&self) -> Signal {
        self.latch.notify_stopped()
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Number of items waiting for a worker.
    pub fn len(&self) -> usize {
        self.work.max_capacity() - self.work.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_pool(&self) -> Option<Pool<T>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn restore_pool(&self, pool: Pool<T>) {
        *self.pool.lock().unwrap_or_else(PoisonError::into_inner) = Some(pool);
    }

    /// Adds an item to the work queue, waiting for a free slot if it is full.
    pub async fn enqueue(&self, item: T) -> Result<(), LifecycleError> {
        self.work
            .send(item)
            .await
            .map_err(|_| LifecycleError::Closed)?;
        self.enqueued.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Wraps the action so that the worker rejoins the idle pool afterwards.
    fn and_return(&self, index: usize, idle: mpsc::Sender<usize>) -> ContextAction<T> {
        let action = self.action.clone();
        let processed = self.processed.clone();
        Arc::new(move |context: CancellationToken, item: T| -> ActionFuture {
            let action = action.clone();
            let processed = processed.clone();
            let idle = idle.clone();
            async move {
                let result = recover(async move { action(context, item).await }).await;
                processed.send_modify(|count| *count += 1);
                if idle.send(index).await.is_err() {
                    tracing::debug!(index, "Idle pool is gone, worker not returned");
                }
                result
            }
            .boxed()
        })
    }

    /// Starts all workers and the dispatcher.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        if !self.latch.can_start() {
            return Err(LifecycleError::CannotStart);
        }
        let Some(mut pool) = self.take_pool() else {
            return Err(LifecycleError::CannotStart);
        };

        let started = self.latch.notify_started();
        let stopping = self.latch.notify_stopping();
        if !self.latch.starting() {
            self.restore_pool(pool);
            return Err(LifecycleError::CannotStart);
        }

        let (idle_tx, idle_rx) = mpsc::channel(self.num_workers);
        pool.workers.clear();
        for index in 0..self.num_workers {
            let worker = Queue::from_action(1, self.and_return(index, idle_tx.clone()))
                .with_errors(self.errors.clone());
            // A fresh worker is stopped, so starting it cannot fail.
            let _ = worker.start().await;
            let _ = idle_tx.send(index).await;
            pool.workers.push(worker);
        }
        pool.idle = Some(idle_rx);

        tracing::debug!(workers = self.num_workers, "Starting parallel queue");
        tokio::spawn(dispatch(
            self.latch.clone(),
            self.pool.clone(),
            pool,
            self.processed.clone(),
            stopping,
        ));
        started.wait().await;

        Ok(())
    }

    /// Waits until as many items as were enqueued so far have been processed.
    ///
    /// This is a point-in-time barrier: items enqueued afterwards are not
    /// waited for. It also returns once the dispatcher stops.
    pub async fn drain(&self) {
        let stopped = self.latch.notify_stopped();
        if !self.latch.is_started() {
            return;
        }

        let target = self.enqueued.load(Ordering::Acquire);
        let mut processed = self.processed.subscribe();
        tokio::select! {
            _ = processed.wait_for(|count| *count >= target) => {}
            _ = stopped.wait() => {}
        }
    }

    /// Stops the dispatcher, waits for every worker to finish its current item
    /// and stops it. Items still waiting in the queue are abandoned.
    pub async fn close(&self) -> Result<(), LifecycleError> {
        if !self.latch.can_stop() {
            return Err(LifecycleError::CannotStop);
        }
        self.latch.wait_stopped().await;

        let Some(mut pool) = self.take_pool() else {
            return Ok(());
        };
        if let Some(mut idle) = pool.idle.take() {
            for _ in 0..pool.workers.len() {
                let Some(index) = idle.recv().await else {
                    break;
                };
                if let Some(worker) = pool.workers.get(index) {
                    let _ = worker.stop().await;
                }
            }
        }
        pool.workers.clear();

        let abandoned = pool.work.len();
        if abandoned > 0 {
            tracing::warn!(abandoned, "Closing parallel queue with pending work");
        }
        self.restore_pool(pool);

        Ok(())
    }
}

async fn dispatch<T: Send + 'static>(
    latch: Arc<Latch>,
    slot: Arc<Mutex<Option<Pool<T>>>>,
    mut pool: Pool<T>,
    processed: Arc<watch::Sender<u64>>,
    stopping: Signal,
) {
    // An item that never reaches a worker still counts as done for `drain`.
    let settle = || processed.send_modify(|count| *count += 1);

    latch.started();

    if let Some(idle) = pool.idle.as_mut() {
        loop {
            let item = tokio::select! {
                biased;
                _ = stopping.wait() => break,
                item = pool.work.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = stopping.wait() => {
                    tracing::debug!("Stopping while waiting for an idle worker, abandoning item");
                    settle();
                    break;
                }
                index = idle.recv() => {
                    let Some(worker) = index.and_then(|index| pool.workers.get(index)) else {
                        settle();
                        break;
                    };
                    if let Err(err) = worker.enqueue(item).await {
                        tracing::warn!("Failed to hand work to a worker: {}", err);
                        settle();
                    }
                }
            }
        }
    }

    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(pool);
    latch.stopping();
    latch.stopped();
}

#[async_trait]
impl<T: Send + 'static> Graceful for ParallelQueue<T> {
    async fn start(&self) -> Result<(), LifecycleError> {
        ParallelQueue::start(self).await
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        self.close().await
    }

    fn latch(&self) -> &Latch {
        ParallelQueue::latch(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn processes_every_item_exactly_once() {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        let queue = ParallelQueue::new(4, {
            let (seen, counter) = (seen.clone(), counter.clone());
            move |item: usize| {
                let (seen, counter) = (seen.clone(), counter.clone());
                async move {
                    tokio::task::yield_now().await;
                    assert!(seen.lock().unwrap().insert(item), "{} seen twice", item);
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        });
        queue.start().await.unwrap();

        for item in 0..100 {
            queue.enqueue(item).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) < 100 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        queue.close().await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(seen.lock().unwrap().len(), 100);
        assert!(queue.latch().is_stopped());
    }

    #[tokio::test]
    async fn workers_run_in_parallel() {
        let gate = Arc::new(Notify::new());
        let running = Arc::new(AtomicUsize::new(0));
        let queue = ParallelQueue::new(3, {
            let (gate, running) = (gate.clone(), running.clone());
            move |_: u32| {
                let (gate, running) = (gate.clone(), running.clone());
                async move {
                    running.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok(())
                }
            }
        });
        queue.start().await.unwrap();

        for item in 0..3 {
            queue.enqueue(item).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while running.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        gate.notify_waiters();
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn drain_waits_for_queued_items() {
        let counter = Arc::new(AtomicUsize::new(0));
        let queue = ParallelQueue::new(2, {
            let counter = counter.clone();
            move |_: u32| {
                let counter = counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        });

        for item in 0..10 {
            queue.enqueue(item).await.unwrap();
        }
        queue.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), queue.drain())
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        // Nothing is pending, so a second barrier passes right away.
        tokio::time::timeout(Duration::from_secs(1), queue.drain())
            .await
            .unwrap();
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn drain_after_restart_ignores_abandoned_items() {
        let gate = Arc::new(Notify::new());
        let open = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(ParallelQueue::new(1, {
            let (gate, open, counter) = (gate.clone(), open.clone(), counter.clone());
            move |_: u32| {
                let (gate, open, counter) = (gate.clone(), open.clone(), counter.clone());
                async move {
                    if !open.load(Ordering::SeqCst) {
                        gate.notified().await;
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        }));
        queue.start().await.unwrap();

        for item in 0..3 {
            queue.enqueue(item).await.unwrap();
        }
        // The worker blocks on item 0 while the dispatcher holds item 1.
        tokio::time::timeout(Duration::from_secs(1), async {
            while queue.len() > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let stopping = queue.latch().notify_stopping();
        let closing = tokio::spawn({
            let queue = queue.clone();
            async move { queue.close().await }
        });
        stopping.wait().await;
        open.store(true, Ordering::SeqCst);
        gate.notify_one();
        closing.await.unwrap().unwrap();
        assert_eq!(queue.len(), 1);

        queue.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), queue.drain())
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn errors_from_all_workers_are_reported() {
        let (errors, mut failures) = mpsc::channel(16);
        let queue = ParallelQueue::new(4, |item: u32| async move {
            Err(anyhow::anyhow!("item {} failed", item))
        })
        .with_errors(errors);
        queue.start().await.unwrap();

        for item in 0..8 {
            queue.enqueue(item).await.unwrap();
        }
        let mut received = 0;
        while received < 8 {
            tokio::time::timeout(Duration::from_secs(1), failures.recv())
                .await
                .unwrap()
                .unwrap();
            received += 1;
        }
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn lifecycle_misuse_is_rejected() {
        let queue = ParallelQueue::new(2, |_: u32| async { Ok(()) });
        assert_eq!(queue.close().await, Err(LifecycleError::CannotStop));

        queue.start().await.unwrap();
        assert_eq!(queue.start().await, Err(LifecycleError::CannotStart));
        queue.close().await.unwrap();

        // The pool can be started again after closing.
        queue.start().await.unwrap();
        queue.close().await.unwrap();
    }
}
