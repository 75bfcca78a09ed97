//! One-shot parallel processing of a pre-loaded set of work items.

use crate::concurrency::{ContextAction, ErrorSink, Worker, action_fn, context_action_fn};
use crate::config::PARALLELISM;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Processes every item queued in a channel with a bounded number of workers
/// and returns once all of them are done.
///
/// Unlike a [`ParallelQueue`](super::ParallelQueue) a batch is not a long
/// running service: [`Batch::process`] spins up the workers, feeds them the
/// items that were queued when it was called, waits for the last one to finish
/// and tears everything down again.
///
/// # Example
/// ```rust,no_run
/// # async fn run() {
/// use sansho::concurrency::Batch;
///
/// let mut batch = Batch::from_items(1..=100, |n: u64| async move {
///     tracing::info!("Processing {}", n);
///     Ok(())
/// })
/// .with_parallelism(8);
/// batch.process().await;
/// # }
/// ```
pub struct Batch<T> {
    work: mpsc::Receiver<T>,
    action: ContextAction<T>,
    parallelism: usize,
    errors: ErrorSink,
}

impl<T: Send + 'static> Batch<T> {
    /// Creates a batch over an already filled channel.
    pub fn new<F, Fut>(work: mpsc::Receiver<T>, action: F) -> Self
    where
        F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_action(work, context_action_fn(action))
    }

    /// Creates a batch from the given items.
    pub fn from_items<I, F, Fut>(items: I, action: F) -> Self
    where
        I: IntoIterator<Item = T>,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let items = items.into_iter().collect::<Vec<_>>();
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            // The channel was sized for all items and the receiver is alive.
            let _ = tx.try_send(item);
        }
        Self::from_action(rx, action_fn(action))
    }

    pub fn from_action(work: mpsc::Receiver<T>, action: ContextAction<T>) -> Self {
        Self {
            work,
            action,
            parallelism: *PARALLELISM,
            errors: ErrorSink::Discard,
        }
    }

    /// Sets the number of workers. Zero falls back to the default parallelism.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = if parallelism == 0 {
            *PARALLELISM
        } else {
            parallelism
        };
        self
    }

    /// Routes action errors and panics to the given sink.
    pub fn with_errors(mut self, errors: impl Into<ErrorSink>) -> Self {
        self.errors = errors.into();
        self
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Number of items waiting to be processed.
    pub fn len(&self) -> usize {
        self.work.len()
    }

    pub fn is_empty(&self) -> bool {
        self.work.is_empty()
    }

    /// Processes all items queued right now.
    pub async fn process(&mut self) {
        self.process_context(CancellationToken::new()).await
    }

    /// Processes all items queued right now. Cancelling `context` stops
    /// handing out further items; items already handed out still complete.
    #[tracing::instrument(level = "debug", skip_all, fields(items = self.work.len()))]
    pub async fn process_context(&mut self, context: CancellationToken) {
        let count = self.work.len();
        if count == 0 {
            return;
        }
        let parallelism = self.parallelism.min(count).max(1);

        let (idle_tx, mut idle) = mpsc::channel(parallelism);
        let mut workers = Vec::with_capacity(parallelism);
        // Workers only hand the token to the action. Their own loops keep
        // running so that nothing handed out is left behind on cancellation.
        let action: ContextAction<T> = {
            let (action, context) = (self.action.clone(), context.clone());
            Arc::new(move |_: CancellationToken, item: T| action(context.clone(), item))
        };
        for index in 0..parallelism {
            let worker = Worker::from_action(action.clone())
                .with_errors(self.errors.clone())
                .with_finalizer({
                    let idle = idle_tx.clone();
                    move || {
                        let idle = idle.clone();
                        async move {
                            // The batch may have given up already.
                            let _ = idle.send(index).await;
                            Ok(())
                        }
                    }
                });
            // A fresh worker is stopped, so starting it cannot fail.
            let _ = worker.start().await;
            let _ = idle_tx.send(index).await;
            workers.push(worker);
        }
        drop(idle_tx);

        // Items stay in the channel until a worker is free to take them.
        let mut dispatched = 0;
        while dispatched < count {
            let index = tokio::select! {
                biased;
                _ = context.cancelled() => {
                    tracing::debug!(dispatched, count, "Batch cancelled");
                    break;
                }
                index = idle.recv() => index,
            };
            let Some(worker) = index.and_then(|index| workers.get(index)) else {
                break;
            };
            let Some(item) = self.work.recv().await else {
                break;
            };
            if worker.enqueue(item).is_err() {
                tracing::warn!("Batch worker rejected an item");
                break;
            }
            dispatched += 1;
        }

        // Closing runs whatever a worker still has queued before it stops.
        for worker in &workers {
            let _ = worker.close().await;
        }
        tracing::debug!(dispatched, "Batch processed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn processes_all_items() {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let mut batch = Batch::from_items(0..50, {
            let seen = seen.clone();
            move |item: u32| {
                let seen = seen.clone();
                async move {
                    tokio::task::yield_now().await;
                    seen.lock().unwrap().insert(item);
                    Ok(())
                }
            }
        })
        .with_parallelism(4);
        assert_eq!(batch.len(), 50);

        batch.process().await;

        assert_eq!(seen.lock().unwrap().len(), 50);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn only_processes_items_queued_at_call_time() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(16);
        for item in 0..5 {
            tx.send(item).await.unwrap();
        }
        let mut batch = Batch::new(rx, {
            let counter = counter.clone();
            move |_, _: u32| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        })
        .with_parallelism(2);

        batch.process().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);

        tx.send(99).await.unwrap();
        assert_eq!(batch.len(), 1);
        batch.process().await;
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn cancellation_stops_dispatching() {
        let counter = Arc::new(AtomicUsize::new(0));
        let context = CancellationToken::new();
        let mut batch = Batch::from_items(0..10, {
            let (counter, context) = (counter.clone(), context.clone());
            move |_: u32| {
                let (counter, context) = (counter.clone(), context.clone());
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    context.cancel();
                    Ok(())
                }
            }
        })
        .with_parallelism(1);

        tokio::time::timeout(Duration::from_secs(1), batch.process_context(context))
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(batch.len(), 9);
    }

    #[tokio::test]
    async fn cancellation_keeps_handed_out_items() {
        let counter = Arc::new(AtomicUsize::new(0));
        let context = CancellationToken::new();
        let mut batch = Batch::from_items(0..10, {
            let (counter, context) = (counter.clone(), context.clone());
            move |_: u32| {
                let (counter, context) = (counter.clone(), context.clone());
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    context.cancel();
                    Ok(())
                }
            }
        })
        .with_parallelism(2);

        tokio::time::timeout(Duration::from_secs(1), batch.process_context(context))
            .await
            .unwrap();

        let processed = counter.load(Ordering::SeqCst);
        assert!(processed >= 1);
        assert_eq!(processed + batch.len(), 10);
    }

    #[tokio::test]
    async fn failures_are_reported() {
        let (errors, mut failures) = mpsc::channel(8);
        let mut batch = Batch::from_items(0..4, |item: u32| async move {
            anyhow::ensure!(item % 2 == 0, "{} is odd", item);
            Ok(())
        })
        .with_parallelism(2)
        .with_errors(errors);

        batch.process().await;

        let mut messages = Vec::new();
        while let Ok(err) = failures.try_recv() {
            messages.push(err.to_string());
        }
        messages.sort();
        assert_eq!(messages, vec!["1 is odd", "3 is odd"]);
    }

    #[tokio::test]
    async fn empty_batch_returns_immediately() {
        let mut batch = Batch::from_items(Vec::<u32>::new(), |_| async { Ok(()) });
        batch.process().await;
        assert_eq!(batch.parallelism(), *PARALLELISM);
    }
}
