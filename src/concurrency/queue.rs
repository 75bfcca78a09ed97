//! A single consumer task fed over a bounded channel.

use crate::concurrency::dispatch::Engine;
use crate::concurrency::{
    ContextAction, ErrorSink, Latch, LifecycleError, Signal, action_fn, context_action_fn,
};
use crate::config::QUEUE_MAX_WORK;
use crate::graceful::Graceful;
use async_trait::async_trait;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A queue processes work items one at a time, holding at most `max_work`
/// pending items.
///
/// Once the queue is full, [`Queue::enqueue`] waits until the consumer frees
/// a slot. This is the admission control of the queue; a full queue is never
/// reported as an error.
///
/// Like a [`Worker`](super::Worker), a queue distinguishes [`Queue::stop`]
/// (leave pending work queued), [`Queue::drain`] (execute pending work, stay
/// restartable) and [`Queue::close`] (execute pending work, then dispose).
pub struct Queue<T> {
    engine: Engine<T, mpsc::Receiver<T>>,
    work: mpsc::Sender<T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            work: self.work.clone(),
        }
    }
}

impl<T: Send + 'static> Queue<T> {
    /// Creates a queue with the default capacity (see [`QUEUE_MAX_WORK`]).
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_action(*QUEUE_MAX_WORK, action_fn(action))
    }

    /// Creates a queue with the given capacity.
    pub fn with_capacity<F, Fut>(max_work: usize, action: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_action(max_work, action_fn(action))
    }

    /// Creates a queue whose action also receives the queue's context.
    pub fn new_with_context<F, Fut>(max_work: usize, action: F) -> Self
    where
        F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_action(max_work, context_action_fn(action))
    }

    /// Creates a queue from an already boxed action. A capacity of zero is
    /// raised to one.
    pub fn from_action(max_work: usize, action: ContextAction<T>) -> Self {
        let (work, receiver) = mpsc::channel(max_work.max(1));
        Self {
            engine: Engine::new(action, receiver),
            work,
        }
    }

    /// Replaces the work channel by one of the given capacity.
    ///
    /// Items enqueued so far are dropped, so this belongs right after
    /// construction.
    pub fn with_max_work(mut self, max_work: usize) -> Self {
        let (work, receiver) = mpsc::channel(max_work.max(1));
        self.engine.replace_backlog(receiver);
        self.work = work;
        self
    }

    /// Routes action errors and panics to the given sink.
    pub fn with_errors(mut self, errors: impl Into<ErrorSink>) -> Self {
        self.engine.executor.errors = errors.into();
        self
    }

    /// Sets the context handed to the action. Cancelling it stops the queue.
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

    /// The capacity of the work channel.
    pub fn max_work(&self) -> usize {
        self.work.max_capacity()
    }

    /// Number of pending work items.
    pub fn len(&self) -> usize {
        self.work.max_capacity() - self.work.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds an item to the work queue, waiting for a free slot if it is full.
    pub async fn enqueue(&self, item: T) -> Result<(), LifecycleError> {
        if self.engine.is_closed() {
            return Err(LifecycleError::Closed);
        }
        self.work
            .send(item)
            .await
            .map_err(|_| LifecycleError::Closed)
    }

    /// Starts the queue and waits until it receives work.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.engine.start().await
    }

    /// Stops the queue. Pending work remains queued.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.engine.stop().await
    }

    /// Stops the queue and synchronously executes the pending work.
    pub async fn drain(&self) {
        self.engine.drain().await
    }

    /// Like [`Queue::drain`] but gives up once `context` is cancelled.
    pub async fn drain_context(&self, context: CancellationToken) {
        self.engine.drain_context(context).await
    }

    /// Drains the queue and closes its channel.
    pub async fn close(&self) {
        self.engine.close().await
    }
}

#[async_trait]
impl<T: Send + 'static> Graceful for Queue<T> {
    async fn start(&self) -> Result<(), LifecycleError> {
        Queue::start(self).await
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        Queue::stop(self).await
    }

    fn latch(&self) -> &Latch {
        Queue::latch(self)
    }
}
