//! A buffer which hands its contents to a handler in batches.

use crate::concurrency::dispatch::{tick, ticker};
use crate::concurrency::{
    ContextAction, ErrorSink, Latch, LifecycleError, Signal, action_fn, context_action_fn,
    recover,
};
use crate::config::{
    AutoflushSettings, INTERVAL, PARALLELISM, QUEUE_MAX_WORK, SHUTDOWN_GRACE_PERIOD,
};
use crate::graceful::Graceful;
use crate::tools::watch::Watch;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Collects items and flushes them to a handler once `max_len` items are
/// buffered or the interval elapses, whichever comes first.
///
/// Producers never wait for the handler: a flush caused by [`add`](Self::add)
/// or by the ticker runs on its own task. The handler always receives a
/// snapshot of the buffer which is no longer touched by producers, and it is
/// never invoked with an empty batch.
///
/// At most `parallelism` handlers run at the same time and at most
/// `max_flushes` further flushes wait for a free slot. Once that queue is full
/// a batch stays in the buffer and goes out with a later flush.
///
/// # Example
/// ```rust,no_run
/// # async fn run() -> anyhow::Result<()> {
/// use sansho::concurrency::AutoflushBuffer;
/// use std::time::Duration;
///
/// let events = AutoflushBuffer::new(|batch: Vec<String>| async move {
///     tracing::info!("Uploading {} events", batch.len());
///     Ok(())
/// })
/// .with_max_len(64)
/// .with_interval(Duration::from_secs(15));
///
/// events.start().await?;
/// events.add("user-created".to_string());
/// events.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct AutoflushBuffer<T> {
    contents: Arc<Mutex<VecDeque<T>>>,
    max_len: usize,
    interval: Duration,
    flush_on_stop: bool,
    shutdown_grace_period: Duration,
    handler: ContextAction<Vec<T>>,
    errors: ErrorSink,
    context: CancellationToken,
    flushes: TaskTracker,
    parallelism: usize,
    max_flushes: usize,
    running: Arc<Semaphore>,
    queued: Arc<Semaphore>,
    latch: Arc<Latch>,
}

impl<T> Clone for AutoflushBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            contents: self.contents.clone(),
            max_len: self.max_len,
            interval: self.interval,
            flush_on_stop: self.flush_on_stop,
            shutdown_grace_period: self.shutdown_grace_period,
            handler: self.handler.clone(),
            errors: self.errors.clone(),
            context: self.context.clone(),
            flushes: self.flushes.clone(),
            parallelism: self.parallelism,
            max_flushes: self.max_flushes,
            running: self.running.clone(),
            queued: self.queued.clone(),
            latch: self.latch.clone(),
        }
    }
}

impl<T: Send + 'static> AutoflushBuffer<T> {
    /// Creates a buffer with the default settings.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_handler(action_fn(handler))
    }

    /// Creates a buffer whose handler also receives the buffer's context.
    pub fn new_with_context<F, Fut>(handler: F) -> Self
    where
        F: Fn(CancellationToken, Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_handler(context_action_fn(handler))
    }

    pub fn from_handler(handler: ContextAction<Vec<T>>) -> Self {
        Self {
            contents: Arc::new(Mutex::new(VecDeque::new())),
            max_len: *QUEUE_MAX_WORK,
            interval: *INTERVAL,
            flush_on_stop: true,
            shutdown_grace_period: *SHUTDOWN_GRACE_PERIOD,
            handler,
            errors: ErrorSink::Discard,
            context: CancellationToken::new(),
            flushes: TaskTracker::new(),
            parallelism: *PARALLELISM,
            max_flushes: *QUEUE_MAX_WORK,
            running: Arc::new(Semaphore::new(*PARALLELISM)),
            queued: Arc::new(Semaphore::new(*PARALLELISM + *QUEUE_MAX_WORK)),
            latch: Arc::new(Latch::new()),
        }
    }

    /// Creates a buffer configured by the given settings.
    pub fn from_settings<F, Fut>(settings: &AutoflushSettings, handler: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(handler)
            .with_max_len(settings.max_len)
            .with_interval(settings.interval())
            .with_flush_on_stop(settings.flush_on_stop)
            .with_shutdown_grace_period(settings.shutdown_grace_period())
            .with_parallelism(settings.parallelism)
            .with_max_flushes(settings.max_flushes)
    }

    /// Sets the number of items which triggers a flush. Zero is raised to one.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    /// Sets the flush interval. A zero interval disables the ticker.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Determines if [`stop`](Self::stop) flushes the remaining items or
    /// discards them.
    pub fn with_flush_on_stop(mut self, flush_on_stop: bool) -> Self {
        self.flush_on_stop = flush_on_stop;
        self
    }

    /// Sets how long `stop` waits for asynchronous flushes still in flight.
    pub fn with_shutdown_grace_period(mut self, grace_period: Duration) -> Self {
        self.shutdown_grace_period = grace_period;
        self
    }

    /// Sets how many handlers may run at once. Zero falls back to the default
    /// parallelism.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = if parallelism == 0 {
            *PARALLELISM
        } else {
            parallelism
        };
        self.running = Arc::new(Semaphore::new(self.parallelism));
        self.queued = Arc::new(Semaphore::new(self.parallelism + self.max_flushes));
        self
    }

    /// Sets how many asynchronous flushes may wait for a free handler slot.
    pub fn with_max_flushes(mut self, max_flushes: usize) -> Self {
        self.max_flushes = max_flushes;
        self.queued = Arc::new(Semaphore::new(self.parallelism + self.max_flushes));
        self
    }

    /// Routes handler errors and panics to the given sink.
    pub fn with_errors(mut self, errors: impl Into<ErrorSink>) -> Self {
        self.errors = errors.into();
        self
    }

    /// Sets the context handed to the handler. Cancelling it stops the buffer.
    pub fn with_context(mut self, context: CancellationToken) -> Self {
        self.context = context;
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

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn max_flushes(&self) -> usize {
        self.max_flushes
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Buffers an item. Reaching `max_len` flushes on a separate task.
    ///
    /// Must be called within a tokio runtime.
    pub fn add(&self, item: T) {
        let batch = {
            let mut contents = self.lock();
            contents.push_back(item);
            if contents.len() >= self.max_len {
                Some(take(&mut contents))
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            self.spawn_flush(batch);
        }
    }

    /// Buffers all given items, flushing each time `max_len` is reached.
    pub fn add_many<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut batches = Vec::new();
        {
            let mut contents = self.lock();
            for item in items {
                contents.push_back(item);
                if contents.len() >= self.max_len {
                    batches.push(take(&mut contents));
                }
            }
        }

        for batch in batches {
            self.spawn_flush(batch);
        }
    }

    /// Flushes the buffered items and waits for the handler.
    pub async fn flush(&self) {
        let batch = take(&mut self.lock());
        self.execute(batch).await;
    }

    /// Flushes the buffered items on a separate task.
    pub fn flush_async(&self) {
        let batch = take(&mut self.lock());
        self.spawn_flush(batch);
    }

    fn spawn_flush(&self, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }
        let Ok(permit) = self.queued.clone().try_acquire_owned() else {
            tracing::warn!(items = batch.len(), "Flush queue is full, keeping items buffered");
            let mut contents = self.lock();
            for item in batch.into_iter().rev() {
                contents.push_front(item);
            }
            return;
        };
        self.spawn_execute(batch, Some(permit));
    }

    fn spawn_execute(&self, batch: Vec<T>, permit: Option<OwnedSemaphorePermit>) {
        let buffer = self.clone();
        self.flushes.spawn(async move {
            let _permit = permit;
            buffer.execute(batch).await
        });
    }

    async fn execute(&self, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }
        // The semaphore is never closed.
        let _slot = self.running.acquire().await.ok();

        let watch = Watch::start();
        let items = batch.len();
        let handler = self.handler.clone();
        let context = self.context.clone();
        let result = recover(async move { handler(context, batch).await }).await;
        tracing::debug!(
            items,
            elapsed_us = watch.elapsed_us(),
            success = result.is_ok(),
            "Flushed buffer"
        );

        self.errors.handle(result).await;
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.contents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the ticker and waits until it runs.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        if !self.latch.can_start() {
            return Err(LifecycleError::CannotStart);
        }

        let started = self.latch.notify_started();
        let stopping = self.latch.notify_stopping();
        if !self.latch.starting() {
            return Err(LifecycleError::CannotStart);
        }

        tokio::spawn(self.clone().dispatch(stopping));
        started.wait().await;

        Ok(())
    }

    async fn dispatch(self, stopping: Signal) {
        self.latch.started();
        tracing::debug!(max_len = self.max_len, interval = ?self.interval, "Autoflush started");

        let mut ticker = ticker(self.interval);

        loop {
            tokio::select! {
                biased;
                _ = stopping.wait() => break,
                _ = self.context.cancelled() => {
                    tracing::debug!("Context cancelled, stopping autoflush");
                    break;
                }
                _ = tick(&mut ticker) => self.flush_async(),
            }
        }

        self.latch.stopping();
        if self.flush_on_stop {
            // Bypasses the flush queue limit, the grace period bounds it.
            let batch = take(&mut self.lock());
            if !batch.is_empty() {
                self.spawn_execute(batch, None);
            }
        } else {
            let discarded = take(&mut self.lock()).len();
            if discarded > 0 {
                tracing::debug!(discarded, "Discarding buffered items on stop");
            }
        }

        self.flushes.close();
        if tokio::time::timeout(self.shutdown_grace_period, self.flushes.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                pending = self.flushes.len(),
                "Flushes still running after the shutdown grace period"
            );
        }
        self.flushes.reopen();

        self.latch.stopped();
        tracing::debug!("Autoflush stopped");
    }

    /// Stops the ticker, flushing (or discarding) the remaining items.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        if !self.latch.can_stop() {
            return Err(LifecycleError::CannotStop);
        }
        self.latch.wait_stopped().await;
        Ok(())
    }
}

fn take<T>(contents: &mut VecDeque<T>) -> Vec<T> {
    std::mem::take(contents).into()
}

#[async_trait]
impl<T: Send + 'static> Graceful for AutoflushBuffer<T> {
    async fn start(&self) -> Result<(), LifecycleError> {
        AutoflushBuffer::start(self).await
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        AutoflushBuffer::stop(self).await
    }

    fn latch(&self) -> &Latch {
        AutoflushBuffer::latch(self)
    }
}
