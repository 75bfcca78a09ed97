//! An action which runs on a fixed interval or on demand.

use crate::concurrency::dispatch::{tick, ticker};
use crate::concurrency::{
    ContextAction, ErrorSink, Latch, LifecycleError, Signal, action_fn, context_action_fn,
    recover,
};
use crate::graceful::Graceful;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Invokes a handler with the most recent value, either every `interval`,
/// after every `max_count` increments or whenever a caller asks for it.
///
/// The value slot is last-write-wins: [`AutoAction::set_value`] replaces it
/// and the next trigger hands a copy to the handler. [`AutoAction::trigger`]
/// keeps the slot locked while the handler runs, so a concurrent `set_value`
/// waits for it.
///
/// # Example
/// ```rust,no_run
/// # async fn run() -> anyhow::Result<()> {
/// use sansho::concurrency::AutoAction;
/// use std::time::Duration;
///
/// let progress = AutoAction::new(Duration::from_secs(5), 0u64, |done| async move {
///     tracing::info!("Processed {} records", done);
///     Ok(())
/// });
///
/// progress.start().await?;
/// progress.set_value(42).await;
/// progress.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct AutoAction<V> {
    value: Arc<Mutex<V>>,
    interval: Duration,
    handler: ContextAction<V>,
    trigger_on_stop: bool,
    max_count: usize,
    counter: Arc<AtomicUsize>,
    errors: ErrorSink,
    context: CancellationToken,
    latch: Arc<Latch>,
}

impl<V> Clone for AutoAction<V> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            interval: self.interval,
            handler: self.handler.clone(),
            trigger_on_stop: self.trigger_on_stop,
            max_count: self.max_count,
            counter: self.counter.clone(),
            errors: self.errors.clone(),
            context: self.context.clone(),
            latch: self.latch.clone(),
        }
    }
}

impl<V> AutoAction<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(interval: Duration, value: V, handler: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_handler(interval, value, action_fn(handler))
    }

    /// Creates an action whose handler also receives the action's context.
    pub fn new_with_context<F, Fut>(interval: Duration, value: V, handler: F) -> Self
    where
        F: Fn(CancellationToken, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_handler(interval, value, context_action_fn(handler))
    }

    /// Creates an action from an already boxed handler. A zero interval
    /// disables the ticker.
    pub fn from_handler(interval: Duration, value: V, handler: ContextAction<V>) -> Self {
        Self {
            value: Arc::new(Mutex::new(value)),
            interval,
            handler,
            trigger_on_stop: true,
            max_count: 0,
            counter: Arc::new(AtomicUsize::new(0)),
            errors: ErrorSink::Discard,
            context: CancellationToken::new(),
            latch: Arc::new(Latch::new()),
        }
    }

    /// Determines if `stop` runs the handler one last time.
    pub fn with_trigger_on_stop(mut self, trigger_on_stop: bool) -> Self {
        self.trigger_on_stop = trigger_on_stop;
        self
    }

    /// Triggers the handler on every `max_count`-th call of
    /// [`AutoAction::increment`]. Zero disables counting.
    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }

    /// Routes handler errors and panics to the given sink.
    pub fn with_errors(mut self, errors: impl Into<ErrorSink>) -> Self {
        self.errors = errors.into();
        self
    }

    /// Sets the context handed to the handler. Cancelling it stops the action.
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

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Replaces the value handed to the handler.
    pub async fn set_value(&self, value: V) {
        *self.value.lock().await = value;
    }

    pub async fn value(&self) -> V {
        self.value.lock().await.clone()
    }

    /// Number of increments since the last count-based trigger.
    pub fn count(&self) -> usize {
        self.counter.load(Ordering::Acquire)
    }

    /// Runs the handler and waits for it, keeping the value locked meanwhile.
    pub async fn trigger(&self) {
        let value = self.value.lock().await;
        self.execute(value.clone()).await;
    }

    /// Runs the handler with a snapshot of the value on a separate task.
    pub async fn trigger_async(&self) {
        let value = self.value.lock().await.clone();
        let action = self.clone();
        tokio::spawn(async move { action.execute(value).await });
    }

    /// Counts an event, triggering the handler synchronously once
    /// `max_count` events have been counted.
    pub async fn increment(&self) {
        if self.max_count == 0 {
            return;
        }

        let max_count = self.max_count;
        let previous = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(if count + 1 >= max_count { 0 } else { count + 1 })
            })
            .unwrap_or_default();

        if previous + 1 >= max_count {
            self.trigger().await;
        }
    }

    async fn execute(&self, value: V) {
        let handler = self.handler.clone();
        let context = self.context.clone();
        let result = recover(async move { handler(context, value).await }).await;
        self.errors.handle(result).await;
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
        tracing::debug!(interval = ?self.interval, "Auto action started");

        let mut ticker = ticker(self.interval);
        loop {
            tokio::select! {
                biased;
                _ = stopping.wait() => break,
                _ = self.context.cancelled() => {
                    tracing::debug!("Context cancelled, stopping auto action");
                    break;
                }
                _ = tick(&mut ticker) => self.trigger_async().await,
            }
        }

        self.latch.stopping();
        if self.trigger_on_stop {
            self.trigger().await;
        }
        self.latch.stopped();
        tracing::debug!("Auto action stopped");
    }

    pub async fn stop(&self) -> Result<(), LifecycleError> {
        if !self.latch.can_stop() {
            return Err(LifecycleError::CannotStop);
        }
        self.latch.wait_stopped().await;
        Ok(())
    }
}

#[async_trait]
impl<V> Graceful for AutoAction<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn start(&self) -> Result<(), LifecycleError> {
        AutoAction::start(self).await
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        AutoAction::stop(self).await
    }

    fn latch(&self) -> &Latch {
        AutoAction::latch(self)
    }
}
