//! The dispatch loop shared by [`Worker`](super::Worker),
//! [`Queue`](super::Queue) and [`ErrorWorker`](super::ErrorWorker).
//!
//! An [`Engine`] owns the receiving half of a work channel. While the engine
//! is stopped the receiver sits in the backlog slot; `start` moves it into the
//! spawned dispatch task, which hands it back right before signalling
//! `stopped`. This way `drain` can execute whatever is left in the channel
//! without racing the task.

use crate::concurrency::{
    ContextAction, ErrorSink, Finalizer, Latch, LifecycleError, Signal, recover,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// The receiving half of a work channel.
pub(crate) trait Backlog<T>: Send + 'static {
    fn recv(&mut self) -> impl Future<Output = Option<T>> + Send;

    fn try_recv(&mut self) -> Option<T>;

    fn len(&self) -> usize;
}

impl<T: Send + 'static> Backlog<T> for mpsc::UnboundedReceiver<T> {
    fn recv(&mut self) -> impl Future<Output = Option<T>> + Send {
        mpsc::UnboundedReceiver::recv(self)
    }

    fn try_recv(&mut self) -> Option<T> {
        mpsc::UnboundedReceiver::try_recv(self).ok()
    }

    fn len(&self) -> usize {
        mpsc::UnboundedReceiver::len(self)
    }
}

impl<T: Send + 'static> Backlog<T> for mpsc::Receiver<T> {
    fn recv(&mut self) -> impl Future<Output = Option<T>> + Send {
        mpsc::Receiver::recv(self)
    }

    fn try_recv(&mut self) -> Option<T> {
        mpsc::Receiver::try_recv(self).ok()
    }

    fn len(&self) -> usize {
        mpsc::Receiver::len(self)
    }
}

/// Runs a single work item: the action, then the finalizer.
///
/// Failures and panics of either end up in the error sink.
pub(crate) struct Executor<T> {
    pub(crate) action: ContextAction<T>,
    pub(crate) errors: ErrorSink,
    pub(crate) finalizer: Option<Finalizer>,
}

impl<T> Clone for Executor<T> {
    fn clone(&self) -> Self {
        Self {
            action: self.action.clone(),
            errors: self.errors.clone(),
            finalizer: self.finalizer.clone(),
        }
    }
}

impl<T: Send + 'static> Executor<T> {
    pub(crate) fn new(action: ContextAction<T>) -> Self {
        Self {
            action,
            errors: ErrorSink::Discard,
            finalizer: None,
        }
    }

    pub(crate) async fn execute(&self, context: CancellationToken, item: T) {
        let action = self.action.clone();
        let result = recover(async move { action(context, item).await }).await;
        self.errors.handle(result).await;

        if let Some(finalizer) = self.finalizer.clone() {
            let result = recover(async move { finalizer().await }).await;
            self.errors.handle(result).await;
        }
    }
}

pub(crate) struct Engine<T, R> {
    pub(crate) latch: Arc<Latch>,
    pub(crate) executor: Executor<T>,
    pub(crate) context: CancellationToken,
    backlog: Arc<Mutex<Option<R>>>,
    closed: Arc<AtomicBool>,
}

impl<T, R> Clone for Engine<T, R> {
    fn clone(&self) -> Self {
        Self {
            latch: self.latch.clone(),
            executor: self.executor.clone(),
            context: self.context.clone(),
            backlog: self.backlog.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T, R> Engine<T, R>
where
    T: Send + 'static,
    R: Backlog<T>,
{
    pub(crate) fn new(action: ContextAction<T>, receiver: R) -> Self {
        Self {
            latch: Arc::new(Latch::new()),
            executor: Executor::new(action),
            context: CancellationToken::new(),
            backlog: Arc::new(Mutex::new(Some(receiver))),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Swaps the receiver. Only meaningful before the first start.
    pub(crate) fn replace_backlog(&mut self, receiver: R) {
        self.backlog = Arc::new(Mutex::new(Some(receiver)));
    }

    fn take_backlog(&self) -> Option<R> {
        self.backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn restore_backlog(&self, receiver: R) {
        if self.is_closed() {
            return;
        }
        *self.backlog.lock().unwrap_or_else(PoisonError::into_inner) = Some(receiver);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of items waiting in the backlog. Zero while the dispatch task
    /// owns the receiver.
    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|receiver| receiver.len())
            .unwrap_or(0)
    }

    /// Spawns the dispatch task and waits until it accepts work.
    pub(crate) async fn start(&self) -> Result<(), LifecycleError> {
        if self.is_closed() {
            return Err(LifecycleError::Closed);
        }
        if !self.latch.can_start() {
            return Err(LifecycleError::CannotStart);
        }
        let Some(receiver) = self.take_backlog() else {
            return Err(LifecycleError::CannotStart);
        };

        let started = self.latch.notify_started();
        let stopping = self.latch.notify_stopping();
        if !self.latch.starting() {
            self.restore_backlog(receiver);
            return Err(LifecycleError::CannotStart);
        }

        tokio::spawn(self.clone().dispatch(receiver, stopping));
        started.wait().await;

        Ok(())
    }

    async fn dispatch(self, mut receiver: R, stopping: Signal) {
        self.latch.started();
        tracing::debug!("Dispatch loop started");

        loop {
            tokio::select! {
                biased;
                _ = stopping.wait() => break,
                _ = self.context.cancelled() => {
                    tracing::debug!("Context cancelled, leaving dispatch loop");
                    break;
                }
                item = receiver.recv() => match item {
                    Some(item) => self.executor.execute(self.context.clone(), item).await,
                    None => break,
                },
            }
        }

        self.restore_backlog(receiver);
        self.latch.stopping();
        self.latch.stopped();
        tracing::debug!("Dispatch loop stopped");
    }

    /// Stops the dispatch task. Queued work stays in the channel.
    pub(crate) async fn stop(&self) -> Result<(), LifecycleError> {
        if !self.latch.can_stop() {
            return Err(LifecycleError::CannotStop);
        }
        self.latch.wait_stopped().await;
        Ok(())
    }

    /// Stops the dispatch task and executes the items that were queued at
    /// that moment, giving up between items once `context` is cancelled.
    pub(crate) async fn drain_context(&self, context: CancellationToken) {
        self.latch.wait_stopped().await;
        let Some(mut receiver) = self.take_backlog() else {
            return;
        };

        let remaining = receiver.len();
        if remaining > 0 {
            tracing::debug!(remaining, "Draining remaining work");
        }
        for _ in 0..remaining {
            if context.is_cancelled() {
                tracing::debug!("Drain cancelled, leaving remaining work queued");
                break;
            }
            let Some(item) = receiver.try_recv() else {
                break;
            };
            self.executor.execute(context.clone(), item).await;
        }

        self.restore_backlog(receiver);
    }

    pub(crate) async fn drain(&self) {
        self.drain_context(self.context.clone()).await
    }

    /// Drains the engine and drops the receiver for good.
    pub(crate) async fn close(&self) {
        self.drain().await;
        self.closed.store(true, Ordering::Release);
        drop(self.take_backlog());
    }
}

/// Creates the ticker of a periodic loop. A zero period yields no ticker.
pub(crate) fn ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

/// Waits for the next tick, or forever if there is no ticker.
pub(crate) async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
