//! Action signatures, panic recovery and error routing.
//!
//! Every primitive accepts plain async closures. Internally they are boxed into
//! one of the type aliases below so that a primitive does not carry the closure
//! type in its own signature.

use crate::concurrency::ActionPanic;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The boxed future returned by every action.
pub type ActionFuture = BoxFuture<'static, anyhow::Result<()>>;

/// An action invoked per work item, receiving the primitive's context.
pub type ContextAction<T> = Arc<dyn Fn(CancellationToken, T) -> ActionFuture + Send + Sync>;

/// A finalizer invoked after every execution of a work item.
pub type Finalizer = Arc<dyn Fn() -> ActionFuture + Send + Sync>;

/// Boxes a context-free async closure into a [`ContextAction`].
pub fn action_fn<T, F, Fut>(action: F) -> ContextAction<T>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |_: CancellationToken, item: T| action(item).boxed())
}

/// Boxes a context-aware async closure into a [`ContextAction`].
pub fn context_action_fn<T, F, Fut>(action: F) -> ContextAction<T>
where
    T: Send + 'static,
    F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |context: CancellationToken, item: T| {
        action(context, item).boxed()
    })
}

/// Boxes an async closure into a [`Finalizer`].
pub fn finalizer_fn<F, Fut>(finalizer: F) -> Finalizer
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || finalizer().boxed())
}

/// Awaits the given future, converting a panic into an [`ActionPanic`] error.
///
/// The future is only created lazily by the caller's async block, so a panic
/// raised while *building* the future is caught as well.
pub async fn recover<F>(future: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(ActionPanic {
            message: panic_message(payload.as_ref()),
        }
        .into()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Destination for errors produced asynchronously by actions and handlers.
///
/// Work submission is fire-and-forget, so failures never reach the caller of
/// `enqueue` or `add`. Callers who care supply a channel or a fallback.
#[derive(Clone, Default)]
pub enum ErrorSink {
    /// Errors are logged at debug level and dropped.
    #[default]
    Discard,

    /// Errors are sent to the channel. A full channel applies backpressure
    /// to the primitive reporting the error.
    Channel(mpsc::Sender<anyhow::Error>),

    /// Errors are handed to the callback on the reporting task.
    Fallback(Arc<dyn Fn(anyhow::Error) + Send + Sync>),
}

impl ErrorSink {
    /// Creates a sink which invokes the given callback.
    pub fn fallback<F>(callback: F) -> Self
    where
        F: Fn(anyhow::Error) + Send + Sync + 'static,
    {
        ErrorSink::Fallback(Arc::new(callback))
    }

    /// Routes a failed result to this sink. Successful results are ignored.
    pub async fn handle(&self, result: anyhow::Result<()>) {
        if let Err(err) = result {
            self.report(err).await;
        }
    }

    /// Routes the given error to this sink.
    pub async fn report(&self, err: anyhow::Error) {
        match self {
            ErrorSink::Discard => {
                tracing::debug!("Discarding action error: {:#}", err);
            }
            ErrorSink::Channel(errors) => {
                if let Err(mpsc::error::SendError(err)) = errors.send(err).await {
                    tracing::warn!("Error channel is closed, dropping error: {:#}", err);
                }
            }
            ErrorSink::Fallback(callback) => callback(err),
        }
    }
}

impl From<mpsc::Sender<anyhow::Error>> for ErrorSink {
    fn from(errors: mpsc::Sender<anyhow::Error>) -> Self {
        ErrorSink::Channel(errors)
    }
}

impl Debug for ErrorSink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSink::Discard => write!(f, "ErrorSink::Discard"),
            ErrorSink::Channel(_) => write!(f, "ErrorSink::Channel"),
            ErrorSink::Fallback(_) => write!(f, "ErrorSink::Fallback"),
        }
    }
}
