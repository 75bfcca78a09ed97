//! Error types shared by all concurrency primitives.

use thiserror::Error;

/// Misuse of a primitive's lifecycle.
///
/// Returned synchronously by `start`, `stop` and `enqueue`. These never
/// describe a failing work item; those are routed to an
/// [`ErrorSink`](super::ErrorSink) instead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    /// The primitive is not stopped, so it cannot be started.
    #[error("cannot start; already started")]
    CannotStart,

    /// The primitive is not started, so it cannot be stopped.
    #[error("cannot stop; already stopped")]
    CannotStop,

    /// The primitive was closed and no longer accepts work.
    #[error("cannot enqueue; closed")]
    Closed,
}

/// A panic raised by a user supplied action, converted into an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("action panicked: {message}")]
pub struct ActionPanic {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_messages() {
        assert_eq!(
            LifecycleError::CannotStart.to_string(),
            "cannot start; already started"
        );
        assert_eq!(
            LifecycleError::CannotStop.to_string(),
            "cannot stop; already stopped"
        );
        assert_eq!(LifecycleError::Closed.to_string(), "cannot enqueue; closed");
    }

    #[test]
    fn panic_message_is_embedded() {
        let err = ActionPanic {
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "action panicked: boom");
    }
}
