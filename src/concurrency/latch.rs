//! Start/stop coordination for background tasks.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// The phase a [`Latch`] is in.
///
/// Phases only advance along the cycle
/// `Stopped -> Starting -> Started -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LatchState {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
}

impl LatchState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LatchState::Starting,
            2 => LatchState::Started,
            3 => LatchState::Stopping,
            _ => LatchState::Stopped,
        }
    }

    /// Returns the only phase which may precede this one.
    fn predecessor(self) -> Self {
        match self {
            LatchState::Stopped => LatchState::Stopping,
            LatchState::Starting => LatchState::Stopped,
            LatchState::Started => LatchState::Starting,
            LatchState::Stopping => LatchState::Started,
        }
    }
}

/// A one-shot broadcast for a single phase entry of a [`Latch`].
///
/// A signal fires at most once. The latch hands out a fresh signal after each
/// firing, so a signal must be captured *before* the transition it waits for
/// is triggered.
#[derive(Debug, Clone, Default)]
pub struct Signal {
    token: CancellationToken,
}

impl Signal {
    /// Waits until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Determines if the signal has fired.
    pub fn has_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    fn fire(&self) {
        self.token.cancel();
    }
}

#[derive(Default)]
struct Signals {
    starting: Signal,
    started: Signal,
    stopping: Signal,
    stopped: Signal,
}

impl Signals {
    fn get_mut(&mut self, state: LatchState) -> &mut Signal {
        match state {
            LatchState::Stopped => &mut self.stopped,
            LatchState::Starting => &mut self.starting,
            LatchState::Started => &mut self.started,
            LatchState::Stopping => &mut self.stopping,
        }
    }
}

/// Coordinates the lifecycle of a background task.
///
/// The owner of a task calls [`Latch::starting`] before spawning it and the task
/// calls [`Latch::started`] once it is ready to receive work. To shut down, the
/// owner calls [`Latch::stopping`] and the task answers with [`Latch::stopped`]
/// right before it exits. Each transition fires the matching `notify_*` signal
/// for everyone who captured it beforehand.
///
/// The state word is atomic so that the `is_*` / `can_*` queries never block.
/// Transitions are serialized by a mutex which also guards the signals.
pub struct Latch {
    state: AtomicU8,
    signals: Mutex<Signals>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("state", &self.state()).finish()
    }
}

impl Latch {
    /// Creates a new latch in the `Stopped` state.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LatchState::Stopped as u8),
            signals: Mutex::new(Signals::default()),
        }
    }

    fn signals(&self) -> MutexGuard<'_, Signals> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current state.
    pub fn state(&self) -> LatchState {
        LatchState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Determines if the latch can be started (it is stopped).
    pub fn can_start(&self) -> bool {
        self.state() == LatchState::Stopped
    }

    /// Determines if the latch can be stopped (it is started).
    pub fn can_stop(&self) -> bool {
        self.state() == LatchState::Started
    }

    pub fn is_starting(&self) -> bool {
        self.state() == LatchState::Starting
    }

    pub fn is_started(&self) -> bool {
        self.state() == LatchState::Started
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == LatchState::Stopping
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == LatchState::Stopped
    }

    /// Returns the signal fired on the next transition into `Starting`.
    pub fn notify_starting(&self) -> Signal {
        self.signals().starting.clone()
    }

    /// Returns the signal fired on the next transition into `Started`.
    pub fn notify_started(&self) -> Signal {
        self.signals().started.clone()
    }

    /// Returns the signal fired on the next transition into `Stopping`.
    pub fn notify_stopping(&self) -> Signal {
        self.signals().stopping.clone()
    }

    /// Returns the signal fired on the next transition into `Stopped`.
    pub fn notify_stopped(&self) -> Signal {
        self.signals().stopped.clone()
    }

    /// Enters `Starting`. Typically called right before spawning a task.
    pub fn starting(&self) -> bool {
        self.transition(LatchState::Starting)
    }

    /// Enters `Started`. Called by the task once it accepts work.
    pub fn started(&self) -> bool {
        self.transition(LatchState::Started)
    }

    /// Enters `Stopping`, asking the task to wind down.
    pub fn stopping(&self) -> bool {
        self.transition(LatchState::Stopping)
    }

    /// Enters `Stopped`. Called by the task right before it exits.
    pub fn stopped(&self) -> bool {
        self.transition(LatchState::Stopped)
    }

    /// Moves into `target` if the current state directly precedes it.
    ///
    /// Returns `false` without touching any signal when already in `target`
    /// or when the edge is not part of the lifecycle.
    fn transition(&self, target: LatchState) -> bool {
        let mut signals = self.signals();
        let current = self.state();
        if current == target {
            return false;
        }
        if current != target.predecessor() {
            tracing::debug!(?current, ?target, "Ignoring illegal latch transition");
            return false;
        }

        self.state.store(target as u8, Ordering::Release);
        let signal = signals.get_mut(target);
        signal.fire();
        *signal = Signal::default();

        true
    }

    /// Forces the latch back into `Stopped` with fresh, unfired signals.
    ///
    /// Nobody waiting on a signal captured before the reset is woken up.
    pub fn reset(&self) {
        let mut signals = self.signals();
        self.state.store(LatchState::Stopped as u8, Ordering::Release);
        *signals = Signals::default();
    }

    /// Enters `Starting` and waits until somebody calls [`Latch::started`].
    ///
    /// Also waits if somebody else already moved the latch into `Starting`.
    /// Returns immediately if the latch is neither stopped nor starting.
    pub async fn wait_started(&self) {
        // Captured before any transition so `started` cannot be missed.
        let started = self.notify_started();
        match self.state() {
            LatchState::Stopped => {
                self.starting();
            }
            LatchState::Starting => {}
            _ => return,
        }
        started.wait().await;
    }

    /// Enters `Stopping` and waits until somebody calls [`Latch::stopped`].
    ///
    /// Also waits if somebody else already moved the latch into `Stopping`.
    /// Returns immediately if the latch is neither started nor stopping.
    pub async fn wait_stopped(&self) {
        let stopped = self.notify_stopped();
        match self.state() {
            LatchState::Started => {
                self.stopping();
            }
            LatchState::Stopping => {}
            _ => return,
        }
        stopped.wait().await;
    }
}
