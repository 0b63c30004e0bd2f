//! Cancellable events.
//!
//! Every event a container dispatches is wrapped in a [`CancellableEvent`]:
//! the event plus a shared controller that tracks whether the work has been
//! cancelled, by whom, and when its deadline expires.
//!
//! Cancellation is cooperative. Nothing is interrupted; use cases observe
//! the flag at their own checkpoints via [`CancellableEvent::check`] or race
//! their work against [`CancellableEvent::cancelled`].
//!
//! # State machine
//!
//! ```text
//!            cancel()             deadline
//! Running ───────────► CancelledByCaller
//!    │ └──────────────────────────────────► CancelledByTimeout
//!    └── handler returns ─► Completed
//! ```
//!
//! Exactly one transition out of `Running` wins; terminal states are final.

use crate::error::CancelError;
use crate::lock;
use statecraft_core::Event;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const RUNNING: u8 = 0;
const CANCELLED_BY_CALLER: u8 = 1;
const CANCELLED_BY_TIMEOUT: u8 = 2;
const COMPLETED: u8 = 3;

/// Lifecycle of a dispatched event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelState {
    /// The use case is running
    Running,
    /// The caller requested cancellation
    CancelledByCaller,
    /// The deadline passed before the use case finished
    CancelledByTimeout,
    /// The use case finished
    Completed,
}

impl CancelState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            CANCELLED_BY_CALLER => Self::CancelledByCaller,
            CANCELLED_BY_TIMEOUT => Self::CancelledByTimeout,
            COMPLETED => Self::Completed,
            _ => Self::Running,
        }
    }

    /// Whether the state is final
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether the event was cancelled, by the caller or by its deadline
    #[must_use]
    pub const fn is_cancelled(self) -> bool {
        matches!(self, Self::CancelledByCaller | Self::CancelledByTimeout)
    }
}

struct Controller {
    state: AtomicU8,
    started_at: Instant,
    deadline: Option<Duration>,
    notify: watch::Sender<CancelState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Move out of `Running`. Returns `false` if another transition won.
    fn transition(&self, target: u8) -> bool {
        let won = self
            .state
            .compare_exchange(RUNNING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if won {
            self.notify.send_replace(CancelState::from_u8(target));
            if let Some(timer) = lock(&self.timer).take() {
                timer.abort();
            }
        }
        won
    }

    fn deadline_at(&self) -> Option<Instant> {
        self.deadline.map(|deadline| self.started_at + deadline)
    }

    fn current(&self) -> CancelState {
        let state = CancelState::from_u8(self.state.load(Ordering::Acquire));
        if state == CancelState::Running
            && self.deadline_at().is_some_and(|at| Instant::now() >= at)
        {
            self.transition(CANCELLED_BY_TIMEOUT);
            return CancelState::from_u8(self.state.load(Ordering::Acquire));
        }
        state
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }
}

/// An event paired with its cancellation controller.
///
/// Clones share the controller: cancelling through any clone is observed
/// by all of them.
#[derive(Clone)]
pub struct CancellableEvent {
    controller: Arc<Controller>,
    event: Arc<dyn Event>,
}

impl CancellableEvent {
    /// Wrap `event`, starting its clock now.
    ///
    /// With a deadline and a running Tokio runtime, a timer task fires the
    /// timeout transition. Without a runtime the deadline is still enforced
    /// lazily whenever the state is read.
    #[must_use]
    pub fn new(event: Arc<dyn Event>, deadline: Option<Duration>) -> Self {
        let (notify, _) = watch::channel(CancelState::Running);
        let controller = Arc::new(Controller {
            state: AtomicU8::new(RUNNING),
            started_at: Instant::now(),
            deadline,
            notify,
            timer: Mutex::new(None),
        });

        if let (Some(at), Ok(runtime)) = (
            controller.deadline_at(),
            tokio::runtime::Handle::try_current(),
        ) {
            let weak: Weak<Controller> = Arc::downgrade(&controller);
            let timer = runtime.spawn(async move {
                tokio::time::sleep_until(at).await;
                let expired = weak
                    .upgrade()
                    .is_some_and(|controller| controller.transition(CANCELLED_BY_TIMEOUT));
                if expired {
                    tracing::debug!("Event deadline expired");
                }
            });
            *lock(&controller.timer) = Some(timer);
        }

        Self { controller, event }
    }

    /// The wrapped event
    #[must_use]
    pub fn event(&self) -> &Arc<dyn Event> {
        &self.event
    }

    /// Current state.
    ///
    /// A passed deadline is applied here even if the timer has not fired yet.
    #[must_use]
    pub fn state(&self) -> CancelState {
        self.controller.current()
    }

    /// Whether the event has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    /// Request cancellation.
    ///
    /// Returns `true` if this call moved the event out of `Running`; `false`
    /// if it had already completed or been cancelled.
    pub fn cancel(&self) -> bool {
        self.controller.transition(CANCELLED_BY_CALLER)
    }

    /// Mark the event completed. Has no effect if it was already cancelled.
    pub(crate) fn complete(&self) -> bool {
        self.controller.transition(COMPLETED)
    }

    /// Time since the event was dispatched
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.controller.started_at.elapsed()
    }

    /// The configured deadline, measured from dispatch
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.controller.deadline
    }

    /// Time left before the deadline (zero once passed), or `None` without one
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.controller
            .deadline_at()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Cancellation checkpoint for use cases.
    ///
    /// # Errors
    ///
    /// Returns [`CancelError::Cancelled`] or [`CancelError::TimedOut`] once
    /// the event has been cancelled.
    pub fn check(&self) -> Result<(), CancelError> {
        match self.state() {
            CancelState::CancelledByCaller => Err(CancelError::Cancelled),
            CancelState::CancelledByTimeout => Err(CancelError::TimedOut {
                elapsed: self.elapsed(),
            }),
            CancelState::Running | CancelState::Completed => Ok(()),
        }
    }

    /// Resolve once the event is cancelled, returning the cancelled state.
    ///
    /// Never resolves if the event completes first, which makes it suitable
    /// for racing against work in `tokio::select!`.
    pub async fn cancelled(&self) -> CancelState {
        let mut changes = self.controller.notify.subscribe();
        let deadline = self.controller.deadline_at();

        let sleep = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        let state = tokio::select! {
            changed = changes.wait_for(|state| state.is_terminal()) => match changed {
                Ok(state) => *state,
                Err(_) => self.state(),
            },
            () = sleep => self.state(),
        };

        if state.is_cancelled() {
            state
        } else {
            std::future::pending().await
        }
    }
}

impl std::fmt::Debug for CancellableEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableEvent")
            .field("event", &self.event.event_name())
            .field("state", &self.state())
            .field("deadline", &self.controller.deadline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Search;

    impl Event for Search {}

    fn event(deadline: Option<Duration>) -> CancellableEvent {
        CancellableEvent::new(Arc::new(Search), deadline)
    }

    #[test]
    fn test_cancel_once() {
        let event = event(None);
        assert_eq!(event.state(), CancelState::Running);
        assert!(event.check().is_ok());

        assert!(event.cancel());
        assert!(!event.cancel());
        assert_eq!(event.state(), CancelState::CancelledByCaller);
        assert_eq!(event.check(), Err(CancelError::Cancelled));
    }

    #[test]
    fn test_cancelled_wakes_waiter() {
        let event = event(None);
        let mut waiter = tokio_test::task::spawn(event.cancelled());
        tokio_test::assert_pending!(waiter.poll());

        event.cancel();
        assert!(waiter.is_woken());
        tokio_test::assert_ready_eq!(waiter.poll(), CancelState::CancelledByCaller);
    }

    #[test]
    fn test_complete_is_final() {
        let event = event(None);
        assert!(event.complete());
        assert!(!event.cancel());
        assert_eq!(event.state(), CancelState::Completed);
        assert!(event.check().is_ok());
    }

    #[test]
    fn test_cancel_after_cancel_does_not_complete() {
        let event = event(None);
        event.cancel();
        assert!(!event.complete());
        assert_eq!(event.state(), CancelState::CancelledByCaller);
    }

    #[test]
    fn test_deadline_applied_lazily_without_runtime() {
        let event = event(Some(Duration::ZERO));
        assert_eq!(event.state(), CancelState::CancelledByTimeout);
        assert!(matches!(event.check(), Err(CancelError::TimedOut { .. })));
        assert_eq!(event.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_clones_share_controller() {
        let event = event(None);
        let clone = event.clone();
        clone.cancel();
        assert!(event.is_cancelled());
    }

    #[tokio::test]
    async fn test_timer_fires_timeout() {
        let event = event(Some(Duration::from_millis(20)));
        let state = tokio::time::timeout(Duration::from_secs(2), event.cancelled()).await;
        assert_eq!(state, Ok(CancelState::CancelledByTimeout));
        assert!(event.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_on_caller_cancel() {
        let event = event(None);
        let waiter = {
            let event = event.clone();
            tokio::spawn(async move { event.cancelled().await })
        };

        tokio::task::yield_now().await;
        event.cancel();

        let state = tokio::time::timeout(Duration::from_secs(2), waiter).await;
        assert!(matches!(state, Ok(Ok(CancelState::CancelledByCaller))));
    }

    #[tokio::test]
    async fn test_cancelled_pends_after_completion() {
        let event = event(Some(Duration::from_millis(10)));
        event.complete();

        let result = tokio::time::timeout(Duration::from_millis(50), event.cancelled()).await;
        assert!(result.is_err());
        assert_eq!(event.state(), CancelState::Completed);
    }
}
