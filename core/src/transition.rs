//! Status transitions.
//!
//! A container publishes one [`StatusTransition`] per emit call made by a use
//! case. Transitions for one container carry a strictly increasing
//! `sequence`, so any two subscribers can be checked for identical ordering.

use crate::event::{Event, NavigationIntent};
use crate::groups::Groups;
use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;

/// Kind of a transition, without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    /// New state accepted
    Updating,
    /// Operation in progress
    Waiting,
    /// Operation failed
    Failure,
    /// Operation was cancelled
    Canceling,
}

impl TransitionKind {
    /// Lowercase label, used in logs and metric labels
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Updating => "updating",
            Self::Waiting => "waiting",
            Self::Failure => "failure",
            Self::Canceling => "canceling",
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status carried by a transition
#[derive(Debug, Clone)]
pub enum Status {
    /// New state accepted
    Updating,
    /// Operation in progress; state may be unchanged or partially updated
    Waiting,
    /// Operation failed
    Failure(Failure),
    /// Operation was cancelled
    Canceling,
}

impl Status {
    /// The payload-free kind
    #[must_use]
    pub const fn kind(&self) -> TransitionKind {
        match self {
            Self::Updating => TransitionKind::Updating,
            Self::Waiting => TransitionKind::Waiting,
            Self::Failure(_) => TransitionKind::Failure,
            Self::Canceling => TransitionKind::Canceling,
        }
    }
}

/// Error payload of a [`Status::Failure`] transition.
///
/// The error is shared, so every subscriber sees the same error value.
#[derive(Debug, Clone)]
pub struct Failure {
    /// The error raised by the use case
    pub error: Arc<anyhow::Error>,
    /// Where the failure originated
    pub trace: Trace,
}

impl Failure {
    /// Build a failure for an error raised while handling `event`
    #[must_use]
    pub fn new(error: anyhow::Error, event: &'static str) -> Self {
        Self {
            error: Arc::new(error),
            trace: Trace::capture(event),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (while handling {})", self.error, self.trace.event)
    }
}

/// Origin of a failure: the event being handled and a captured backtrace.
///
/// The backtrace follows `RUST_BACKTRACE`/`RUST_LIB_BACKTRACE`; when capture
/// is disabled it is cheap and renders as "disabled backtrace".
#[derive(Debug, Clone)]
pub struct Trace {
    /// Name of the originating event
    pub event: &'static str,
    /// Backtrace at the point the failure was recorded
    pub backtrace: Arc<Backtrace>,
}

impl Trace {
    /// Capture a trace for `event`
    #[must_use]
    pub fn capture(event: &'static str) -> Self {
        Self {
            event,
            backtrace: Arc::new(Backtrace::capture()),
        }
    }
}

/// One published status change of a container.
pub struct StatusTransition<S> {
    /// Position in the container's transition sequence, starting at 1
    pub sequence: u64,
    /// What happened
    pub status: Status,
    /// The container state after this transition, if the transition carries one
    pub state: Option<Arc<S>>,
    /// The event whose handling produced this transition
    pub event: Arc<dyn Event>,
    /// Groups affected by this transition
    pub groups: Groups,
    /// Navigation side channel
    pub intent: Option<NavigationIntent>,
}

impl<S> StatusTransition<S> {
    /// The payload-free kind
    #[must_use]
    pub const fn kind(&self) -> TransitionKind {
        self.status.kind()
    }

    /// The failure payload, if this is a failure
    #[must_use]
    pub const fn failure(&self) -> Option<&Failure> {
        match &self.status {
            Status::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    /// Borrow the carried state
    #[must_use]
    pub fn state(&self) -> Option<&S> {
        self.state.as_deref()
    }

    /// Whether this transition was produced by an event of type `E`
    #[must_use]
    pub fn caused_by<E: Event>(&self) -> bool {
        self.event.is::<E>()
    }
}

impl<S> Clone for StatusTransition<S> {
    fn clone(&self) -> Self {
        Self {
            sequence: self.sequence,
            status: self.status.clone(),
            state: self.state.clone(),
            event: Arc::clone(&self.event),
            groups: self.groups.clone(),
            intent: self.intent.clone(),
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for StatusTransition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTransition")
            .field("sequence", &self.sequence)
            .field("status", &self.status.kind())
            .field("state", &self.state)
            .field("event", &self.event.event_name())
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Load;

    impl Event for Load {}

    #[test]
    fn test_failure_transition_accessors() {
        let transition: StatusTransition<u32> = StatusTransition {
            sequence: 1,
            status: Status::Failure(Failure::new(anyhow::anyhow!("boom"), "Load")),
            state: None,
            event: Arc::new(Load),
            groups: Groups::All,
            intent: None,
        };

        assert_eq!(transition.kind(), TransitionKind::Failure);
        assert!(transition.caused_by::<Load>());
        let failure = transition.failure().map(ToString::to_string);
        assert_eq!(failure.as_deref(), Some("boom (while handling Load)"));

        let cloned = transition.clone();
        let (Some(a), Some(b)) = (transition.failure(), cloned.failure()) else {
            unreachable!("both are failures");
        };
        assert!(Arc::ptr_eq(&a.error, &b.error));
    }
}
