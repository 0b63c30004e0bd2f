//! Ergonomic testing utilities for use cases
//!
//! This module provides a fluent API for testing use cases with readable Given-When-Then syntax.

#![allow(clippy::module_name_repetitions)] // UseCaseTest is the natural name

use statecraft_core::{Event, Groups, StatusTransition, TransitionKind};
use statecraft_runtime::{Container, ContainerState, DispatchOutcome, UseCaseRegistry};
use std::sync::Arc;
use std::time::Duration;

/// Type alias for state assertion functions
type StateAssertion<S> = Box<dyn FnOnce(&S)>;

/// Type alias for transition assertion functions
type TransitionAssertion<S> = Box<dyn FnOnce(&[StatusTransition<S>])>;

/// Type alias for outcome assertion functions
type OutcomeAssertion = Box<dyn FnOnce(&DispatchOutcome)>;

/// Fluent API for testing use cases with Given-When-Then syntax
///
/// The harness builds a container from the registry and the given state,
/// sends one event, waits for its use case to finish and then checks the
/// transitions it published, the final state and the dispatch outcome.
///
/// # Example
///
/// ```ignore
/// use statecraft_testing::UseCaseTest;
///
/// UseCaseTest::new(registry)
///     .given_state(Counter { count: 0 })
///     .when_event(Increment)
///     .then_kinds([TransitionKind::Updating])
///     .then_state(|state| {
///         assert_eq!(state.count, 1);
///     })
///     .run()
///     .await;
/// ```
pub struct UseCaseTest<S> {
    registry: UseCaseRegistry<S>,
    initial_state: Option<S>,
    event: Option<Arc<dyn Event>>,
    deadline: Option<Duration>,
    expected_kinds: Option<Vec<TransitionKind>>,
    state_assertions: Vec<StateAssertion<S>>,
    transition_assertions: Vec<TransitionAssertion<S>>,
    outcome_assertions: Vec<OutcomeAssertion>,
}

impl<S: ContainerState> UseCaseTest<S> {
    /// Create a new use case test over the given registry
    #[must_use]
    pub const fn new(registry: UseCaseRegistry<S>) -> Self {
        Self {
            registry,
            initial_state: None,
            event: None,
            deadline: None,
            expected_kinds: None,
            state_assertions: Vec::new(),
            transition_assertions: Vec::new(),
            outcome_assertions: Vec::new(),
        }
    }

    /// Set the initial state (Given)
    #[must_use]
    pub fn given_state(mut self, state: S) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Set the event to send (When)
    #[must_use]
    pub fn when_event<E: Event>(mut self, event: E) -> Self {
        self.event = Some(Arc::new(event));
        self
    }

    /// Send the event with a deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Expect exactly these transition kinds, in order (Then)
    #[must_use]
    pub fn then_kinds(mut self, kinds: impl IntoIterator<Item = TransitionKind>) -> Self {
        self.expected_kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Add an assertion about the final container state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&S) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the published transitions (Then)
    #[must_use]
    pub fn then_transitions<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[StatusTransition<S>]) + 'static,
    {
        self.transition_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about how the dispatch ended (Then)
    #[must_use]
    pub fn then_outcome<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&DispatchOutcome) + 'static,
    {
        self.outcome_assertions.push(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if the initial state or event is not set, if the event has no
    /// use case, or if any assertion fails.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub async fn run(self) {
        let initial_state = self
            .initial_state
            .expect("Initial state must be set with given_state()");
        let event = self.event.expect("Event must be set with when_event()");

        let container = Container::new(initial_state, self.registry);
        let mut subscription = container.subscribe(Groups::All);

        let dispatch = match self.deadline {
            Some(deadline) => container.send_arc_with_deadline(event, deadline),
            None => container.send_arc(event),
        }
        .unwrap_or_else(|e| panic!("Event was not dispatched: {e}"));
        let outcome = dispatch.wait().await;

        // Emits publish before the use case returns, so everything is buffered
        let mut transitions = Vec::new();
        while let Ok(Some(transition)) = subscription.try_recv() {
            transitions.push(transition);
        }

        if let Some(expected) = self.expected_kinds {
            let actual: Vec<TransitionKind> =
                transitions.iter().map(StatusTransition::kind).collect();
            assert_eq!(actual, expected, "Unexpected transition kinds");
        }

        for assertion in self.transition_assertions {
            assertion(&transitions);
        }

        let state = container.state();
        for assertion in self.state_assertions {
            assertion(&state);
        }

        for assertion in self.outcome_assertions {
            assertion(&outcome);
        }
    }
}
