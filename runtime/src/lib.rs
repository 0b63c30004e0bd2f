//! # Statecraft Runtime
//!
//! Runtime implementation for the Statecraft reactive state architecture.
//!
//! This crate provides the [`Container`] runtime that owns a state value,
//! dispatches events to use cases, and publishes ordered status transitions,
//! together with the concurrency primitives use cases lean on.
//!
//! ## Core Components
//!
//! - **Container**: Owns state, resolves use cases, serializes publication
//! - **Status Channel**: Ordered, group-filtered broadcast of transitions
//! - **Use-Case Registry**: Event type → use-case factory (stateless or stateful)
//! - **Cancellable Event**: Cooperative cancellation flag with a deadline
//! - **Request Coalescer**: One execution per in-flight request key
//! - **Scope Manager**: Monotonic scope ids and barrier-based teardown
//! - **Event Relay**: Wires one container's transitions into another's events
//!
//! ## Example
//!
//! ```ignore
//! use statecraft_runtime::{Container, UseCaseRegistry};
//!
//! let registry = UseCaseRegistry::builder()
//!     .stateless(|| IncrementUseCase)
//!     .build();
//!
//! let counter = Container::new(Counter::default(), registry);
//! let mut updates = counter.subscribe(Groups::All);
//!
//! counter.send(Increment)?.wait().await;
//! let transition = updates.recv().await?;
//! assert_eq!(transition.state().map(|s| s.count), Some(1));
//! ```

/// Status channel: ordered, group-filtered broadcast of transitions
pub mod channel;

/// Cooperative cancellation and deadlines for dispatched events
pub mod cancellation;

/// Generic claim-or-join map for deduplicating in-flight work
pub mod claim;

/// Request coalescing for identical external operations
pub mod coalescer;

/// Runtime configuration
pub mod config;

/// Containers: state ownership and event dispatch
pub mod container;

/// Prometheus metrics for observability
pub mod metrics;

/// Use-case trait and registry
pub mod registry;

/// Relays between containers
pub mod relay;

/// Scope lifecycle management
pub mod scope;

/// Error types for the runtime
pub mod error {
    use crate::scope::ScopeId;
    use std::sync::Arc;
    use std::time::Duration;
    use thiserror::Error;

    /// Errors returned synchronously from [`Container::send`](crate::Container::send)
    /// and [`Container::close`](crate::Container::close).
    ///
    /// Failures inside a use case are never reported here; they become
    /// `Failure` transitions on the status channel.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum DispatchError {
        /// No use case is registered for the event's type
        ///
        /// Fatal to this `send` call only. Nothing is published.
        #[error("No use case registered for event `{event}`")]
        NoHandler {
            /// Name of the unhandled event
            event: &'static str,
        },

        /// Container is closed and not accepting new events
        #[error("Container is closed")]
        Closed,

        /// Close timed out waiting for in-flight use cases
        #[error("Close timed out with {0} use cases still running")]
        CloseTimeout(usize),
    }

    /// Errors raised at the container boundary on behalf of a use case.
    ///
    /// Errors returned by a use case itself are carried unchanged in the
    /// `Failure` transition; these variants cover what the use case could
    /// not report.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum HandlerError {
        /// The use case panicked
        #[error("Use case panicked: {0}")]
        Panicked(String),

        /// The registry routed an event of the wrong type
        #[error("Use case for `{expected}` received `{actual}`")]
        EventMismatch {
            /// Event type the use case is bound to
            expected: &'static str,
            /// Event actually received
            actual: &'static str,
        },
    }

    /// Cancellation observed by a use case at a checkpoint.
    ///
    /// Never raised automatically; use cases poll for it.
    #[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CancelError {
        /// The caller cancelled the event
        #[error("Event was cancelled by the caller")]
        Cancelled,

        /// The event's deadline passed
        #[error("Event timed out after {elapsed:?}")]
        TimedOut {
            /// Time since the event started
            elapsed: Duration,
        },
    }

    /// Failure of a coalesced operation, shared by every joined caller.
    #[derive(Error, Debug, Clone)]
    pub enum CoalesceError {
        /// The underlying operation returned an error
        #[error("Coalesced request `{key}` failed: {cause}")]
        Failed {
            /// Canonical request key
            key: String,
            /// The operation's error, shared by all callers
            cause: Arc<anyhow::Error>,
        },

        /// The underlying operation panicked or was aborted
        #[error("Coalesced request `{key}` was aborted: {reason}")]
        Aborted {
            /// Canonical request key
            key: String,
            /// Why the operation did not complete
            reason: String,
        },
    }

    /// Cleanup tasks of a scope still pending when its barrier timed out.
    ///
    /// Non-fatal: the scope still ends. Reported through the timeout callback.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    #[error("Cleanup of scope {scope} ({name}) timed out after {timeout:?}; pending: {pending:?}")]
    pub struct CleanupTimeoutError {
        /// Scope being ended
        pub scope: ScopeId,
        /// Scope name
        pub name: String,
        /// Labels of the abandoned tasks
        pub pending: Vec<String>,
        /// Barrier timeout that elapsed
        pub timeout: Duration,
    }

    /// Errors from receiving on a status subscription
    #[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SubscriptionError {
        /// The subscriber fell behind and transitions were skipped
        #[error("Subscriber lagged, {0} transitions skipped")]
        Lagged(u64),

        /// The channel was closed
        #[error("Status channel closed")]
        Closed,
    }

    /// Invalid canonical request key
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    #[error("Invalid request key `{0}`: expected METHOD:path[?k=v&...]")]
    pub struct InvalidRequestKey(pub String);

    /// Configuration errors
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum ConfigError {
        /// An environment variable held an unparsable value
        #[error("Invalid value for {var}: {value}")]
        InvalidEnv {
            /// Variable name
            var: String,
            /// Offending value
            value: String,
        },

        /// Configuration failed validation
        #[error("Configuration validation failed: {0}")]
        Validation(String),
    }
}

/// Bounds every container state satisfies.
///
/// States are immutable snapshots: a use case produces a new value and the
/// container swaps it in. `PartialEq` backs the skip-if-same check.
pub trait ContainerState: PartialEq + Send + Sync + 'static {}

impl<T: PartialEq + Send + Sync + 'static> ContainerState for T {}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Render a panic payload for logs and error values.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub use cancellation::{CancelState, CancellableEvent};
pub use channel::{StatusChannel, Subscription};
pub use claim::{ClaimAborted, ClaimMap, Claimed};
pub use coalescer::{InflightRequest, RequestCoalescer, RequestKey};
pub use config::{ContainerConfig, RuntimeConfig, ScopeConfig};
pub use container::{
    Container, Dispatch, DispatchOutcome, UpdateOptions, UseCaseContext, WeakContainer,
};
pub use error::{
    CancelError, CleanupTimeoutError, CoalesceError, ConfigError, DispatchError, HandlerError,
    InvalidRequestKey, SubscriptionError,
};
pub use metrics::MetricsServer;
pub use registry::{Lifetime, UseCase, UseCaseRegistry, UseCaseRegistryBuilder};
pub use relay::{EventRelay, RelayHandle};
pub use scope::{
    CleanupBarrier, CleanupFailure, EndScopeReport, EndScopeResult, ObserverId, ScopeEvent,
    ScopeId, ScopeManager, ScopePhase, ScopeRecord,
};
pub use statecraft_core::{
    Event, EventType, Failure, Groups, NavigationIntent, Status, StatusTransition, TransitionKind,
};
