//! Containers: state ownership and event dispatch.
//!
//! A [`Container`] owns one state value, routes each event it receives to
//! the use case bound for the event's type, and publishes every status
//! change a use case emits on its [`StatusChannel`].
//!
//! # Dispatch
//!
//! 1. `send` resolves the event's type against the registry. Without a
//!    binding it fails with [`DispatchError::NoHandler`] and publishes nothing.
//! 2. The event is wrapped in a [`CancellableEvent`] and the use case body
//!    is spawned as its own task; `send` returns a [`Dispatch`] handle at once.
//! 3. The use case emits transitions through its [`UseCaseContext`].
//! 4. An `Err` or a panic from the use case becomes a `Failure` transition;
//!    the container stays usable.
//!
//! # Ordering
//!
//! Use case bodies run concurrently. Only state replacement and publication
//! are serialized: both happen under the container's state lock, so the
//! sequence every subscriber observes is the order in which emit calls ran,
//! and the current state is whatever the last emit carrying a state set.

use crate::cancellation::{CancelState, CancellableEvent};
use crate::channel::{StatusChannel, Subscription};
use crate::config::ContainerConfig;
use crate::error::{CancelError, DispatchError, HandlerError};
use crate::lock;
use crate::metrics::ContainerMetrics;
use crate::registry::UseCaseRegistry;
use crate::scope::{ObserverId, ScopeEvent, ScopeId, ScopeManager};
use crate::ContainerState;
use futures::FutureExt;
use statecraft_core::{
    Event, EventType, Failure, Groups, NavigationIntent, Status, StatusTransition,
};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

struct Slot<S> {
    state: Arc<S>,
    sequence: u64,
}

struct Inner<S> {
    name: Arc<str>,
    slot: RwLock<Slot<S>>,
    channel: StatusChannel<S>,
    registry: UseCaseRegistry<S>,
    config: ContainerConfig,
    closed: watch::Sender<bool>,
    in_flight: Mutex<HashMap<u64, CancellableEvent>>,
    next_dispatch: AtomicU64,
    idle: watch::Sender<usize>,
}

/// A state container.
///
/// Cloning is cheap and every clone refers to the same container.
///
/// # Example
///
/// ```ignore
/// let registry = UseCaseRegistry::builder()
///     .stateless(|| IncrementUseCase)
///     .build();
///
/// let counter = Container::new(Counter::default(), registry);
/// let mut updates = counter.subscribe(Groups::All);
///
/// counter.send(Increment)?.wait().await;
/// assert_eq!(counter.read(|s| s.count), 1);
/// ```
pub struct Container<S> {
    inner: Arc<Inner<S>>,
}

impl<S: ContainerState> Container<S> {
    /// Create a container with default configuration
    #[must_use]
    pub fn new(initial_state: S, registry: UseCaseRegistry<S>) -> Self {
        Self::with_config(initial_state, registry, ContainerConfig::default())
    }

    /// Create a container with explicit configuration
    #[must_use]
    pub fn with_config(
        initial_state: S,
        registry: UseCaseRegistry<S>,
        config: ContainerConfig,
    ) -> Self {
        Self::named(std::any::type_name::<S>(), initial_state, registry, config)
    }

    /// Create a named container. The name labels logs and metrics.
    #[must_use]
    pub fn named(
        name: impl Into<Arc<str>>,
        initial_state: S,
        registry: UseCaseRegistry<S>,
        config: ContainerConfig,
    ) -> Self {
        let (idle, _) = watch::channel(0);
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                slot: RwLock::new(Slot {
                    state: Arc::new(initial_state),
                    sequence: 0,
                }),
                channel: StatusChannel::new(config.broadcast_capacity, config.replay_latest),
                registry,
                config,
                closed,
                in_flight: Mutex::new(HashMap::new()),
                next_dispatch: AtomicU64::new(1),
                idle,
            }),
        }
    }

    /// Container name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Send an event, using the configured default deadline.
    ///
    /// Returns as soon as the use case has been spawned.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NoHandler`] if no use case is bound for `E`
    /// - [`DispatchError::Closed`] if the container has been closed
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[tracing::instrument(skip(self, event), fields(container = %self.inner.name), name = "container_send")]
    pub fn send<E: Event>(&self, event: E) -> Result<Dispatch, DispatchError> {
        self.dispatch(Arc::new(event), self.inner.config.default_deadline())
    }

    /// Send an event that is cancelled by timeout after `deadline`.
    ///
    /// # Errors
    ///
    /// Same as [`Container::send`].
    #[tracing::instrument(skip(self, event), fields(container = %self.inner.name), name = "container_send")]
    pub fn send_with_deadline<E: Event>(
        &self,
        event: E,
        deadline: Duration,
    ) -> Result<Dispatch, DispatchError> {
        self.dispatch(Arc::new(event), Some(deadline))
    }

    /// Send an already type-erased event.
    ///
    /// # Errors
    ///
    /// Same as [`Container::send`].
    pub fn send_arc(&self, event: Arc<dyn Event>) -> Result<Dispatch, DispatchError> {
        self.dispatch(event, self.inner.config.default_deadline())
    }

    /// Send an already type-erased event with a deadline.
    ///
    /// # Errors
    ///
    /// Same as [`Container::send`].
    pub fn send_arc_with_deadline(
        &self,
        event: Arc<dyn Event>,
        deadline: Duration,
    ) -> Result<Dispatch, DispatchError> {
        self.dispatch(event, Some(deadline))
    }

    fn dispatch(
        &self,
        event: Arc<dyn Event>,
        deadline: Option<Duration>,
    ) -> Result<Dispatch, DispatchError> {
        let event_name = event.event_name();

        if *self.inner.closed.borrow() {
            tracing::warn!(event = event_name, "Rejected event: container is closed");
            return Err(DispatchError::Closed);
        }

        let Some(use_case) = self.inner.registry.resolve(event.as_ref()) else {
            tracing::warn!(event = event_name, "No use case registered for event");
            ContainerMetrics::record_unhandled(&self.inner.name, event_name);
            return Err(DispatchError::NoHandler { event: event_name });
        };

        let event_type = event.event_type();
        let controller = CancellableEvent::new(event, deadline);
        let id = self.inner.next_dispatch.fetch_add(1, Ordering::Relaxed);
        let guard = InFlightGuard::register(&self.inner, id, controller.clone());

        tracing::debug!(event = event_name, dispatch = id, "Dispatching event");
        ContainerMetrics::record_dispatch(&self.inner.name, event_name);

        let ctx = UseCaseContext::new(self.clone(), controller.clone());
        let span = tracing::debug_span!("use_case", event = event_name, dispatch = id);

        let task = tokio::spawn(
            async move {
                let _guard = guard;
                let started = Instant::now();

                let result = AssertUnwindSafe(use_case.execute_dyn(ctx.event().as_ref(), &ctx))
                    .catch_unwind()
                    .await;

                ContainerMetrics::record_execution(ctx.container.name(), started.elapsed());
                ctx.finish(result)
            }
            .instrument(span),
        );

        Ok(Dispatch {
            id,
            event_type,
            controller,
            task,
        })
    }

    /// Snapshot of the current state
    #[must_use]
    pub fn state(&self) -> Arc<S> {
        Arc::clone(&read(&self.inner.slot).state)
    }

    /// Read the current state through a closure
    pub fn read<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&S) -> T,
    {
        f(&read(&self.inner.slot).state)
    }

    /// Sequence number of the last published transition (0 before the first)
    #[must_use]
    pub fn sequence(&self) -> u64 {
        read(&self.inner.slot).sequence
    }

    /// Subscribe to transitions affecting `groups`
    pub fn subscribe(&self, groups: impl Into<Groups>) -> Subscription<S> {
        self.inner.channel.subscribe(groups)
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.channel.subscriber_count()
    }

    /// Number of use cases currently running
    #[must_use]
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Whether a use case is bound for events of type `E`
    #[must_use]
    pub fn handles<E: Event>(&self) -> bool {
        self.inner.registry.contains::<E>()
    }

    /// Cancel every running event, returning how many this call cancelled
    pub fn cancel_all(&self) -> usize {
        lock(&self.inner.in_flight)
            .values()
            .filter(|event| event.cancel())
            .count()
    }

    /// Whether the container has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Future that resolves once the container is closed or dropped.
    ///
    /// The future holds no reference to the container, so it never keeps it
    /// alive.
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut closed = self.inner.closed.subscribe();
        async move {
            // An error means the container was dropped
            let _ = closed.wait_for(|closed| *closed).await;
        }
    }

    /// Close the container.
    ///
    /// New events are rejected with [`DispatchError::Closed`], running events
    /// are cancelled, and the call waits up to `timeout` for their use cases
    /// to return. The status channel is closed afterward either way.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::CloseTimeout`] with the number of use cases
    /// still running if they did not all return in time.
    pub async fn close(&self, timeout: Duration) -> Result<(), DispatchError> {
        if self.inner.closed.send_replace(true) {
            tracing::debug!(container = %self.inner.name, "Container already closed");
        }

        let cancelled = self.cancel_all();
        tracing::info!(
            container = %self.inner.name,
            cancelled,
            "Closing container"
        );

        let mut idle = self.inner.idle.subscribe();
        let drained = tokio::time::timeout(timeout, idle.wait_for(|running| *running == 0)).await;
        self.inner.channel.close();

        match drained {
            Ok(_) => {
                tracing::info!(container = %self.inner.name, "Container closed");
                Ok(())
            },
            Err(_) => {
                let pending = self.in_flight();
                tracing::error!(
                    container = %self.inner.name,
                    pending,
                    "Close timed out with use cases still running"
                );
                Err(DispatchError::CloseTimeout(pending))
            },
        }
    }

    /// Close with the configured close timeout
    ///
    /// # Errors
    ///
    /// Same as [`Container::close`].
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        self.close(self.inner.config.close_timeout()).await
    }

    /// Close this container when `scope` ends.
    ///
    /// The close is added to the scope's cleanup barrier, so the end protocol
    /// waits for it. Returns `None` if the scope is not active.
    pub fn attach_to_scope(&self, scopes: &ScopeManager, scope: ScopeId) -> Option<ObserverId> {
        let container = self.downgrade();
        scopes.observe_scope(scope, move |event| {
            if let ScopeEvent::Ending { barrier, .. } = event {
                if let Some(container) = container.upgrade() {
                    let label = format!("close container {}", container.name());
                    barrier.add(label, async move {
                        container.shutdown().await.map_err(anyhow::Error::from)
                    });
                }
            }
        })
    }

    /// A weak handle that does not keep the container alive
    #[must_use]
    pub fn downgrade(&self) -> WeakContainer<S> {
        WeakContainer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Replace state and publish one transition, under the state lock.
    ///
    /// Returns `false` if `skip_if_same` suppressed the transition.
    fn emit(
        &self,
        cause: &CancellableEvent,
        status: Status,
        state: Option<S>,
        options: UpdateOptions,
    ) -> bool {
        let event = cause.event();
        let kind = status.kind();
        let mut slot = write(&self.inner.slot);

        let state = match state {
            Some(next) if options.skip_if_same && *slot.state == next => {
                tracing::trace!(event = event.event_name(), "Skipped update with identical state");
                return false;
            },
            Some(next) => {
                let next = Arc::new(next);
                slot.state = Arc::clone(&next);
                Some(next)
            },
            None => None,
        };

        slot.sequence += 1;
        let transition = StatusTransition {
            sequence: slot.sequence,
            status,
            state,
            event: Arc::clone(event),
            groups: options
                .groups
                .or_else(|| event.groups())
                .unwrap_or_default(),
            intent: options.intent.or_else(|| event.intent()),
        };
        self.inner.channel.publish(transition);
        drop(slot);

        ContainerMetrics::record_transition(&self.inner.name, kind.as_str());
        true
    }
}

impl<S> Clone for Container<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> std::fmt::Debug for Container<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.inner.name)
            .field("closed", &*self.inner.closed.borrow())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

/// Weak reference to a [`Container`]
pub struct WeakContainer<S> {
    inner: Weak<Inner<S>>,
}

impl<S> WeakContainer<S> {
    /// Upgrade if the container is still alive
    #[must_use]
    pub fn upgrade(&self) -> Option<Container<S>> {
        self.inner.upgrade().map(|inner| Container { inner })
    }
}

impl<S> Clone for WeakContainer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<S> std::fmt::Debug for WeakContainer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakContainer")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks a running use case; removes it and updates the idle count on drop
struct InFlightGuard<S> {
    inner: Arc<Inner<S>>,
    id: u64,
}

impl<S> InFlightGuard<S> {
    fn register(inner: &Arc<Inner<S>>, id: u64, event: CancellableEvent) -> Self {
        let mut in_flight = lock(&inner.in_flight);
        in_flight.insert(id, event);
        inner.idle.send_replace(in_flight.len());
        Self {
            inner: Arc::clone(inner),
            id,
        }
    }
}

impl<S> Drop for InFlightGuard<S> {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.inner.in_flight);
        in_flight.remove(&self.id);
        self.inner.idle.send_replace(in_flight.len());
    }
}

/// Options for [`UseCaseContext::emit_update_with`]
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Groups affected; defaults to the event's groups, then all groups
    pub groups: Option<Groups>,
    /// Publish nothing if the new state equals the current one
    pub skip_if_same: bool,
    /// Navigation intent; defaults to the event's intent
    pub intent: Option<NavigationIntent>,
}

impl UpdateOptions {
    /// Default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag the transition with `groups`
    #[must_use]
    pub fn with_groups(mut self, groups: impl Into<Groups>) -> Self {
        self.groups = Some(groups.into());
        self
    }

    /// Suppress the transition when the state is unchanged
    #[must_use]
    pub const fn skip_if_same(mut self) -> Self {
        self.skip_if_same = true;
        self
    }

    /// Attach a navigation intent
    #[must_use]
    pub fn with_intent(mut self, intent: NavigationIntent) -> Self {
        self.intent = Some(intent);
        self
    }
}

/// Handle passed to a use case for one event.
///
/// Each `emit_*` call publishes exactly one transition (except a suppressed
/// `skip_if_same` update). A transition carries a state only when the call
/// supplies one.
pub struct UseCaseContext<S> {
    container: Container<S>,
    event: CancellableEvent,
}

impl<S: ContainerState> UseCaseContext<S> {
    pub(crate) const fn new(container: Container<S>, event: CancellableEvent) -> Self {
        Self { container, event }
    }

    /// Snapshot of the container's current state
    #[must_use]
    pub fn state(&self) -> Arc<S> {
        self.container.state()
    }

    /// The event being handled
    #[must_use]
    pub fn event(&self) -> &Arc<dyn Event> {
        self.event.event()
    }

    /// Cancellation controller of the event being handled
    #[must_use]
    pub const fn cancellation(&self) -> &CancellableEvent {
        &self.event
    }

    /// Whether the event has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.event.is_cancelled()
    }

    /// Cancellation checkpoint.
    ///
    /// Returning this error from the use case ends it as cancelled, without
    /// a `Failure` transition.
    ///
    /// # Errors
    ///
    /// Returns [`CancelError`] once the event has been cancelled.
    pub fn check_cancelled(&self) -> Result<(), CancelError> {
        self.event.check()
    }

    /// The container handling the event, e.g. to send follow-up events
    #[must_use]
    pub const fn container(&self) -> &Container<S> {
        &self.container
    }

    /// Publish an `Updating` transition with a new state
    pub fn emit_update(&self, state: S) -> bool {
        self.emit_update_with(state, UpdateOptions::default())
    }

    /// Publish an `Updating` transition with explicit options.
    ///
    /// Returns `false` if `skip_if_same` suppressed it.
    pub fn emit_update_with(&self, state: S, options: UpdateOptions) -> bool {
        self.container
            .emit(&self.event, Status::Updating, Some(state), options)
    }

    /// Publish a `Waiting` transition, optionally with a partial state
    pub fn emit_waiting(&self, state: Option<S>) {
        self.container
            .emit(&self.event, Status::Waiting, state, UpdateOptions::default());
    }

    /// Publish a `Failure` transition
    pub fn emit_failure(&self, state: Option<S>, error: impl Into<anyhow::Error>) {
        let failure = Failure::new(error.into(), self.event().event_name());
        self.container.emit(
            &self.event,
            Status::Failure(failure),
            state,
            UpdateOptions::default(),
        );
    }

    /// Publish a `Canceling` transition
    pub fn emit_cancel(&self, state: Option<S>) {
        self.container
            .emit(&self.event, Status::Canceling, state, UpdateOptions::default());
    }

    /// Convert the use case's result into its outcome, publishing failures
    fn finish(
        &self,
        result: Result<anyhow::Result<()>, Box<dyn std::any::Any + Send>>,
    ) -> DispatchOutcome {
        let event_name = self.event().event_name();

        let error = match result {
            Ok(Ok(())) => {
                return if self.event.complete() {
                    DispatchOutcome::Completed
                } else {
                    DispatchOutcome::Cancelled(self.event.state())
                };
            },
            Ok(Err(error)) if error.downcast_ref::<CancelError>().is_some() => {
                self.event.complete();
                tracing::debug!(event = event_name, "Use case stopped at cancellation checkpoint");
                return DispatchOutcome::Cancelled(self.event.state());
            },
            Ok(Err(error)) => {
                tracing::error!(event = event_name, error = %error, "Use case failed");
                error
            },
            Err(panic) => {
                let message = crate::panic_message(&*panic);
                tracing::error!(event = event_name, panic = %message, "Use case panicked");
                anyhow::Error::from(HandlerError::Panicked(message))
            },
        };

        ContainerMetrics::record_failure(self.container.name(), event_name);
        let failure = Failure::new(error, event_name);
        self.container.emit(
            &self.event,
            Status::Failure(failure.clone()),
            None,
            UpdateOptions::default(),
        );
        self.event.complete();
        DispatchOutcome::Failed(failure)
    }
}

impl<S> std::fmt::Debug for UseCaseContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UseCaseContext")
            .field("container", &self.container.inner.name)
            .field("event", &self.event)
            .finish()
    }
}

/// How a dispatched event ended
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The use case returned normally
    Completed,
    /// The event was cancelled before the use case returned
    Cancelled(CancelState),
    /// The use case failed or panicked; a `Failure` transition was published
    Failed(Failure),
}

impl DispatchOutcome {
    /// Whether the use case completed normally
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Whether the event was cancelled
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The failure, if the use case failed
    #[must_use]
    pub const fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Handle to one dispatched event.
///
/// Dropping the handle detaches it; the use case keeps running.
pub struct Dispatch {
    id: u64,
    event_type: EventType,
    controller: CancellableEvent,
    task: JoinHandle<DispatchOutcome>,
}

impl Dispatch {
    /// Per-container dispatch id
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Type of the dispatched event
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.event_type
    }

    /// The event's cancellation controller
    #[must_use]
    pub const fn controller(&self) -> &CancellableEvent {
        &self.controller
    }

    /// Request cancellation; see [`CancellableEvent::cancel`]
    pub fn cancel(&self) -> bool {
        self.controller.cancel()
    }

    /// Whether the use case has returned
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the use case to return
    pub async fn wait(self) -> DispatchOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(error) => {
                let reason = if error.is_panic() {
                    crate::panic_message(&*error.into_panic())
                } else {
                    "use case task was aborted".to_string()
                };
                DispatchOutcome::Failed(Failure::new(
                    HandlerError::Panicked(reason).into(),
                    self.event_type.name(),
                ))
            },
        }
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("id", &self.id)
            .field("event", &self.event_type)
            .field("state", &self.controller.state())
            .finish_non_exhaustive()
    }
}
