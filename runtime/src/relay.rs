//! Relays between containers.
//!
//! A relay subscribes to one container's transitions and sends a derived
//! event into another container whenever a mapping function returns one.
//! The relay task holds only a weak reference to the target, so a relay
//! never keeps a container alive.
//!
//! A relay stops when any of these happens:
//! - the source channel closes
//! - the target is dropped or closed, even while the source is idle
//! - its [`RelayHandle`] is stopped or dropped

use crate::ContainerState;
use crate::container::Container;
use crate::error::{DispatchError, SubscriptionError};
use statecraft_core::{Event, Groups, StatusTransition, TransitionKind};
use tokio::task::JoinHandle;

/// Constructors for relays
pub struct EventRelay;

impl EventRelay {
    /// Relay transitions that carry a state.
    ///
    /// `map` sees the new state of `source` and returns the event to send to
    /// `target`, or `None` to skip.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn state_relay<S, T, E, F>(
        source: &Container<S>,
        target: &Container<T>,
        map: F,
    ) -> RelayHandle
    where
        S: ContainerState,
        T: ContainerState,
        E: Event,
        F: Fn(&S) -> Option<E> + Send + Sync + 'static,
    {
        Self::spawn(source, target, move |transition: &StatusTransition<S>| {
            transition.state().and_then(&map)
        })
    }

    /// Relay transitions of the given kinds, with or without state.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn status_relay<S, T, E, F>(
        source: &Container<S>,
        target: &Container<T>,
        kinds: impl IntoIterator<Item = TransitionKind>,
        map: F,
    ) -> RelayHandle
    where
        S: ContainerState,
        T: ContainerState,
        E: Event,
        F: Fn(&StatusTransition<S>) -> Option<E> + Send + Sync + 'static,
    {
        let kinds: Vec<TransitionKind> = kinds.into_iter().collect();
        Self::spawn(source, target, move |transition: &StatusTransition<S>| {
            if kinds.contains(&transition.kind()) {
                map(transition)
            } else {
                None
            }
        })
    }

    fn spawn<S, T, E, F>(source: &Container<S>, target: &Container<T>, map: F) -> RelayHandle
    where
        S: ContainerState,
        T: ContainerState,
        E: Event,
        F: Fn(&StatusTransition<S>) -> Option<E> + Send + 'static,
    {
        let mut subscription = source.subscribe(Groups::All);
        let weak_target = target.downgrade();
        let target_closed = target.closed();
        let source_name = source.name().to_string();
        let target_name = target.name().to_string();

        let task = tokio::spawn(async move {
            tracing::debug!(source = %source_name, target = %target_name, "Relay started");
            tokio::pin!(target_closed);

            loop {
                let received = tokio::select! {
                    received = subscription.recv() => received,
                    () = &mut target_closed => {
                        tracing::debug!(target = %target_name, "Relay target closed or dropped");
                        break;
                    },
                };

                let transition = match received {
                    Ok(transition) => transition,
                    Err(SubscriptionError::Lagged(_)) => continue,
                    Err(SubscriptionError::Closed) => {
                        tracing::debug!(source = %source_name, "Relay source closed");
                        break;
                    },
                };

                let Some(event) = map(&transition) else {
                    continue;
                };

                let Some(target) = weak_target.upgrade() else {
                    tracing::debug!(target = %target_name, "Relay target dropped");
                    break;
                };

                match target.send(event) {
                    Ok(_) => {},
                    Err(DispatchError::Closed) => {
                        tracing::debug!(target = %target_name, "Relay target closed");
                        break;
                    },
                    Err(error) => {
                        tracing::warn!(
                            source = %source_name,
                            target = %target_name,
                            error = %error,
                            "Relay failed to deliver event"
                        );
                    },
                }
            }
        });

        RelayHandle { task }
    }
}

/// Handle to a running relay. Dropping it stops the relay.
#[derive(Debug)]
pub struct RelayHandle {
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Stop relaying
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Whether the relay task has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
