//! Use cases and the registry that routes events to them.
//!
//! A container routes each event, by its concrete Rust type, to exactly one
//! [`UseCase`]. Bindings are declared once when the container is built and
//! never change afterward.
//!
//! # Lifetimes
//!
//! - [`Lifetime::Stateless`]: the factory runs for every dispatched event, so
//!   each event gets a fresh use case instance.
//! - [`Lifetime::Stateful`]: the factory runs once, on first use, and the
//!   instance is shared by every later event for the life of the registry.
//!
//! # Example
//!
//! ```ignore
//! let registry = UseCaseRegistry::<Counter>::builder()
//!     .stateless(|| IncrementUseCase)
//!     .stateful(|| SearchUseCase::new(client.clone()))
//!     .build();
//! ```

use crate::container::UseCaseContext;
use crate::error::HandlerError;
use async_trait::async_trait;
use statecraft_core::{Event, EventType};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Business logic bound to one event type.
///
/// A use case receives the typed event and a context through which it reads
/// state, checks for cancellation and emits transitions. Returning `Err`
/// (or panicking) makes the container publish a `Failure` transition with
/// the state left unchanged.
///
/// # Example
///
/// ```ignore
/// struct IncrementUseCase;
///
/// #[async_trait]
/// impl UseCase<Counter> for IncrementUseCase {
///     type Event = Increment;
///
///     async fn execute(&self, _event: &Increment, ctx: &UseCaseContext<Counter>) -> anyhow::Result<()> {
///         let next = Counter { count: ctx.state().count + 1 };
///         ctx.emit_update(next);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait UseCase<S>: Send + Sync + 'static
where
    S: Send + Sync + 'static,
{
    /// The event type this use case handles
    type Event: Event;

    /// Handle one event
    ///
    /// # Errors
    ///
    /// Any error is published as a `Failure` transition.
    async fn execute(&self, event: &Self::Event, ctx: &UseCaseContext<S>) -> anyhow::Result<()>;
}

/// Type-erased use case, downcasting the event at the boundary
#[async_trait]
pub(crate) trait ErasedUseCase<S>: Send + Sync {
    async fn execute_dyn(&self, event: &dyn Event, ctx: &UseCaseContext<S>) -> anyhow::Result<()>;
}

#[async_trait]
impl<S, U> ErasedUseCase<S> for U
where
    S: Send + Sync + 'static,
    U: UseCase<S>,
{
    async fn execute_dyn(&self, event: &dyn Event, ctx: &UseCaseContext<S>) -> anyhow::Result<()> {
        let Some(typed) = event.downcast_ref::<U::Event>() else {
            return Err(HandlerError::EventMismatch {
                expected: std::any::type_name::<U::Event>(),
                actual: event.event_name(),
            }
            .into());
        };
        self.execute(typed, ctx).await
    }
}

/// How long a use case instance lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// A fresh instance per event
    Stateless,
    /// One instance shared for the life of the registry
    Stateful,
}

type Factory<S> = Arc<dyn Fn() -> Arc<dyn ErasedUseCase<S>> + Send + Sync>;

struct Binding<S> {
    event_type: EventType,
    lifetime: Lifetime,
    factory: Factory<S>,
    instance: OnceLock<Arc<dyn ErasedUseCase<S>>>,
}

impl<S> Binding<S> {
    fn instance(&self) -> Arc<dyn ErasedUseCase<S>> {
        match self.lifetime {
            Lifetime::Stateless => (self.factory)(),
            Lifetime::Stateful => Arc::clone(self.instance.get_or_init(|| (self.factory)())),
        }
    }
}

/// Immutable map from event type to use case binding
pub struct UseCaseRegistry<S> {
    bindings: HashMap<TypeId, Binding<S>>,
}

impl<S: Send + Sync + 'static> UseCaseRegistry<S> {
    /// Start declaring bindings
    #[must_use]
    pub fn builder() -> UseCaseRegistryBuilder<S> {
        UseCaseRegistryBuilder {
            bindings: HashMap::new(),
        }
    }

    /// A registry with no bindings; every send fails with `NoHandler`
    #[must_use]
    pub fn empty() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }

    /// Resolve the use case for an event, honoring its lifetime
    pub(crate) fn resolve(&self, event: &dyn Event) -> Option<Arc<dyn ErasedUseCase<S>>> {
        self.bindings
            .get(&event.event_type().id())
            .map(Binding::instance)
    }

    /// Whether a use case is bound for events of type `E`
    #[must_use]
    pub fn contains<E: Event>(&self) -> bool {
        self.bindings.contains_key(&TypeId::of::<E>())
    }

    /// Lifetime of the binding for `E`, if any
    #[must_use]
    pub fn lifetime_of<E: Event>(&self) -> Option<Lifetime> {
        self.bindings.get(&TypeId::of::<E>()).map(|b| b.lifetime)
    }

    /// Number of bindings
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether there are no bindings
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Event types with a binding
    pub fn event_types(&self) -> impl Iterator<Item = EventType> + '_ {
        self.bindings.values().map(|binding| binding.event_type)
    }
}

impl<S> std::fmt::Debug for UseCaseRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set()
            .entries(self.bindings.values().map(|b| (b.event_type, b.lifetime)))
            .finish()
    }
}

/// Builder for [`UseCaseRegistry`]
pub struct UseCaseRegistryBuilder<S> {
    bindings: HashMap<TypeId, Binding<S>>,
}

impl<S: Send + Sync + 'static> UseCaseRegistryBuilder<S> {
    /// Bind a use case created fresh for every event
    #[must_use]
    pub fn stateless<U, F>(self, factory: F) -> Self
    where
        U: UseCase<S>,
        F: Fn() -> U + Send + Sync + 'static,
    {
        self.bind(Lifetime::Stateless, factory)
    }

    /// Bind a use case created once and reused
    #[must_use]
    pub fn stateful<U, F>(self, factory: F) -> Self
    where
        U: UseCase<S>,
        F: Fn() -> U + Send + Sync + 'static,
    {
        self.bind(Lifetime::Stateful, factory)
    }

    /// Bind a use case with an explicit lifetime.
    ///
    /// Binding the same event type twice keeps the later binding.
    #[must_use]
    pub fn bind<U, F>(mut self, lifetime: Lifetime, factory: F) -> Self
    where
        U: UseCase<S>,
        F: Fn() -> U + Send + Sync + 'static,
    {
        let event_type = EventType::of::<U::Event>();
        let factory: Factory<S> = Arc::new(move || Arc::new(factory()) as Arc<dyn ErasedUseCase<S>>);

        let previous = self.bindings.insert(
            event_type.id(),
            Binding {
                event_type,
                lifetime,
                factory,
                instance: OnceLock::new(),
            },
        );
        if previous.is_some() {
            tracing::warn!(event = %event_type, "Use case binding replaced");
        }
        self
    }

    /// Finish building
    #[must_use]
    pub fn build(self) -> UseCaseRegistry<S> {
        UseCaseRegistry {
            bindings: self.bindings,
        }
    }
}
