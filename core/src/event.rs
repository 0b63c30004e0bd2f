//! Event trait and related types.
//!
//! An event is an immutable command dispatched into a container. Containers
//! resolve the handler for an event by its concrete Rust type, so the type
//! itself is the routing key: there is no string-based event registry.
//!
//! # Example
//!
//! ```
//! use statecraft_core::event::{Event, EventType, NavigationIntent};
//!
//! #[derive(Debug)]
//! struct OpenDetails {
//!     item_id: u64,
//! }
//!
//! impl Event for OpenDetails {
//!     fn intent(&self) -> Option<NavigationIntent> {
//!         Some(NavigationIntent::new("details").with_argument("id", self.item_id))
//!     }
//! }
//!
//! let event: &dyn Event = &OpenDetails { item_id: 7 };
//! assert_eq!(event.event_type(), EventType::of::<OpenDetails>());
//! ```

use crate::groups::Groups;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;

/// Object-safe access to [`Any`] for trait objects.
///
/// Implemented for every `'static + Send + Sync` type; never implement it by hand.
pub trait AsAny: Any + Send + Sync {
    /// Borrow `self` as `&dyn Any`
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An immutable command that a container routes to exactly one use case.
///
/// Only [`Debug`](fmt::Debug) is required; the remaining methods have defaults.
///
/// # Thread Safety
///
/// Events must be `Send + Sync + 'static`: once sent they are shared
/// read-only between the handler task and every published transition.
pub trait Event: AsAny + fmt::Debug {
    /// Human-readable event name used in logs, errors and traces.
    ///
    /// Defaults to the Rust type name.
    fn event_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Rebuild groups this event targets.
    ///
    /// Used as the transition groups when a use case does not name any
    /// explicitly. `None` means "all groups".
    fn groups(&self) -> Option<Groups> {
        None
    }

    /// Optional navigation intent forwarded on the transitions this event causes.
    fn intent(&self) -> Option<NavigationIntent> {
        None
    }
}

impl dyn Event + '_ {
    /// Runtime type tag of the concrete event
    #[must_use]
    pub fn event_type(&self) -> EventType {
        EventType {
            id: self.as_any().type_id(),
            name: self.event_name(),
        }
    }

    /// Downcast to the concrete event type
    #[must_use]
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    /// Check whether the concrete event is of type `E`
    #[must_use]
    pub fn is<E: Event>(&self) -> bool {
        self.as_any().is::<E>()
    }
}

/// Stable runtime type tag for an event.
///
/// Equality and hashing use only the [`TypeId`]; the name is for display.
#[derive(Clone, Copy)]
pub struct EventType {
    id: TypeId,
    name: &'static str,
}

impl EventType {
    /// Type tag for the event type `E`
    #[must_use]
    pub fn of<E: Event>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: std::any::type_name::<E>(),
        }
    }

    /// The underlying [`TypeId`]
    #[must_use]
    pub const fn id(&self) -> TypeId {
        self.id
    }

    /// Display name of the event type
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventType {}

impl std::hash::Hash for EventType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventType").field(&self.name).finish()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Navigation side channel carried alongside a transition.
///
/// The runtime never interprets intents; a navigation layer subscribed to
/// the container decides what, if anything, to do with them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationIntent {
    /// Route or destination name
    pub name: String,

    /// Route arguments
    #[serde(default)]
    pub arguments: BTreeMap<String, serde_json::Value>,
}

impl NavigationIntent {
    /// Create an intent with no arguments
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: BTreeMap::new(),
        }
    }

    /// Add an argument
    #[must_use]
    pub fn with_argument(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// Look up an argument by key
    #[must_use]
    pub fn argument(&self, key: &str) -> Option<&serde_json::Value> {
        self.arguments.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Increment;

    impl Event for Increment {}

    #[derive(Debug)]
    struct Rename {
        #[allow(dead_code)]
        name: String,
    }

    impl Event for Rename {
        fn event_name(&self) -> &'static str {
            "Rename"
        }

        fn groups(&self) -> Option<Groups> {
            Some(Groups::named(["title"]))
        }
    }

    #[test]
    fn test_event_type_matches_dynamic_type() {
        let event: Box<dyn Event> = Box::new(Increment);
        assert_eq!(event.event_type(), EventType::of::<Increment>());
        assert_ne!(event.event_type(), EventType::of::<Rename>());
    }

    #[test]
    fn test_downcast() {
        let event: std::sync::Arc<dyn Event> = std::sync::Arc::new(Rename {
            name: "x".to_string(),
        });
        assert!(event.is::<Rename>());
        assert!(event.downcast_ref::<Increment>().is_none());
        assert!(event.downcast_ref::<Rename>().is_some());
        assert_eq!(event.event_name(), "Rename");
    }

    #[test]
    fn test_default_event_name_is_type_name() {
        let event: &dyn Event = &Increment;
        assert!(event.event_name().ends_with("Increment"));
        assert!(event.groups().is_none());
        assert!(event.intent().is_none());
    }

    #[test]
    fn test_navigation_intent_serde() {
        let intent = NavigationIntent::new("weather")
            .with_argument("city", "NYC")
            .with_argument("days", 3);

        let json = serde_json::to_string(&intent).unwrap_or_default();
        let back: Option<NavigationIntent> = serde_json::from_str(&json).ok();
        assert_eq!(back, Some(intent.clone()));
        assert_eq!(intent.argument("days"), Some(&serde_json::json!(3)));
    }
}
