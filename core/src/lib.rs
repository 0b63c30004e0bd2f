//! # Statecraft Core
//!
//! Core types for the Statecraft reactive state runtime.
//!
//! This crate holds the data model shared by every container: the commands
//! that flow in, and the status transitions that flow out. It contains no
//! scheduling or concurrency logic; that lives in `statecraft-runtime`.
//!
//! ## Core Concepts
//!
//! - **Event**: An immutable, typed command sent into a container
//! - **Groups**: Named interest tags used to filter transition delivery
//! - **`StatusTransition`**: One published status change (`Updating`, `Waiting`,
//!   `Failure`, `Canceling`) carrying the new state snapshot
//! - **`NavigationIntent`**: Side-channel routing hint attached to a transition
//! - **Clock**: Injected time source for timestamps
//!
//! ## Example
//!
//! ```
//! use statecraft_core::event::Event;
//! use statecraft_core::groups::Groups;
//!
//! #[derive(Debug)]
//! struct Increment;
//!
//! impl Event for Increment {
//!     fn groups(&self) -> Option<Groups> {
//!         Some(Groups::named(["counter"]))
//!     }
//! }
//!
//! let event: &dyn Event = &Increment;
//! assert!(event.downcast_ref::<Increment>().is_some());
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use smallvec::{SmallVec, smallvec};

/// Events, event type tags and navigation intents
pub mod event;

/// Rebuild groups and subscriber interest filtering
pub mod groups;

/// Status transitions published by containers
pub mod transition;

/// Environment module - injected dependencies
///
/// Time is abstracted behind [`Clock`](environment::Clock) so that
/// bookkeeping timestamps (in-flight requests, scope records) are
/// deterministic under test.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use event::{Event, EventType, NavigationIntent};
pub use groups::{GroupName, Groups};
pub use transition::{Failure, Status, StatusTransition, Trace, TransitionKind};
