//! # Statecraft Testing
//!
//! Testing utilities and helpers for the Statecraft reactive state architecture.
//!
//! This crate provides:
//! - A fixed [`Clock`] for deterministic timestamps
//! - [`TransitionRecorder`], which captures everything a container publishes
//! - [`UseCaseTest`], a Given-When-Then harness for use cases
//! - proptest strategies for runtime types
//!
//! ## Example
//!
//! ```ignore
//! use statecraft_testing::UseCaseTest;
//!
//! #[tokio::test]
//! async fn test_increment() {
//!     UseCaseTest::new(UseCaseRegistry::builder().stateless(|| IncrementUseCase).build())
//!         .given_state(Counter { count: 0 })
//!         .when_event(Increment)
//!         .then_kinds([TransitionKind::Updating])
//!         .then_state(|state| assert_eq!(state.count, 1))
//!         .run()
//!         .await;
//! }
//! ```

use chrono::{DateTime, Utc};
use statecraft_core::environment::Clock;

pub mod recorder;
pub mod use_case_test;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use statecraft_testing::mocks::FixedClock;
    /// use statecraft_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities.
pub mod helpers {
    /// Install a compact `tracing` subscriber honoring `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .compact()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use statecraft_runtime::RequestKey;

    /// Strategy producing request keys with up to four parameters
    pub fn request_key() -> impl Strategy<Value = RequestKey> {
        (
            prop::sample::select(vec!["GET", "POST", "PUT", "DELETE"]),
            "/[a-z]{1,8}(/[a-z0-9]{1,6}){0,2}",
            prop::collection::btree_map("[a-z]{1,6}", "[A-Za-z0-9]{0,8}", 0..4),
        )
            .prop_map(|(method, path, params)| {
                params
                    .into_iter()
                    .fold(RequestKey::new(method, path), |key, (name, value)| {
                        key.with_param(name, value)
                    })
            })
    }
}

// Re-export commonly used items
pub use helpers::init_tracing;
pub use mocks::{FixedClock, test_clock};
pub use recorder::TransitionRecorder;
pub use use_case_test::UseCaseTest;
