//! Claim-or-join map.
//!
//! The first caller for a key claims it and its work is spawned onto the
//! runtime; every later caller for the same key joins the in-flight work and
//! receives a clone of the same output. The entry is released by the task
//! itself, before the output becomes visible to any caller, so a call made
//! after a result was observed always starts fresh work.
//!
//! Release also happens when the work panics or its task is aborted; joined
//! callers then observe [`ClaimAborted`].

use crate::lock;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::oneshot;

/// The claimed work ended without producing an output
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ClaimAborted(pub String);

/// Future resolving to the claimed work's output, cloneable across callers
pub type SharedClaim<T> = Shared<BoxFuture<'static, Result<T, ClaimAborted>>>;

/// Result of [`ClaimMap::claim_or_join`]
pub struct Claimed<T> {
    /// Resolves to the shared output
    pub future: SharedClaim<T>,
    /// `true` if an existing claim was joined, `false` if this call started the work
    pub joined: bool,
}

struct Entry<T> {
    generation: u64,
    started_at: DateTime<Utc>,
    future: SharedClaim<T>,
}

struct ClaimState<K, T> {
    entries: HashMap<K, Entry<T>>,
    next_generation: u64,
}

/// Map of in-flight work keyed by `K`
pub struct ClaimMap<K, T> {
    state: Arc<Mutex<ClaimState<K, T>>>,
}

impl<K, T> ClaimMap<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClaimState {
                entries: HashMap::new(),
                next_generation: 0,
            })),
        }
    }

    /// Join the in-flight work for `key`, or claim the key and spawn `make()`.
    ///
    /// The key is reserved under the map's lock; `make` runs after the lock
    /// is released, so it may freely inspect this map. If `make` panics, the
    /// panic reaches this caller and joined callers observe [`ClaimAborted`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime while claiming.
    pub fn claim_or_join<F, Fut>(&self, key: K, started_at: DateTime<Utc>, make: F) -> Claimed<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (start, started) = oneshot::channel::<BoxFuture<'static, T>>();

        let future = {
            let mut state = lock(&self.state);

            if let Some(entry) = state.entries.get(&key) {
                return Claimed {
                    future: entry.future.clone(),
                    joined: true,
                };
            }

            let generation = state.next_generation;
            state.next_generation += 1;

            let release = ReleaseOnDrop {
                state: Arc::downgrade(&self.state),
                key: key.clone(),
                generation,
            };
            let task = tokio::spawn(async move {
                let _release = release;
                match started.await {
                    Ok(work) => Some(work.await),
                    Err(_) => None,
                }
            });

            let future = async move {
                match task.await {
                    Ok(Some(output)) => Ok(output),
                    Ok(None) => Err(ClaimAborted("claimed work was never started".to_string())),
                    Err(error) if error.is_panic() => Err(ClaimAborted(format!(
                        "panicked: {}",
                        crate::panic_message(&*error.into_panic())
                    ))),
                    Err(_) => Err(ClaimAborted("task was cancelled".to_string())),
                }
            }
            .boxed()
            .shared();

            state.entries.insert(
                key,
                Entry {
                    generation,
                    started_at,
                    future: future.clone(),
                },
            );
            future
        };

        // Fails only if the task was aborted; joined callers see ClaimAborted
        let _ = start.send(make().boxed());

        Claimed {
            future,
            joined: false,
        }
    }

    /// Forget every in-flight claim, returning how many were dropped.
    ///
    /// Running work is not interrupted and callers already joined still
    /// receive its output; only new callers start fresh.
    pub fn clear(&self) -> usize {
        let mut state = lock(&self.state);
        let cleared = state.entries.len();
        state.entries.clear();
        cleared
    }

    /// Forget the claim for `key`
    pub fn remove(&self, key: &K) -> bool {
        lock(&self.state).entries.remove(key).is_some()
    }

    /// Whether `key` is claimed
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.state).entries.contains_key(key)
    }

    /// Number of in-flight claims
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    /// Whether nothing is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.state).entries.is_empty()
    }

    /// Keys in flight with the time each was claimed
    #[must_use]
    pub fn snapshot(&self) -> Vec<(K, DateTime<Utc>)> {
        lock(&self.state)
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.started_at))
            .collect()
    }
}

impl<K, T> Default for ClaimMap<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Clone for ClaimMap<K, T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K, T> std::fmt::Debug for ClaimMap<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimMap")
            .field("in_flight", &lock(&self.state).entries.len())
            .finish()
    }
}

/// Releases a claim when the task owning it finishes, panics or is aborted.
///
/// Generation-checked so a stale guard never releases a newer claim.
struct ReleaseOnDrop<K: Eq + Hash, T> {
    state: Weak<Mutex<ClaimState<K, T>>>,
    key: K,
    generation: u64,
}

impl<K: Eq + Hash, T> Drop for ReleaseOnDrop<K, T> {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = lock(&state);
        if state
            .entries
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            state.entries.remove(&self.key);
        }
    }
}
