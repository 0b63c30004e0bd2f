//! Request coalescing.
//!
//! Concurrent identical requests share a single execution. Requests are
//! identified by a [`RequestKey`]; two keys are the same request when their
//! canonical forms match. While an execution for a key is in flight, every
//! further caller joins it and receives the same result: a clone of the value
//! or the same shared error.
//!
//! # Example
//!
//! ```ignore
//! let coalescer = RequestCoalescer::<Forecast>::new();
//! let key = RequestKey::new("GET", "/weather").with_param("city", "NYC");
//!
//! // Concurrent callers with the same key trigger one HTTP call
//! let forecast = coalescer.coalesce(&key, || client.forecast("NYC")).await?;
//! ```

use crate::claim::ClaimMap;
use crate::error::{CoalesceError, InvalidRequestKey};
use crate::metrics::CoalescerMetrics;
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use statecraft_core::environment::{Clock, SystemClock};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

/// Bytes escaped in the path
const PATH: &AsciiSet = &CONTROLS.add(b'%').add(b'?');

/// Bytes escaped in the method, parameter names and values
const COMPONENT: &AsciiSet = &PATH.add(b':').add(b'&').add(b'=');

fn decode(component: &str) -> Option<String> {
    percent_decode_str(component)
        .decode_utf8()
        .ok()
        .map(std::borrow::Cow::into_owned)
}

/// Identity of an external request.
///
/// The canonical form is `METHOD:path?k1=v1&k2=v2` with the method
/// uppercased and parameters sorted by key; the `?` is omitted when there
/// are no parameters. Separator characters and `%` inside components are
/// percent-encoded, so distinct keys never share a canonical form.
/// Equality and hashing use the canonical form, so parameter insertion
/// order never matters.
#[derive(Clone)]
pub struct RequestKey {
    method: String,
    path: String,
    params: BTreeMap<String, String>,
}

impl RequestKey {
    /// Create a key without parameters
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter, replacing any previous value for `key`
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    /// Request method, uppercased
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Parameters, sorted by key
    #[must_use]
    pub const fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Canonical string form
    #[must_use]
    pub fn canonical(&self) -> String {
        let mut canonical = format!(
            "{}:{}",
            utf8_percent_encode(&self.method, COMPONENT),
            utf8_percent_encode(&self.path, PATH)
        );
        for (index, (key, value)) in self.params.iter().enumerate() {
            canonical.push(if index == 0 { '?' } else { '&' });
            canonical.extend(utf8_percent_encode(key, COMPONENT));
            canonical.push('=');
            canonical.extend(utf8_percent_encode(value, COMPONENT));
        }
        canonical
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for RequestKey {}

impl Hash for RequestKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestKey").field(&self.canonical()).finish()
    }
}

impl FromStr for RequestKey {
    type Err = InvalidRequestKey;

    /// Parse a canonical form back into a key
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidRequestKey(s.to_string());

        let (method, rest) = s.split_once(':').ok_or_else(invalid)?;
        if method.is_empty() {
            return Err(invalid());
        }

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let method = decode(method).ok_or_else(invalid)?;
        let path = decode(path).ok_or_else(invalid)?;
        let mut key = Self::new(method, path);
        if let Some(query) = query {
            for pair in query.split('&') {
                let (name, value) = pair.split_once('=').ok_or_else(invalid)?;
                if name.is_empty() {
                    return Err(invalid());
                }
                let name = decode(name).ok_or_else(invalid)?;
                let value = decode(value).ok_or_else(invalid)?;
                key = key.with_param(name, value);
            }
        }
        Ok(key)
    }
}

/// A request currently in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightRequest {
    /// Canonical key
    pub key: String,
    /// When the execution started
    pub started_at: DateTime<Utc>,
}

/// Shares one execution among concurrent identical requests.
///
/// Cloning is cheap; clones share the in-flight map.
pub struct RequestCoalescer<T> {
    inflight: ClaimMap<String, Result<T, CoalesceError>>,
    clock: Arc<dyn Clock>,
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a coalescer using the system clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a coalescer with an injected clock for start timestamps
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inflight: ClaimMap::new(),
            clock,
        }
    }

    /// Run `operation` for `key`, or join the execution already in flight.
    ///
    /// `operation` is only called when this caller starts a new execution.
    /// The execution runs as its own task, so it completes even if every
    /// caller stops waiting.
    ///
    /// # Errors
    ///
    /// - [`CoalesceError::Failed`] with the operation's error, shared by all
    ///   joined callers
    /// - [`CoalesceError::Aborted`] if the operation panicked
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub async fn coalesce<F, Fut>(&self, key: &RequestKey, operation: F) -> Result<T, CoalesceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let canonical = key.canonical();
        let claimed = {
            let failed_key = canonical.clone();
            self.inflight
                .claim_or_join(canonical.clone(), self.clock.now(), move || {
                    let work = operation();
                    async move {
                        work.await.map_err(|cause| CoalesceError::Failed {
                            key: failed_key,
                            cause: Arc::new(cause),
                        })
                    }
                })
        };

        if claimed.joined {
            tracing::debug!(key = %canonical, "Joined in-flight request");
            CoalescerMetrics::record_join();
        } else {
            tracing::debug!(key = %canonical, "Started coalesced request");
            CoalescerMetrics::record_execution();
        }
        CoalescerMetrics::record_inflight(self.inflight.len());

        let result = claimed.future.await;
        CoalescerMetrics::record_inflight(self.inflight.len());

        match result {
            Ok(result) => result,
            Err(aborted) => Err(CoalesceError::Aborted {
                key: canonical,
                reason: aborted.0,
            }),
        }
    }

    /// Forget every in-flight request, returning how many were dropped.
    ///
    /// This only clears bookkeeping: running operations are not stopped, and
    /// callers already joined still receive their result. New callers for
    /// the same key start a fresh execution. Use a cancellable event to stop
    /// the work itself.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let cleared = self.inflight.clear();
        if cleared > 0 {
            tracing::info!(cleared, reason, "Cleared in-flight requests");
        }
        CoalescerMetrics::record_inflight(0);
        cleared
    }

    /// Number of requests in flight
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Whether a request for `key` is in flight
    #[must_use]
    pub fn is_inflight(&self, key: &RequestKey) -> bool {
        self.inflight.contains(&key.canonical())
    }

    /// Snapshot of in-flight requests, oldest first
    #[must_use]
    pub fn inflight(&self) -> Vec<InflightRequest> {
        let mut requests: Vec<InflightRequest> = self
            .inflight
            .snapshot()
            .into_iter()
            .map(|(key, started_at)| InflightRequest { key, started_at })
            .collect();
        requests.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.key.cmp(&b.key)));
        requests
    }
}

impl<T> Default for RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for RequestCoalescer<T> {
    fn clone(&self) -> Self {
        Self {
            inflight: self.inflight.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<T> fmt::Debug for RequestCoalescer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("inflight", &self.inflight)
            .finish_non_exhaustive()
    }
}
