//! Scope lifecycle management.
//!
//! A scope groups containers that live and die together, such as everything
//! behind one feature screen. The [`ScopeManager`] hands out monotonic
//! [`ScopeId`]s, tracks active scopes, and runs a barrier-based end protocol:
//!
//! 1. The scope moves to `Ending` and every observer is notified
//!    synchronously with [`ScopeEvent::Ending`], carrying a [`CleanupBarrier`].
//! 2. Observers add cleanup futures to the barrier during that call.
//! 3. All cleanup tasks run concurrently until the cleanup timeout. A failing
//!    or panicking task is recorded and does not affect the others. Tasks
//!    still running at the timeout are abandoned and reported once through
//!    the cleanup-timeout callback.
//! 4. The scope moves to `Ended`, observers receive [`ScopeEvent::Ended`],
//!    and the record is removed.
//!
//! Ending a scope is idempotent: concurrent callers share one run of the
//! protocol and all receive the same [`EndScopeResult`].

use crate::claim::ClaimMap;
use crate::config::ScopeConfig;
use crate::error::CleanupTimeoutError;
use crate::lock;
use crate::metrics::ScopeMetrics;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use statecraft_core::environment::{Clock, SystemClock};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Identifier of a scope. Monotonic, starting at 1, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(u64);

impl ScopeId {
    /// The raw value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Identifier of a registered observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Phase of a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopePhase {
    /// Started and not yet ending
    Active,
    /// End protocol in progress
    Ending,
    /// End protocol finished
    Ended,
}

/// Bookkeeping for one scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRecord {
    /// Scope id
    pub id: ScopeId,
    /// Scope name
    pub name: String,
    /// Current phase
    pub phase: ScopePhase,
    /// When the scope started
    pub started_at: DateTime<Utc>,
}

/// Notification delivered to scope observers
#[derive(Debug)]
pub enum ScopeEvent<'a> {
    /// A scope started
    Started {
        /// Scope id
        id: ScopeId,
        /// Scope name
        name: &'a str,
    },
    /// A scope is ending; add cleanup work to the barrier now
    Ending {
        /// Scope id
        id: ScopeId,
        /// Scope name
        name: &'a str,
        /// Collects cleanup tasks for this end
        barrier: &'a CleanupBarrier,
    },
    /// A scope ended
    Ended {
        /// Scope id
        id: ScopeId,
        /// Scope name
        name: &'a str,
        /// What happened to the cleanup tasks
        report: &'a EndScopeReport,
    },
}

impl ScopeEvent<'_> {
    /// Scope the event is about
    #[must_use]
    pub const fn scope(&self) -> ScopeId {
        match self {
            Self::Started { id, .. } | Self::Ending { id, .. } | Self::Ended { id, .. } => *id,
        }
    }
}

struct CleanupTask {
    label: String,
    future: BoxFuture<'static, anyhow::Result<()>>,
}

/// Cleanup tasks gathered while a scope is ending.
///
/// Append-only; the end protocol awaits everything added during the
/// `Ending` notification.
pub struct CleanupBarrier {
    tasks: Mutex<Vec<CleanupTask>>,
}

impl CleanupBarrier {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Add a labelled cleanup task
    pub fn add<F>(&self, label: impl Into<String>, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        lock(&self.tasks).push(CleanupTask {
            label: label.into(),
            future: task.boxed(),
        });
    }

    /// Number of tasks added so far
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Whether no task has been added
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.tasks).is_empty()
    }

    fn take(&self) -> Vec<CleanupTask> {
        std::mem::take(&mut *lock(&self.tasks))
    }
}

impl fmt::Debug for CleanupBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tasks = lock(&self.tasks);
        f.debug_list()
            .entries(tasks.iter().map(|task| &task.label))
            .finish()
    }
}

/// A cleanup task that returned an error or panicked
#[derive(Debug, Clone)]
pub struct CleanupFailure {
    /// Task label
    pub label: String,
    /// The task's error
    pub error: Arc<anyhow::Error>,
}

/// Outcome of a scope's cleanup barrier
#[derive(Debug, Clone)]
pub struct EndScopeReport {
    /// Scope id
    pub id: ScopeId,
    /// Scope name
    pub name: String,
    /// Labels of tasks that finished successfully
    pub completed: Vec<String>,
    /// Tasks that failed or panicked
    pub failed: Vec<CleanupFailure>,
    /// Labels of tasks abandoned at the timeout
    pub timed_out: Vec<String>,
}

impl EndScopeReport {
    /// Whether every cleanup task finished successfully in time
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

/// Result of ending a scope, shared by every concurrent caller
#[derive(Debug, Clone)]
pub enum EndScopeResult {
    /// The end protocol ran
    Ended(EndScopeReport),
    /// No active scope has this id (unknown or already ended)
    NotFound(ScopeId),
    /// The end protocol itself panicked
    Aborted {
        /// Scope id
        id: ScopeId,
        /// What went wrong
        reason: String,
    },
}

impl EndScopeResult {
    /// The report, if the protocol ran
    #[must_use]
    pub const fn report(&self) -> Option<&EndScopeReport> {
        match self {
            Self::Ended(report) => Some(report),
            _ => None,
        }
    }

    /// Whether the protocol ran
    #[must_use]
    pub const fn is_ended(&self) -> bool {
        matches!(self, Self::Ended(_))
    }
}

type ObserverFn = Arc<dyn Fn(&ScopeEvent<'_>) + Send + Sync>;
type TimeoutFn = Arc<dyn Fn(&CleanupTimeoutError) + Send + Sync>;

struct Observer {
    id: ObserverId,
    scope: Option<ScopeId>,
    callback: ObserverFn,
}

struct ScopeInner {
    next_scope: AtomicU64,
    next_observer: AtomicU64,
    records: Mutex<BTreeMap<ScopeId, ScopeRecord>>,
    observers: Mutex<Vec<Observer>>,
    ending: ClaimMap<ScopeId, EndScopeResult>,
    on_cleanup_timeout: Mutex<Option<TimeoutFn>>,
    config: ScopeConfig,
    clock: Arc<dyn Clock>,
}

/// Scope lifecycle manager.
///
/// Cloning is cheap; clones share all scopes and observers.
#[derive(Clone)]
pub struct ScopeManager {
    inner: Arc<ScopeInner>,
}

impl ScopeManager {
    /// Create a manager with default configuration and the system clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ScopeConfig::default(), Arc::new(SystemClock))
    }

    /// Create a manager with explicit configuration and clock
    #[must_use]
    pub fn with_config(config: ScopeConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                next_scope: AtomicU64::new(1),
                next_observer: AtomicU64::new(1),
                records: Mutex::new(BTreeMap::new()),
                observers: Mutex::new(Vec::new()),
                ending: ClaimMap::new(),
                on_cleanup_timeout: Mutex::new(None),
                config,
                clock,
            }),
        }
    }

    /// Start a scope and notify observers
    pub fn start_scope(&self, name: impl Into<String>) -> ScopeId {
        let id = ScopeId(self.inner.next_scope.fetch_add(1, Ordering::Relaxed));
        let name = name.into();

        lock(&self.inner.records).insert(
            id,
            ScopeRecord {
                id,
                name: name.clone(),
                phase: ScopePhase::Active,
                started_at: self.inner.clock.now(),
            },
        );

        tracing::info!(scope = %id, name = %name, "Scope started");
        ScopeMetrics::record_start();
        self.notify(id, &ScopeEvent::Started { id, name: &name });
        id
    }

    /// End a scope with the configured cleanup timeout.
    ///
    /// See [`ScopeManager::end_scope_with_timeout`].
    pub async fn end_scope(&self, id: ScopeId) -> EndScopeResult {
        self.end_scope_with_timeout(id, self.inner.config.cleanup_timeout())
            .await
    }

    /// End a scope, waiting at most `timeout` for its cleanup barrier.
    ///
    /// Concurrent calls for the same id share one run of the end protocol.
    /// Calls for an unknown or already ended id return
    /// [`EndScopeResult::NotFound`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[tracing::instrument(skip(self), fields(scope = %id))]
    pub async fn end_scope_with_timeout(&self, id: ScopeId, timeout: Duration) -> EndScopeResult {
        let manager = self.clone();
        let claimed = self
            .inner
            .ending
            .claim_or_join(id, self.inner.clock.now(), move || async move {
                manager.run_end_protocol(id, timeout).await
            });

        if claimed.joined {
            tracing::debug!("Joined in-progress scope end");
        }

        match claimed.future.await {
            Ok(result) => result,
            Err(aborted) => {
                tracing::error!(reason = %aborted, "Scope end protocol aborted");
                EndScopeResult::Aborted {
                    id,
                    reason: aborted.0,
                }
            },
        }
    }

    async fn run_end_protocol(&self, id: ScopeId, timeout: Duration) -> EndScopeResult {
        let name = {
            let mut records = lock(&self.inner.records);
            match records.get_mut(&id) {
                Some(record) if record.phase == ScopePhase::Active => {
                    record.phase = ScopePhase::Ending;
                    record.name.clone()
                },
                _ => return EndScopeResult::NotFound(id),
            }
        };

        tracing::info!(name = %name, "Scope ending");
        let barrier = CleanupBarrier::new();
        self.notify(id, &ScopeEvent::Ending {
            id,
            name: &name,
            barrier: &barrier,
        });

        let report = self
            .run_barrier(id, &name, barrier.take(), timeout)
            .await;

        if let Some(record) = lock(&self.inner.records).get_mut(&id) {
            record.phase = ScopePhase::Ended;
        }
        self.notify(id, &ScopeEvent::Ended {
            id,
            name: &name,
            report: &report,
        });

        lock(&self.inner.records).remove(&id);
        lock(&self.inner.observers).retain(|observer| observer.scope != Some(id));

        tracing::info!(
            name = %name,
            completed = report.completed.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            "Scope ended"
        );
        ScopeMetrics::record_end();
        EndScopeResult::Ended(report)
    }

    async fn run_barrier(
        &self,
        id: ScopeId,
        name: &str,
        tasks: Vec<CleanupTask>,
        timeout: Duration,
    ) -> EndScopeReport {
        let deadline = tokio::time::Instant::now() + timeout;
        let running: Vec<_> = tasks
            .into_iter()
            .map(|task| (task.label, tokio::spawn(task.future)))
            .collect();

        let mut report = EndScopeReport {
            id,
            name: name.to_string(),
            completed: Vec::new(),
            failed: Vec::new(),
            timed_out: Vec::new(),
        };

        for (label, mut handle) in running {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => report.completed.push(label),
                Ok(Ok(Err(error))) => {
                    tracing::warn!(task = %label, error = %error, "Cleanup task failed");
                    report.failed.push(CleanupFailure {
                        label,
                        error: Arc::new(error),
                    });
                },
                Ok(Err(join_error)) => {
                    let reason = if join_error.is_panic() {
                        crate::panic_message(&*join_error.into_panic())
                    } else {
                        "cleanup task was cancelled".to_string()
                    };
                    tracing::warn!(task = %label, reason = %reason, "Cleanup task panicked");
                    report.failed.push(CleanupFailure {
                        label,
                        error: Arc::new(anyhow::anyhow!("cleanup task panicked: {reason}")),
                    });
                },
                // Dropping the handle detaches the task
                Err(_) => report.timed_out.push(label),
            }
        }

        if !report.failed.is_empty() {
            ScopeMetrics::record_cleanup_failures(report.failed.len());
        }

        if !report.timed_out.is_empty() {
            let error = CleanupTimeoutError {
                scope: id,
                name: name.to_string(),
                pending: report.timed_out.clone(),
                timeout,
            };
            tracing::warn!(error = %error, "Scope cleanup timed out");
            ScopeMetrics::record_cleanup_timeout();

            let callback = lock(&self.inner.on_cleanup_timeout).clone();
            if let Some(callback) = callback {
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&error))).is_err() {
                    tracing::warn!("Cleanup timeout callback panicked");
                }
            }
        }

        report
    }

    /// End every active scope concurrently
    pub async fn shutdown(&self) -> Vec<EndScopeResult> {
        let ids: Vec<ScopeId> = lock(&self.inner.records)
            .values()
            .filter(|record| record.phase == ScopePhase::Active)
            .map(|record| record.id)
            .collect();

        tracing::info!(scopes = ids.len(), "Shutting down scopes");
        futures::future::join_all(ids.into_iter().map(|id| self.end_scope(id))).await
    }

    /// Observe every scope.
    ///
    /// Observers run synchronously on the thread emitting the event and must
    /// not block. A panicking observer is logged and skipped.
    pub fn observe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ScopeEvent<'_>) + Send + Sync + 'static,
    {
        self.add_observer(None, Arc::new(observer))
    }

    /// Observe one scope; the observer is dropped when that scope ends.
    ///
    /// Returns `None` if the scope is not active.
    pub fn observe_scope<F>(&self, scope: ScopeId, observer: F) -> Option<ObserverId>
    where
        F: Fn(&ScopeEvent<'_>) + Send + Sync + 'static,
    {
        // Held across the push so the scope cannot start ending in between
        let records = lock(&self.inner.records);
        if !records
            .get(&scope)
            .is_some_and(|record| record.phase == ScopePhase::Active)
        {
            return None;
        }
        let id = self.add_observer(Some(scope), Arc::new(observer));
        drop(records);
        Some(id)
    }

    fn add_observer(&self, scope: Option<ScopeId>, callback: ObserverFn) -> ObserverId {
        let id = ObserverId(self.inner.next_observer.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.observers).push(Observer {
            id,
            scope,
            callback,
        });
        id
    }

    /// Number of registered observers, global and scope-bound
    #[must_use]
    pub fn observer_count(&self) -> usize {
        lock(&self.inner.observers).len()
    }

    /// Remove an observer
    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = lock(&self.inner.observers);
        let before = observers.len();
        observers.retain(|observer| observer.id != id);
        observers.len() != before
    }

    /// Set the callback invoked once per scope whose cleanup times out
    pub fn on_cleanup_timeout<F>(&self, callback: F)
    where
        F: Fn(&CleanupTimeoutError) + Send + Sync + 'static,
    {
        *lock(&self.inner.on_cleanup_timeout) = Some(Arc::new(callback));
    }

    /// Record of a scope that has not finished ending
    #[must_use]
    pub fn record(&self, id: ScopeId) -> Option<ScopeRecord> {
        lock(&self.inner.records).get(&id).cloned()
    }

    /// Whether the scope is active
    #[must_use]
    pub fn is_active(&self, id: ScopeId) -> bool {
        lock(&self.inner.records)
            .get(&id)
            .is_some_and(|record| record.phase == ScopePhase::Active)
    }

    /// Scopes that have not finished ending, ordered by id
    #[must_use]
    pub fn active_scopes(&self) -> Vec<ScopeRecord> {
        lock(&self.inner.records).values().cloned().collect()
    }

    fn notify(&self, scope: ScopeId, event: &ScopeEvent<'_>) {
        let callbacks: Vec<ObserverFn> = lock(&self.inner.observers)
            .iter()
            .filter(|observer| observer.scope.is_none_or(|bound| bound == scope))
            .map(|observer| Arc::clone(&observer.callback))
            .collect();

        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!(scope = %scope, "Scope observer panicked");
            }
        }
    }
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ScopeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeManager")
            .field("active", &lock(&self.inner.records).len())
            .field("observers", &lock(&self.inner.observers).len())
            .finish_non_exhaustive()
    }
}
