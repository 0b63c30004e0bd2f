//! Capture the transitions a container publishes.

use statecraft_core::{Groups, StatusTransition, TransitionKind};
use statecraft_runtime::{Container, ContainerState, SubscriptionError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Records every transition received by one subscription.
///
/// Recording runs on a background task until the container's channel closes
/// or the recorder is dropped.
///
/// # Example
///
/// ```ignore
/// let recorder = TransitionRecorder::attach(&container, Groups::All);
/// container.send(Increment)?;
/// assert!(recorder.wait_for(1, Duration::from_secs(1)).await);
/// assert_eq!(recorder.kinds(), vec![TransitionKind::Updating]);
/// ```
pub struct TransitionRecorder<S> {
    transitions: Arc<Mutex<Vec<StatusTransition<S>>>>,
    count: watch::Receiver<usize>,
    task: JoinHandle<()>,
}

impl<S: ContainerState> TransitionRecorder<S> {
    /// Subscribe to `container` and start recording
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn attach(container: &Container<S>, groups: impl Into<Groups>) -> Self {
        let mut subscription = container.subscribe(groups);
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let (count_tx, count) = watch::channel(0);

        let recorded = Arc::clone(&transitions);
        let task = tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(transition) => {
                        let len = {
                            let mut recorded = lock(&recorded);
                            recorded.push(transition);
                            recorded.len()
                        };
                        count_tx.send_replace(len);
                    },
                    Err(SubscriptionError::Lagged(_)) => {},
                    Err(SubscriptionError::Closed) => break,
                }
            }
        });

        Self {
            transitions,
            count,
            task,
        }
    }
}

impl<S> TransitionRecorder<S> {
    /// Wait until at least `count` transitions were recorded.
    ///
    /// Returns `false` on timeout or if the channel closed first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let mut recorded = self.count.clone();
        matches!(
            tokio::time::timeout(timeout, recorded.wait_for(|n| *n >= count)).await,
            Ok(Ok(_))
        )
    }

    /// Copy of everything recorded so far
    #[must_use]
    pub fn transitions(&self) -> Vec<StatusTransition<S>> {
        lock(&self.transitions).clone()
    }

    /// Kinds of the recorded transitions, in order
    #[must_use]
    pub fn kinds(&self) -> Vec<TransitionKind> {
        lock(&self.transitions)
            .iter()
            .map(StatusTransition::kind)
            .collect()
    }

    /// Sequence numbers of the recorded transitions, in order
    #[must_use]
    pub fn sequences(&self) -> Vec<u64> {
        lock(&self.transitions)
            .iter()
            .map(|transition| transition.sequence)
            .collect()
    }

    /// States carried by the recorded transitions, in order
    #[must_use]
    pub fn states(&self) -> Vec<Option<Arc<S>>> {
        lock(&self.transitions)
            .iter()
            .map(|transition| transition.state.clone())
            .collect()
    }

    /// Number of recorded transitions
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.transitions).len()
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.transitions).is_empty()
    }

    /// Whether the recording task has ended
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl<S> Drop for TransitionRecorder<S> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<S> std::fmt::Debug for TransitionRecorder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionRecorder")
            .field("recorded", &self.len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
