//! Status channel.
//!
//! A single-producer, multi-consumer broadcast of [`StatusTransition`]s for
//! one container, built on `tokio::sync::broadcast`. Every receiver sees the
//! same sequence in publish order; each [`Subscription`] then filters that
//! sequence by its declared group interest.
//!
//! Publishing and subscribing are serialized by one mutex so that the
//! optional replay of the latest transition is never duplicated or missed.

use crate::error::SubscriptionError;
use crate::lock;
use futures::Stream;
use statecraft_core::{Groups, StatusTransition};
use std::sync::Mutex;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

struct ChannelState<S> {
    sender: Option<broadcast::Sender<StatusTransition<S>>>,
    latest: Option<StatusTransition<S>>,
}

/// Ordered broadcast of status transitions for one container
pub struct StatusChannel<S> {
    state: Mutex<ChannelState<S>>,
    replay_latest: bool,
}

impl<S: Send + Sync + 'static> StatusChannel<S> {
    /// Create a channel buffering `capacity` transitions per subscriber.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize, replay_latest: bool) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(ChannelState {
                sender: Some(sender),
                latest: None,
            }),
            replay_latest,
        }
    }

    /// Publish a transition to every current subscriber.
    ///
    /// Returns the number of receivers the transition was queued for
    /// (before group filtering). Publishing to a closed channel is a no-op.
    pub fn publish(&self, transition: StatusTransition<S>) -> usize {
        let mut state = lock(&self.state);
        if self.replay_latest {
            state.latest = Some(transition.clone());
        }
        match &state.sender {
            // No receivers is not an error for a broadcast
            Some(sender) => sender.send(transition).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribe with a group interest.
    ///
    /// An explicitly empty interest ([`Groups::none`]) receives nothing;
    /// such subscribers read state directly from the container.
    pub fn subscribe(&self, interest: impl Into<Groups>) -> Subscription<S> {
        let interest = interest.into();
        let state = lock(&self.state);

        let receiver = if let Some(sender) = &state.sender {
            sender.subscribe()
        } else {
            let (sender, receiver) = broadcast::channel(1);
            drop(sender);
            receiver
        };

        let replay = state
            .latest
            .as_ref()
            .filter(|transition| interest.accepts(&transition.groups))
            .cloned();

        Subscription {
            receiver,
            interest,
            replay,
        }
    }

    /// Close the channel.
    ///
    /// Subscribers drain what is already buffered, then observe
    /// [`SubscriptionError::Closed`].
    pub fn close(&self) {
        let mut state = lock(&self.state);
        if state.sender.take().is_some() {
            tracing::debug!("Status channel closed");
        }
    }

    /// Whether the channel has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.state).sender.is_none()
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.state)
            .sender
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl<S> std::fmt::Debug for StatusChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusChannel")
            .field("replay_latest", &self.replay_latest)
            .finish_non_exhaustive()
    }
}

/// A group-filtered view of a status channel.
pub struct Subscription<S> {
    receiver: broadcast::Receiver<StatusTransition<S>>,
    interest: Groups,
    replay: Option<StatusTransition<S>>,
}

impl<S: Send + Sync + 'static> Subscription<S> {
    /// Receive the next transition matching this subscription's interest.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::Lagged`] if transitions were skipped because
    ///   this subscriber fell behind; the next call resumes with the oldest
    ///   buffered transition.
    /// - [`SubscriptionError::Closed`] once the channel is closed and drained.
    pub async fn recv(&mut self) -> Result<StatusTransition<S>, SubscriptionError> {
        if let Some(transition) = self.replay.take() {
            return Ok(transition);
        }

        loop {
            match self.receiver.recv().await {
                Ok(transition) if self.interest.accepts(&transition.groups) => {
                    return Ok(transition);
                },
                Ok(_) => {},
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Status subscriber lagged");
                    return Err(SubscriptionError::Lagged(skipped));
                },
                Err(RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }

    /// Receive a matching transition if one is already buffered.
    ///
    /// # Errors
    ///
    /// Same as [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Result<Option<StatusTransition<S>>, SubscriptionError> {
        if let Some(transition) = self.replay.take() {
            return Ok(Some(transition));
        }

        loop {
            match self.receiver.try_recv() {
                Ok(transition) if self.interest.accepts(&transition.groups) => {
                    return Ok(Some(transition));
                },
                Ok(_) => {},
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(skipped)) => {
                    return Err(SubscriptionError::Lagged(skipped));
                },
                Err(TryRecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }

    /// The declared group interest
    #[must_use]
    pub const fn interest(&self) -> &Groups {
        &self.interest
    }

    /// Convert into a stream that ends when the channel closes.
    ///
    /// Lag is surfaced as an `Err` item rather than ending the stream.
    pub fn into_stream(
        mut self,
    ) -> impl Stream<Item = Result<StatusTransition<S>, SubscriptionError>> + Send {
        async_stream::stream! {
            loop {
                match self.recv().await {
                    Err(SubscriptionError::Closed) => break,
                    item => yield item,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statecraft_core::{Event, Status};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Ping;

    impl Event for Ping {}

    fn transition(sequence: u64, groups: Groups) -> StatusTransition<u32> {
        StatusTransition {
            sequence,
            status: Status::Updating,
            state: Some(Arc::new(u32::try_from(sequence).unwrap_or_default())),
            event: Arc::new(Ping),
            groups,
            intent: None,
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_same_order() {
        let channel = StatusChannel::new(16, false);
        let mut first = channel.subscribe(Groups::All);
        let mut second = channel.subscribe(Groups::All);

        for sequence in 1..=5 {
            channel.publish(transition(sequence, Groups::All));
        }

        for expected in 1..=5 {
            assert_eq!(first.recv().await.map(|t| t.sequence), Ok(expected));
            assert_eq!(second.recv().await.map(|t| t.sequence), Ok(expected));
        }
    }

    #[tokio::test]
    async fn test_group_filtering() {
        let channel = StatusChannel::new(16, false);
        let mut header = channel.subscribe(Groups::named(["header"]));
        let mut opted_out = channel.subscribe(Groups::none());

        channel.publish(transition(1, Groups::named(["footer"])));
        channel.publish(transition(2, Groups::named(["header", "footer"])));
        channel.publish(transition(3, Groups::All));

        assert_eq!(header.try_recv().map(|t| t.map(|t| t.sequence)), Ok(Some(2)));
        assert_eq!(header.try_recv().map(|t| t.map(|t| t.sequence)), Ok(Some(3)));
        assert_eq!(header.try_recv().map(|t| t.is_none()), Ok(true));
        assert_eq!(opted_out.try_recv().map(|t| t.is_none()), Ok(true));
    }

    #[tokio::test]
    async fn test_replay_latest_to_new_subscriber() {
        let channel = StatusChannel::new(16, true);
        channel.publish(transition(1, Groups::All));
        channel.publish(transition(2, Groups::All));

        let mut late = channel.subscribe(Groups::All);
        assert_eq!(late.try_recv().map(|t| t.map(|t| t.sequence)), Ok(Some(2)));
        assert_eq!(late.try_recv().map(|t| t.is_none()), Ok(true));

        channel.publish(transition(3, Groups::All));
        assert_eq!(late.recv().await.map(|t| t.sequence), Ok(3));
    }

    #[tokio::test]
    async fn test_no_replay_when_disabled() {
        let channel = StatusChannel::new(16, false);
        channel.publish(transition(1, Groups::All));

        let mut late = channel.subscribe(Groups::All);
        assert_eq!(late.try_recv().map(|t| t.is_none()), Ok(true));
    }

    #[tokio::test]
    async fn test_lag_is_reported() {
        let channel = StatusChannel::new(2, false);
        let mut slow = channel.subscribe(Groups::All);

        for sequence in 1..=5 {
            channel.publish(transition(sequence, Groups::All));
        }

        assert_eq!(slow.recv().await.map(|t| t.sequence), Err(SubscriptionError::Lagged(3)));
        assert_eq!(slow.recv().await.map(|t| t.sequence), Ok(4));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let channel = StatusChannel::new(16, false);
        let mut subscription = channel.subscribe(Groups::All);
        channel.publish(transition(1, Groups::All));
        channel.close();

        assert!(channel.is_closed());
        assert_eq!(subscription.recv().await.map(|t| t.sequence), Ok(1));
        assert_eq!(
            subscription.recv().await.map(|t| t.sequence),
            Err(SubscriptionError::Closed)
        );

        let mut after_close = channel.subscribe(Groups::All);
        assert_eq!(
            after_close.recv().await.map(|t| t.sequence),
            Err(SubscriptionError::Closed)
        );
    }

    #[tokio::test]
    async fn test_into_stream_ends_on_close() {
        use futures::StreamExt;

        let channel = StatusChannel::new(16, false);
        let stream = channel.subscribe(Groups::All).into_stream();
        channel.publish(transition(1, Groups::All));
        channel.publish(transition(2, Groups::All));
        channel.close();

        let sequences: Vec<u64> = stream
            .filter_map(|item| async move { item.ok().map(|t| t.sequence) })
            .collect()
            .await;
        assert_eq!(sequences, vec![1, 2]);
    }
}
