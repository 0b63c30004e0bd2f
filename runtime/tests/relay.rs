//! Integration tests for relays between containers

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use async_trait::async_trait;
use statecraft_runtime::{
    Container, Event, EventRelay, Groups, StatusTransition, TransitionKind, UseCase,
    UseCaseContext, UseCaseRegistry,
};
use statecraft_testing::TransitionRecorder;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
struct Checkout {
    items: u32,
}

#[derive(Debug)]
struct AddItem;
impl Event for AddItem {}

#[derive(Debug)]
struct Pay;
impl Event for Pay {}

struct AddItemUseCase;

#[async_trait]
impl UseCase<Checkout> for AddItemUseCase {
    type Event = AddItem;

    async fn execute(&self, _event: &AddItem, ctx: &UseCaseContext<Checkout>) -> anyhow::Result<()> {
        let items = ctx.state().items + 1;
        ctx.emit_update(Checkout { items });
        Ok(())
    }
}

struct PayUseCase;

#[async_trait]
impl UseCase<Checkout> for PayUseCase {
    type Event = Pay;

    async fn execute(&self, _event: &Pay, ctx: &UseCaseContext<Checkout>) -> anyhow::Result<()> {
        ctx.emit_waiting(None);
        anyhow::bail!("card declined")
    }
}

/// Banner shown across screens
#[derive(Debug, Clone, Default, PartialEq)]
struct Banner {
    message: Option<String>,
    badge: u32,
}

#[derive(Debug)]
struct ShowError(String);
impl Event for ShowError {}

#[derive(Debug)]
struct SetBadge(u32);
impl Event for SetBadge {}

struct ShowErrorUseCase;

#[async_trait]
impl UseCase<Banner> for ShowErrorUseCase {
    type Event = ShowError;

    async fn execute(&self, event: &ShowError, ctx: &UseCaseContext<Banner>) -> anyhow::Result<()> {
        let mut banner = (*ctx.state()).clone();
        banner.message = Some(event.0.clone());
        ctx.emit_update(banner);
        Ok(())
    }
}

struct SetBadgeUseCase;

#[async_trait]
impl UseCase<Banner> for SetBadgeUseCase {
    type Event = SetBadge;

    async fn execute(&self, event: &SetBadge, ctx: &UseCaseContext<Banner>) -> anyhow::Result<()> {
        let mut banner = (*ctx.state()).clone();
        banner.badge = event.0;
        ctx.emit_update(banner);
        Ok(())
    }
}

fn checkout() -> Container<Checkout> {
    Container::new(
        Checkout::default(),
        UseCaseRegistry::builder()
            .stateless(|| AddItemUseCase)
            .stateless(|| PayUseCase)
            .build(),
    )
}

fn banner() -> Container<Banner> {
    Container::new(
        Banner::default(),
        UseCaseRegistry::builder()
            .stateless(|| ShowErrorUseCase)
            .stateless(|| SetBadgeUseCase)
            .build(),
    )
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_status_relay_forwards_failures_only() {
    let checkout = checkout();
    let banner = banner();
    let recorder = TransitionRecorder::attach(&banner, Groups::All);

    let _errors = EventRelay::status_relay(
        &checkout,
        &banner,
        [TransitionKind::Failure],
        |transition: &StatusTransition<Checkout>| {
            transition
                .failure()
                .map(|failure| ShowError(failure.error.to_string()))
        },
    );

    checkout.send(AddItem).unwrap().wait().await;
    checkout.send(Pay).unwrap().wait().await;

    assert!(recorder.wait_for(1, Duration::from_secs(1)).await);
    assert_eq!(recorder.len(), 1);
    assert_eq!(
        banner.read(|b| b.message.clone()),
        Some("card declined".to_string())
    );
}

#[tokio::test]
async fn test_state_relay_mirrors_item_count() {
    let checkout = checkout();
    let banner = banner();
    let recorder = TransitionRecorder::attach(&banner, Groups::All);

    let _badge = EventRelay::state_relay(&checkout, &banner, |state: &Checkout| {
        Some(SetBadge(state.items))
    });

    for _ in 0..3 {
        checkout.send(AddItem).unwrap().wait().await;
    }

    assert!(recorder.wait_for(3, Duration::from_secs(1)).await);
    let mut badges: Vec<u32> = recorder
        .states()
        .into_iter()
        .flatten()
        .map(|b| b.badge)
        .collect();
    badges.sort_unstable();
    assert_eq!(badges, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_relay_stops_when_target_closes() {
    let checkout = checkout();
    let banner = banner();

    let relay = EventRelay::state_relay(&checkout, &banner, |state: &Checkout| {
        Some(SetBadge(state.items))
    });

    banner.close(Duration::from_millis(100)).await.unwrap();
    checkout.send(AddItem).unwrap().wait().await;

    let stopped = tokio::time::timeout(Duration::from_secs(1), async {
        while !relay.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(stopped.is_ok());
}

#[tokio::test]
async fn test_dropping_handle_unsubscribes() {
    let checkout = checkout();
    let banner = banner();

    let relay = EventRelay::state_relay(&checkout, &banner, |state: &Checkout| {
        Some(SetBadge(state.items))
    });
    assert_eq!(checkout.subscriber_count(), 1);

    drop(relay);
    let released = tokio::time::timeout(Duration::from_secs(1), async {
        while checkout.subscriber_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(released.is_ok());
}
