//! Tests for the use case harness and transition recorder

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use async_trait::async_trait;
use statecraft_core::{Event, Groups, TransitionKind};
use statecraft_runtime::{Container, UseCase, UseCaseContext, UseCaseRegistry};
use statecraft_testing::{TransitionRecorder, UseCaseTest};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
struct Profile {
    name: String,
    loading: bool,
}

#[derive(Debug)]
struct Rename(&'static str);
impl Event for Rename {}

struct RenameUseCase;

#[async_trait]
impl UseCase<Profile> for RenameUseCase {
    type Event = Rename;

    async fn execute(&self, event: &Rename, ctx: &UseCaseContext<Profile>) -> anyhow::Result<()> {
        ctx.emit_waiting(Some(Profile {
            name: ctx.state().name.clone(),
            loading: true,
        }));
        if event.0.is_empty() {
            anyhow::bail!("name must not be empty");
        }
        ctx.emit_update(Profile {
            name: event.0.to_string(),
            loading: false,
        });
        Ok(())
    }
}

fn registry() -> UseCaseRegistry<Profile> {
    UseCaseRegistry::builder().stateless(|| RenameUseCase).build()
}

#[tokio::test]
async fn test_harness_success_path() {
    UseCaseTest::new(registry())
        .given_state(Profile::default())
        .when_event(Rename("ada"))
        .then_kinds([TransitionKind::Waiting, TransitionKind::Updating])
        .then_transitions(|transitions| {
            assert!(transitions[0].state().is_some_and(|p| p.loading));
            assert_eq!(transitions[1].sequence, 2);
        })
        .then_state(|profile| {
            assert_eq!(profile.name, "ada");
            assert!(!profile.loading);
        })
        .then_outcome(|outcome| assert!(outcome.is_completed()))
        .run()
        .await;
}

#[tokio::test]
async fn test_harness_failure_path() {
    UseCaseTest::new(registry())
        .given_state(Profile {
            name: "grace".to_string(),
            loading: false,
        })
        .when_event(Rename(""))
        .then_kinds([TransitionKind::Waiting, TransitionKind::Failure])
        .then_state(|profile| {
            // Waiting carried a state, so loading stays set
            assert_eq!(profile.name, "grace");
            assert!(profile.loading);
        })
        .then_outcome(|outcome| {
            let failure = outcome.failure().unwrap();
            assert_eq!(failure.error.to_string(), "name must not be empty");
        })
        .run()
        .await;
}

#[tokio::test]
async fn test_recorder_captures_in_order() {
    let container = Container::new(Profile::default(), registry());
    let recorder = TransitionRecorder::attach(&container, Groups::All);
    assert!(recorder.is_empty());

    container.send(Rename("ada")).unwrap().wait().await;
    container.send(Rename("lin")).unwrap().wait().await;

    assert!(recorder.wait_for(4, Duration::from_secs(1)).await);
    assert_eq!(recorder.sequences(), vec![1, 2, 3, 4]);
    assert_eq!(
        recorder.kinds(),
        vec![
            TransitionKind::Waiting,
            TransitionKind::Updating,
            TransitionKind::Waiting,
            TransitionKind::Updating,
        ]
    );
}

#[tokio::test]
async fn test_recorder_stops_when_container_closes() {
    let container = Container::new(Profile::default(), registry());
    let recorder = TransitionRecorder::attach(&container, Groups::All);

    container.close(Duration::from_millis(100)).await.unwrap();

    assert!(!recorder.wait_for(1, Duration::from_millis(200)).await);
    assert!(recorder.is_closed());
}
