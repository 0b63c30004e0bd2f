//! Integration tests for request coalescing
//!
//! Concurrent callers with the same canonical key must share one execution
//! and one result, including from inside use cases.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use async_trait::async_trait;
use statecraft_runtime::{
    CoalesceError, Container, Event, Groups, RequestCoalescer, RequestKey, UseCase,
    UseCaseContext, UseCaseRegistry,
};
use statecraft_testing::{TransitionRecorder, test_clock};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Forecast {
    city: String,
    celsius: i32,
}

/// Stand-in for a network call that counts its invocations
#[derive(Clone, Default)]
struct WeatherApi {
    calls: Arc<AtomicUsize>,
}

impl WeatherApi {
    async fn fetch_weather(&self, city: &str) -> anyhow::Result<Forecast> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Forecast {
            city: city.to_string(),
            celsius: 21,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn weather_key(city: &str) -> RequestKey {
    RequestKey::new("get", "/weather").with_param("city", city)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_weather_key_canonical_form() {
    let key = weather_key("NYC");
    assert_eq!(key.canonical(), "GET:/weather?city=NYC");
    assert_eq!("GET:/weather?city=NYC".parse::<RequestKey>(), Ok(key));
}

#[tokio::test]
async fn test_two_callers_share_one_fetch() {
    let api = WeatherApi::default();
    let coalescer = RequestCoalescer::<Forecast>::new();
    let key = weather_key("NYC");

    let first = {
        let api = api.clone();
        coalescer.coalesce(&key, move || async move { api.fetch_weather("NYC").await })
    };
    let second = {
        let api = api.clone();
        coalescer.coalesce(&key, move || async move { api.fetch_weather("NYC").await })
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(api.calls(), 1);
    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(coalescer.inflight_count(), 0);
}

#[tokio::test]
async fn test_many_callers_share_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let coalescer = RequestCoalescer::<Forecast>::new();
    let key = weather_key("Atlantis");

    let callers = (0..8).map(|_| {
        let calls = Arc::clone(&calls);
        let coalescer = coalescer.clone();
        let key = key.clone();
        tokio::spawn(async move {
            coalescer
                .coalesce(&key, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    anyhow::bail!("city not found")
                })
                .await
        })
    });
    let results = futures::future::join_all(callers).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let causes: Vec<_> = results
        .into_iter()
        .map(|result| match result.unwrap() {
            Err(CoalesceError::Failed { key, cause }) => {
                assert_eq!(key, "GET:/weather?city=Atlantis");
                cause
            },
            other => panic!("expected shared failure, got {other:?}"),
        })
        .collect();
    assert!(causes.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
}

#[tokio::test]
async fn test_call_after_settle_runs_again() {
    let api = WeatherApi::default();
    let coalescer = RequestCoalescer::<Forecast>::new();
    let key = weather_key("NYC");

    for _ in 0..2 {
        let api = api.clone();
        coalescer
            .coalesce(&key, move || async move { api.fetch_weather("NYC").await })
            .await
            .unwrap();
    }

    assert_eq!(api.calls(), 2);
}

#[tokio::test]
async fn test_different_keys_do_not_coalesce() {
    let api = WeatherApi::default();
    let coalescer = RequestCoalescer::<Forecast>::new();
    let nyc = weather_key("NYC");
    let paris = weather_key("Paris");

    let (a, b) = tokio::join!(
        {
            let api = api.clone();
            coalescer.coalesce(&nyc, move || async move { api.fetch_weather("NYC").await })
        },
        {
            let api = api.clone();
            coalescer.coalesce(&paris, move || async move { api.fetch_weather("Paris").await })
        },
    );

    assert_eq!(api.calls(), 2);
    assert_eq!(a.unwrap().city, "NYC");
    assert_eq!(b.unwrap().city, "Paris");
}

#[tokio::test]
async fn test_inflight_snapshot_uses_injected_clock() {
    let clock = test_clock();
    let coalescer = RequestCoalescer::<u32>::with_clock(Arc::new(clock.clone()));
    let key = weather_key("NYC");
    let (release, gate) = tokio::sync::oneshot::channel::<()>();

    let waiting = {
        let coalescer = coalescer.clone();
        let key = key.clone();
        tokio::spawn(async move {
            coalescer
                .coalesce(&key, move || async move {
                    let _ = gate.await;
                    Ok(1)
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let inflight = coalescer.inflight();
    assert_eq!(inflight.len(), 1);
    assert_eq!(inflight[0].key, "GET:/weather?city=NYC");
    assert_eq!(
        inflight[0].started_at,
        statecraft_core::environment::Clock::now(&clock)
    );

    let _ = release.send(());
    assert_eq!(waiting.await.unwrap().unwrap(), 1);
    assert!(!coalescer.is_inflight(&key));
}

// ============================================================================
// Coalescing from use cases
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
struct WeatherState {
    forecast: Option<Forecast>,
}

#[derive(Debug)]
struct LoadWeather {
    city: &'static str,
}
impl Event for LoadWeather {}

struct LoadWeatherUseCase {
    api: WeatherApi,
    coalescer: RequestCoalescer<Forecast>,
}

#[async_trait]
impl UseCase<WeatherState> for LoadWeatherUseCase {
    type Event = LoadWeather;

    async fn execute(
        &self,
        event: &LoadWeather,
        ctx: &UseCaseContext<WeatherState>,
    ) -> anyhow::Result<()> {
        ctx.emit_waiting(None);
        let api = self.api.clone();
        let city = event.city;
        let forecast = self
            .coalescer
            .coalesce(&weather_key(city), move || async move {
                api.fetch_weather(city).await
            })
            .await?;
        ctx.emit_update(WeatherState {
            forecast: Some(forecast),
        });
        Ok(())
    }
}

#[tokio::test]
async fn test_use_cases_coalesce_through_shared_coalescer() {
    let api = WeatherApi::default();
    let coalescer = RequestCoalescer::new();

    let registry = {
        let api = api.clone();
        let coalescer = coalescer.clone();
        UseCaseRegistry::builder()
            .stateless(move || LoadWeatherUseCase {
                api: api.clone(),
                coalescer: coalescer.clone(),
            })
            .build()
    };
    let screen_a = Container::new(WeatherState::default(), registry);

    let registry = {
        let api = api.clone();
        let coalescer = coalescer.clone();
        UseCaseRegistry::builder()
            .stateless(move || LoadWeatherUseCase {
                api: api.clone(),
                coalescer: coalescer.clone(),
            })
            .build()
    };
    let screen_b = Container::new(WeatherState::default(), registry);
    let recorder = TransitionRecorder::attach(&screen_b, Groups::All);

    let a = screen_a.send(LoadWeather { city: "NYC" }).unwrap();
    let b = screen_b.send(LoadWeather { city: "NYC" }).unwrap();
    assert!(a.wait().await.is_completed());
    assert!(b.wait().await.is_completed());

    assert_eq!(api.calls(), 1);
    assert_eq!(screen_a.state(), screen_b.state());
    assert!(recorder.wait_for(2, Duration::from_secs(1)).await);
    assert_eq!(
        screen_b.read(|s| s.forecast.as_ref().map(|f| f.celsius)),
        Some(21)
    );
}
