// tests/ingestion_actor.rs
//
// IngestionActor lifecycle: initialize, polling timer, webhooks, deactivate.
// Timer tests run on paused tokio time so tick counts are deterministic.

mod common;

use std::time::Duration;

use common::{context, polled, webhook_only, MockAdapter};
use fire_ingest_pipeline::error::{AdapterError, IngestError};
use fire_ingest_pipeline::ingest::actor::{IngestionActor, WebhookOutcome};
use fire_ingest_pipeline::ingest::adapters::AdapterCatalog;
use fire_ingest_pipeline::ingest::resilient::CircuitState;
use fire_ingest_pipeline::ingest::types::{ActorState, ExternalSourceConfig, IngestionStatus, SourceType};

#[tokio::test(start_paused = true)]
async fn start_polling_twice_keeps_a_single_timer() {
    let mock = MockAdapter::ok();
    let (ctx, _hub) = context(mock.clone());
    let actor = IngestionActor::spawn("p1", ctx);
    actor.initialize(polled("p1", Duration::from_millis(100))).await.unwrap();

    assert!(actor.start_polling().await.unwrap());
    assert!(!actor.start_polling().await.unwrap(), "second start is a no-op");

    // ticks at 0, 100, 200, 300
    tokio::time::sleep(Duration::from_millis(350)).await;
    let calls = mock.calls();
    assert!((3..=5).contains(&calls), "one timer expected, saw {calls} fetches");

    let status = actor.get_status().await.unwrap();
    assert!(status.is_polling);
    assert_eq!(status.state, ActorState::Polling);
    assert_eq!(status.total_fetches as usize, calls);
    assert!(status.next_fetch_time.is_some());
}

#[tokio::test(start_paused = true)]
async fn stop_polling_cancels_the_timer() {
    let mock = MockAdapter::ok();
    let (ctx, _hub) = context(mock.clone());
    let actor = IngestionActor::spawn("p2", ctx);
    actor.initialize(polled("p2", Duration::from_millis(100))).await.unwrap();
    actor.start_polling().await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(actor.stop_polling().await.unwrap());
    let after_stop = mock.calls();

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(mock.calls(), after_stop, "no fetch after stop");
    assert!(!actor.stop_polling().await.unwrap(), "second stop is a no-op");

    let status = actor.get_status().await.unwrap();
    assert!(!status.is_polling);
    assert!(status.next_fetch_time.is_none());
}

#[tokio::test(start_paused = true)]
async fn slow_fetches_do_not_queue_up_ahead_of_stop() {
    // every fetch takes three polling intervals
    let mock = MockAdapter::slow(Vec::new(), Duration::from_millis(300));
    let (ctx, _hub) = context(mock.clone());
    let actor = IngestionActor::spawn("p4", ctx);
    actor.initialize(polled("p4", Duration::from_millis(100))).await.unwrap();
    actor.start_polling().await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    let before_stop = mock.calls();
    assert!(before_stop <= 11, "one cycle per fetch duration, saw {before_stop}");

    let asked = tokio::time::Instant::now();
    assert!(actor.stop_polling().await.unwrap());
    let waited = asked.elapsed();
    assert!(waited < Duration::from_millis(400), "stop waited {waited:?}");
    assert!(mock.calls() <= before_stop + 1, "only the in-flight cycle may finish");

    let after_stop = mock.calls();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(mock.calls(), after_stop, "no fetch after stop");
}

#[tokio::test(start_paused = true)]
async fn polling_continues_through_failures_and_an_open_breaker() {
    let mock = MockAdapter::failing();
    let (mut ctx, _hub) = context(mock.clone());
    ctx.policy.open_duration = Duration::from_secs(3600);
    let actor = IngestionActor::spawn("f2", ctx);
    actor.initialize(polled("f2", Duration::from_millis(100))).await.unwrap();
    actor.start_polling().await.unwrap();

    // ticks at 0..=400; the third failure opens the breaker
    tokio::time::sleep(Duration::from_millis(450)).await;
    let first = actor.get_status().await.unwrap();
    assert_eq!(first.circuit, CircuitState::Open);
    assert_eq!(mock.calls(), 3);
    assert!(first.is_polling);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let later = actor.get_status().await.unwrap();
    assert!(later.is_polling);
    assert_eq!(later.state, ActorState::Polling);
    assert!(
        later.total_fetches >= first.total_fetches + 4,
        "timer kept firing: {} -> {}",
        first.total_fetches,
        later.total_fetches
    );
    assert_eq!(later.failed_fetches, later.total_fetches);
    assert_eq!(mock.calls(), 3, "open breaker keeps upstream untouched");
}

#[tokio::test(start_paused = true)]
async fn deactivate_releases_the_timer_and_the_actor() {
    let mock = MockAdapter::ok();
    let (ctx, _hub) = context(mock.clone());
    let actor = IngestionActor::spawn("p3", ctx);
    actor.initialize(polled("p3", Duration::from_millis(100))).await.unwrap();
    actor.start_polling().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    actor.deactivate().await.unwrap();
    let after = mock.calls();
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(mock.calls(), after);
    assert!(!actor.is_alive());
    assert!(matches!(
        actor.get_status().await,
        Err(IngestError::ActorUnavailable(_))
    ));
}

#[tokio::test]
async fn webhook_only_and_inactive_sources_never_poll() {
    let mock = MockAdapter::ok();
    let (ctx, _hub) = context(mock.clone());

    let hook = IngestionActor::spawn("h1", ctx.clone());
    hook.initialize(webhook_only("h1", SourceType::Seismic)).await.unwrap();
    assert!(!hook.start_polling().await.unwrap());

    let mut cfg = polled("i1", Duration::from_millis(10));
    cfg.is_active = false;
    let inactive = IngestionActor::spawn("i1", ctx);
    inactive.initialize(cfg).await.unwrap();
    assert!(!inactive.start_polling().await.unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn webhook_outcomes_cover_accept_empty_and_failure() {
    let (ctx, _hub) = context(MockAdapter::ok());
    let actor = IngestionActor::spawn("w1", ctx);

    // before initialize: reported, not raised
    assert!(matches!(
        actor.process_webhook(r#"{"latitude": 1.0}"#).await,
        WebhookOutcome::Failed { .. }
    ));

    actor.initialize(webhook_only("w1", SourceType::UserReport)).await.unwrap();
    let accepted = actor
        .process_webhook(r#"{"latitude": 35.1, "longitude": -118.2, "description": "smoke"}"#)
        .await;
    assert!(matches!(accepted, WebhookOutcome::Accepted { .. }), "got {accepted:?}");
    assert_eq!(actor.process_webhook("{}").await, WebhookOutcome::Empty);
    assert!(matches!(
        actor.process_webhook("[1, 2, 3]").await,
        WebhookOutcome::Failed { .. }
    ));

    let status = actor.get_status().await.unwrap();
    assert_eq!(status.total_fetches, 4);
    assert_eq!(status.successful_fetches, 2);
    assert_eq!(status.failed_fetches, 2);
    assert_eq!(status.records_published, 1);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn published_records_carry_status_and_township() {
    let (ctx, hub) = context(MockAdapter::ok());
    let mut streams = hub.subscribe_all().unwrap();
    let actor = IngestionActor::spawn("t1", ctx);
    let cfg = polled("t1", Duration::from_secs(3600)).with_param("township", "Ridgecrest");
    actor.initialize(cfg).await.unwrap();

    let result = actor.trigger_fetch().await.unwrap();
    assert!(result.success);
    assert_eq!(result.records_processed, 1);

    let rec = tokio::time::timeout(Duration::from_secs(1), streams.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rec.source_id, "t1");
    assert_eq!(rec.source_type, SourceType::SatelliteFire);
    assert_eq!(rec.status, IngestionStatus::InProgress);
    assert_eq!(rec.metadata.get("township").map(String::as_str), Some("Ridgecrest"));
}

#[tokio::test]
async fn failed_fetch_is_reported_and_counted() {
    let mock = MockAdapter::failing();
    let (ctx, _hub) = context(mock.clone());
    let actor = IngestionActor::spawn("f1", ctx);
    actor.initialize(polled("f1", Duration::from_secs(3600))).await.unwrap();

    let result = actor.trigger_fetch().await.unwrap();
    assert!(!result.success);
    assert!(result.error.is_some());
    let status = actor.get_status().await.unwrap();
    assert_eq!(status.failed_fetches, 1);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn initialize_rules() {
    let (ctx, _hub) = context(MockAdapter::ok());
    let actor = IngestionActor::spawn("r1", ctx);

    assert!(matches!(
        actor.trigger_fetch().await,
        Err(IngestError::NotInitialized(_))
    ));
    assert!(matches!(
        actor.start_polling().await,
        Err(IngestError::NotInitialized(_))
    ));
    assert!(matches!(
        actor.initialize(polled("other", Duration::from_secs(1))).await,
        Err(IngestError::InvalidConfig(_))
    ));

    let first = polled("r1", Duration::from_secs(60));
    actor.initialize(first.clone()).await.unwrap();
    actor.initialize(first).await.expect("same config is idempotent");

    let changed = polled("r1", Duration::from_secs(30));
    assert!(matches!(
        actor.initialize(changed.clone()).await,
        Err(IngestError::AlreadyInitialized(_))
    ));
    actor.stop_polling().await.unwrap();
    actor.initialize(changed).await.expect("re-init allowed after stop");
}

#[tokio::test]
async fn missing_api_key_fails_at_initialize_without_network() {
    let hub = fire_ingest_pipeline::stream::StreamHub::new(8, Duration::from_millis(50));
    let ctx = fire_ingest_pipeline::ingest::actor::IngestionContext {
        catalog: AdapterCatalog::http(reqwest::Client::new()),
        hub,
        policy: common::fast_policy(),
        mailbox_capacity: 8,
    };
    let actor = IngestionActor::spawn("firms", ctx);
    let cfg = ExternalSourceConfig::new("firms", "FIRMS", SourceType::SatelliteFire)
        .with_interval(Duration::from_secs(600));
    let err = actor.initialize(cfg).await.unwrap_err();
    assert!(matches!(err, IngestError::Adapter(AdapterError::Config(_))), "got {err:?}");
}
