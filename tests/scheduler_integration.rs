//! End-to-end scheduler behavior against scripted provider fleets.

mod common;

use common::{MockCredentials, MockFactory};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard::{
    ErrorCode, ExecuteOptions, InstanceState, InstantSleeper, ManualClock, PipelineConfig,
    PipelineError, Recoverability, RouterConfig, Scheduler, SchedulerState,
};

fn router_config(pipeline_ids: &[&str]) -> RouterConfig {
    RouterConfig {
        pipelines: pipeline_ids
            .iter()
            .map(|id| PipelineConfig::new(*id, "mock"))
            .collect(),
        ..RouterConfig::default()
    }
}

async fn ready_scheduler(config: RouterConfig, factory: Arc<MockFactory>) -> Scheduler {
    let scheduler = Scheduler::builder(config, factory)
        .sleeper(Arc::new(InstantSleeper))
        .build();
    scheduler.initialize().await.unwrap();
    scheduler
}

#[tokio::test]
async fn round_robin_alternates_across_two_healthy_pipelines() {
    let factory = MockFactory::new();
    let scheduler = ready_scheduler(router_config(&["a", "b"]), factory.clone()).await;

    let mut served_by = Vec::new();
    for _ in 0..4 {
        let response = scheduler
            .execute(json!({"q": 1}), ExecuteOptions::default())
            .await
            .unwrap();
        let body = response.into_value().await.unwrap();
        served_by.push(body["served_by"].as_str().unwrap().to_string());
    }
    assert_eq!(served_by, vec!["a", "b", "a", "b"]);

    assert_eq!(factory.adapter("a").execute_calls(), 2);
    assert_eq!(factory.adapter("b").execute_calls(), 2);
    for status in scheduler.all_pipeline_statuses() {
        assert_eq!(status.request_count, 2);
        assert_eq!(status.error_count, 0);
    }

    let stats = scheduler.stats();
    assert_eq!(stats.total_requests, 4);
    assert_eq!(stats.successful_requests, 4);
    assert_eq!(stats.failed_requests, 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn transient_failures_retry_the_same_instance() {
    let factory = MockFactory::new();
    let adapter = factory.adapter("a");
    adapter.push_failure(PipelineError::new(ErrorCode::ConnectionFailed, "flake 1"));
    adapter.push_failure(PipelineError::new(ErrorCode::ConnectionFailed, "flake 2"));
    adapter.push_success(json!({"answer": 42}));

    let scheduler = ready_scheduler(router_config(&["a"]), factory.clone()).await;
    let response = scheduler
        .execute(json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(response.into_value().await.unwrap(), json!({"answer": 42}));

    assert_eq!(adapter.execute_calls(), 3);
    let status = &scheduler.all_pipeline_statuses()[0];
    assert_eq!(status.request_count, 3);
    assert_eq!(status.error_count, 2);
    assert!((status.success_rate - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(scheduler.stats().retries, 2);
    assert_eq!(scheduler.stats().successful_requests, 1);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn rate_limit_blacklists_and_fails_over() {
    let factory = MockFactory::new();
    let clock = ManualClock::new();
    factory.adapter("a").push_failure(
        PipelineError::new(ErrorCode::RateLimitExceeded, "429")
            .with_retry_after(Duration::from_millis(500)),
    );

    let scheduler = Scheduler::builder(router_config(&["a", "b"]), factory.clone())
        .sleeper(Arc::new(InstantSleeper))
        .clock(Arc::new(clock.clone()))
        .build();
    scheduler.initialize().await.unwrap();

    // First request hits "a", gets rate limited, fails over to "b".
    let body = scheduler
        .execute(json!({}), ExecuteOptions::default())
        .await
        .unwrap()
        .into_value()
        .await
        .unwrap();
    assert_eq!(body["served_by"], "b");
    assert!(scheduler.blacklist().is_blacklisted("a"));
    let entry = &scheduler.blacklist().entries()[0];
    assert!(entry.expires_at_millis - entry.inserted_at_millis >= 500);

    // While blacklisted, only "b" serves.
    let body = scheduler
        .execute(json!({}), ExecuteOptions::default())
        .await
        .unwrap()
        .into_value()
        .await
        .unwrap();
    assert_eq!(body["served_by"], "b");
    assert_eq!(factory.adapter("a").execute_calls(), 1);

    // After the window passes, "a" is selectable again.
    clock.advance(600);
    assert!(!scheduler.blacklist().is_blacklisted("a"));
    for _ in 0..2 {
        scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap();
    }
    assert!(factory.adapter("a").execute_calls() >= 2);
    assert_eq!(scheduler.stats().blacklists, 1);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn auth_failure_enters_maintenance_and_refresh_recovers() {
    let factory = MockFactory::new();
    factory
        .adapter("a")
        .push_failure(PipelineError::new(ErrorCode::AuthenticationFailed, "key expired"));
    let credentials = MockCredentials::accepting();

    let scheduler = Scheduler::builder(router_config(&["a"]), factory.clone())
        .sleeper(Arc::new(InstantSleeper))
        .credentials(credentials.clone())
        .build();
    scheduler.initialize().await.unwrap();

    let err = scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    assert_eq!(err.recoverability(), Recoverability::Recoverable);
    assert_eq!(scheduler.stats().maintenance_entries, 1);

    // The refresh runs in the background; wait for it to land.
    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
        let status = &scheduler.all_pipeline_statuses()[0];
        if !status.in_maintenance && status.state == InstanceState::Ready {
            break;
        }
        assert!(Instant::now() < deadline, "refresh never recovered the instance");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(credentials.calls(), vec!["a".to_string()]);

    // Recovered instance serves again.
    scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap();
    scheduler.shutdown().await;
}

#[tokio::test]
async fn failed_refresh_leaves_the_instance_in_maintenance() {
    let factory = MockFactory::new();
    factory
        .adapter("a")
        .push_failure(PipelineError::new(ErrorCode::AuthenticationFailed, "key expired"));
    let credentials = MockCredentials::rejecting();

    let scheduler = Scheduler::builder(router_config(&["a"]), factory.clone())
        .sleeper(Arc::new(InstantSleeper))
        .credentials(credentials.clone())
        .build();
    scheduler.initialize().await.unwrap();

    let err = scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuthenticationFailed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = &scheduler.all_pipeline_statuses()[0];
    assert!(status.in_maintenance);
    assert_eq!(status.state, InstanceState::Maintenance);
    assert_eq!(credentials.calls(), vec!["a".to_string()]);

    // Excluded from selection while in maintenance.
    let err = scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoAvailableInstance);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn per_request_timeout_is_enforced() {
    let factory = MockFactory::new();
    factory.adapter("a").set_delay(Duration::from_millis(500));

    let scheduler = ready_scheduler(router_config(&["a"]), factory.clone()).await;
    let started = Instant::now();
    let err = scheduler
        .execute(
            json!({}),
            ExecuteOptions::default()
                .with_timeout(Duration::from_millis(100))
                .with_max_retries(0),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout());
    assert_eq!(err.code(), ErrorCode::ExecutionTimeout);
    assert!(elapsed >= Duration::from_millis(95));
    assert!(elapsed < Duration::from_millis(400), "timed out in {:?}", elapsed);

    let status = &scheduler.all_pipeline_statuses()[0];
    assert!(status.average_response_time_ms > 0.0);
    assert_eq!(
        scheduler.balancer().current_connections(status.instance_id),
        0,
        "connection accounting must balance after a timeout"
    );
    scheduler.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_inflight_and_destroys_the_fleet() {
    let factory = MockFactory::new();
    factory.adapter("a").set_delay(Duration::from_millis(200));

    let scheduler = Arc::new(ready_scheduler(router_config(&["a"]), factory.clone()).await);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let scheduler = scheduler.clone();
        handles.push(tokio::spawn(async move {
            scheduler.execute(json!({}), ExecuteOptions::default()).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    scheduler.shutdown().await;
    assert_eq!(scheduler.state(), SchedulerState::Shutdown);

    // All five inflight requests completed.
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert!(factory.adapter("a").was_destroyed());
    assert!(scheduler.all_pipeline_statuses().is_empty());

    // New work is refused fast.
    let err = scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SchedulerNotReady);
}

#[tokio::test]
async fn requests_are_rejected_during_shutdown() {
    let factory = MockFactory::new();
    factory.adapter("a").set_delay(Duration::from_millis(200));
    let scheduler = Arc::new(ready_scheduler(router_config(&["a"]), factory.clone()).await);

    let inflight = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.execute(json!({}), ExecuteOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let shutter = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SchedulerNotReady);

    assert!(inflight.await.unwrap().is_ok());
    shutter.await.unwrap();
}

#[tokio::test]
async fn admission_control_rejects_when_saturated() {
    let factory = MockFactory::new();
    factory.adapter("a").set_delay(Duration::from_millis(200));
    let mut config = router_config(&["a"]);
    config.scheduler.max_concurrent_requests = 2;

    let scheduler = Arc::new(ready_scheduler(config, factory.clone()).await);
    let mut holders = Vec::new();
    for _ in 0..2 {
        let scheduler = scheduler.clone();
        holders.push(tokio::spawn(async move {
            scheduler.execute(json!({}), ExecuteOptions::default()).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SchedulerOverloaded);

    for holder in holders {
        assert!(holder.await.unwrap().is_ok());
    }
    scheduler.shutdown().await;
}

#[tokio::test]
async fn empty_candidate_set_fails_fast_without_spinning() {
    let factory = MockFactory::new();
    let scheduler = ready_scheduler(router_config(&["a"]), factory.clone()).await;
    scheduler.disable_pipeline("a").unwrap();

    let err = scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoAvailableInstance);
    assert_eq!(factory.adapter("a").execute_calls(), 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn retry_budget_bounds_total_attempts() {
    let factory = MockFactory::new();
    let adapter = factory.adapter("a");
    for n in 0..10 {
        adapter.push_failure(PipelineError::new(
            ErrorCode::ConnectionFailed,
            format!("flake {}", n),
        ));
    }

    let mut config = router_config(&["a"]);
    config.scheduler.max_retries = 2;
    let scheduler = ready_scheduler(config, factory.clone()).await;

    let err = scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectionFailed);
    assert!(adapter.execute_calls() <= 3, "budget is max_retries + 1 attempts");
    scheduler.shutdown().await;
}

#[tokio::test]
async fn request_class_restricts_candidates() {
    let factory = MockFactory::new();
    let scheduler = ready_scheduler(router_config(&["a", "b"]), factory.clone()).await;

    for _ in 0..3 {
        let body = scheduler
            .execute(json!({}), ExecuteOptions::default().with_request_class("b"))
            .await
            .unwrap()
            .into_value()
            .await
            .unwrap();
        assert_eq!(body["served_by"], "b");
    }
    assert_eq!(factory.adapter("a").execute_calls(), 0);

    let err = scheduler
        .execute(json!({}), ExecuteOptions::default().with_request_class("ghost"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoAvailableInstance);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn failed_initialization_excludes_the_pipeline() {
    let factory = MockFactory::new();
    factory.adapter("bad").fail_initialization();

    let scheduler = ready_scheduler(router_config(&["good", "bad"]), factory.clone()).await;
    let statuses = scheduler.all_pipeline_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].pipeline_id, "good");
    assert!(factory.adapter("bad").was_destroyed());

    scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap();
    scheduler.shutdown().await;
}

#[tokio::test]
async fn fatal_error_moves_the_scheduler_to_shutting_down() {
    let factory = MockFactory::new();
    factory
        .adapter("a")
        .push_failure(PipelineError::new(ErrorCode::InternalFailure, "corrupt state"));

    let scheduler = ready_scheduler(router_config(&["a"]), factory.clone()).await;
    let err = scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(scheduler.state(), SchedulerState::ShuttingDown);

    let err = scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SchedulerNotReady);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn pipelines_can_be_created_and_destroyed_under_traffic() {
    let factory = MockFactory::new();
    let scheduler = ready_scheduler(router_config(&["a"]), factory.clone()).await;

    scheduler.create_pipeline(PipelineConfig::new("b", "mock")).await.unwrap();
    let body = scheduler
        .execute(json!({}), ExecuteOptions::default().with_request_class("b"))
        .await
        .unwrap()
        .into_value()
        .await
        .unwrap();
    assert_eq!(body["served_by"], "b");

    // Duplicate ids are refused.
    let err = scheduler.create_pipeline(PipelineConfig::new("b", "mock")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);

    scheduler.destroy_pipeline("b").await.unwrap();
    assert!(factory.adapter("b").was_destroyed());
    let err = scheduler
        .execute(json!({}), ExecuteOptions::default().with_request_class("b"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoAvailableInstance);

    // "a" is untouched throughout.
    scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap();
    scheduler.shutdown().await;
}

#[tokio::test]
async fn enable_disable_round_trip_restores_the_instance() {
    let factory = MockFactory::new();
    let scheduler = ready_scheduler(router_config(&["a"]), factory.clone()).await;

    let before = &scheduler.all_pipeline_statuses()[0];
    let (state, health) = (before.state, before.health);

    scheduler.enable_pipeline("a").unwrap();
    scheduler.disable_pipeline("a").unwrap();
    scheduler.enable_pipeline("a").unwrap();

    let after = &scheduler.all_pipeline_statuses()[0];
    assert_eq!(after.state, state);
    assert_eq!(after.health, health);

    assert!(scheduler.enable_pipeline("ghost").is_err());
    scheduler.shutdown().await;
}

#[tokio::test]
async fn maintenance_round_trip_restores_ready() {
    let factory = MockFactory::new();
    let scheduler = ready_scheduler(router_config(&["a"]), factory.clone()).await;

    scheduler.set_pipeline_maintenance("a", true).unwrap();
    assert!(!scheduler.health_check());
    assert_eq!(scheduler.all_pipeline_statuses()[0].state, InstanceState::Maintenance);

    scheduler.set_pipeline_maintenance("a", false).unwrap();
    assert!(scheduler.health_check());
    assert_eq!(scheduler.all_pipeline_statuses()[0].state, InstanceState::Ready);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn trace_events_reach_the_debug_sink() {
    use switchyard::telemetry::{MemorySink, TraceEvent};

    let factory = MockFactory::new();
    let sink = MemorySink::new();
    let scheduler = Scheduler::builder(router_config(&["a"]), factory.clone())
        .sleeper(Arc::new(InstantSleeper))
        .sink(sink.clone())
        .build();
    scheduler.initialize().await.unwrap();

    scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap();

    // The sink is fed asynchronously.
    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
        let events = sink.events();
        let admitted = events.iter().any(|e| matches!(e, TraceEvent::Admitted { .. }));
        let completed = events
            .iter()
            .any(|e| matches!(e, TraceEvent::Completed { success: true, .. }));
        if admitted && completed {
            break;
        }
        assert!(Instant::now() < deadline, "sink never saw the request");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    scheduler.shutdown().await;
}

#[tokio::test]
async fn failure_streak_trips_the_circuit_breaker() {
    let factory = MockFactory::new();
    let adapter = factory.adapter("a");
    for n in 0..5 {
        adapter.push_failure(PipelineError::new(
            ErrorCode::ConnectionFailed,
            format!("down {}", n),
        ));
    }

    let mut config = router_config(&["a"]);
    config.balancer.circuit_breaker.failure_threshold = 2;
    config.balancer.circuit_breaker.request_volume_threshold = 1;
    let scheduler = ready_scheduler(config, factory.clone()).await;

    let err = scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectionFailed);
    assert!(
        scheduler.blacklist().is_blacklisted("a"),
        "two consecutive failures should have tripped the breaker"
    );
    scheduler.shutdown().await;
}

#[tokio::test]
async fn cancelled_requests_release_their_bookkeeping() {
    let factory = MockFactory::new();
    factory.adapter("a").set_delay(Duration::from_millis(500));
    let scheduler = Arc::new(ready_scheduler(router_config(&["a"]), factory.clone()).await);

    let task = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.execute(json!({}), ExecuteOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.stats().active_executions, 1);

    task.abort();
    let _ = task.await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(scheduler.stats().active_executions, 0);
    let status = &scheduler.all_pipeline_statuses()[0];
    assert_eq!(scheduler.balancer().current_connections(status.instance_id), 0);

    // The instance keeps serving new requests.
    factory.adapter("a").set_delay(Duration::ZERO);
    scheduler.execute(json!({}), ExecuteOptions::default()).await.unwrap();
    scheduler.shutdown().await;
}

#[tokio::test]
async fn two_schedulers_do_not_share_state() {
    let factory_one = MockFactory::new();
    let factory_two = MockFactory::new();
    let one = ready_scheduler(router_config(&["a"]), factory_one.clone()).await;
    let two = ready_scheduler(router_config(&["a"]), factory_two.clone()).await;

    one.execute(json!({}), ExecuteOptions::default()).await.unwrap();
    assert_eq!(one.stats().total_requests, 1);
    assert_eq!(two.stats().total_requests, 0);
    assert_eq!(factory_two.adapter("a").execute_calls(), 0);

    one.shutdown().await;
    // The second scheduler is unaffected by the first's shutdown.
    two.execute(json!({}), ExecuteOptions::default()).await.unwrap();
    two.shutdown().await;
}
