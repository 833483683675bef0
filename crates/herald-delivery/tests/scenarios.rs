//! End-to-end delivery scenarios: batching, permanent failure, the outbound
//! rate ceiling and the background scheduler loop.

mod common;

use std::time::Duration;

use common::{config_with_retries, TestEnv};
use herald_core::models::NotificationStatus;
use herald_delivery::{
    rate_limit::RateLimitConfig,
    scheduler::{SchedulerConfig, TickOutcome},
    transport::mock::MockBehavior,
    DeliveryError, ServiceConfig,
};

#[tokio::test]
async fn three_records_are_sent_in_one_tick() {
    let env = TestEnv::new();
    let mut ids = Vec::new();
    for (channel, text) in [(1, "deposit received"), (2, "bet settled"), (3, "withdrawal sent")] {
        ids.push(env.service.send_to_channel(channel, text, None, None).await.unwrap());
    }

    let TickOutcome::Processed(report) = env.tick().await else {
        panic!("expected a processed batch");
    };
    assert_eq!(report.taken, 3);
    assert_eq!(report.sent, 3);

    for id in &ids {
        assert_eq!(env.status(*id).await, NotificationStatus::Sent);
    }
    let calls = env.transport.calls().await;
    let order = calls.iter().map(|call| call.notification_id).collect::<Vec<_>>();
    assert_eq!(order, ids);

    let stats = env.service.stats().await;
    assert_eq!(stats.total_sent, 3);
    assert_eq!(stats.total_queued, 3);
    assert_eq!(stats.queue_size, 0);
    assert_eq!(stats.batches_processed, 1);
}

#[tokio::test]
async fn always_failing_record_fails_after_its_attempt_limit() {
    let env = TestEnv::with_behavior(
        config_with_retries(2),
        MockBehavior::Fail(DeliveryError::network("connection refused")),
    );
    let id = env.service.send_to_channel(9, "bonus credited", None, None).await.unwrap();

    env.tick().await;
    assert_eq!(env.status(id).await, NotificationStatus::Pending);

    env.advance(Duration::from_secs(5));
    env.tick().await;

    let record = env.record(id).await;
    assert_eq!(record.status, NotificationStatus::Failed);
    assert_eq!(record.metadata.retry_count, 2);
    assert!(record.metadata.last_error.unwrap().contains("connection refused"));

    let stats = env.service.stats().await;
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.total_retries, 1);
    assert_eq!(stats.total_sent, 0);
}

#[tokio::test]
async fn thirty_first_send_waits_for_the_next_minute() {
    let env = TestEnv::with_config(ServiceConfig {
        rate_limit: RateLimitConfig { per_minute: 30, ..RateLimitConfig::default() },
        ..ServiceConfig::default()
    });
    for channel in 0..31 {
        env.service.send_to_channel(channel, "odds changed", None, None).await.unwrap();
    }

    env.tick_until_idle(10).await;

    let calls = env.transport.calls().await;
    assert_eq!(calls.len(), 31);
    let first = calls[0].at;
    assert!(calls[..30].iter().all(|call| call.at == first));
    assert!(calls[30].at - first >= chrono::Duration::seconds(60));
    assert_eq!(env.service.stats().await.total_sent, 31);
}

#[tokio::test]
async fn stalled_rate_limiter_returns_rest_of_batch_in_order() {
    let env = TestEnv::with_config(ServiceConfig {
        rate_limit: RateLimitConfig {
            per_minute: 2,
            max_wait: Duration::from_secs(5),
            ..RateLimitConfig::default()
        },
        ..ServiceConfig::default()
    });
    let mut ids = Vec::new();
    for channel in 0..4 {
        ids.push(env.service.send_to_channel(channel, "x", None, None).await.unwrap());
    }

    let TickOutcome::Processed(report) = env.tick().await else {
        panic!("expected a processed batch");
    };
    assert_eq!(report.sent, 2);
    assert_eq!(report.returned, 2);

    let status = env.service.queue_status().await;
    assert_eq!(status.pending, 2);
    assert_eq!(status.in_flight, 0);
    for id in &ids[2..] {
        let record = env.record(*id).await;
        assert_eq!(record.status, NotificationStatus::Pending);
        assert_eq!(record.metadata.retry_count, 0);
    }

    env.advance(Duration::from_secs(60));
    env.tick().await;
    let calls = env.transport.calls().await;
    let order = calls.iter().map(|call| call.notification_id).collect::<Vec<_>>();
    assert_eq!(order, ids);
}

#[tokio::test]
async fn batches_are_bounded_by_batch_size() {
    let env = TestEnv::with_config(ServiceConfig {
        scheduler: SchedulerConfig { batch_size: 4, ..SchedulerConfig::default() },
        ..ServiceConfig::default()
    });
    for channel in 0..10 {
        env.service.send_to_channel(channel, "x", None, None).await.unwrap();
    }

    let mut sizes = Vec::new();
    while let TickOutcome::Processed(report) = env.tick().await {
        sizes.push(report.taken);
    }
    assert_eq!(sizes, vec![4, 4, 2]);
}

#[tokio::test]
async fn background_loop_delivers_until_shutdown() {
    let env = TestEnv::new();
    env.service.start().await.unwrap();

    let id = env.service.send_to_channel(1, "cashout ready", None, None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while env.status(id).await != NotificationStatus::Sent {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("record should be delivered by the loop");

    env.service.shutdown_within(Duration::from_secs(5)).await.unwrap();
    assert!(!env.service.stats().await.is_processing);

    let late = env.service.send_to_channel(2, "after shutdown", None, None).await.unwrap();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(env.status(late).await, NotificationStatus::Pending);
}
