mod common;

use common::{harness_with, test_config};
use tollgantry::application::retry::RetryPolicy;
use tollgantry::config::Config;
use tollgantry::domain::workflow::Stage;

#[tokio::test]
async fn test_random_faults_never_reach_a_human() {
    let config = Config {
        random_failure_probability: 1.0,
        ..test_config()
    };
    let h = harness_with(config).await;
    h.register("ABC123", 3).await;

    // Low credit would normally produce a top-up email.
    let run = h
        .workflow
        .start(h.capture_plate("cam1/0001.jpg", "ABC 123"))
        .await
        .unwrap();

    assert_eq!(run.stage, Stage::Failed);
    assert!(run.failure.as_deref().unwrap().contains("random processing error"));
    let report = h.poller.poll_cycle().await;
    assert_eq!(report.notified(), 0);
    assert!(h.mailer.sent().is_empty());
}

#[tokio::test]
async fn test_ledger_outage_shorter_than_retry_budget() {
    let h = harness_with(test_config()).await;
    h.register("ABC123", 10).await;
    h.ledger.fail_next_operations(2);

    let run = h
        .workflow
        .start(h.capture_plate("cam1/0001.jpg", "ABC 123"))
        .await
        .unwrap();

    assert_eq!(run.stage, Stage::Succeeded);
    assert_eq!(h.credit("ABC123").await, 5);
    assert!(h.mailer.sent().is_empty());
}

#[tokio::test]
async fn test_ledger_outage_longer_than_retry_budget() {
    let config = Config {
        retry: RetryPolicy::immediate(2),
        ..test_config()
    };
    let h = harness_with(config).await;
    h.register("ABC123", 10).await;
    h.ledger.fail_next_operations(5);

    let run = h
        .workflow
        .start(h.capture_plate("cam1/0001.jpg", "ABC 123"))
        .await
        .unwrap();

    assert_eq!(run.stage, Stage::Failed);
    assert!(run.failure.as_deref().unwrap().contains("Database access error"));
    assert_eq!(h.ledger.reads(), 2);
    assert!(h.mailer.sent().is_empty());
}
