//! Locking queue tests: checkout exclusivity, consume/release and
//! redelivery after an expired checkout.


use std::sync::Arc;
use std::time::Duration;

use job_engine::coordination::{CoordinationError, LocalQueue, LockingQueue};

fn queue(checkout_timeout: Duration) -> LocalQueue {
    LocalQueue::new("/job", checkout_timeout)
}

async fn get_within(queue: &LocalQueue, timeout: Duration) -> Option<job_engine::coordination::QueueEntry> {
    tokio::time::timeout(timeout, queue.get()).await.ok().map(|r| r.unwrap())
}

/// Test 1: Items come out in FIFO order
#[tokio::test]
async fn test_fifo_order() {
    let queue = queue(Duration::from_secs(60));
    for id in ["job/1", "job/2", "job/3"] {
        queue.put(id.to_string()).await.unwrap();
    }

    let a = queue.get().await.unwrap();
    let b = queue.get().await.unwrap();
    let c = queue.get().await.unwrap();
    assert_eq!(
        vec![a.payload(), b.payload(), c.payload()],
        vec!["job/1", "job/2", "job/3"]
    );
    assert_eq!(queue.checked_out(), 3);
}

/// Test 2: A checked-out item is invisible to other consumers
#[tokio::test]
async fn test_checkout_is_exclusive() {
    let queue = queue(Duration::from_secs(60));
    queue.put("job/1".into()).await.unwrap();

    let entry = queue.get().await.unwrap();
    assert_eq!(entry.payload(), "job/1");
    assert!(get_within(&queue, Duration::from_millis(50)).await.is_none());
    assert!(queue.is_empty());
}

/// Test 3: Consume removes the item for good
#[tokio::test]
async fn test_consume_removes_item() {
    let queue = queue(Duration::from_millis(50));
    queue.put("job/1".into()).await.unwrap();

    let entry = queue.get().await.unwrap();
    queue.consume(&entry).await.unwrap();

    assert_eq!(queue.checked_out(), 0);
    // Never comes back, not even after the checkout timeout
    assert!(get_within(&queue, Duration::from_millis(150)).await.is_none());
}

/// Test 4: Release puts the item back at the head of the queue
#[tokio::test]
async fn test_release_returns_item_to_front() {
    let queue = queue(Duration::from_secs(60));
    queue.put("job/1".into()).await.unwrap();
    queue.put("job/2".into()).await.unwrap();

    let first = queue.get().await.unwrap();
    queue.release(&first).await.unwrap();

    let again = queue.get().await.unwrap();
    assert_eq!(again.payload(), "job/1");
    assert_ne!(again.token(), first.token());
}

/// Test 5: Consuming or releasing twice reports a stale entry
#[tokio::test]
async fn test_stale_entry() {
    let queue = queue(Duration::from_secs(60));
    queue.put("job/1".into()).await.unwrap();

    let entry = queue.get().await.unwrap();
    queue.consume(&entry).await.unwrap();

    assert!(matches!(
        queue.consume(&entry).await,
        Err(CoordinationError::StaleEntry(_))
    ));
    assert!(matches!(
        queue.release(&entry).await,
        Err(CoordinationError::StaleEntry(_))
    ));
}

/// Test 6: An expired checkout is redelivered and the old entry goes stale
#[tokio::test]
async fn test_expired_checkout_is_redelivered() {
    let queue = queue(Duration::from_millis(50));
    queue.put("job/1".into()).await.unwrap();

    let crashed = queue.get().await.unwrap();

    let redelivered = get_within(&queue, Duration::from_secs(1))
        .await
        .expect("item should be redelivered after the checkout expires");
    assert_eq!(redelivered.payload(), "job/1");
    assert!(matches!(
        queue.consume(&crashed).await,
        Err(CoordinationError::StaleEntry(_))
    ));
    queue.consume(&redelivered).await.unwrap();
}

/// Test 7: A blocked get wakes up when an item is put
#[tokio::test]
async fn test_get_blocks_until_put() {
    let queue = Arc::new(queue(Duration::from_secs(60)));

    let consumer = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.get().await.unwrap() })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!consumer.is_finished());

    queue.put("job/1".into()).await.unwrap();
    let entry = tokio::time::timeout(Duration::from_secs(1), consumer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.payload(), "job/1");
}

/// Test 8: Concurrent consumers each receive distinct items
#[tokio::test]
async fn test_concurrent_consumers_get_distinct_items() {
    let queue = Arc::new(queue(Duration::from_secs(60)));

    let mut consumers = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        consumers.push(tokio::spawn(async move {
            let entry = queue.get().await.unwrap();
            entry.payload().to_string()
        }));
    }

    for i in 0..4 {
        queue.put(format!("job/{}", i)).await.unwrap();
    }

    let mut seen = Vec::new();
    for consumer in consumers {
        seen.push(
            tokio::time::timeout(Duration::from_secs(1), consumer)
                .await
                .unwrap()
                .unwrap(),
        );
    }
    seen.sort();
    assert_eq!(seen, vec!["job/0", "job/1", "job/2", "job/3"]);
}

/// Test 9: The coordinator hands out one queue per path
#[tokio::test]
async fn test_coordinator_shares_queues_by_path() {
    let engine = test_harness::TestEngine::new();
    let same = engine.coordinator.queue(test_harness::QUEUE_PATH);
    let other = engine.coordinator.queue("/other");

    engine.create_job("fixed", "dummy").await;
    assert_eq!(same.len(), 1);
    assert_eq!(other.len(), 0);
    assert_eq!(same.path(), "/job");
}

/// Test 10: A renewed checkout outlives the checkout timeout, and renewing a
/// lost checkout reports a stale entry
#[tokio::test]
async fn test_renewed_checkout_is_not_redelivered() {
    let queue = queue(Duration::from_millis(100));
    queue.put("job/1".into()).await.unwrap();

    let entry = queue.get().await.unwrap();
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        queue.renew(&entry).await.unwrap();
    }
    assert!(get_within(&queue, Duration::from_millis(40)).await.is_none());
    assert_eq!(queue.checked_out(), 1);

    // Stop renewing: the checkout expires and the entry goes stale
    let redelivered = get_within(&queue, Duration::from_secs(1)).await.unwrap();
    assert_eq!(redelivered.payload(), "job/1");
    assert!(matches!(
        queue.renew(&entry).await,
        Err(CoordinationError::StaleEntry(_))
    ));
}
