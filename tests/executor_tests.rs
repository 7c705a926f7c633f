//! Executor tests: the per-job pipeline and the worker pool.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use job_engine::coordination::LockingQueue;
use job_engine::action::{Action, ActionRegistry};
use job_engine::executor::{DiscardReason, Executor, Outcome};
use job_engine::job::{JobError, JobState};
use job_engine::store::ResourceStore;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use test_harness::{
    test_coordination_config, test_executor_config, test_registry, wait_until, FaultyStore,
    LateWriterAction, SlowAction, TestEngine,
};

fn registry() -> job_engine::action::ActionRegistry {
    test_registry(Arc::new(AtomicUsize::new(0)))
}

/// Test 1: The dummy action runs to SUCCESS with return code 0
#[tokio::test]
async fn test_dummy_action_succeeds() {
    let engine = TestEngine::new();
    let executor = engine.executor(registry(), 1);
    let shutdown = CancellationToken::new();
    let pool = tokio::spawn(executor.run(shutdown.clone()));

    let id = engine.create_job("dummy_test_action", "dummy").await;
    let job = engine
        .wait_for_state(&id, JobState::Success, Duration::from_secs(2))
        .await
        .expect("dummy job should succeed");

    assert_eq!(job.return_code(), Some(0));
    assert_eq!(job.progress(), 50);
    assert!(wait_until(Duration::from_secs(1), || engine.queue.checked_out() == 0).await);
    assert!(engine.queue.is_empty());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), pool).await.unwrap().unwrap();
}

/// Test 2: A handler's return code is recorded as-is
#[tokio::test]
async fn test_return_code_is_recorded() {
    let engine = TestEngine::new();
    let executor = engine.executor(registry(), 1);
    let id = engine.create_job("fixed", "dummy").await;

    let entry = engine.queue.get().await.unwrap();
    let outcome = executor.process("worker-1", entry).await;

    assert_eq!(
        outcome,
        Outcome::Succeeded {
            job_id: id.clone(),
            return_code: 42
        }
    );
    let job = engine.job(&id).await;
    assert_eq!(job.state(), JobState::Success);
    assert_eq!(job.return_code(), Some(42));
    assert_eq!(engine.queue.checked_out(), 0);
}

/// Test 3: An unregistered action fails the job and is never redelivered
#[tokio::test]
async fn test_unimplemented_action_fails_job() {
    let engine = TestEngine::new();
    let executor = engine.executor(registry(), 1);
    let id = engine.create_job("no_such_action", "dummy").await;

    let entry = engine.queue.get().await.unwrap();
    let outcome = executor.process("worker-1", entry).await;
    assert_eq!(
        outcome,
        Outcome::NotImplemented {
            job_id: id.clone(),
            action: "no_such_action".into()
        }
    );
    assert!(!outcome.is_failure());

    let job = engine.job(&id).await;
    assert_eq!(job.state(), JobState::Failed);
    assert!(job.status_message().unwrap().contains("not implemented"));

    // Consumed: nothing comes back after the checkout timeout
    assert_eq!(engine.queue.checked_out(), 0);
    let redelivered = tokio::time::timeout(Duration::from_millis(500), engine.queue.get()).await;
    assert!(redelivered.is_err());
}

/// Test 4: A failing handler keeps the resources it recorded
#[tokio::test]
async fn test_failing_action_keeps_affected_resources() {
    let engine = TestEngine::new();
    let executor = engine.executor(registry(), 1);
    let id = engine.create_job("failing", "deployment/1").await;

    let entry = engine.queue.get().await.unwrap();
    let outcome = executor.process("worker-1", entry).await;
    assert!(outcome.is_failure());

    let job = engine.job(&id).await;
    assert_eq!(job.state(), JobState::Failed);
    let message = job.status_message().unwrap();
    assert!(message.starts_with(&format!("Failed to process {}", id)));
    assert!(message.contains("cloud API unreachable"));

    let hrefs: Vec<&str> = job.affected_resources().iter().map(|r| r.href.as_str()).collect();
    assert_eq!(hrefs, vec!["vm/1", "vm/2"]);
}

/// Test 5: A handler that overruns its timeout is failed and consumed; the
/// detached work still runs to completion
#[tokio::test]
async fn test_timeout_fails_job() {
    let engine = TestEngine::new();
    let finished = Arc::new(AtomicUsize::new(0));
    let executor = engine.executor(test_registry(finished.clone()), 1);
    let id = engine.create_job("sleepy", "dummy").await;

    let entry = engine.queue.get().await.unwrap();
    let outcome = executor.process("worker-1", entry).await;
    assert!(matches!(outcome, Outcome::TimedOut { .. }));

    let job = engine.job(&id).await;
    assert_eq!(job.state(), JobState::Failed);
    assert!(job.status_message().unwrap().contains("Timeout"));
    assert_eq!(engine.queue.checked_out(), 0);
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    assert!(wait_until(Duration::from_secs(2), || finished.load(Ordering::SeqCst) == 1).await);
    assert_eq!(engine.job(&id).await.state(), JobState::Failed);
}

/// Test 6: A panicking handler fails its job, not the worker
#[tokio::test]
async fn test_panicking_action_fails_job() {
    let engine = TestEngine::new();
    let executor = engine.executor(registry(), 1);
    let id = engine.create_job("panicky", "dummy").await;

    let entry = engine.queue.get().await.unwrap();
    let outcome = executor.process("worker-1", entry).await;
    match outcome {
        Outcome::Failed { message, .. } => assert!(message.contains("handler bug")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(engine.job(&id).await.state(), JobState::Failed);
}

/// Test 7: Redelivering a finished job leaves its result untouched
#[tokio::test]
async fn test_finished_job_redelivery_is_idempotent() {
    let engine = TestEngine::new();
    let executor = engine.executor(registry(), 1);
    engine
        .seed_job(
            "job/done",
            json!({
                "action": "fixed",
                "targetResource": { "href": "dummy" },
                "state": "SUCCESS",
                "returnCode": 7,
                "statusMessage": "done",
            }),
        )
        .await;

    let entry = engine.queue.get().await.unwrap();
    let outcome = executor.process("worker-1", entry).await;
    assert_eq!(
        outcome,
        Outcome::Discarded {
            job_id: "job/done".into(),
            reason: DiscardReason::Finished(JobState::Success)
        }
    );

    let job = engine.job("job/done").await;
    assert_eq!(job.return_code(), Some(7));
    assert_eq!(job.status_message(), Some("done"));
    assert!(engine.queue.is_empty());
    assert_eq!(engine.queue.checked_out(), 0);
}

/// Test 8: A queued id whose document is gone is discarded
#[tokio::test]
async fn test_missing_job_is_discarded() {
    let engine = TestEngine::new();
    let executor = engine.executor(registry(), 1);
    engine.queue.put("job/ghost".into()).await.unwrap();

    let entry = engine.queue.get().await.unwrap();
    let outcome = executor.process("worker-1", entry).await;
    assert_eq!(
        outcome,
        Outcome::Discarded {
            job_id: "job/ghost".into(),
            reason: DiscardReason::Missing
        }
    );
    assert_eq!(engine.queue.checked_out(), 0);
}

/// Test 9: A stop request is honored before the action runs
#[tokio::test]
async fn test_stopping_job_is_stopped() {
    let engine = TestEngine::new();
    let executor = engine.executor(registry(), 1);
    engine
        .seed_job(
            "job/stop",
            json!({
                "action": "failing",
                "targetResource": { "href": "deployment/1" },
                "state": "STOPPING",
            }),
        )
        .await;

    let entry = engine.queue.get().await.unwrap();
    let outcome = executor.process("worker-1", entry).await;
    assert_eq!(
        outcome,
        Outcome::Stopped {
            job_id: "job/stop".into()
        }
    );

    let job = engine.job("job/stop").await;
    assert_eq!(job.state(), JobState::Stopped);
    // The failing action never ran
    assert!(job.affected_resources().is_empty());
}

/// Test 10: A job left RUNNING by a crashed worker is run again
#[tokio::test]
async fn test_running_job_is_rerun_on_redelivery() {
    let engine = TestEngine::new();
    let executor = engine.executor(registry(), 1);
    engine
        .seed_job(
            "job/orphan",
            json!({
                "action": "fixed",
                "targetResource": { "href": "dummy" },
                "state": "RUNNING",
                "progress": 30,
            }),
        )
        .await;

    let entry = engine.queue.get().await.unwrap();
    let outcome = executor.process("worker-1", entry).await;
    assert!(matches!(outcome, Outcome::Succeeded { return_code: 42, .. }));
    assert_eq!(engine.job("job/orphan").await.state(), JobState::Success);
}

/// Test 11: A store outage while loading releases the entry for another try
#[tokio::test]
async fn test_store_outage_releases_entry() {
    let engine = TestEngine::new();
    let store: Arc<dyn ResourceStore> = Arc::new(FaultyStore {
        gets_fail: true,
        ..FaultyStore::new(engine.store.clone())
    });
    let executor = Executor::new(
        test_executor_config(1),
        "test",
        engine.queue.clone(),
        store,
        Arc::new(registry()),
    );
    let id = engine.create_job("fixed", "dummy").await;

    let entry = engine.queue.get().await.unwrap();
    let outcome = executor.process("worker-1", entry).await;
    assert!(matches!(outcome, Outcome::Aborted { .. }));
    assert!(outcome.is_failure());

    assert_eq!(engine.queue.checked_out(), 0);
    assert_eq!(engine.queue.len(), 1);
    assert_eq!(engine.job(&id).await.state(), JobState::Queued);
}

/// Test 12: Several workers drain the queue and stop on shutdown
#[tokio::test]
async fn test_worker_pool_drains_queue() {
    let engine = TestEngine::new();
    let executor = engine.executor(registry(), 3);
    assert_eq!(executor.worker_name(2), "test-worker-2");

    let mut ids = Vec::new();
    for i in 0..6 {
        let action = if i % 2 == 0 { "fixed" } else { "no_such_action" };
        ids.push(engine.create_job(action, &format!("dummy/{}", i)).await);
    }

    let shutdown = CancellationToken::new();
    let pool = tokio::spawn(executor.run(shutdown.clone()));

    for (i, id) in ids.iter().enumerate() {
        let expected = if i % 2 == 0 {
            JobState::Success
        } else {
            JobState::Failed
        };
        assert!(
            engine
                .wait_for_state(id, expected, Duration::from_secs(2))
                .await
                .is_some(),
            "job {} did not reach {}",
            id,
            expected
        );
    }
    assert!(engine.queue.is_empty());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), pool)
        .await
        .expect("pool should stop on shutdown")
        .unwrap();
}

/// Test 13: A job that runs longer than the checkout timeout stays with its
/// worker and runs exactly once, even with an idle worker waiting
#[tokio::test]
async fn test_slow_action_is_not_redelivered_while_running() {
    let engine = TestEngine::new();
    let checkout_timeout = test_coordination_config().checkout_timeout;
    let starts = Arc::new(AtomicUsize::new(0));

    let mut registry = ActionRegistry::new();
    let counter = starts.clone();
    registry
        .register("slow", move |_ctx, _job| {
            Box::new(SlowAction {
                starts: counter.clone(),
                duration: checkout_timeout * 8 / 3,
            }) as Box<dyn Action>
        })
        .unwrap();

    let executor = engine.executor(registry, 2);
    let shutdown = CancellationToken::new();
    let pool = tokio::spawn(executor.run(shutdown.clone()));

    let id = engine.create_job("slow", "dummy").await;
    let job = engine
        .wait_for_state(&id, JobState::Success, Duration::from_secs(5))
        .await
        .expect("slow job should succeed");
    assert_eq!(job.return_code(), Some(0));

    // Give a wrongly redelivered copy time to start
    tokio::time::sleep(checkout_timeout).await;
    assert_eq!(starts.load(Ordering::SeqCst), 1, "action ran more than once");
    assert_eq!(engine.queue.checked_out(), 0);
    assert!(engine.queue.is_empty());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), pool).await.unwrap().unwrap();
}

/// Test 14: An abandoned handler cannot write to its job once it is FAILED
#[tokio::test]
async fn test_abandoned_action_cannot_write_after_timeout() {
    let engine = TestEngine::new();
    let late_writes = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut registry = ActionRegistry::new();
    let writes = late_writes.clone();
    registry
        .register("late_writer", move |_ctx, job| {
            Box::new(LateWriterAction {
                job,
                late_writes: writes.clone(),
            }) as Box<dyn Action>
        })
        .unwrap();

    let executor = engine.executor(registry, 1);
    let id = engine.create_job("late_writer", "dummy").await;
    let entry = engine.queue.get().await.unwrap();
    let outcome = executor.process("worker-1", entry).await;
    let Outcome::TimedOut { message, .. } = &outcome else {
        panic!("expected a timeout, got {:?}", outcome);
    };

    let failed = engine.job(&id).await;
    assert_eq!(failed.state(), JobState::Failed);
    let progress_before = failed.progress();

    assert!(wait_until(Duration::from_secs(2), || late_writes.lock().unwrap().len() == 2).await);
    for write in late_writes.lock().unwrap().iter() {
        assert!(matches!(write, Err(JobError::Released(_))), "late write went through: {:?}", write);
    }

    let job = engine.job(&id).await;
    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(job.progress(), progress_before);
    assert_eq!(job.status_message(), Some(message.as_str()));
}
