//! Integration tests against a live Redis.
//!
//! Run with: REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_integration -- --ignored

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use reelcast::queue::{RedisTaskQueue, Task, TaskQueue};
use reelcast::scheduler::{Job, JobStatus, JobStore, RecurringJob, RecurringRule, RedisJobStore};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Unique namespace so parallel runs do not collide.
fn namespace(kind: &str) -> String {
    format!("reelcast-test:{}:{}", kind, Uuid::new_v4())
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_job_store_due_set_lifecycle() {
    let store = RedisJobStore::connect(&redis_url(), &namespace("jobs"))
        .await
        .expect("Redis must be reachable");
    let now = Utc::now();

    let due = Job::new("publish", json!({"post": 1})).with_run_at(now - chrono::Duration::seconds(5));
    let later = Job::new("publish", json!({"post": 2})).with_run_at(now + chrono::Duration::hours(1));
    store.schedule(&due).await.unwrap();
    store.schedule(&later).await.unwrap();

    let claimed = store.claim_due(now).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, due.id);
    assert!(store.claim_due(now).await.unwrap().is_empty());

    let mut done = claimed[0].clone();
    done.attempts = 1;
    done.status = JobStatus::Completed;
    store.complete(&done).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!((stats.delayed, stats.active, stats.completed), (1, 0, 1));
    assert_eq!(
        store.get(due.id).await.unwrap().map(|j| j.status),
        Some(JobStatus::Completed)
    );
}

#[tokio::test]
#[ignore]
async fn test_job_store_recurring_definitions() {
    let store = RedisJobStore::connect(&redis_url(), &namespace("recurring"))
        .await
        .expect("Redis must be reachable");
    let definition = RecurringJob::new(
        "post:abc",
        "republish_post",
        json!({"post_id": "abc"}),
        RecurringRule::weekly(),
        Utc::now(),
    );

    store.save_recurring(&definition).await.unwrap();
    assert_eq!(store.list_recurring().await.unwrap(), vec![definition]);
    assert!(store.remove_recurring("post:abc").await.unwrap());
    assert!(!store.remove_recurring("post:abc").await.unwrap());
    assert!(store.list_recurring().await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_task_queue_reliable_delivery() {
    let queue = RedisTaskQueue::connect(&redis_url(), &namespace("queue"))
        .await
        .expect("Redis must be reachable");

    let task = Task::new("batch:process_video", json!({"video_id": "v1"}));
    queue.enqueue(task.clone()).await.unwrap();

    let taken = queue
        .dequeue(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("task should be delivered");
    assert_eq!(taken.id, task.id);
    assert_eq!(queue.stats().await.unwrap().processing_tasks, 1);

    // A crashed worker's task is handed out again.
    assert_eq!(queue.recover_processing().await.unwrap(), 1);
    let again = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(again.id, task.id);

    queue.dead_letter(again, "gave up").await.unwrap();
    let dead = queue.peek_dead_letter(5).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].error, "gave up");
    assert_eq!(queue.stats().await.unwrap().processing_tasks, 0);
}

#[tokio::test]
#[ignore]
async fn test_job_store_recovers_working_set() {
    let store = RedisJobStore::connect(&redis_url(), &namespace("recover"))
        .await
        .expect("Redis must be reachable");
    let now = Utc::now();
    let job = Job::new("publish", json!({"post": 3})).with_run_at(now - chrono::Duration::seconds(1));
    store.schedule(&job).await.unwrap();

    store.claim_due(now).await.unwrap();
    assert_eq!(
        store.get(job.id).await.unwrap().map(|j| j.status),
        Some(JobStatus::Active)
    );

    assert_eq!(store.recover_active().await.unwrap(), 1);
    let stats = store.stats().await.unwrap();
    assert_eq!((stats.delayed, stats.active), (1, 0));
    assert_eq!(store.claim_due(now).await.unwrap()[0].id, job.id);
}
