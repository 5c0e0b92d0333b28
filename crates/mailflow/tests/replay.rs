mod common;

use common::{email, memory_harness, t0};
use mailflow::jobs::JobState;
use std::time::Duration;

async fn dead_lettered_job(h: &common::Harness) -> uuid::Uuid {
    let id = h
        .scheduler
        .enqueue(email("a@x.com"), Duration::ZERO)
        .await
        .unwrap();
    h.scheduler
        .lease_due("worker-a", 1, Duration::from_secs(30))
        .await
        .unwrap();
    h.scheduler
        .nack_with_error(id, Duration::from_secs(1), "boom")
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn replay_creates_new_job_with_lineage() {
    let h = memory_harness(1);
    let old_id = dead_lettered_job(&h).await;

    h.clock.advance(Duration::from_secs(60));
    let new_id = h
        .scheduler
        .replay(old_id)
        .await
        .unwrap()
        .expect("dead-lettered job should replay");
    assert_ne!(new_id, old_id);

    let old = h.scheduler.get(old_id).await.unwrap().unwrap();
    let new = h.scheduler.get(new_id).await.unwrap().unwrap();

    assert_eq!(old.state, JobState::DeadLettered, "source is left untouched");
    assert_eq!(new.state, JobState::Pending);
    assert_eq!(new.attempts, 0);
    assert_eq!(new.max_attempts, old.max_attempts);
    assert_eq!(new.payload, old.payload);
    assert_eq!(new.replay_of, Some(old_id));
    assert!(new.last_error.is_none());
    assert_eq!(new.not_before, t0() + chrono::Duration::seconds(60));

    let leased = h
        .scheduler
        .lease_due("worker-a", 10, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].id, new_id);
    assert_eq!(leased[0].attempts, 1);
}

#[tokio::test]
async fn only_dead_lettered_jobs_replay() {
    let h = memory_harness(3);
    let pending = h
        .scheduler
        .enqueue(email("a@x.com"), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(h.scheduler.replay(pending).await.unwrap(), None);
    assert_eq!(h.scheduler.replay(uuid::Uuid::now_v7()).await.unwrap(), None);
    assert_eq!(h.scheduler.counts().await.unwrap().total(), 1);
}
