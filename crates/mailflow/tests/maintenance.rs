mod common;

use common::{email, memory_harness};
use mailflow::jobs::JobState;
use std::time::Duration;

#[tokio::test]
async fn purge_removes_only_old_finished_jobs() {
    let h = memory_harness(1);

    let done = h.scheduler.enqueue(email("done@x.com"), Duration::ZERO).await.unwrap();
    let dead = h.scheduler.enqueue(email("dead@x.com"), Duration::ZERO).await.unwrap();
    let cancelled = h
        .scheduler
        .enqueue(email("cancel@x.com"), Duration::from_secs(600))
        .await
        .unwrap();
    let pending = h
        .scheduler
        .enqueue(email("later@x.com"), Duration::from_secs(600))
        .await
        .unwrap();

    h.scheduler
        .lease_due("worker-a", 2, Duration::from_secs(30))
        .await
        .unwrap();
    h.scheduler.ack(done).await.unwrap();
    h.scheduler.nack(dead, Duration::from_secs(1)).await.unwrap();
    h.scheduler.cancel(cancelled).await.unwrap();

    // too recent
    h.clock.advance(Duration::from_secs(30));
    let purged = h
        .scheduler
        .purge_finished(Duration::from_secs(3600), 100)
        .await
        .unwrap();
    assert_eq!(purged, 0);

    h.clock.advance(Duration::from_secs(3600));
    let purged = h
        .scheduler
        .purge_finished(Duration::from_secs(3600), 100)
        .await
        .unwrap();
    assert_eq!(purged, 2);

    assert!(h.scheduler.get(done).await.unwrap().is_none());
    assert!(h.scheduler.get(cancelled).await.unwrap().is_none());
    assert_eq!(
        h.scheduler.get(dead).await.unwrap().unwrap().state,
        JobState::DeadLettered,
        "dead letters are kept for inspection"
    );
    assert_eq!(
        h.scheduler.get(pending).await.unwrap().unwrap().state,
        JobState::Pending
    );
}

#[tokio::test]
async fn purge_respects_limit() {
    let h = memory_harness(3);
    for _ in 0..5 {
        h.scheduler.enqueue(email("a@x.com"), Duration::ZERO).await.unwrap();
    }
    for job in h
        .scheduler
        .lease_due("worker-a", 10, Duration::from_secs(30))
        .await
        .unwrap()
    {
        h.scheduler.ack(job.id).await.unwrap();
    }

    h.clock.advance(Duration::from_secs(7200));
    assert_eq!(
        h.scheduler
            .purge_finished(Duration::from_secs(3600), 3)
            .await
            .unwrap(),
        3
    );
    assert_eq!(h.scheduler.counts().await.unwrap().done, 2);
}

#[tokio::test]
async fn purge_takes_the_oldest_finished_jobs_first() {
    let h = memory_harness(3);
    let older_id = h
        .scheduler
        .enqueue(email("a@x.com"), Duration::from_secs(60))
        .await
        .unwrap();
    let newer_id = h
        .scheduler
        .enqueue(email("b@x.com"), Duration::from_secs(60))
        .await
        .unwrap();

    // the job with the larger id finishes first
    h.scheduler.cancel(newer_id).await.unwrap();
    h.clock.advance(Duration::from_secs(10));
    h.scheduler.cancel(older_id).await.unwrap();

    h.clock.advance(Duration::from_secs(7200));
    let purged = h
        .scheduler
        .purge_finished(Duration::from_secs(3600), 1)
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(h.scheduler.get(newer_id).await.unwrap().is_none());
    assert!(h.scheduler.get(older_id).await.unwrap().is_some());
}
