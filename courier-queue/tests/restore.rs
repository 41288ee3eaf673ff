//! Queue state surviving a restart through the file store.
#![allow(clippy::unwrap_used)]

mod support;

use std::sync::Arc;

use chrono::Utc;
use courier_queue::{
    BackingStore, DispatcherConfig, JobQueue, JobStatus, NewJob, RecipientResolver, StoreConfig,
};
use pretty_assertions::assert_eq;
use support::{dispatcher, transport::FakeTransport};

fn file_store(dir: &tempfile::TempDir) -> Arc<dyn BackingStore> {
    StoreConfig::File {
        path: dir.path().join("queue"),
    }
    .build()
    .unwrap()
}

#[tokio::test]
async fn test_restore_returns_interrupted_sends_to_pending() {
    let dir = tempfile::tempdir().unwrap();

    let (claimed, waiting, sent) = {
        let queue = JobQueue::restore(file_store(&dir)).await.unwrap();
        let sent = queue
            .enqueue(NewJob::new("sent@b.com", "Hi").text("x").priority(9))
            .await
            .unwrap();
        queue.claim_due_batch(1, Utc::now()).await;
        queue.mark_sent(&sent, Utc::now()).await;

        let claimed = queue
            .enqueue(NewJob::new("claimed@b.com", "Hi").text("x").priority(5))
            .await
            .unwrap();
        let waiting = queue
            .enqueue(
                NewJob::new("waiting@b.com", "Hi")
                    .text("x")
                    .scheduled_at(Utc::now() + chrono::Duration::days(1)),
            )
            .await
            .unwrap();
        let batch = queue.claim_due_batch(10, Utc::now()).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, claimed);

        (claimed, waiting, sent)
    };

    let queue = JobQueue::restore(file_store(&dir)).await.unwrap();
    assert_eq!(queue.len(), 3);

    let restored = queue.get(&claimed).unwrap();
    assert_eq!(restored.status, JobStatus::Pending);
    assert_eq!(restored.claimed_at, None);
    assert_eq!(queue.get(&waiting).unwrap().status, JobStatus::Pending);
    assert_eq!(queue.get(&sent).unwrap().status, JobStatus::Sent);

    let transport = Arc::new(FakeTransport::accepting());
    let dispatcher = dispatcher(
        DispatcherConfig::default(),
        &queue,
        RecipientResolver::empty(),
        &transport,
    );
    let report = dispatcher.process_batch(Utc::now()).await;
    assert_eq!(report.sent, 1);
    assert_eq!(transport.sent()[0].to_email, "claimed@b.com");

    // The reset itself was persisted.
    let again = JobQueue::restore(file_store(&dir)).await.unwrap();
    assert_eq!(again.get(&claimed).unwrap().status, JobStatus::Sent);
}

#[tokio::test]
async fn test_restore_keeps_full_history() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let queue = JobQueue::restore(file_store(&dir)).await.unwrap();
        let id = queue
            .enqueue(NewJob::new("a@b.com", "Hi").text("x").max_attempts(1))
            .await
            .unwrap();
        queue.claim_due_batch(1, Utc::now()).await;
        queue.mark_failed(&id, "DATA failed: 552 too big").await;
        queue.update_recipient(&id, "c@d.com", None).await;
        id
    };

    let before = JobQueue::restore(file_store(&dir)).await.unwrap();
    let job = before.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error_message.as_deref(), Some("DATA failed: 552 too big"));
    assert_eq!(job.recipient_email, "c@d.com");
    assert_eq!(job.original_recipient_email.as_deref(), Some("a@b.com"));
}
