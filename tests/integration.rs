use std::{collections::HashSet, future::Future, ops::Deref, sync::Arc, time::Duration};

use missive::{
    ack::AckStatus,
    backend::{tables, MemoryBackend},
    config::Config,
    message::{MessageStatus, MessageType, Priority, QueuedMessage},
    Pipeline,
};
use serde_json::json;
use tempfile::TempDir;

struct TmpPipeline {
    pipeline: Arc<Pipeline>,
    backend: MemoryBackend,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpPipeline {
    type Target = Pipeline;

    fn deref(&self) -> &Self::Target {
        &self.pipeline
    }
}

fn config(tmpdir: &TempDir) -> Config {
    Config {
        db_path: Some(
            tmpdir
                .path()
                .join("missive.db")
                .to_string_lossy()
                .to_string(),
        ),
        max_queue_size: 10,
        processing_interval_ms: 50,
        sync_interval_ms: 100,
        consistency_interval_ms: 100,
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 5,
        reconnect_initial_delay_ms: 3_600_000,
        reconnect_max_delay_ms: 3_600_000,
        ..Config::default()
    }
}

async fn open(config: Config, backend: &MemoryBackend) -> Arc<Pipeline> {
    Pipeline::builder()
        .config(config)
        .backend(Arc::new(backend.clone()))
        .connect()
        .await
        .unwrap()
}

async fn setup() -> TmpPipeline {
    let tmpdir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();

    TmpPipeline {
        pipeline: open(config(&tmpdir), &backend).await,
        backend,
        tmpdir,
    }
}

async fn send(pipeline: &Pipeline, priority: Priority) -> bool {
    pipeline
        .send_message("dm1", "rules1", MessageType::Task, json!({"x": 1}), Some(priority))
        .await
        .unwrap()
}

async fn stored_with(pipeline: &Pipeline, status: MessageStatus) -> usize {
    pipeline
        .store()
        .messages_by_status(status)
        .await
        .unwrap()
        .len()
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_online_send_is_delivered_and_received() {
    let pipeline = setup().await;

    assert!(send(&pipeline, Priority::High).await);

    let sent = pipeline
        .store()
        .messages_by_status(MessageStatus::Sent)
        .await
        .unwrap();
    assert_eq!(sent.len(), 1);

    let report = pipeline
        .acks()
        .check_acknowledgment_status(&sent[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.status, AckStatus::Received);
    assert_eq!(report.receiver_id, "rules1");
    assert!(report.timestamp.is_some());

    let status = pipeline.queue_status();
    assert_eq!(status.queue_length, 0);
    assert!(status.is_online);
    assert_eq!(status.metrics.total_processed, 1);
    assert_eq!(pipeline.backend.rows(tables::MESSAGE_SEQUENCES).len(), 1);
}

#[tokio::test]
async fn test_invalid_message_is_rejected_before_queueing() {
    let pipeline = setup().await;

    let result = pipeline
        .send_message("dm1", "", MessageType::Query, json!("?"), None)
        .await;

    assert!(matches!(result, Err(missive::Error::Validation { .. })));
    assert_eq!(pipeline.queue_status().queue_length, 0);
    assert_eq!(stored_with(&pipeline, MessageStatus::Pending).await, 0);
}

#[tokio::test]
async fn test_offline_then_online_without_duplicate_delivery() {
    let pipeline = setup().await;

    assert!(send(&pipeline, Priority::High).await);
    let delivered = pipeline
        .store()
        .messages_by_status(MessageStatus::Sent)
        .await
        .unwrap()
        .remove(0);

    pipeline.backend.set_online(false);
    pipeline.handle_offline().await.unwrap();
    assert!(!pipeline.is_online());

    assert!(send(&pipeline, Priority::Low).await);
    assert!(send(&pipeline, Priority::Medium).await);

    let status = pipeline.queue_status();
    assert_eq!(status.queue_length, 2);
    assert!(status.offline_state.unwrap().pending_sync);
    assert_eq!(pipeline.backend.rows(tables::AGENT_COMMUNICATIONS).len(), 1);
    assert_eq!(stored_with(&pipeline, MessageStatus::Pending).await, 2);

    // A stale copy of an already delivered message finds its way back in.
    let stale: QueuedMessage = delivered.to_queued(3).unwrap();
    assert!(pipeline.queue().enqueue(stale));

    pipeline.backend.set_online(true);
    pipeline.handle_online().await.unwrap();

    assert!(pipeline.is_online());
    assert_eq!(pipeline.queue_status().queue_length, 0);

    let log = pipeline.backend.rows(tables::AGENT_COMMUNICATIONS);
    let ids: HashSet<_> = log
        .iter()
        .map(|row| row["message_id"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(log.len(), 3);
    assert_eq!(ids.len(), 3);
    assert_eq!(stored_with(&pipeline, MessageStatus::Sent).await, 3);

    let offline = pipeline.queue_status().offline_state.unwrap();
    assert!(!offline.pending_sync);
    assert_eq!(offline.reconnection_attempts, 0);
}

#[tokio::test]
async fn test_settled_message_left_in_queue_is_not_redelivered() {
    let pipeline = setup().await;
    assert!(send(&pipeline, Priority::High).await);

    let delivered = pipeline
        .store()
        .messages_by_status(MessageStatus::Sent)
        .await
        .unwrap()
        .remove(0);
    assert!(pipeline.queue().enqueue(delivered.to_queued(3).unwrap()));

    assert_eq!(pipeline.process_queue().await.unwrap(), 0);

    assert_eq!(pipeline.queue_status().queue_length, 0);
    assert_eq!(pipeline.backend.rows(tables::AGENT_COMMUNICATIONS).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recovery_during_delivery_does_not_requeue_delivered_message() {
    let pipeline = setup().await;

    for _ in 0..25 {
        let msg = pipeline
            .processing()
            .create_message("dm1", "rules1", MessageType::Task, json!({"x": 1}), Priority::High)
            .unwrap();
        pipeline
            .store()
            .persist_message(&msg, MessageStatus::Pending)
            .await
            .unwrap();
        assert!(pipeline.queue().enqueue(msg.clone()));

        let (delivered, recovered) = tokio::join!(
            pipeline.processing().process_message(msg.clone()),
            pipeline.recovery().recover_messages(),
        );

        assert!(delivered.unwrap());
        assert_eq!(recovered.unwrap().recovered, 0);
        assert!(!pipeline.queue().contains(&msg.id));
    }

    assert_eq!(pipeline.process_queue().await.unwrap(), 0);

    let log = pipeline.backend.rows(tables::AGENT_COMMUNICATIONS);
    let ids: HashSet<_> = log
        .iter()
        .map(|row| row["message_id"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(log.len(), 25);
    assert_eq!(ids.len(), 25);
}

#[tokio::test]
async fn test_failing_message_is_attempted_at_most_max_retries_times() {
    let pipeline = setup().await;
    pipeline.backend.set_online(false);

    // Still believes it is online, so the first attempt happens immediately.
    assert!(send(&pipeline, Priority::High).await);
    assert_eq!(pipeline.queue_status().queue_length, 1);

    pipeline.process_queue().await.unwrap();
    pipeline.process_queue().await.unwrap();
    assert_eq!(pipeline.queue_status().queue_length, 0);
    pipeline.process_queue().await.unwrap();

    let metrics = pipeline.queue_status().metrics;
    assert_eq!(metrics.total_processed, 3);
    assert_eq!(metrics.failed_deliveries, 3);
    assert_eq!(stored_with(&pipeline, MessageStatus::Failed).await, 1);

    pipeline.backend.set_online(true);
    pipeline.process_queue().await.unwrap();
    assert!(pipeline
        .backend
        .rows(tables::AGENT_COMMUNICATIONS)
        .iter()
        .all(|row| row["status"] != "sent"));
}

#[tokio::test]
async fn test_queue_bound_holds_while_offline() {
    let pipeline = setup().await;
    pipeline.handle_offline().await.unwrap();

    for _ in 0..10 {
        assert!(send(&pipeline, Priority::Low).await);
    }
    assert!(!send(&pipeline, Priority::High).await);

    assert_eq!(pipeline.queue_status().queue_length, 10);
    assert_eq!(stored_with(&pipeline, MessageStatus::Pending).await, 11);
}

#[tokio::test]
async fn test_recovery_enqueues_valid_and_fails_invalid() {
    let pipeline = setup().await;
    pipeline.handle_offline().await.unwrap();

    for _ in 0..3 {
        let msg = QueuedMessage::new(
            "dm1",
            "rules1",
            MessageType::Result,
            json!({"ok": true}),
            Priority::Medium,
            3,
        )
        .unwrap();
        pipeline
            .store()
            .persist_message(&msg, MessageStatus::Pending)
            .await
            .unwrap();
    }
    let mut broken = QueuedMessage::new(
        "dm1",
        "rules1",
        MessageType::Result,
        json!(null),
        Priority::Medium,
        3,
    )
    .unwrap();
    broken.sender.clear();
    pipeline
        .store()
        .persist_message(&broken, MessageStatus::Pending)
        .await
        .unwrap();

    let report = pipeline.recovery().recover_messages().await.unwrap();

    assert_eq!(report.recovered, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(pipeline.queue_status().queue_length, 3);
    assert_eq!(stored_with(&pipeline, MessageStatus::Failed).await, 1);
}

#[tokio::test]
async fn test_restart_resumes_offline_work_after_reconnecting() {
    let tmpdir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let config = Config {
        reconnect_initial_delay_ms: 20,
        reconnect_max_delay_ms: 40,
        ..config(&tmpdir)
    };

    let first = open(config.clone(), &backend).await;
    backend.set_online(false);
    first.handle_offline().await.unwrap();
    assert!(send(&first, Priority::High).await);
    assert!(send(&first, Priority::Low).await);
    first.shutdown().await;
    drop(first);

    backend.set_online(true);
    let second = open(config, &backend).await;

    let status = second.queue_status();
    assert!(!status.is_online);
    assert!(status.offline_state.unwrap().pending_sync);
    assert_eq!(status.queue_length, 0);

    second.start().await.unwrap();

    eventually(|| {
        let second = second.clone();
        async move { stored_with(&second, MessageStatus::Sent).await == 2 }
    })
    .await;

    assert!(second.is_online());
    assert_eq!(second.queue_status().queue_length, 0);
    assert_eq!(backend.rows(tables::AGENT_COMMUNICATIONS).len(), 2);

    second.shutdown().await;
}
