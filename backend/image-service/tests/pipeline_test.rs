//! End-to-end pipeline tests: upload through the service, consume with the
//! real consumer loop, check records and blobs.

mod common;

use async_trait::async_trait;
use common::{png_bytes, TestEnv};
use image_service::models::{ImageStatus, JobMessage};
use image_service::services::queue::{
    Consumer, ConsumerStats, Delivery, DeliveryHandler, JobQueue, Settlement,
};
use image_service::services::transform::DEFAULT_QUALITY;
use image_service::services::{ImageTransformer, Reconciler};
use image_service::storage::{ORIGINAL_AREA, THUMBNAIL_AREA};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

/// Run a consumer until the queue has nothing ready or in flight.
async fn drain(env: &TestEnv) -> ConsumerStats {
    let (tx, rx) = watch::channel(false);
    let mut consumer = Consumer::new(env.queue.clone(), env.config.worker.prefetch, rx);
    let processor = env.processor();
    let task = tokio::spawn(async move { consumer.run(processor).await });

    for _ in 0..500 {
        if env.queue.ready_len().await == 0 && env.queue.unacked_len().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    task.await.unwrap().unwrap()
}

#[tokio::test]
async fn uploaded_image_reaches_done_with_all_thumbnails() {
    let env = TestEnv::new().await;
    let receipt = env
        .state
        .uploads
        .submit("test.png", &png_bytes(1, 1))
        .await
        .unwrap();
    let original = env.state.uploads.fetch(receipt.image_id).await.unwrap().original_path;

    let stats = drain(&env).await;
    assert_eq!(stats.acked, 1);

    let record = env.state.uploads.fetch(receipt.image_id).await.unwrap();
    assert_eq!(record.status, ImageStatus::Done);
    assert_eq!(
        record.thumbnails.keys().cloned().collect::<Vec<_>>(),
        vec!["100x100", "1200x1200", "300x300"]
    );

    let transformer = ImageTransformer::new(env.store.clone(), DEFAULT_QUALITY);
    for path in record.thumbnails.values() {
        let info = transformer.probe(path).await.unwrap();
        // A 1x1 original is never upscaled
        assert_eq!((info.width, info.height), (1, 1));
    }

    assert!(!env.store.exists(&original).await);
    assert!(env.store.exists(&record.original_path).await);
    assert!(record.original_path.ends_with("_compressed.jpg"));
    assert_eq!(
        record.original_url.as_deref(),
        Some(format!("/uploads/{}", record.original_path).as_str())
    );
}

#[tokio::test]
async fn large_image_thumbnails_fit_their_bounds() {
    let env = TestEnv::new().await;
    let receipt = env
        .state
        .uploads
        .submit("wide.png", &png_bytes(2000, 500))
        .await
        .unwrap();

    drain(&env).await;

    let record = env.state.uploads.fetch(receipt.image_id).await.unwrap();
    let transformer = ImageTransformer::new(env.store.clone(), DEFAULT_QUALITY);
    let expected = [
        ("100x100", (100, 25)),
        ("300x300", (300, 75)),
        ("1200x1200", (1200, 300)),
    ];
    for (label, dims) in expected {
        let info = transformer.probe(&record.thumbnails[label]).await.unwrap();
        assert_eq!((info.width, info.height), dims, "size {label}");
    }
}

#[tokio::test]
async fn corrupt_original_ends_in_error_and_is_dead_lettered() {
    let env = TestEnv::new().await;
    let receipt = env
        .state
        .uploads
        .submit("broken.png", b"\x89PNG but not really")
        .await
        .unwrap();
    let original = env.state.uploads.fetch(receipt.image_id).await.unwrap().original_path;

    let stats = drain(&env).await;
    assert_eq!(stats.dead_lettered, 1);

    let record = env.state.uploads.fetch(receipt.image_id).await.unwrap();
    assert_eq!(record.status, ImageStatus::Error);
    assert!(record.error_message.is_some());
    assert!(record.thumbnails.is_empty());
    assert!(env.store.exists(&original).await);
    assert_eq!(env.queue.dead_letters().await.len(), 1);
}

#[tokio::test]
async fn unknown_image_and_garbage_messages_are_acked() {
    let env = TestEnv::new().await;
    let routing_key = env.config.queue.routing_key.clone();

    let ghost = JobMessage {
        image_id: Uuid::new_v4(),
        original_path: "original/ghost.png".into(),
        original_filename: "ghost.png".into(),
    };
    env.queue
        .publish(&routing_key, &ghost.to_vec().unwrap())
        .await
        .unwrap();
    env.queue.publish(&routing_key, b"not json").await.unwrap();

    let stats = drain(&env).await;

    assert_eq!(stats.acked, 2);
    assert!(env.queue.dead_letters().await.is_empty());
    assert!(env.repo.is_empty().await);
}

#[tokio::test]
async fn redelivered_job_after_crash_completes_once() {
    let env = TestEnv::new().await;
    let receipt = env
        .state
        .uploads
        .submit("again.png", &png_bytes(10, 10))
        .await
        .unwrap();

    // A worker takes the job and dies before settling it
    let lost = env.queue.fetch(1).await.unwrap();
    assert_eq!(lost.len(), 1);
    assert_eq!(env.queue.recover_unacked().await, 1);

    let stats = drain(&env).await;
    assert_eq!(stats.acked, 1);

    let record = env.state.uploads.fetch(receipt.image_id).await.unwrap();
    assert_eq!(record.status, ImageStatus::Done);
    assert_eq!(env.store.list(THUMBNAIL_AREA).await.unwrap().len(), 3);
}

#[tokio::test]
async fn crash_after_original_replaced_still_completes() {
    let env = TestEnv::new().await;
    let receipt = env
        .state
        .uploads
        .submit("late.png", &png_bytes(40, 30))
        .await
        .unwrap();
    let original = env.state.uploads.fetch(receipt.image_id).await.unwrap().original_path;

    // The first worker got as far as deleting the original, then died
    let lost = env.queue.fetch(1).await.unwrap();
    assert_eq!(lost.len(), 1);
    let transformer = ImageTransformer::new(env.store.clone(), DEFAULT_QUALITY);
    transformer
        .generate_thumbnails(&original, &env.config.processing.thumbnail_sizes)
        .await
        .unwrap();
    let compressed = transformer.compress(&original, DEFAULT_QUALITY).await.unwrap();
    env.store.delete(&original).await.unwrap();
    assert_eq!(env.queue.recover_unacked().await, 1);

    let stats = drain(&env).await;
    assert_eq!(stats.acked, 1);
    assert!(env.queue.dead_letters().await.is_empty());

    let record = env.state.uploads.fetch(receipt.image_id).await.unwrap();
    assert_eq!(record.status, ImageStatus::Done);
    assert_eq!(record.original_path, compressed);
    assert_eq!(record.thumbnails.len(), 3);
    assert_eq!(env.store.list(THUMBNAIL_AREA).await.unwrap().len(), 3);
}

#[tokio::test]
async fn concurrent_prefetch_processes_every_upload() {
    let env = TestEnv::with_env(&[("WORKER_PREFETCH", "4")]).await;
    let mut ids = Vec::new();
    for i in 0..6 {
        let receipt = env
            .state
            .uploads
            .submit(&format!("img{i}.png"), &png_bytes(20 + i, 10))
            .await
            .unwrap();
        ids.push(receipt.image_id);
    }

    let stats = drain(&env).await;
    assert_eq!(stats.acked, 6);

    for id in ids {
        let record = env.state.uploads.fetch(id).await.unwrap();
        assert_eq!(record.status, ImageStatus::Done);
    }
    assert_eq!(env.store.list(THUMBNAIL_AREA).await.unwrap().len(), 18);
}

#[tokio::test]
async fn shutdown_stops_consumer_without_losing_messages() {
    let env = TestEnv::new().await;
    let (tx, rx) = watch::channel(false);
    let mut consumer = Consumer::new(env.queue.clone(), 1, rx);
    let processor = env.processor();
    let task = tokio::spawn(async move { consumer.run(processor).await });

    tx.send(true).unwrap();
    let stats = task.await.unwrap().unwrap();
    assert_eq!(stats.received, 0);

    // Published after shutdown: stays queued for the next worker
    env.state
        .uploads
        .submit("later.png", &png_bytes(2, 2))
        .await
        .unwrap();
    assert_eq!(env.queue.ready_len().await, 1);
}

/// Handler that holds every delivery until released.
#[derive(Default)]
struct Gated {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl DeliveryHandler for Gated {
    async fn handle(&self, _delivery: &Delivery) -> Settlement {
        self.started.notify_one();
        self.release.notified().await;
        Settlement::Ack
    }
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_job_and_settles_it() {
    let env = TestEnv::new().await;
    let routing_key = env.config.queue.routing_key.clone();
    env.queue.publish(&routing_key, b"slow job").await.unwrap();

    let handler = Arc::new(Gated::default());
    let (tx, rx) = watch::channel(false);
    let mut consumer = Consumer::new(env.queue.clone(), 1, rx);
    let running = handler.clone();
    let task = tokio::spawn(async move { consumer.run(running).await });

    handler.started.notified().await;
    tx.send(true).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    assert_eq!(env.queue.unacked_len().await, 1);

    handler.release.notify_one();
    let stats = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("consumer exits after the job finishes")
        .unwrap()
        .unwrap();

    assert_eq!(stats.received, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(env.queue.unacked_len().await, 0);
    assert_eq!(env.queue.ready_len().await, 0);
    assert_eq!(env.queue.acked_count().await, 1);
}

#[tokio::test]
async fn reconciler_keeps_processed_blobs() {
    let env = TestEnv::new().await;
    env.state
        .uploads
        .submit("keep.png", &png_bytes(5, 5))
        .await
        .unwrap();
    drain(&env).await;
    env.store
        .write("original/stray.png", b"left over")
        .await
        .unwrap();

    let reconciler = Reconciler::new(env.repo.clone(), env.store.clone(), Duration::ZERO);
    let report = reconciler.run(false).await.unwrap();

    assert_eq!(report.removed, 1);
    assert_eq!(report.referenced, 4);
    assert_eq!(env.store.list(ORIGINAL_AREA).await.unwrap().len(), 1);
    assert_eq!(env.store.list(THUMBNAIL_AREA).await.unwrap().len(), 3);
}
