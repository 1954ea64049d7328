//! Shared fixtures for image-service integration tests.
#![allow(dead_code)]

use image::{DynamicImage, ImageOutputFormat, Rgba, RgbaImage};
use image_service::db::InMemoryImageRepository;
use image_service::services::queue::InMemoryQueue;
use image_service::services::{JobProcessor, ProcessorConfig};
use image_service::storage::BlobStore;
use image_service::{AppState, Config};
use resilience::RetryConfig;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const BOUNDARY: &str = "----image-service-test-boundary";

pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
    pub repo: Arc<InMemoryImageRepository>,
    pub queue: Arc<InMemoryQueue>,
    pub store: BlobStore,
    pub state: AppState,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_env(&[]).await
    }

    /// Build an environment with extra config variables on top of the defaults.
    pub async fn with_env(pairs: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let mut vars: HashMap<String, String> = HashMap::from([
            ("QUEUE_URL".to_string(), "memory://".to_string()),
            ("WORKER_EMBEDDED".to_string(), "true".to_string()),
            (
                "UPLOAD_DIR".to_string(),
                dir.path().display().to_string(),
            ),
        ]);
        for (k, v) in pairs {
            vars.insert(k.to_string(), v.to_string());
        }
        let config = Config::from_lookup(|key| vars.get(key).cloned()).expect("config");

        let store = BlobStore::open(&config.storage.upload_dir)
            .await
            .expect("blob store");
        let repo = Arc::new(InMemoryImageRepository::new());
        let queue = Arc::new(
            InMemoryQueue::new(config.queue.routing_key.clone())
                .with_poll_timeout(Duration::from_millis(20)),
        );
        let state = AppState::new(&config, repo.clone(), store.clone(), queue.clone());

        Self {
            dir,
            config,
            repo,
            queue,
            store,
            state,
        }
    }

    pub fn processor(&self) -> Arc<JobProcessor> {
        let mut config = ProcessorConfig::from(&self.config);
        config.retry = RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        };
        Arc::new(JobProcessor::new(
            self.repo.clone(),
            self.store.clone(),
            config,
        ))
    }
}

/// A semi-transparent PNG of the given size.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        width,
        height,
        Rgba([255, 0, 0, 128]),
    ));
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, ImageOutputFormat::Png)
        .expect("encode png");
    cursor.into_inner()
}

/// Content-Type header value for `multipart_body`.
pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={BOUNDARY}")
}

/// A single-field multipart body. `filename: None` omits the filename parameter.
pub fn multipart_body(field: &str, filename: Option<&str>, data: &[u8]) -> Vec<u8> {
    let disposition = match filename {
        Some(name) => format!("form-data; name=\"{field}\"; filename=\"{name}\""),
        None => format!("form-data; name=\"{field}\""),
    };
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: {disposition}\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}
