//! Transform engine - thumbnails and recompression for stored originals
//!
//! Works on storage-relative paths: reads an original from the blob store,
//! writes derived JPEGs back into it and returns their relative paths.
//! Outputs are keyed only by the source stem and the size label, so running
//! the same transform twice overwrites instead of accumulating files.
//!
//! Decoding, resizing and encoding run on the blocking pool.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ColorType, DynamicImage, RgbImage};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::models::ThumbnailSize;
use crate::storage::{BlobError, BlobStore, THUMBNAIL_AREA};

pub const DEFAULT_QUALITY: u8 = 85;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("image file not found: {0}")]
    NotFound(String),

    #[error("failed to decode image {path}: {message}")]
    Decode { path: String, message: String },

    #[error("failed to encode JPEG from {path}: {message}")]
    Encode { path: String, message: String },

    #[error("blob store error: {0}")]
    Storage(#[from] BlobError),

    #[error("transform task failed: {0}")]
    Task(String),
}

/// Basic facts about a stored image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub format: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImageTransformer {
    store: BlobStore,
    thumbnail_quality: u8,
}

impl ImageTransformer {
    pub fn new(store: BlobStore, thumbnail_quality: u8) -> Self {
        Self {
            store,
            thumbnail_quality: thumbnail_quality.clamp(1, 100),
        }
    }

    /// One JPEG per bound, each fitting inside its bound with the aspect ratio
    /// preserved and never upscaled. Returns size label → relative path.
    pub async fn generate_thumbnails(
        &self,
        original: &str,
        sizes: &[ThumbnailSize],
    ) -> Result<BTreeMap<String, String>, TransformError> {
        self.generate_thumbnails_from(original, original, sizes).await
    }

    /// Like `generate_thumbnails`, but decodes `source` while naming the
    /// outputs after `named_after`. Used to rebuild the thumbnails of an
    /// original that was already replaced by its compressed copy.
    pub async fn generate_thumbnails_from(
        &self,
        source: &str,
        named_after: &str,
        sizes: &[ThumbnailSize],
    ) -> Result<BTreeMap<String, String>, TransformError> {
        let stem = stem_of(named_after)?;
        let display = source.to_string();
        let source = self.existing(source).await?;
        let quality = self.thumbnail_quality;
        let sizes_owned = sizes.to_vec();

        let encoded = run_blocking(move || {
            let rgb = decode(&source, &display)?.to_rgb8();
            let (width, height) = rgb.dimensions();

            sizes_owned
                .iter()
                .map(|size| {
                    let (w, h) = fit_within(width, height, size.width, size.height);
                    let bytes = if (w, h) == (width, height) {
                        encode_jpeg(&rgb, quality)
                    } else {
                        encode_jpeg(&imageops::resize(&rgb, w, h, FilterType::Lanczos3), quality)
                    }
                    .map_err(|e| TransformError::Encode {
                        path: display.clone(),
                        message: e.to_string(),
                    })?;

                    debug!(
                        size = %size,
                        width = w,
                        height = h,
                        bytes = bytes.len(),
                        "Thumbnail encoded"
                    );
                    Ok((*size, bytes))
                })
                .collect::<Result<Vec<_>, TransformError>>()
        })
        .await?;

        let mut manifest = BTreeMap::new();
        for (size, bytes) in encoded {
            let relative = format!("{THUMBNAIL_AREA}/{stem}_{}.jpg", size.label());
            self.store.write(&relative, &bytes).await?;
            manifest.insert(size.label(), relative);
        }
        Ok(manifest)
    }

    /// Re-encode `original` as a JPEG at `quality` next to it, named
    /// `<stem>_compressed.jpg`. Returns the new relative path.
    pub async fn compress(&self, original: &str, quality: u8) -> Result<String, TransformError> {
        let source = self.existing(original).await?;
        let destination = compressed_path(original)?;
        let quality = quality.clamp(1, 100);
        let display = original.to_string();

        let bytes = run_blocking(move || {
            let rgb = decode(&source, &display)?.to_rgb8();
            encode_jpeg(&rgb, quality).map_err(|e| TransformError::Encode {
                path: display,
                message: e.to_string(),
            })
        })
        .await?;

        self.store.write(&destination, &bytes).await?;
        debug!(source = original, destination = %destination, bytes = bytes.len(), "Image compressed");
        Ok(destination)
    }

    /// Dimensions and detected format without a full decode.
    pub async fn probe(&self, path: &str) -> Result<ImageInfo, TransformError> {
        let source = self.existing(path).await?;
        let display = path.to_string();

        run_blocking(move || {
            let reader = image::io::Reader::open(&source)
                .and_then(|r| r.with_guessed_format())
                .map_err(|e| decode_error(&display, e))?;
            let format = reader.format().map(|f| format!("{f:?}").to_ascii_lowercase());
            let (width, height) = reader
                .into_dimensions()
                .map_err(|e| decode_error(&display, e))?;
            Ok(ImageInfo {
                width,
                height,
                format,
            })
        })
        .await
    }

    async fn existing(&self, relative: &str) -> Result<PathBuf, TransformError> {
        let path = self.store.resolve(relative)?;
        if !self.store.exists(relative).await {
            return Err(TransformError::NotFound(relative.to_string()));
        }
        Ok(path)
    }
}

/// Where `compress` writes the recompressed copy of `original`.
pub fn compressed_path(original: &str) -> Result<String, TransformError> {
    let stem = stem_of(original)?;
    Ok(match original.rsplit_once('/') {
        Some((parent, _)) => format!("{parent}/{stem}_compressed.jpg"),
        None => format!("{stem}_compressed.jpg"),
    })
}

/// Largest size fitting inside `max_w x max_h` with the same aspect ratio.
/// Images already inside the bound keep their size.
pub fn fit_within(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if width <= max_w && height <= max_h {
        return (width, height);
    }

    let ratio = f64::min(max_w as f64 / width as f64, max_h as f64 / height as f64);
    let w = ((width as f64 * ratio).round() as u32).clamp(1, max_w);
    let h = ((height as f64 * ratio).round() as u32).clamp(1, max_h);
    (w, h)
}

fn decode(path: &Path, display: &str) -> Result<DynamicImage, TransformError> {
    image::io::Reader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| decode_error(display, e))?
        .decode()
        .map_err(|e| decode_error(display, e))
}

fn decode_error(path: &str, e: impl std::fmt::Display) -> TransformError {
    TransformError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    }
}

fn encode_jpeg(img: &RgbImage, quality: u8) -> image::ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        img.as_raw(),
        img.width(),
        img.height(),
        ColorType::Rgb8,
    )?;
    Ok(buf)
}

fn stem_of(relative: &str) -> Result<String, TransformError> {
    Path::new(relative)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| TransformError::Storage(BlobError::InvalidPath(relative.to_string())))
}

async fn run_blocking<T, F>(f: F) -> Result<T, TransformError>
where
    F: FnOnce() -> Result<T, TransformError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransformError::Task(e.to_string()))?
}
