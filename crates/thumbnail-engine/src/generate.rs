//! Per-item thumbnail generation.
//!
//! One generator instance owns the decode pipeline for a library: images go
//! through the bounded loader, videos through ffmpeg frame extraction, and
//! folders through the composite renderer. Output is an encoded thumbnail
//! (JPEG for media, PNG for folders) persisted to the store. Concurrent
//! requests for the same item coalesce onto a single generation via per-key
//! locks.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, RgbaImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::composite::FolderComposer;
use crate::error::{Result, ThumbError};
use crate::flight::KeyedLocks;
use crate::key::CacheKey;
use crate::loader::ImageLoader;
use crate::media::{MediaFile, MediaIndex, MediaKind};
use crate::run::ItemOutcome;
use crate::store::ThumbnailStore;
use crate::video::FrameExtractor;
use crate::EngineConfig;

pub struct Generator {
    store: Arc<ThumbnailStore>,
    loader: Arc<ImageLoader>,
    extractor: Arc<FrameExtractor>,
    composer: FolderComposer,
    locks: KeyedLocks,
    library_root: PathBuf,
    thumb_width: u32,
    thumb_height: u32,
    jpeg_quality: u8,
}

impl Generator {
    pub fn new(
        config: &EngineConfig,
        index: Arc<dyn MediaIndex>,
        store: Arc<ThumbnailStore>,
    ) -> Generator {
        let loader = Arc::new(ImageLoader::new(
            config.max_decode_dimension,
            config.max_decode_pixels,
        ));
        let extractor = Arc::new(FrameExtractor::new(
            config.ffmpeg_path.clone(),
            config.ffprobe_path.clone(),
            Duration::from_secs(config.tool_timeout_secs),
        ));
        let composer = FolderComposer::new(
            index,
            Arc::clone(&loader),
            Arc::clone(&extractor),
            config.library_root.clone(),
        );
        Generator {
            store,
            loader,
            extractor,
            composer,
            locks: KeyedLocks::new(),
            library_root: config.library_root.clone(),
            thumb_width: config.thumb_width,
            thumb_height: config.thumb_height,
            jpeg_quality: config.jpeg_quality,
        }
    }

    /// Serve `rel_path` from the cache, generating on a miss. Concurrent
    /// callers for the same item wait for one generation and then share it.
    pub async fn get_or_generate(
        &self,
        rel_path: &str,
        kind: MediaKind,
        token: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let abs = self.library_root.join(rel_path);
        let key = CacheKey::for_source(&abs, kind);
        if let Some(bytes) = self.store.read(&key).await {
            return Ok(bytes);
        }
        let _guard = self.locks.acquire(key.stem()).await;
        // A racing caller may have finished while we waited.
        if let Some(bytes) = self.store.read(&key).await {
            return Ok(bytes);
        }
        let bytes = self.render_item(rel_path, &abs, kind, token).await?;
        if let Err(e) = self.store.write(&key, &bytes, &abs).await {
            warn!("cache write failed for {rel_path}: {e}");
        }
        Ok(bytes)
    }

    /// Batch-facing entry point: existing entries are skipped, except for
    /// folders, whose composites are re-rendered every run because the
    /// child set may have changed without touching the folder itself.
    pub async fn process_item(
        &self,
        file: &MediaFile,
        token: &CancellationToken,
    ) -> Result<ItemOutcome> {
        let abs = self.library_root.join(&file.rel_path);
        let key = CacheKey::for_source(&abs, file.kind);
        let skippable = file.kind != MediaKind::Folder;
        if skippable && self.store.exists(&key).await {
            return Ok(ItemOutcome::Skipped);
        }
        let _guard = self.locks.acquire(key.stem()).await;
        if skippable && self.store.exists(&key).await {
            return Ok(ItemOutcome::Skipped);
        }
        let bytes = self.render_item(&file.rel_path, &abs, file.kind, token).await?;
        if let Err(e) = self.store.write(&key, &bytes, &abs).await {
            warn!("cache write failed for {}: {e}", file.rel_path);
        }
        Ok(ItemOutcome::Generated)
    }

    pub fn store(&self) -> &ThumbnailStore {
        &self.store
    }

    async fn render_item(
        &self,
        rel_path: &str,
        abs: &Path,
        kind: MediaKind,
        token: &CancellationToken,
    ) -> Result<Vec<u8>> {
        match kind {
            MediaKind::Image => {
                check_source(abs)?;
                let decoded = match self.decode_image(abs, token).await {
                    Ok(img) => img,
                    Err(e @ ThumbError::DecodeExhausted { .. }) => {
                        // Some camera formats are video containers wearing an
                        // image extension; give ffmpeg one try.
                        debug!("image decode exhausted for {rel_path}, trying frame extraction");
                        match self.extractor.extract_frame(abs, token).await {
                            Ok(frame) => frame,
                            Err(f) if f.is_cancellation() => return Err(f),
                            Err(_) => return Err(e),
                        }
                    }
                    Err(e) => return Err(e),
                };
                let fitted = fit_within(decoded, self.thumb_width, self.thumb_height);
                self.encode_jpeg(&fitted, abs)
            }
            MediaKind::Video => {
                check_source(abs)?;
                let frame = self.extractor.extract_frame(abs, token).await?;
                let fitted = fit_within(frame, self.thumb_width, self.thumb_height);
                self.encode_jpeg(&fitted, abs)
            }
            MediaKind::Folder => {
                let canvas = self.composer.render(rel_path, token).await;
                if token.is_cancelled() {
                    // A partial composite must not reach the cache.
                    return Err(ThumbError::Cancelled("composite render"));
                }
                encode_png(&canvas, abs)
            }
            MediaKind::Other => Err(ThumbError::Unsupported(abs.to_path_buf())),
        }
    }

    async fn decode_image(&self, abs: &Path, token: &CancellationToken) -> Result<DynamicImage> {
        let loader = Arc::clone(&self.loader);
        let path = abs.to_path_buf();
        let token = token.clone();
        let (tw, th) = (self.thumb_width, self.thumb_height);
        match tokio::task::spawn_blocking(move || loader.load(&path, tw, th, &token)).await {
            Ok(result) => result,
            Err(e) => Err(ThumbError::DecodeExhausted {
                path: abs.to_path_buf(),
                detail: format!("decoder panicked: {e}"),
            }),
        }
    }

    fn encode_jpeg(&self, img: &DynamicImage, abs: &Path) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut buffer, self.jpeg_quality);
        img.to_rgb8()
            .write_with_encoder(encoder)
            .map_err(|e| ThumbError::Encode {
                path: abs.to_path_buf(),
                source: e,
            })?;
        Ok(buffer)
    }
}

fn check_source(abs: &Path) -> Result<()> {
    match std::fs::metadata(abs) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ThumbError::NotFound(abs.to_path_buf()))
        }
        Err(e) => Err(ThumbError::DecodeExhausted {
            path: abs.to_path_buf(),
            detail: format!("stat: {e}"),
        }),
    }
}

fn encode_png(canvas: &RgbaImage, abs: &Path) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    canvas
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .map_err(|e| ThumbError::Encode {
            path: abs.to_path_buf(),
            source: e,
        })?;
    Ok(buffer)
}

/// Fit into the thumbnail box preserving aspect ratio; never upscale.
fn fit_within(img: DynamicImage, max_w: u32, max_h: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w <= max_w && h <= max_h {
        return img;
    }
    img.resize(max_w, max_h, FilterType::Lanczos3)
}
