//! Thumbnail generation and caching engine for Lightbox
//!
//! This crate turns a mutable, file-backed media library into a warm disk
//! cache of previews: images are decoded under a strict memory ceiling,
//! videos go through ffmpeg frame extraction, and folders get composite
//! previews sampled from their contents. A background orchestrator keeps the
//! cache converged with the library across scans.
//!
//! # Features
//!
//! - **Bounded decoding**: dimension and pixel caps hold the working set of
//!   any single decode, whatever the source resolution
//! - **Fallback chain**: native decoder (libvips, optional), staged JPEG
//!   shrink, then a plain bounded decode; exhaustion is an error with the
//!   whole chain's failures attached
//! - **Video stills**: seek-ladder frame extraction via ffmpeg/ffprobe with
//!   per-tool timeouts
//! - **Folder composites**: deterministic child sampling rendered over a
//!   folder glyph
//! - **Request coalescing**: concurrent misses for one item share a single
//!   generation
//! - **Self-cleaning store**: sidecar-tracked entries swept when their
//!   source leaves the library

pub mod batch;
pub mod composite;
pub mod error;
pub mod flight;
pub mod generate;
pub mod key;
pub mod loader;
pub mod media;
pub mod memory;
pub mod native;
pub mod orchestrator;
pub mod run;
pub mod status;
pub mod store;
pub mod video;

pub use error::{IndexError, Result, ThumbError};
pub use generate::Generator;
pub use key::CacheKey;
pub use media::{MediaFile, MediaIndex, MediaKind, MemoryIndex};
pub use orchestrator::Orchestrator;
pub use run::{RunMode, RunSnapshot};
pub use status::EngineStatus;
pub use store::{CacheAccounting, ThumbnailStore};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine configuration with workable defaults for a desktop library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub enabled: bool,
    pub library_root: PathBuf,
    pub cache_dir: PathBuf,
    pub thumb_width: u32,
    pub thumb_height: u32,
    pub jpeg_quality: u8,
    /// Longest decoded edge for any single image.
    pub max_decode_dimension: u32,
    /// Pixel-count ceiling for any single decode.
    pub max_decode_pixels: u64,
    /// Batch workers; 0 derives a count from the CPU.
    pub worker_count: usize,
    pub batch_size: usize,
    pub run_interval_secs: u64,
    /// Memory usage percentage above which workers back off; 0 disables.
    pub memory_threshold_pct: u8,
    pub tool_timeout_secs: u64,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            library_root: PathBuf::from("."),
            cache_dir: default_cache_dir(),
            thumb_width: 512,
            thumb_height: 512,
            jpeg_quality: 80,
            max_decode_dimension: 4096,
            max_decode_pixels: 16_000_000, // ~16 megapixels
            worker_count: 0,
            batch_size: 256,
            run_interval_secs: 3600,
            memory_threshold_pct: 85,
            tool_timeout_secs: 30,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
        }
    }
}

impl EngineConfig {
    /// Resolved worker count: the configured value, or a quarter of the
    /// CPUs clamped to 1..=4 when left at zero.
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            return self.worker_count;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        (cores / 4).clamp(1, 4)
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("lightbox")
        .join("thumbnails")
}

/// Initialize the optional native decode backend. Call once at startup;
/// harmless when the backend is not compiled in.
pub fn init_native_backend() -> Result<()> {
    native::global().init()
}

/// Tear the native backend down. Irreversible for the process lifetime.
pub fn shutdown_native_backend() {
    native::global().shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_sane() {
        let config = EngineConfig::default();
        assert!(config.enabled);
        assert_eq!(config.thumb_width, 512);
        assert!(config.max_decode_pixels > 0);
        assert!(config.cache_dir.ends_with("lightbox/thumbnails"));
    }

    #[test]
    fn test_effective_worker_count_bounds() {
        let mut config = EngineConfig::default();
        assert!((1..=4).contains(&config.effective_worker_count()));
        config.worker_count = 9;
        assert_eq!(config.effective_worker_count(), 9);
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = EngineConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.batch_size, config.batch_size);
        assert_eq!(back.library_root, config.library_root);
    }
}
