//! Native decode-time-shrink backend.
//!
//! libvips initializes once per process and cannot come back after
//! `vips_shutdown`, so the lifecycle is an explicit state machine:
//! `Uninitialized → Ready → ShutDown`, with `ShutDown` terminal. `init` after
//! shutdown fails fast instead of pretending to restart. Built without the
//! `vips` feature the state machine still runs but `is_available` is always
//! false and the decode chain falls through to the staged/generic paths.

use image::DynamicImage;
use parking_lot::Mutex;
use std::path::Path;
#[cfg(not(feature = "vips"))]
use tracing::debug;
use tracing::info;

use crate::error::ThumbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendState {
    Uninitialized,
    Ready,
    ShutDown,
}

pub struct NativeBackend {
    state: Mutex<BackendState>,
    #[cfg(feature = "vips")]
    app: Mutex<Option<libvips::VipsApp>>,
}

static BACKEND: NativeBackend = NativeBackend {
    state: Mutex::new(BackendState::Uninitialized),
    #[cfg(feature = "vips")]
    app: Mutex::new(None),
};

/// The process-wide backend instance. The underlying library is global
/// state, so everything shares this one.
pub fn global() -> &'static NativeBackend {
    &BACKEND
}

impl NativeBackend {
    /// A private instance, useful for exercising the lifecycle without
    /// touching the process-wide singleton.
    pub fn new() -> NativeBackend {
        NativeBackend {
            state: Mutex::new(BackendState::Uninitialized),
            #[cfg(feature = "vips")]
            app: Mutex::new(None),
        }
    }

    /// Bring the backend up. Idempotent while `Ready`; fails with
    /// [`ThumbError::BackendShutDown`] once `shutdown` has run.
    pub fn init(&self) -> Result<(), ThumbError> {
        let mut state = self.state.lock();
        match *state {
            BackendState::Ready => Ok(()),
            BackendState::ShutDown => Err(ThumbError::BackendShutDown),
            BackendState::Uninitialized => {
                self.start_library()?;
                *state = BackendState::Ready;
                Ok(())
            }
        }
    }

    /// Stop the backend for the rest of the process. Idempotent; terminal.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if *state == BackendState::Ready {
            self.stop_library();
            info!("native decode backend shut down");
        }
        *state = BackendState::ShutDown;
    }

    /// Whether `decode_at` can be expected to work right now.
    pub fn is_available(&self) -> bool {
        cfg!(feature = "vips") && *self.state.lock() == BackendState::Ready
    }

    #[cfg(feature = "vips")]
    fn start_library(&self) -> Result<(), ThumbError> {
        let app = libvips::VipsApp::new("thumbnail-engine", false)
            .map_err(|e| ThumbError::BackendInit(e.to_string()))?;
        app.concurrency_set(2);
        *self.app.lock() = Some(app);
        info!("native decode backend ready");
        Ok(())
    }

    #[cfg(not(feature = "vips"))]
    fn start_library(&self) -> Result<(), ThumbError> {
        debug!("native decode backend not compiled in; marking ready without a library");
        Ok(())
    }

    #[cfg(feature = "vips")]
    fn stop_library(&self) {
        // Dropping the app runs vips_shutdown; that is what makes ShutDown
        // terminal.
        self.app.lock().take();
    }

    #[cfg(not(feature = "vips"))]
    fn stop_library(&self) {}

    /// Decode `path` straight to a size bounded by `target_w`×`target_h`,
    /// never materializing the full-resolution pixels. Errors are plain
    /// strings: the loader records them as one failed attempt and moves on.
    #[cfg(feature = "vips")]
    pub fn decode_at(
        &self,
        path: &Path,
        target_w: u32,
        target_h: u32,
    ) -> Result<DynamicImage, String> {
        use libvips::ops;

        if !self.is_available() {
            return Err("native backend not initialized".into());
        }
        let filename = path.to_str().ok_or_else(|| "non-utf8 path".to_string())?;
        let opts = ops::ThumbnailOptions {
            height: target_h as i32,
            size: ops::Size::Down,
            ..ops::ThumbnailOptions::default()
        };
        let thumb = ops::thumbnail_with_opts(filename, target_w as i32, &opts)
            .map_err(|e| format!("vips thumbnail: {e}"))?;

        let width = thumb.get_width() as u32;
        let height = thumb.get_height() as u32;
        let bands = thumb.get_bands();
        let data = thumb.image_write_to_memory();
        match bands {
            1 => image::GrayImage::from_raw(width, height, data)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| "vips buffer size mismatch".to_string()),
            3 => image::RgbImage::from_raw(width, height, data)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| "vips buffer size mismatch".to_string()),
            4 => image::RgbaImage::from_raw(width, height, data)
                .map(DynamicImage::ImageRgba8)
                .ok_or_else(|| "vips buffer size mismatch".to_string()),
            n => Err(format!("unsupported band count {n}")),
        }
    }

    #[cfg(not(feature = "vips"))]
    pub fn decode_at(
        &self,
        _path: &Path,
        _target_w: u32,
        _target_h: u32,
    ) -> Result<DynamicImage, String> {
        Err("native backend not compiled in".into())
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        NativeBackend::new()
    }
}
