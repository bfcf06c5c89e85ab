//! Bounded-memory image loading.
//!
//! Sources can be arbitrarily large, so decoding is constrained: probe the
//! header for dimensions, and if they blow past the configured caps, decode
//! through a chain of progressively less clever strategies — native
//! decode-at-size, a staged two-pass shrink for JPEG, then a plain
//! decode-and-resize. Every attempt failure is logged and the next strategy
//! tried; only exhausting the chain fails the load.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, ThumbError};
use crate::native;

pub struct ImageLoader {
    max_dimension: u32,
    max_pixels: u64,
}

impl ImageLoader {
    pub fn new(max_dimension: u32, max_pixels: u64) -> ImageLoader {
        ImageLoader {
            max_dimension,
            max_pixels,
        }
    }

    /// Decode `path` for a `target_w`×`target_h` thumbnail.
    ///
    /// Sources within the caps come back at their native size (the caller
    /// fits them into the target box); oversized sources come back already
    /// shrunk, never exceeding either cap. Blocking; run it on the blocking
    /// pool. Cancellation is observed between chain attempts.
    pub fn load(
        &self,
        path: &Path,
        target_w: u32,
        target_h: u32,
        token: &CancellationToken,
    ) -> Result<DynamicImage> {
        let (width, height, format) = match probe_dimensions(path) {
            Ok(probed) => probed,
            Err(e) => {
                // Probe failed: open in full, accepting the transient
                // memory spike, and clamp the result to the caps.
                debug!("dimension probe failed for {}: {e}", path.display());
                return self.open_unprobed(path);
            }
        };

        if self.within_caps(width, height) {
            return decode_oriented(path).map_err(|e| ThumbError::DecodeExhausted {
                path: path.to_path_buf(),
                detail: format!("open: {e}"),
            });
        }

        let (bounded_w, bounded_h) = self.bounded_dims(width, height);
        debug!(
            "constrained decode for {}: {width}x{height} -> {bounded_w}x{bounded_h}",
            path.display()
        );
        let mut failures: Vec<String> = Vec::new();

        if token.is_cancelled() {
            return Err(ThumbError::Cancelled("image decode"));
        }
        let backend = native::global();
        if backend.is_available() {
            match backend.decode_at(path, target_w, target_h) {
                Ok(img) => return Ok(img),
                Err(e) => {
                    debug!("native decode failed for {}: {e}", path.display());
                    failures.push(format!("native: {e}"));
                }
            }
        } else {
            failures.push("native: unavailable".to_string());
        }

        if token.is_cancelled() {
            return Err(ThumbError::Cancelled("image decode"));
        }
        if format == Some(ImageFormat::Jpeg) {
            match staged_jpeg(path, target_w, target_h) {
                Ok(img) => return Ok(img),
                Err(e) => {
                    warn!("staged JPEG decode failed for {}: {e}", path.display());
                    failures.push(format!("staged jpeg: {e}"));
                }
            }
        }

        if token.is_cancelled() {
            return Err(ThumbError::Cancelled("image decode"));
        }
        match decode_oriented(path) {
            Ok(img) => Ok(img.resize(bounded_w, bounded_h, FilterType::Lanczos3)),
            Err(e) => {
                warn!("generic decode failed for {}: {e}", path.display());
                failures.push(format!("generic: {e}"));
                Err(ThumbError::DecodeExhausted {
                    path: path.to_path_buf(),
                    detail: failures.join("; "),
                })
            }
        }
    }

    /// Full open when the header gave nothing. The decode itself is
    /// unbounded, but the returned image is still clamped to the caps.
    fn open_unprobed(&self, path: &Path) -> Result<DynamicImage> {
        let img = decode_oriented(path).map_err(|e| ThumbError::DecodeExhausted {
            path: path.to_path_buf(),
            detail: format!("open after failed probe: {e}"),
        })?;
        let (w, h) = img.dimensions();
        if self.within_caps(w, h) {
            return Ok(img);
        }
        let (bw, bh) = self.bounded_dims(w, h);
        Ok(img.resize(bw, bh, FilterType::Lanczos3))
    }

    fn within_caps(&self, width: u32, height: u32) -> bool {
        width <= self.max_dimension
            && height <= self.max_dimension
            && (width as u64) * (height as u64) <= self.max_pixels
    }

    /// Largest dimensions satisfying both caps: clamp the longer side to the
    /// dimension cap first, then uniformly scale under the pixel cap.
    /// Scale factors are floating point, final dimensions truncate.
    fn bounded_dims(&self, width: u32, height: u32) -> (u32, u32) {
        let mut w = width as f64;
        let mut h = height as f64;

        let longer = w.max(h);
        if longer > self.max_dimension as f64 {
            let scale = self.max_dimension as f64 / longer;
            w *= scale;
            h *= scale;
        }

        let pixels = w * h;
        if pixels > self.max_pixels as f64 {
            let scale = (self.max_pixels as f64 / pixels).sqrt();
            w *= scale;
            h *= scale;
        }

        ((w as u32).max(1), (h as u32).max(1))
    }
}

/// Header-only dimension probe. Returns the detected format as well so the
/// chain knows whether the staged JPEG path applies.
fn probe_dimensions(path: &Path) -> std::result::Result<(u32, u32, Option<ImageFormat>), String> {
    let reader = ImageReader::open(path)
        .map_err(|e| e.to_string())?
        .with_guessed_format()
        .map_err(|e| e.to_string())?;
    let format = reader.format();
    let (width, height) = reader.into_dimensions().map_err(|e| e.to_string())?;
    Ok((width, height, format))
}

/// Two-pass shrink for large JPEGs: when the source is more than 4× the
/// target in either dimension, first drop to 2× target with a cheap filter
/// and release the full-resolution buffer, then do the quality resize over
/// the small intermediate.
fn staged_jpeg(path: &Path, target_w: u32, target_h: u32) -> std::result::Result<DynamicImage, String> {
    let img = ImageReader::open(path)
        .map_err(|e| e.to_string())?
        .with_guessed_format()
        .map_err(|e| e.to_string())?
        .decode()
        .map_err(|e| e.to_string())?;
    let (w, h) = img.dimensions();

    let shrunk = if w > target_w * 4 || h > target_h * 4 {
        let intermediate = img.resize(target_w * 2, target_h * 2, FilterType::Nearest);
        drop(img);
        intermediate.resize(target_w, target_h, FilterType::Lanczos3)
    } else if w > target_w || h > target_h {
        img.resize(target_w, target_h, FilterType::Lanczos3)
    } else {
        img
    };
    Ok(apply_orientation(shrunk, exif_orientation(path)))
}

/// Plain decode with EXIF orientation applied.
fn decode_oriented(path: &Path) -> std::result::Result<DynamicImage, String> {
    let img = ImageReader::open(path)
        .map_err(|e| e.to_string())?
        .with_guessed_format()
        .map_err(|e| e.to_string())?
        .decode()
        .map_err(|e| e.to_string())?;
    Ok(apply_orientation(img, exif_orientation(path)))
}

/// EXIF orientation value (1..=8), defaulting to 1 for anything unreadable.
fn exif_orientation(path: &Path) -> u16 {
    match rexif::parse_file(path) {
        Ok(exif) => exif
            .entries
            .iter()
            .find(|entry| entry.tag == rexif::ExifTag::Orientation)
            .and_then(|entry| match &entry.value {
                rexif::TagValue::U16(values) => values.first().copied(),
                _ => None,
            })
            .unwrap_or(1),
        Err(_) => 1,
    }
}

fn apply_orientation(img: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.fliph().rotate270(),
        6 => img.rotate90(),
        7 => img.fliph().rotate90(),
        8 => img.rotate270(),
        _ => img,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn write_png(path: &Path, width: u32, height: u32) {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 30, 30]));
        img.save(path).unwrap();
    }

    fn write_jpeg(path: &Path, width: u32, height: u32) {
        let img = RgbImage::from_pixel(width, height, Rgb([30, 200, 30]));
        img.save(path).unwrap();
    }

    #[test]
    fn test_bounded_dims_dimension_cap() {
        let loader = ImageLoader::new(4096, 16_000_000);
        assert_eq!(loader.bounded_dims(10_000, 5_000), (4096, 2048));
        // Portrait clamps the longer side too.
        assert_eq!(loader.bounded_dims(5_000, 10_000), (2048, 4096));
    }

    #[test]
    fn test_bounded_dims_pixel_cap() {
        let loader = ImageLoader::new(8192, 16_000_000);
        // 36 Mpx square scales by sqrt(4/9) = 2/3.
        assert_eq!(loader.bounded_dims(6_000, 6_000), (4000, 4000));
    }

    #[test]
    fn test_bounded_dims_both_caps() {
        let loader = ImageLoader::new(100, 5_000);
        let (w, h) = loader.bounded_dims(3_000, 2_000);
        assert!(w <= 100 && h <= 100);
        assert!((w as u64) * (h as u64) <= 5_000);
        assert!(w >= 1 && h >= 1);
    }

    #[test]
    fn test_within_caps_passthrough() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.png");
        write_png(&path, 60, 40);

        let loader = ImageLoader::new(4096, 16_000_000);
        let img = loader
            .load(&path, 32, 32, &CancellationToken::new())
            .unwrap();
        // Within caps: opened at native size, the caller does the final fit.
        assert_eq!(img.dimensions(), (60, 40));
    }

    #[test]
    fn test_oversized_png_is_bounded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.png");
        write_png(&path, 300, 200);

        let loader = ImageLoader::new(100, 10_000);
        let img = loader
            .load(&path, 64, 64, &CancellationToken::new())
            .unwrap();
        let (w, h) = img.dimensions();
        assert!(w <= 100 && h <= 100);
        assert!((w as u64) * (h as u64) <= 10_000);
    }

    #[test]
    fn test_oversized_jpeg_staged_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.jpg");
        write_jpeg(&path, 900, 600);

        let loader = ImageLoader::new(100, 10_000);
        // 900 > 4*100, so this runs the two-stage shrink.
        let img = loader
            .load(&path, 100, 100, &CancellationToken::new())
            .unwrap();
        let (w, h) = img.dimensions();
        assert!(w <= 100 && h <= 100);
        assert!(w == 100 || h == 100);
    }

    #[test]
    fn test_memory_bound_property() {
        let dir = tempdir().unwrap();
        let loader = ImageLoader::new(64, 3_000);
        for (i, (w, h)) in [(200u32, 80u32), (80, 200), (500, 20), (128, 128)]
            .iter()
            .enumerate()
        {
            let path = dir.path().join(format!("img{i}.png"));
            write_png(&path, *w, *h);
            let img = loader
                .load(&path, 48, 48, &CancellationToken::new())
                .unwrap();
            let (ow, oh) = img.dimensions();
            assert!(ow <= 64 && oh <= 64, "{ow}x{oh} exceeds dimension cap");
            assert!((ow as u64) * (oh as u64) <= 3_000, "{ow}x{oh} exceeds pixel cap");
        }
    }

    #[test]
    fn test_unreadable_file_exhausts_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not-an-image.txt");
        std::fs::write(&path, "plain text").unwrap();

        let loader = ImageLoader::new(4096, 16_000_000);
        let err = loader
            .load(&path, 64, 64, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ThumbError::DecodeExhausted { .. }));
    }

    #[test]
    fn test_cancelled_before_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.png");
        write_png(&path, 300, 200);

        let token = CancellationToken::new();
        token.cancel();
        let loader = ImageLoader::new(100, 10_000);
        let err = loader.load(&path, 64, 64, &token).unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_apply_orientation_rotates() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 0, 255]));
        let img = DynamicImage::ImageRgb8(img);

        let rotated = apply_orientation(img.clone(), 6);
        assert_eq!(rotated.dimensions(), (1, 2));
        let unchanged = apply_orientation(img, 1);
        assert_eq!(unchanged.dimensions(), (2, 1));
    }

    #[test]
    fn test_orientation_default_without_exif() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.png");
        write_png(&path, 10, 10);
        assert_eq!(exif_orientation(&path), 1);
    }
}
