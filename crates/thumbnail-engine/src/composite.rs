//! Folder composite previews.
//!
//! A folder is previewed by sampling up to four child images/videos (direct
//! children first, then deeper levels), cropping each to a square tile, and
//! laying the tiles over a drawn folder silhouette on a transparent canvas.
//! Rendering never fails: an unusable child is skipped, and a folder with no
//! usable children gets the bare glyph. No cache I/O happens here.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Pixel, Rgba, RgbaImage};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::loader::ImageLoader;
use crate::media::{MediaFile, MediaIndex, MediaKind};
use crate::video::FrameExtractor;

/// Composite canvas edge; folder previews are always this size.
pub const CANVAS: u32 = 512;
/// Child tile edge within the canvas.
const CELL: u32 = 180;
/// Children sampled into a composite.
const SAMPLE_SIZE: usize = 4;
/// Levels below the folder the sampler descends when direct children are
/// not enough.
const SAMPLE_DEPTH: usize = 3;
/// Per-folder listing cap while sampling.
const CHILD_QUERY_LIMIT: usize = 16;

const FOLDER_TAB: Rgba<u8> = Rgba([236, 196, 92, 255]);
const FOLDER_BODY: Rgba<u8> = Rgba([245, 211, 116, 255]);
const FOLDER_PANEL: Rgba<u8> = Rgba([250, 233, 178, 255]);
const TILE_BORDER: Rgba<u8> = Rgba([255, 255, 255, 255]);
const TILE_SHADOW: Rgba<u8> = Rgba([0, 0, 0, 90]);

pub struct FolderComposer {
    index: Arc<dyn MediaIndex>,
    loader: Arc<ImageLoader>,
    extractor: Arc<FrameExtractor>,
    library_root: PathBuf,
}

impl FolderComposer {
    pub fn new(
        index: Arc<dyn MediaIndex>,
        loader: Arc<ImageLoader>,
        extractor: Arc<FrameExtractor>,
        library_root: PathBuf,
    ) -> FolderComposer {
        FolderComposer {
            index,
            loader,
            extractor,
            library_root,
        }
    }

    /// Render the composite for `folder_rel`. Always produces a canvas;
    /// cancellation just stops further child decodes.
    pub async fn render(&self, folder_rel: &str, token: &CancellationToken) -> RgbaImage {
        let children = self.sample_children(folder_rel).await;
        let mut tiles: Vec<RgbaImage> = Vec::new();
        for child in &children {
            if token.is_cancelled() {
                break;
            }
            match self.decode_tile(child, token).await {
                Some(tile) => tiles.push(tile),
                None => debug!("skipping unusable child {}", child.rel_path),
            }
        }
        compose(&tiles)
    }

    /// Deterministic child sample: per folder the index returns images
    /// before videos, and each level is exhausted before descending to the
    /// next, down to the depth limit.
    async fn sample_children(&self, folder_rel: &str) -> Vec<MediaFile> {
        let mut picked: Vec<MediaFile> = Vec::new();
        let mut level = vec![folder_rel.to_string()];
        for _ in 0..SAMPLE_DEPTH {
            if picked.len() >= SAMPLE_SIZE || level.is_empty() {
                break;
            }
            let mut next_level: Vec<String> = Vec::new();
            for folder in &level {
                if picked.len() >= SAMPLE_SIZE {
                    break;
                }
                match self.index.files_in_folder(folder, CHILD_QUERY_LIMIT).await {
                    Ok(files) => {
                        for file in files {
                            if picked.len() >= SAMPLE_SIZE {
                                break;
                            }
                            picked.push(file);
                        }
                    }
                    Err(e) => warn!("child query failed for {folder}: {e}"),
                }
                if picked.len() < SAMPLE_SIZE {
                    match self.index.subfolders(folder).await {
                        Ok(subs) => {
                            next_level.extend(subs.into_iter().map(|f| f.rel_path))
                        }
                        Err(e) => warn!("subfolder query failed for {folder}: {e}"),
                    }
                }
            }
            level = next_level;
        }
        picked
    }

    async fn decode_tile(
        &self,
        child: &MediaFile,
        token: &CancellationToken,
    ) -> Option<RgbaImage> {
        let abs = self.library_root.join(&child.rel_path);
        let decoded: DynamicImage = match child.kind {
            MediaKind::Image => {
                let loader = Arc::clone(&self.loader);
                let token = token.clone();
                match tokio::task::spawn_blocking(move || loader.load(&abs, CELL, CELL, &token))
                    .await
                {
                    Ok(Ok(img)) => img,
                    Ok(Err(e)) => {
                        debug!("tile decode failed for {}: {e}", child.rel_path);
                        return None;
                    }
                    Err(e) => {
                        warn!("tile decode task failed for {}: {e}", child.rel_path);
                        return None;
                    }
                }
            }
            MediaKind::Video => match self.extractor.extract_frame(&abs, token).await {
                Ok(img) => img,
                Err(e) => {
                    debug!("tile frame extraction failed for {}: {e}", child.rel_path);
                    return None;
                }
            },
            // The sampler only returns media files.
            MediaKind::Folder | MediaKind::Other => return None,
        };
        Some(square_tile(&decoded))
    }
}

/// Center-crop to a square and scale to the cell size.
fn square_tile(img: &DynamicImage) -> RgbaImage {
    let (w, h) = img.dimensions();
    let side = w.min(h).max(1);
    let x = (w - side) / 2;
    let y = (h - side) / 2;
    let square = img.crop_imm(x, y, side, side);
    imageops::resize(&square.to_rgba8(), CELL, CELL, FilterType::Lanczos3)
}

fn compose(tiles: &[RgbaImage]) -> RgbaImage {
    let mut canvas = RgbaImage::new(CANVAS, CANVAS);
    draw_folder_glyph(&mut canvas);
    for (tile, (x, y)) in tiles.iter().zip(tile_positions(tiles.len())) {
        draw_tile(&mut canvas, tile, x, y);
    }
    canvas
}

/// Folder silhouette: tab, body, inner panel.
fn draw_folder_glyph(canvas: &mut RgbaImage) {
    fill_rect(canvas, 40, 64, 176, 56, FOLDER_TAB);
    fill_rect(canvas, 40, 104, 432, 384, FOLDER_BODY);
    fill_rect(canvas, 64, 136, 384, 320, FOLDER_PANEL);
}

/// Top-left tile corners for a given tile count: single centered, two
/// side-by-side, two-over-one, or a 2×2 grid (the cap).
fn tile_positions(count: usize) -> Vec<(u32, u32)> {
    match count {
        0 => Vec::new(),
        1 => vec![(166, 206)],
        2 => vec![(68, 206), (264, 206)],
        3 => vec![(68, 108), (264, 108), (166, 304)],
        _ => vec![(68, 108), (264, 108), (68, 304), (264, 304)],
    }
}

fn draw_tile(canvas: &mut RgbaImage, tile: &RgbaImage, x: u32, y: u32) {
    const BORDER: u32 = 6;
    const SHADOW_OFFSET: u32 = 8;
    fill_rect(
        canvas,
        x - BORDER + SHADOW_OFFSET,
        y - BORDER + SHADOW_OFFSET,
        CELL + 2 * BORDER,
        CELL + 2 * BORDER,
        TILE_SHADOW,
    );
    fill_rect(
        canvas,
        x - BORDER,
        y - BORDER,
        CELL + 2 * BORDER,
        CELL + 2 * BORDER,
        TILE_BORDER,
    );
    imageops::overlay(canvas, tile, i64::from(x), i64::from(y));
}

fn fill_rect(canvas: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, color: Rgba<u8>) {
    let (cw, ch) = canvas.dimensions();
    for yy in y..(y + h).min(ch) {
        for xx in x..(x + w).min(cw) {
            canvas.get_pixel_mut(xx, yy).blend(&color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MemoryIndex;
    use image::{Rgb, RgbImage};
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_composer(index: Arc<MemoryIndex>, root: PathBuf) -> FolderComposer {
        FolderComposer::new(
            index,
            Arc::new(ImageLoader::new(4096, 16_000_000)),
            Arc::new(FrameExtractor::new(
                PathBuf::from("/nonexistent/ffmpeg"),
                PathBuf::from("/nonexistent/ffprobe"),
                Duration::from_secs(5),
            )),
            root,
        )
    }

    #[test]
    fn test_tile_positions_cap() {
        assert!(tile_positions(0).is_empty());
        assert_eq!(tile_positions(1).len(), 1);
        assert_eq!(tile_positions(2).len(), 2);
        assert_eq!(tile_positions(3).len(), 3);
        assert_eq!(tile_positions(4).len(), 4);
        assert_eq!(tile_positions(9).len(), 4);
    }

    #[test]
    fn test_square_tile_crops_center() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 50, Rgb([10, 20, 30])));
        let tile = square_tile(&img);
        assert_eq!(tile.dimensions(), (CELL, CELL));
    }

    #[test]
    fn test_compose_empty_is_glyph() {
        let canvas = compose(&[]);
        assert_eq!(canvas.dimensions(), (CANVAS, CANVAS));
        // Corner is transparent, folder body is opaque.
        assert_eq!(canvas.get_pixel(5, 5)[3], 0);
        assert_eq!(*canvas.get_pixel(50, 300), FOLDER_BODY);
        assert_eq!(*canvas.get_pixel(256, 300), FOLDER_PANEL);
    }

    #[tokio::test]
    async fn test_render_empty_folder() {
        let index = Arc::new(MemoryIndex::new());
        index.insert("empty", MediaKind::Folder);
        let dir = tempdir().unwrap();
        let composer = test_composer(Arc::clone(&index), dir.path().to_path_buf());

        let canvas = composer.render("empty", &CancellationToken::new()).await;
        assert_eq!(canvas.dimensions(), (CANVAS, CANVAS));
        assert_eq!(*canvas.get_pixel(50, 300), FOLDER_BODY);
    }

    #[tokio::test]
    async fn test_render_single_child_centered() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("trips")).unwrap();
        let child = dir.path().join("trips/red.png");
        RgbImage::from_pixel(64, 64, Rgb([220, 20, 20]))
            .save(&child)
            .unwrap();

        let index = Arc::new(MemoryIndex::new());
        index.insert("trips", MediaKind::Folder);
        index.insert("trips/red.png", MediaKind::Image);
        let composer = test_composer(Arc::clone(&index), dir.path().to_path_buf());

        let canvas = composer.render("trips", &CancellationToken::new()).await;
        // The single tile is centered; the canvas midpoint lands inside it.
        let center = canvas.get_pixel(CANVAS / 2, CANVAS / 2);
        assert!(center[0] > 150 && center[1] < 100, "expected red tile, got {center:?}");
        // Border pixel just outside the tile's left edge is white.
        assert_eq!(*canvas.get_pixel(163, 290), TILE_BORDER);
    }

    #[tokio::test]
    async fn test_sample_prefers_direct_then_descends() {
        let index = Arc::new(MemoryIndex::new());
        index.insert("f", MediaKind::Folder);
        index.insert("f/a.jpg", MediaKind::Image);
        index.insert("f/b.jpg", MediaKind::Image);
        index.insert("f/sub", MediaKind::Folder);
        index.insert("f/sub/c.jpg", MediaKind::Image);
        index.insert("f/sub/d.jpg", MediaKind::Image);
        index.insert("f/sub/e.jpg", MediaKind::Image);

        let dir = tempdir().unwrap();
        let composer = test_composer(Arc::clone(&index), dir.path().to_path_buf());
        let sample = composer.sample_children("f").await;
        let paths: Vec<&str> = sample.iter().map(|f| f.rel_path.as_str()).collect();
        // Direct children first, then the subfolder tops up to the cap.
        assert_eq!(paths, vec!["f/a.jpg", "f/b.jpg", "f/sub/c.jpg", "f/sub/d.jpg"]);
    }

    #[tokio::test]
    async fn test_sample_prefers_images_over_videos() {
        let index = Arc::new(MemoryIndex::new());
        index.insert("f", MediaKind::Folder);
        index.insert("f/a.mp4", MediaKind::Video);
        index.insert("f/b.jpg", MediaKind::Image);

        let dir = tempdir().unwrap();
        let composer = test_composer(Arc::clone(&index), dir.path().to_path_buf());
        let sample = composer.sample_children("f").await;
        assert_eq!(sample[0].rel_path, "f/b.jpg");
        assert_eq!(sample[1].rel_path, "f/a.mp4");
    }

    #[tokio::test]
    async fn test_sample_respects_depth_limit() {
        let index = Arc::new(MemoryIndex::new());
        index.insert("f", MediaKind::Folder);
        index.insert("f/s1", MediaKind::Folder);
        index.insert("f/s1/s2", MediaKind::Folder);
        index.insert("f/s1/s2/s3", MediaKind::Folder);
        // Files of s3 sit at depth 4, past the limit.
        index.insert("f/s1/s2/s3/deep.jpg", MediaKind::Image);

        let dir = tempdir().unwrap();
        let composer = test_composer(Arc::clone(&index), dir.path().to_path_buf());
        assert!(composer.sample_children("f").await.is_empty());
    }

    #[tokio::test]
    async fn test_five_candidates_render_four() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("f")).unwrap();
        let index = Arc::new(MemoryIndex::new());
        index.insert("f", MediaKind::Folder);
        for i in 0..5 {
            let rel = format!("f/{i}.png");
            RgbImage::from_pixel(32, 32, Rgb([50 * i as u8, 100, 100]))
                .save(dir.path().join(&rel))
                .unwrap();
            index.insert(&rel, MediaKind::Image);
        }
        let composer = test_composer(Arc::clone(&index), dir.path().to_path_buf());

        let sample = composer.sample_children("f").await;
        assert_eq!(sample.len(), 4);
        let canvas = composer.render("f", &CancellationToken::new()).await;
        assert_eq!(canvas.dimensions(), (CANVAS, CANVAS));
    }
}
