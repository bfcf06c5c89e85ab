//! Media kinds and the index collaborator interface.
//!
//! The engine never walks the library itself; everything it knows about
//! library contents arrives through [`MediaIndex`]. The engine issues read
//! queries only, plus get/set of the last-run timestamp.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::IndexError;

/// Extensions classified as still images.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff", "heic", "heif", "avif",
];

/// Extensions classified as video clips.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "mkv", "avi", "webm", "m4v", "mpg", "mpeg", "wmv", "3gp",
];

/// Logical media type driving pipeline dispatch. Closed set: every dispatch
/// site matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Folder,
    Other,
}

impl MediaKind {
    /// Classify a file path by extension. Directories are the caller's
    /// problem; a path with a directory-less extension comes back as
    /// `Other`.
    pub fn from_path(path: &Path) -> MediaKind {
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => ext.to_ascii_lowercase(),
            None => return MediaKind::Other,
        };
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Image
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Video
        } else {
            MediaKind::Other
        }
    }

    /// Cache file extension for this kind: opaque JPEG for decoded media,
    /// PNG for folder composites (they need transparency).
    pub fn cache_extension(&self) -> &'static str {
        match self {
            MediaKind::Image | MediaKind::Video | MediaKind::Other => "jpg",
            MediaKind::Folder => "png",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Image => write!(f, "image"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Folder => write!(f, "folder"),
            MediaKind::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            "folder" => Ok(MediaKind::Folder),
            "other" => Ok(MediaKind::Other),
            _ => Err(IndexError::new(format!("unknown media kind: {s}"))),
        }
    }
}

/// A library item as the index describes it. Paths are relative to the
/// library root; the engine joins them itself and never mutates the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFile {
    pub rel_path: String,
    pub name: String,
    pub kind: MediaKind,
}

impl MediaFile {
    pub fn new(rel_path: impl Into<String>, kind: MediaKind) -> MediaFile {
        let rel_path = rel_path.into();
        let name = rel_path
            .rsplit('/')
            .next()
            .unwrap_or(rel_path.as_str())
            .to_string();
        MediaFile {
            rel_path,
            name,
            kind,
        }
    }
}

/// Read-only view of the media library, plus last-run persistence.
///
/// `folder` arguments are relative paths, `""` meaning the library root.
/// Implementations order folder listings images-first so that child
/// sampling prefers images over videos deterministically.
#[async_trait]
pub trait MediaIndex: Send + Sync {
    /// Direct media children (images/videos, not folders) of a folder,
    /// images first, stable order, at most `limit`.
    async fn files_in_folder(
        &self,
        folder: &str,
        limit: usize,
    ) -> Result<Vec<MediaFile>, IndexError>;

    /// Direct subfolders of a folder, stable order.
    async fn subfolders(&self, folder: &str) -> Result<Vec<MediaFile>, IndexError>;

    /// Media files modified after `since`.
    async fn files_updated_since(&self, since: DateTime<Utc>)
        -> Result<Vec<MediaFile>, IndexError>;

    /// Folders whose contents changed after `since`.
    async fn folders_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<MediaFile>, IndexError>;

    /// Everything that should have a thumbnail: images, videos, and folders.
    async fn files_needing_thumbnails(&self) -> Result<Vec<MediaFile>, IndexError>;

    /// All currently-indexed relative paths, any kind. Source of truth for
    /// orphan reclamation.
    async fn all_paths(&self) -> Result<Vec<String>, IndexError>;

    async fn last_run(&self) -> Result<Option<DateTime<Utc>>, IndexError>;

    async fn set_last_run(&self, at: DateTime<Utc>) -> Result<(), IndexError>;
}

// -- In-memory index --

struct MemoryEntry {
    file: MediaFile,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    entries: Vec<MemoryEntry>,
    last_run: Option<DateTime<Utc>>,
}

/// In-memory [`MediaIndex`] for tests and embedders that bring their own
/// library listing. Folder rows must be inserted explicitly, like any other
/// entry.
#[derive(Default)]
pub struct MemoryIndex {
    state: RwLock<MemoryState>,
}

impl MemoryIndex {
    pub fn new() -> MemoryIndex {
        MemoryIndex::default()
    }

    pub fn insert(&self, rel_path: &str, kind: MediaKind) {
        self.insert_at(rel_path, kind, Utc::now());
    }

    pub fn insert_at(&self, rel_path: &str, kind: MediaKind, updated_at: DateTime<Utc>) {
        let mut state = self.state.write();
        let file = MediaFile::new(rel_path, kind);
        match state.entries.iter_mut().find(|e| e.file.rel_path == rel_path) {
            Some(entry) => {
                entry.file = file;
                entry.updated_at = updated_at;
            }
            None => state.entries.push(MemoryEntry { file, updated_at }),
        }
    }

    pub fn remove(&self, rel_path: &str) {
        self.state
            .write()
            .entries
            .retain(|e| e.file.rel_path != rel_path);
    }

    pub fn touch(&self, rel_path: &str, updated_at: DateTime<Utc>) {
        if let Some(entry) = self
            .state
            .write()
            .entries
            .iter_mut()
            .find(|e| e.file.rel_path == rel_path)
        {
            entry.updated_at = updated_at;
        }
    }
}

fn parent_of(rel_path: &str) -> &str {
    match rel_path.rfind('/') {
        Some(idx) => &rel_path[..idx],
        None => "",
    }
}

fn kind_rank(kind: MediaKind) -> u8 {
    match kind {
        MediaKind::Image => 0,
        MediaKind::Video => 1,
        MediaKind::Folder => 2,
        MediaKind::Other => 3,
    }
}

#[async_trait]
impl MediaIndex for MemoryIndex {
    async fn files_in_folder(
        &self,
        folder: &str,
        limit: usize,
    ) -> Result<Vec<MediaFile>, IndexError> {
        let state = self.state.read();
        let mut files: Vec<MediaFile> = state
            .entries
            .iter()
            .filter(|e| {
                parent_of(&e.file.rel_path) == folder
                    && matches!(e.file.kind, MediaKind::Image | MediaKind::Video)
            })
            .map(|e| e.file.clone())
            .collect();
        files.sort_by(|a, b| {
            kind_rank(a.kind)
                .cmp(&kind_rank(b.kind))
                .then_with(|| a.rel_path.cmp(&b.rel_path))
        });
        files.truncate(limit);
        Ok(files)
    }

    async fn subfolders(&self, folder: &str) -> Result<Vec<MediaFile>, IndexError> {
        let state = self.state.read();
        let mut folders: Vec<MediaFile> = state
            .entries
            .iter()
            .filter(|e| parent_of(&e.file.rel_path) == folder && e.file.kind == MediaKind::Folder)
            .map(|e| e.file.clone())
            .collect();
        folders.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(folders)
    }

    async fn files_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<MediaFile>, IndexError> {
        let state = self.state.read();
        Ok(state
            .entries
            .iter()
            .filter(|e| {
                e.updated_at > since
                    && matches!(e.file.kind, MediaKind::Image | MediaKind::Video)
            })
            .map(|e| e.file.clone())
            .collect())
    }

    async fn folders_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<MediaFile>, IndexError> {
        let state = self.state.read();
        Ok(state
            .entries
            .iter()
            .filter(|e| e.updated_at > since && e.file.kind == MediaKind::Folder)
            .map(|e| e.file.clone())
            .collect())
    }

    async fn files_needing_thumbnails(&self) -> Result<Vec<MediaFile>, IndexError> {
        let state = self.state.read();
        Ok(state
            .entries
            .iter()
            .filter(|e| e.file.kind != MediaKind::Other)
            .map(|e| e.file.clone())
            .collect())
    }

    async fn all_paths(&self) -> Result<Vec<String>, IndexError> {
        let state = self.state.read();
        Ok(state
            .entries
            .iter()
            .map(|e| e.file.rel_path.clone())
            .collect())
    }

    async fn last_run(&self) -> Result<Option<DateTime<Utc>>, IndexError> {
        Ok(self.state.read().last_run)
    }

    async fn set_last_run(&self, at: DateTime<Utc>) -> Result<(), IndexError> {
        self.state.write().last_run = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::PathBuf;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            MediaKind::from_path(&PathBuf::from("a/b/photo.JPG")),
            MediaKind::Image
        );
        assert_eq!(
            MediaKind::from_path(&PathBuf::from("clip.mkv")),
            MediaKind::Video
        );
        assert_eq!(
            MediaKind::from_path(&PathBuf::from("notes.txt")),
            MediaKind::Other
        );
        assert_eq!(MediaKind::from_path(&PathBuf::from("README")), MediaKind::Other);
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            MediaKind::Image,
            MediaKind::Video,
            MediaKind::Folder,
            MediaKind::Other,
        ] {
            assert_eq!(kind.to_string().parse::<MediaKind>().unwrap(), kind);
        }
        assert!("raw".parse::<MediaKind>().is_err());
    }

    #[test]
    fn test_cache_extension() {
        assert_eq!(MediaKind::Image.cache_extension(), "jpg");
        assert_eq!(MediaKind::Video.cache_extension(), "jpg");
        assert_eq!(MediaKind::Folder.cache_extension(), "png");
    }

    #[test]
    fn test_media_file_name() {
        assert_eq!(MediaFile::new("trips/rome/arch.jpg", MediaKind::Image).name, "arch.jpg");
        assert_eq!(MediaFile::new("top.jpg", MediaKind::Image).name, "top.jpg");
    }

    #[tokio::test]
    async fn test_memory_index_folder_listing() {
        let index = MemoryIndex::new();
        index.insert("trips", MediaKind::Folder);
        index.insert("trips/z.mp4", MediaKind::Video);
        index.insert("trips/a.jpg", MediaKind::Image);
        index.insert("trips/b.jpg", MediaKind::Image);
        index.insert("trips/rome", MediaKind::Folder);
        index.insert("trips/rome/deep.jpg", MediaKind::Image);

        let files = index.files_in_folder("trips", 10).await.unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        // Images first, videos after, no recursion into rome.
        assert_eq!(paths, vec!["trips/a.jpg", "trips/b.jpg", "trips/z.mp4"]);

        let limited = index.files_in_folder("trips", 2).await.unwrap();
        assert_eq!(limited.len(), 2);

        let subs = index.subfolders("trips").await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].rel_path, "trips/rome");
    }

    #[tokio::test]
    async fn test_memory_index_updated_since() {
        let index = MemoryIndex::new();
        let base = Utc::now();
        index.insert_at("old.jpg", MediaKind::Image, base - Duration::hours(2));
        index.insert_at("new.jpg", MediaKind::Image, base + Duration::seconds(5));
        index.insert_at("fresh", MediaKind::Folder, base + Duration::seconds(5));

        let files = index.files_updated_since(base).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].rel_path, "new.jpg");

        let folders = index.folders_updated_since(base).await.unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].rel_path, "fresh");
    }

    #[tokio::test]
    async fn test_memory_index_last_run() {
        let index = MemoryIndex::new();
        assert!(index.last_run().await.unwrap().is_none());
        let at = Utc::now();
        index.set_last_run(at).await.unwrap();
        assert_eq!(index.last_run().await.unwrap(), Some(at));
    }
}
