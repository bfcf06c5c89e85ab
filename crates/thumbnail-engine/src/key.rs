//! Cache addressing: deterministic mapping from source path to cache file
//! names.
//!
//! Keys are a SHA-256 digest of the absolute source path, truncated to 16
//! bytes and hex-encoded. The extension is chosen by media kind. Pure
//! functions only; nothing here touches the disk.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::media::MediaKind;

/// Suffix of the sidecar record holding the source path.
pub const META_EXTENSION: &str = "meta";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    stem: String,
    kind: MediaKind,
}

impl CacheKey {
    /// Key for an absolute source path. Stable across process restarts.
    pub fn for_source(abs_path: &Path, kind: MediaKind) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(abs_path.to_string_lossy().as_bytes());
        let digest = hasher.finalize();
        CacheKey {
            stem: hex::encode(&digest[..16]),
            kind,
        }
    }

    /// Digest part shared by the cache file and its sidecar. Also the
    /// single-flight lock key.
    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Cache file name, e.g. `3fa9…c2.jpg`.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.stem, self.kind.cache_extension())
    }

    /// Sidecar file name, e.g. `3fa9…c2.meta`.
    pub fn meta_name(&self) -> String {
        format!("{}.{}", self.stem, META_EXTENSION)
    }
}

/// Sidecar path for a cache file path: strip the cache extension, append the
/// metadata suffix. Used by the orphan sweep, which starts from directory
/// entries rather than keys.
pub fn meta_path_for(cache_path: &Path) -> PathBuf {
    cache_path.with_extension(META_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_deterministic() {
        let a = CacheKey::for_source(Path::new("/lib/trips/rome.jpg"), MediaKind::Image);
        let b = CacheKey::for_source(Path::new("/lib/trips/rome.jpg"), MediaKind::Image);
        assert_eq!(a, b);
        assert_eq!(a.file_name(), b.file_name());
        // 16 bytes hex-encoded.
        assert_eq!(a.stem().len(), 32);
    }

    #[test]
    fn test_key_distinct_paths() {
        let a = CacheKey::for_source(Path::new("/lib/a.jpg"), MediaKind::Image);
        let b = CacheKey::for_source(Path::new("/lib/b.jpg"), MediaKind::Image);
        assert_ne!(a.stem(), b.stem());
    }

    #[test]
    fn test_extension_by_kind() {
        let img = CacheKey::for_source(Path::new("/lib/a.jpg"), MediaKind::Image);
        let vid = CacheKey::for_source(Path::new("/lib/a.mp4"), MediaKind::Video);
        let dir = CacheKey::for_source(Path::new("/lib/trips"), MediaKind::Folder);
        assert!(img.file_name().ends_with(".jpg"));
        assert!(vid.file_name().ends_with(".jpg"));
        assert!(dir.file_name().ends_with(".png"));
    }

    #[test]
    fn test_meta_path_derivation() {
        let key = CacheKey::for_source(Path::new("/lib/a.jpg"), MediaKind::Image);
        let meta = key.meta_name();
        assert!(meta.ends_with(".meta"));
        assert_eq!(&meta[..32], key.stem());

        let derived = meta_path_for(Path::new("/cache/abc123.jpg"));
        assert_eq!(derived, PathBuf::from("/cache/abc123.meta"));
        let derived_png = meta_path_for(Path::new("/cache/abc123.png"));
        assert_eq!(derived_png, PathBuf::from("/cache/abc123.meta"));
    }
}
