//! On-disk thumbnail store.
//!
//! A flat directory of `<key>.jpg` / `<key>.png` previews with `<key>.meta`
//! sidecars recording each entry's source path. No index file: the directory
//! listing itself is the source of truth for reclamation. Writes are
//! whole-file, so readers only ever see complete entries.

use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::key::{meta_path_for, CacheKey};

/// How long a cache size/count snapshot is served before recounting.
pub const ACCOUNTING_WINDOW: Duration = Duration::from_secs(30);

/// Count and total bytes of non-sidecar cache files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheAccounting {
    pub count: u64,
    pub bytes: u64,
}

struct AccountingSlot {
    taken_at: Instant,
    snapshot: CacheAccounting,
}

pub struct ThumbnailStore {
    cache_dir: PathBuf,
    accounting_window: Duration,
    accounting: tokio::sync::Mutex<Option<AccountingSlot>>,
}

impl ThumbnailStore {
    pub fn new(cache_dir: PathBuf) -> ThumbnailStore {
        ThumbnailStore::with_accounting_window(cache_dir, ACCOUNTING_WINDOW)
    }

    pub(crate) fn with_accounting_window(cache_dir: PathBuf, window: Duration) -> ThumbnailStore {
        ThumbnailStore {
            cache_dir,
            accounting_window: window,
            accounting: tokio::sync::Mutex::new(None),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.file_name())
    }

    pub fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.meta_name())
    }

    /// Read a cached preview. Any read failure is a miss; the caller will
    /// regenerate.
    pub async fn read(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let path = self.entry_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                debug!("cache read failed for {}: {e}", path.display());
                None
            }
        }
    }

    pub async fn exists(&self, key: &CacheKey) -> bool {
        tokio::fs::try_exists(self.entry_path(key))
            .await
            .unwrap_or(false)
    }

    /// Persist a preview and its sidecar. The entry is written first so a
    /// sidecar never refers to a missing file; a failed sidecar write leaves
    /// a legacy entry for the next sweep to reclaim.
    pub async fn write(&self, key: &CacheKey, bytes: &[u8], source_abs: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tokio::fs::write(self.entry_path(key), bytes).await?;
        let meta = self.meta_path(key);
        if let Err(e) =
            tokio::fs::write(&meta, source_abs.to_string_lossy().as_bytes()).await
        {
            warn!("sidecar write failed for {}: {e}", meta.display());
        }
        Ok(())
    }

    /// Remove a preview and its sidecar. Missing files are not an error.
    pub async fn invalidate(&self, key: &CacheKey) -> io::Result<()> {
        let mut result = Ok(());
        for path in [self.entry_path(key), self.meta_path(key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => result = Err(e),
            }
        }
        result
    }

    /// Reclaim entries whose source is gone from the index. `indexed` holds
    /// the absolute paths of everything still known. Entries without a
    /// sidecar are legacy and removed unconditionally; sidecars without an
    /// entry are removed too. Per-entry errors are logged and skipped, never
    /// aborting the sweep. Returns the number of records removed.
    pub async fn sweep_orphans(&self, indexed: &HashSet<PathBuf>) -> u64 {
        let mut dir = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("orphan sweep could not list cache dir: {e}");
                return 0;
            }
        };

        let mut removed = 0u64;
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("orphan sweep listing error: {e}");
                    break;
                }
            };
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("jpg") | Some("png") => {
                    removed += self.sweep_entry(&path, indexed).await;
                }
                Some("meta") => {
                    removed += self.sweep_sidecar(&path).await;
                }
                _ => {}
            }
        }
        removed
    }

    async fn sweep_entry(&self, path: &Path, indexed: &HashSet<PathBuf>) -> u64 {
        let meta = meta_path_for(path);
        match tokio::fs::read_to_string(&meta).await {
            Ok(source) => {
                let source_path = PathBuf::from(source.trim());
                if indexed.contains(&source_path) {
                    return 0;
                }
                debug!("removing orphan {} (source {})", path.display(), source_path.display());
                let mut removed = 0;
                match tokio::fs::remove_file(path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("orphan removal failed for {}: {e}", path.display()),
                }
                match tokio::fs::remove_file(&meta).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!("orphan sidecar removal failed for {}: {e}", meta.display()),
                }
                removed
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // No sidecar: a legacy entry from before tracking.
                debug!("removing legacy entry {}", path.display());
                match tokio::fs::remove_file(path).await {
                    Ok(()) => 1,
                    Err(e) => {
                        warn!("legacy removal failed for {}: {e}", path.display());
                        0
                    }
                }
            }
            Err(e) => {
                warn!("sidecar read failed for {}: {e}", meta.display());
                0
            }
        }
    }

    async fn sweep_sidecar(&self, meta: &Path) -> u64 {
        for ext in ["jpg", "png"] {
            if tokio::fs::try_exists(meta.with_extension(ext))
                .await
                .unwrap_or(false)
            {
                return 0;
            }
        }
        // Sidecar with no entry; may already be gone if its pair was just
        // removed earlier in this sweep.
        match tokio::fs::remove_file(meta).await {
            Ok(()) => 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!("dangling sidecar removal failed for {}: {e}", meta.display());
                0
            }
        }
    }

    /// Current cache size/count. Recounted at most once per window; between
    /// refreshes (and on I/O errors) the previous snapshot is served.
    pub async fn accounting(&self) -> CacheAccounting {
        let mut slot = self.accounting.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.taken_at.elapsed() < self.accounting_window {
                return cached.snapshot.clone();
            }
        }
        match self.measure().await {
            Ok(snapshot) => {
                *slot = Some(AccountingSlot {
                    taken_at: Instant::now(),
                    snapshot: snapshot.clone(),
                });
                snapshot
            }
            Err(e) => {
                warn!("cache accounting failed: {e}");
                let stale = slot
                    .as_ref()
                    .map(|c| c.snapshot.clone())
                    .unwrap_or_default();
                // Push the retry out a full window rather than hammering a
                // failing disk.
                *slot = Some(AccountingSlot {
                    taken_at: Instant::now(),
                    snapshot: stale.clone(),
                });
                stale
            }
        }
    }

    async fn measure(&self) -> io::Result<CacheAccounting> {
        let mut dir = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(CacheAccounting::default())
            }
            Err(e) => return Err(e),
        };
        let mut acc = CacheAccounting::default();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("meta") {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                acc.count += 1;
                acc.bytes += meta.len();
            }
        }
        Ok(acc)
    }
}
