//! Run scheduling and engine lifecycle.
//!
//! The orchestrator owns the generation machinery for one library: it serves
//! on-demand thumbnail requests, and it schedules batch runs both on a timer
//! and when a library scan completes. At most one run is in flight at a
//! time; an extra trigger while one runs is absorbed rather than queued.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::BatchProcessor;
use crate::error::{IndexError, Result};
use crate::generate::Generator;
use crate::key::CacheKey;
use crate::media::{MediaFile, MediaIndex, MediaKind};
use crate::memory::MemoryMonitor;
use crate::run::{GenerationRun, RunMode};
use crate::status::EngineStatus;
use crate::store::ThumbnailStore;
use crate::EngineConfig;

pub struct Orchestrator {
    index: Arc<dyn MediaIndex>,
    store: Arc<ThumbnailStore>,
    generator: Arc<Generator>,
    batch: BatchProcessor,
    run: Arc<Mutex<Option<GenerationRun>>>,
    running: AtomicBool,
    trigger: Notify,
    stop: CancellationToken,
    interval: Duration,
    batch_size: usize,
    library_root: PathBuf,
    enabled: bool,
}

/// Clears the running flag when a run exits by any path.
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Orchestrator {
    pub fn new(config: &EngineConfig, index: Arc<dyn MediaIndex>) -> Orchestrator {
        let store = Arc::new(ThumbnailStore::new(config.cache_dir.clone()));
        let generator = Arc::new(Generator::new(
            config,
            Arc::clone(&index),
            Arc::clone(&store),
        ));
        let memory = Arc::new(MemoryMonitor::new(config.memory_threshold_pct));
        Orchestrator {
            index,
            store,
            generator,
            batch: BatchProcessor::new(config.effective_worker_count(), memory),
            run: Arc::new(Mutex::new(None)),
            running: AtomicBool::new(false),
            trigger: Notify::new(),
            stop: CancellationToken::new(),
            interval: Duration::from_secs(config.run_interval_secs.max(1)),
            batch_size: config.batch_size.max(1),
            library_root: config.library_root.clone(),
            enabled: config.enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Serve one thumbnail, generating on a miss. Tied to the engine
    /// lifetime: `stop` cancels in-flight loads.
    pub async fn thumbnail(&self, rel_path: &str, kind: MediaKind) -> Result<Vec<u8>> {
        let token = self.stop.child_token();
        self.generator.get_or_generate(rel_path, kind, &token).await
    }

    /// Called when a library scan finishes. At most one pending trigger is
    /// held; further calls while a run is active collapse into it.
    pub fn notify_index_complete(&self) {
        self.trigger.notify_one();
    }

    /// Run until stopped, starting a pass on the interval or whenever a
    /// scan-complete trigger arrives.
    pub async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; runs should wait a full period.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.trigger.notified() => self.run_once(false).await,
                _ = ticker.tick() => self.run_once(false).await,
            }
        }
        debug!("generation loop stopped");
    }

    /// One generation pass. Full when forced or when no run has ever
    /// completed, incremental otherwise. Progress is visible through
    /// [`Orchestrator::status`] for the duration.
    pub async fn run_once(&self, force_full: bool) {
        if !self.enabled {
            debug!("engine disabled, skipping run");
            return;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("generation run already in progress");
            return;
        }
        let _flag = RunningFlag(&self.running);

        let last = match self.index.last_run().await {
            Ok(last) => last,
            Err(e) => {
                warn!("cannot read last run marker: {e}");
                return;
            }
        };
        let mode = if force_full || last.is_none() {
            RunMode::Full
        } else {
            RunMode::Incremental
        };

        // The marker for the next incremental pass is this run's start, taken
        // before listing so changes landing mid-run are picked up again.
        let new_run = GenerationRun::new(mode, 0);
        let started_at = new_run.started_at;
        *self.run.lock() = Some(new_run);

        let items = match self.collect_items(mode, last).await {
            Ok(items) => items,
            Err(e) => {
                warn!("item listing failed, aborting {mode} run: {e}");
                if let Some(active) = self.run.lock().as_mut() {
                    active.finish();
                }
                return;
            }
        };
        if let Some(active) = self.run.lock().as_mut() {
            active.total = items.len() as u64;
        }
        info!("starting {mode} generation run over {} items", items.len());

        let batch_cancel = self.stop.child_token();
        for chunk in items.chunks(self.batch_size) {
            if batch_cancel.is_cancelled() {
                break;
            }
            let generator = Arc::clone(&self.generator);
            self.batch
                .process(
                    chunk.to_vec(),
                    move |file, token| {
                        let generator = Arc::clone(&generator);
                        async move { generator.process_item(&file, &token).await }
                    },
                    &self.run,
                    &batch_cancel,
                )
                .await;
        }

        if !batch_cancel.is_cancelled() {
            self.sweep(started_at).await;
        } else {
            info!("{mode} run cancelled before completion");
        }

        if let Some(active) = self.run.lock().as_mut() {
            active.finish();
        }
        if let Some(snap) = self.run.lock().as_ref().map(|r| r.snapshot()) {
            info!(
                "{mode} run finished: {} generated, {} skipped, {} failed, {} orphans removed",
                snap.generated, snap.skipped, snap.failed, snap.orphans_removed
            );
        }
    }

    /// Post-run cleanup: reclaim cache entries whose source left the index,
    /// then persist the run marker. Neither step happens on a cancelled run.
    async fn sweep(&self, started_at: DateTime<Utc>) {
        match self.index.all_paths().await {
            Ok(paths) => {
                let indexed: HashSet<PathBuf> = paths
                    .into_iter()
                    .map(|rel| self.library_root.join(rel))
                    .collect();
                let removed = self.store.sweep_orphans(&indexed).await;
                if let Some(active) = self.run.lock().as_mut() {
                    active.orphans_removed = removed;
                }
            }
            // A sweep against a bad listing would tear out live entries.
            Err(e) => warn!("skipping orphan sweep, path listing failed: {e}"),
        }
        if let Err(e) = self.index.set_last_run(started_at).await {
            warn!("could not persist run marker: {e}");
        }
    }

    async fn collect_items(
        &self,
        mode: RunMode,
        last: Option<DateTime<Utc>>,
    ) -> std::result::Result<Vec<MediaFile>, IndexError> {
        match (mode, last) {
            (RunMode::Full, _) | (RunMode::Incremental, None) => {
                self.index.files_needing_thumbnails().await
            }
            (RunMode::Incremental, Some(since)) => {
                let mut items = self.index.files_updated_since(since).await?;
                items.extend(self.index.folders_updated_since(since).await?);
                // Changed sources keep their key, so stale entries must go
                // before the batch skips over them.
                for file in &items {
                    let abs = self.library_root.join(&file.rel_path);
                    let key = CacheKey::for_source(&abs, file.kind);
                    if let Err(e) = self.store.invalidate(&key).await {
                        warn!("could not invalidate {}: {e}", file.rel_path);
                    }
                }
                Ok(items)
            }
        }
    }

    pub async fn status(&self) -> EngineStatus {
        let accounting = self.store.accounting().await;
        EngineStatus::new(
            self.enabled,
            self.store.cache_dir().to_path_buf(),
            accounting.count,
            accounting.bytes,
            self.run.lock().as_ref().map(|r| r.snapshot()),
        )
    }

    /// Stop the loop and cancel in-flight work. Irreversible.
    pub fn stop(&self) {
        info!("stopping thumbnail engine");
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MemoryIndex;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> EngineConfig {
        EngineConfig {
            library_root: dir.path().join("library"),
            cache_dir: dir.path().join("cache"),
            worker_count: 2,
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg"),
            ffprobe_path: PathBuf::from("/nonexistent/ffprobe"),
            tool_timeout_secs: 2,
            ..EngineConfig::default()
        }
    }

    fn seed_library(config: &EngineConfig, index: &MemoryIndex) {
        std::fs::create_dir_all(config.library_root.join("trips")).unwrap();
        for rel in ["trips/a.png", "trips/b.png"] {
            RgbImage::from_pixel(48, 32, Rgb([120, 80, 40]))
                .save(config.library_root.join(rel))
                .unwrap();
            index.insert(rel, MediaKind::Image);
        }
        index.insert("trips", MediaKind::Folder);
    }

    #[tokio::test]
    async fn test_full_run_then_incremental_noop() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let index = Arc::new(MemoryIndex::new());
        seed_library(&config, &index);
        let orch = Orchestrator::new(&config, Arc::clone(&index) as Arc<dyn MediaIndex>);

        orch.run_once(false).await;
        let status = orch.status().await;
        let snap = status.run.unwrap();
        assert_eq!(snap.mode, RunMode::Full);
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.generated, 3);
        assert_eq!(snap.folders_updated, 1);
        assert!(!snap.in_progress);
        assert!(index.last_run().await.unwrap().is_some());

        // Nothing changed since: the next pass queues nothing.
        orch.run_once(false).await;
        let snap = orch.status().await.run.unwrap();
        assert_eq!(snap.mode, RunMode::Incremental);
        assert_eq!(snap.processed, 0);
    }

    #[tokio::test]
    async fn test_incremental_regenerates_touched_file() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let index = Arc::new(MemoryIndex::new());
        seed_library(&config, &index);
        let orch = Orchestrator::new(&config, Arc::clone(&index) as Arc<dyn MediaIndex>);

        orch.run_once(false).await;
        index.touch("trips/a.png", Utc::now());

        orch.run_once(false).await;
        let snap = orch.status().await.run.unwrap();
        assert_eq!(snap.mode, RunMode::Incremental);
        assert_eq!(snap.processed, 1);
        assert_eq!(snap.generated, 1);
    }

    #[tokio::test]
    async fn test_run_sweeps_departed_sources() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let index = Arc::new(MemoryIndex::new());
        seed_library(&config, &index);
        let orch = Orchestrator::new(&config, Arc::clone(&index) as Arc<dyn MediaIndex>);

        orch.run_once(false).await;
        assert_eq!(orch.status().await.cached_count, 3);

        index.remove("trips/b.png");
        std::fs::remove_file(config.library_root.join("trips/b.png")).unwrap();

        orch.run_once(false).await;
        let snap = orch.status().await.run.unwrap();
        assert_eq!(snap.orphans_removed, 1);
    }

    #[tokio::test]
    async fn test_disabled_engine_skips_runs() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            enabled: false,
            ..test_config(&dir)
        };
        let index = Arc::new(MemoryIndex::new());
        let orch = Orchestrator::new(&config, Arc::clone(&index) as Arc<dyn MediaIndex>);

        orch.run_once(true).await;
        assert!(orch.run.lock().is_none());
        assert!(!orch.status().await.enabled);
    }

    #[tokio::test]
    async fn test_second_run_refused_while_flag_held() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let index = Arc::new(MemoryIndex::new());
        let orch = Orchestrator::new(&config, Arc::clone(&index) as Arc<dyn MediaIndex>);

        orch.running.store(true, Ordering::SeqCst);
        orch.run_once(false).await;
        assert!(orch.run.lock().is_none());
    }

    #[tokio::test]
    async fn test_on_demand_thumbnail_counts_in_cache() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let index = Arc::new(MemoryIndex::new());
        seed_library(&config, &index);
        let orch = Orchestrator::new(&config, Arc::clone(&index) as Arc<dyn MediaIndex>);

        let bytes = orch.thumbnail("trips/a.png", MediaKind::Image).await.unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

        // The batch sees the on-demand entry and skips it.
        orch.run_once(false).await;
        let snap = orch.status().await.run.unwrap();
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.generated, 2);
    }

    #[tokio::test]
    async fn test_stopped_engine_runs_nothing_and_keeps_no_marker() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let index = Arc::new(MemoryIndex::new());
        seed_library(&config, &index);
        let orch = Orchestrator::new(&config, Arc::clone(&index) as Arc<dyn MediaIndex>);

        orch.stop();
        orch.run_once(false).await;

        let snap = orch.status().await.run.unwrap();
        assert_eq!(snap.processed, 0);
        assert!(!snap.in_progress);
        // A cancelled run neither sweeps nor advances the marker, so the
        // next pass repeats the work.
        assert!(index.last_run().await.unwrap().is_none());
        assert_eq!(orch.status().await.cached_count, 0);
    }

    #[tokio::test]
    async fn test_scan_trigger_starts_run() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            run_interval_secs: 3600,
            ..test_config(&dir)
        };
        let index = Arc::new(MemoryIndex::new());
        seed_library(&config, &index);
        let orch = Arc::new(Orchestrator::new(
            &config,
            Arc::clone(&index) as Arc<dyn MediaIndex>,
        ));

        let looper = Arc::clone(&orch);
        let handle = tokio::spawn(async move { looper.run_loop().await });

        orch.notify_index_complete();
        let mut finished = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Some(run) = orch.status().await.run {
                if !run.in_progress {
                    assert_eq!(run.processed, 3);
                    finished = true;
                    break;
                }
            }
        }
        assert!(finished, "triggered run never completed");

        orch.stop();
        handle.await.unwrap();
    }
}
