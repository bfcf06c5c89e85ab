//! Bounded worker pool for generation runs.
//!
//! A batch is a queue of media files drained by a small fixed set of async
//! workers. Workers pause while the system is short on memory and stop when
//! the batch token is cancelled. Item failures are tallied in the run state
//! and never abort the batch.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::media::{MediaFile, MediaKind};
use crate::memory::MemoryMonitor;
use crate::run::{GenerationRun, ItemOutcome};

/// Pause between memory polls while workers are backed off.
const PRESSURE_POLL: Duration = Duration::from_millis(250);

pub struct BatchProcessor {
    worker_cap: usize,
    memory: Arc<MemoryMonitor>,
}

impl BatchProcessor {
    pub fn new(worker_cap: usize, memory: Arc<MemoryMonitor>) -> BatchProcessor {
        BatchProcessor {
            worker_cap: worker_cap.max(1),
            memory,
        }
    }

    /// Drain `items` through `handler` on a bounded set of workers,
    /// recording progress in `run`.
    pub async fn process<F, Fut>(
        &self,
        items: Vec<MediaFile>,
        handler: F,
        run: &Arc<Mutex<Option<GenerationRun>>>,
        cancel: &CancellationToken,
    ) where
        F: Fn(MediaFile, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ItemOutcome>> + Send + 'static,
    {
        let queue: Arc<Mutex<VecDeque<MediaFile>>> = Arc::new(Mutex::new(items.into()));
        let handler = Arc::new(handler);
        let workers = effective_workers(self.worker_cap, self.memory.under_pressure());
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let run = Arc::clone(run);
            let cancel = cancel.clone();
            let memory = Arc::clone(&self.memory);
            handles.push(tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    // Hold off while the system is short on memory.
                    while memory.under_pressure() {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(PRESSURE_POLL) => {}
                        }
                    }
                    let Some(file) = queue.lock().pop_front() else {
                        break;
                    };
                    if let Some(active) = run.lock().as_mut() {
                        active.current_path = Some(file.rel_path.clone());
                    }
                    let kind = file.kind;
                    let rel = file.rel_path.clone();
                    match handler(file, cancel.clone()).await {
                        Ok(outcome) => {
                            if let Some(active) = run.lock().as_mut() {
                                active.note(outcome);
                                if kind == MediaKind::Folder && outcome == ItemOutcome::Generated
                                {
                                    active.folders_updated += 1;
                                }
                            }
                        }
                        Err(e) if e.is_cancellation() => {
                            debug!("worker stopping on cancellation: {e}");
                            break;
                        }
                        Err(e) => {
                            warn!("thumbnail generation failed for {rel}: {e}");
                            if let Some(active) = run.lock().as_mut() {
                                active.note(ItemOutcome::Failed);
                            }
                        }
                    }
                }
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("batch worker panicked: {e}");
            }
        }
    }
}

/// Worker count for a batch: the configured cap, halved under memory
/// pressure.
fn effective_workers(cap: usize, pressured: bool) -> usize {
    if pressured {
        (cap / 2).max(1)
    } else {
        cap.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ThumbError;
    use crate::run::RunMode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn items(n: usize) -> Vec<MediaFile> {
        (0..n)
            .map(|i| MediaFile::new(format!("f/{i}.jpg"), MediaKind::Image))
            .collect()
    }

    fn fresh_run(total: u64) -> Arc<Mutex<Option<GenerationRun>>> {
        Arc::new(Mutex::new(Some(GenerationRun::new(RunMode::Full, total))))
    }

    #[test]
    fn test_effective_workers() {
        assert_eq!(effective_workers(4, false), 4);
        assert_eq!(effective_workers(4, true), 2);
        assert_eq!(effective_workers(1, true), 1);
        assert_eq!(effective_workers(0, false), 1);
    }

    #[tokio::test]
    async fn test_drains_whole_queue() {
        let processor = BatchProcessor::new(3, Arc::new(MemoryMonitor::new(0)));
        let run = fresh_run(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        processor
            .process(
                items(8),
                move |_file, _token| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(ItemOutcome::Generated)
                    }
                },
                &run,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        let guard = run.lock();
        let state = guard.as_ref().unwrap();
        assert_eq!(state.processed, 8);
        assert_eq!(state.generated, 8);
    }

    #[tokio::test]
    async fn test_failures_counted_not_fatal() {
        let processor = BatchProcessor::new(2, Arc::new(MemoryMonitor::new(0)));
        let run = fresh_run(4);
        processor
            .process(
                items(4),
                move |file, _token| async move {
                    if file.rel_path.ends_with("0.jpg") {
                        Err(ThumbError::DecodeExhausted {
                            path: file.rel_path.into(),
                            detail: "bad".into(),
                        })
                    } else {
                        Ok(ItemOutcome::Generated)
                    }
                },
                &run,
                &CancellationToken::new(),
            )
            .await;
        let guard = run.lock();
        let state = guard.as_ref().unwrap();
        assert_eq!(state.processed, 4);
        assert_eq!(state.failed, 1);
        assert_eq!(state.generated, 3);
    }

    #[tokio::test]
    async fn test_cancelled_batch_does_nothing() {
        let processor = BatchProcessor::new(2, Arc::new(MemoryMonitor::new(0)));
        let run = fresh_run(6);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        processor
            .process(
                items(6),
                move |_file, _token| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(ItemOutcome::Generated)
                    }
                },
                &run,
                &cancel,
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(run.lock().as_ref().unwrap().processed, 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_stops_promptly() {
        let processor = BatchProcessor::new(2, Arc::new(MemoryMonitor::new(0)));
        let run = fresh_run(24);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        processor
            .process(
                items(24),
                move |_file, _token| async move {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    Ok(ItemOutcome::Generated)
                },
                &run,
                &cancel,
            )
            .await;

        let processed = run.lock().as_ref().unwrap().processed;
        assert!(processed < 24, "batch ran to completion despite cancel");
        // Workers finish their in-flight item and stop; a full drain would
        // need ~720ms on two workers.
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_folder_generation_bumps_folder_counter() {
        let processor = BatchProcessor::new(1, Arc::new(MemoryMonitor::new(0)));
        let run = fresh_run(2);
        let batch = vec![
            MediaFile::new("trips", MediaKind::Folder),
            MediaFile::new("trips/a.jpg", MediaKind::Image),
        ];
        processor
            .process(
                batch,
                move |_file, _token| async move { Ok(ItemOutcome::Generated) },
                &run,
                &CancellationToken::new(),
            )
            .await;
        let guard = run.lock();
        let state = guard.as_ref().unwrap();
        assert_eq!(state.folders_updated, 1);
        assert_eq!(state.generated, 2);
    }
}
