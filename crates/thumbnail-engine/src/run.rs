//! Generation run bookkeeping.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// How a generation pass selects its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Every indexed item missing a cache entry.
    Full,
    /// Only items changed since the last completed run.
    Incremental,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Full => write!(f, "full"),
            RunMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// What became of a single queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Generated,
    Skipped,
    Failed,
}

/// Progress state for the run in flight. Lives behind the orchestrator's
/// lock; workers update counters as items finish.
#[derive(Debug)]
pub struct GenerationRun {
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total: u64,
    pub processed: u64,
    pub generated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub folders_updated: u64,
    pub orphans_removed: u64,
    pub current_path: Option<String>,
}

impl GenerationRun {
    pub fn new(mode: RunMode, total: u64) -> GenerationRun {
        GenerationRun {
            mode,
            started_at: Utc::now(),
            completed_at: None,
            total,
            processed: 0,
            generated: 0,
            skipped: 0,
            failed: 0,
            folders_updated: 0,
            orphans_removed: 0,
            current_path: None,
        }
    }

    /// Record one finished item.
    pub fn note(&mut self, outcome: ItemOutcome) {
        self.processed += 1;
        match outcome {
            ItemOutcome::Generated => self.generated += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Failed => self.failed += 1,
        }
    }

    pub fn finish(&mut self) {
        self.completed_at = Some(Utc::now());
        self.current_path = None;
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            mode: self.mode,
            started_at: self.started_at,
            completed_at: self.completed_at,
            in_progress: self.completed_at.is_none(),
            total: self.total,
            processed: self.processed,
            generated: self.generated,
            skipped: self.skipped,
            failed: self.failed,
            folders_updated: self.folders_updated,
            orphans_removed: self.orphans_removed,
            current_path: self.current_path.clone(),
        }
    }
}

/// Immutable copy of run progress for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub in_progress: bool,
    pub total: u64,
    pub processed: u64,
    pub generated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub folders_updated: u64,
    pub orphans_removed: u64,
    pub current_path: Option<String>,
}
