//! System memory pressure checks.
//!
//! Batch workers back off while system memory usage sits above a configured
//! percentage. Readings come from sysinfo and are cached briefly so the
//! worker loops can poll without hammering /proc.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::debug;

/// Minimum gap between two memory refreshes.
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

pub struct MemoryMonitor {
    threshold_pct: u8,
    state: Mutex<MonitorState>,
}

struct MonitorState {
    system: System,
    refreshed_at: Instant,
    pressured: bool,
}

impl MemoryMonitor {
    /// A `threshold_pct` of zero disables pressure checks entirely.
    pub fn new(threshold_pct: u8) -> MemoryMonitor {
        let mut system = System::new();
        system.refresh_memory();
        let pressured = threshold_pct > 0 && usage_pct(&system) >= f64::from(threshold_pct);
        MemoryMonitor {
            threshold_pct,
            state: Mutex::new(MonitorState {
                system,
                refreshed_at: Instant::now(),
                pressured,
            }),
        }
    }

    /// True when used memory is at or above the threshold.
    pub fn under_pressure(&self) -> bool {
        if self.threshold_pct == 0 {
            return false;
        }
        let mut state = self.state.lock();
        if state.refreshed_at.elapsed() >= REFRESH_INTERVAL {
            state.system.refresh_memory();
            state.refreshed_at = Instant::now();
            let now_pressured = usage_pct(&state.system) >= f64::from(self.threshold_pct);
            if now_pressured != state.pressured {
                debug!(
                    "memory pressure {} at {:.1}% used",
                    if now_pressured { "began" } else { "eased" },
                    usage_pct(&state.system)
                );
            }
            state.pressured = now_pressured;
        }
        state.pressured
    }

    pub fn threshold_pct(&self) -> u8 {
        self.threshold_pct
    }
}

fn usage_pct(system: &System) -> f64 {
    let total = system.total_memory();
    if total == 0 {
        return 0.0;
    }
    system.used_memory() as f64 / total as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_threshold_never_pressured() {
        let monitor = MemoryMonitor::new(0);
        assert!(!monitor.under_pressure());
    }

    #[test]
    fn test_full_threshold_not_pressured() {
        // No real machine sits at 100% used.
        let monitor = MemoryMonitor::new(100);
        assert!(!monitor.under_pressure());
    }

    #[test]
    fn test_reading_is_cached() {
        let monitor = MemoryMonitor::new(85);
        let first = monitor.under_pressure();
        // Within the refresh interval the cached reading is served.
        assert_eq!(monitor.under_pressure(), first);
    }
}
