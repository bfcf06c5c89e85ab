//! Engine status reporting.

use serde::Serialize;
use std::path::PathBuf;

use crate::run::RunSnapshot;

/// Point-in-time view of the engine, serializable for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub enabled: bool,
    pub cache_dir: PathBuf,
    pub cached_count: u64,
    pub cached_bytes: u64,
    pub cached_size_human: String,
    pub run: Option<RunSnapshot>,
}

impl EngineStatus {
    pub(crate) fn new(
        enabled: bool,
        cache_dir: PathBuf,
        count: u64,
        bytes: u64,
        run: Option<RunSnapshot>,
    ) -> EngineStatus {
        EngineStatus {
            enabled,
            cache_dir,
            cached_count: count,
            cached_bytes: bytes,
            cached_size_human: bytesize::ByteSize(bytes).to_string(),
            run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes() {
        let status = EngineStatus::new(true, PathBuf::from("/tmp/cache"), 3, 1024, None);
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["cached_count"], 3);
        assert_eq!(value["enabled"], true);
        assert!(value["cached_size_human"].as_str().unwrap().contains('B'));
        assert!(value["run"].is_null());
    }
}
