//! Status snapshots served by the admin API
//!
//! Encode activity is shared between the encode worker and the API via
//! `SharedActivity`; everything else is read on demand.

use crate::crf_search::SearcherStatus;
use crate::models::{FailureCategory, VideoState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One running encode
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeStatus {
    pub video_id: i64,
    pub input_path: String,
    pub output_path: String,
    pub crf: f64,
    pub pid: u32,
    pub started_at_ms: i64,
}

/// Encode worker activity and running totals
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EncodeActivity {
    pub active: Vec<EncodeStatus>,
    pub completed: u64,
    pub failed: u64,
    pub bytes_encoded: u64,
}

pub type SharedActivity = Arc<RwLock<EncodeActivity>>;

pub fn new_shared_activity() -> SharedActivity {
    Arc::new(RwLock::new(EncodeActivity::default()))
}

/// Host resource usage
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemStatus {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureCount {
    pub stage: String,
    pub category: String,
    pub count: u64,
}

impl From<(FailureCategory, u64)> for FailureCount {
    fn from((category, count): (FailureCategory, u64)) -> Self {
        Self {
            stage: category.stage().to_string(),
            category: category.category_str().to_string(),
            count,
        }
    }
}

/// Everything `GET /status` returns
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub searchers: Vec<SearcherStatus>,
    pub encodes: EncodeActivity,
    pub videos: BTreeMap<String, u64>,
    pub unresolved_failures: Vec<FailureCount>,
    pub system: SystemStatus,
}

/// Per-state counts keyed by the state's wire name
pub fn state_counts(counts: BTreeMap<VideoState, u64>) -> BTreeMap<String, u64> {
    counts
        .into_iter()
        .map(|(state, count)| (state.as_str().to_string(), count))
        .collect()
}

/// Collects current system usage using sysinfo
pub fn collect_system_status() -> SystemStatus {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };
    let load_avg = System::load_average();

    SystemStatus {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EncodeFailure, QualitySearchFailure};

    #[test]
    fn test_state_counts_use_wire_names() {
        let mut counts = BTreeMap::new();
        counts.insert(VideoState::CrfSearching, 2);
        counts.insert(VideoState::NeedsAnalysis, 5);

        let named = state_counts(counts);
        assert_eq!(named["crf_searching"], 2);
        assert_eq!(named["needs_analysis"], 5);
    }

    #[test]
    fn test_failure_count_splits_category() {
        let count = FailureCount::from((
            FailureCategory::QualitySearch(QualitySearchFailure::SizeLimits),
            4,
        ));
        assert_eq!(count.stage, "quality_search");
        assert_eq!(count.category, "size_limits");
        assert_eq!(count.count, 4);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snapshot = StatusSnapshot {
            timestamp_unix_ms: 1_700_000_000_000,
            searchers: vec![SearcherStatus {
                id: 0,
                busy: true,
                video_id: Some(12),
                pid: Some(4242),
                attempt: 2,
                target: Some(94),
                min_crf: Some(5),
                max_crf: Some(70),
            }],
            encodes: EncodeActivity {
                active: Vec::new(),
                completed: 3,
                failed: 1,
                bytes_encoded: 9_000,
            },
            videos: BTreeMap::from([("failed".to_string(), 1)]),
            unresolved_failures: vec![FailureCount::from((
                FailureCategory::Encode(EncodeFailure::ProcessFailure),
                1,
            ))],
            system: SystemStatus::default(),
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["searchers"][0]["attempt"], 2);
        assert_eq!(json["searchers"][0]["pid"], 4242);
        assert_eq!(json["encodes"]["completed"], 3);
        assert_eq!(json["videos"]["failed"], 1);
        assert_eq!(json["unresolved_failures"][0]["category"], "process_failure");
    }

    #[test]
    fn test_system_status_is_sane() {
        let system = collect_system_status();
        assert!(system.mem_usage_percent >= 0.0 && system.mem_usage_percent <= 100.0);
    }
}
