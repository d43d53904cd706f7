//! Work selection for quality search and encoding.
//!
//! Encoding batches interleave two content sources at a fixed ratio (every
//! `ratio`-th slot goes to the minority source) and round-robin across the
//! libraries of each source. Within a library items are consumed best first.

use crate::config::SchedulerConfig;
use crate::models::{ContentSource, QualityResult, Video};
use crate::store::{Store, StoreResult};
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

/// A `crf_searched` video ready to encode, with its chosen result.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub video: Video,
    pub result: QualityResult,
}

impl WorkItem {
    /// Bytes saved if the prediction holds; `None` when either size is unknown.
    pub fn predicted_savings(&self) -> Option<i64> {
        let original = self.video.size? as i64;
        let predicted = self.result.predicted_size? as i64;
        Some(original - predicted)
    }

    /// Predicted output size relative to the input.
    pub fn size_ratio(&self) -> f64 {
        self.result.percent / 100.0
    }
}

/// Savings desc (unknown last), size ratio asc, predicted time asc (unknown last).
pub fn rank(a: &WorkItem, b: &WorkItem) -> Ordering {
    let savings = match (a.predicted_savings(), b.predicted_savings()) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    let time = match (a.result.predicted_time, b.result.predicted_time) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    savings
        .then_with(|| a.size_ratio().total_cmp(&b.size_ratio()))
        .then(time)
        .then_with(|| a.video.id.cmp(&b.video.id))
}

/// Round-robin over the ranked queues of one source's libraries.
#[derive(Debug, Default)]
struct SourceQueue {
    libraries: Vec<VecDeque<WorkItem>>,
    next: usize,
}

impl SourceQueue {
    fn new(by_library: BTreeMap<i64, Vec<WorkItem>>) -> Self {
        let libraries = by_library
            .into_values()
            .map(|mut items| {
                items.sort_by(rank);
                VecDeque::from(items)
            })
            .collect();
        Self { libraries, next: 0 }
    }

    fn pop(&mut self) -> Option<WorkItem> {
        let count = self.libraries.len();
        for offset in 0..count {
            let idx = (self.next + offset) % count;
            if let Some(item) = self.libraries[idx].pop_front() {
                self.next = (idx + 1) % count;
                return Some(item);
            }
        }
        None
    }
}

/// Interleave `candidates` into at most `limit` slots.
pub fn interleave(
    candidates: Vec<WorkItem>,
    majority: ContentSource,
    ratio: usize,
    limit: usize,
) -> Vec<WorkItem> {
    let mut grouped: BTreeMap<ContentSource, BTreeMap<i64, Vec<WorkItem>>> = BTreeMap::new();
    for item in candidates {
        grouped
            .entry(item.video.content_source)
            .or_default()
            .entry(item.video.library_id)
            .or_default()
            .push(item);
    }
    let mut majority_queue = SourceQueue::new(grouped.remove(&majority).unwrap_or_default());
    let mut minority_queue =
        SourceQueue::new(grouped.remove(&majority.other()).unwrap_or_default());

    let ratio = ratio.max(1);
    let mut batch = Vec::with_capacity(limit);
    for slot in 0..limit {
        let (preferred, fallback) = if (slot + 1) % ratio == 0 {
            (&mut minority_queue, &mut majority_queue)
        } else {
            (&mut majority_queue, &mut minority_queue)
        };
        match preferred.pop().or_else(|| fallback.pop()) {
            Some(item) => batch.push(item),
            None => break,
        }
    }
    batch
}

#[derive(Debug, Clone)]
pub struct WorkScheduler {
    store: Store,
    majority: ContentSource,
    ratio: usize,
}

impl WorkScheduler {
    pub fn new(store: Store, config: &SchedulerConfig) -> Self {
        Self {
            store,
            majority: config.majority_source.into(),
            ratio: config.fairness_ratio,
        }
    }

    /// `analyzed` videos, highest bitrate and size first.
    pub fn select_for_quality_search(&self, limit: usize) -> StoreResult<Vec<Video>> {
        self.store.analyzed_for_search(limit)
    }

    pub fn select_for_encoding(&self, limit: usize) -> StoreResult<Vec<WorkItem>> {
        let candidates = self
            .store
            .encode_candidates()?
            .into_iter()
            .map(|(video, result)| WorkItem { video, result })
            .collect();
        Ok(interleave(candidates, self.majority, self.ratio, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{VideoMetadata, VideoState};
    use crate::state_machine::{ChooseOutcome, StateMachine, TransitionOutcome};
    use crate::store::test_support::{new_video, sample};
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn item(id: i64, source: ContentSource, library_id: i64, size: Option<u64>, percent: f64) -> WorkItem {
        WorkItem {
            video: Video {
                id,
                path: PathBuf::from(format!("/media/{}/{}.mkv", source, id)),
                title: None,
                size: Some(10_000),
                state: VideoState::CrfSearched,
                bitrate: Some(10_000_000),
                width: Some(1920),
                height: Some(1080),
                duration: Some(60.0),
                frame_rate: None,
                video_codecs: vec!["h264".to_string()],
                audio_codecs: vec!["aac".to_string()],
                hdr: None,
                content_source: source,
                library_id,
                content_group: None,
                chosen_quality_result_id: Some(id),
                version: 1,
                created_at: 0,
                updated_at: 0,
            },
            result: QualityResult {
                id,
                video_id: id,
                crf: 30.0,
                score: 95.0,
                percent,
                predicted_size: size,
                predicted_time: Some(100.0),
                chosen: true,
                target: 95,
                params: Vec::new(),
            },
        }
    }

    fn supply(source: ContentSource, libraries: i64, per_library: i64, first_id: i64) -> Vec<WorkItem> {
        let mut items = Vec::new();
        for library in 0..libraries {
            for n in 0..per_library {
                let id = first_id + library * 1000 + n;
                items.push(item(id, source, library, Some(5_000), 50.0));
            }
        }
        items
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // With ample supply on both sides, ten slots hold exactly one
        // minority item and it sits in the last slot.
        #[test]
        fn prop_ten_slots_hold_one_minority_item_at_index_nine(
            majority_libraries in 1i64..5,
            minority_libraries in 1i64..5,
            majority_is_series in any::<bool>(),
        ) {
            let majority = if majority_is_series { ContentSource::Series } else { ContentSource::Movies };
            let mut candidates = supply(majority, majority_libraries, 20, 1);
            candidates.extend(supply(majority.other(), minority_libraries, 20, 100_000));

            let batch = interleave(candidates, majority, 10, 10);

            prop_assert_eq!(batch.len(), 10);
            let minority_slots: Vec<usize> = batch
                .iter()
                .enumerate()
                .filter(|(_, item)| item.video.content_source != majority)
                .map(|(idx, _)| idx)
                .collect();
            prop_assert_eq!(minority_slots, vec![9]);
        }

        // Every library of a source appears before any library repeats.
        #[test]
        fn prop_libraries_take_turns(libraries in 2i64..6) {
            let candidates = supply(ContentSource::Series, libraries, 5, 1);
            let batch = interleave(candidates, ContentSource::Series, 10, libraries as usize);

            let mut seen: Vec<i64> = batch.iter().map(|item| item.video.library_id).collect();
            seen.sort();
            seen.dedup();
            prop_assert_eq!(seen.len(), libraries as usize);
        }
    }

    #[test]
    fn test_empty_minority_falls_back_to_majority() {
        let candidates = supply(ContentSource::Series, 1, 15, 1);
        let batch = interleave(candidates, ContentSource::Series, 10, 12);
        assert_eq!(batch.len(), 12);
        assert!(batch.iter().all(|i| i.video.content_source == ContentSource::Series));
    }

    #[test]
    fn test_partial_batch_when_supply_runs_out() {
        let mut candidates = supply(ContentSource::Series, 1, 2, 1);
        candidates.extend(supply(ContentSource::Movies, 1, 1, 500));
        let batch = interleave(candidates, ContentSource::Series, 10, 10);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_library_ranking_prefers_savings_then_ratio() {
        let candidates = vec![
            item(1, ContentSource::Series, 1, None, 10.0),
            item(2, ContentSource::Series, 1, Some(8_000), 80.0),
            item(3, ContentSource::Series, 1, Some(2_000), 40.0),
            item(4, ContentSource::Series, 1, Some(2_000), 20.0),
        ];
        let batch = interleave(candidates, ContentSource::Series, 10, 10);
        let order: Vec<i64> = batch.iter().map(|i| i.video.id).collect();
        assert_eq!(order, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_select_from_store() {
        let store = Store::open_in_memory().unwrap();
        let machine = StateMachine::new(store.clone());
        let metadata = |bitrate| VideoMetadata {
            width: 1280,
            height: 720,
            duration: Some(1_200.0),
            bitrate,
            frame_rate: None,
            video_codecs: vec!["h264".to_string()],
            audio_codecs: vec!["aac".to_string()],
            hdr: None,
            size: None,
            title: None,
        };
        let mut analyzed = Vec::new();
        for (path, bitrate) in [("/m/a.mkv", 8_000_000), ("/m/b.mkv", 30_000_000)] {
            let video = store
                .insert_video(&new_video(path, ContentSource::Series, 1))
                .unwrap();
            match machine.mark_analyzed(&video, &metadata(bitrate)).unwrap() {
                TransitionOutcome::Updated(video) => analyzed.push(video),
                TransitionOutcome::Stale => unreachable!(),
            }
        }

        let scheduler = WorkScheduler::new(store.clone(), &SchedulerConfig::default());
        let picked = scheduler.select_for_quality_search(10).unwrap();
        assert_eq!(picked[0].path, PathBuf::from("/m/b.mkv"));
        assert_eq!(picked.len(), 2);

        let video = match machine.mark_crf_searching(&analyzed[0]).unwrap() {
            TransitionOutcome::Updated(video) => video,
            TransitionOutcome::Stale => unreachable!(),
        };
        machine
            .upsert_quality_result(&video, &sample(26.0, 95.5, Some(1_000_000)))
            .unwrap();
        let video = match machine.choose_quality_result(&video, 26.0).unwrap() {
            ChooseOutcome::Chosen { video, .. } => video,
            other => panic!("unexpected {:?}", other),
        };
        machine.mark_crf_searched(&video).unwrap();

        let work = scheduler.select_for_encoding(10).unwrap();
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].video.id, video.id);
        assert!(work[0].result.chosen);
        assert_eq!(scheduler.select_for_quality_search(10).unwrap().len(), 1);
    }
}
