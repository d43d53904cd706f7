//! Video lifecycle state machine.
//!
//! Every change to a video's `state` column, and every write to its quality
//! results, goes through [`StateMachine`]. Transitions are validated against
//! a fixed table and per-target validators before a compare-and-swap update
//! on the row's `version`. Successful transitions are published on a
//! broadcast channel.

use crate::models::{
    QualityResult, QualitySample, Video, VideoAttrs, VideoMetadata, VideoState,
};
use crate::store::{run_blocking, Store, StoreError};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Below this bitrate an HDR source is already considered adequately encoded.
pub const ADEQUATE_BITRATE_BPS: u64 = 5_000_000;

const EVENT_CAPACITY: usize = 1024;

/// Targets reachable from `from`.
pub fn allowed_targets(from: VideoState) -> &'static [VideoState] {
    use VideoState::*;
    match from {
        NeedsAnalysis => &[Analyzed, CrfSearched, Encoded, Failed],
        Analyzed => &[CrfSearching, CrfSearched, Encoded, Failed],
        CrfSearching => &[CrfSearched, Failed, Analyzed],
        CrfSearched => &[Encoding, Failed, CrfSearching],
        Encoding => &[Encoded, Failed, CrfSearched],
        Encoded => &[Failed],
        Failed => &[NeedsAnalysis, Analyzed, CrfSearching, CrfSearched, Encoding],
    }
}

pub fn is_valid_transition(from: VideoState, to: VideoState) -> bool {
    allowed_targets(from).contains(&to)
}

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("invalid transition for video {video_id}: {from} -> {to}")]
    InvalidTransition {
        video_id: i64,
        from: VideoState,
        to: VideoState,
    },

    #[error("video {video_id} cannot become {to}: {reason}")]
    Validation {
        video_id: i64,
        to: VideoState,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a CAS-protected mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Updated(Video),
    /// The row moved on since the caller read it.
    Stale,
}

impl TransitionOutcome {
    pub fn video(&self) -> Option<&Video> {
        match self {
            TransitionOutcome::Updated(video) => Some(video),
            TransitionOutcome::Stale => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, TransitionOutcome::Stale)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChooseOutcome {
    Chosen { video: Video, result: QualityResult },
    /// No sample with that CRF was recorded for the video.
    NotFound,
    Stale,
}

/// Published after every successful transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEvent {
    pub video: Video,
    pub state: VideoState,
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    store: Store,
    events: broadcast::Sender<StateEvent>,
}

impl StateMachine {
    pub fn new(store: Store) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { store, events }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Run `f` against a clone of this machine on the blocking pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, StateMachineError>
    where
        F: FnOnce(&StateMachine) -> Result<T, StateMachineError> + Send + 'static,
        T: Send + 'static,
    {
        let machine = self.clone();
        run_blocking(move || f(&machine)).await
    }

    /// Move `video` to `to`, applying `attrs` in the same update.
    ///
    /// `video` is the caller's snapshot; its `version` guards the write.
    pub fn transition(
        &self,
        video: &Video,
        to: VideoState,
        attrs: VideoAttrs,
    ) -> Result<TransitionOutcome, StateMachineError> {
        if !is_valid_transition(video.state, to) {
            return Err(StateMachineError::InvalidTransition {
                video_id: video.id,
                from: video.state,
                to,
            });
        }

        let mut next = attrs.merged_into(video);
        let mut target = to;

        match to {
            VideoState::Analyzed => {
                validate_analyzed(&next)?;
                if next.bitrate.map_or(false, |b| b < ADEQUATE_BITRATE_BPS)
                    && next.has_hdr()
                    && is_valid_transition(video.state, VideoState::Encoded)
                {
                    info!(
                        video_id = video.id,
                        bitrate = next.bitrate,
                        "bitrate already adequate for HDR source, skipping to encoded"
                    );
                    target = VideoState::Encoded;
                    validate_encoded(&next)?;
                }
            }
            VideoState::CrfSearched => self.validate_crf_searched(&next)?,
            VideoState::Encoded => validate_encoded(&next)?,
            _ => {}
        }

        next.state = target;
        match self.store.cas_update_video(video.version, &next)? {
            Some(updated) => {
                debug!(video_id = updated.id, from = %video.state, to = %target, "state transition");
                let _ = self.events.send(StateEvent {
                    video: updated.clone(),
                    state: target,
                });
                Ok(TransitionOutcome::Updated(updated))
            }
            None => {
                debug!(video_id = video.id, to = %target, "stale transition skipped");
                Ok(TransitionOutcome::Stale)
            }
        }
    }

    fn validate_crf_searched(&self, video: &Video) -> Result<(), StateMachineError> {
        let reject = |reason: &str| StateMachineError::Validation {
            video_id: video.id,
            to: VideoState::CrfSearched,
            reason: reason.to_string(),
        };
        let chosen = video
            .chosen_quality_result_id
            .ok_or_else(|| reject("no chosen quality result"))?;
        match self.store.get_quality_result(chosen)? {
            Some(result) if result.video_id == video.id => Ok(()),
            Some(_) => Err(reject("chosen quality result belongs to another video")),
            None => Err(reject("chosen quality result does not exist")),
        }
    }

    pub fn mark_analyzed(
        &self,
        video: &Video,
        metadata: &VideoMetadata,
    ) -> Result<TransitionOutcome, StateMachineError> {
        self.transition(video, VideoState::Analyzed, VideoAttrs::from(metadata))
    }

    pub fn mark_crf_searching(&self, video: &Video) -> Result<TransitionOutcome, StateMachineError> {
        self.transition(video, VideoState::CrfSearching, VideoAttrs::default())
    }

    pub fn mark_crf_searched(&self, video: &Video) -> Result<TransitionOutcome, StateMachineError> {
        self.transition(video, VideoState::CrfSearched, VideoAttrs::default())
    }

    pub fn mark_encoding(&self, video: &Video) -> Result<TransitionOutcome, StateMachineError> {
        self.transition(video, VideoState::Encoding, VideoAttrs::default())
    }

    /// `output_path`, when given, replaces the video's path.
    pub fn mark_encoded(
        &self,
        video: &Video,
        output_path: Option<PathBuf>,
    ) -> Result<TransitionOutcome, StateMachineError> {
        let attrs = VideoAttrs {
            path: output_path,
            ..VideoAttrs::default()
        };
        self.transition(video, VideoState::Encoded, attrs)
    }

    pub fn mark_failed(&self, video: &Video) -> Result<TransitionOutcome, StateMachineError> {
        self.transition(video, VideoState::Failed, VideoAttrs::default())
    }

    /// Hand an interrupted search back to the queue and drop its partial results.
    pub fn release_to_analyzed(&self, video: &Video) -> Result<TransitionOutcome, StateMachineError> {
        let attrs = VideoAttrs {
            chosen_quality_result_id: Some(None),
            ..VideoAttrs::default()
        };
        let outcome = self.transition(video, VideoState::Analyzed, attrs)?;
        if let TransitionOutcome::Updated(updated) = &outcome {
            self.store.delete_quality_results(updated.id)?;
        }
        Ok(outcome)
    }

    /// Send every `failed` video back to `needs_analysis`; returns how many moved.
    pub fn reset_failed_to_needs_analysis(&self) -> Result<usize, StateMachineError> {
        let mut moved = 0;
        for video in self.store.videos_in_state(VideoState::Failed)? {
            let outcome =
                self.transition(&video, VideoState::NeedsAnalysis, VideoAttrs::default())?;
            if !outcome.is_stale() {
                moved += 1;
            }
        }
        info!(count = moved, "reset failed videos to needs_analysis");
        Ok(moved)
    }

    pub fn upsert_quality_result(
        &self,
        video: &Video,
        sample: &QualitySample,
    ) -> Result<QualityResult, StateMachineError> {
        Ok(self.store.upsert_quality_result(video.id, sample)?)
    }

    /// Make the sample at `crf` the video's single chosen result.
    pub fn choose_quality_result(
        &self,
        video: &Video,
        crf: f64,
    ) -> Result<ChooseOutcome, StateMachineError> {
        let Some(result) = self.store.find_quality_result(video.id, crf)? else {
            return Ok(ChooseOutcome::NotFound);
        };
        Ok(match self.store.choose_quality_result(video, result.id)? {
            Some((video, result)) => ChooseOutcome::Chosen { video, result },
            None => ChooseOutcome::Stale,
        })
    }

    pub fn clear_quality_results(&self, video: &Video) -> Result<usize, StateMachineError> {
        Ok(self.store.delete_quality_results(video.id)?)
    }
}

fn validate_analyzed(video: &Video) -> Result<(), StateMachineError> {
    let reject = |reason: &str| {
        Err(StateMachineError::Validation {
            video_id: video.id,
            to: VideoState::Analyzed,
            reason: reason.to_string(),
        })
    };
    if video.bitrate.unwrap_or(0) == 0 {
        return reject("bitrate must be positive");
    }
    if video.width.unwrap_or(0) == 0 || video.height.unwrap_or(0) == 0 {
        return reject("width and height must be positive");
    }
    if video.video_codecs.is_empty() {
        return reject("no video codecs");
    }
    if video.audio_codecs.is_empty() {
        return reject("no audio codecs");
    }
    if matches!(video.duration, Some(d) if d <= 0.0) {
        return reject("duration must be positive");
    }
    Ok(())
}

fn validate_encoded(video: &Video) -> Result<(), StateMachineError> {
    if video.path.as_os_str().is_empty() {
        return Err(StateMachineError::Validation {
            video_id: video.id,
            to: VideoState::Encoded,
            reason: "path is empty".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentSource;
    use crate::store::test_support::{new_video, sample};
    use proptest::prelude::*;

    fn machine() -> StateMachine {
        StateMachine::new(Store::open_in_memory().unwrap())
    }

    fn insert(machine: &StateMachine, path: &str) -> Video {
        machine
            .store()
            .insert_video(&new_video(path, ContentSource::Series, 1))
            .unwrap()
    }

    /// Put a row into `state` directly, bypassing the table.
    fn force_state(machine: &StateMachine, video: &Video, state: VideoState) -> Video {
        let mut next = video.clone();
        next.state = state;
        machine
            .store()
            .cas_update_video(video.version, &next)
            .unwrap()
            .unwrap()
    }

    fn metadata(bitrate: u64, hdr: Option<&str>) -> VideoMetadata {
        VideoMetadata {
            width: 1920,
            height: 1080,
            duration: Some(2_640.0),
            bitrate,
            frame_rate: Some(23.976),
            video_codecs: vec!["hevc".to_string()],
            audio_codecs: vec!["eac3".to_string()],
            hdr: hdr.map(str::to_string),
            size: Some(6_000_000_000),
            title: Some("Pilot".to_string()),
        }
    }

    fn updated(outcome: TransitionOutcome) -> Video {
        match outcome {
            TransitionOutcome::Updated(video) => video,
            TransitionOutcome::Stale => panic!("unexpected stale outcome"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_transitions_outside_table_are_rejected_without_mutation(
            from_idx in 0usize..7,
            to_idx in 0usize..7,
        ) {
            let from = VideoState::ALL[from_idx];
            let to = VideoState::ALL[to_idx];
            prop_assume!(!is_valid_transition(from, to));

            let machine = machine();
            let video = insert(&machine, "/media/tv/a.mkv");
            let video = if from == VideoState::NeedsAnalysis {
                video
            } else {
                force_state(&machine, &video, from)
            };

            let result = machine.transition(&video, to, VideoAttrs::default());
            let is_invalid = matches!(result, Err(StateMachineError::InvalidTransition { .. }));
            prop_assert!(is_invalid);

            let stored = machine.store().require_video(video.id).unwrap();
            prop_assert_eq!(stored.state, from);
            prop_assert_eq!(stored.version, video.version);
        }
    }

    #[test]
    fn test_mark_analyzed_stores_metadata() {
        let machine = machine();
        let video = insert(&machine, "/media/tv/a.mkv");

        let video = updated(machine.mark_analyzed(&video, &metadata(12_000_000, None)).unwrap());

        assert_eq!(video.state, VideoState::Analyzed);
        assert_eq!(video.bitrate, Some(12_000_000));
        assert_eq!(video.video_codecs, vec!["hevc".to_string()]);
        assert_eq!(video.title.as_deref(), Some("Pilot"));
    }

    #[test]
    fn test_analyzed_validator_rejects_missing_codecs() {
        let machine = machine();
        let video = insert(&machine, "/media/tv/a.mkv");
        let mut meta = metadata(12_000_000, None);
        meta.audio_codecs.clear();

        let result = machine.mark_analyzed(&video, &meta);
        assert!(matches!(result, Err(StateMachineError::Validation { .. })));
        assert_eq!(
            machine.store().require_video(video.id).unwrap().state,
            VideoState::NeedsAnalysis
        );
    }

    #[test]
    fn test_low_bitrate_hdr_skips_to_encoded() {
        let machine = machine();
        let video = insert(&machine, "/media/tv/a.mkv");

        let video = updated(
            machine
                .mark_analyzed(&video, &metadata(4_000_000, Some("HDR10")))
                .unwrap(),
        );
        assert_eq!(video.state, VideoState::Encoded);
    }

    #[test]
    fn test_hdr_shortcut_still_validates_encoded() {
        let machine = machine();
        let video = insert(&machine, "/media/tv/a.mkv");
        let attrs = VideoAttrs {
            path: Some(PathBuf::new()),
            ..VideoAttrs::from(&metadata(4_000_000, Some("HDR10")))
        };

        let result = machine.transition(&video, VideoState::Analyzed, attrs);

        match result {
            Err(StateMachineError::Validation { to, .. }) => assert_eq!(to, VideoState::Encoded),
            other => panic!("unexpected {:?}", other),
        }
        let stored = machine.store().require_video(video.id).unwrap();
        assert_eq!(stored.state, VideoState::NeedsAnalysis);
        assert_eq!(stored.version, video.version);
    }

    #[test]
    fn test_low_bitrate_without_hdr_is_analyzed() {
        let machine = machine();
        let video = insert(&machine, "/media/tv/a.mkv");

        let video = updated(machine.mark_analyzed(&video, &metadata(4_000_000, None)).unwrap());
        assert_eq!(video.state, VideoState::Analyzed);
    }

    #[test]
    fn test_crf_searched_requires_chosen_result() {
        let machine = machine();
        let video = insert(&machine, "/media/tv/a.mkv");
        let video = updated(machine.mark_analyzed(&video, &metadata(12_000_000, None)).unwrap());
        let video = updated(machine.mark_crf_searching(&video).unwrap());

        let result = machine.mark_crf_searched(&video);
        assert!(matches!(result, Err(StateMachineError::Validation { .. })));

        machine
            .upsert_quality_result(&video, &sample(24.0, 95.2, None))
            .unwrap();
        let video = match machine.choose_quality_result(&video, 24.0).unwrap() {
            ChooseOutcome::Chosen { video, .. } => video,
            other => panic!("unexpected {:?}", other),
        };
        let video = updated(machine.mark_crf_searched(&video).unwrap());
        assert_eq!(video.state, VideoState::CrfSearched);
    }

    #[test]
    fn test_choose_unknown_crf_is_not_found() {
        let machine = machine();
        let video = insert(&machine, "/media/tv/a.mkv");
        assert_eq!(
            machine.choose_quality_result(&video, 31.0).unwrap(),
            ChooseOutcome::NotFound
        );
    }

    #[test]
    fn test_concurrent_claim_is_stale() {
        let machine = machine();
        let video = insert(&machine, "/media/tv/a.mkv");
        let video = updated(machine.mark_analyzed(&video, &metadata(12_000_000, None)).unwrap());

        let first = machine.mark_crf_searching(&video).unwrap();
        let second = machine.mark_crf_searching(&video).unwrap();

        assert!(!first.is_stale());
        assert!(second.is_stale());
    }

    #[test]
    fn test_transition_publishes_event() {
        let machine = machine();
        let mut events = machine.subscribe();
        let video = insert(&machine, "/media/tv/a.mkv");

        machine.mark_failed(&video).unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.state, VideoState::Failed);
        assert_eq!(event.video.id, video.id);
    }

    #[test]
    fn test_stale_transition_publishes_nothing() {
        let machine = machine();
        let video = insert(&machine, "/media/tv/a.mkv");
        machine.mark_failed(&video).unwrap();
        let mut events = machine.subscribe();

        assert!(machine.mark_failed(&video).unwrap().is_stale());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_release_to_analyzed_drops_partial_results() {
        let machine = machine();
        let video = insert(&machine, "/media/tv/a.mkv");
        let video = updated(machine.mark_analyzed(&video, &metadata(12_000_000, None)).unwrap());
        let video = updated(machine.mark_crf_searching(&video).unwrap());
        machine
            .upsert_quality_result(&video, &sample(30.0, 93.0, None))
            .unwrap();

        let video = updated(machine.release_to_analyzed(&video).unwrap());

        assert_eq!(video.state, VideoState::Analyzed);
        assert!(machine.store().quality_results_for(video.id).unwrap().is_empty());
    }

    #[test]
    fn test_reset_failed_moves_only_failed_videos() {
        let machine = machine();
        let a = insert(&machine, "/media/tv/a.mkv");
        let b = insert(&machine, "/media/tv/b.mkv");
        insert(&machine, "/media/tv/c.mkv");
        machine.mark_failed(&a).unwrap();
        machine.mark_failed(&b).unwrap();

        assert_eq!(machine.reset_failed_to_needs_analysis().unwrap(), 2);
        let counts = machine.store().count_by_state().unwrap();
        assert_eq!(counts[&VideoState::NeedsAnalysis], 3);
        assert_eq!(counts[&VideoState::Failed], 0);
    }

    #[test]
    fn test_encoded_accepts_output_path() {
        let machine = machine();
        let video = insert(&machine, "/media/tv/a.mkv");
        let video = updated(
            machine
                .mark_encoded(&video, Some(PathBuf::from("/tmp/out/a.av1.mkv")))
                .unwrap(),
        );
        assert_eq!(video.state, VideoState::Encoded);
        assert_eq!(video.path, PathBuf::from("/tmp/out/a.av1.mkv"));
    }
}
