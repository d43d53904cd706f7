//! Encode worker
//!
//! Runs encodes for scheduled work items with concurrency limited by a
//! semaphore. A video is claimed (`crf_searched -> encoding`) only after its
//! encoder process has started.

use super::ab_av1::{build_encode_args, EncodeError, EncodeParams};
use crate::failures::FailureLedger;
use crate::models::{current_timestamp_ms, EncodeFailure, FailureCategory, FailureStage, Video};
use crate::rules::{Purpose, Rules};
use crate::scheduler::WorkItem;
use crate::state_machine::{StateMachine, TransitionOutcome};
use crate::status::{EncodeStatus, SharedActivity};
use crate::subprocess::{ProcessEvent, ProcessExit, RunningProcess, SubprocessRunner};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, trace, warn};

/// Lines of encoder output kept for failure records
const OUTPUT_TAIL: usize = 20;
const SIGKILL: i32 = 9;

/// Collaborators the encode worker needs
#[derive(Clone)]
pub struct EncodeContext {
    pub machine: StateMachine,
    pub ledger: FailureLedger,
    pub runner: SubprocessRunner,
    pub rules: Arc<dyn Rules>,
    pub output_dir: PathBuf,
}

/// An encode whose video has been claimed
#[derive(Debug)]
pub struct ClaimedEncode {
    pub video: Video,
    pub params: EncodeParams,
    args: Vec<String>,
    process: RunningProcess,
}

/// Encode worker that limits concurrent encodes via semaphore
pub struct EncodeWorker {
    /// Semaphore for limiting concurrent encodes
    semaphore: Arc<Semaphore>,
    ctx: EncodeContext,
    /// Shared with the admin API
    activity: SharedActivity,
}

impl EncodeWorker {
    pub fn new(ctx: EncodeContext, encoders: u32, activity: SharedActivity) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(encoders.max(1) as usize)),
            ctx,
            activity,
        }
    }

    /// Get the number of available permits (slots for concurrent encodes)
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Try to acquire a permit without waiting
    ///
    /// Returns None if no permits are available.
    pub fn try_acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Launch the encoder and claim the video.
    ///
    /// `Ok(None)` means another worker claimed the video first.
    pub async fn start(&self, item: WorkItem) -> Result<Option<ClaimedEncode>, EncodeError> {
        let WorkItem { video, result } = item;
        tokio::fs::create_dir_all(&self.ctx.output_dir).await?;

        let params = EncodeParams::new(video.id, &video.path, &self.ctx.output_dir, result.crf);
        let args = build_encode_args(&params, self.ctx.rules.args(&video, Purpose::Encode));

        let mut process = match self.ctx.runner.spawn(&args) {
            Ok(process) => process,
            Err(e) => {
                let context = BTreeMap::from([("args".to_string(), json!(args))]);
                self.fail(
                    &video,
                    EncodeFailure::ProcessFailure,
                    "launch_failed",
                    e.to_string(),
                    context,
                )
                .await;
                return Err(e.into());
            }
        };

        let claim = video.clone();
        match self
            .ctx
            .machine
            .blocking(move |machine| machine.mark_encoding(&claim))
            .await
        {
            Ok(TransitionOutcome::Updated(video)) => {
                info!(
                    video_id = video.id,
                    pid = process.pid(),
                    crf = params.crf,
                    output = %params.output_path.display(),
                    "encode started"
                );
                self.activity.write().await.active.push(EncodeStatus {
                    video_id: video.id,
                    input_path: params.input_path.to_string_lossy().to_string(),
                    output_path: params.output_path.to_string_lossy().to_string(),
                    crf: params.crf,
                    pid: process.pid(),
                    started_at_ms: current_timestamp_ms(),
                });
                Ok(Some(ClaimedEncode {
                    video,
                    params,
                    args,
                    process,
                }))
            }
            Ok(TransitionOutcome::Stale) => {
                debug!(video_id = video.id, "video already claimed for encoding");
                process.terminate().await;
                Ok(None)
            }
            Err(e) => {
                process.terminate().await;
                Err(e.into())
            }
        }
    }

    /// Wait for the encoder, then mark the video encoded or failed.
    pub async fn finish(&self, job: ClaimedEncode) -> Result<Video, EncodeError> {
        let ClaimedEncode {
            video,
            params,
            args,
            mut process,
        } = job;

        let mut tail = VecDeque::with_capacity(OUTPUT_TAIL);
        let exit = loop {
            match process.next_event().await {
                ProcessEvent::Line(line) => {
                    trace!(video_id = video.id, line = %line, "encoder output");
                    if tail.len() == OUTPUT_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                ProcessEvent::Exited(exit) => break exit,
            }
        };
        self.activity
            .write()
            .await
            .active
            .retain(|status| status.video_id != video.id);

        let mut context = BTreeMap::new();
        context.insert("args".to_string(), json!(args));
        context.insert("output_tail".to_string(), json!(tail));
        context.insert("exit_code".to_string(), json!(exit.code));
        context.insert("signal".to_string(), json!(exit.signal));

        if !exit.success() {
            let (category, code) = classify_exit(exit);
            self.fail(&video, category, code, format!("encoder failed with {}", exit), context)
                .await;
            return Err(EncodeError::Failed(exit));
        }

        let output_bytes = match tokio::fs::metadata(&params.output_path).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            Ok(_) => {
                let message = "encoder output is empty".to_string();
                let _ = tokio::fs::remove_file(&params.output_path).await;
                self.fail(&video, EncodeFailure::CodecIssues, "empty_output", message.clone(), context)
                    .await;
                return Err(EncodeError::InvalidOutput(message));
            }
            Err(e) => {
                let message = format!("encoder output missing: {}", e);
                self.fail(&video, EncodeFailure::CodecIssues, "missing_output", message.clone(), context)
                    .await;
                return Err(EncodeError::InvalidOutput(message));
            }
        };

        let snapshot = video.clone();
        let output_path = params.output_path.clone();
        let outcome = self
            .ctx
            .machine
            .blocking(move |machine| machine.mark_encoded(&snapshot, Some(output_path)))
            .await?;
        match outcome {
            TransitionOutcome::Updated(encoded) => {
                let video_id = encoded.id;
                let resolved = self
                    .ctx
                    .ledger
                    .blocking(move |ledger| ledger.resolve_stage(video_id, FailureStage::Encode))
                    .await;
                if let Err(e) = resolved {
                    error!(video_id = encoded.id, error = %e, "failed to resolve encode failures");
                }
                let mut activity = self.activity.write().await;
                activity.completed += 1;
                activity.bytes_encoded += output_bytes;
                info!(video_id = encoded.id, output_bytes, "encode finished");
                Ok(encoded)
            }
            TransitionOutcome::Stale => {
                warn!(video_id = video.id, "video changed while encoding");
                Ok(video)
            }
        }
    }

    /// Acquire a permit, then start and finish one encode.
    pub async fn execute(&self, item: WorkItem) -> Result<Option<Video>, EncodeError> {
        let Ok(_permit) = self.semaphore.clone().acquire_owned().await else {
            return Ok(None);
        };
        match self.start(item).await? {
            Some(job) => self.finish(job).await.map(Some),
            None => Ok(None),
        }
    }

    async fn fail(
        &self,
        video: &Video,
        category: EncodeFailure,
        code: &str,
        message: String,
        context: BTreeMap<String, Value>,
    ) {
        self.activity.write().await.failed += 1;
        let video_id = video.id;
        let failure_code = code.to_string();
        let recorded = self
            .ctx
            .ledger
            .blocking(move |ledger| {
                ledger.record(
                    video_id,
                    FailureCategory::Encode(category),
                    &failure_code,
                    message,
                    context,
                )
            })
            .await;
        if let Err(e) = recorded {
            error!(video_id, error = %e, "failed to record encode failure");
        }
        let snapshot = video.clone();
        match self
            .ctx
            .machine
            .blocking(move |machine| machine.mark_failed(&snapshot))
            .await
        {
            Ok(TransitionOutcome::Updated(_)) => info!(video_id = video.id, code, "encode failed"),
            Ok(TransitionOutcome::Stale) => {
                warn!(video_id = video.id, "video changed before it could be failed")
            }
            Err(e) => error!(video_id = video.id, error = %e, "failed to mark video failed"),
        }
    }
}

/// SIGKILL usually means the OOM killer; everything else is a plain process failure.
fn classify_exit(exit: ProcessExit) -> (EncodeFailure, &'static str) {
    match exit.signal {
        Some(SIGKILL) => (EncodeFailure::ResourceExhaustion, "killed"),
        Some(_) => (EncodeFailure::ProcessFailure, "terminated"),
        None => (EncodeFailure::ProcessFailure, "exit_status"),
    }
}
