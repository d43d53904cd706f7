//! Quality-search actor.
//!
//! One task per searcher, driven by an mpsc mailbox. While a search runs the
//! task also selects on the child's output, so lines are handled strictly in
//! emission order and administrative commands still get through.

use super::command::{build_crf_search_args, CrfRange};
use super::parser::{parse_line, SearchEvent};
use crate::config::CrfSearchConfig;
use crate::failures::FailureLedger;
use crate::models::{
    FailureCategory, FailureStage, QualitySample, QualitySearchFailure, Video, VideoState,
};
use crate::rules::{Purpose, Rules};
use crate::state_machine::{ChooseOutcome, StateMachine, StateMachineError, TransitionOutcome};
use crate::store::StoreError;
use crate::subprocess::{ProcessEvent, ProcessExit, RunningProcess, SubprocessError, SubprocessRunner};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const MAILBOX_CAPACITY: usize = 16;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("searcher {0} is busy")]
    Busy(usize),

    #[error(transparent)]
    Launch(#[from] SubprocessError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("searcher {0} has stopped")]
    Stopped(usize),
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub video: Video,
    /// VMAF target; the configured default when `None`.
    pub target: Option<u32>,
    /// Search the standard range even when a sibling's result is known.
    pub retry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { video_id: i64, pid: u32 },
    /// Another worker claimed the video first; nothing was recorded.
    AlreadyClaimed,
}

/// Point-in-time view of one searcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearcherStatus {
    pub id: usize,
    pub busy: bool,
    pub video_id: Option<i64>,
    pub pid: Option<u32>,
    pub attempt: u32,
    pub target: Option<u32>,
    pub min_crf: Option<u32>,
    pub max_crf: Option<u32>,
}

/// Shared collaborators every searcher needs.
#[derive(Clone)]
pub struct SearcherContext {
    pub machine: StateMachine,
    pub ledger: FailureLedger,
    pub runner: SubprocessRunner,
    pub rules: Arc<dyn Rules>,
    pub config: CrfSearchConfig,
}

enum Command {
    Search {
        request: SearchRequest,
        reply: oneshot::Sender<Result<StartOutcome, SearchError>>,
    },
    Status {
        reply: oneshot::Sender<SearcherStatus>,
    },
    Kill {
        reply: oneshot::Sender<bool>,
    },
    ResetIfStuck {
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable mailbox handle to a searcher task.
#[derive(Debug, Clone)]
pub struct SearcherHandle {
    id: usize,
    tx: mpsc::Sender<Command>,
}

impl SearcherHandle {
    /// Spawn the actor on the current runtime.
    pub fn spawn(id: usize, ctx: SearcherContext) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let searcher = Searcher { id, ctx, job: None };
        tokio::spawn(searcher.run(rx));
        Self { id, tx }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Launch a search; resolves once the process is running (or not).
    pub async fn search(&self, request: SearchRequest) -> Result<StartOutcome, SearchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Search { request, reply }).await?;
        rx.await.map_err(|_| SearchError::Stopped(self.id))?
    }

    pub async fn status(&self) -> Result<SearcherStatus, SearchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| SearchError::Stopped(self.id))
    }

    /// Terminate the running search and hand its video back; false when idle.
    pub async fn kill(&self) -> Result<bool, SearchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Kill { reply }).await?;
        rx.await.map_err(|_| SearchError::Stopped(self.id))
    }

    pub async fn reset_if_stuck(&self) -> Result<bool, SearchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ResetIfStuck { reply }).await?;
        rx.await.map_err(|_| SearchError::Stopped(self.id))
    }

    async fn send(&self, command: Command) -> Result<(), SearchError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SearchError::Stopped(self.id))
    }
}

struct ActiveSearch {
    run_id: Uuid,
    video: Video,
    process: RunningProcess,
    args: Vec<String>,
    range: CrfRange,
    target: u32,
    original_target: u32,
    attempt: u32,
    saw_no_suitable_crf: bool,
    /// Success was handled; remaining output is ignored until exit.
    finished: bool,
}

impl ActiveSearch {
    fn context(&self, exit: Option<ProcessExit>) -> BTreeMap<String, Value> {
        let mut context = BTreeMap::new();
        context.insert("run_id".to_string(), json!(self.run_id.to_string()));
        context.insert("attempt".to_string(), json!(self.attempt));
        context.insert("min_crf".to_string(), json!(self.range.min));
        context.insert("max_crf".to_string(), json!(self.range.max));
        context.insert("target".to_string(), json!(self.target));
        context.insert("pid".to_string(), json!(self.process.pid()));
        context.insert("args".to_string(), json!(self.args));
        if let Some(exit) = exit {
            context.insert("exit_code".to_string(), json!(exit.code));
            context.insert("signal".to_string(), json!(exit.signal));
        }
        context
    }
}

enum Wake {
    Command(Option<Command>),
    Process(ProcessEvent),
}

struct Searcher {
    id: usize,
    ctx: SearcherContext,
    job: Option<ActiveSearch>,
}

impl Searcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!(searcher = self.id, "searcher started");
        loop {
            let wake = match self.job.as_mut() {
                Some(job) => tokio::select! {
                    biased;
                    command = rx.recv() => Wake::Command(command),
                    event = job.process.next_event() => Wake::Process(event),
                },
                None => Wake::Command(rx.recv().await),
            };

            match wake {
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Command(None) => break,
                Wake::Process(event) => self.handle_process_event(event).await,
            }
        }
        self.abort("shutdown").await;
        debug!(searcher = self.id, "searcher stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Search { request, reply } => {
                let result = self.start(request).await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Kill { reply } => {
                let killed = self.abort("kill").await;
                let _ = reply.send(killed);
            }
            Command::ResetIfStuck { reply } => {
                let reset = self.abort("reset").await;
                let _ = reply.send(reset);
            }
        }
    }

    fn status(&self) -> SearcherStatus {
        match &self.job {
            Some(job) => SearcherStatus {
                id: self.id,
                busy: true,
                video_id: Some(job.video.id),
                pid: Some(job.process.pid()),
                attempt: job.attempt,
                target: Some(job.target),
                min_crf: Some(job.range.min),
                max_crf: Some(job.range.max),
            },
            None => SearcherStatus {
                id: self.id,
                busy: false,
                video_id: None,
                pid: None,
                attempt: 0,
                target: None,
                min_crf: None,
                max_crf: None,
            },
        }
    }

    fn size_ceiling(&self) -> u64 {
        (self.ctx.config.size_ceiling_gib * GIB) as u64
    }

    fn args_for(&self, video: &Video, range: CrfRange, target: u32) -> Vec<String> {
        build_crf_search_args(
            &video.path,
            range,
            target,
            self.ctx.rules.args(video, Purpose::CrfSearch),
        )
    }

    async fn start(&mut self, request: SearchRequest) -> Result<StartOutcome, SearchError> {
        if self.job.is_some() {
            return Err(SearchError::Busy(self.id));
        }

        let video = request.video;
        let target = request
            .target
            .unwrap_or(self.ctx.config.default_target_vmaf);
        let lookup = video.clone();
        let sibling = self
            .ctx
            .machine
            .store()
            .blocking(move |store| store.sibling_chosen_crf(&lookup))
            .await?;
        let range = CrfRange::select(sibling, request.retry, &self.ctx.config);
        let args = self.args_for(&video, range, target);

        let mut process = match self.ctx.runner.spawn(&args) {
            Ok(process) => process,
            Err(e) => {
                let mut context = BTreeMap::new();
                context.insert("args".to_string(), json!(args));
                self.fail_video(
                    &video,
                    QualitySearchFailure::VmafCalculation,
                    "launch_failed",
                    e.to_string(),
                    context,
                )
                .await;
                return Err(e.into());
            }
        };

        // The claim happens only once a process exists to do the work.
        let claim = video.clone();
        match self
            .ctx
            .machine
            .blocking(move |machine| machine.mark_crf_searching(&claim))
            .await
        {
            Ok(TransitionOutcome::Updated(video)) => {
                let pid = process.pid();
                let run_id = Uuid::new_v4();
                info!(
                    searcher = self.id,
                    video_id = video.id,
                    pid,
                    %run_id,
                    attempt = 1,
                    range = %range,
                    target,
                    "crf search started"
                );
                let video_id = video.id;
                self.job = Some(ActiveSearch {
                    run_id,
                    video,
                    process,
                    args,
                    range,
                    target,
                    original_target: target,
                    attempt: 1,
                    saw_no_suitable_crf: false,
                    finished: false,
                });
                Ok(StartOutcome::Started { video_id, pid })
            }
            Ok(TransitionOutcome::Stale) => {
                info!(searcher = self.id, video_id = video.id, "video already claimed, dropping search");
                process.terminate().await;
                Ok(StartOutcome::AlreadyClaimed)
            }
            Err(e) => {
                process.terminate().await;
                Err(e.into())
            }
        }
    }

    async fn handle_process_event(&mut self, event: ProcessEvent) {
        let Some(job) = self.job.take() else {
            return;
        };
        self.job = match event {
            ProcessEvent::Line(line) => self.on_line(job, &line).await,
            ProcessEvent::Exited(exit) => self.on_exit(job, exit).await,
        };
    }

    async fn on_line(&mut self, mut job: ActiveSearch, line: &str) -> Option<ActiveSearch> {
        if job.finished {
            return Some(job);
        }

        let event = parse_line(line);
        match &event {
            SearchEvent::Sample {
                crf,
                score,
                percent,
            } => {
                self.record_sample(
                    &job.video,
                    QualitySample {
                        crf: *crf,
                        score: *score,
                        percent: *percent,
                        predicted_size: None,
                        predicted_time: None,
                        target: job.target,
                        params: job.args.clone(),
                    },
                )
                .await;
            }
            SearchEvent::Eta {
                crf,
                score,
                percent,
                ..
            } => {
                let predicted_size = event.predicted_bytes();
                if predicted_size.map_or(false, |size| size > self.size_ceiling()) {
                    warn!(
                        video_id = job.video.id,
                        crf,
                        predicted_size,
                        "predicted size above ceiling"
                    );
                }
                self.record_sample(
                    &job.video,
                    QualitySample {
                        crf: *crf,
                        score: *score,
                        percent: *percent,
                        predicted_size,
                        predicted_time: event.predicted_seconds(),
                        target: job.target,
                        params: job.args.clone(),
                    },
                )
                .await;
            }
            SearchEvent::Success { crf } => return self.on_success(job, *crf).await,
            SearchEvent::NoSuitableCrf => {
                debug!(video_id = job.video.id, attempt = job.attempt, "no suitable crf reported");
                job.saw_no_suitable_crf = true;
            }
            SearchEvent::Ignored => trace!(video_id = job.video.id, line, "ignored output"),
        }
        Some(job)
    }

    async fn record_sample(&self, video: &Video, sample: QualitySample) {
        let crf = sample.crf;
        let snapshot = video.clone();
        let stored = self
            .ctx
            .machine
            .blocking(move |machine| machine.upsert_quality_result(&snapshot, &sample))
            .await;
        if let Err(e) = stored {
            error!(video_id = video.id, crf, error = %e, "failed to store sample");
        }
    }

    async fn on_success(&mut self, mut job: ActiveSearch, crf: f64) -> Option<ActiveSearch> {
        let snapshot = job.video.clone();
        let chosen = match self
            .ctx
            .machine
            .blocking(move |machine| machine.choose_quality_result(&snapshot, crf))
            .await
        {
            Ok(ChooseOutcome::Chosen { video, result }) => {
                job.video = video;
                result
            }
            Ok(ChooseOutcome::NotFound) => {
                let message = format!("crf {} reported successful without a sample", crf);
                self.fail_job(job, QualitySearchFailure::CrfOptimization, "unknown_crf", message, None)
                    .await;
                return None;
            }
            Ok(ChooseOutcome::Stale) => {
                warn!(video_id = job.video.id, "video changed during search, abandoning");
                job.process.terminate().await;
                return None;
            }
            Err(e) => {
                self.fail_job(job, QualitySearchFailure::CrfOptimization, "store_error", e.to_string(), None)
                    .await;
                return None;
            }
        };

        let ceiling = self.size_ceiling();
        if let Some(size) = chosen.predicted_size.filter(|size| *size > ceiling) {
            let message = format!(
                "chosen crf {} predicts {} bytes, above the {} byte ceiling",
                chosen.crf, size, ceiling
            );
            self.fail_job(job, QualitySearchFailure::SizeLimits, "size_limit_exceeded", message, None)
                .await;
            return None;
        }

        let snapshot = job.video.clone();
        match self
            .ctx
            .machine
            .blocking(move |machine| machine.mark_crf_searched(&snapshot))
            .await
        {
            Ok(TransitionOutcome::Updated(video)) => {
                info!(
                    searcher = self.id,
                    video_id = video.id,
                    crf = chosen.crf,
                    score = chosen.score,
                    attempt = job.attempt,
                    "crf search succeeded"
                );
                let video_id = video.id;
                if let Err(e) = self
                    .ctx
                    .ledger
                    .blocking(move |ledger| ledger.resolve_stage(video_id, FailureStage::QualitySearch))
                    .await
                {
                    error!(video_id = video.id, error = %e, "failed to resolve failures");
                }
                job.video = video;
                job.finished = true;
                Some(job)
            }
            Ok(TransitionOutcome::Stale) => {
                warn!(video_id = job.video.id, "video changed before crf_searched, abandoning");
                job.process.terminate().await;
                None
            }
            Err(e) => {
                self.fail_job(job, QualitySearchFailure::CrfOptimization, "invalid_result", e.to_string(), None)
                    .await;
                None
            }
        }
    }

    async fn on_exit(&mut self, job: ActiveSearch, exit: ProcessExit) -> Option<ActiveSearch> {
        if job.finished {
            debug!(video_id = job.video.id, status = %exit, "crf search process exited");
            return None;
        }
        if job.saw_no_suitable_crf {
            return self.escalate(job, exit).await;
        }

        let (code, message) = if exit.success() {
            ("no_result", "crf search exited without a result".to_string())
        } else if exit.code.is_some() {
            ("exit_status", format!("crf search failed with {}", exit))
        } else {
            ("terminated", format!("crf search terminated by {}", exit))
        };
        self.fail_job(job, QualitySearchFailure::VmafCalculation, code, message, Some(exit))
            .await;
        None
    }

    /// Retry cascade after "no suitable crf".
    async fn escalate(&mut self, job: ActiveSearch, exit: ProcessExit) -> Option<ActiveSearch> {
        let limit = self.ctx.config.max_unresolved_failures;
        let video_id = job.video.id;
        let unresolved = self
            .ctx
            .ledger
            .blocking(move |ledger| ledger.unresolved_count(video_id, FailureStage::QualitySearch))
            .await
            .unwrap_or_else(|e| {
                error!(video_id = job.video.id, error = %e, "failed to count failures");
                limit
            });

        if unresolved >= limit {
            let message = format!(
                "no suitable crf and {} unresolved quality search failures",
                unresolved
            );
            self.fail_job(job, QualitySearchFailure::CrfOptimization, "retry_limit_reached", message, Some(exit))
                .await;
            return None;
        }

        let standard = CrfRange::standard(&self.ctx.config);
        if job.range.narrowed {
            let target = job.target;
            return self.relaunch(job, exit, standard, target).await;
        }
        if job.target == job.original_target && job.target > self.ctx.config.vmaf_floor {
            let target = job.target - 1;
            return self.relaunch(job, exit, standard, target).await;
        }

        let message = format!(
            "no suitable crf in {} at VMAF {} after {} attempts",
            job.range, job.target, job.attempt
        );
        self.fail_job(job, QualitySearchFailure::CrfOptimization, "no_suitable_crf", message, Some(exit))
            .await;
        None
    }

    async fn relaunch(
        &mut self,
        job: ActiveSearch,
        exit: ProcessExit,
        range: CrfRange,
        target: u32,
    ) -> Option<ActiveSearch> {
        let mut context = job.context(Some(exit));
        context.insert("final".to_string(), json!(false));
        context.insert("next_min_crf".to_string(), json!(range.min));
        context.insert("next_max_crf".to_string(), json!(range.max));
        context.insert("next_target".to_string(), json!(target));
        let message = format!(
            "attempt {} found no suitable crf in {} at VMAF {}",
            job.attempt, job.range, job.target
        );
        let video_id = job.video.id;
        let recorded = self
            .ctx
            .ledger
            .blocking(move |ledger| {
                ledger.record(
                    video_id,
                    FailureCategory::QualitySearch(QualitySearchFailure::CrfOptimization),
                    "no_suitable_crf",
                    message,
                    context,
                )
            })
            .await;
        if let Err(e) = recorded {
            error!(video_id, error = %e, "failed to record retry");
        }
        let snapshot = job.video.clone();
        let cleared = self
            .ctx
            .machine
            .blocking(move |machine| machine.clear_quality_results(&snapshot))
            .await;
        if let Err(e) = cleared {
            error!(video_id, error = %e, "failed to clear quality results");
        }

        let args = self.args_for(&job.video, range, target);
        let process = match self.ctx.runner.spawn(&args) {
            Ok(process) => process,
            Err(e) => {
                self.fail_job(job, QualitySearchFailure::VmafCalculation, "launch_failed", e.to_string(), None)
                    .await;
                return None;
            }
        };

        let run_id = Uuid::new_v4();
        let attempt = job.attempt + 1;
        info!(
            searcher = self.id,
            video_id = job.video.id,
            pid = process.pid(),
            %run_id,
            attempt,
            range = %range,
            target,
            "retrying crf search"
        );
        Some(ActiveSearch {
            run_id,
            video: job.video,
            process,
            args,
            range,
            target,
            original_target: job.original_target,
            attempt,
            saw_no_suitable_crf: false,
            finished: false,
        })
    }

    /// Stop the job's process, then record a final failure against its video.
    async fn fail_job(
        &self,
        mut job: ActiveSearch,
        category: QualitySearchFailure,
        code: &str,
        message: String,
        exit: Option<ProcessExit>,
    ) {
        job.process.terminate().await;
        let mut context = job.context(exit);
        context.insert("final".to_string(), json!(true));
        self.fail_video(&job.video, category, code, message, context)
            .await;
    }

    async fn fail_video(
        &self,
        video: &Video,
        category: QualitySearchFailure,
        code: &str,
        message: String,
        context: BTreeMap<String, Value>,
    ) {
        let video_id = video.id;
        let failure_code = code.to_string();
        let recorded = self
            .ctx
            .ledger
            .blocking(move |ledger| {
                ledger.record(
                    video_id,
                    FailureCategory::QualitySearch(category),
                    &failure_code,
                    message,
                    context,
                )
            })
            .await;
        if let Err(e) = recorded {
            error!(video_id, error = %e, "failed to record failure");
        }
        let snapshot = video.clone();
        match self
            .ctx
            .machine
            .blocking(move |machine| machine.mark_failed(&snapshot))
            .await
        {
            Ok(TransitionOutcome::Updated(_)) => {
                info!(searcher = self.id, video_id = video.id, code, "crf search failed")
            }
            Ok(TransitionOutcome::Stale) => {
                warn!(video_id = video.id, "video changed before it could be failed")
            }
            Err(e) => error!(video_id = video.id, error = %e, "failed to mark video failed"),
        }
    }

    /// Terminate any running search and release its video; true if there was one.
    async fn abort(&mut self, reason: &str) -> bool {
        let Some(mut job) = self.job.take() else {
            return false;
        };
        info!(
            searcher = self.id,
            video_id = job.video.id,
            pid = job.process.pid(),
            reason,
            "aborting crf search"
        );
        job.process.terminate().await;
        if job.video.state == VideoState::CrfSearching {
            let snapshot = job.video.clone();
            match self
                .ctx
                .machine
                .blocking(move |machine| machine.release_to_analyzed(&snapshot))
                .await
            {
                Ok(TransitionOutcome::Updated(_)) => {}
                Ok(TransitionOutcome::Stale) => {
                    warn!(video_id = job.video.id, "video changed before release")
                }
                Err(e) => error!(video_id = job.video.id, error = %e, "failed to release video"),
            }
        }
        true
    }
}
