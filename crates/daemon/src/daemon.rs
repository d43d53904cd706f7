//! Daemon startup and main loop
//!
//! Wires the store, state machine, failure ledger, searcher pool, encode
//! worker and admin API together, then dispatches work whenever a state event
//! frees a worker or the poll interval elapses.

use crate::admin_server::{run_admin_server, AdminState, ServerError};
use crate::config::{Config, ConfigError};
use crate::crf_search::{SearchError, SearchRequest, SearcherContext, SearcherHandle, StartOutcome};
use crate::encode::{EncodeContext, EncodeWorker};
use crate::failures::FailureLedger;
use crate::models::{Video, VideoAttrs, VideoState};
use crate::pool::WorkerPlan;
use crate::rules::{DefaultRules, Rules};
use crate::scheduler::WorkScheduler;
use crate::startup::{run_startup_checks, StartupError};
use crate::state_machine::{StateMachine, StateMachineError, TransitionOutcome};
use crate::status::{new_shared_activity, SharedActivity};
use crate::store::{run_blocking, Store, StoreError};
use crate::subprocess::SubprocessRunner;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    /// Admin server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// What one dispatch round started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub searches_started: usize,
    pub encodes_started: usize,
}

/// An encode this daemon claimed and is waiting on
struct RunningEncode {
    /// Snapshot taken when the video was claimed (`encoding`)
    video: Video,
    task: JoinHandle<()>,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived worker counts
    pub plan: WorkerPlan,
    machine: StateMachine,
    ledger: FailureLedger,
    scheduler: WorkScheduler,
    searchers: Arc<Vec<SearcherHandle>>,
    encoder: Arc<EncodeWorker>,
    activity: SharedActivity,
    encodes: Mutex<Vec<RunningEncode>>,
}

impl Daemon {
    /// Run startup checks, then build the daemon
    ///
    /// Must be called inside a Tokio runtime; searcher actors are spawned here.
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        let store = run_startup_checks(&config)?;
        Ok(Self::with_store(config, store))
    }

    /// Build the daemon on an already opened store, skipping startup checks
    pub fn with_store(config: Config, store: Store) -> Self {
        let grace = Duration::from_millis(config.crf_search.kill_grace_ms);
        let search_runner = SubprocessRunner::new(&config.crf_search.binary, grace);
        let encode_runner = SubprocessRunner::new(&config.encode.binary, grace);
        Self::with_runners(config, store, search_runner, encode_runner)
    }

    pub fn with_runners(
        config: Config,
        store: Store,
        search_runner: SubprocessRunner,
        encode_runner: SubprocessRunner,
    ) -> Self {
        let plan = WorkerPlan::derive(&config);
        let machine = StateMachine::new(store.clone());
        let ledger = FailureLedger::new(store.clone());
        let scheduler = WorkScheduler::new(store, &config.scheduler);
        let rules: Arc<dyn Rules> = Arc::new(DefaultRules::new(config.rules.clone()));
        let activity = new_shared_activity();

        let search_ctx = SearcherContext {
            machine: machine.clone(),
            ledger: ledger.clone(),
            runner: search_runner,
            rules: rules.clone(),
            config: config.crf_search.clone(),
        };
        let searchers = (0..plan.crf_searchers as usize)
            .map(|id| SearcherHandle::spawn(id, search_ctx.clone()))
            .collect();

        let encoder = EncodeWorker::new(
            EncodeContext {
                machine: machine.clone(),
                ledger: ledger.clone(),
                runner: encode_runner,
                rules,
                output_dir: config.encode.output_dir.clone(),
            },
            plan.encoders,
            activity.clone(),
        );

        info!(
            cores = plan.total_cores,
            crf_searchers = plan.crf_searchers,
            encoders = plan.encoders,
            "worker plan"
        );

        Self {
            config,
            plan,
            machine,
            ledger,
            scheduler,
            searchers: Arc::new(searchers),
            encoder: Arc::new(encoder),
            activity,
            encodes: Mutex::new(Vec::new()),
        }
    }

    /// State shared with the admin API
    pub fn admin_state(&self) -> AdminState {
        AdminState {
            searchers: self.searchers.clone(),
            machine: self.machine.clone(),
            ledger: self.ledger.clone(),
            activity: self.activity.clone(),
        }
    }

    /// Return videos left mid-flight by a previous run to their queues.
    ///
    /// `crf_searching` goes back to `analyzed` (partial results dropped) and
    /// `encoding` goes back to `crf_searched`. Only safe at startup, before
    /// this daemon holds claims of its own.
    pub async fn recover_interrupted(&self) -> Result<usize, DaemonError> {
        Ok(self.machine.blocking(recover_interrupted_videos).await?)
    }

    /// Hand analyzed videos to idle searchers and scheduled work to free encoders.
    pub async fn dispatch_once(&self) -> Result<DispatchSummary, DaemonError> {
        let mut summary = DispatchSummary::default();

        let mut idle = Vec::new();
        for handle in self.searchers.iter() {
            match handle.status().await {
                Ok(status) if !status.busy => idle.push(handle),
                Ok(_) => {}
                Err(e) => warn!(searcher = handle.id(), error = %e, "searcher unavailable"),
            }
        }
        if !idle.is_empty() {
            let scheduler = self.scheduler.clone();
            let limit = idle.len();
            let videos =
                run_blocking(move || scheduler.select_for_quality_search(limit)).await?;
            for (handle, video) in idle.into_iter().zip(videos) {
                let video_id = video.id;
                let request = SearchRequest {
                    video,
                    target: None,
                    retry: false,
                };
                match handle.search(request).await {
                    Ok(StartOutcome::Started { pid, .. }) => {
                        debug!(searcher = handle.id(), video_id, pid, "search dispatched");
                        summary.searches_started += 1;
                    }
                    Ok(StartOutcome::AlreadyClaimed) => {
                        debug!(video_id, "video claimed elsewhere")
                    }
                    Err(SearchError::Busy(id)) => debug!(searcher = id, "searcher became busy"),
                    Err(e) => warn!(searcher = handle.id(), video_id, error = %e, "search not started"),
                }
            }
        }

        let free = self.encoder.available_permits();
        if free > 0 {
            let mut encodes = self.encodes.lock().await;
            encodes.retain(|running| !running.task.is_finished());
            let scheduler = self.scheduler.clone();
            for item in run_blocking(move || scheduler.select_for_encoding(free)).await? {
                let Some(permit) = self.encoder.try_acquire_permit() else {
                    break;
                };
                let video_id = item.video.id;
                match self.encoder.start(item).await {
                    Ok(Some(job)) => {
                        let video = job.video.clone();
                        let encoder = self.encoder.clone();
                        let task = tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(e) = encoder.finish(job).await {
                                warn!(video_id, error = %e, "encode failed");
                            }
                        });
                        encodes.push(RunningEncode { video, task });
                        summary.encodes_started += 1;
                    }
                    Ok(None) => debug!(video_id, "video claimed elsewhere"),
                    Err(e) => warn!(video_id, error = %e, "encode not started"),
                }
            }
        }

        Ok(summary)
    }

    /// Kill running searches and encodes, then requeue their videos.
    ///
    /// Only claims held by this daemon are touched; searchers release their
    /// own video and each aborted encode goes back to `crf_searched`.
    pub async fn shutdown(&self) {
        for handle in self.searchers.iter() {
            if let Err(e) = handle.kill().await {
                warn!(searcher = handle.id(), error = %e, "failed to stop searcher");
            }
        }

        let encodes: Vec<RunningEncode> = self.encodes.lock().await.drain(..).collect();
        for RunningEncode { video, task } in encodes {
            if task.is_finished() {
                continue;
            }
            task.abort();
            let _ = task.await;
            self.activity
                .write()
                .await
                .active
                .retain(|status| status.video_id != video.id);

            let video_id = video.id;
            match self
                .machine
                .blocking(move |machine| requeue_encode(machine, &video))
                .await
            {
                Ok(TransitionOutcome::Updated(_)) => info!(video_id, "requeued interrupted encode"),
                Ok(TransitionOutcome::Stale) => debug!(video_id, "encode finished before shutdown"),
                Err(e) => error!(video_id, error = %e, "failed to requeue encode"),
            }
        }
        info!("daemon stopped");
    }

    /// Run the dispatch loop and admin API until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        self.recover_interrupted().await?;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let bind = self.config.admin.bind.clone();
        let admin = self.admin_state();
        let server = tokio::spawn(async move {
            run_admin_server(&bind, admin, async {
                let _ = stop_rx.await;
            })
            .await
        });

        let mut events = self.machine.subscribe();
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.scheduler.poll_interval_ms.max(1)));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tick.tick() => {}
                event = events.recv() => match event {
                    // Only transitions that can free a worker or add work.
                    Ok(event) if !matches!(
                        event.state,
                        VideoState::Analyzed | VideoState::CrfSearched | VideoState::Encoded | VideoState::Failed
                    ) => continue,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "state events lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
            if server.is_finished() {
                break;
            }
            if let Err(e) = self.dispatch_once().await {
                error!(error = %e, "dispatch failed");
            }
        }

        info!("shutting down");
        self.shutdown().await;
        let _ = stop_tx.send(());
        match server.await {
            Ok(result) => result?,
            Err(e) => error!(error = %e, "admin server task failed"),
        }
        Ok(())
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.run_until(shutdown_signal()).await
    }
}

/// `encoding -> crf_searched`, or `failed` when the video no longer validates.
fn requeue_encode(
    machine: &StateMachine,
    video: &Video,
) -> Result<TransitionOutcome, StateMachineError> {
    match machine.transition(video, VideoState::CrfSearched, VideoAttrs::default()) {
        Err(StateMachineError::Validation { reason, .. }) => {
            warn!(video_id = video.id, reason = %reason, "cannot requeue encode");
            machine.mark_failed(video)
        }
        other => other,
    }
}

fn recover_interrupted_videos(machine: &StateMachine) -> Result<usize, StateMachineError> {
    let store = machine.store();
    let mut recovered = 0;
    for video in store.videos_in_state(VideoState::CrfSearching)? {
        if !machine.release_to_analyzed(&video)?.is_stale() {
            recovered += 1;
        }
    }
    for video in store.videos_in_state(VideoState::Encoding)? {
        if !requeue_encode(machine, &video)?.is_stale() {
            recovered += 1;
        }
    }
    if recovered > 0 {
        info!(count = recovered, "requeued interrupted videos");
    }
    Ok(recovered)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkersConfig;
    use crate::models::{ContentSource, Video, VideoMetadata};
    use crate::state_machine::{ChooseOutcome, StateEvent};
    use crate::store::test_support::{new_video, sample};
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    /// Stands in for both `crf-search` and `encode`.
    const FAKE_TOOL: &str = r#"mode="$1"
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--output" ]; then out="$2"; fi
  shift
done
if [ "$mode" = "crf-search" ]; then
  echo 'sample 1/4 crf 24 VMAF 95.2 (60%)'
  echo 'crf 24 VMAF 95.2 predicted video stream size 8.2 GB (60%) taking 40 minutes'
  echo 'crf 24 successful'
else
  printf 'av1' > "$out"
fi"#;

    fn runner(script: &Path) -> SubprocessRunner {
        SubprocessRunner::new("/bin/sh", Duration::from_millis(500))
            .with_leading_args(vec![script.to_string_lossy().to_string()])
    }

    fn daemon(dir: &TempDir, tool: &str) -> Daemon {
        let script = dir.path().join("tool.sh");
        std::fs::write(&script, tool).unwrap();
        let mut config = Config::default();
        config.workers = WorkersConfig {
            logical_cores: Some(8),
            crf_searchers: 1,
            encoders: 1,
        };
        config.encode.output_dir = dir.path().join("out");
        config.admin.bind = "127.0.0.1:0".to_string();
        let store = Store::open_in_memory().unwrap();
        Daemon::with_runners(config, store, runner(&script), runner(&script))
    }

    fn analyzed(daemon: &Daemon, path: &str) -> Video {
        let video = daemon
            .machine
            .store()
            .insert_video(&new_video(path, ContentSource::Movies, 1))
            .unwrap();
        let metadata = VideoMetadata {
            width: 3840,
            height: 2160,
            duration: Some(7_200.0),
            bitrate: 40_000_000,
            frame_rate: Some(24.0),
            video_codecs: vec!["hevc".to_string()],
            audio_codecs: vec!["truehd".to_string()],
            hdr: None,
            size: Some(30_000_000_000),
            title: Some("Dune".to_string()),
        };
        match daemon.machine.mark_analyzed(&video, &metadata).unwrap() {
            TransitionOutcome::Updated(video) => video,
            TransitionOutcome::Stale => panic!("stale"),
        }
    }

    /// A video that finished quality search with crf 28.
    fn searched(daemon: &Daemon, path: &str) -> Video {
        let machine = &daemon.machine;
        let video = analyzed(daemon, path);
        let video = machine
            .mark_crf_searching(&video)
            .unwrap()
            .video()
            .unwrap()
            .clone();
        machine
            .upsert_quality_result(&video, &sample(28.0, 95.4, Some(1_000)))
            .unwrap();
        let video = match machine.choose_quality_result(&video, 28.0).unwrap() {
            ChooseOutcome::Chosen { video, .. } => video,
            other => panic!("unexpected {:?}", other),
        };
        machine
            .mark_crf_searched(&video)
            .unwrap()
            .video()
            .unwrap()
            .clone()
    }

    async fn wait_for(events: &mut broadcast::Receiver<StateEvent>, id: i64, state: VideoState) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.video.id == id && event.state == state {
                    return;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("video {} never reached {}", id, state));
    }

    #[tokio::test]
    async fn test_pool_matches_plan() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir, FAKE_TOOL);
        assert_eq!(daemon.searchers.len(), 1);
        assert_eq!(daemon.encoder.available_permits(), 1);
        assert_eq!(daemon.plan.total_cores, 8);
    }

    #[tokio::test]
    async fn test_video_flows_from_analyzed_to_encoded() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir, FAKE_TOOL);
        let video = analyzed(&daemon, "/media/movies/dune.mkv");
        let mut events = daemon.machine.subscribe();

        let summary = daemon.dispatch_once().await.unwrap();
        assert_eq!(summary.searches_started, 1);
        assert_eq!(summary.encodes_started, 0);
        wait_for(&mut events, video.id, VideoState::CrfSearched).await;

        let summary = daemon.dispatch_once().await.unwrap();
        assert_eq!(summary.encodes_started, 1);
        wait_for(&mut events, video.id, VideoState::Encoded).await;
        let running: Vec<RunningEncode> = daemon.encodes.lock().await.drain(..).collect();
        for encode in running {
            encode.task.await.unwrap();
        }

        let encoded = daemon.machine.store().require_video(video.id).unwrap();
        assert!(encoded.path.starts_with(dir.path().join("out")));
        assert!(encoded.path.exists());
        assert_eq!(daemon.activity.read().await.completed, 1);
    }

    #[tokio::test]
    async fn test_nothing_to_dispatch() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir, FAKE_TOOL);
        let summary = daemon.dispatch_once().await.unwrap();
        assert_eq!(summary, DispatchSummary::default());
    }

    #[tokio::test]
    async fn test_shutdown_releases_running_search() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir, "exec sleep 30");
        let video = analyzed(&daemon, "/media/movies/long.mkv");

        daemon.dispatch_once().await.unwrap();
        let state = daemon.machine.store().require_video(video.id).unwrap().state;
        assert_eq!(state, VideoState::CrfSearching);

        daemon.shutdown().await;

        let state = daemon.machine.store().require_video(video.id).unwrap().state;
        assert_eq!(state, VideoState::Analyzed);
    }

    #[tokio::test]
    async fn test_recover_interrupted_requeues_videos() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir, FAKE_TOOL);
        let machine = &daemon.machine;

        let searching = analyzed(&daemon, "/media/movies/a.mkv");
        let searching = machine
            .mark_crf_searching(&searching)
            .unwrap()
            .video()
            .unwrap()
            .clone();
        machine
            .upsert_quality_result(&searching, &sample(30.0, 95.0, None))
            .unwrap();

        let encoding = searched(&daemon, "/media/movies/b.mkv");
        machine.mark_encoding(&encoding).unwrap();

        assert_eq!(daemon.recover_interrupted().await.unwrap(), 2);

        let store = machine.store();
        assert_eq!(store.require_video(searching.id).unwrap().state, VideoState::Analyzed);
        assert!(store.quality_results_for(searching.id).unwrap().is_empty());
        assert_eq!(store.require_video(encoding.id).unwrap().state, VideoState::CrfSearched);
        assert_eq!(daemon.recover_interrupted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_requeues_only_own_claims() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir, "exec sleep 30");
        let own = searched(&daemon, "/media/movies/own.mkv");

        let summary = daemon.dispatch_once().await.unwrap();
        assert_eq!(summary.encodes_started, 1);
        let store = daemon.machine.store();
        assert_eq!(store.require_video(own.id).unwrap().state, VideoState::Encoding);

        // Claims held by another daemon sharing the database.
        let other_search = analyzed(&daemon, "/media/movies/other-a.mkv");
        daemon.machine.mark_crf_searching(&other_search).unwrap();
        let other_encode = searched(&daemon, "/media/movies/other-b.mkv");
        daemon.machine.mark_encoding(&other_encode).unwrap();

        tokio::time::timeout(Duration::from_secs(10), daemon.shutdown())
            .await
            .expect("shutdown finishes");

        assert_eq!(store.require_video(own.id).unwrap().state, VideoState::CrfSearched);
        assert_eq!(
            store.require_video(other_search.id).unwrap().state,
            VideoState::CrfSearching
        );
        assert_eq!(
            store.require_video(other_encode.id).unwrap().state,
            VideoState::Encoding
        );
        assert!(daemon.activity.read().await.active.is_empty());
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir, FAKE_TOOL);
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            daemon.run_until(tokio::time::sleep(Duration::from_millis(100))),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}
