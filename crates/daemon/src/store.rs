//! SQLite-backed repository for videos, quality results and failures.
//!
//! The store is the only place SQL lives. Every call goes through
//! [`retry_on_busy`], so a `SQLITE_BUSY`/`SQLITE_LOCKED` from another process
//! is retried with bounded exponential backoff and never reaches callers
//! unless the budget runs out. Video updates are compare-and-swap on the
//! `version` column; a zero-row update is reported as `false`, not an error.

use crate::models::{
    current_timestamp_ms, ContentSource, Environment, FailureCategory, FailureRecord,
    FailureStage, NewFailure, NewVideo, QualityResult, QualitySample, Video, VideoState,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const SCHEMA: &str = include_str!("../sql/schema.sql");

const VIDEO_COLUMNS: &str = "id, path, title, size, state, bitrate, width, height, duration, \
     frame_rate, video_codecs, audio_codecs, hdr, content_source, library_id, content_group, \
     chosen_quality_result_id, version, created_at, updated_at";

const RESULT_COLUMNS: &str =
    "id, video_id, crf, score, percent, predicted_size, predicted_time, chosen, target, params";

const FAILURE_COLUMNS: &str = "id, video_id, stage, category, code, message, context, \
     retry_count, resolved, resolved_at, host, os_version, daemon_version, created_at";

/// Tolerance used when matching CRF values parsed from text.
const CRF_EPSILON: f64 = 0.001;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database stayed busy after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("database connection mutex poisoned")]
    Poisoned,

    #[error("video not found: {0}")]
    VideoNotFound(i64),

    #[error("blocking database task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Backoff budget for transient busy/locked errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(800),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// True for the SQLite conditions that clear up on their own.
pub fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Run `op`, retrying transient busy errors with exponential backoff.
pub fn retry_on_busy<T>(
    policy: RetryPolicy,
    mut op: impl FnMut() -> rusqlite::Result<T>,
) -> StoreResult<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                if attempt >= policy.max_attempts {
                    warn!(attempts = attempt, "database busy, giving up");
                    return Err(StoreError::Busy { attempts: attempt });
                }
                let delay = policy.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "database busy, retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(StoreError::Sqlite(err)),
        }
    }
}

/// Run synchronous database work on tokio's blocking pool.
///
/// Store calls hold the connection mutex and may sleep between busy retries,
/// so async code never calls them on a runtime worker thread.
pub async fn run_blocking<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| E::from(StoreError::Task(e.to_string())))?
}

/// Cloneable handle to the SQLite database.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\n\
             PRAGMA synchronous = NORMAL;\n\
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_connection(conn)
    }

    /// Private in-memory database; used by tests and dry runs.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run `f` against a clone of this store via [`run_blocking`].
    pub async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Store) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        run_blocking(move || f(&store)).await
    }

    fn read<T>(&self, mut f: impl FnMut(&Connection) -> rusqlite::Result<T>) -> StoreResult<T> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        retry_on_busy(self.retry, || f(&conn))
    }

    fn write<T>(&self, mut f: impl FnMut(&Connection) -> rusqlite::Result<T>) -> StoreResult<T> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        retry_on_busy(self.retry, || {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    // ---- videos ----

    /// Create a video in `needs_analysis`. Only external producers do this.
    pub fn insert_video(&self, new: &NewVideo) -> StoreResult<Video> {
        let now = current_timestamp_ms();
        let source = new.content_source.unwrap_or(ContentSource::Series);
        self.write(|conn| {
            conn.query_row(
                &format!(
                    "INSERT INTO videos (path, size, state, content_source, library_id, \
                     content_group, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7) RETURNING {}",
                    VIDEO_COLUMNS
                ),
                params![
                    new.path.to_string_lossy(),
                    new.size.map(|s| s as i64),
                    VideoState::NeedsAnalysis.as_str(),
                    source.as_str(),
                    new.library_id,
                    new.content_group,
                    now,
                ],
                video_from_row,
            )
        })
    }

    pub fn get_video(&self, id: i64) -> StoreResult<Option<Video>> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM videos WHERE id = ?1", VIDEO_COLUMNS),
                params![id],
                video_from_row,
            )
            .optional()
        })
    }

    pub fn require_video(&self, id: i64) -> StoreResult<Video> {
        self.get_video(id)?.ok_or(StoreError::VideoNotFound(id))
    }

    pub fn videos_in_state(&self, state: VideoState) -> StoreResult<Vec<Video>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM videos WHERE state = ?1 ORDER BY id",
                VIDEO_COLUMNS
            ))?;
            let rows = stmt.query_map(params![state.as_str()], video_from_row)?;
            rows.collect()
        })
    }

    /// Number of videos per state; states with no videos report zero.
    pub fn count_by_state(&self) -> StoreResult<BTreeMap<VideoState, u64>> {
        let counted: Vec<(String, i64)> = self.read(|conn| {
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM videos GROUP BY state")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })?;
        let mut counts: BTreeMap<VideoState, u64> =
            VideoState::ALL.iter().map(|state| (*state, 0)).collect();
        for (state, count) in counted {
            if let Ok(state) = state.parse::<VideoState>() {
                counts.insert(state, count as u64);
            }
        }
        Ok(counts)
    }

    /// Write every mutable column of `next` if the row is still at `expected_version`.
    ///
    /// Returns the stored row on success and `None` when another writer got
    /// there first.
    pub fn cas_update_video(&self, expected_version: i64, next: &Video) -> StoreResult<Option<Video>> {
        let now = current_timestamp_ms();
        let video_codecs = encode_list(&next.video_codecs);
        let audio_codecs = encode_list(&next.audio_codecs);
        self.write(|conn| {
            conn.query_row(
                &format!(
                    "UPDATE videos SET path = ?1, title = ?2, size = ?3, state = ?4, bitrate = ?5, \
                     width = ?6, height = ?7, duration = ?8, frame_rate = ?9, video_codecs = ?10, \
                     audio_codecs = ?11, hdr = ?12, chosen_quality_result_id = ?13, \
                     version = version + 1, updated_at = ?14 \
                     WHERE id = ?15 AND version = ?16 RETURNING {}",
                    VIDEO_COLUMNS
                ),
                params![
                    next.path.to_string_lossy(),
                    next.title,
                    next.size.map(|s| s as i64),
                    next.state.as_str(),
                    next.bitrate.map(|b| b as i64),
                    next.width,
                    next.height,
                    next.duration,
                    next.frame_rate,
                    video_codecs,
                    audio_codecs,
                    next.hdr,
                    next.chosen_quality_result_id,
                    now,
                    next.id,
                    expected_version,
                ],
                video_from_row,
            )
            .optional()
        })
    }

    /// CRF chosen for the most recently searched sibling in the same content group.
    pub fn sibling_chosen_crf(&self, video: &Video) -> StoreResult<Option<f64>> {
        let Some(group) = video.content_group.as_deref() else {
            return Ok(None);
        };
        self.read(|conn| {
            conn.query_row(
                "SELECT qr.crf FROM quality_results qr \
                 JOIN videos v ON v.id = qr.video_id \
                 WHERE v.content_group = ?1 AND v.id != ?2 AND qr.chosen = 1 \
                 ORDER BY qr.updated_at DESC, qr.id DESC LIMIT 1",
                params![group, video.id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// `analyzed` videos, biggest and highest-bitrate first, oldest-touched as tiebreak.
    pub fn analyzed_for_search(&self, limit: usize) -> StoreResult<Vec<Video>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM videos WHERE state = ?1 \
                 ORDER BY bitrate DESC, size DESC, updated_at ASC, id ASC LIMIT ?2",
                VIDEO_COLUMNS
            ))?;
            let rows = stmt.query_map(
                params![VideoState::Analyzed.as_str(), limit as i64],
                video_from_row,
            )?;
            rows.collect()
        })
    }

    /// Every `crf_searched` video paired with its chosen result.
    pub fn encode_candidates(&self) -> StoreResult<Vec<(Video, QualityResult)>> {
        let (videos, results) = self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM videos WHERE state = ?1 AND chosen_quality_result_id IS NOT NULL \
                 ORDER BY id",
                VIDEO_COLUMNS
            ))?;
            let videos = stmt
                .query_map(params![VideoState::CrfSearched.as_str()], video_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM quality_results WHERE chosen = 1 AND video_id IN \
                 (SELECT id FROM videos WHERE state = ?1)",
                RESULT_COLUMNS
            ))?;
            let results = stmt
                .query_map(params![VideoState::CrfSearched.as_str()], result_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((videos, results))
        })?;

        let mut by_id: HashMap<i64, QualityResult> =
            results.into_iter().map(|r| (r.id, r)).collect();
        Ok(videos
            .into_iter()
            .filter_map(|video| {
                let chosen = video.chosen_quality_result_id?;
                let result = by_id.remove(&chosen)?;
                (result.video_id == video.id).then_some((video, result))
            })
            .collect())
    }

    // ---- quality results ----

    /// Insert or replace the sample for `(video_id, crf)`.
    ///
    /// The `chosen` flag of an existing row is kept; predicted size/time
    /// are only overwritten when the new sample carries them.
    pub fn upsert_quality_result(
        &self,
        video_id: i64,
        sample: &QualitySample,
    ) -> StoreResult<QualityResult> {
        let now = current_timestamp_ms();
        let params_json = encode_list(&sample.params);
        self.write(|conn| {
            conn.query_row(
                &format!(
                    "INSERT INTO quality_results (video_id, crf, score, percent, predicted_size, \
                     predicted_time, chosen, target, params, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9) \
                     ON CONFLICT(video_id, crf) DO UPDATE SET \
                        score = excluded.score, \
                        percent = excluded.percent, \
                        predicted_size = COALESCE(excluded.predicted_size, predicted_size), \
                        predicted_time = COALESCE(excluded.predicted_time, predicted_time), \
                        target = excluded.target, \
                        params = excluded.params, \
                        updated_at = excluded.updated_at \
                     RETURNING {}",
                    RESULT_COLUMNS
                ),
                params![
                    video_id,
                    sample.crf,
                    sample.score,
                    sample.percent,
                    sample.predicted_size.map(|s| s as i64),
                    sample.predicted_time,
                    sample.target,
                    params_json,
                    now,
                ],
                result_from_row,
            )
        })
    }

    pub fn quality_results_for(&self, video_id: i64) -> StoreResult<Vec<QualityResult>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM quality_results WHERE video_id = ?1 ORDER BY crf",
                RESULT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![video_id], result_from_row)?;
            rows.collect()
        })
    }

    pub fn get_quality_result(&self, id: i64) -> StoreResult<Option<QualityResult>> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM quality_results WHERE id = ?1", RESULT_COLUMNS),
                params![id],
                result_from_row,
            )
            .optional()
        })
    }

    pub fn find_quality_result(&self, video_id: i64, crf: f64) -> StoreResult<Option<QualityResult>> {
        self.read(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM quality_results WHERE video_id = ?1 AND ABS(crf - ?2) < ?3",
                    RESULT_COLUMNS
                ),
                params![video_id, crf, CRF_EPSILON],
                result_from_row,
            )
            .optional()
        })
    }

    /// Mark `result_id` chosen, clear every other chosen flag for the video and
    /// point the video at it, all in one transaction guarded by `expected_version`.
    pub fn choose_quality_result(
        &self,
        video: &Video,
        result_id: i64,
    ) -> StoreResult<Option<(Video, QualityResult)>> {
        let now = current_timestamp_ms();
        self.write(|conn| {
            let updated = conn
                .query_row(
                    &format!(
                        "UPDATE videos SET chosen_quality_result_id = ?1, version = version + 1, \
                         updated_at = ?2 WHERE id = ?3 AND version = ?4 RETURNING {}",
                        VIDEO_COLUMNS
                    ),
                    params![result_id, now, video.id, video.version],
                    video_from_row,
                )
                .optional()?;
            let Some(updated) = updated else {
                return Ok(None);
            };
            conn.execute(
                "UPDATE quality_results SET chosen = 0 WHERE video_id = ?1 AND id != ?2",
                params![video.id, result_id],
            )?;
            let result = conn.query_row(
                &format!(
                    "UPDATE quality_results SET chosen = 1, updated_at = ?1 \
                     WHERE id = ?2 AND video_id = ?3 RETURNING {}",
                    RESULT_COLUMNS
                ),
                params![now, result_id, video.id],
                result_from_row,
            )?;
            Ok(Some((updated, result)))
        })
    }

    /// Drop every quality result for the video; returns how many went.
    ///
    /// Clearing a chosen pointer bumps the video's `version`, so snapshots
    /// taken before the delete go stale.
    pub fn delete_quality_results(&self, video_id: i64) -> StoreResult<usize> {
        let now = current_timestamp_ms();
        self.write(|conn| {
            conn.execute(
                "UPDATE videos SET chosen_quality_result_id = NULL, version = version + 1, \
                 updated_at = ?2 WHERE id = ?1 AND chosen_quality_result_id IS NOT NULL",
                params![video_id, now],
            )?;
            conn.execute(
                "DELETE FROM quality_results WHERE video_id = ?1",
                params![video_id],
            )
        })
    }

    // ---- failures ----

    pub fn insert_failure(&self, failure: &NewFailure) -> StoreResult<FailureRecord> {
        let now = current_timestamp_ms();
        let context = serde_json::to_string(&failure.context).unwrap_or_else(|_| "{}".to_string());
        self.write(|conn| {
            conn.query_row(
                &format!(
                    "INSERT INTO failures (video_id, stage, category, code, message, context, \
                     retry_count, resolved, host, os_version, daemon_version, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?11) RETURNING {}",
                    FAILURE_COLUMNS
                ),
                params![
                    failure.video_id,
                    failure.category.stage().as_str(),
                    failure.category.category_str(),
                    failure.code,
                    failure.message,
                    context,
                    failure.retry_count,
                    failure.environment.host,
                    failure.environment.os_version,
                    failure.environment.daemon_version,
                    now,
                ],
                failure_from_row,
            )
        })
    }

    pub fn resolve_failure(&self, id: i64) -> StoreResult<bool> {
        let now = current_timestamp_ms();
        let changed = self.write(|conn| {
            conn.execute(
                "UPDATE failures SET resolved = 1, resolved_at = ?1 WHERE id = ?2 AND resolved = 0",
                params![now, id],
            )
        })?;
        Ok(changed > 0)
    }

    pub fn resolve_failures(&self, video_id: i64, stage: FailureStage) -> StoreResult<usize> {
        let now = current_timestamp_ms();
        self.write(|conn| {
            conn.execute(
                "UPDATE failures SET resolved = 1, resolved_at = ?1 \
                 WHERE video_id = ?2 AND stage = ?3 AND resolved = 0",
                params![now, video_id, stage.as_str()],
            )
        })
    }

    pub fn unresolved_failure_count(&self, video_id: i64, stage: FailureStage) -> StoreResult<u32> {
        self.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM failures WHERE video_id = ?1 AND stage = ?2 AND resolved = 0",
                params![video_id, stage.as_str()],
                |row| row.get(0),
            )
        })
    }

    pub fn failures_for_video(&self, video_id: i64) -> StoreResult<Vec<FailureRecord>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM failures WHERE video_id = ?1 ORDER BY id",
                FAILURE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![video_id], failure_from_row)?;
            rows.collect()
        })
    }

    /// Unresolved failure counts per (stage, category).
    pub fn unresolved_failure_summary(&self) -> StoreResult<Vec<(FailureCategory, u64)>> {
        let rows: Vec<(String, String, i64)> = self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT stage, category, COUNT(*) FROM failures WHERE resolved = 0 \
                 GROUP BY stage, category ORDER BY stage, category",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect()
        })?;
        Ok(rows
            .into_iter()
            .filter_map(|(stage, category, count)| {
                let stage = stage.parse::<FailureStage>().ok()?;
                let category = FailureCategory::from_parts(stage, &category)?;
                Some((category, count as u64))
            })
            .collect())
    }
}

fn encode_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn decode_list(row: &Row<'_>, index: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|e| invalid_column(index, e.to_string()))
}

fn video_from_row(row: &Row<'_>) -> rusqlite::Result<Video> {
    let state: String = row.get(4)?;
    let source: String = row.get(13)?;
    Ok(Video {
        id: row.get(0)?,
        path: PathBuf::from(row.get::<_, String>(1)?),
        title: row.get(2)?,
        size: row.get::<_, Option<i64>>(3)?.map(|s| s as u64),
        state: state.parse().map_err(|e: String| invalid_column(4, e))?,
        bitrate: row.get::<_, Option<i64>>(5)?.map(|b| b as u64),
        width: row.get(6)?,
        height: row.get(7)?,
        duration: row.get(8)?,
        frame_rate: row.get(9)?,
        video_codecs: decode_list(row, 10)?,
        audio_codecs: decode_list(row, 11)?,
        hdr: row.get(12)?,
        content_source: source.parse().map_err(|e: String| invalid_column(13, e))?,
        library_id: row.get(14)?,
        content_group: row.get(15)?,
        chosen_quality_result_id: row.get(16)?,
        version: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<QualityResult> {
    Ok(QualityResult {
        id: row.get(0)?,
        video_id: row.get(1)?,
        crf: row.get(2)?,
        score: row.get(3)?,
        percent: row.get(4)?,
        predicted_size: row.get::<_, Option<i64>>(5)?.map(|s| s as u64),
        predicted_time: row.get(6)?,
        chosen: row.get(7)?,
        target: row.get(8)?,
        params: decode_list(row, 9)?,
    })
}

fn failure_from_row(row: &Row<'_>) -> rusqlite::Result<FailureRecord> {
    let stage: String = row.get(2)?;
    let stage: FailureStage = stage.parse().map_err(|e: String| invalid_column(2, e))?;
    let category: String = row.get(3)?;
    let category = FailureCategory::from_parts(stage, &category)
        .ok_or_else(|| invalid_column(3, format!("unknown category {} for {}", category, stage)))?;
    let context: String = row.get(6)?;
    Ok(FailureRecord {
        id: row.get(0)?,
        video_id: row.get(1)?,
        category,
        code: row.get(4)?,
        message: row.get(5)?,
        context: serde_json::from_str(&context).map_err(|e| invalid_column(6, e.to_string()))?,
        retry_count: row.get(7)?,
        resolved: row.get(8)?,
        resolved_at: row.get(9)?,
        environment: Environment {
            host: row.get(10)?,
            os_version: row.get(11)?,
            daemon_version: row.get(12)?,
        },
        created_at: row.get(13)?,
    })
}
