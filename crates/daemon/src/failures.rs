//! Failure ledger: append-only, queryable failure history per video.

use crate::models::{Environment, FailureCategory, FailureRecord, FailureStage, NewFailure};
use crate::store::{run_blocking, Store, StoreResult};
use serde_json::Value;
use std::collections::BTreeMap;
use sysinfo::System;
use tracing::warn;

impl Environment {
    /// Facts about the host this daemon runs on.
    pub fn detect() -> Self {
        Self {
            host: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os_version: System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
            daemon_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Context map builder for failure records.
pub fn context<I, K, V>(pairs: I) -> BTreeMap<String, Value>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct FailureLedger {
    store: Store,
    environment: Environment,
}

impl FailureLedger {
    pub fn new(store: Store) -> Self {
        Self::with_environment(store, Environment::detect())
    }

    pub fn with_environment(store: Store, environment: Environment) -> Self {
        Self { store, environment }
    }

    /// Run `f` against a clone of this ledger on the blocking pool.
    pub async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&FailureLedger) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = self.clone();
        run_blocking(move || f(&ledger)).await
    }

    /// Append a failure. `retry_count` is the number of unresolved failures
    /// already recorded for the same video and stage.
    pub fn record(
        &self,
        video_id: i64,
        category: FailureCategory,
        code: &str,
        message: impl Into<String>,
        context: BTreeMap<String, Value>,
    ) -> StoreResult<FailureRecord> {
        let retry_count = self.unresolved_count(video_id, category.stage())?;
        let message = message.into();
        warn!(
            video_id,
            category = %category,
            code,
            retry_count,
            "{}",
            message
        );
        self.store.insert_failure(&NewFailure {
            video_id,
            category,
            code: code.to_string(),
            message,
            context,
            retry_count,
            environment: self.environment.clone(),
        })
    }

    pub fn resolve(&self, record: &FailureRecord) -> StoreResult<bool> {
        self.store.resolve_failure(record.id)
    }

    /// Resolve everything outstanding for `stage`; called once the video succeeds there.
    pub fn resolve_stage(&self, video_id: i64, stage: FailureStage) -> StoreResult<usize> {
        self.store.resolve_failures(video_id, stage)
    }

    pub fn unresolved_count(&self, video_id: i64, stage: FailureStage) -> StoreResult<u32> {
        self.store.unresolved_failure_count(video_id, stage)
    }

    pub fn failures_for_video(&self, video_id: i64) -> StoreResult<Vec<FailureRecord>> {
        self.store.failures_for_video(video_id)
    }

    pub fn summary(&self) -> StoreResult<Vec<(FailureCategory, u64)>> {
        self.store.unresolved_failure_summary()
    }
}
