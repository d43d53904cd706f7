//! CRF search daemon
//!
//! Background service that drives videos through quality search and AV1
//! encoding, with persisted state, a failure ledger and an admin API.

pub mod admin_server;
pub mod crf_search;
pub mod daemon;
pub mod encode;
pub mod failures;
pub mod models;
pub mod pool;
pub mod rules;
pub mod scheduler;
pub mod startup;
pub mod state_machine;
pub mod status;
pub mod store;
pub mod subprocess;

pub use crf_search_daemon_config as config;
pub use crf_search_daemon_config::Config;
pub use admin_server::{create_admin_router, run_admin_server, AdminState, ServerError};
pub use crf_search::{
    parse_line, SearchError, SearchEvent, SearchRequest, SearcherContext, SearcherHandle,
    SearcherStatus, StartOutcome,
};
pub use daemon::{Daemon, DaemonError, DispatchSummary};
pub use encode::{EncodeContext, EncodeError, EncodeWorker};
pub use failures::FailureLedger;
pub use models::{FailureCategory, FailureRecord, FailureStage, Video, VideoState};
pub use pool::WorkerPlan;
pub use rules::{DefaultRules, Purpose, Rules};
pub use scheduler::{WorkItem, WorkScheduler};
pub use startup::{open_database, run_startup_checks, StartupError};
pub use state_machine::{StateEvent, StateMachine, StateMachineError, TransitionOutcome};
pub use status::{SharedActivity, StatusSnapshot};
pub use store::{Store, StoreError};
pub use subprocess::{SubprocessError, SubprocessRunner};
