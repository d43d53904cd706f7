//! Encode command construction
//!
//! Builds the `encode` invocation for a chosen quality result. Encoder
//! tuning flags come from the rules layer; this module only owns the
//! input/output/CRF part of the command line.

use crate::state_machine::StateMachineError;
use crate::store::StoreError;
use crate::subprocess::{ProcessExit, SubprocessError};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoder could not be started
    #[error(transparent)]
    Launch(#[from] SubprocessError),

    /// Encoder exited unsuccessfully
    #[error("encoder failed with {0}")]
    Failed(ProcessExit),

    /// Encoder reported success but left no usable output
    #[error("encoder output invalid: {0}")]
    InvalidOutput(String),

    /// Failed to prepare the output directory
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parameters for one encode
#[derive(Debug, Clone)]
pub struct EncodeParams {
    /// Path to the source video
    pub input_path: PathBuf,
    /// Where the encoder writes its output
    pub output_path: PathBuf,
    /// CRF taken from the chosen quality result
    pub crf: f64,
}

impl EncodeParams {
    /// Output lands in `output_dir` as `<stem>.av1.mkv`, prefixed with the
    /// video id so equally named files from different folders don't collide.
    pub fn new(video_id: i64, input_path: &Path, output_dir: &Path, crf: f64) -> Self {
        let stem = input_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        Self {
            input_path: input_path.to_path_buf(),
            output_path: output_dir.join(format!("{}-{}.av1.mkv", video_id, stem)),
            crf,
        }
    }
}

/// Build the `encode` argument list
///
/// Creates:
/// - `encode --input <path> --output <path> --crf <crf>`
/// - followed by the rules fragments in `extra`
pub fn build_encode_args(params: &EncodeParams, extra: Vec<String>) -> Vec<String> {
    let mut args = vec![
        "encode".to_string(),
        "--input".to_string(),
        params.input_path.to_string_lossy().to_string(),
        "--output".to_string(),
        params.output_path.to_string_lossy().to_string(),
        "--crf".to_string(),
        format_crf(params.crf),
    ];
    args.extend(extra);
    args
}

/// Whole CRFs print without a fraction (`28`, not `28.0`).
fn format_crf(crf: f64) -> String {
    if crf.fract() == 0.0 {
        format!("{}", crf as i64)
    } else {
        format!("{}", crf)
    }
}
