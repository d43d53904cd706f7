//! CRF range selection and the quality-search command line.

use crate::config::CrfSearchConfig;
use std::path::Path;

/// Inclusive CRF bounds handed to the search binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrfRange {
    pub min: u32,
    pub max: u32,
    /// True when seeded from a sibling rather than the standard range.
    pub narrowed: bool,
}

impl CrfRange {
    pub fn standard(config: &CrfSearchConfig) -> Self {
        Self {
            min: config.min_crf,
            max: config.max_crf,
            narrowed: false,
        }
    }

    /// `sibling_crf +/- narrow_delta`, clamped to the standard range.
    pub fn around(sibling_crf: f64, config: &CrfSearchConfig) -> Self {
        let centre = sibling_crf.round().max(0.0) as u32;
        let min = centre.saturating_sub(config.narrow_delta).max(config.min_crf);
        let max = centre
            .saturating_add(config.narrow_delta)
            .min(config.max_crf);
        if min >= max {
            return Self::standard(config);
        }
        Self {
            min,
            max,
            narrowed: (min, max) != (config.min_crf, config.max_crf),
        }
    }

    /// Range for an attempt: standard on retries or without a sibling.
    pub fn select(sibling_crf: Option<f64>, retry: bool, config: &CrfSearchConfig) -> Self {
        match sibling_crf {
            Some(crf) if !retry => Self::around(crf, config),
            _ => Self::standard(config),
        }
    }
}

impl std::fmt::Display for CrfRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}

/// Build the `crf-search` argument list.
///
/// `extra` carries the encoder fragments from the rules layer and is
/// appended after the fixed flags.
pub fn build_crf_search_args(
    input: &Path,
    range: CrfRange,
    target: u32,
    extra: Vec<String>,
) -> Vec<String> {
    let mut args = vec![
        "crf-search".to_string(),
        "--input".to_string(),
        input.to_string_lossy().to_string(),
        "--min-crf".to_string(),
        range.min.to_string(),
        "--max-crf".to_string(),
        range.max.to_string(),
        "--min-vmaf".to_string(),
        target.to_string(),
    ];
    args.extend(extra);
    args
}
