//! Persisted records: videos, quality-search samples and failure records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle state of a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoState {
    NeedsAnalysis,
    Analyzed,
    CrfSearching,
    CrfSearched,
    Encoding,
    Encoded,
    Failed,
}

impl VideoState {
    pub const ALL: [VideoState; 7] = [
        VideoState::NeedsAnalysis,
        VideoState::Analyzed,
        VideoState::CrfSearching,
        VideoState::CrfSearched,
        VideoState::Encoding,
        VideoState::Encoded,
        VideoState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoState::NeedsAnalysis => "needs_analysis",
            VideoState::Analyzed => "analyzed",
            VideoState::CrfSearching => "crf_searching",
            VideoState::CrfSearched => "crf_searched",
            VideoState::Encoding => "encoding",
            VideoState::Encoded => "encoded",
            VideoState::Failed => "failed",
        }
    }
}

impl Default for VideoState {
    fn default() -> Self {
        Self::NeedsAnalysis
    }
}

impl std::fmt::Display for VideoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VideoState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VideoState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown video state: {}", s))
    }
}

/// Catalog service a video was discovered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    Series,
    Movies,
}

impl ContentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentSource::Series => "series",
            ContentSource::Movies => "movies",
        }
    }

    pub fn other(&self) -> ContentSource {
        match self {
            ContentSource::Series => ContentSource::Movies,
            ContentSource::Movies => ContentSource::Series,
        }
    }
}

impl std::fmt::Display for ContentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "series" => Ok(ContentSource::Series),
            "movies" => Ok(ContentSource::Movies),
            other => Err(format!("unknown content source: {}", other)),
        }
    }
}

impl From<crate::config::MajoritySource> for ContentSource {
    fn from(source: crate::config::MajoritySource) -> Self {
        match source {
            crate::config::MajoritySource::Series => ContentSource::Series,
            crate::config::MajoritySource::Movies => ContentSource::Movies,
        }
    }
}

/// A video file tracked through the re-encode pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: i64,
    pub path: PathBuf,
    pub title: Option<String>,
    pub size: Option<u64>,
    pub state: VideoState,
    /// Bits per second.
    pub bitrate: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Seconds.
    pub duration: Option<f64>,
    pub frame_rate: Option<f64>,
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
    pub hdr: Option<String>,
    pub content_source: ContentSource,
    pub library_id: i64,
    /// Videos sharing a group (e.g. episodes of one series) seed each other's CRF range.
    pub content_group: Option<String>,
    pub chosen_quality_result_id: Option<i64>,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Video {
    pub fn has_hdr(&self) -> bool {
        self.hdr.as_deref().map_or(false, |hdr| !hdr.trim().is_empty())
    }
}

/// Fields supplied by the external producer when a video row is created.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewVideo {
    pub path: PathBuf,
    pub size: Option<u64>,
    pub content_source: Option<ContentSource>,
    pub library_id: i64,
    pub content_group: Option<String>,
}

/// Flat metadata record produced by the MediaInfo layer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub duration: Option<f64>,
    pub bitrate: u64,
    pub frame_rate: Option<f64>,
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
    pub hdr: Option<String>,
    pub size: Option<u64>,
    pub title: Option<String>,
}

/// Column updates applied atomically with a state transition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VideoAttrs {
    pub path: Option<PathBuf>,
    pub title: Option<String>,
    pub size: Option<u64>,
    pub bitrate: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<f64>,
    pub frame_rate: Option<f64>,
    pub video_codecs: Option<Vec<String>>,
    pub audio_codecs: Option<Vec<String>>,
    pub hdr: Option<Option<String>>,
    pub chosen_quality_result_id: Option<Option<i64>>,
}

impl VideoAttrs {
    pub fn is_empty(&self) -> bool {
        *self == VideoAttrs::default()
    }

    /// Copy of `video` with these attrs applied; what validators inspect.
    pub fn merged_into(&self, video: &Video) -> Video {
        let mut merged = video.clone();
        if let Some(path) = &self.path {
            merged.path = path.clone();
        }
        if let Some(title) = &self.title {
            merged.title = Some(title.clone());
        }
        if let Some(size) = self.size {
            merged.size = Some(size);
        }
        if let Some(bitrate) = self.bitrate {
            merged.bitrate = Some(bitrate);
        }
        if let Some(width) = self.width {
            merged.width = Some(width);
        }
        if let Some(height) = self.height {
            merged.height = Some(height);
        }
        if let Some(duration) = self.duration {
            merged.duration = Some(duration);
        }
        if let Some(frame_rate) = self.frame_rate {
            merged.frame_rate = Some(frame_rate);
        }
        if let Some(codecs) = &self.video_codecs {
            merged.video_codecs = codecs.clone();
        }
        if let Some(codecs) = &self.audio_codecs {
            merged.audio_codecs = codecs.clone();
        }
        if let Some(hdr) = &self.hdr {
            merged.hdr = hdr.clone();
        }
        if let Some(chosen) = self.chosen_quality_result_id {
            merged.chosen_quality_result_id = chosen;
        }
        merged
    }
}

impl From<&VideoMetadata> for VideoAttrs {
    fn from(meta: &VideoMetadata) -> Self {
        VideoAttrs {
            title: meta.title.clone(),
            size: meta.size,
            bitrate: Some(meta.bitrate),
            width: Some(meta.width),
            height: Some(meta.height),
            duration: meta.duration,
            frame_rate: meta.frame_rate,
            video_codecs: Some(meta.video_codecs.clone()),
            audio_codecs: Some(meta.audio_codecs.clone()),
            hdr: Some(meta.hdr.clone()),
            ..VideoAttrs::default()
        }
    }
}

/// One quality-search sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityResult {
    pub id: i64,
    pub video_id: i64,
    pub crf: f64,
    pub score: f64,
    /// Predicted output size as a percentage of the input.
    pub percent: f64,
    /// Bytes.
    pub predicted_size: Option<u64>,
    /// Seconds.
    pub predicted_time: Option<f64>,
    pub chosen: bool,
    pub target: u32,
    pub params: Vec<String>,
}

/// Sample data written by the searcher; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct QualitySample {
    pub crf: f64,
    pub score: f64,
    pub percent: f64,
    pub predicted_size: Option<u64>,
    pub predicted_time: Option<f64>,
    pub target: u32,
    pub params: Vec<String>,
}

/// Pipeline stage a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Analysis,
    QualitySearch,
    Encode,
    PostProcess,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Analysis => "analysis",
            FailureStage::QualitySearch => "quality_search",
            FailureStage::Encode => "encode",
            FailureStage::PostProcess => "post_process",
        }
    }
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(FailureStage::Analysis),
            "quality_search" => Ok(FailureStage::QualitySearch),
            "encode" => Ok(FailureStage::Encode),
            "post_process" => Ok(FailureStage::PostProcess),
            other => Err(format!("unknown failure stage: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisFailure {
    FileAccess,
    MediainfoParsing,
    ValidationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualitySearchFailure {
    VmafCalculation,
    CrfOptimization,
    SizeLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeFailure {
    ProcessFailure,
    ResourceExhaustion,
    CodecIssues,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcessFailure {
    FileOperations,
    SyncIntegration,
}

/// Closed set of (stage, category) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "stage", content = "category", rename_all = "snake_case")]
pub enum FailureCategory {
    Analysis(AnalysisFailure),
    QualitySearch(QualitySearchFailure),
    Encode(EncodeFailure),
    PostProcess(PostProcessFailure),
}

impl FailureCategory {
    pub fn stage(&self) -> FailureStage {
        match self {
            FailureCategory::Analysis(_) => FailureStage::Analysis,
            FailureCategory::QualitySearch(_) => FailureStage::QualitySearch,
            FailureCategory::Encode(_) => FailureStage::Encode,
            FailureCategory::PostProcess(_) => FailureStage::PostProcess,
        }
    }

    pub fn category_str(&self) -> &'static str {
        match self {
            FailureCategory::Analysis(AnalysisFailure::FileAccess) => "file_access",
            FailureCategory::Analysis(AnalysisFailure::MediainfoParsing) => "mediainfo_parsing",
            FailureCategory::Analysis(AnalysisFailure::ValidationFailed) => "validation_failed",
            FailureCategory::QualitySearch(QualitySearchFailure::VmafCalculation) => {
                "vmaf_calculation"
            }
            FailureCategory::QualitySearch(QualitySearchFailure::CrfOptimization) => {
                "crf_optimization"
            }
            FailureCategory::QualitySearch(QualitySearchFailure::SizeLimits) => "size_limits",
            FailureCategory::Encode(EncodeFailure::ProcessFailure) => "process_failure",
            FailureCategory::Encode(EncodeFailure::ResourceExhaustion) => "resource_exhaustion",
            FailureCategory::Encode(EncodeFailure::CodecIssues) => "codec_issues",
            FailureCategory::PostProcess(PostProcessFailure::FileOperations) => "file_operations",
            FailureCategory::PostProcess(PostProcessFailure::SyncIntegration) => {
                "sync_integration"
            }
        }
    }

    /// Inverse of `(stage(), category_str())`, used when reading rows back.
    pub fn from_parts(stage: FailureStage, category: &str) -> Option<Self> {
        let parsed = match (stage, category) {
            (FailureStage::Analysis, "file_access") => {
                FailureCategory::Analysis(AnalysisFailure::FileAccess)
            }
            (FailureStage::Analysis, "mediainfo_parsing") => {
                FailureCategory::Analysis(AnalysisFailure::MediainfoParsing)
            }
            (FailureStage::Analysis, "validation_failed") => {
                FailureCategory::Analysis(AnalysisFailure::ValidationFailed)
            }
            (FailureStage::QualitySearch, "vmaf_calculation") => {
                FailureCategory::QualitySearch(QualitySearchFailure::VmafCalculation)
            }
            (FailureStage::QualitySearch, "crf_optimization") => {
                FailureCategory::QualitySearch(QualitySearchFailure::CrfOptimization)
            }
            (FailureStage::QualitySearch, "size_limits") => {
                FailureCategory::QualitySearch(QualitySearchFailure::SizeLimits)
            }
            (FailureStage::Encode, "process_failure") => {
                FailureCategory::Encode(EncodeFailure::ProcessFailure)
            }
            (FailureStage::Encode, "resource_exhaustion") => {
                FailureCategory::Encode(EncodeFailure::ResourceExhaustion)
            }
            (FailureStage::Encode, "codec_issues") => {
                FailureCategory::Encode(EncodeFailure::CodecIssues)
            }
            (FailureStage::PostProcess, "file_operations") => {
                FailureCategory::PostProcess(PostProcessFailure::FileOperations)
            }
            (FailureStage::PostProcess, "sync_integration") => {
                FailureCategory::PostProcess(PostProcessFailure::SyncIntegration)
            }
            _ => return None,
        };
        Some(parsed)
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stage(), self.category_str())
    }
}

/// Host facts attached to every failure record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Environment {
    pub host: String,
    pub os_version: String,
    pub daemon_version: String,
}

/// One entry in the failure ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: i64,
    pub video_id: i64,
    pub category: FailureCategory,
    pub code: String,
    pub message: String,
    pub context: BTreeMap<String, serde_json::Value>,
    pub retry_count: u32,
    pub resolved: bool,
    pub resolved_at: Option<i64>,
    pub environment: Environment,
    pub created_at: i64,
}

impl FailureRecord {
    pub fn stage(&self) -> FailureStage {
        self.category.stage()
    }
}

/// Failure data before the ledger appends it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFailure {
    pub video_id: i64,
    pub category: FailureCategory,
    pub code: String,
    pub message: String,
    pub context: BTreeMap<String, serde_json::Value>,
    pub retry_count: u32,
    pub environment: Environment,
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
