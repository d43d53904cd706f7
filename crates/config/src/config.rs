//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is outside its allowed range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Which content source gets the majority of encoding slots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MajoritySource {
    Series,
    Movies,
}

impl Default for MajoritySource {
    fn default() -> Self {
        Self::Series
    }
}

/// Database location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("crf-search.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Quality search (CRF search) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrfSearchConfig {
    /// External quality-search binary (ab-av1 compatible)
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    /// Lower bound of the standard CRF range
    #[serde(default = "default_min_crf")]
    pub min_crf: u32,
    /// Upper bound of the standard CRF range
    #[serde(default = "default_max_crf")]
    pub max_crf: u32,
    /// Half-width of the range narrowed around a sibling's chosen CRF
    #[serde(default = "default_narrow_delta")]
    pub narrow_delta: u32,
    /// VMAF target used when a request does not carry one
    #[serde(default = "default_target_vmaf")]
    pub default_target_vmaf: u32,
    /// Lowest VMAF target the retry cascade may reduce to
    #[serde(default = "default_vmaf_floor")]
    pub vmaf_floor: u32,
    /// Ceiling on the chosen result's predicted size, in GiB
    #[serde(default = "default_size_ceiling_gib")]
    pub size_ceiling_gib: f64,
    /// Unresolved quality-search failures that trigger the hard stop
    #[serde(default = "default_max_unresolved_failures")]
    pub max_unresolved_failures: u32,
    /// How long a terminated child gets before it is killed outright
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_binary() -> PathBuf {
    PathBuf::from("ab-av1")
}

fn default_min_crf() -> u32 {
    5
}

fn default_max_crf() -> u32 {
    70
}

fn default_narrow_delta() -> u32 {
    5
}

fn default_target_vmaf() -> u32 {
    95
}

fn default_vmaf_floor() -> u32 {
    90
}

fn default_size_ceiling_gib() -> f64 {
    10.0
}

fn default_max_unresolved_failures() -> u32 {
    3
}

fn default_kill_grace_ms() -> u64 {
    5000
}

impl Default for CrfSearchConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            min_crf: default_min_crf(),
            max_crf: default_max_crf(),
            narrow_delta: default_narrow_delta(),
            default_target_vmaf: default_target_vmaf(),
            vmaf_floor: default_vmaf_floor(),
            size_ceiling_gib: default_size_ceiling_gib(),
            max_unresolved_failures: default_max_unresolved_failures(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

/// Encode stage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    /// External encoder binary (ab-av1 compatible)
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    /// Directory the encoded outputs are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/tmp/crf-search-daemon")
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            output_dir: default_output_dir(),
        }
    }
}

/// Work scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub majority_source: MajoritySource,
    /// One slot in every `fairness_ratio` goes to the minority source
    #[serde(default = "default_fairness_ratio")]
    pub fairness_ratio: usize,
    /// Dispatcher wake-up interval when no state events arrive
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_fairness_ratio() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    5000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            majority_source: MajoritySource::default(),
            fairness_ratio: default_fairness_ratio(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkersConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// CRF searcher actors (0 = auto-derive)
    #[serde(default)]
    pub crf_searchers: u32,
    /// Concurrent encodes (0 = auto-derive)
    #[serde(default)]
    pub encoders: u32,
}

/// Encoder argument rules
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RulesConfig {
    #[serde(default = "default_encoder")]
    pub encoder: String,
    #[serde(default = "default_preset")]
    pub preset: u32,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
    /// Appended verbatim to every invocation
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_encoder() -> String {
    "svt-av1".to_string()
}

fn default_preset() -> u32 {
    6
}

fn default_pixel_format() -> String {
    "yuv420p10le".to_string()
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            encoder: default_encoder(),
            preset: default_preset(),
            pixel_format: default_pixel_format(),
            extra_args: Vec::new(),
        }
    }
}

/// Admin HTTP API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminConfig {
    #[serde(default = "default_admin_bind")]
    pub bind: String,
}

fn default_admin_bind() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind: default_admin_bind(),
        }
    }
}

/// Log filter used when RUST_LOG is unset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub crf_search: CrfSearchConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the daemon cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let search = &self.crf_search;
        if search.min_crf >= search.max_crf {
            return Err(ConfigError::Invalid(format!(
                "crf_search.min_crf ({}) must be below max_crf ({})",
                search.min_crf, search.max_crf
            )));
        }
        if search.vmaf_floor > search.default_target_vmaf {
            return Err(ConfigError::Invalid(format!(
                "crf_search.vmaf_floor ({}) exceeds default_target_vmaf ({})",
                search.vmaf_floor, search.default_target_vmaf
            )));
        }
        if self.scheduler.fairness_ratio < 2 {
            return Err(ConfigError::Invalid(
                "scheduler.fairness_ratio must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CRF_SEARCH_DB_PATH -> database.path
    /// - CRF_SEARCH_BINARY -> crf_search.binary
    /// - CRF_SEARCH_TARGET_VMAF -> crf_search.default_target_vmaf
    /// - CRF_SEARCH_WORKERS -> workers.crf_searchers
    /// - ENCODE_BINARY -> encode.binary
    /// - ENCODE_WORKERS -> workers.encoders
    /// - CPU_LOGICAL_CORES -> workers.logical_cores
    /// - ADMIN_BIND -> admin.bind
    /// - LOG_LEVEL -> logging.level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CRF_SEARCH_DB_PATH") {
            if !val.is_empty() {
                self.database.path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("CRF_SEARCH_BINARY") {
            if !val.is_empty() {
                self.crf_search.binary = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("CRF_SEARCH_TARGET_VMAF") {
            if let Ok(target) = val.parse::<u32>() {
                self.crf_search.default_target_vmaf = target;
            }
        }

        if let Ok(val) = env::var("CRF_SEARCH_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.workers.crf_searchers = workers;
            }
        }

        if let Ok(val) = env::var("ENCODE_BINARY") {
            if !val.is_empty() {
                self.encode.binary = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("ENCODE_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.workers.encoders = workers;
            }
        }

        if let Ok(val) = env::var("CPU_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.workers.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("ADMIN_BIND") {
            if !val.is_empty() {
                self.admin.bind = val;
            }
        }

        if let Ok(val) = env::var("LOG_LEVEL") {
            if !val.is_empty() {
                self.logging.level = val.to_lowercase();
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
