//! Startup checks
//!
//! Preflight checks run before the daemon starts:
//! - Software-only encoding assertion (no hardware encoders in the rules)
//! - Quality-search and encode binaries answer `--version`
//! - Database opens and the schema is applied

use crate::config::Config;
use crate::store::{Store, StoreError};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Encoder names that indicate hardware acceleration
const FORBIDDEN_HW_FLAGS: &[&str] = &["nvenc", "qsv", "vaapi", "cuda", "amf", "vce"];

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{binary} not available: {reason}")]
    BinaryUnavailable { binary: String, reason: String },

    #[error("Hardware encoding detected: {0}")]
    HardwareEncodingDetected(String),

    #[error("database unavailable: {0}")]
    Database(#[from] StoreError),
}

/// Check if a string contains any forbidden hardware encoder flags
///
/// Returns the first detected forbidden flag, or None if clean.
pub fn detect_hardware_flag(s: &str) -> Option<&'static str> {
    let lower = s.to_lowercase();
    FORBIDDEN_HW_FLAGS
        .iter()
        .find(|&&flag| lower.contains(flag))
        .copied()
}

/// Check a list of arguments for forbidden hardware flags
pub fn check_args_for_hardware_flags<S: AsRef<str>>(args: &[S]) -> Result<(), StartupError> {
    for arg in args {
        let arg = arg.as_ref();
        if let Some(flag) = detect_hardware_flag(arg) {
            return Err(StartupError::HardwareEncodingDetected(format!(
                "hardware encoder flag '{}' found in '{}'",
                flag, arg
            )));
        }
    }
    Ok(())
}

/// The configured encoder and extra arguments must be software encoders.
pub fn assert_software_only(cfg: &Config) -> Result<(), StartupError> {
    check_args_for_hardware_flags(&[cfg.rules.encoder.as_str()])?;
    check_args_for_hardware_flags(&cfg.rules.extra_args)
}

/// First `major.minor[.patch]` token in `--version` output
pub fn parse_tool_version(output: &str) -> Option<(u32, u32, u32)> {
    output.split_whitespace().find_map(|token| {
        let token = token.trim_start_matches('v');
        let mut parts = token.split(|c| c == '.' || c == '-');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some((major, minor, patch))
    })
}

/// Run `<binary> --version` and return the first line it prints
pub fn check_binary_available(binary: &Path) -> Result<String, StartupError> {
    let unavailable = |reason: String| StartupError::BinaryUnavailable {
        binary: binary.display().to_string(),
        reason,
    };

    let output = Command::new(binary)
        .arg("--version")
        .output()
        .map_err(|e| unavailable(format!("--version failed; is it installed and in PATH? {}", e)))?;

    if !output.status.success() {
        return Err(unavailable(format!(
            "--version exited with {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = stdout.lines().next().unwrap_or("").trim().to_string();
    match parse_tool_version(&version) {
        Some((major, minor, patch)) => {
            info!(binary = %binary.display(), major, minor, patch, "binary available")
        }
        None => info!(binary = %binary.display(), version = %version, "binary available"),
    }
    Ok(version)
}

/// Open the database, creating it and its schema when missing
pub fn open_database(cfg: &Config) -> Result<Store, StartupError> {
    let store = Store::open(&cfg.database.path)?;
    info!(path = %cfg.database.path.display(), "database ready");
    Ok(store)
}

/// Run all startup checks in order
///
/// 1. Software-only assertion
/// 2. Quality-search binary
/// 3. Encode binary
/// 4. Database
pub fn run_startup_checks(cfg: &Config) -> Result<Store, StartupError> {
    assert_software_only(cfg)?;
    check_binary_available(&cfg.crf_search.binary)?;
    if cfg.encode.binary != cfg.crf_search.binary {
        check_binary_available(&cfg.encode.binary)?;
    }
    open_database(cfg)
}
