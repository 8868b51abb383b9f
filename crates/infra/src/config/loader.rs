//! Configuration loader
//!
//! ## Loading Strategy
//! 1. Probe the standard locations for a config file
//! 2. Fall back to [`GuardConfig::default`] when none exists
//! 3. Apply `GENGUARD_*` environment overrides
//! 4. Validate
//!
//! ## Environment Variables
//! - `GENGUARD_RETENTION_MS`: How long completed outcomes are replayed
//! - `GENGUARD_FAILURE_RETENTION_MS`: How long failed outcomes are replayed
//! - `GENGUARD_LEASE_TIMEOUT_MS`: In-flight lease duration
//! - `GENGUARD_BREAKER_FAILURE_THRESHOLD`: Failures in the window that open the breaker
//! - `GENGUARD_BREAKER_COOLDOWN_MS`: Time spent open before probing
//! - `GENGUARD_RETRY_MAX_ATTEMPTS`: Attempts per call, first one included
//! - `GENGUARD_STORAGE_BACKEND`: `memory` or `sqlite`
//! - `GENGUARD_DB_PATH`: SQLite database file
//! - `GENGUARD_LOG_LEVEL`: Filter used when `RUST_LOG` is unset
//! - `GENGUARD_LOG_JSON`: Emit JSON log lines (true/false)
//!
//! ## File Locations
//! `genguard.toml`, `genguard.json`, `config.toml` and `config.json` are
//! probed (in that order) in the working directory, its parent and
//! grandparent, then next to the executable.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use genguard_domain::{GuardConfig, StorageBackend};
use tracing::{debug, info};

use crate::errors::{InfraError, InfraResult};

const CONFIG_FILE_NAMES: [&str; 4] =
    ["genguard.toml", "genguard.json", "config.toml", "config.json"];

/// Load configuration from the first file found (or defaults), then apply
/// environment overrides
///
/// # Errors
/// Returns `InfraError::Config` if a file cannot be parsed, an override
/// cannot be parsed or the final configuration is invalid.
pub fn load() -> InfraResult<GuardConfig> {
    let base = match probe_config_paths() {
        Some(path) => load_from_file(Some(path))?,
        None => {
            debug!("No config file found, using defaults");
            GuardConfig::default()
        }
    };

    load_from_env(base)
}

/// Apply `GENGUARD_*` environment overrides to `base`
///
/// Unset variables leave the corresponding field untouched.
///
/// # Errors
/// Returns `InfraError::Config` if a variable holds an unparsable value or
/// the resulting configuration is invalid.
pub fn load_from_env(base: GuardConfig) -> InfraResult<GuardConfig> {
    let config = apply_overrides(base, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, probes the standard locations. Format is detected
/// by extension (`.toml` or `.json`); missing keys take their defaults.
///
/// # Errors
/// Returns `InfraError::Config` if:
/// - File not found (when path is specified)
/// - No config file found (when path is `None`)
/// - File format is invalid
/// - The parsed configuration fails validation
pub fn load_from_file(path: Option<PathBuf>) -> InfraResult<GuardConfig> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(InfraError::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            InfraError::Config("No config file found in any of the standard locations".to_string())
        })?,
    };

    info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| InfraError::Config(format!("Failed to read config file: {e}")))?;

    let config = parse_config(&contents, &config_path)?;
    config.validate()?;
    Ok(config)
}

/// Probe the standard locations for a configuration file
///
/// # Returns
/// The first config file found, or `None` if no file exists.
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        dirs.extend(cwd.ancestors().take(3).map(Path::to_path_buf));
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            dirs.push(exe_dir.to_path_buf());
        }
    }

    first_config_in(&dirs)
}

/// First known config file name found in `dirs`, searched in order
fn first_config_in(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| CONFIG_FILE_NAMES.iter().map(move |name| dir.join(name)))
        .find(|path| path.is_file())
}

fn parse_config(contents: &str, path: &Path) -> InfraResult<GuardConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| InfraError::Config(format!("Invalid TOML format: {e}"))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| InfraError::Config(format!("Invalid JSON format: {e}"))),
        _ => Err(InfraError::Config(format!("Unsupported config format: {extension}"))),
    }
}

/// Apply overrides read through `lookup` (the process environment in
/// production, a map in tests)
fn apply_overrides<F>(mut config: GuardConfig, lookup: F) -> InfraResult<GuardConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let millis = |key: &str| -> InfraResult<Option<Duration>> {
        lookup(key)
            .map(|value| parse_var::<u64>(key, &value).map(Duration::from_millis))
            .transpose()
    };

    if let Some(retention) = millis("GENGUARD_RETENTION_MS")? {
        config.idempotency.retention = retention;
    }
    if let Some(retention) = millis("GENGUARD_FAILURE_RETENTION_MS")? {
        config.idempotency.failure_retention = retention;
    }
    if let Some(timeout) = millis("GENGUARD_LEASE_TIMEOUT_MS")? {
        config.idempotency.lease_timeout = timeout;
    }
    if let Some(value) = lookup("GENGUARD_BREAKER_FAILURE_THRESHOLD") {
        config.breaker.failure_threshold =
            parse_var("GENGUARD_BREAKER_FAILURE_THRESHOLD", &value)?;
    }
    if let Some(cooldown) = millis("GENGUARD_BREAKER_COOLDOWN_MS")? {
        config.breaker.cooldown = cooldown;
    }
    if let Some(value) = lookup("GENGUARD_RETRY_MAX_ATTEMPTS") {
        config.retry.max_attempts = parse_var("GENGUARD_RETRY_MAX_ATTEMPTS", &value)?;
    }
    if let Some(value) = lookup("GENGUARD_STORAGE_BACKEND") {
        config.storage.backend = parse_var::<StorageBackend>("GENGUARD_STORAGE_BACKEND", &value)?;
    }
    if let Some(path) = lookup("GENGUARD_DB_PATH") {
        config.storage.path = path;
    }
    if let Some(level) = lookup("GENGUARD_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(value) = lookup("GENGUARD_LOG_JSON") {
        config.logging.json = parse_bool(&value);
    }

    Ok(config)
}

fn parse_var<T>(key: &str, value: &str) -> InfraResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| InfraError::Config(format!("Invalid value for {key} ({value}): {e}")))
}

/// Accepts: `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
