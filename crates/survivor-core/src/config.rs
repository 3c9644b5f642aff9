// Engine configuration (config/survivor.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::picks::{PickPolicy, UniquenessPolicy};

/// Location of the configuration file relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/survivor.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

// ---------------------------------------------------------------------------
// survivor.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub backend: BackendConfig,
    pub picks: PicksConfig,
    pub refresh: RefreshConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub membership_ttl_secs: u64,
    pub roster_ttl_secs: u64,
    pub picks_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            membership_ttl_secs: 300,
            roster_ttl_secs: 300,
            picks_ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn membership_ttl(&self) -> Duration {
        Duration::from_secs(self.membership_ttl_secs)
    }

    pub fn roster_ttl(&self) -> Duration {
        Duration::from_secs(self.roster_ttl_secs)
    }

    pub fn picks_ttl(&self) -> Duration {
        Duration::from_secs(self.picks_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Upper bound on a single persistence call.
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig { timeout_ms: 10_000 }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PicksConfig {
    /// Which picks count towards "same driver twice in a season".
    pub uniqueness: UniquenessPolicy,
    /// When false, saving without an active league records a solo pick
    /// instead of failing.
    pub require_league: bool,
}

impl Default for PicksConfig {
    fn default() -> Self {
        PicksConfig {
            uniqueness: UniquenessPolicy::default(),
            require_league: true,
        }
    }
}

impl From<&PicksConfig> for PickPolicy {
    fn from(config: &PicksConfig) -> Self {
        PickPolicy {
            uniqueness: config.uniqueness,
            require_league: config.require_league,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig { interval_secs: 60 }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load and validate the configuration at `path`.
pub fn load_config_from(path: &Path) -> Result<EngineConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })?;
    let config: EngineConfig = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })?;
    validate(&config)?;
    Ok(config)
}

/// Like `load_config_from`, but a missing file yields the defaults.
pub fn load_or_default(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    load_config_from(path)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    let positive_fields: &[(&str, u64)] = &[
        ("cache.membership_ttl_secs", config.cache.membership_ttl_secs),
        ("cache.roster_ttl_secs", config.cache.roster_ttl_secs),
        ("cache.picks_ttl_secs", config.cache.picks_ttl_secs),
        ("backend.timeout_ms", config.backend.timeout_ms),
        ("refresh.interval_secs", config.refresh.interval_secs),
    ];
    for (name, val) in positive_fields {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_config(name: &str, body: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("survivor.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("survivor_config_absent/survivor.toml");
        let config = load_or_default(&path).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.cache.membership_ttl(), Duration::from_secs(300));
        assert_eq!(config.backend.timeout(), Duration::from_secs(10));
        assert_eq!(config.picks.uniqueness, UniquenessPolicy::PerLeague);
        assert!(config.picks.require_league);
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let path = write_config(
            "survivor_config_partial",
            r#"
[cache]
roster_ttl_secs = 30

[picks]
uniqueness = "all_leagues"
"#,
        );
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.cache.roster_ttl_secs, 30);
        assert_eq!(config.cache.membership_ttl_secs, 300);
        assert_eq!(config.picks.uniqueness, UniquenessPolicy::AllLeagues);
        assert_eq!(config.refresh.interval_secs, 60);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn rejects_zero_timeout() {
        let path = write_config("survivor_config_zero_timeout", "[backend]\ntimeout_ms = 0\n");
        match load_config_from(&path).unwrap_err() {
            ConfigError::ValidationError { field, .. } => assert_eq!(field, "backend.timeout_ms"),
            other => panic!("expected ValidationError, got: {other}"),
        }
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn parse_error_for_invalid_toml() {
        let path = write_config("survivor_config_invalid", "this is not valid [[[ toml");
        match load_config_from(&path).unwrap_err() {
            ConfigError::ParseError { path: p, .. } => assert!(p.ends_with("survivor.toml")),
            other => panic!("expected ParseError, got: {other}"),
        }
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn file_not_found_for_explicit_load() {
        let path = std::env::temp_dir().join("survivor_config_nowhere/survivor.toml");
        assert!(matches!(
            load_config_from(&path),
            Err(ConfigError::FileNotFound { .. })
        ));
    }
}
