//! Settings file plus `COSTBAR_*` environment overrides.
//!
//! The settings file is JSON:
//!
//! ```json
//! {
//!   "Aws": { "Profile": "default", "Region": "us-east-1", "Endpoint": null },
//!   "DatabasePath": "costs.db",
//!   "RefreshIntervalMinutes": 60
//! }
//! ```
//!
//! Every key is optional. Environment variables win over the file:
//! `COSTBAR_DATABASE_PATH`, `COSTBAR_PROFILE`, `COSTBAR_REGION`,
//! `COSTBAR_ENDPOINT`, `COSTBAR_REFRESH_INTERVAL_MINUTES`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::source::CostExplorerConfig;

pub const DEFAULT_DATABASE_PATH: &str = "costs.db";
pub const DEFAULT_PROFILE: &str = "default";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_REFRESH_INTERVAL_MINUTES: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Where and how to reach the cost source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub profile: String,
    pub region: String,
    /// Overrides the regional endpoint, e.g. a local signing proxy.
    pub endpoint: Option<String>,
}

impl SourceConfig {
    pub fn cost_explorer(&self) -> CostExplorerConfig {
        let mut config = CostExplorerConfig::for_region(&self.profile, &self.region);
        config.timeout = DEFAULT_REQUEST_TIMEOUT;
        match &self.endpoint {
            Some(endpoint) => config.with_endpoint(endpoint),
            None => config,
        }
    }
}

/// Validated runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_path: PathBuf,
    pub source: SourceConfig,
    pub refresh_interval_minutes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            source: SourceConfig {
                profile: DEFAULT_PROFILE.to_string(),
                region: DEFAULT_REGION.to_string(),
                endpoint: None,
            },
            refresh_interval_minutes: DEFAULT_REFRESH_INTERVAL_MINUTES,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SettingsFile {
    #[serde(default)]
    aws: AwsSection,
    database_path: Option<String>,
    refresh_interval_minutes: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsSection {
    profile: Option<String>,
    region: Option<String>,
    endpoint: Option<String>,
}

impl Config {
    /// Load from `path` (if any) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |name| std::env::var(name).ok())
    }

    /// Load from `path` (if any), reading overrides through `env`.
    pub fn load_with_env<F>(path: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(path) = path {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let file: SettingsFile =
                serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            config.apply_file(file, path.parent())?;
        }

        config.apply_env(&env)?;

        config.validate()?;
        tracing::debug!(
            database = %config.database_path.display(),
            profile = %config.source.profile,
            region = %config.source.region,
            refresh_interval_minutes = config.refresh_interval_minutes,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// A relative `DatabasePath` resolves against `base_dir`, the settings
    /// file's directory.
    fn apply_file(
        &mut self,
        file: SettingsFile,
        base_dir: Option<&Path>,
    ) -> Result<(), ConfigError> {
        if let Some(path) = file.database_path {
            let path = PathBuf::from(path);
            self.database_path = match base_dir {
                Some(base) if path.is_relative() && !base.as_os_str().is_empty() => base.join(path),
                _ => path,
            };
        }
        if let Some(profile) = file.aws.profile {
            self.source.profile = profile;
        }
        if let Some(region) = file.aws.region {
            self.source.region = region;
        }
        if let Some(endpoint) = non_empty(file.aws.endpoint) {
            self.source.endpoint = Some(endpoint);
        }
        if let Some(minutes) = file.refresh_interval_minutes {
            self.refresh_interval_minutes = positive_minutes(minutes)?;
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, env: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = non_empty(env("COSTBAR_DATABASE_PATH")) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(profile) = non_empty(env("COSTBAR_PROFILE")) {
            self.source.profile = profile;
        }
        if let Some(region) = non_empty(env("COSTBAR_REGION")) {
            self.source.region = region;
        }
        if let Some(endpoint) = non_empty(env("COSTBAR_ENDPOINT")) {
            self.source.endpoint = Some(endpoint);
        }
        if let Some(raw) = non_empty(env("COSTBAR_REFRESH_INTERVAL_MINUTES")) {
            let minutes = raw
                .trim()
                .parse::<i64>()
                .map_err(|e| ConfigError::Invalid {
                    name: "COSTBAR_REFRESH_INTERVAL_MINUTES",
                    reason: e.to_string(),
                })?;
            self.refresh_interval_minutes = positive_minutes(minutes)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.source.region.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "Region",
                reason: "must not be empty".to_string(),
            });
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                name: "DatabasePath",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_minutes.saturating_mul(60))
    }
}

fn positive_minutes(minutes: i64) -> Result<u64, ConfigError> {
    if minutes < 1 {
        return Err(ConfigError::Invalid {
            name: "RefreshIntervalMinutes",
            reason: format!("must be at least 1, got {}", minutes),
        });
    }
    Ok(minutes as u64)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn settings_file(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_defaults_without_file() {
        let config = Config::load_with_env(None, no_env).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.refresh_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_file_values_and_relative_database_path() {
        let (dir, path) = settings_file(
            r#"{
                "Aws": { "Profile": "billing", "Region": "eu-west-1", "UseSso": true },
                "DatabasePath": "data/costs.db",
                "RefreshIntervalMinutes": 15
            }"#,
        );

        let config = Config::load_with_env(Some(&path), no_env).unwrap();
        assert_eq!(config.source.profile, "billing");
        assert_eq!(config.source.region, "eu-west-1");
        assert_eq!(config.refresh_interval_minutes, 15);
        assert_eq!(config.database_path, dir.path().join("data/costs.db"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let (_dir, path) = settings_file(r#"{ "Aws": { "Profile": "ops" } }"#);
        let config = Config::load_with_env(Some(&path), no_env).unwrap();
        assert_eq!(config.source.profile, "ops");
        assert_eq!(config.source.region, DEFAULT_REGION);
        assert_eq!(config.refresh_interval_minutes, DEFAULT_REFRESH_INTERVAL_MINUTES);
    }

    #[test]
    fn test_env_overrides_file() {
        let (_dir, path) = settings_file(r#"{ "Aws": { "Region": "eu-west-1" } }"#);
        let env: HashMap<&str, &str> = [
            ("COSTBAR_REGION", "ap-southeast-2"),
            ("COSTBAR_ENDPOINT", "http://127.0.0.1:9000/"),
            ("COSTBAR_DATABASE_PATH", "/var/lib/costbar/costs.db"),
            ("COSTBAR_REFRESH_INTERVAL_MINUTES", "5"),
        ]
        .into_iter()
        .collect();

        let config =
            Config::load_with_env(Some(&path), |name| env.get(name).map(|v| v.to_string()))
                .unwrap();
        assert_eq!(config.source.region, "ap-southeast-2");
        assert_eq!(config.source.endpoint.as_deref(), Some("http://127.0.0.1:9000/"));
        assert_eq!(config.database_path, PathBuf::from("/var/lib/costbar/costs.db"));
        assert_eq!(config.refresh_interval_minutes, 5);
        assert_eq!(
            config.source.cost_explorer().endpoint,
            "http://127.0.0.1:9000/"
        );
    }

    #[test]
    fn test_relative_env_database_path_is_not_rebased() {
        let (_dir, path) = settings_file(r#"{ "DatabasePath": "data/costs.db" }"#);
        let config = Config::load_with_env(Some(&path), |name| {
            (name == "COSTBAR_DATABASE_PATH").then(|| "local/costs.db".to_string())
        })
        .unwrap();
        assert_eq!(config.database_path, PathBuf::from("local/costs.db"));

        // No DatabasePath in the file: the default stays as given too.
        let (_dir, path) = settings_file(r#"{ "Aws": { "Profile": "ops" } }"#);
        let config = Config::load_with_env(Some(&path), no_env).unwrap();
        assert_eq!(config.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
    }

    #[test]
    fn test_huge_refresh_interval_saturates() {
        let (_dir, path) =
            settings_file(r#"{ "RefreshIntervalMinutes": 9223372036854775807 }"#);
        let config = Config::load_with_env(Some(&path), no_env).unwrap();
        assert_eq!(config.refresh_interval_minutes, i64::MAX as u64);
        assert_eq!(config.refresh_interval(), Duration::from_secs(u64::MAX));

        let config = Config {
            refresh_interval_minutes: u64::MAX,
            ..Config::default()
        };
        assert_eq!(config.refresh_interval(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_zero_refresh_interval_rejected() {
        let (_dir, path) = settings_file(r#"{ "RefreshIntervalMinutes": 0 }"#);
        let err = Config::load_with_env(Some(&path), no_env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "RefreshIntervalMinutes",
                ..
            }
        ));
    }

    #[test]
    fn test_empty_region_rejected() {
        let (_dir, path) = settings_file(r#"{ "Aws": { "Region": "  " } }"#);
        let err = Config::load_with_env(Some(&path), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "Region", .. }));
    }

    #[test]
    fn test_malformed_file_and_missing_file() {
        let (_dir, path) = settings_file("{ not json");
        assert!(matches!(
            Config::load_with_env(Some(&path), no_env).unwrap_err(),
            ConfigError::Parse { .. }
        ));

        let missing = Path::new("/nonexistent/costbar/settings.json");
        assert!(matches!(
            Config::load_with_env(Some(missing), no_env).unwrap_err(),
            ConfigError::Read { .. }
        ));
    }

    #[test]
    fn test_default_endpoint_from_region() {
        let config = Config::default();
        assert_eq!(
            config.source.cost_explorer().endpoint,
            "https://ce.us-east-1.amazonaws.com/"
        );
    }
}
