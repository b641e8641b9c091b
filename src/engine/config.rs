//! Updater Configuration Module
//! Built once at startup from an option table, the environment, or a JSON file,
//! then passed by reference to every component.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::updater::PollSettings;

/// Prefix of every recognised option key
pub const OPTION_PREFIX: &str = "NGFW_";

/// Upper bound for any timeout or poll value (one week)
pub const MAX_DURATION_SECS: f64 = 7.0 * 24.0 * 3600.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Appliance API base, e.g. `https://10.0.0.1/api`
    pub local_base: String,
    /// Artifact store base the ruleset files are fetched from
    pub artifact_base: String,
    pub update: UpdateCheckConfig,
    pub artifact: ArtifactConfig,
    pub request_timeout_secs: f64,
    pub maintenance: PollConfig,
    pub stats: PollConfig,
    pub accept_invalid_certs: bool,
    /// Where the last run report is written, if anywhere
    pub state_path: Option<PathBuf>,
}

/// Body of the check-for-updates call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateCheckConfig {
    pub login: String,
    pub password: String,
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub user: String,
    pub password: String,
    /// Stem of `<name>.zip` / `<name>.zip.sig`
    pub name: String,
    pub payload_file: Option<String>,
    pub signature_file: Option<String>,
    pub staging_dir: PathBuf,
    pub download_timeout_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: f64,
    pub timeout_secs: f64,
    pub request_timeout_secs: f64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            local_base: "https://127.0.0.1/api".to_string(),
            artifact_base: "https://updates.local/rules".to_string(),
            update: UpdateCheckConfig::default(),
            artifact: ArtifactConfig::default(),
            request_timeout_secs: 30.0,
            maintenance: PollConfig {
                interval_secs: 5.0,
                timeout_secs: 300.0,
                request_timeout_secs: 10.0,
            },
            stats: PollConfig {
                interval_secs: 2.0,
                timeout_secs: 300.0,
                request_timeout_secs: 10.0,
            },
            accept_invalid_certs: false,
            state_path: None,
        }
    }
}

impl Default for UpdateCheckConfig {
    fn default() -> Self {
        Self {
            login: String::new(),
            password: String::new(),
            channel: "stable".to_string(),
        }
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            name: "rules".to_string(),
            payload_file: None,
            signature_file: None,
            staging_dir: PathBuf::from("/opt/cdm-upload/files"),
            download_timeout_secs: 600.0,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 2.0,
            timeout_secs: 300.0,
            request_timeout_secs: 10.0,
        }
    }
}

impl PollConfig {
    pub fn settings(&self) -> PollSettings {
        PollSettings::new(
            secs_duration(self.interval_secs),
            secs_duration(self.timeout_secs),
            secs_duration(self.request_timeout_secs),
        )
    }
}

impl UpdaterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: UpdaterConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Collect `NGFW_*` variables and apply them over the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let options: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with(OPTION_PREFIX))
            .collect();
        Self::from_options(&options)
    }

    /// Apply an `{option: value}` table over the defaults. Unknown keys are ignored.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in options {
            let Some(option) = key.strip_prefix(OPTION_PREFIX) else {
                continue;
            };
            match option {
                "LOCAL_BASE" => config.local_base = value.clone(),
                "ARTIFACT_BASE" => config.artifact_base = value.clone(),
                "UPDATE_LOGIN" => config.update.login = value.clone(),
                "UPDATE_PASSWORD" => config.update.password = value.clone(),
                "UPDATE_CHANNEL" => config.update.channel = value.clone(),
                "ARTIFACT_USER" => config.artifact.user = value.clone(),
                "ARTIFACT_PASSWORD" => config.artifact.password = value.clone(),
                "ARTIFACT_NAME" => config.artifact.name = value.clone(),
                "PAYLOAD_FILE" => config.artifact.payload_file = Some(value.clone()),
                "SIGNATURE_FILE" => config.artifact.signature_file = Some(value.clone()),
                "STAGING_DIR" => config.artifact.staging_dir = PathBuf::from(value),
                "REQUEST_TIMEOUT_SECS" => config.request_timeout_secs = parse_secs(key, value)?,
                "DOWNLOAD_TIMEOUT_SECS" => {
                    config.artifact.download_timeout_secs = parse_secs(key, value)?
                }
                "MAINTENANCE_POLL_SECS" => config.maintenance.interval_secs = parse_secs(key, value)?,
                "MAINTENANCE_TIMEOUT_SECS" => {
                    config.maintenance.timeout_secs = parse_secs(key, value)?
                }
                "STATS_POLL_SECS" => config.stats.interval_secs = parse_secs(key, value)?,
                "STATS_TIMEOUT_SECS" => config.stats.timeout_secs = parse_secs(key, value)?,
                "POLL_REQUEST_TIMEOUT_SECS" => {
                    let secs = parse_secs(key, value)?;
                    config.maintenance.request_timeout_secs = secs;
                    config.stats.request_timeout_secs = secs;
                }
                "ACCEPT_INVALID_CERTS" => config.accept_invalid_certs = parse_bool(key, value)?,
                "STATE_PATH" => config.state_path = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("request_timeout_secs", self.request_timeout_secs),
            ("artifact.download_timeout_secs", self.artifact.download_timeout_secs),
            ("maintenance.interval_secs", self.maintenance.interval_secs),
            ("maintenance.timeout_secs", self.maintenance.timeout_secs),
            ("maintenance.request_timeout_secs", self.maintenance.request_timeout_secs),
            ("stats.interval_secs", self.stats.interval_secs),
            ("stats.timeout_secs", self.stats.timeout_secs),
            ("stats.request_timeout_secs", self.stats.request_timeout_secs),
        ];
        for (key, secs) in durations {
            check_secs(key, secs)?;
        }
        for (key, secs) in [
            ("maintenance.interval_secs", self.maintenance.interval_secs),
            ("stats.interval_secs", self.stats.interval_secs),
        ] {
            if secs <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: secs.to_string(),
                });
            }
        }
        if self.local_base.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "local_base".to_string(),
                value: self.local_base.clone(),
            });
        }
        Ok(())
    }

    /// Appliance URL for an endpoint path such as `/update/rules/start-download`
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.local_base.trim_end_matches('/'), path)
    }

    pub fn request_timeout(&self) -> Duration {
        secs_duration(self.request_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        secs_duration(self.artifact.download_timeout_secs)
    }

    pub fn payload_file_name(&self) -> String {
        self.artifact
            .payload_file
            .clone()
            .unwrap_or_else(|| format!("{}.zip", self.artifact.name))
    }

    pub fn signature_file_name(&self) -> String {
        self.artifact
            .signature_file
            .clone()
            .unwrap_or_else(|| format!("{}.sig", self.payload_file_name()))
    }

    pub fn artifact_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.artifact_base.trim_end_matches('/'), file_name)
    }

    /// `Basic <base64(user:password)>` header value for the artifact store
    pub fn artifact_authorization(&self) -> String {
        let raw = format!("{}:{}", self.artifact.user, self.artifact.password);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

fn parse_secs(key: &str, value: &str) -> Result<f64, ConfigError> {
    let secs = value
        .trim()
        .parse::<f64>()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })?;
    check_secs(key, secs)?;
    Ok(secs)
}

/// A timing value must be a representable, non-negative duration of at most
/// `MAX_DURATION_SECS`
fn check_secs(key: &str, secs: f64) -> Result<(), ConfigError> {
    let representable = Duration::try_from_secs_f64(secs).is_ok();
    if !representable || secs > MAX_DURATION_SECS {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: secs.to_string(),
        });
    }
    Ok(())
}

/// Lossless for validated values; anything else clamps into range
fn secs_duration(secs: f64) -> Duration {
    if secs.is_nan() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_DURATION_SECS)).unwrap_or(Duration::ZERO)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = UpdaterConfig::default();
        assert_eq!(config.artifact.staging_dir, PathBuf::from("/opt/cdm-upload/files"));
        assert_eq!(config.payload_file_name(), "rules.zip");
        assert_eq!(config.signature_file_name(), "rules.zip.sig");
        assert_eq!(config.maintenance.settings().max_wait, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_options_overrides() {
        let config = UpdaterConfig::from_options(&options(&[
            ("NGFW_LOCAL_BASE", "https://10.1.1.1/api/"),
            ("NGFW_ARTIFACT_NAME", "ids-2024"),
            ("NGFW_STATS_POLL_SECS", "0.5"),
            ("NGFW_POLL_REQUEST_TIMEOUT_SECS", "3"),
            ("NGFW_ACCEPT_INVALID_CERTS", "yes"),
            ("HOME", "/root"),
        ]))
        .unwrap();

        assert_eq!(
            config.endpoint("/update/rules/start-download"),
            "https://10.1.1.1/api/update/rules/start-download"
        );
        assert_eq!(config.payload_file_name(), "ids-2024.zip");
        assert_eq!(config.stats.settings().interval, Duration::from_millis(500));
        assert_eq!(config.maintenance.request_timeout_secs, 3.0);
        assert!(config.accept_invalid_certs);
    }

    #[test]
    fn test_file_name_overrides() {
        let config = UpdaterConfig::from_options(&options(&[
            ("NGFW_PAYLOAD_FILE", "bundle.tar"),
            ("NGFW_SIGNATURE_FILE", "bundle.asc"),
        ]))
        .unwrap();
        assert_eq!(config.payload_file_name(), "bundle.tar");
        assert_eq!(config.signature_file_name(), "bundle.asc");
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let result = UpdaterConfig::from_options(&options(&[("NGFW_STATS_TIMEOUT_SECS", "soon")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result = UpdaterConfig::from_options(&options(&[("NGFW_STATS_TIMEOUT_SECS", "-1")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_oversized_duration_is_rejected() {
        for value in ["1e30", "inf", "NaN", "604801"] {
            let result = UpdaterConfig::from_options(&options(&[("NGFW_STATS_TIMEOUT_SECS", value)]));
            assert!(
                matches!(result, Err(ConfigError::InvalidValue { ref key, .. }) if key == "NGFW_STATS_TIMEOUT_SECS"),
                "{} accepted",
                value
            );
        }

        let config = UpdaterConfig::from_options(&options(&[("NGFW_STATS_TIMEOUT_SECS", "604800")])).unwrap();
        assert_eq!(config.stats.settings().max_wait, Duration::from_secs(604_800));
    }

    #[test]
    fn test_oversized_duration_in_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge.json");
        std::fs::write(&path, r#"{ "maintenance": { "timeout_secs": 1e30 } }"#).unwrap();

        let result = UpdaterConfig::load(&path);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "maintenance.timeout_secs"
        ));
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let result = UpdaterConfig::from_options(&options(&[("NGFW_MAINTENANCE_POLL_SECS", "0")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "maintenance.interval_secs"
        ));
    }

    #[test]
    fn test_unvalidated_values_convert_without_panicking() {
        let mut config = UpdaterConfig::default();
        config.request_timeout_secs = 1e30;
        config.stats.timeout_secs = -5.0;
        config.artifact.download_timeout_secs = f64::NAN;

        assert!(config.validate().is_err());
        assert_eq!(config.request_timeout(), Duration::from_secs(604_800));
        assert_eq!(config.stats.settings().max_wait, Duration::ZERO);
        assert_eq!(config.download_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_artifact_authorization() {
        let mut config = UpdaterConfig::default();
        config.artifact.user = "Aladdin".to_string();
        config.artifact.password = "open sesame".to_string();
        assert_eq!(
            config.artifact_authorization(),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
        assert_eq!(
            config.artifact_url("rules.zip"),
            "https://updates.local/rules/rules.zip"
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ngfw-updater.json");

        let mut config = UpdaterConfig::default();
        config.update.channel = "beta".to_string();
        config.save(&path).unwrap();

        let loaded = UpdaterConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "local_base": "https://fw/api" }"#).unwrap();

        let loaded = UpdaterConfig::load(&path).unwrap();
        assert_eq!(loaded.local_base, "https://fw/api");
        assert_eq!(loaded.update.channel, "stable");
    }

    #[test]
    fn test_load_missing_file() {
        let result = UpdaterConfig::load(Path::new("/nonexistent/ngfw-updater.json"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
