//! Configuration loading
//!
//! Values come from an optional TOML file; `DATABASE_URL` in the environment
//! overrides the file. Anything missing falls back to the defaults below.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analytics::RiskThresholds;
use crate::calendar::CampusCalendar;
use crate::error::{CoreError, Result};
use crate::models::RiskStatus;
use crate::retry::RetryPolicy;

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Campus offset from UTC used to turn calendar dates into instants.
    pub utc_offset_minutes: i32,
    pub thresholds: RiskThresholds,
    pub low_attendance_threshold: u32,
    /// Lowest status that produces a notification when entered.
    pub notify_at: RiskStatus,
    pub retry: RetryPolicy,
    pub change_feed_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            utc_offset_minutes: 0,
            thresholds: RiskThresholds::default(),
            low_attendance_threshold: 75,
            notify_at: RiskStatus::Danger,
            retry: RetryPolicy::default(),
            change_feed_capacity: 256,
        }
    }
}

impl CoreConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CoreConfig = toml::from_str(content)
            .map_err(|err| CoreError::validation(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            CoreError::validation(format!("cannot read config {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// File (when given) or defaults, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            if !url.trim().is_empty() {
                config.database_url = Some(url);
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        if self.low_attendance_threshold > 100 {
            return Err(CoreError::validation(
                "low_attendance_threshold must be at most 100",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::validation("retry.max_attempts must be at least 1"));
        }
        if self.notify_at == RiskStatus::Safe {
            return Err(CoreError::validation(
                "notify_at must be warning or danger",
            ));
        }
        CampusCalendar::new(self.utc_offset_minutes)?;
        Ok(())
    }

    pub fn calendar(&self) -> Result<CampusCalendar> {
        CampusCalendar::new(self.utc_offset_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config = CoreConfig::from_toml_str("").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.thresholds.warning, 85);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = CoreConfig::from_toml_str(
            r#"
            utc_offset_minutes = 330
            notify_at = "warning"

            [thresholds]
            warning = 80

            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.utc_offset_minutes, 330);
        assert_eq!(config.notify_at, RiskStatus::Warning);
        assert_eq!(config.thresholds.danger, 75);
        assert_eq!(config.thresholds.warning, 80);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_backoff_ms, 100);
    }

    #[test]
    fn inconsistent_thresholds_are_rejected() {
        let err = CoreConfig::from_toml_str("[thresholds]\ndanger = 90\nwarning = 80\n")
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(CoreConfig::from_toml_str("notify_at = \"safe\"").is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "low_attendance_threshold = 60").unwrap();
        let config = CoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.low_attendance_threshold, 60);
    }
}
