use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub database_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_filter: String,
    /// Root of exported sheet values read by the file connector.
    pub values_dir: PathBuf,
    pub sync_deadline_seconds: u64,
    pub max_concurrent_syncs: usize,
    pub scheduler_interval_seconds: u64,
    pub issue_sample_limit: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/practice-metrics.db"),
            log_dir: PathBuf::from("data/logs"),
            log_filter: "info".to_string(),
            values_dir: PathBuf::from("data/sheets"),
            sync_deadline_seconds: 300,
            max_concurrent_syncs: 2,
            scheduler_interval_seconds: 60,
            issue_sample_limit: 25,
        }
    }
}

impl AppSettings {
    /// Reads a YAML settings file; keys missing from the file keep their defaults.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|error| AppError::Io(format!("{}: {}", path.display(), error)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Self = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> AppResult<()> {
        if self.sync_deadline_seconds == 0 {
            return Err(AppError::Configuration(
                "syncDeadlineSeconds must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_syncs == 0 {
            return Err(AppError::Configuration(
                "maxConcurrentSyncs must be greater than zero".to_string(),
            ));
        }
        if self.scheduler_interval_seconds == 0 {
            return Err(AppError::Configuration(
                "schedulerIntervalSeconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::AppSettings;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let settings = AppSettings::from_yaml("syncDeadlineSeconds: 30\nvaluesDir: /srv/sheets\n")
            .expect("settings");
        assert_eq!(settings.sync_deadline_seconds, 30);
        assert_eq!(settings.values_dir.to_string_lossy(), "/srv/sheets");
        assert_eq!(settings.max_concurrent_syncs, 2);
        assert_eq!(settings.log_filter, "info");
    }

    #[test]
    fn rejects_zero_deadline() {
        let error = AppSettings::from_yaml("syncDeadlineSeconds: 0\n").expect_err("invalid");
        assert!(error.to_string().contains("syncDeadlineSeconds"));
    }

    #[test]
    fn missing_path_yields_defaults() {
        let settings = AppSettings::load(None).expect("defaults");
        assert_eq!(settings.issue_sample_limit, 25);
    }
}
