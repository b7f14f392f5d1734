//! TOML configuration loader with validation.
//!
//! Loads [`VelaConfig`] from a TOML file. Validates path and mode-bit
//! sanity and the worker-thread bound before anything touches the
//! repository on disk.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::consts::{DEFAULT_REPO_PATH, DEFAULT_SHM_DIR, RP_THREAD_COUNT};

/// Configuration loading/validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("config I/O error: {0}")]
    Io(String),

    /// TOML parse error.
    #[error("config parse error: {0}")]
    Parse(String),

    /// Parameter validation error.
    #[error("config validation: {0}")]
    Validation(String),
}

/// Engine configuration.
///
/// Mode bits accept TOML octal literals (`dir_mode = 0o770`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VelaConfig {
    /// Repository root: SHM regions, lock file and datastore directories.
    pub repo_path: PathBuf,
    /// Directory for per-module running-datastore files.
    pub shm_dir: PathBuf,
    /// Mode bits for created directories.
    pub dir_mode: u32,
    /// Mode bits for created files (SHM regions, datastore files).
    pub file_mode: u32,
    /// Request-processor worker threads.
    pub worker_threads: usize,
    /// Main-lock timeout override in seconds.
    pub main_lock_timeout_s: u64,
}

impl Default for VelaConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from(DEFAULT_REPO_PATH),
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            dir_mode: 0o770,
            file_mode: 0o660,
            worker_threads: RP_THREAD_COUNT,
            main_lock_timeout_s: 10,
        }
    }
}

impl VelaConfig {
    /// Validate parameter bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repo_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation("repo_path must not be empty".into()));
        }
        if self.dir_mode > 0o777 || self.file_mode > 0o777 {
            return Err(ConfigError::Validation(format!(
                "mode bits out of range: dir_mode={:o} file_mode={:o}",
                self.dir_mode, self.file_mode
            )));
        }
        if self.worker_threads == 0 || self.worker_threads > 64 {
            return Err(ConfigError::Validation(format!(
                "worker_threads must be in 1..=64, got {}",
                self.worker_threads
            )));
        }
        if self.main_lock_timeout_s == 0 {
            return Err(ConfigError::Validation(
                "main_lock_timeout_s must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Load and validate the engine configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<VelaConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("failed to read {}: {e}", path.display())))?;
    let config: VelaConfig =
        toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    tracing::debug!(
        repo = %config.repo_path.display(),
        workers = config.worker_threads,
        "configuration loaded"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(VelaConfig::default().validate().is_ok());
    }

    #[test]
    fn parses_octal_modes() {
        let config: VelaConfig = toml::from_str(
            r#"
            repo_path = "/tmp/vela-test"
            dir_mode = 0o750
            file_mode = 0o640
            "#,
        )
        .unwrap();
        assert_eq!(config.dir_mode, 0o750);
        assert_eq!(config.file_mode, 0o640);
        assert_eq!(config.worker_threads, RP_THREAD_COUNT);
    }

    #[test]
    fn rejects_zero_workers() {
        let config: VelaConfig = toml::from_str("worker_threads = 0").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn rejects_unknown_fields() {
        let parsed: Result<VelaConfig, _> = toml::from_str("no_such_field = 1");
        assert!(parsed.is_err());
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/vela.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vela.toml");
        std::fs::write(
            &path,
            "repo_path = \"/tmp/vela\"\nworker_threads = 8\nmain_lock_timeout_s = 5\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.repo_path, PathBuf::from("/tmp/vela"));
        assert_eq!(config.worker_threads, 8);
        assert_eq!(config.main_lock_timeout_s, 5);
    }
}
