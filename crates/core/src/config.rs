use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "NODEFLOW_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

/// Knobs of the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Period of the progress aggregator / view refresh.
    pub view_refresh_interval_ms: u64,
    /// Report firings per second to the view sink.
    pub benchmark: bool,
    /// How long `stop` waits for each worker before detaching it.
    pub stop_timeout_ms: u64,
    pub thread_priority: ThreadPriority,
    /// Sleep before every firing, for watching a run in slow motion.
    pub fire_delay_ms: u64,
    /// Values an input port buffers before a producer's `emit` blocks.
    pub input_queue_capacity: usize,
}

/// Scheduling hint for worker threads. The standard library offers no
/// portable way to apply it, so it is recorded and logged only.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadPriority {
    Lowest,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    Highest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Number of daily log files kept under `<data_dir>/logs`.
    pub retention_files: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            view_refresh_interval_ms: 100,
            benchmark: false,
            stop_timeout_ms: 10_000,
            thread_priority: ThreadPriority::Normal,
            fire_delay_ms: 0,
            input_queue_capacity: 8,
        }
    }
}

impl EngineConfig {
    pub fn view_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.view_refresh_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn fire_delay(&self) -> Duration {
        Duration::from_millis(self.fire_delay_ms)
    }

    pub fn input_queue_capacity(&self) -> usize {
        self.input_queue_capacity.max(1)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_files: crate::logging::DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory: CLI override, then `NODEFLOW_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default `config.toml` on first run.
/// An existing config file is left untouched.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.engine.view_refresh_interval_ms, 100);
        assert!(!cfg.engine.benchmark);
        assert_eq!(cfg.engine.stop_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.engine.thread_priority, ThreadPriority::Normal);
        assert_eq!(cfg.engine.fire_delay(), Duration::ZERO);
        assert_eq!(cfg.engine.input_queue_capacity(), 8);
        assert_eq!(
            cfg.logging.retention_files,
            crate::logging::DEFAULT_LOG_RETENTION_FILES
        );
    }

    #[test]
    fn test_toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.engine.benchmark = true;
        original.engine.thread_priority = ThreadPriority::BelowNormal;

        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        assert!(encoded.contains("thread_priority = \"below_normal\""));

        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let decoded: AppConfig =
            toml::from_str("[engine]\nstop_timeout_ms = 250\n").expect("partial config");

        assert_eq!(decoded.engine.stop_timeout(), Duration::from_millis(250));
        assert_eq!(decoded.engine.view_refresh_interval_ms, 100);
        assert_eq!(decoded.logging, LoggingConfig::default());
    }

    #[test]
    fn test_view_refresh_interval_is_never_zero() {
        let cfg = EngineConfig {
            view_refresh_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(cfg.view_refresh_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_input_queue_capacity_is_never_zero() {
        let cfg = EngineConfig {
            input_queue_capacity: 0,
            ..Default::default()
        };
        assert_eq!(cfg.input_queue_capacity(), 1);
    }

    #[test]
    fn test_load_missing_or_empty_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let loaded = AppConfig::load_from_path(&path).expect("load from missing path");
        assert_eq!(loaded, AppConfig::default());

        fs::write(&path, "   \n").expect("write empty config");
        let loaded = AppConfig::load_from_path(&path).expect("load from empty file");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn test_load_reports_parse_errors_with_path() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[engine\n").expect("write broken config");

        let err = AppConfig::load_from_path(&path).expect_err("broken TOML should fail");
        assert!(err.to_string().starts_with("failed to parse config TOML"));
    }

    #[test]
    fn test_data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn test_data_dir_env_then_default() {
        let previous = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(value) = previous {
            env::set_var(ENV_DATA_DIR, value);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn test_initialize_creates_data_dir_and_preserves_existing_config() {
        let dir = tempdir().expect("tempdir");
        let data = dir.path().join("nested");

        initialize_data_dir(&data).expect("initialize data dir");
        assert!(config_path(&data).exists());

        let custom = "[engine]\nbenchmark = true\n";
        fs::write(config_path(&data), custom).expect("write custom config");
        initialize_data_dir(&data).expect("re-initialize data dir");

        let content = fs::read_to_string(config_path(&data)).expect("read config");
        assert_eq!(content, custom);
    }
}
