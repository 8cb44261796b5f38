use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;
use crate::device::DevicePreference;
use crate::logging::DEFAULT_LOG_RETENTION_FILES;

const CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_DATA_DIR: &str = "UPSCALE_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub inference: InferenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub device: DevicePreference,
    pub onnx_backend: InferenceBackend,
    pub trt_cache_dir: PathBuf,
    /// Tile edge in input pixels; `0` runs the whole image in one pass.
    pub tile_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_files: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: DevicePreference::Auto,
            onnx_backend: InferenceBackend::Cuda,
            trt_cache_dir: PathBuf::from("trt_cache"),
            tile_size: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_files: DEFAULT_LOG_RETENTION_FILES,
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

    /// `--config` wins; otherwise `<data_dir>/config.toml` is used when a data
    /// directory is known. Missing files yield defaults, malformed ones fail.
    pub fn load(explicit: Option<&Path>, data_dir: Option<&Path>) -> Result<Self> {
        match (explicit, data_dir) {
            (Some(path), _) => Self::load_from_path(path),
            (None, Some(dir)) => Self::load_from_path(&config_path(dir)),
            (None, None) => Ok(Self::default()),
        }
    }
}

impl InferenceConfig {
    /// Relative cache directories live under the data directory when there is one.
    pub fn resolved_trt_cache_dir(&self, data_dir: Option<&Path>) -> PathBuf {
        match data_dir {
            Some(base) => resolve_relative_to(base, &self.trt_cache_dir),
            None => self.trt_cache_dir.clone(),
        }
    }
}

/// Data directory: CLI override, then `UPSCALE_DATA_DIR`. Without either the
/// tool runs without persistent logs or crash reports.
pub fn data_dir(cli_override: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_override {
        return Some(path.to_path_buf());
    }
    env::var_os(ENV_DATA_DIR)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.inference.device, DevicePreference::Auto);
        assert_eq!(cfg.inference.onnx_backend, InferenceBackend::Cuda);
        assert_eq!(cfg.inference.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.inference.tile_size, 0);
        assert_eq!(cfg.logging.retention_files, DEFAULT_LOG_RETENTION_FILES);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.inference.device = DevicePreference::Cpu;
        original.inference.onnx_backend = InferenceBackend::Tensorrt;
        original.inference.tile_size = 256;

        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        assert!(encoded.contains("onnx_backend = \"tensorrt\""));
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[inference]\ntile_size = 128\n").expect("write config");

        let cfg = AppConfig::load_from_path(&path).expect("load config");
        assert_eq!(cfg.inference.tile_size, 128);
        assert_eq!(cfg.inference.device, DevicePreference::Auto);
        assert_eq!(cfg.logging, LoggingConfig::default());
    }

    #[test]
    fn missing_and_empty_files_return_defaults() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("absent.toml");
        let empty = dir.path().join("empty.toml");
        fs::write(&empty, "  \n").expect("write empty config");

        assert_eq!(
            AppConfig::load_from_path(&missing).expect("missing"),
            AppConfig::default()
        );
        assert_eq!(
            AppConfig::load_from_path(&empty).expect("empty"),
            AppConfig::default()
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[inference\n").expect("write config");

        let error = AppConfig::load_from_path(&path).expect_err("parse should fail");
        assert!(format!("{error:#}").contains("failed to parse config TOML"));
    }

    #[test]
    fn explicit_config_path_beats_data_dir() {
        let dir = tempdir().expect("tempdir");
        fs::write(config_path(dir.path()), "[inference]\ntile_size = 64\n").expect("write");
        let explicit = dir.path().join("other.toml");
        fs::write(&explicit, "[inference]\ntile_size = 512\n").expect("write");

        let from_dir = AppConfig::load(None, Some(dir.path())).expect("load from data dir");
        let from_flag = AppConfig::load(Some(&explicit), Some(dir.path())).expect("load explicit");
        assert_eq!(from_dir.inference.tile_size, 64);
        assert_eq!(from_flag.inference.tile_size, 512);
        assert_eq!(AppConfig::load(None, None).expect("defaults"), AppConfig::default());
    }

    #[test]
    fn data_dir_prefers_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, Some(PathBuf::from("/custom")));
    }

    #[test]
    fn trt_cache_dir_resolves_against_data_dir() {
        let cfg = InferenceConfig::default();
        assert_eq!(
            cfg.resolved_trt_cache_dir(Some(Path::new("/data"))),
            PathBuf::from("/data/trt_cache")
        );
        assert_eq!(cfg.resolved_trt_cache_dir(None), PathBuf::from("trt_cache"));

        let absolute = InferenceConfig {
            trt_cache_dir: PathBuf::from("/var/cache/trt"),
            ..InferenceConfig::default()
        };
        assert_eq!(
            absolute.resolved_trt_cache_dir(Some(Path::new("/data"))),
            PathBuf::from("/var/cache/trt")
        );
    }
}
