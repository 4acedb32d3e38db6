//! Embedding Service Configuration
//!
//! Defaults, overlaid by an optional TOML file (`CONFIG_FILE`), overlaid by
//! environment variables. Resolved once at startup and never mutated.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::models::{DevicePreference, EmbeddingError, EmbeddingResult, ModelSettings};

/// Environment variable naming the optional TOML file
pub const CONFIG_FILE_ENV: &str = "CONFIG_FILE";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: NetworkConfig,
    pub model: ModelConfig,
    pub limits: LimitsConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    /// HuggingFace repository id or local model directory
    pub name: String,
    pub cache_dir: PathBuf,
    pub device: DevicePreference,
    pub intra_threads: usize,
    /// Tokens per sequence
    pub max_sequence_length: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_batch_size: usize,
    /// Characters per input text
    pub max_length: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: NetworkConfig::default(),
            model: ModelConfig::default(),
            limits: LimitsConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            cache_dir: PathBuf::from("/app/models"),
            device: DevicePreference::Auto,
            intra_threads: 4,
            max_sequence_length: 512,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_length: 8192,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Resolve the configuration from the process environment
    pub fn load() -> EmbeddingResult<Self> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve the configuration through an arbitrary variable lookup
    pub fn resolve<F>(lookup: F) -> EmbeddingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_FILE_ENV) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> EmbeddingResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> EmbeddingResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay environment variables onto the current values
    pub fn apply_env<F>(&mut self, lookup: &F) -> EmbeddingResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("MODEL_NAME") {
            self.model.name = name;
        }
        if let Some(dir) = lookup("MODEL_CACHE_DIR") {
            self.model.cache_dir = PathBuf::from(dir);
        }
        if let Some(host) = lookup("SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = parse_var(lookup, "SERVER_PORT")? {
            self.server.port = port;
        }
        if let Some(size) = parse_var(lookup, "MAX_BATCH_SIZE")? {
            self.limits.max_batch_size = size;
        }
        if let Some(length) = parse_var(lookup, "MAX_LENGTH")? {
            self.limits.max_length = length;
        }
        if let Some(length) = parse_var(lookup, "MAX_SEQUENCE_LENGTH")? {
            self.model.max_sequence_length = length;
        }
        if let Some(device) = parse_var(lookup, "DEVICE")? {
            self.model.device = device;
        }
        if let Some(threads) = parse_var(lookup, "INTRA_THREADS")? {
            self.model.intra_threads = threads;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.monitoring.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> EmbeddingResult<()> {
        let positive = [
            ("max_batch_size", self.limits.max_batch_size),
            ("max_length", self.limits.max_length),
            ("max_sequence_length", self.model.max_sequence_length),
            ("intra_threads", self.model.intra_threads),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(EmbeddingError::ConfigError {
                    message: format!("{} must be greater than zero", name),
                });
            }
        }
        if self.model.name.trim().is_empty() {
            return Err(EmbeddingError::ConfigError {
                message: "model name cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    /// `host:port` the HTTP server binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Request bodies larger than this are refused with 413
    pub fn max_body_bytes(&self) -> usize {
        const JSON_OVERHEAD: usize = 64 * 1024;
        // A JSON-escaped character takes at most 6 bytes
        self.limits
            .max_batch_size
            .saturating_mul(self.limits.max_length)
            .saturating_mul(6)
            .saturating_add(JSON_OVERHEAD)
    }

    /// Settings handed to the model manager
    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            model_name: self.model.name.clone(),
            cache_dir: self.model.cache_dir.clone(),
            device: self.model.device,
            intra_threads: self.model.intra_threads,
            max_sequence_length: self.model.max_sequence_length,
            max_length: self.limits.max_length,
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> EmbeddingResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| EmbeddingError::ConfigError {
            message: format!("Invalid value for {}: '{}' ({})", key, raw, e),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::resolve(lookup_from(&[])).unwrap();
        assert_eq!(config.model.name, "sentence-transformers/all-MiniLM-L6-v2");
        assert_eq!(config.model.cache_dir, PathBuf::from("/app/models"));
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.limits.max_batch_size, 32);
        assert_eq!(config.limits.max_length, 8192);
        assert_eq!(config.model.device, DevicePreference::Auto);
    }

    #[test]
    fn test_env_overrides() {
        let config = ServiceConfig::resolve(lookup_from(&[
            ("MODEL_NAME", "BAAI/bge-small-en-v1.5"),
            ("MODEL_CACHE_DIR", "/tmp/models"),
            ("SERVER_HOST", "127.0.0.1"),
            ("SERVER_PORT", "9001"),
            ("MAX_BATCH_SIZE", "8"),
            ("MAX_LENGTH", "256"),
            ("DEVICE", "cpu"),
            ("LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.model.name, "BAAI/bge-small-en-v1.5");
        assert_eq!(config.model.cache_dir, PathBuf::from("/tmp/models"));
        assert_eq!(config.bind_address(), "127.0.0.1:9001");
        assert_eq!(config.limits.max_batch_size, 8);
        assert_eq!(config.limits.max_length, 256);
        assert_eq!(config.model.device, DevicePreference::Cpu);
        assert_eq!(config.monitoring.log_level, "debug");

        let settings = config.model_settings();
        assert_eq!(settings.max_length, 256);
        assert_eq!(settings.model_name, "BAAI/bge-small-en-v1.5");
    }

    #[test]
    fn test_body_cap_follows_limits() {
        let mut config = ServiceConfig::default();
        config.limits.max_batch_size = 4;
        config.limits.max_length = 64;
        assert_eq!(config.max_body_bytes(), 4 * 64 * 6 + 64 * 1024);

        config.limits.max_batch_size = usize::MAX;
        assert_eq!(config.max_body_bytes(), usize::MAX);
    }

    #[test]
    fn test_malformed_numbers_are_errors() {
        let err = ServiceConfig::resolve(lookup_from(&[("SERVER_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("SERVER_PORT"));

        assert!(ServiceConfig::resolve(lookup_from(&[("MAX_BATCH_SIZE", "-1")])).is_err());
        assert!(ServiceConfig::resolve(lookup_from(&[("DEVICE", "tpu")])).is_err());
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        assert!(ServiceConfig::resolve(lookup_from(&[("MAX_BATCH_SIZE", "0")])).is_err());
        assert!(ServiceConfig::resolve(lookup_from(&[("MAX_LENGTH", "0")])).is_err());
    }

    #[test]
    fn test_toml_layer_with_env_on_top() {
        let mut config = ServiceConfig::from_toml(
            r#"
            [server]
            port = 7000

            [model]
            name = "intfloat/e5-small-v2"
            device = "cuda"

            [limits]
            max_batch_size = 64
            "#,
        )
        .unwrap();

        // Sections and keys left out keep their defaults
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.limits.max_length, 8192);
        assert_eq!(config.model.device, DevicePreference::Cuda);

        config.apply_env(&lookup_from(&[("MAX_BATCH_SIZE", "16")])).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.model.name, "intfloat/e5-small-v2");
        assert_eq!(config.limits.max_batch_size, 16);
    }

    #[test]
    fn test_missing_config_file() {
        let err = ServiceConfig::resolve(lookup_from(&[(CONFIG_FILE_ENV, "/nonexistent/config.toml")]));
        assert!(matches!(err, Err(EmbeddingError::IoError { .. })));
    }
}
