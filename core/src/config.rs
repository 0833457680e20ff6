use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Main configuration structure for Veritrace.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub palette: PaletteConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Get the default configuration as a TOML string.
    pub fn default_toml() -> Result<String> {
        let config = Self::default();
        toml::to_string_pretty(&config).context("Failed to serialize default config")
    }

    /// Validate the configuration for obvious misconfiguration.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend != "memory" {
            anyhow::bail!("Invalid store backend: {}", self.store.backend);
        }

        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.engine.buffer_size == 0 || self.engine.batch_size == 0 {
            anyhow::bail!("engine buffer_size and batch_size must be greater than 0");
        }

        if self.build.display_width <= 0 {
            anyhow::bail!("build.display_width must be greater than 0");
        }

        if self.build.bucket_multiplier <= 0 {
            anyhow::bail!("build.bucket_multiplier must be greater than 0");
        }

        if self.build.update_timeout_ms == 0 {
            anyhow::bail!("build.update_timeout_ms must be greater than 0");
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("Invalid log level: {}", other),
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("Failed to parse config")?;
        Ok(config)
    }
}

/// Runtime server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            verbose: false,
            cors_enabled: true,
            cors_origins: default_cors_origins(),
        }
    }
}

/// Event ingestion tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval(),
        }
    }
}

/// Attribute store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Number of full-state snapshots memoized per trace.
    #[serde(default = "default_snapshot_cache_capacity")]
    pub snapshot_cache_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            snapshot_cache_capacity: default_snapshot_cache_capacity(),
        }
    }
}

/// Incremental visual tree build.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildConfig {
    /// Upper bound on a single wait for store progress.
    #[serde(default = "default_update_timeout")]
    pub update_timeout_ms: u64,

    /// Horizontal resolution the samples are coarsened for.
    #[serde(default = "default_display_width")]
    pub display_width: i64,

    /// Bucket width as a multiple of the pixel-to-time resolution.
    #[serde(default = "default_bucket_multiplier")]
    pub bucket_multiplier: i64,

    /// Field sampled for each variable entry.
    #[serde(default = "default_sample_field")]
    pub sample_field: String,

    /// Entries with a sample below this count as problematic.
    #[serde(default = "default_problem_limit")]
    pub problem_limit: f64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            update_timeout_ms: default_update_timeout(),
            display_width: default_display_width(),
            bucket_multiplier: default_bucket_multiplier(),
            sample_field: default_sample_field(),
            problem_limit: default_problem_limit(),
        }
    }
}

/// Gradient stops used to color significant-digit values.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaletteConfig {
    #[serde(default = "default_color_begin")]
    pub begin: [u8; 3],

    #[serde(default = "default_color_mid")]
    pub mid: [u8; 3],

    #[serde(default = "default_color_end")]
    pub end: [u8; 3],
}

impl Default for PaletteConfig {
    fn default() -> Self {
        Self {
            begin: default_color_begin(),
            mid: default_color_mid(),
            end: default_color_end(),
        }
    }
}

/// Trace file acceptance rules.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct IngestConfig {
    /// Reject traces that do not start with a `veritrace` environment header.
    #[serde(default)]
    pub require_domain_header: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub include_modules: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            include_modules: false,
        }
    }
}

// Default providers ---------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_buffer_size() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    10
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_snapshot_cache_capacity() -> usize {
    64
}

fn default_update_timeout() -> u64 {
    500
}

fn default_display_width() -> i64 {
    1000
}

fn default_bucket_multiplier() -> i64 {
    2
}

fn default_sample_field() -> String {
    "significant_digits".to_string()
}

fn default_problem_limit() -> f64 {
    3.0
}

fn default_color_begin() -> [u8; 3] {
    [255, 0, 0]
}

fn default_color_mid() -> [u8; 3] {
    [255, 255, 0]
}

fn default_color_end() -> [u8; 3] {
    [0, 255, 0]
}

fn default_log_level() -> String {
    "info".to_string()
}

// Tests ---------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.backend, "memory");
        assert_eq!(config.build.bucket_multiplier, 2);
        assert_eq!(config.build.sample_field, "significant_digits");
        assert_eq!(config.palette.begin, [255, 0, 0]);
        assert!(!config.ingest.require_domain_header);
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_store_backend() {
        let mut config = Config::default();
        config.store.backend = "postgres".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_positive_build_sizes() {
        for bad in [0, -1, i64::MIN] {
            let mut config = Config::default();
            config.build.display_width = bad;
            assert!(config.validate().is_err());

            let mut config = Config::default();
            config.build.bucket_multiplier = bad;
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 3000

            [build]
            display_width = 640
            update_timeout_ms = 50

            [palette]
            begin = [0, 0, 255]

            [ingest]
            require_domain_header = true
        "#;

        let config: Config = toml_str.parse().unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.build.display_width, 640);
        assert_eq!(config.build.update_timeout_ms, 50);
        assert_eq!(config.build.bucket_multiplier, 2);
        assert_eq!(config.palette.begin, [0, 0, 255]);
        assert_eq!(config.palette.end, [0, 255, 0]);
        assert!(config.ingest.require_domain_header);
    }

    #[test]
    fn test_default_toml_round_trips() {
        let rendered = Config::default_toml().unwrap();
        let parsed: Config = rendered.parse().unwrap();
        assert_eq!(parsed.engine.batch_size, 100);
        assert_eq!(parsed.store.snapshot_cache_capacity, 64);
    }
}
