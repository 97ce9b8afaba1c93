//! Configuration for the engine and the benchmark binary.
//!
//! [`EngineConfig`] is what [`Engine::new`](crate::Engine::new) consumes. The
//! binary builds it from command-line arguments and an optional TOML file;
//! CLI arguments take precedence over config file values.

use crate::error::EngineError;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Largest ring depth accepted. The submission queue is sized at roughly
/// twice the depth and io_uring caps it at 32768 entries.
pub const MAX_RING_DEPTH: usize = 16 * 1024;

/// Kernel ring backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Linux io_uring.
    IoUring,
    /// Positional syscalls serviced by the driver thread (any Unix).
    Blocking,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Backend::IoUring
        } else {
            Backend::Blocking
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Ring backend.
    #[serde(default)]
    pub backend: Backend,
    /// Maximum requests in flight in the kernel at once.
    #[serde(default = "default_ring_depth")]
    pub ring_depth: usize,
    /// Number of buffer slots.
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    /// Bytes per buffer slot.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Alignment of every slot start (power of 2).
    #[serde(default = "default_buffer_align")]
    pub buffer_align: usize,
    /// Maximum completions processed per driver iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Enable io_uring SQPOLL with this idle time in milliseconds.
    #[serde(default)]
    pub sqpoll_idle_ms: Option<u32>,
    /// Drain budget used when the engine is dropped without an explicit
    /// shutdown (None = wait for every request).
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: Option<u64>,
    /// Cap on bytes per underlying call (blocking backend only). Forces
    /// short transfers, which exercises the retry path.
    #[serde(default)]
    pub max_transfer: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            ring_depth: default_ring_depth(),
            buffer_count: default_buffer_count(),
            buffer_size: default_buffer_size(),
            buffer_align: default_buffer_align(),
            batch_size: default_batch_size(),
            sqpoll_idle_ms: None,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            max_transfer: None,
        }
    }
}

fn default_ring_depth() -> usize {
    64
}

fn default_buffer_count() -> usize {
    128
}

fn default_buffer_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_buffer_align() -> usize {
    4096
}

fn default_batch_size() -> usize {
    256
}

fn default_shutdown_timeout_ms() -> Option<u64> {
    Some(5_000)
}

impl EngineConfig {
    /// Configuration with the three core limits set and defaults elsewhere.
    pub fn new(ring_depth: usize, buffer_count: usize, buffer_size: usize) -> Self {
        Self {
            ring_depth,
            buffer_count,
            buffer_size,
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_max_transfer(mut self, max_transfer: usize) -> Self {
        self.max_transfer = Some(max_transfer);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Drain budget applied on drop.
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_ms.map(Duration::from_millis)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.ring_depth == 0 || self.ring_depth > MAX_RING_DEPTH {
            return Err(EngineError::Config(format!(
                "ring_depth must be between 1 and {MAX_RING_DEPTH}, got {}",
                self.ring_depth
            )));
        }
        if self.buffer_count == 0 {
            return Err(EngineError::Config("buffer_count must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(EngineError::Config("buffer_size must be at least 1".into()));
        }
        if !self.buffer_align.is_power_of_two() {
            return Err(EngineError::Config(format!(
                "buffer_align must be a power of 2, got {}",
                self.buffer_align
            )));
        }
        if self.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be at least 1".into()));
        }
        if self.max_transfer == Some(0) {
            return Err(EngineError::Config("max_transfer must be at least 1".into()));
        }
        Ok(())
    }
}

/// Command-line arguments for the benchmark binary
#[derive(Parser, Debug)]
#[command(name = "batched-io")]
#[command(version = "0.1.0")]
#[command(about = "Read a file through the batched I/O engine and report throughput", long_about = None)]
pub struct CliArgs {
    /// File to read
    pub file: PathBuf,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Ring backend
    #[arg(short, long, value_enum)]
    pub backend: Option<Backend>,

    /// Maximum requests in flight
    #[arg(short = 'd', long)]
    pub ring_depth: Option<usize>,

    /// Number of buffer slots
    #[arg(short = 'n', long)]
    pub buffer_count: Option<usize>,

    /// Bytes per buffer slot
    #[arg(short = 's', long)]
    pub buffer_size: Option<usize>,

    /// Bytes per read request (defaults to the buffer size)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Number of passes over the file
    #[arg(short, long)]
    pub passes: Option<usize>,

    /// Compare the bytes read against a plain std::fs read
    #[arg(long)]
    pub verify: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub bench: BenchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Benchmark settings
#[derive(Debug, Deserialize)]
pub struct BenchConfig {
    /// Bytes per read request
    pub chunk_size: Option<usize>,
    /// Number of passes over the file
    #[serde(default = "default_passes")]
    pub passes: usize,
    /// Verify bytes against std::fs
    #[serde(default)]
    pub verify: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            passes: default_passes(),
            verify: false,
        }
    }
}

fn default_passes() -> usize {
    1
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration for the binary
#[derive(Debug, Clone)]
pub struct Config {
    pub file: PathBuf,
    pub engine: EngineConfig,
    pub chunk_size: usize,
    pub passes: usize,
    pub verify: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut engine = toml_config.engine;
        if let Some(backend) = cli.backend {
            engine.backend = backend;
        }
        if let Some(depth) = cli.ring_depth {
            engine.ring_depth = depth;
        }
        if let Some(count) = cli.buffer_count {
            engine.buffer_count = count;
        }
        if let Some(size) = cli.buffer_size {
            engine.buffer_size = size;
        }
        engine.validate().map_err(ConfigError::Invalid)?;

        let chunk_size = cli
            .chunk_size
            .or(toml_config.bench.chunk_size)
            .unwrap_or(engine.buffer_size);
        let limit = engine.buffer_size * engine.buffer_count;
        if chunk_size == 0 || chunk_size > limit {
            return Err(ConfigError::ChunkSize { chunk_size, limit });
        }

        Ok(Config {
            file: cli.file,
            engine,
            chunk_size,
            passes: cli.passes.unwrap_or(toml_config.bench.passes).max(1),
            verify: cli.verify || toml_config.bench.verify,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("{0}")]
    Invalid(EngineError),
    #[error("chunk_size {chunk_size} must be between 1 and buffer_size * buffer_count ({limit})")]
    ChunkSize { chunk_size: usize, limit: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.engine.ring_depth, 64);
        assert_eq!(config.engine.buffer_count, 128);
        assert_eq!(config.engine.buffer_size, 64 * 1024);
        assert_eq!(config.engine.buffer_align, 4096);
        assert_eq!(config.bench.passes, 1);
        assert!(config.engine.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [engine]
            backend = "blocking"
            ring_depth = 8
            buffer_count = 16
            buffer_size = 8192
            shutdown_timeout_ms = 250
            max_transfer = 1024

            [bench]
            chunk_size = 4096
            passes = 3
            verify = true

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.backend, Backend::Blocking);
        assert_eq!(config.engine.ring_depth, 8);
        assert_eq!(config.engine.buffer_count, 16);
        assert_eq!(config.engine.buffer_size, 8192);
        assert_eq!(config.engine.buffer_align, 4096);
        assert_eq!(
            config.engine.shutdown_timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.engine.max_transfer, Some(1024));
        assert_eq!(config.bench.chunk_size, Some(4096));
        assert_eq!(config.bench.passes, 3);
        assert!(config.bench.verify);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        assert!(EngineConfig::new(0, 4, 4096).validate().is_err());
        assert!(EngineConfig::new(4, 0, 4096).validate().is_err());
        assert!(EngineConfig::new(4, 4, 0).validate().is_err());
        assert!(EngineConfig::new(MAX_RING_DEPTH + 1, 4, 4096).validate().is_err());

        let mut config = EngineConfig::new(4, 4, 4096);
        config.buffer_align = 3;
        assert!(config.validate().is_err());
        assert!(EngineConfig::new(4, 4, 4096)
            .with_max_transfer(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_cli_overrides_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[engine]\nring_depth = 8\nbuffer_size = 4096\n[logging]\nlevel = \"warn\""
        )
        .unwrap();

        let cli = CliArgs::parse_from([
            "batched-io",
            "data.bin",
            "--config",
            file.path().to_str().unwrap(),
            "--ring-depth",
            "32",
            "--backend",
            "blocking",
        ]);
        let config = Config::from_args(cli).unwrap();

        assert_eq!(config.engine.ring_depth, 32);
        assert_eq!(config.engine.backend, Backend::Blocking);
        assert_eq!(config.engine.buffer_size, 4096);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_config_file_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let cli = CliArgs::parse_from([
            "batched-io",
            "data.bin",
            "--config",
            missing.to_str().unwrap(),
        ]);
        let err = Config::from_args(cli).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
        let msg = err.to_string();
        assert!(msg.starts_with("Failed to read config file"));
        assert!(msg.contains("missing.toml"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine\nring_depth = 8").unwrap();
        let cli = CliArgs::parse_from([
            "batched-io",
            "data.bin",
            "--config",
            file.path().to_str().unwrap(),
        ]);
        let err = Config::from_args(cli).unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(..)));
        assert!(err.to_string().starts_with("Failed to parse config file"));
    }

    #[test]
    fn test_chunk_size_limit() {
        let cli = CliArgs::parse_from([
            "batched-io",
            "data.bin",
            "--buffer-count",
            "2",
            "--buffer-size",
            "1024",
            "--chunk-size",
            "4096",
        ]);
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::ChunkSize { limit: 2048, .. })
        ));
    }
}
