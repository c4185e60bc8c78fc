//! Kiln Configuration System
//!
//! Provides configuration management for the Kiln runtime core:
//! - Runtime limits (small-call threshold, call-argument limit, values buffer)
//! - Operand stack sizing and guard region
//! - Foreign library search paths
//! - Interrupt delivery policy
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.kiln/config.toml)
//! 2. Project config (./kiln.toml, searched upwards)
//! 3. Environment variables (KILN_*)
//! 4. Embedder overrides (handled by caller)
//!
//! # Example
//!
//! ```no_run
//! use kiln_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! assert!(config.runtime.small_call_threshold() > 0);
//! ```

pub mod loader;
pub mod runtime;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use loader::{Config, ConfigLoader};
pub use runtime::{
    FfiConfig, FramesConfig, InterruptsConfig, RuntimeConfig, StackConfig,
    DEFAULT_CALL_ARGUMENTS_LIMIT, DEFAULT_GUARD_SLOTS, DEFAULT_MULTIPLE_VALUES_LIMIT,
    DEFAULT_OPERAND_STACK_SLOTS, DEFAULT_SMALL_CALL_THRESHOLD,
};
