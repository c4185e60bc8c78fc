//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::runtime::RuntimeConfig;
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Name of the project configuration file
pub const PROJECT_CONFIG_FILE: &str = "kiln.toml";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.kiln/config.toml) - lowest priority
/// 2. Project config (./kiln.toml) - overrides global
/// 3. Environment variables (KILN_*) - overrides project
/// 4. Embedder overrides - highest priority (handled by caller)
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Effective runtime configuration
    pub runtime: RuntimeConfig,

    /// Directory where kiln.toml was found
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Create a loader that reads the global config from an explicit path
    pub fn with_global_config(path: impl Into<PathBuf>) -> Self {
        Self {
            global_config_path: Some(path.into()),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find kiln.toml, merges it over the
    /// global config and applies environment overrides.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;

        let mut runtime = self.load_global_config()?;
        runtime.merge(&project_config);
        let runtime = self.apply_env_overrides(runtime)?;
        runtime.validate()?;

        Ok(Config {
            runtime,
            project_root,
        })
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project_config = RuntimeConfig::load_from_file(config_path)?;

        let mut runtime = self.load_global_config()?;
        runtime.merge(&project_config);
        let runtime = self.apply_env_overrides(runtime)?;
        runtime.validate()?;

        Ok(Config {
            runtime,
            project_root: config_path.parent().map(|p| p.to_path_buf()),
        })
    }

    /// Find project configuration by walking up directory tree
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, RuntimeConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let config = RuntimeConfig::load_from_file(&config_path)?;
                return Ok((Some(current), config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, RuntimeConfig::default())),
            }
        }
    }

    /// Load global configuration from ~/.kiln/config.toml
    ///
    /// A missing file or home directory yields the defaults.
    fn load_global_config(&mut self) -> ConfigResult<RuntimeConfig> {
        if self.global_config_path.is_none() {
            match RuntimeConfig::global_config_path() {
                Ok(path) => self.global_config_path = Some(path),
                Err(ConfigError::HomeNotFound) => return Ok(RuntimeConfig::default()),
                Err(e) => return Err(e),
            }
        }

        match self.global_config_path.as_deref() {
            Some(path) if path.exists() => RuntimeConfig::load_from_file(path),
            _ => Ok(RuntimeConfig::default()),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Environment variables follow the pattern KILN_<KEY>,
    /// e.g. KILN_SMALL_CALL_THRESHOLD=32.
    fn apply_env_overrides(&self, mut config: RuntimeConfig) -> ConfigResult<RuntimeConfig> {
        if let Some(n) = env_usize("KILN_SMALL_CALL_THRESHOLD")? {
            config.frames.get_or_insert_with(Default::default).small_call_threshold = Some(n);
        }
        if let Some(n) = env_usize("KILN_CALL_ARGUMENTS_LIMIT")? {
            config.frames.get_or_insert_with(Default::default).call_arguments_limit = Some(n);
        }
        if let Some(n) = env_usize("KILN_MULTIPLE_VALUES_LIMIT")? {
            config.frames.get_or_insert_with(Default::default).multiple_values_limit = Some(n);
        }
        if let Some(n) = env_usize("KILN_OPERAND_STACK_SLOTS")? {
            config.stack.get_or_insert_with(Default::default).operand_stack_slots = Some(n);
        }
        if let Some(n) = env_usize("KILN_GUARD_SLOTS")? {
            config.stack.get_or_insert_with(Default::default).guard_slots = Some(n);
        }

        if let Some(paths) = env::var_os("KILN_LIBRARY_PATH") {
            let ffi = config.ffi.get_or_insert_with(Default::default);
            let mut merged: Vec<PathBuf> = env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            merged.extend(ffi.library_paths.drain(..));
            ffi.library_paths = merged;
        }

        if let Ok(value) = env::var("KILN_SIGNAL_HANDLERS") {
            let enabled = matches!(value.to_lowercase().as_str(), "true" | "1" | "yes");
            config
                .interrupts
                .get_or_insert_with(Default::default)
                .signal_handlers = Some(enabled);
        }

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if a kiln.toml was found
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }
}

fn env_usize(name: &str) -> ConfigResult<Option<usize>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                field: name.to_string(),
                reason: format!("'{}' is not a non-negative integer: {}", raw, e),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn create_config_file(dir: &Path, content: &str) -> PathBuf {
        let config_path = dir.join(PROJECT_CONFIG_FILE);
        fs::write(&config_path, content).unwrap();
        config_path
    }

    fn isolated_loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::with_global_config(dir.join("no-such-global.toml"))
    }

    #[test]
    #[serial]
    fn test_find_config_in_parent() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(temp_dir.path(), "[frames]\nsmall_call_threshold = 8\n");

        let sub_dir = temp_dir.path().join("subdir");
        fs::create_dir(&sub_dir).unwrap();

        let mut loader = isolated_loader(temp_dir.path());
        let config = loader.load_from_directory(&sub_dir).unwrap();

        assert_eq!(config.runtime.small_call_threshold(), 8);
        assert_eq!(config.project_root(), Some(temp_dir.path()));
    }

    #[test]
    #[serial]
    fn test_env_override_threshold() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(temp_dir.path(), "[frames]\nsmall_call_threshold = 8\n");

        env::set_var("KILN_SMALL_CALL_THRESHOLD", "12");
        let mut loader = isolated_loader(temp_dir.path());
        let config = loader.load_from_directory(temp_dir.path());
        env::remove_var("KILN_SMALL_CALL_THRESHOLD");

        assert_eq!(config.unwrap().runtime.small_call_threshold(), 12);
    }

    #[test]
    #[serial]
    fn test_env_override_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();

        env::set_var("KILN_GUARD_SLOTS", "lots");
        let mut loader = isolated_loader(temp_dir.path());
        let result = loader.load_from_directory(temp_dir.path());
        env::remove_var("KILN_GUARD_SLOTS");

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    #[serial]
    fn test_global_config_is_overridden_by_project() {
        let temp_dir = TempDir::new().unwrap();
        let global = temp_dir.path().join("global.toml");
        fs::write(
            &global,
            "[frames]\nsmall_call_threshold = 4\ncall_arguments_limit = 100\n",
        )
        .unwrap();

        let project = temp_dir.path().join("project");
        fs::create_dir(&project).unwrap();
        create_config_file(&project, "[frames]\nsmall_call_threshold = 16\n");

        let mut loader = ConfigLoader::with_global_config(&global);
        let config = loader.load_from_directory(&project).unwrap();

        assert_eq!(config.runtime.small_call_threshold(), 16);
        assert_eq!(config.runtime.call_arguments_limit(), 100);
    }
}
