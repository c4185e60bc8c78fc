//! Runtime Configuration (kiln.toml / ~/.kiln/config.toml)
//!
//! Both the global and the project file share this schema. Every field is
//! optional; accessors fall back to the built-in defaults.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Argument counts below this use the values buffer instead of the operand stack
pub const DEFAULT_SMALL_CALL_THRESHOLD: usize = 64;
/// Absolute upper bound on the argument count of a single call
pub const DEFAULT_CALL_ARGUMENTS_LIMIT: usize = 65536;
/// Capacity of the per-context multiple-values buffer
pub const DEFAULT_MULTIPLE_VALUES_LIMIT: usize = 64;
/// Operand stack capacity in slots, safety area included
pub const DEFAULT_OPERAND_STACK_SLOTS: usize = 131_072;
/// Slots held back past the logical end for overflow handlers
pub const DEFAULT_GUARD_SLOTS: usize = 1024;

/// Runtime configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Call frame limits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<FramesConfig>,

    /// Operand stack sizing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<StackConfig>,

    /// Foreign function interface settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffi: Option<FfiConfig>,

    /// Interrupt delivery policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupts: Option<InterruptsConfig>,
}

/// Call frame limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct FramesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small_call_threshold: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_arguments_limit: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiple_values_limit: Option<usize>,
}

/// Operand stack sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    /// Total capacity in slots
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operand_stack_slots: Option<usize>,

    /// Safety area past the logical end
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard_slots: Option<usize>,

    /// Map a no-access page after the stack region (Unix only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard_page: Option<bool>,
}

/// Foreign function interface settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct FfiConfig {
    /// Extra directories searched before the system defaults
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub library_paths: Vec<PathBuf>,

    /// Libraries loaded when the runtime starts
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preload: Vec<String>,
}

/// Interrupt delivery policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct InterruptsConfig {
    /// Route SIGINT to the designated context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_handlers: Option<bool>,

    /// Deliver same-thread interrupts at once when interrupts are enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliver_immediately: Option<bool>,
}

impl RuntimeConfig {
    /// Load a runtime configuration file and validate it
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a TOML string
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::TomlParseError {
            file: PathBuf::from("<inline>"),
            error: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field constraints on the effective values
    pub fn validate(&self) -> ConfigResult<()> {
        let threshold = self.small_call_threshold();
        let call_limit = self.call_arguments_limit();
        let values_limit = self.multiple_values_limit();
        let stack_slots = self.operand_stack_slots();
        let guard_slots = self.guard_slots();

        for (field, value) in [
            ("frames.small_call_threshold", threshold),
            ("frames.call_arguments_limit", call_limit),
            ("frames.multiple_values_limit", values_limit),
            ("stack.operand_stack_slots", stack_slots),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if threshold > values_limit {
            return Err(ConfigError::InvalidValue {
                field: "frames.small_call_threshold".to_string(),
                reason: format!(
                    "threshold {} exceeds multiple_values_limit {}",
                    threshold, values_limit
                ),
            });
        }

        if threshold > call_limit {
            return Err(ConfigError::InvalidValue {
                field: "frames.small_call_threshold".to_string(),
                reason: format!(
                    "threshold {} exceeds call_arguments_limit {}",
                    threshold, call_limit
                ),
            });
        }

        if guard_slots >= stack_slots {
            return Err(ConfigError::InvalidValue {
                field: "stack.guard_slots".to_string(),
                reason: format!(
                    "guard area {} must be smaller than the stack ({} slots)",
                    guard_slots, stack_slots
                ),
            });
        }

        let usable = stack_slots - guard_slots;
        if call_limit > usable {
            return Err(ConfigError::InvalidValue {
                field: "frames.call_arguments_limit".to_string(),
                reason: format!(
                    "limit {} exceeds the {} operand stack slots below the guard area",
                    call_limit, usable
                ),
            });
        }

        Ok(())
    }

    /// Get the global config file path (~/.kiln/config.toml)
    pub fn global_config_path() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".kiln").join("config.toml"))
    }

    pub fn small_call_threshold(&self) -> usize {
        self.frames
            .as_ref()
            .and_then(|f| f.small_call_threshold)
            .unwrap_or(DEFAULT_SMALL_CALL_THRESHOLD)
    }

    pub fn call_arguments_limit(&self) -> usize {
        self.frames
            .as_ref()
            .and_then(|f| f.call_arguments_limit)
            .unwrap_or(DEFAULT_CALL_ARGUMENTS_LIMIT)
    }

    pub fn multiple_values_limit(&self) -> usize {
        self.frames
            .as_ref()
            .and_then(|f| f.multiple_values_limit)
            .unwrap_or(DEFAULT_MULTIPLE_VALUES_LIMIT)
    }

    pub fn operand_stack_slots(&self) -> usize {
        self.stack
            .as_ref()
            .and_then(|s| s.operand_stack_slots)
            .unwrap_or(DEFAULT_OPERAND_STACK_SLOTS)
    }

    pub fn guard_slots(&self) -> usize {
        self.stack
            .as_ref()
            .and_then(|s| s.guard_slots)
            .unwrap_or(DEFAULT_GUARD_SLOTS)
    }

    /// Whether a protected page should back the end of each operand stack
    pub fn guard_page(&self) -> bool {
        self.stack
            .as_ref()
            .and_then(|s| s.guard_page)
            .unwrap_or(cfg!(unix))
    }

    pub fn library_paths(&self) -> &[PathBuf] {
        self.ffi
            .as_ref()
            .map(|f| f.library_paths.as_slice())
            .unwrap_or(&[])
    }

    pub fn preload(&self) -> &[String] {
        self.ffi.as_ref().map(|f| f.preload.as_slice()).unwrap_or(&[])
    }

    pub fn signal_handlers(&self) -> bool {
        self.interrupts
            .as_ref()
            .and_then(|i| i.signal_handlers)
            .unwrap_or(false)
    }

    pub fn deliver_immediately(&self) -> bool {
        self.interrupts
            .as_ref()
            .and_then(|i| i.deliver_immediately)
            .unwrap_or(false)
    }

    /// Merge another config into this one
    ///
    /// Fields set in `other` win; library paths accumulate with `other`'s first.
    pub fn merge(&mut self, other: &RuntimeConfig) {
        if let Some(frames) = &other.frames {
            let mine = self.frames.get_or_insert_with(Default::default);
            mine.small_call_threshold = frames.small_call_threshold.or(mine.small_call_threshold);
            mine.call_arguments_limit = frames.call_arguments_limit.or(mine.call_arguments_limit);
            mine.multiple_values_limit =
                frames.multiple_values_limit.or(mine.multiple_values_limit);
        }
        if let Some(stack) = &other.stack {
            let mine = self.stack.get_or_insert_with(Default::default);
            mine.operand_stack_slots = stack.operand_stack_slots.or(mine.operand_stack_slots);
            mine.guard_slots = stack.guard_slots.or(mine.guard_slots);
            mine.guard_page = stack.guard_page.or(mine.guard_page);
        }
        if let Some(ffi) = &other.ffi {
            let mine = self.ffi.get_or_insert_with(Default::default);
            let mut paths = ffi.library_paths.clone();
            paths.extend(mine.library_paths.drain(..));
            mine.library_paths = paths;
            for lib in &ffi.preload {
                if !mine.preload.contains(lib) {
                    mine.preload.push(lib.clone());
                }
            }
        }
        if let Some(interrupts) = &other.interrupts {
            let mine = self.interrupts.get_or_insert_with(Default::default);
            mine.signal_handlers = interrupts.signal_handlers.or(mine.signal_handlers);
            mine.deliver_immediately = interrupts.deliver_immediately.or(mine.deliver_immediately);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.small_call_threshold(), 64);
        assert_eq!(config.call_arguments_limit(), 65536);
        assert_eq!(config.multiple_values_limit(), 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = RuntimeConfig::parse(
            r#"
[frames]
small_call_threshold = 16
call_arguments_limit = 1024
multiple_values_limit = 32

[stack]
operand_stack_slots = 4096
guard_slots = 64
guard_page = false

[ffi]
library_paths = ["/opt/kiln/lib"]
preload = ["m"]

[interrupts]
signal_handlers = true
"#,
        )
        .unwrap();

        assert_eq!(config.small_call_threshold(), 16);
        assert_eq!(config.call_arguments_limit(), 1024);
        assert_eq!(config.operand_stack_slots(), 4096);
        assert_eq!(config.guard_slots(), 64);
        assert!(!config.guard_page());
        assert_eq!(config.library_paths(), &[PathBuf::from("/opt/kiln/lib")]);
        assert_eq!(config.preload(), &["m".to_string()]);
        assert!(config.signal_handlers());
        assert!(!config.deliver_immediately());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = RuntimeConfig::parse("[frames]\nbogus = 1\n");
        assert!(matches!(result, Err(ConfigError::TomlParseError { .. })));
    }

    #[test]
    fn test_threshold_above_values_limit_rejected() {
        let result = RuntimeConfig::parse(
            "[frames]\nsmall_call_threshold = 128\nmultiple_values_limit = 64\n",
        );
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_guard_larger_than_stack_rejected() {
        let result =
            RuntimeConfig::parse("[stack]\noperand_stack_slots = 100\nguard_slots = 100\n");
        assert!(matches!(result, Err(ConfigError::InvalidValue { field, .. }) if field == "stack.guard_slots"));
    }

    #[test]
    fn test_call_limit_must_fit_below_guard_area() {
        let result = RuntimeConfig::parse(
            "[frames]\ncall_arguments_limit = 1000\n\n[stack]\noperand_stack_slots = 256\nguard_slots = 64\n",
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field, .. }) if field == "frames.call_arguments_limit"
        ));

        let fits = RuntimeConfig::parse(
            "[frames]\ncall_arguments_limit = 192\n\n[stack]\noperand_stack_slots = 256\nguard_slots = 64\n",
        )
        .unwrap();
        assert_eq!(fits.call_arguments_limit(), 192);
    }

    #[test]
    fn test_zero_limit_rejected() {
        let result = RuntimeConfig::parse("[frames]\ncall_arguments_limit = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_merge_prefers_other() {
        let mut base = RuntimeConfig::parse("[frames]\nsmall_call_threshold = 8\n").unwrap();
        let other = RuntimeConfig::parse("[frames]\ncall_arguments_limit = 512\n").unwrap();
        base.merge(&other);

        assert_eq!(base.small_call_threshold(), 8);
        assert_eq!(base.call_arguments_limit(), 512);
    }

    #[test]
    fn test_merge_library_paths_accumulate() {
        let mut base = RuntimeConfig::parse("[ffi]\nlibrary_paths = [\"/a\"]\n").unwrap();
        let other = RuntimeConfig::parse("[ffi]\nlibrary_paths = [\"/b\"]\n").unwrap();
        base.merge(&other);

        assert_eq!(
            base.library_paths(),
            &[PathBuf::from("/b"), PathBuf::from("/a")]
        );
    }
}
